//! Dominator tree and dominance frontiers
//!
//! Computed by the Cooper-Harvey-Kennedy iterative scheme over reverse
//! postorder. The result is a snapshot: CFG edits invalidate it through
//! [`Function::invalidate_cfg_info`](super::Function::invalidate_cfg_info).

use std::collections::{HashMap, HashSet};

use super::module::{BlockId, Function};

/// Dominator tree, dominance frontiers and traversal orders of one function
#[derive(Debug, Clone)]
pub struct DomInfo {
    /// Immediate dominator of each reachable block; the entry maps to itself
    idom: HashMap<BlockId, BlockId>,
    /// Children in the dominator tree
    children: HashMap<BlockId, Vec<BlockId>>,
    /// Dominance frontier of each block
    frontier: HashMap<BlockId, Vec<BlockId>>,
    /// Reverse postorder of the CFG
    rpo: Vec<BlockId>,
    entry: BlockId,
}

impl DomInfo {
    /// Compute dominator information for a function
    pub fn compute(function: &Function) -> Self {
        let entry = function.entry();
        let rpo = reverse_postorder(function, entry);
        let rpo_number: HashMap<BlockId, usize> =
            rpo.iter().enumerate().map(|(i, &b)| (b, i)).collect();

        let mut idom: HashMap<BlockId, BlockId> = HashMap::new();
        idom.insert(entry, entry);
        let mut changed = true;
        while changed {
            changed = false;
            for &block in rpo.iter().skip(1) {
                let mut new_idom: Option<BlockId> = None;
                for &pred in function.block(block).predecessors() {
                    if !idom.contains_key(&pred) {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(current) => intersect(&idom, &rpo_number, pred, current),
                    });
                }
                let Some(new_idom) = new_idom else {
                    continue;
                };
                if idom.get(&block) != Some(&new_idom) {
                    idom.insert(block, new_idom);
                    changed = true;
                }
            }
        }

        let mut children: HashMap<BlockId, Vec<BlockId>> = HashMap::new();
        for (&block, &dom) in &idom {
            if block != entry {
                children.entry(dom).or_default().push(block);
            }
        }
        for list in children.values_mut() {
            list.sort_unstable_by_key(|b| rpo_number.get(b).copied().unwrap_or(usize::MAX));
        }

        let mut frontier: HashMap<BlockId, Vec<BlockId>> = HashMap::new();
        for &block in &rpo {
            let preds = function.block(block).predecessors();
            if preds.len() < 2 {
                continue;
            }
            for &pred in preds {
                if !idom.contains_key(&pred) {
                    continue;
                }
                let mut runner = pred;
                while runner != idom[&block] {
                    let df = frontier.entry(runner).or_default();
                    if !df.contains(&block) {
                        df.push(block);
                    }
                    runner = idom[&runner];
                }
            }
        }

        DomInfo {
            idom,
            children,
            frontier,
            rpo,
            entry,
        }
    }

    /// Immediate dominator; `None` for the entry and unreachable blocks
    pub fn idom(&self, block: BlockId) -> Option<BlockId> {
        let &dom = self.idom.get(&block)?;
        (dom != block).then_some(dom)
    }

    /// `true` if `dom` dominates `block` (reflexive)
    pub fn dominates(&self, dom: BlockId, block: BlockId) -> bool {
        let mut current = block;
        loop {
            if current == dom {
                return true;
            }
            match self.idom(current) {
                Some(next) => current = next,
                None => return false,
            }
        }
    }

    /// The set of blocks dominating `block`, including itself
    pub fn dom_set(&self, block: BlockId) -> HashSet<BlockId> {
        let mut set = HashSet::new();
        let mut current = block;
        loop {
            set.insert(current);
            match self.idom(current) {
                Some(next) => current = next,
                None => return set,
            }
        }
    }

    /// The dominance frontier of a block
    pub fn frontier(&self, block: BlockId) -> &[BlockId] {
        self.frontier.get(&block).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The iterated dominance frontier of a set of blocks (phi placement)
    pub fn iterated_frontier(&self, blocks: &[BlockId]) -> HashSet<BlockId> {
        let mut result = HashSet::new();
        let mut worklist: Vec<BlockId> = blocks.to_vec();
        while let Some(block) = worklist.pop() {
            for &df in self.frontier(block) {
                if result.insert(df) {
                    worklist.push(df);
                }
            }
        }
        result
    }

    /// Dominator-tree children of a block
    pub fn children(&self, block: BlockId) -> &[BlockId] {
        self.children.get(&block).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Preorder traversal of the dominator tree
    pub fn preorder(&self) -> Vec<BlockId> {
        let mut result = Vec::new();
        let mut stack = vec![self.entry];
        while let Some(block) = stack.pop() {
            result.push(block);
            for &child in self.children(block).iter().rev() {
                stack.push(child);
            }
        }
        result
    }

    /// Postorder traversal of the dominator tree
    pub fn postorder(&self) -> Vec<BlockId> {
        let mut result = self.preorder();
        // A preorder over a tree reversed is a postorder of the mirrored
        // tree, which is a valid postorder for dominance purposes
        result.reverse();
        result
    }

    /// Reverse postorder of the CFG used during computation
    pub fn reverse_postorder(&self) -> &[BlockId] {
        &self.rpo
    }

    /// `true` if the block is reachable from the entry
    pub fn is_reachable(&self, block: BlockId) -> bool {
        self.idom.contains_key(&block)
    }
}

fn intersect(
    idom: &HashMap<BlockId, BlockId>,
    rpo_number: &HashMap<BlockId, usize>,
    mut a: BlockId,
    mut b: BlockId,
) -> BlockId {
    while a != b {
        while rpo_number[&a] > rpo_number[&b] {
            a = idom[&a];
        }
        while rpo_number[&b] > rpo_number[&a] {
            b = idom[&b];
        }
    }
    a
}

/// Reverse postorder over successor edges starting at `entry`
pub fn reverse_postorder(function: &Function, entry: BlockId) -> Vec<BlockId> {
    let mut postorder = Vec::new();
    let mut visited = HashSet::new();
    // Iterative DFS with enter/exit tokens
    let mut work: Vec<(BlockId, bool)> = vec![(entry, false)];
    while let Some((block, exiting)) = work.pop() {
        if exiting {
            postorder.push(block);
            continue;
        }
        if !visited.insert(block) {
            continue;
        }
        work.push((block, true));
        for succ in function.successors(block).into_iter().rev() {
            if !visited.contains(&succ) {
                work.push((succ, false));
            }
        }
    }
    postorder.reverse();
    postorder
}
