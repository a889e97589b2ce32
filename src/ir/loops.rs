//! Loop-nesting forest
//!
//! A hierarchy over the strongly connected components of the CFG. Every
//! reachable block is a node of the forest; a node whose component has a back
//! edge is a proper-loop header and its component (minus itself) forms its
//! subtree. Nested components recurse, so inner loops appear as subtrees of
//! their enclosing header.

use std::collections::{HashMap, HashSet};

use super::dominance::reverse_postorder;
use super::module::{BlockId, Function};

/// Loop-nesting forest of one function
#[derive(Debug, Clone)]
pub struct LoopNestingForest {
    parent: HashMap<BlockId, Option<BlockId>>,
    children: HashMap<BlockId, Vec<BlockId>>,
    proper: HashSet<BlockId>,
    roots: Vec<BlockId>,
}

impl LoopNestingForest {
    /// Compute the forest for a function
    pub fn compute(function: &Function) -> Self {
        let rpo = reverse_postorder(function, function.entry());
        let rpo_number: HashMap<BlockId, usize> =
            rpo.iter().enumerate().map(|(i, &b)| (b, i)).collect();
        let mut forest = LoopNestingForest {
            parent: HashMap::new(),
            children: HashMap::new(),
            proper: HashSet::new(),
            roots: Vec::new(),
        };
        let nodes: HashSet<BlockId> = rpo.iter().copied().collect();
        forest.build(function, &rpo_number, nodes, None);
        forest.roots.sort_unstable_by_key(|b| rpo_number[b]);
        for list in forest.children.values_mut() {
            list.sort_unstable_by_key(|b| rpo_number[b]);
        }
        forest
    }

    fn build(
        &mut self,
        function: &Function,
        rpo_number: &HashMap<BlockId, usize>,
        nodes: HashSet<BlockId>,
        parent: Option<BlockId>,
    ) {
        for scc in strongly_connected_components(function, &nodes) {
            let self_loop = scc.len() == 1 && {
                let b = scc[0];
                function.successors(b).contains(&b)
            };
            if scc.len() == 1 && !self_loop {
                self.attach(scc[0], parent);
                continue;
            }
            // The header is the component's entry: the earliest block in
            // reverse postorder
            let header = scc
                .iter()
                .copied()
                .min_by_key(|b| rpo_number[b])
                .expect("empty component");
            self.attach(header, parent);
            self.proper.insert(header);
            let inner: HashSet<BlockId> = scc.iter().copied().filter(|&b| b != header).collect();
            if !inner.is_empty() {
                self.build(function, rpo_number, inner, Some(header));
            }
        }
    }

    fn attach(&mut self, block: BlockId, parent: Option<BlockId>) {
        self.parent.insert(block, parent);
        match parent {
            Some(p) => self.children.entry(p).or_default().push(block),
            None => self.roots.push(block),
        }
    }

    /// The innermost loop header enclosing `block`, if any
    pub fn parent(&self, block: BlockId) -> Option<BlockId> {
        self.parent.get(&block).copied().flatten()
    }

    /// Forest children of a node
    pub fn children(&self, block: BlockId) -> &[BlockId] {
        self.children.get(&block).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Top-level forest nodes
    pub fn roots(&self) -> &[BlockId] {
        &self.roots
    }

    /// `true` if `block` heads a loop (its component has a back edge)
    pub fn is_proper_loop(&self, block: BlockId) -> bool {
        self.proper.contains(&block)
    }

    /// `true` if `block` belongs to the loop headed by `header` (the header
    /// counts as its own loop node)
    pub fn is_loop_node_of(&self, block: BlockId, header: BlockId) -> bool {
        let mut current = Some(block);
        while let Some(b) = current {
            if b == header {
                return true;
            }
            current = self.parent(b);
        }
        false
    }

    /// All blocks of the loop headed by `header`, including the header
    pub fn loop_blocks(&self, header: BlockId) -> Vec<BlockId> {
        let mut result = vec![header];
        let mut cursor = 0;
        while cursor < result.len() {
            let block = result[cursor];
            cursor += 1;
            result.extend_from_slice(self.children(block));
        }
        result
    }

    /// Latches: predecessors of the header that are loop nodes
    pub fn latches(&self, function: &Function, header: BlockId) -> Vec<BlockId> {
        function
            .block(header)
            .predecessors()
            .iter()
            .copied()
            .filter(|&p| self.is_loop_node_of(p, header))
            .collect()
    }

    /// Exiting blocks: loop nodes with a successor outside the loop
    pub fn exiting_blocks(&self, function: &Function, header: BlockId) -> Vec<BlockId> {
        self.loop_blocks(header)
            .into_iter()
            .filter(|&b| {
                function
                    .successors(b)
                    .iter()
                    .any(|&s| !self.is_loop_node_of(s, header))
            })
            .collect()
    }
}

/// Tarjan's algorithm over the subgraph induced by `nodes`
fn strongly_connected_components(
    function: &Function,
    nodes: &HashSet<BlockId>,
) -> Vec<Vec<BlockId>> {
    struct State<'a> {
        function: &'a Function,
        nodes: &'a HashSet<BlockId>,
        index: HashMap<BlockId, usize>,
        lowlink: HashMap<BlockId, usize>,
        on_stack: HashSet<BlockId>,
        stack: Vec<BlockId>,
        counter: usize,
        sccs: Vec<Vec<BlockId>>,
    }

    impl State<'_> {
        fn visit(&mut self, v: BlockId) {
            self.index.insert(v, self.counter);
            self.lowlink.insert(v, self.counter);
            self.counter += 1;
            self.stack.push(v);
            self.on_stack.insert(v);

            for w in self.function.successors(v) {
                if !self.nodes.contains(&w) {
                    continue;
                }
                if !self.index.contains_key(&w) {
                    self.visit(w);
                    let low = self.lowlink[&v].min(self.lowlink[&w]);
                    self.lowlink.insert(v, low);
                } else if self.on_stack.contains(&w) {
                    let low = self.lowlink[&v].min(self.index[&w]);
                    self.lowlink.insert(v, low);
                }
            }

            if self.lowlink[&v] == self.index[&v] {
                let mut scc = Vec::new();
                loop {
                    let w = self.stack.pop().unwrap();
                    self.on_stack.remove(&w);
                    scc.push(w);
                    if w == v {
                        break;
                    }
                }
                self.sccs.push(scc);
            }
        }
    }

    let mut state = State {
        function,
        nodes,
        index: HashMap::new(),
        lowlink: HashMap::new(),
        on_stack: HashSet::new(),
        stack: Vec::new(),
        counter: 0,
        sccs: Vec::new(),
    };
    let mut order: Vec<BlockId> = nodes.iter().copied().collect();
    order.sort_unstable();
    for v in order {
        if !state.index.contains_key(&v) {
            state.visit(v);
        }
    }
    state.sccs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::instruction::InstKind;
    use crate::ir::module::{Value, Visibility};
    use crate::ir::types::TypeId;
    use crate::ir::Context;

    /// entry -> header; header -> {body, exit}; body -> header
    fn while_loop() -> (Function, BlockId, BlockId, BlockId) {
        let ctx = Context::new();
        let mut f = Function::new(
            "f",
            vec![("c".to_string(), ctx.bool_ty())],
            ctx.void_ty(),
            Visibility::Internal,
        );
        let entry = f.add_block("entry");
        let header = f.add_block("header");
        let body = f.add_block("body");
        let exit = f.add_block("exit");

        let goto = f.new_inst(InstKind::Goto, TypeId::VOID, "", vec![Value::Block(header)]);
        f.append_inst(entry, goto);
        let br = f.new_inst(
            InstKind::Branch,
            TypeId::VOID,
            "",
            vec![Value::Param(0), Value::Block(body), Value::Block(exit)],
        );
        f.append_inst(header, br);
        let latch = f.new_inst(InstKind::Goto, TypeId::VOID, "", vec![Value::Block(header)]);
        f.append_inst(body, latch);
        let ret = f.new_inst(InstKind::Return, TypeId::VOID, "", vec![]);
        f.append_inst(exit, ret);

        f.add_predecessor(header, entry);
        f.add_predecessor(header, body);
        f.add_predecessor(body, header);
        f.add_predecessor(exit, header);
        (f, header, body, exit)
    }

    #[test]
    fn while_loop_forest() {
        let (f, header, body, exit) = while_loop();
        let lnf = LoopNestingForest::compute(&f);
        assert!(lnf.is_proper_loop(header));
        assert!(!lnf.is_proper_loop(body));
        assert!(lnf.is_loop_node_of(body, header));
        assert!(lnf.is_loop_node_of(header, header));
        assert!(!lnf.is_loop_node_of(exit, header));
        assert_eq!(lnf.parent(body), Some(header));
        assert_eq!(lnf.latches(&f, header), vec![body]);
        assert_eq!(lnf.exiting_blocks(&f, header), vec![header]);
    }

    #[test]
    fn loop_blocks_cover_body() {
        let (f, header, body, _) = while_loop();
        let lnf = LoopNestingForest::compute(&f);
        let blocks = lnf.loop_blocks(header);
        assert!(blocks.contains(&header));
        assert!(blocks.contains(&body));
        assert_eq!(blocks.len(), 2);
    }
}
