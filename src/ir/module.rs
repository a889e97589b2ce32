//! SSA module, function and basic-block data model
//!
//! The IR is a def-use graph with back edges (users, predecessor lists, phi
//! edges), so values are arena-allocated and referred to by handles instead
//! of owning pointers. All operand mutation funnels through
//! [`Function::set_operand`] and friends, which keep the use lists exact;
//! transformations cannot skip the bookkeeping.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use super::context::{ConstId, Context};
use super::dominance::DomInfo;
use super::instruction::InstKind;
use super::loops::LoopNestingForest;
use super::types::TypeId;

/// Handle to an instruction within its function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstId(pub(crate) u32);

/// Handle to a basic block within its function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub(crate) u32);

/// Handle to a function within its module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub(crate) u32);

/// Handle to a global variable within its module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalId(pub(crate) u32);

/// Any SSA value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Value {
    /// Interned constant
    Const(ConstId),
    /// Function parameter by index
    Param(u32),
    /// Instruction result
    Inst(InstId),
    /// Basic block, addressable as a branch target
    Block(BlockId),
    /// Function, addressable as a call target
    Function(FuncId),
    /// Global variable (its address)
    Global(GlobalId),
}

/// Function visibility
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Only reachable from within the module
    Internal,
    /// Part of the module's interface
    External,
}

/// A function parameter
#[derive(Debug, Clone)]
pub struct Parameter {
    /// Parameter name, unique within the function
    pub name: String,
    /// Parameter type
    pub ty: TypeId,
}

/// A statically allocated global variable
#[derive(Debug, Clone)]
pub struct GlobalVariable {
    /// Name, unique within the module
    pub name: String,
    /// Type of the stored value
    pub value_type: TypeId,
    /// Initializer
    pub init: ConstId,
}

/// Declaration of a foreign function callable through the FFI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignFunctionDecl {
    /// Symbol name
    pub name: String,
    /// Parameter types
    pub params: Vec<TypeId>,
    /// Return type
    pub return_type: TypeId,
}

/// Instruction storage
#[derive(Debug, Clone)]
pub struct InstData {
    /// Opcode and non-operand payload
    pub kind: InstKind,
    /// Result type; void for instructions without a result
    pub ty: TypeId,
    /// Result name; empty for unnamed (void) instructions
    pub name: String,
    operands: Vec<Value>,
    parent: Option<BlockId>,
    alive: bool,
}

impl InstData {
    /// The operand list
    pub fn operands(&self) -> &[Value] {
        &self.operands
    }

    /// The owning block, if attached
    pub fn parent(&self) -> Option<BlockId> {
        self.parent
    }
}

/// Basic-block storage
#[derive(Debug, Clone)]
pub struct BlockData {
    /// Block name, unique within the function
    pub name: String,
    insts: Vec<InstId>,
    preds: Vec<BlockId>,
    alive: bool,
}

impl BlockData {
    /// Instructions in execution order
    pub fn insts(&self) -> &[InstId] {
        &self.insts
    }

    /// Predecessor blocks
    pub fn predecessors(&self) -> &[BlockId] {
        &self.preds
    }
}

/// Produces names unique within one function
#[derive(Debug, Default, Clone)]
struct NameFactory {
    used: HashSet<String>,
}

impl NameFactory {
    /// Returns `desired` or a suffixed variant that is not in use
    fn make_unique(&mut self, desired: &str) -> String {
        if desired.is_empty() {
            return String::new();
        }
        if self.used.insert(desired.to_string()) {
            return desired.to_string();
        }
        for n in 1u32.. {
            let candidate = format!("{desired}.{n}");
            if self.used.insert(candidate.clone()) {
                return candidate;
            }
        }
        unreachable!()
    }

    fn release(&mut self, name: &str) {
        self.used.remove(name);
    }
}

/// An IR function: an ordered list of basic blocks whose first entry is the
/// entry block, plus parameters, a return type and cached CFG analyses
pub struct Function {
    /// Name, unique within the module
    pub name: String,
    /// Visibility flag
    pub visibility: Visibility,
    /// Parameters
    pub params: Vec<Parameter>,
    /// Return type
    pub return_type: TypeId,

    insts: Vec<InstData>,
    blocks: Vec<BlockData>,
    block_order: Vec<BlockId>,
    uses: HashMap<Value, Vec<InstId>>,
    names: NameFactory,

    dom_cache: Option<Rc<DomInfo>>,
    lnf_cache: Option<Rc<LoopNestingForest>>,
}

impl Function {
    /// Create an empty function (no blocks yet)
    pub fn new(
        name: &str,
        params: Vec<(String, TypeId)>,
        return_type: TypeId,
        visibility: Visibility,
    ) -> Self {
        let mut names = NameFactory::default();
        let params = params
            .into_iter()
            .map(|(name, ty)| Parameter {
                name: names.make_unique(&name),
                ty,
            })
            .collect();
        Function {
            name: name.to_string(),
            visibility,
            params,
            return_type,
            insts: Vec::new(),
            blocks: Vec::new(),
            block_order: Vec::new(),
            uses: HashMap::new(),
            names,
            dom_cache: None,
            lnf_cache: None,
        }
    }

    // -------------------------------------------------------------------
    // Blocks
    // -------------------------------------------------------------------

    /// Append a new empty block
    pub fn add_block(&mut self, name: &str) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        let name = self.names.make_unique(name);
        self.blocks.push(BlockData {
            name,
            insts: Vec::new(),
            preds: Vec::new(),
            alive: true,
        });
        self.block_order.push(id);
        self.invalidate_cfg_info();
        id
    }

    /// Insert a new empty block before `before` in layout order
    pub fn insert_block_before(&mut self, before: BlockId, name: &str) -> BlockId {
        let id = self.add_block(name);
        self.block_order.pop();
        let pos = self
            .block_order
            .iter()
            .position(|&b| b == before)
            .unwrap_or(self.block_order.len());
        self.block_order.insert(pos, id);
        id
    }

    /// Insert a new empty block directly after `after` in layout order
    pub fn insert_block_after(&mut self, after: BlockId, name: &str) -> BlockId {
        let id = self.add_block(name);
        self.block_order.pop();
        let pos = self
            .block_order
            .iter()
            .position(|&b| b == after)
            .map(|p| p + 1)
            .unwrap_or(self.block_order.len());
        self.block_order.insert(pos, id);
        id
    }

    /// Rename a block, releasing its old name
    pub fn rename_block(&mut self, id: BlockId, desired: &str) {
        let old = std::mem::take(&mut self.blocks[id.0 as usize].name);
        self.names.release(&old);
        self.blocks[id.0 as usize].name = self.names.make_unique(desired);
    }

    /// Move a block directly before `before` in layout order
    pub fn move_block_before(&mut self, block: BlockId, before: BlockId) {
        self.block_order.retain(|&b| b != block);
        let pos = self
            .block_order
            .iter()
            .position(|&b| b == before)
            .unwrap_or(self.block_order.len());
        self.block_order.insert(pos, block);
    }

    /// The entry block
    pub fn entry(&self) -> BlockId {
        self.block_order[0]
    }

    /// Blocks in layout order
    pub fn block_ids(&self) -> Vec<BlockId> {
        self.block_order.clone()
    }

    /// Block storage
    pub fn block(&self, id: BlockId) -> &BlockData {
        &self.blocks[id.0 as usize]
    }

    /// `true` if the block has not been erased
    pub fn block_alive(&self, id: BlockId) -> bool {
        self.blocks[id.0 as usize].alive
    }

    /// Remove a block from the function. The caller must have unlinked it
    /// from the CFG; all its instructions are erased.
    pub fn erase_block(&mut self, id: BlockId) {
        for inst in self.blocks[id.0 as usize].insts.clone() {
            self.erase_inst(inst);
        }
        let name = std::mem::take(&mut self.blocks[id.0 as usize].name);
        self.names.release(&name);
        self.blocks[id.0 as usize].alive = false;
        self.block_order.retain(|&b| b != id);
        self.invalidate_cfg_info();
    }

    /// Successor blocks, read from the terminator
    pub fn successors(&self, id: BlockId) -> Vec<BlockId> {
        let Some(term) = self.terminator(id) else {
            return Vec::new();
        };
        self.inst(term)
            .operands
            .iter()
            .filter_map(|v| match v {
                Value::Block(b) => Some(*b),
                _ => None,
            })
            .collect()
    }

    /// The block's terminator, if it ends with one
    pub fn terminator(&self, id: BlockId) -> Option<InstId> {
        let last = *self.blocks[id.0 as usize].insts.last()?;
        self.inst(last).kind.is_terminator().then_some(last)
    }

    /// The phi instructions at the top of a block
    pub fn phis(&self, id: BlockId) -> Vec<InstId> {
        self.blocks[id.0 as usize]
            .insts
            .iter()
            .copied()
            .take_while(|&i| matches!(self.inst(i).kind, InstKind::Phi { .. }))
            .collect()
    }

    // -------------------------------------------------------------------
    // Instructions
    // -------------------------------------------------------------------

    /// Create a detached instruction, registering its operand uses
    pub fn new_inst(
        &mut self,
        kind: InstKind,
        ty: TypeId,
        name: &str,
        operands: Vec<Value>,
    ) -> InstId {
        let id = InstId(self.insts.len() as u32);
        let name = self.names.make_unique(name);
        for &op in &operands {
            self.add_use(op, id);
        }
        self.insts.push(InstData {
            kind,
            ty,
            name,
            operands,
            parent: None,
            alive: true,
        });
        id
    }

    /// Instruction storage
    pub fn inst(&self, id: InstId) -> &InstData {
        &self.insts[id.0 as usize]
    }

    /// Mutable access to the non-operand payload
    pub fn inst_kind_mut(&mut self, id: InstId) -> &mut InstKind {
        &mut self.insts[id.0 as usize].kind
    }

    /// `true` if the instruction has not been erased
    pub fn inst_alive(&self, id: InstId) -> bool {
        self.insts[id.0 as usize].alive
    }

    /// Append an instruction to a block
    pub fn append_inst(&mut self, block: BlockId, inst: InstId) {
        debug_assert!(self.insts[inst.0 as usize].parent.is_none());
        self.insts[inst.0 as usize].parent = Some(block);
        self.blocks[block.0 as usize].insts.push(inst);
    }

    /// Insert an instruction before another within the same block
    pub fn insert_inst_before(&mut self, block: BlockId, before: InstId, inst: InstId) {
        debug_assert!(self.insts[inst.0 as usize].parent.is_none());
        self.insts[inst.0 as usize].parent = Some(block);
        let list = &mut self.blocks[block.0 as usize].insts;
        let pos = list.iter().position(|&i| i == before).expect("before not in block");
        list.insert(pos, inst);
    }

    /// Insert a phi after the existing phis at the top of a block
    pub fn insert_phi(&mut self, block: BlockId, inst: InstId) {
        debug_assert!(self.insts[inst.0 as usize].parent.is_none());
        self.insts[inst.0 as usize].parent = Some(block);
        let phi_count = self.phis(block).len();
        self.blocks[block.0 as usize].insts.insert(phi_count, inst);
    }

    /// Remove an instruction from its block without erasing it; operands
    /// and name stay intact so it can be re-attached elsewhere
    pub fn detach_inst(&mut self, id: InstId) {
        if let Some(parent) = self.insts[id.0 as usize].parent.take() {
            self.blocks[parent.0 as usize].insts.retain(|&i| i != id);
        }
    }

    /// Detach and erase an instruction: operand uses are cleared and its
    /// name is returned to the name factory. The instruction must be unused.
    pub fn erase_inst(&mut self, id: InstId) {
        self.clear_operands(id);
        if let Some(parent) = self.insts[id.0 as usize].parent.take() {
            self.blocks[parent.0 as usize].insts.retain(|&i| i != id);
        }
        let name = std::mem::take(&mut self.insts[id.0 as usize].name);
        self.names.release(&name);
        self.insts[id.0 as usize].alive = false;
    }

    /// Replace operand `index` of an instruction, updating use lists
    pub fn set_operand(&mut self, id: InstId, index: usize, value: Value) {
        let old = self.insts[id.0 as usize].operands[index];
        if old == value {
            return;
        }
        self.remove_use(old, id);
        self.add_use(value, id);
        self.insts[id.0 as usize].operands[index] = value;
    }

    /// Rewrite every operand slot of `id` holding `old` to `new`
    pub fn update_operand(&mut self, id: InstId, old: Value, new: Value) {
        let slots: Vec<usize> = self.insts[id.0 as usize]
            .operands
            .iter()
            .enumerate()
            .filter(|(_, &v)| v == old)
            .map(|(i, _)| i)
            .collect();
        for slot in slots {
            self.set_operand(id, slot, new);
        }
    }

    /// Drop all operands of an instruction, updating every pointed-to value
    pub fn clear_operands(&mut self, id: InstId) {
        let operands = std::mem::take(&mut self.insts[id.0 as usize].operands);
        for op in operands {
            self.remove_use(op, id);
        }
        if let InstKind::Phi { preds } = &mut self.insts[id.0 as usize].kind {
            preds.clear();
        }
    }

    /// Append an operand (used while growing phi or call argument lists)
    pub fn push_operand(&mut self, id: InstId, value: Value) {
        self.add_use(value, id);
        self.insts[id.0 as usize].operands.push(value);
    }

    /// Remove operand `index`, updating use lists
    pub fn remove_operand(&mut self, id: InstId, index: usize) {
        let old = self.insts[id.0 as usize].operands.remove(index);
        self.remove_use(old, id);
    }

    // -------------------------------------------------------------------
    // Def-use
    // -------------------------------------------------------------------

    fn add_use(&mut self, value: Value, user: InstId) {
        if matches!(value, Value::Block(_)) {
            // Control-flow edges are tracked through predecessor lists
            return;
        }
        self.uses.entry(value).or_default().push(user);
    }

    fn remove_use(&mut self, value: Value, user: InstId) {
        if matches!(value, Value::Block(_)) {
            return;
        }
        if let Some(list) = self.uses.get_mut(&value) {
            if let Some(pos) = list.iter().position(|&u| u == user) {
                list.swap_remove(pos);
            }
        }
    }

    /// The instructions using a value (deduplicated)
    pub fn users(&self, value: Value) -> Vec<InstId> {
        let mut result: Vec<InstId> = self
            .uses
            .get(&value)
            .map(|l| l.iter().copied().filter(|&u| self.inst_alive(u)).collect())
            .unwrap_or_default();
        result.sort_unstable();
        result.dedup();
        result
    }

    /// `true` if any live instruction uses the value
    pub fn is_used(&self, value: Value) -> bool {
        !self.users(value).is_empty()
    }

    /// Replace every use of `old` with `new`. Phi predecessor mappings are
    /// preserved because only operand slots are rewritten. After this call
    /// `old` has no users.
    pub fn replace_value(&mut self, old: Value, new: Value) {
        debug_assert_ne!(old, new);
        for user in self.users(old) {
            self.update_operand(user, old, new);
        }
    }

    // -------------------------------------------------------------------
    // CFG edits
    // -------------------------------------------------------------------

    /// Register `pred` as a predecessor of `block`. Phi argument lists are
    /// extended separately by the caller.
    pub fn add_predecessor(&mut self, block: BlockId, pred: BlockId) {
        debug_assert!(!self.blocks[block.0 as usize].preds.contains(&pred));
        self.blocks[block.0 as usize].preds.push(pred);
        self.invalidate_cfg_info();
    }

    /// Rewrite the predecessor list of `block` and every phi edge that
    /// referenced `old` to refer to `new`
    pub fn update_predecessor(&mut self, block: BlockId, old: BlockId, new: BlockId) {
        for p in &mut self.blocks[block.0 as usize].preds {
            if *p == old {
                *p = new;
            }
        }
        for phi in self.phis(block) {
            if let InstKind::Phi { preds } = &mut self.insts[phi.0 as usize].kind {
                for p in preds {
                    if *p == old {
                        *p = new;
                    }
                }
            }
        }
        self.invalidate_cfg_info();
    }

    /// Remove `pred` from the predecessor list of `block`, shrinking each
    /// phi's argument list accordingly
    pub fn remove_predecessor(&mut self, block: BlockId, pred: BlockId) {
        let preds = &mut self.blocks[block.0 as usize].preds;
        let Some(pos) = preds.iter().position(|&p| p == pred) else {
            return;
        };
        preds.remove(pos);
        for phi in self.phis(block) {
            let index = match &mut self.insts[phi.0 as usize].kind {
                InstKind::Phi { preds } => {
                    let i = preds.iter().position(|&p| p == pred);
                    if let Some(i) = i {
                        preds.remove(i);
                    }
                    i
                }
                _ => unreachable!(),
            };
            if let Some(index) = index {
                self.remove_operand(phi, index);
            }
        }
        self.invalidate_cfg_info();
    }

    /// Rewrite the terminator of `block` so edges to `old` go to `new`
    pub fn update_target(&mut self, block: BlockId, old: BlockId, new: BlockId) {
        let term = self.terminator(block).expect("block has no terminator");
        self.update_operand(term, Value::Block(old), Value::Block(new));
        self.invalidate_cfg_info();
    }

    /// The value flowing into `phi` from predecessor `pred`
    pub fn phi_incoming(&self, phi: InstId, pred: BlockId) -> Option<Value> {
        match &self.inst(phi).kind {
            InstKind::Phi { preds } => {
                let index = preds.iter().position(|&p| p == pred)?;
                Some(self.inst(phi).operands[index])
            }
            _ => None,
        }
    }

    /// Extend `phi` with an incoming edge
    pub fn phi_add_argument(&mut self, phi: InstId, pred: BlockId, value: Value) {
        self.push_operand(phi, value);
        match &mut self.insts[phi.0 as usize].kind {
            InstKind::Phi { preds } => preds.push(pred),
            _ => unreachable!(),
        }
    }

    /// Insert a fresh block on the edge `from -> to`. The new block holds a
    /// single goto to `to`; phis in `to` are rewired to the new block.
    pub fn split_edge(&mut self, name: &str, from: BlockId, to: BlockId) -> BlockId {
        let mid = self.insert_block_before(to, name);
        let goto = self.new_inst(InstKind::Goto, TypeId::VOID, "", vec![Value::Block(to)]);
        self.append_inst(mid, goto);
        self.update_target(from, to, mid);
        self.update_predecessor(to, from, mid);
        self.blocks[mid.0 as usize].preds.push(from);
        self.invalidate_cfg_info();
        mid
    }

    /// Split every critical edge (source with multiple successors into a
    /// target with multiple predecessors). Returns `true` if any was split.
    pub fn split_critical_edges(&mut self) -> bool {
        let mut any = false;
        for block in self.block_ids() {
            let succs = self.successors(block);
            if succs.len() < 2 {
                continue;
            }
            for succ in succs {
                if self.block(succ).predecessors().len() > 1 {
                    self.split_edge("critedge", block, succ);
                    any = true;
                }
            }
        }
        any
    }

    // -------------------------------------------------------------------
    // Analyses
    // -------------------------------------------------------------------

    /// Drop cached CFG analyses; called by every CFG-modifying API
    pub fn invalidate_cfg_info(&mut self) {
        self.dom_cache = None;
        self.lnf_cache = None;
    }

    /// Dominator information, computed lazily
    pub fn get_or_compute_dom_info(&mut self) -> Rc<DomInfo> {
        if self.dom_cache.is_none() {
            self.dom_cache = Some(Rc::new(DomInfo::compute(self)));
        }
        Rc::clone(self.dom_cache.as_ref().unwrap())
    }

    /// Loop-nesting forest, computed lazily
    pub fn get_or_compute_lnf(&mut self) -> Rc<LoopNestingForest> {
        if self.lnf_cache.is_none() {
            self.lnf_cache = Some(Rc::new(LoopNestingForest::compute(self)));
        }
        Rc::clone(self.lnf_cache.as_ref().unwrap())
    }

    /// The type of a value in the context of this function
    pub fn value_type(&self, ctx: &Context, value: Value) -> TypeId {
        match value {
            Value::Const(c) => ctx.const_type(c),
            Value::Param(i) => self.params[i as usize].ty,
            Value::Inst(i) => self.inst(i).ty,
            Value::Block(_) => ctx.void_ty(),
            Value::Function(_) | Value::Global(_) => ctx.ptr_ty(),
        }
    }

    /// Display name of a value for diagnostics and the textual writer
    pub fn value_name(&self, value: Value) -> String {
        match value {
            Value::Const(c) => format!("const.{}", c.0),
            Value::Param(i) => format!("%{}", self.params[i as usize].name),
            Value::Inst(i) => format!("%{}", self.inst(i).name),
            Value::Block(b) => format!("%{}", self.block(b).name),
            Value::Function(f) => format!("@fn.{}", f.0),
            Value::Global(g) => format!("@gv.{}", g.0),
        }
    }
}

/// A module: globally unique functions, global variables and foreign
/// declarations. The interning [`Context`] travels alongside the module and
/// shares its lifetime.
#[derive(Default)]
pub struct Module {
    functions: Vec<Function>,
    /// Global variables
    pub globals: Vec<GlobalVariable>,
    /// Foreign function declarations referenced by `ForeignCall`
    pub foreign_decls: Vec<ForeignFunctionDecl>,
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("functions", &self.functions.iter().map(|func| &func.name).collect::<Vec<_>>())
            .field("globals", &self.globals.len())
            .field("foreign_decls", &self.foreign_decls.len())
            .finish()
    }
}

impl Module {
    /// Create an empty module
    pub fn new() -> Self {
        Module::default()
    }

    /// Add a function; its name must be unique within the module
    pub fn add_function(&mut self, function: Function) -> FuncId {
        debug_assert!(
            self.functions.iter().all(|f| f.name != function.name),
            "duplicate function name {}",
            function.name
        );
        let id = FuncId(self.functions.len() as u32);
        self.functions.push(function);
        id
    }

    /// Function by handle
    pub fn function(&self, id: FuncId) -> &Function {
        &self.functions[id.0 as usize]
    }

    /// Mutable function by handle
    pub fn function_mut(&mut self, id: FuncId) -> &mut Function {
        &mut self.functions[id.0 as usize]
    }

    /// Look a function up by name
    pub fn function_by_name(&self, name: &str) -> Option<FuncId> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(|i| FuncId(i as u32))
    }

    /// All function handles
    pub fn function_ids(&self) -> Vec<FuncId> {
        (0..self.functions.len() as u32).map(FuncId).collect()
    }

    /// Register a global variable
    pub fn add_global(&mut self, global: GlobalVariable) -> GlobalId {
        let id = GlobalId(self.globals.len() as u32);
        self.globals.push(global);
        id
    }

    /// Register a foreign function declaration, deduplicating by identity
    pub fn add_foreign_decl(&mut self, decl: ForeignFunctionDecl) -> u32 {
        if let Some(pos) = self.foreign_decls.iter().position(|d| *d == decl) {
            return pos as u32;
        }
        self.foreign_decls.push(decl);
        (self.foreign_decls.len() - 1) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::instruction::{ArithmeticOp, InstKind};

    fn test_function(ctx: &Context) -> Function {
        Function::new(
            "f",
            vec![("a".to_string(), ctx.int_ty(64)), ("b".to_string(), ctx.int_ty(64))],
            ctx.int_ty(64),
            Visibility::External,
        )
    }

    #[test]
    fn name_factory_suffixes_collisions() {
        let ctx = Context::new();
        let mut f = test_function(&ctx);
        let b = f.add_block("entry");
        let i1 = f.new_inst(
            InstKind::Arithmetic(ArithmeticOp::Add),
            ctx.int_ty(64),
            "sum",
            vec![Value::Param(0), Value::Param(1)],
        );
        let i2 = f.new_inst(
            InstKind::Arithmetic(ArithmeticOp::Add),
            ctx.int_ty(64),
            "sum",
            vec![Value::Param(0), Value::Param(1)],
        );
        f.append_inst(b, i1);
        f.append_inst(b, i2);
        assert_eq!(f.inst(i1).name, "sum");
        assert_eq!(f.inst(i2).name, "sum.1");
    }

    #[test]
    fn erase_releases_name() {
        let ctx = Context::new();
        let mut f = test_function(&ctx);
        let b = f.add_block("entry");
        let i1 = f.new_inst(
            InstKind::Arithmetic(ArithmeticOp::Add),
            ctx.int_ty(64),
            "x",
            vec![Value::Param(0), Value::Param(1)],
        );
        f.append_inst(b, i1);
        f.erase_inst(i1);
        let i2 = f.new_inst(
            InstKind::Arithmetic(ArithmeticOp::Sub),
            ctx.int_ty(64),
            "x",
            vec![Value::Param(0), Value::Param(1)],
        );
        assert_eq!(f.inst(i2).name, "x");
    }

    #[test]
    fn replace_value_rewrites_all_users() {
        let ctx = Context::new();
        let mut f = test_function(&ctx);
        let b = f.add_block("entry");
        let x = f.new_inst(
            InstKind::Arithmetic(ArithmeticOp::Add),
            ctx.int_ty(64),
            "x",
            vec![Value::Param(0), Value::Param(1)],
        );
        let y = f.new_inst(
            InstKind::Arithmetic(ArithmeticOp::Mul),
            ctx.int_ty(64),
            "y",
            vec![Value::Inst(x), Value::Inst(x)],
        );
        f.append_inst(b, x);
        f.append_inst(b, y);
        assert_eq!(f.users(Value::Inst(x)), vec![y]);

        f.replace_value(Value::Inst(x), Value::Param(0));
        assert!(f.users(Value::Inst(x)).is_empty());
        assert_eq!(
            f.inst(y).operands(),
            &[Value::Param(0), Value::Param(0)]
        );
    }

    #[test]
    fn split_edge_rewires_phis() {
        let ctx = Context::new();
        let mut f = test_function(&ctx);
        let entry = f.add_block("entry");
        let a = f.add_block("a");
        let join = f.add_block("join");

        // entry -> {a, join}, a -> join
        let br = f.new_inst(
            InstKind::Branch,
            ctx.void_ty(),
            "",
            vec![Value::Param(0), Value::Block(a), Value::Block(join)],
        );
        f.append_inst(entry, br);
        let goto = f.new_inst(InstKind::Goto, ctx.void_ty(), "", vec![Value::Block(join)]);
        f.append_inst(a, goto);
        f.add_predecessor(a, entry);
        f.add_predecessor(join, entry);
        f.add_predecessor(join, a);

        let phi = f.new_inst(
            InstKind::Phi {
                preds: vec![entry, a],
            },
            ctx.int_ty(64),
            "p",
            vec![Value::Param(0), Value::Param(1)],
        );
        f.insert_phi(join, phi);

        // entry -> join is critical
        let mid = f.split_edge("critedge", entry, join);
        assert_eq!(f.successors(entry), vec![a, mid]);
        assert_eq!(f.successors(mid), vec![join]);
        assert!(f.block(join).predecessors().contains(&mid));
        assert!(!f.block(join).predecessors().contains(&entry));
        assert_eq!(f.phi_incoming(phi, mid), Some(Value::Param(0)));
    }

    #[test]
    fn remove_predecessor_shrinks_phis() {
        let ctx = Context::new();
        let mut f = test_function(&ctx);
        let a = f.add_block("a");
        let b = f.add_block("b");
        let join = f.add_block("join");
        f.add_predecessor(join, a);
        f.add_predecessor(join, b);
        let phi = f.new_inst(
            InstKind::Phi { preds: vec![a, b] },
            ctx.int_ty(64),
            "p",
            vec![Value::Param(0), Value::Param(1)],
        );
        f.insert_phi(join, phi);

        f.remove_predecessor(join, a);
        assert_eq!(f.block(join).predecessors(), &[b]);
        assert_eq!(f.inst(phi).operands(), &[Value::Param(1)]);
    }
}
