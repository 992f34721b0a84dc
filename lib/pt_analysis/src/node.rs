//! Abstract memory locations.
//!
//! Every quantity the analyses range over is a location node: program values,
//! global storage, allocation sites, field projections, and the single
//! Unknown location. Nodes live in an arena and are addressed by stable
//! [`NodeId`] handles; two handles are equal iff they denote the same
//! abstract location, which the intern tables of [`NodeFactory`] enforce.
//! Structural comparison of nodes is never used for identity.

use crate::callstring::CallString;
use pt_ir::instrs::{Callee, FieldIndex, Instruction, Operand};
use pt_ir::types::Type;
use pt_ir::{GlobalId, InstrId, Module, ProcId};
use std::collections::BTreeMap;

/// Field trees are cut off at this depth. A projection that would exceed it
/// is still created, but degrades: it stops being field-sensitive and, if
/// pointer-typed, its pointees become summary nodes. Without the bound,
/// nested aggregates could demand arbitrarily deep node creation.
pub const MAX_FIELD_DEPTH: usize = 8;

/// Stable handle of a location node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u32);

impl NodeId {
    pub(crate) const MIN: Self = Self(0);
    pub(crate) const MAX: Self = Self(u32::MAX);

    const fn index(self) -> usize {
        self.0 as usize
    }
}

/// What a node stands for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// The single node standing for "any location".
    Unknown,
    /// A program value: an instruction result, an argument, a global's
    /// address, a constant.
    Value,
    /// The storage of a module global.
    Global(GlobalId),
    /// An allocation site. Stands for every instance the site ever creates;
    /// under a context that reaches `definer` more than once it is a
    /// summary node.
    Alloc { definer: ProcId },
    /// A field projection of its parent, identified by its exact constant
    /// index sequence.
    Field { parent: NodeId, indices: Vec<u64>, level: usize },
}

#[derive(Debug, Clone)]
struct NodeData {
    kind: NodeKind,
    name: String,
    pointer_type: bool,
    multiple_stack_frames: bool,
    summary_node: bool,
    summary_node_pointees: bool,
    field_sensitive: bool,
    single_pointee: Option<NodeId>,
    children: Vec<NodeId>,
}

/// Arena of location nodes.
#[derive(Debug, Default)]
pub struct NodeArena {
    nodes: Vec<NodeData>,
}

impl NodeArena {
    fn alloc(&mut self, data: NodeData) -> NodeId {
        let id = NodeId(u32::try_from(self.nodes.len()).expect("node universe overflow"));
        self.nodes.push(data);
        id
    }

    #[must_use]
    pub fn kind(&self, n: NodeId) -> &NodeKind {
        &self.nodes[n.index()].kind
    }

    #[must_use]
    pub fn name(&self, n: NodeId) -> &str {
        &self.nodes[n.index()].name
    }

    #[must_use]
    pub fn has_pointer_type(&self, n: NodeId) -> bool {
        self.nodes[n.index()].pointer_type
    }

    /// Whether the location outlives a single stack frame (arguments and
    /// instruction results, globals, allocation sites, field nodes).
    #[must_use]
    pub fn multiple_stack_frames(&self, n: NodeId) -> bool {
        self.nodes[n.index()].multiple_stack_frames
    }

    /// Context-independent summary classification. Monotonic: once a node is
    /// a summary it never becomes concrete again. Unknown is never a summary.
    #[must_use]
    pub fn is_always_summary(&self, n: NodeId) -> bool {
        let data = &self.nodes[n.index()];
        !matches!(data.kind, NodeKind::Unknown) && data.summary_node
    }

    /// Summary classification under a calling context: an allocation site
    /// whose defining procedure is reached more than once stands for several
    /// concrete instances at once.
    #[must_use]
    pub fn is_summary_in(&self, n: NodeId, cs: &CallString) -> bool {
        if self.is_always_summary(n) {
            return true;
        }
        match self.nodes[n.index()].kind {
            NodeKind::Alloc { definer } => cs.reaches_more_than_once(definer),
            _ => false,
        }
    }

    #[must_use]
    pub fn pointees_are_summary(&self, n: NodeId) -> bool {
        self.nodes[n.index()].summary_node_pointees
    }

    #[must_use]
    pub fn is_field_sensitive(&self, n: NodeId) -> bool {
        self.nodes[n.index()].field_sensitive
    }

    #[must_use]
    pub fn single_pointee_opt(&self, n: NodeId) -> Option<NodeId> {
        self.nodes[n.index()].single_pointee
    }

    /// The statically known unique pointee of the node.
    ///
    /// # Panics
    ///
    /// Panics if the node does not always have a single pointee; callers must
    /// check [`Self::single_pointee_opt`] first unless the invariant is
    /// guaranteed.
    #[must_use]
    pub fn single_pointee(&self, n: NodeId) -> NodeId {
        self.nodes[n.index()]
            .single_pointee
            .expect("this node does not always have a single pointee")
    }

    #[must_use]
    pub fn children(&self, n: NodeId) -> &[NodeId] {
        &self.nodes[n.index()].children
    }

    pub fn mark_as_summary(&mut self, n: NodeId) {
        debug_assert!(self.nodes[n.index()].single_pointee.is_none());
        self.nodes[n.index()].summary_node = true;
    }

    /// Marks everything the node may refer to as summary. Cascades into the
    /// single pointee when there is one.
    pub fn mark_pointees_summary(&mut self, n: NodeId) {
        self.nodes[n.index()].summary_node_pointees = true;
        if let Some(sp) = self.nodes[n.index()].single_pointee {
            self.mark_as_summary(sp);
        }
    }

    pub fn mark_not_field_sensitive(&mut self, n: NodeId) {
        self.nodes[n.index()].field_sensitive = false;
    }

    /// Whether `a` is `b` itself or a projection somewhere below it.
    #[must_use]
    pub fn is_sub_node_of(&self, a: NodeId, b: NodeId) -> bool {
        if a == b {
            return true;
        }
        self.nodes[b.index()].children.iter().any(|&c| self.is_sub_node_of(a, c))
    }

    /// Canonical address of the node: base plus index path with trailing
    /// zeros stripped (a trailing zero projection refers to the same
    /// address as its parent). Used for must-alias determination.
    #[must_use]
    pub fn address(&self, n: NodeId) -> (NodeId, Vec<u64>) {
        match &self.nodes[n.index()].kind {
            NodeKind::Field { parent, indices, .. } => {
                let mut stripped = indices.clone();
                while stripped.last() == Some(&0) {
                    stripped.pop();
                }
                (*parent, stripped)
            }
            _ => (n, Vec::new()),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Module-wide identity of a program value, the canonicalization key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum InternKey {
    Instr(ProcId, InstrId),
    Arg(ProcId, usize),
    Global(GlobalId),
    Const(i64),
}

/// Canonicalization of program values into location nodes.
///
/// `node_for` is total: every value maps to a node, possibly after degrading
/// a field tree. Its only side effect is growth of the shared intern tables.
#[derive(Debug)]
pub struct NodeFactory {
    arena: NodeArena,
    unknown: NodeId,
    value_map: BTreeMap<InternKey, NodeId>,
    global_map: BTreeMap<GlobalId, NodeId>,
    alloc_map: BTreeMap<(ProcId, InstrId), NodeId>,
    uses: BTreeMap<ProcId, BTreeMap<Operand, (usize, InstrId)>>,
}

impl NodeFactory {
    #[must_use]
    pub fn new() -> Self {
        let mut arena = NodeArena::default();
        let unknown = arena.alloc(NodeData {
            kind: NodeKind::Unknown,
            name: "?".to_string(),
            pointer_type: false,
            multiple_stack_frames: false,
            summary_node: false,
            summary_node_pointees: false,
            field_sensitive: false,
            single_pointee: None,
            children: Vec::new(),
        });
        Self {
            arena,
            unknown,
            value_map: BTreeMap::new(),
            global_map: BTreeMap::new(),
            alloc_map: BTreeMap::new(),
            uses: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn arena(&self) -> &NodeArena {
        &self.arena
    }

    #[must_use]
    pub fn unknown(&self) -> NodeId {
        self.unknown
    }

    /// The canonical node of a program value.
    pub fn node_for(&mut self, module: &Module, proc: ProcId, op: Operand) -> NodeId {
        let key = match op {
            Operand::Undef => return self.unknown,
            Operand::Instr(id) => InternKey::Instr(proc, id),
            Operand::Arg(i) => InternKey::Arg(proc, i),
            Operand::Global(g) => InternKey::Global(g),
            Operand::Const(c) => InternKey::Const(c),
        };
        if let Some(&n) = self.value_map.get(&key) {
            return n;
        }
        let n = match op {
            Operand::Instr(id) => self.instr_node(module, proc, id),
            Operand::Global(g) => return self.global_value(module, g),
            Operand::Arg(i) => {
                let name = format!("{}.arg{i}", module.procedure(proc).name());
                let pointer = self.effective_type(module, proc, op).is_some_and(|t| t.is_pointer());
                self.value_node(name, pointer, true, None)
            }
            Operand::Const(c) => self.value_node(format!("const:{c}"), false, false, None),
            Operand::Undef => unreachable!("handled above"),
        };
        self.value_map.insert(key, n);
        n
    }

    /// The canonical node of a global's address: a value whose single
    /// pointee is the global's storage.
    pub fn global_value(&mut self, module: &Module, g: GlobalId) -> NodeId {
        let key = InternKey::Global(g);
        if let Some(&n) = self.value_map.get(&key) {
            return n;
        }
        let storage = self.global_node(module, g);
        let name = module.global(g).name().to_string();
        let n = self.value_node(name, true, true, Some(storage));
        self.value_map.insert(key, n);
        n
    }

    /// The dedicated storage node of a module global.
    pub fn global_node(&mut self, module: &Module, g: GlobalId) -> NodeId {
        if let Some(&n) = self.global_map.get(&g) {
            return n;
        }
        let global = module.global(g);
        let n = self.arena.alloc(NodeData {
            kind: NodeKind::Global(g),
            name: format!("global:{}", global.name()),
            pointer_type: global.ty().is_pointer(),
            multiple_stack_frames: true,
            summary_node: false,
            summary_node_pointees: false,
            field_sensitive: true,
            single_pointee: None,
            children: Vec::new(),
        });
        self.global_map.insert(g, n);
        n
    }

    fn instr_node(&mut self, module: &Module, proc: ProcId, id: InstrId) -> NodeId {
        let procedure = module.procedure(proc);
        match procedure.instr(id).clone() {
            Instruction::Field { base, indices } => {
                self.projection_node(module, proc, id, base, &indices)
            }
            Instruction::Cast { value, .. } if self.use_info(module, proc, value).0 == 1 => {
                // The casted value has no other user, so the cast can share
                // its identity. With several users the cast may change the
                // claimed size of the referenced object and must stay apart.
                self.node_for(module, proc, value)
            }
            Instruction::Alloca { ref ty } => {
                let site_name = format!("alloca:{}.{id}", procedure.name());
                let site = self.alloc_site(proc, id, site_name, ty.is_pointer());
                let name = format!("{}.%{id}", procedure.name());
                self.value_node(name, true, true, Some(site))
            }
            Instruction::Call { callee: Callee::External { ref name, no_alias_result: true }, ref ty, .. }
                if ty.is_some() =>
            {
                let pointee_is_pointer = ty
                    .as_ref()
                    .and_then(Type::pointee)
                    .is_some_and(Type::is_pointer);
                let site_name = format!("noalias:{name}.{id}");
                let site = self.alloc_site(proc, id, site_name, pointee_is_pointer);
                let name = format!("{}.%{id}", procedure.name());
                self.value_node(name, true, true, Some(site))
            }
            _ => {
                let op = Operand::Instr(id);
                let pointer = self.effective_type(module, proc, op).is_some_and(|t| t.is_pointer());
                let name = format!("{}.%{id}", procedure.name());
                self.value_node(name, pointer, true, None)
            }
        }
    }

    fn value_node(
        &mut self,
        name: String,
        pointer_type: bool,
        multiple_stack_frames: bool,
        single_pointee: Option<NodeId>,
    ) -> NodeId {
        self.arena.alloc(NodeData {
            kind: NodeKind::Value,
            name,
            pointer_type,
            multiple_stack_frames,
            summary_node: false,
            summary_node_pointees: false,
            field_sensitive: true,
            single_pointee,
            children: Vec::new(),
        })
    }

    fn alloc_site(&mut self, proc: ProcId, id: InstrId, name: String, pointer_type: bool) -> NodeId {
        if let Some(&n) = self.alloc_map.get(&(proc, id)) {
            return n;
        }
        let n = self.arena.alloc(NodeData {
            kind: NodeKind::Alloc { definer: proc },
            name,
            pointer_type,
            multiple_stack_frames: true,
            summary_node: false,
            summary_node_pointees: false,
            field_sensitive: true,
            single_pointee: None,
            children: Vec::new(),
        });
        self.alloc_map.insert((proc, id), n);
        n
    }

    fn projection_node(
        &mut self,
        module: &Module,
        proc: ProcId,
        id: InstrId,
        base: Operand,
        indices: &[FieldIndex],
    ) -> NodeId {
        let parent = self.node_for(module, proc, base);
        let constant: Option<Vec<u64>> = indices
            .iter()
            .map(|i| match i {
                FieldIndex::Const(c) => Some(*c),
                FieldIndex::Dynamic(_) => None,
            })
            .collect();
        let parent_is_field = matches!(self.arena.kind(parent), NodeKind::Field { .. });
        let decomposable = match &constant {
            Some(idx) => {
                !idx.is_empty()
                    && (parent_is_field || idx[0] == 0)
                    && self.arena.is_field_sensitive(parent)
            }
            None => false,
        };
        if !decomposable {
            // Controlled imprecision: the base node stands for the whole
            // object, and since strong updates through it are no longer
            // possible, its pointees become summaries when they can have
            // pointees themselves.
            self.arena.mark_not_field_sensitive(parent);
            let elem_is_pointer = module
                .procedure(proc)
                .result_type(module, id)
                .as_ref()
                .and_then(Type::pointee)
                .is_some_and(Type::is_pointer);
            if elem_is_pointer {
                self.arena.mark_pointees_summary(parent);
            }
            return parent;
        }
        if self.arena.pointees_are_summary(parent) {
            // The parent is already a stand-in for all of its sub-nodes.
            return parent;
        }
        let idx = constant.expect("checked decomposable");
        let pointee = self.arena.single_pointee_opt(parent).map(|sp| {
            let elem_is_pointer = module
                .procedure(proc)
                .result_type(module, id)
                .as_ref()
                .and_then(Type::pointee)
                .is_some_and(Type::is_pointer);
            self.field_node(sp, &idx, elem_is_pointer, None)
        });
        self.field_node(parent, &idx, true, pointee)
    }

    /// The canonical child of `parent` with exactly the given index path.
    fn field_node(
        &mut self,
        parent: NodeId,
        indices: &[u64],
        pointer_type: bool,
        pointee: Option<NodeId>,
    ) -> NodeId {
        debug_assert!(!indices.is_empty());
        debug_assert!(self.arena.is_field_sensitive(parent));
        for &child in self.arena.children(parent) {
            if let NodeKind::Field { indices: existing, .. } = self.arena.kind(child) {
                if existing == indices {
                    return child;
                }
            }
        }
        let level = match self.arena.kind(parent) {
            NodeKind::Field { level, .. } => level + indices.len(),
            _ => indices.len(),
        };
        let mut name = self.arena.name(parent).to_string();
        for i in indices {
            name.push_str(&format!("[{i}]"));
        }
        let n = self.arena.alloc(NodeData {
            kind: NodeKind::Field { parent, indices: indices.to_vec(), level },
            name,
            pointer_type,
            multiple_stack_frames: true,
            summary_node: false,
            summary_node_pointees: false,
            field_sensitive: true,
            single_pointee: pointee,
            children: Vec::new(),
        });
        self.arena.nodes[parent.index()].children.push(n);
        if level > MAX_FIELD_DEPTH {
            self.arena.mark_not_field_sensitive(n);
            if pointer_type {
                self.arena.mark_pointees_summary(n);
            }
        }
        n
    }

    /// The canonical projection of an arbitrary points-to target, used when
    /// a field access has to be mapped over every object its base may refer
    /// to. A target that is not field-sensitive (or Unknown) stands for all
    /// of its sub-nodes and is returned as is.
    pub fn indexed_node(
        &mut self,
        target: NodeId,
        indices: &[u64],
        elem_is_pointer: bool,
    ) -> NodeId {
        if matches!(self.arena.kind(target), NodeKind::Unknown)
            || !self.arena.is_field_sensitive(target)
            || self.arena.single_pointee_opt(target).is_some()
        {
            return target;
        }
        self.field_node(target, indices, elem_is_pointer, None)
    }

    fn use_info(&mut self, module: &Module, proc: ProcId, op: Operand) -> (usize, Option<InstrId>) {
        let per_proc = self.uses.entry(proc).or_insert_with(|| {
            let procedure = module.procedure(proc);
            let mut map: BTreeMap<Operand, (usize, InstrId)> = BTreeMap::new();
            for (id, instr) in procedure.instructions() {
                for used in instr.operands() {
                    let entry = map.entry(used).or_insert((0, id));
                    entry.0 += 1;
                    entry.1 = id;
                }
            }
            map
        });
        match per_proc.get(&op) {
            Some(&(count, user)) => (count, Some(user)),
            None => (0, None),
        }
    }

    fn effective_type(&mut self, module: &Module, proc: ProcId, op: Operand) -> Option<Type> {
        // A value used exactly once, by a cast, is seen at the cast's type.
        if let (1, Some(user)) = self.use_info(module, proc, op) {
            if let Instruction::Cast { ty, .. } = module.procedure(proc).instr(user) {
                return Some(ty.clone());
            }
        }
        module.procedure(proc).type_of(module, op)
    }
}

impl Default for NodeFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pt_ir::builder::ModuleBuilder;
    use pt_ir::types::Type;

    fn slot_struct() -> Type {
        Type::Struct(vec![Type::Int, Type::Struct(vec![Type::Int, Type::ptr(Type::Int)])])
    }

    #[test]
    fn undef_is_unknown() {
        let mut mb = ModuleBuilder::new();
        let p = mb.declare("f", vec![], None);
        mb.body(p).ret(None);
        let module = mb.build().unwrap();
        let mut factory = NodeFactory::new();
        assert_eq!(factory.node_for(&module, p, Operand::Undef), factory.unknown());
    }

    #[test]
    fn canonical_projections() {
        let mut mb = ModuleBuilder::new();
        let p = mb.declare("f", vec![], None);
        let b = mb.body(p);
        let slot = b.alloca(slot_struct());
        let f1 = b.field_const(slot, &[0, 1]);
        let f2 = b.field_const(slot, &[0, 1]);
        let other = b.field_const(slot, &[0, 0]);
        b.ret(None);
        let module = mb.build().unwrap();

        let mut factory = NodeFactory::new();
        let n1 = factory.node_for(&module, p, f1);
        let n2 = factory.node_for(&module, p, f2);
        let n3 = factory.node_for(&module, p, other);
        assert_eq!(n1, n2);
        assert_ne!(n1, n3);

        let base = factory.node_for(&module, p, slot);
        assert!(factory.arena().is_sub_node_of(n1, base));
        assert!(!factory.arena().is_sub_node_of(base, n1));
    }

    #[test]
    fn projection_of_single_pointee_follows_storage() {
        let mut mb = ModuleBuilder::new();
        let p = mb.declare("f", vec![], None);
        let b = mb.body(p);
        let slot = b.alloca(slot_struct());
        let fld = b.field_const(slot, &[0, 1]);
        b.ret(None);
        let module = mb.build().unwrap();

        let mut factory = NodeFactory::new();
        let base = factory.node_for(&module, p, slot);
        let proj = factory.node_for(&module, p, fld);
        let site = factory.arena().single_pointee(base);
        let proj_pointee = factory.arena().single_pointee(proj);
        assert!(factory.arena().is_sub_node_of(proj_pointee, site));
        assert_ne!(proj_pointee, site);
    }

    #[test]
    fn dynamic_index_degrades() {
        let mut mb = ModuleBuilder::new();
        let p = mb.declare("f", vec![Type::Int], None);
        let b = mb.body(p);
        let slot = b.alloca(Type::array(Type::ptr(Type::Int), 8));
        let fld = b.field(
            slot,
            vec![FieldIndex::Const(0), FieldIndex::Dynamic(Operand::Arg(0))],
        );
        b.ret(None);
        let module = mb.build().unwrap();

        let mut factory = NodeFactory::new();
        let proj = factory.node_for(&module, p, fld);
        let base = factory.node_for(&module, p, slot);
        assert_eq!(proj, base);
        assert!(!factory.arena().is_field_sensitive(base));
        assert!(factory.arena().pointees_are_summary(base));
        assert!(factory.arena().is_always_summary(factory.arena().single_pointee(base)));
    }

    #[test]
    fn depth_bound_degrades() {
        let mut mb = ModuleBuilder::new();
        let p = mb.declare("f", vec![], None);
        let b = mb.body(p);
        let mut ty = Type::Int;
        for _ in 0..(MAX_FIELD_DEPTH + 2) {
            ty = Type::Struct(vec![ty]);
        }
        let slot = b.alloca(ty);
        let mut cur = slot;
        for _ in 0..(MAX_FIELD_DEPTH + 1) {
            cur = b.field_const(cur, &[0, 0]);
        }
        b.ret(None);
        let module = mb.build().unwrap();

        let mut factory = NodeFactory::new();
        let deep = factory.node_for(&module, p, cur);
        assert!(!factory.arena().is_field_sensitive(deep));
    }

    #[test]
    fn trailing_zeros_share_address() {
        let mut mb = ModuleBuilder::new();
        let p = mb.declare("f", vec![], None);
        let b = mb.body(p);
        let slot = b.alloca(Type::Struct(vec![Type::Int, Type::Int]));
        let head = b.field_const(slot, &[0, 0]);
        let second = b.field_const(slot, &[0, 1]);
        b.ret(None);
        let module = mb.build().unwrap();

        let mut factory = NodeFactory::new();
        let base = factory.node_for(&module, p, slot);
        let head = factory.node_for(&module, p, head);
        let second = factory.node_for(&module, p, second);
        assert_eq!(factory.arena().address(head), (base, vec![]));
        assert_eq!(factory.arena().address(base), (base, vec![]));
        assert_eq!(factory.arena().address(second), (base, vec![0, 1]));
    }

    #[test]
    fn single_user_cast_shares_identity() {
        let mut mb = ModuleBuilder::new();
        let p = mb.declare("f", vec![Type::ptr(Type::Int)], None);
        let b = mb.body(p);
        let c = b.cast(Operand::Arg(0), Type::ptr(Type::Int));
        let _ = b.load(c);
        b.ret(None);
        let module = mb.build().unwrap();

        let mut factory = NodeFactory::new();
        let arg = factory.node_for(&module, p, Operand::Arg(0));
        let cast = factory.node_for(&module, p, c);
        assert_eq!(arg, cast);
    }

    #[test]
    fn multi_user_cast_stays_apart() {
        let mut mb = ModuleBuilder::new();
        let p = mb.declare("f", vec![Type::ptr(Type::Int)], None);
        let b = mb.body(p);
        let c = b.cast(Operand::Arg(0), Type::ptr(Type::Int));
        let _ = b.load(Operand::Arg(0));
        let _ = b.load(c);
        b.ret(None);
        let module = mb.build().unwrap();

        let mut factory = NodeFactory::new();
        let arg = factory.node_for(&module, p, Operand::Arg(0));
        let cast = factory.node_for(&module, p, c);
        assert_ne!(arg, cast);
    }
}
