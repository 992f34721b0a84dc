//! Alias classification over points-to sets, and the per-value query layer
//! on completed analysis results.

use crate::node::{NodeArena, NodeId, NodeKind};
use crate::solver::Analysis;
use pt_ir::instrs::Operand;
use pt_ir::{InstrId, ProcId};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

/// The four possible answers to "can these two values refer to overlapping
/// storage".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AliasKind {
    No,
    May,
    Partial,
    Must,
}

impl fmt::Display for AliasKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::No => write!(f, "NoAlias"),
            Self::May => write!(f, "MayAlias"),
            Self::Partial => write!(f, "PartialAlias"),
            Self::Must => write!(f, "MustAlias"),
        }
    }
}

/// Combines two points-to sets into an alias classification.
///
/// Empty information on either side means "unknown": the conservative answer
/// is may-alias. Must-alias requires every member of both sets to share one
/// canonical trailing-zero-stripped address; partial aliasing requires every
/// member of one set to be a sub-node of every member of the other; a single
/// sub-node cross pair keeps may-alias; disjoint trees cannot alias.
#[must_use]
pub fn classify(
    arena: &NodeArena,
    a: &BTreeSet<NodeId>,
    b: &BTreeSet<NodeId>,
    allow_must: bool,
) -> AliasKind {
    if a.is_empty() || b.is_empty() {
        return AliasKind::May;
    }
    let unknown = |n: &NodeId| matches!(arena.kind(*n), NodeKind::Unknown);
    if a.iter().any(unknown) || b.iter().any(unknown) {
        return AliasKind::May;
    }
    if allow_must {
        let mut addresses = a.iter().chain(b.iter()).map(|&n| arena.address(n));
        let first = addresses.next().expect("sets are non-empty");
        if addresses.all(|addr| addr == first) {
            return AliasKind::Must;
        }
    }
    let all_sub = |x: &BTreeSet<NodeId>, y: &BTreeSet<NodeId>| {
        x.iter().all(|&n| y.iter().all(|&m| arena.is_sub_node_of(n, m)))
    };
    if allow_must && (all_sub(a, b) || all_sub(b, a)) {
        return AliasKind::Partial;
    }
    for &n in a {
        for &m in b {
            if arena.is_sub_node_of(n, m) || arena.is_sub_node_of(m, n) {
                return AliasKind::May;
            }
        }
    }
    AliasKind::No
}

impl Analysis<'_> {
    /// The points-to set of a value after `instr`, merged over every stored
    /// context of the procedure. The boolean grants must-alias conclusions;
    /// it is withdrawn when contexts disagree or a summary node is involved.
    pub fn points_to_at(
        &mut self,
        proc: ProcId,
        instr: InstrId,
        op: Operand,
    ) -> (BTreeSet<NodeId>, bool) {
        let n = self.factory.node_for(self.module, proc, op);
        if let Some(sp) = self.factory.arena().single_pointee_opt(n) {
            // Canonical by construction: the value always refers to exactly
            // its own site or storage.
            return (
                BTreeSet::from([sp]),
                !self.factory.arena().is_always_summary(sp),
            );
        }
        let mut merged: BTreeSet<NodeId> = BTreeSet::new();
        let mut allow_must = true;
        let mut first: Option<BTreeSet<NodeId>> = None;
        for (_, facts) in self.store.entries(proc) {
            let image: BTreeSet<NodeId> =
                facts[instr.index()].points_to_out.pointees_of(n).collect();
            match &first {
                None => first = Some(image.clone()),
                Some(seen) if *seen != image => allow_must = false,
                Some(_) => {}
            }
            merged.extend(image);
        }
        if merged.iter().any(|&m| self.factory.arena().is_always_summary(m)) {
            allow_must = false;
        }
        (merged, allow_must)
    }

    /// Classifies two values at a program point. Structurally identical
    /// operands trivially must-alias; an undefined value is assumed to alias
    /// nothing.
    pub fn alias_at(&mut self, proc: ProcId, instr: InstrId, a: Operand, b: Operand) -> AliasKind {
        if matches!(a, Operand::Undef) || matches!(b, Operand::Undef) {
            return AliasKind::No;
        }
        if a == b {
            return AliasKind::Must;
        }
        let (set_a, must_a) = self.points_to_at(proc, instr, a);
        let (set_b, must_b) = self.points_to_at(proc, instr, b);
        classify(self.factory.arena(), &set_a, &set_b, must_a && must_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeFactory;
    use pt_ir::builder::ModuleBuilder;
    use pt_ir::types::Type;

    #[test]
    fn classification_shapes() {
        let mut mb = ModuleBuilder::new();
        let p = mb.declare("f", vec![], None);
        let b = mb.body(p);
        let x = b.alloca(Type::Struct(vec![Type::Int, Type::Int]));
        let fld = b.field_const(x, &[0, 1]);
        let y = b.alloca(Type::Int);
        b.ret(None);
        let module = mb.build().unwrap();

        let mut factory = NodeFactory::new();
        let site_x = {
            let n = factory.node_for(&module, p, x);
            factory.arena().single_pointee(n)
        };
        let site_fld = {
            let n = factory.node_for(&module, p, fld);
            factory.arena().single_pointee(n)
        };
        let site_y = {
            let n = factory.node_for(&module, p, y);
            factory.arena().single_pointee(n)
        };
        let arena = factory.arena();

        let set = |n: NodeId| BTreeSet::from([n]);
        assert_eq!(classify(arena, &set(site_x), &set(site_x), true), AliasKind::Must);
        assert_eq!(classify(arena, &set(site_x), &set(site_fld), true), AliasKind::Partial);
        assert_eq!(classify(arena, &set(site_x), &set(site_y), true), AliasKind::No);
        assert_eq!(classify(arena, &set(site_x), &BTreeSet::new(), true), AliasKind::May);
        assert_eq!(
            classify(arena, &set(site_x), &set(site_fld), false),
            AliasKind::May
        );
    }
}
