//! Dataflow facts: liveness sets and may-point-to relations.

use crate::node::{NodeArena, NodeId};
use std::collections::BTreeSet;
use std::fmt;

/// The set of locations demanded at a program point.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LivenessSet(BTreeSet<NodeId>);

impl LivenessSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, n: NodeId) -> bool {
        self.0.insert(n)
    }

    pub fn remove(&mut self, n: NodeId) -> bool {
        self.0.remove(&n)
    }

    #[must_use]
    pub fn contains(&self, n: NodeId) -> bool {
        self.0.contains(&n)
    }

    pub fn union_with(&mut self, other: &Self) {
        self.0.extend(other.0.iter().copied());
    }

    pub fn extend(&mut self, nodes: impl IntoIterator<Item = NodeId>) {
        self.0.extend(nodes);
    }

    pub fn retain(&mut self, f: impl FnMut(&NodeId) -> bool) {
        self.0.retain(f);
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.0.iter().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn display<'a>(&'a self, arena: &'a NodeArena) -> impl fmt::Display + 'a {
        DisplaySet { set: &self.0, arena }
    }
}

impl FromIterator<NodeId> for LivenessSet {
    fn from_iter<I: IntoIterator<Item = NodeId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

struct DisplaySet<'a> {
    set: &'a BTreeSet<NodeId>,
    arena: &'a NodeArena,
}

impl fmt::Display for DisplaySet<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{")?;
        for (i, n) in self.set.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, " {}", self.arena.name(*n))?;
        }
        write!(f, " }}")
    }
}

/// A set of may-point-to edges. Several targets for one source express
/// imprecision, never an ordering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PointsToRelation(BTreeSet<(NodeId, NodeId)>);

impl PointsToRelation {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, source: NodeId, target: NodeId) -> bool {
        self.0.insert((source, target))
    }

    #[must_use]
    pub fn contains(&self, source: NodeId, target: NodeId) -> bool {
        self.0.contains(&(source, target))
    }

    /// Everything `source` may point to.
    pub fn pointees_of(&self, source: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.0
            .range((source, NodeId::MIN)..=(source, NodeId::MAX))
            .map(|(_, t)| *t)
    }

    #[must_use]
    pub fn has_source(&self, source: NodeId) -> bool {
        self.pointees_of(source).next().is_some()
    }

    pub fn remove_source(&mut self, source: NodeId) {
        self.0.retain(|(s, _)| *s != source);
    }

    /// Drops every pair whose source is not live.
    pub fn restrict_sources(&mut self, live: &LivenessSet) {
        self.0.retain(|(s, _)| live.contains(*s));
    }

    pub fn union_with(&mut self, other: &Self) {
        self.0.extend(other.0.iter().copied());
    }

    pub fn retain(&mut self, f: impl FnMut(&(NodeId, NodeId)) -> bool) {
        self.0.retain(f);
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, NodeId)> + '_ {
        self.0.iter().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Locations reachable from `roots` through the relation, roots
    /// included: the mark phase of a tracing collector over the points-to
    /// graph.
    #[must_use]
    pub fn reachable_from(&self, roots: impl IntoIterator<Item = NodeId>) -> BTreeSet<NodeId> {
        let mut reached: BTreeSet<NodeId> = BTreeSet::new();
        let mut stack: Vec<NodeId> = roots.into_iter().collect();
        while let Some(n) = stack.pop() {
            if reached.insert(n) {
                stack.extend(self.pointees_of(n));
            }
        }
        reached
    }

    #[must_use]
    pub fn display<'a>(&'a self, arena: &'a NodeArena) -> impl fmt::Display + 'a {
        DisplayRelation { rel: &self.0, arena }
    }

    /// The relation as a graphviz digraph, one edge per may-point-to pair.
    #[must_use]
    pub fn to_dot(&self, arena: &NodeArena) -> String {
        use fmt::Write;

        let mut res = String::new();
        res.push_str("digraph {\n");
        res.push_str("  splines=ortho;\n");
        for (s, t) in self.iter() {
            writeln!(res, "  \"{}\" -> \"{}\";", arena.name(s), arena.name(t)).unwrap();
        }
        res.push('}');
        res
    }
}

impl FromIterator<(NodeId, NodeId)> for PointsToRelation {
    fn from_iter<I: IntoIterator<Item = (NodeId, NodeId)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

struct DisplayRelation<'a> {
    rel: &'a BTreeSet<(NodeId, NodeId)>,
    arena: &'a NodeArena,
}

impl fmt::Display for DisplayRelation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (s, t)) in self.rel.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, " {}-->{}", self.arena.name(*s), self.arena.name(*t))?;
        }
        write!(f, " }}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeFactory;
    use pt_ir::builder::ModuleBuilder;
    use pt_ir::instrs::Operand;
    use pt_ir::types::Type;

    fn nodes(n: usize) -> Vec<NodeId> {
        let mut mb = ModuleBuilder::new();
        let p = mb.declare("f", vec![], None);
        let b = mb.body(p);
        for _ in 0..n {
            b.alloca(Type::Int);
        }
        b.ret(None);
        let module = mb.build().unwrap();
        let mut factory = NodeFactory::new();
        module
            .procedure(p)
            .instructions()
            .take(n)
            .map(|(id, _)| factory.node_for(&module, p, Operand::Instr(id)))
            .collect()
    }

    #[test]
    fn pointees_are_ranged() {
        let ns = nodes(4);
        let mut rel = PointsToRelation::new();
        rel.insert(ns[0], ns[1]);
        rel.insert(ns[0], ns[2]);
        rel.insert(ns[1], ns[3]);
        let image: Vec<_> = rel.pointees_of(ns[0]).collect();
        assert_eq!(image, vec![ns[1], ns[2]]);
        assert!(rel.has_source(ns[1]));
        assert!(!rel.has_source(ns[3]));
    }

    #[test]
    fn reachability_is_transitive() {
        let ns = nodes(4);
        let mut rel = PointsToRelation::new();
        rel.insert(ns[0], ns[1]);
        rel.insert(ns[1], ns[2]);
        let reached = rel.reachable_from([ns[0]]);
        assert!(reached.contains(&ns[0]));
        assert!(reached.contains(&ns[1]));
        assert!(reached.contains(&ns[2]));
        assert!(!reached.contains(&ns[3]));
    }

    #[test]
    fn restriction_drops_dead_sources() {
        let ns = nodes(3);
        let mut rel = PointsToRelation::new();
        rel.insert(ns[0], ns[1]);
        rel.insert(ns[2], ns[1]);
        let live: LivenessSet = [ns[0]].into_iter().collect();
        rel.restrict_sources(&live);
        assert!(rel.contains(ns[0], ns[1]));
        assert!(!rel.has_source(ns[2]));
    }
}
