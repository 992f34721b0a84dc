//! Per-instruction transfer functions: kill/ref for liveness, def/pointee
//! for points-to, including the interprocedural call protocol.

use crate::callstring::{CallSite, CallString};
use crate::controlflow::InstrCfg;
use crate::errors::{AnalysisError, AnalysisResult};
use crate::facts::{LivenessSet, PointsToRelation};
use crate::node::{NodeFactory, NodeId};
use crate::store::SummaryStore;
use pt_ir::instrs::{Callee, FieldIndex, Instruction, Operand};
use pt_ir::types::Type;
use pt_ir::{InstrId, Module, ProcId};
use std::collections::{BTreeMap, BTreeSet};

/// A direct call encountered during a run, together with the state handed to
/// the callee. The interprocedural driver re-analyzes callees from these.
#[derive(Debug, Clone)]
pub(crate) struct CallTuple {
    pub site: CallSite,
    pub entry: PointsToRelation,
    pub exit_liveness: LivenessSet,
}

/// Shared state of the transfer functions for one (procedure, context) run.
pub(crate) struct Transfer<'a, 'm> {
    pub module: &'m Module,
    pub proc: ProcId,
    pub ctx: &'a CallString,
    pub factory: &'a mut NodeFactory,
    pub store: &'a SummaryStore,
    pub cfgs: &'a BTreeMap<ProcId, InstrCfg>,
    /// Call tuples seen so far, freshest state per call site.
    pub calls: BTreeMap<InstrId, CallTuple>,
}

/// What the callee protocol computed for one call site.
struct CallView {
    reachable: BTreeSet<NodeId>,
    entry: PointsToRelation,
    exit_liveness: LivenessSet,
    extended: CallString,
}

impl<'a, 'm> Transfer<'a, 'm> {
    pub fn node(&mut self, op: Operand) -> NodeId {
        self.factory.node_for(self.module, self.proc, op)
    }

    fn result_node(&mut self, id: InstrId) -> Option<NodeId> {
        self.module
            .procedure(self.proc)
            .instr(id)
            .has_result()
            .then(|| self.node(Operand::Instr(id)))
    }

    /// The unique concrete target a store through this image may strongly
    /// update: none when the image is empty, contains Unknown, has several
    /// targets, or its only target is a summary under the current context.
    fn strong_target(&self, image: &[NodeId]) -> Option<NodeId> {
        match image {
            [m]
                if *m != self.factory.unknown()
                    && !self.factory.arena().is_summary_in(*m, self.ctx) =>
            {
                Some(*m)
            }
            _ => None,
        }
    }

    /// Liveness transfer: recomputes live-before from live-after (kill, then
    /// ref).
    pub fn live_in(
        &mut self,
        id: InstrId,
        lout: &LivenessSet,
        ain: &PointsToRelation,
    ) -> AnalysisResult<LivenessSet> {
        let module = self.module;
        match module.procedure(self.proc).instr(id).clone() {
            Instruction::Load { ptr } => {
                let r = self.node(Operand::Instr(id));
                let p = self.node(ptr);
                let mut lin = lout.clone();
                lin.remove(r);
                lin.insert(p);
                if lout.contains(r) {
                    lin.extend(ain.pointees_of(p));
                }
                Ok(lin)
            }
            Instruction::Store { ptr, value } => {
                let p = self.node(ptr);
                let v = self.node(value);
                let image: Vec<NodeId> = ain.pointees_of(p).collect();
                let unknown = self.factory.unknown();
                let mut lin = if image.is_empty() || image.contains(&unknown) {
                    // The store may overwrite anything: everything is
                    // conservatively killed.
                    LivenessSet::new()
                } else if let Some(m) = self.strong_target(&image) {
                    let mut l = lout.clone();
                    l.remove(m);
                    l
                } else {
                    lout.clone()
                };
                lin.insert(p);
                if image.iter().any(|m| lout.contains(*m)) {
                    lin.insert(v);
                }
                Ok(lin)
            }
            Instruction::Phi { .. } | Instruction::Select { .. } | Instruction::Cast { .. } => {
                let r = self.node(Operand::Instr(id));
                let mut lin = lout.clone();
                lin.remove(r);
                if lout.contains(r) {
                    for op in module.procedure(self.proc).instr(id).operands() {
                        let n = self.node(op);
                        lin.insert(n);
                    }
                }
                Ok(lin)
            }
            Instruction::Alloca { .. } => {
                let r = self.node(Operand::Instr(id));
                let mut lin = lout.clone();
                lin.remove(r);
                Ok(lin)
            }
            Instruction::Call { ref callee, ref args, .. } => {
                self.call_live_in(id, callee, args, lout, ain)
            }
            instr => {
                // Every operand is referenced regardless of the
                // instruction's own liveness.
                let mut lin = lout.clone();
                if let Some(r) = self.result_node(id) {
                    lin.remove(r);
                }
                for op in instr.operands() {
                    let n = self.node(op);
                    lin.insert(n);
                }
                Ok(lin)
            }
        }
    }

    /// Points-to transfer: recomputes the outgoing relation from the
    /// incoming one.
    pub fn points_to_out(
        &mut self,
        id: InstrId,
        lout: &LivenessSet,
        ain: &PointsToRelation,
    ) -> AnalysisResult<PointsToRelation> {
        let module = self.module;
        match module.procedure(self.proc).instr(id).clone() {
            Instruction::Load { ptr } => {
                let r = self.node(Operand::Instr(id));
                let p = self.node(ptr);
                let mut aout = ain.clone();
                aout.remove_source(r);
                // Two hops: everything any location `p` may point to may
                // itself point to.
                let image: Vec<NodeId> = ain.pointees_of(p).collect();
                for m in image {
                    for t in ain.pointees_of(m) {
                        aout.insert(r, t);
                    }
                }
                Ok(aout)
            }
            Instruction::Store { ptr, value } => {
                let p = self.node(ptr);
                let v = self.node(value);
                let image: Vec<NodeId> = ain.pointees_of(p).collect();
                let vimage: Vec<NodeId> = ain.pointees_of(v).collect();
                let mut aout = ain.clone();
                if let Some(m) = self.strong_target(&image) {
                    // Strong update: the unique concrete target now holds
                    // exactly the stored value.
                    aout.remove_source(m);
                    for t in &vimage {
                        aout.insert(m, *t);
                    }
                } else {
                    // Weak update: merge, never overwrite.
                    for m in &image {
                        for t in &vimage {
                            aout.insert(*m, *t);
                        }
                    }
                }
                Ok(aout)
            }
            Instruction::Phi { .. } | Instruction::Select { .. } | Instruction::Cast { .. } => {
                let r = self.node(Operand::Instr(id));
                let mut aout = ain.clone();
                aout.remove_source(r);
                for op in value_operands(module.procedure(self.proc).instr(id)) {
                    let n = self.node(op);
                    let image: Vec<NodeId> = ain.pointees_of(n).collect();
                    for t in image {
                        aout.insert(r, t);
                    }
                }
                Ok(aout)
            }
            Instruction::Alloca { .. } => {
                let r = self.node(Operand::Instr(id));
                let site = self.factory.arena().single_pointee(r);
                let mut aout = ain.clone();
                aout.remove_source(r);
                aout.insert(r, site);
                Ok(aout)
            }
            Instruction::Field { base, ref indices } => {
                let r = self.node(Operand::Instr(id));
                let b = self.node(base);
                let mut aout = ain.clone();
                if r == b {
                    // Degraded projection: the base stands for the whole
                    // object, nothing to redefine.
                    return Ok(aout);
                }
                aout.remove_source(r);
                if let Some(sp) = self.factory.arena().single_pointee_opt(r) {
                    aout.insert(r, sp);
                } else {
                    // Map the projection over every object the base may
                    // refer to.
                    let constant: Vec<u64> = indices
                        .iter()
                        .filter_map(|i| match i {
                            FieldIndex::Const(c) => Some(*c),
                            FieldIndex::Dynamic(_) => None,
                        })
                        .collect();
                    let elem_is_pointer = module
                        .procedure(self.proc)
                        .result_type(module, id)
                        .as_ref()
                        .and_then(Type::pointee)
                        .is_some_and(Type::is_pointer);
                    let targets: Vec<NodeId> = ain.pointees_of(b).collect();
                    for t in targets {
                        let ft = self.factory.indexed_node(t, &constant, elem_is_pointer);
                        aout.insert(r, ft);
                    }
                }
                Ok(aout)
            }
            Instruction::Call { ref callee, ref args, .. } => {
                self.call_points_to_out(id, callee, args, lout, ain)
            }
            _ => {
                let mut aout = ain.clone();
                if let Some(r) = self.result_node(id) {
                    aout.remove_source(r);
                }
                Ok(aout)
            }
        }
    }

    fn call_site(&self, id: InstrId, callee: ProcId) -> CallSite {
        CallSite { caller: self.proc, instr: id, callee }
    }

    fn check_arity(&self, callee: ProcId, found: usize) -> AnalysisResult<()> {
        let expected = self.module.procedure(callee).params().len();
        if expected == found {
            Ok(())
        } else {
            Err(AnalysisError::ArityMismatch {
                callee: self.module.procedure(callee).name().to_string(),
                expected,
                found,
            })
        }
    }

    /// The reachable sub-state handed to a known callee: roots are the
    /// actual-argument images plus every global, closed over `ain`; the
    /// entry relation is `ain` restricted to it, re-rooted through the
    /// actual/formal correspondence; the exit liveness is the caller's
    /// live-out restricted to it.
    fn call_view(
        &mut self,
        id: InstrId,
        callee: ProcId,
        args: &[Operand],
        lout: &LivenessSet,
        ain: &PointsToRelation,
    ) -> CallView {
        let module = self.module;
        let mut roots: Vec<NodeId> = Vec::new();
        for a in args {
            let an = self.node(*a);
            roots.extend(ain.pointees_of(an));
        }
        for (g, _) in module.globals() {
            roots.push(self.factory.global_value(module, g));
        }
        let reachable = ain.reachable_from(roots);

        let mut entry: PointsToRelation =
            ain.iter().filter(|(s, _)| reachable.contains(s)).collect();
        for (i, a) in args.iter().enumerate() {
            let formal = self.factory.node_for(module, callee, Operand::Arg(i));
            let an = self.node(*a);
            let image: Vec<NodeId> = ain.pointees_of(an).collect();
            for t in image {
                entry.insert(formal, t);
            }
        }
        let exit_liveness = lout.iter().filter(|n| reachable.contains(n)).collect();
        CallView {
            reachable,
            entry,
            exit_liveness,
            extended: self.ctx.add_call_site(self.call_site(id, callee)),
        }
    }

    fn formal_nodes(&mut self, callee: ProcId, args: &[Operand]) -> Vec<NodeId> {
        (0..args.len())
            .map(|i| self.factory.node_for(self.module, callee, Operand::Arg(i)))
            .collect()
    }

    fn call_live_in(
        &mut self,
        id: InstrId,
        callee: &Callee,
        args: &[Operand],
        lout: &LivenessSet,
        ain: &PointsToRelation,
    ) -> AnalysisResult<LivenessSet> {
        let Callee::Procedure(callee) = callee else {
            return Ok(self.conservative_live_in(id, args, lout, ain));
        };
        self.check_arity(*callee, args.len())?;
        let view = self.call_view(id, *callee, args, lout, ain);
        let Some(facts) = self.store.longest_prefix_match(*callee, &view.extended) else {
            // Not analyzed yet: worst case, like a declaration.
            return Ok(self.conservative_live_in(id, args, lout, ain));
        };
        let entry_live = facts[self.cfgs[callee].entry().index()].live_in.clone();
        let result = self.result_node(id);

        // Locations that definitely survive the call: live-out, not the
        // call's own result, and not overwritten by the callee before any
        // use.
        let mut lin = LivenessSet::new();
        for n in lout.iter() {
            if Some(n) == result {
                continue;
            }
            if view.reachable.contains(&n) && !entry_live.contains(n) {
                continue;
            }
            lin.insert(n);
        }
        // Caller locations demanded at callee entry: actuals standing in for
        // live formals, and shared locations directly.
        let formals = self.formal_nodes(*callee, args);
        for n in entry_live.iter() {
            if let Some(i) = formals.iter().position(|f| *f == n) {
                let an = self.node(args[i]);
                lin.insert(an);
            } else if self.factory.arena().multiple_stack_frames(n) {
                lin.insert(n);
            }
        }
        Ok(lin)
    }

    fn call_points_to_out(
        &mut self,
        id: InstrId,
        callee: &Callee,
        args: &[Operand],
        lout: &LivenessSet,
        ain: &PointsToRelation,
    ) -> AnalysisResult<PointsToRelation> {
        let Callee::Procedure(callee) = callee else {
            return Ok(self.conservative_points_to_out(id, args, lout, ain));
        };
        self.check_arity(*callee, args.len())?;
        let view = self.call_view(id, *callee, args, lout, ain);
        let summary = self.store.longest_prefix_match(*callee, &view.extended).cloned();
        self.calls.insert(
            id,
            CallTuple {
                site: self.call_site(id, *callee),
                entry: view.entry.clone(),
                exit_liveness: view.exit_liveness.clone(),
            },
        );
        let Some(facts) = summary else {
            return Ok(self.conservative_points_to_out(id, args, lout, ain));
        };

        // Caller pairs the callee cannot touch survive as they are.
        let mut aout: PointsToRelation =
            ain.iter().filter(|(s, _)| !view.reachable.contains(s)).collect();

        // Splice the callee's exit relation back in, minus its formals: a
        // formal is the callee's own value, the actual it stood for is
        // untouched in the caller.
        let formals = self.formal_nodes(*callee, args);
        let callee_cfg = &self.cfgs[callee];
        for exit in callee_cfg.exits() {
            for (s, t) in facts[exit.index()].points_to_out.iter() {
                if formals.contains(&s) {
                    continue;
                }
                if self.factory.arena().multiple_stack_frames(s) {
                    aout.insert(s, t);
                }
            }
        }

        // The call result takes the union of every return path's image, with
        // Unknown whenever some path gives no better answer.
        if let Some(r) = self.result_node(id) {
            let unknown = self.factory.unknown();
            let mut image: BTreeSet<NodeId> = BTreeSet::new();
            let mut fallback = false;
            for (rid, instr) in self.module.procedure(*callee).instructions() {
                if let Instruction::Return { value: Some(v) } = instr {
                    let vn = self.factory.node_for(self.module, *callee, *v);
                    let targets: Vec<NodeId> =
                        facts[rid.index()].points_to_out.pointees_of(vn).collect();
                    if targets.is_empty() {
                        fallback = true;
                    }
                    image.extend(targets);
                }
            }
            if fallback || image.contains(&unknown) {
                image.insert(unknown);
            }
            for t in image {
                aout.insert(r, t);
            }
        }
        Ok(aout)
    }

    /// Worst-case liveness for a declaration or a not-yet-analyzed callee:
    /// everything reachable from the arguments may be read.
    fn conservative_live_in(
        &mut self,
        id: InstrId,
        args: &[Operand],
        lout: &LivenessSet,
        ain: &PointsToRelation,
    ) -> LivenessSet {
        let mut roots = Vec::new();
        for a in args {
            roots.push(self.node(*a));
        }
        let reachable = ain.reachable_from(roots);
        let mut lin = lout.clone();
        if let Some(r) = self.result_node(id) {
            lin.remove(r);
        }
        lin.extend(reachable);
        lin
    }

    /// Worst-case points-to for a declaration or a not-yet-analyzed callee:
    /// every live-out location reachable from the argument values may have
    /// been overwritten with anything; the rest survives.
    fn conservative_points_to_out(
        &mut self,
        id: InstrId,
        args: &[Operand],
        lout: &LivenessSet,
        ain: &PointsToRelation,
    ) -> PointsToRelation {
        let unknown = self.factory.unknown();
        let mut roots = Vec::new();
        for a in args {
            let an = self.node(*a);
            roots.extend(ain.pointees_of(an));
        }
        let reachable = ain.reachable_from(roots);
        let mut aout: PointsToRelation = ain
            .iter()
            .filter(|(s, _)| lout.contains(*s) && !reachable.contains(s))
            .collect();
        for n in &reachable {
            if lout.contains(*n) {
                aout.insert(*n, unknown);
            }
        }
        if let Some(r) = self.result_node(id) {
            if lout.contains(r) {
                // An allocator-style result still points to its own site.
                match self.factory.arena().single_pointee_opt(r) {
                    Some(site) => aout.insert(r, site),
                    None => aout.insert(r, unknown),
                };
            }
        }
        aout
    }
}

/// The operands whose points-to images merge into a copy-like result (the
/// select condition carries no referent).
fn value_operands(instr: &Instruction) -> Vec<Operand> {
    match instr {
        Instruction::Phi { incomings } => incomings.clone(),
        Instruction::Select { if_true, if_false, .. } => vec![*if_true, *if_false],
        Instruction::Cast { value, .. } => vec![*value],
        _ => instr.operands(),
    }
}
