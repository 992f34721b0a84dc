//! The combined liveness/points-to fixpoint engine.
//!
//! Per (procedure, context) pair every instruction carries four quantities:
//! liveness flowing in and out, and a points-to relation flowing in and out.
//! Liveness runs backward, points-to runs forward, and each prunes the
//! other: only pairs with live sources propagate, and pointer dereferences
//! demand liveness of what they may reach. `live_in`/`points_to_out` are the
//! published results, the other two are recomputed from neighbours.

mod transfer;

use crate::callstring::CallString;
use crate::controlflow::InstrCfg;
use crate::errors::AnalysisResult;
use crate::facts::{LivenessSet, PointsToRelation};
use crate::node::{NodeFactory, NodeId};
use crate::store::{ProcedureFacts, SummaryStore};
use fixedbitset::FixedBitSet;
use pt_ir::instrs::Instruction;
use pt_ir::{InstrId, Module, ProcId};
use std::collections::{BTreeMap, VecDeque};
use transfer::{CallTuple, Transfer};

/// A completed (or in-progress) analysis of one module. Owns every piece of
/// shared mutable state: the node arena and intern tables, and the summary
/// store. Constructed by [`analyze_module`], dropped with the results.
pub struct Analysis<'m> {
    pub(crate) module: &'m Module,
    pub(crate) factory: NodeFactory,
    pub(crate) store: SummaryStore,
    pub(crate) cfgs: BTreeMap<ProcId, InstrCfg>,
    pub(crate) globals_rel: PointsToRelation,
    pub(crate) global_values: Vec<NodeId>,
    driver_invocations: usize,
    depth: usize,
}

/// Runs the whole-module analysis: every global points to its dedicated
/// storage node, and every procedure is analyzed under the empty context
/// with that relation as entry state.
///
/// # Errors
///
/// Fails on a structurally invalid module and on the fatal preconditions of
/// the engine (cyclic fresh-storage queries, call-arity mismatches); these
/// abort the run rather than silently degrade.
pub fn analyze_module(module: &Module) -> AnalysisResult<Analysis<'_>> {
    module.validate()?;
    let mut factory = NodeFactory::new();
    let mut cfgs = BTreeMap::new();
    for (pid, proc) in module.procedures() {
        cfgs.insert(pid, InstrCfg::build(proc));
    }
    let mut globals_rel = PointsToRelation::new();
    let mut global_values = Vec::new();
    for (g, _) in module.globals() {
        let value = factory.global_value(module, g);
        let storage = factory.global_node(module, g);
        globals_rel.insert(value, storage);
        global_values.push(value);
    }
    let mut analysis = Analysis {
        module,
        factory,
        store: SummaryStore::new(),
        cfgs,
        globals_rel,
        global_values,
        driver_invocations: 0,
        depth: 0,
    };
    for (pid, proc) in module.procedures() {
        log::debug!("module analysis: procedure {}", proc.name());
        let entry = analysis.globals_rel.clone();
        analysis.drive(pid, &CallString::empty(), &entry, None)?;
    }
    Ok(analysis)
}

impl<'m> Analysis<'m> {
    #[must_use]
    pub fn module(&self) -> &'m Module {
        self.module
    }

    /// How many times the interprocedural driver was entered. The driver
    /// recurses directly; this makes its re-entrancy auditable.
    #[must_use]
    pub fn driver_invocations(&self) -> usize {
        self.driver_invocations
    }

    /// The interprocedural driver: runs the intraprocedural fixpoint for
    /// (procedure, context), then decides what to re-analyze.
    ///
    /// Returns whether the published facts changed, so a caller frame knows
    /// to redrive itself.
    fn drive(
        &mut self,
        proc: ProcId,
        ctx: &CallString,
        entry: &PointsToRelation,
        exit_liveness: Option<&LivenessSet>,
    ) -> AnalysisResult<bool> {
        self.driver_invocations += 1;
        self.depth += 1;
        let name = self.module.procedure(proc).name();
        log::debug!(
            "{:indent$}analyzing {name} at [{ctx}]",
            "",
            indent = 2 * (self.depth - 1)
        );

        // A context already covered by a generalized entry is stable by the
        // widening assumption; re-analysis would query fresh storage with
        // information that has already been computed.
        if self.store.covered_by_cyclic(proc, ctx) {
            self.depth -= 1;
            return Ok(false);
        }

        let n_instrs = self.module.procedure(proc).n_instrs();
        let snapshot = self.store.lookup_or_create(proc, ctx, n_instrs)?.clone();
        let mut facts = snapshot.clone();
        let calls = run(
            self.module,
            proc,
            ctx,
            &self.cfgs[&proc],
            &self.cfgs,
            &mut self.factory,
            &self.store,
            entry,
            exit_liveness,
            &self.global_values,
            &mut facts,
        )?;
        let changed = facts != snapshot;
        self.store.publish(proc, ctx, facts.clone())?;

        let result = if !changed {
            if self.store.attempt_generalize(proc, ctx, &facts) {
                // A caller only re-examines a callee once the callee's own
                // results are consistent, so stopping here is sound.
                Ok(false)
            } else {
                let mut any_callee_changed = false;
                for call in &calls {
                    let extended = ctx.add_call_site(call.site);
                    if self.drive(
                        call.site.callee,
                        &extended,
                        &call.entry,
                        Some(&call.exit_liveness),
                    )? {
                        any_callee_changed = true;
                    }
                }
                if any_callee_changed {
                    self.drive(proc, ctx, entry, exit_liveness)
                } else {
                    Ok(false)
                }
            }
        } else if !ctx.is_empty() {
            // The caller will redrive this procedure with updated inputs.
            Ok(true)
        } else {
            self.drive(proc, ctx, entry, exit_liveness)
        };
        self.depth -= 1;
        result
    }
}

fn enqueue(worklist: &mut VecDeque<InstrId>, on_list: &mut FixedBitSet, id: InstrId) {
    if !on_list.contains(id.index()) {
        on_list.insert(id.index());
        worklist.push_back(id);
    }
}

/// One intraprocedural fixpoint over (procedure, context). Publishes
/// `live_in`/`points_to_out` into `facts` and returns the direct calls
/// encountered, with the freshest state handed to each callee.
#[allow(clippy::too_many_arguments)]
fn run(
    module: &Module,
    proc: ProcId,
    ctx: &CallString,
    cfg: &InstrCfg,
    cfgs: &BTreeMap<ProcId, InstrCfg>,
    factory: &mut NodeFactory,
    store: &SummaryStore,
    entry_rel: &PointsToRelation,
    exit_liveness: Option<&LivenessSet>,
    global_values: &[NodeId],
    facts: &mut ProcedureFacts,
) -> AnalysisResult<Vec<CallTuple>> {
    let n = module.procedure(proc).n_instrs();
    let mut lout = vec![LivenessSet::new(); n];
    let mut ain = vec![PointsToRelation::new(); n];

    let mut worklist: VecDeque<InstrId> = cfg.reverse_post_order().iter().copied().collect();
    let mut on_list = FixedBitSet::with_capacity(n);
    on_list.set_range(.., true);

    let mut transfer = Transfer {
        module,
        proc,
        ctx,
        factory,
        store,
        cfgs,
        calls: BTreeMap::new(),
    };

    while let Some(i) = worklist.pop_front() {
        on_list.set(i.index(), false);
        let instr = module.procedure(proc).instr(i);
        log::trace!("    visit {}: {}", i, instr);

        // Liveness flowing out: successors' live-in, or the exit demand.
        if cfg.is_exit(i) {
            lout[i.index()] = match exit_liveness {
                Some(demanded) => demanded.clone(),
                None => {
                    // No caller: everything a global or the returned value
                    // can reach is demanded (mark-phase trace over `ain`).
                    let mut roots: Vec<NodeId> = global_values.to_vec();
                    if let Instruction::Return { value: Some(v) } = instr {
                        roots.push(transfer.node(*v));
                    }
                    ain[i.index()].reachable_from(roots).into_iter().collect()
                }
            };
        } else {
            let mut l = LivenessSet::new();
            for s in cfg.successors(i) {
                l.union_with(&facts[s.index()].live_in);
            }
            lout[i.index()] = l;
        }

        // Liveness flowing in: kill, then ref.
        let lin = transfer.live_in(i, &lout[i.index()], &ain[i.index()])?;
        if lin != facts[i.index()].live_in {
            facts[i.index()].live_in = lin;
            for p in cfg.predecessors(i) {
                enqueue(&mut worklist, &mut on_list, *p);
            }
        }

        // Points-to flowing in: entry state at the first instruction,
        // otherwise the predecessors' out-relations restricted to the live.
        let new_ain = if i == cfg.entry() {
            let mut rel = entry_rel.clone();
            for p in cfg.predecessors(i) {
                rel.union_with(&facts[p.index()].points_to_out);
            }
            let live_in = facts[i.index()].live_in.clone();
            for nd in live_in.iter() {
                if !rel.has_source(nd) {
                    // A demanded location without any given target points to
                    // its statically known pointee, or to Unknown.
                    let t = transfer
                        .factory
                        .arena()
                        .single_pointee_opt(nd)
                        .unwrap_or_else(|| transfer.factory.unknown());
                    rel.insert(nd, t);
                }
            }
            rel
        } else {
            let mut rel = PointsToRelation::new();
            for p in cfg.predecessors(i) {
                rel.union_with(&facts[p.index()].points_to_out);
            }
            rel.restrict_sources(&facts[i.index()].live_in);
            rel
        };
        if new_ain != ain[i.index()] {
            ain[i.index()] = new_ain;
            enqueue(&mut worklist, &mut on_list, i);
        }

        // Points-to flowing out.
        let aout = transfer.points_to_out(i, &lout[i.index()], &ain[i.index()])?;
        if aout != facts[i.index()].points_to_out {
            facts[i.index()].points_to_out = aout;
            for s in cfg.successors(i) {
                enqueue(&mut worklist, &mut on_list, *s);
            }
        }

        log::trace!(
            "      lin  {}",
            facts[i.index()].live_in.display(transfer.factory.arena())
        );
        log::trace!(
            "      aout {}",
            facts[i.index()].points_to_out.display(transfer.factory.arena())
        );
    }

    Ok(transfer.calls.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pt_ir::builder::ModuleBuilder;
    use pt_ir::instrs::{Callee, Operand};
    use pt_ir::types::Type;

    fn root_facts<'a>(analysis: &'a Analysis, proc: ProcId) -> &'a ProcedureFacts {
        analysis
            .store
            .entries(proc)
            .find(|(cs, _)| !cs.is_cyclic() && cs.is_empty())
            .map(|(_, facts)| facts)
            .expect("root entry")
    }

    fn instr_of(op: Operand) -> InstrId {
        match op {
            Operand::Instr(id) => id,
            _ => panic!("not an instruction result"),
        }
    }

    #[test]
    fn strong_update_replaces_the_unique_target() {
        let mut mb = ModuleBuilder::new();
        let g1 = mb.global("g1", Type::ptr(Type::Int));
        let g2 = mb.global("g2", Type::ptr(Type::Int));
        let f = mb.declare("f", vec![Type::Int], Some(Type::ptr(Type::Int)));
        let b = mb.body(f);
        let x = b.alloca(Type::Int);
        let y = b.alloca(Type::Int);
        b.store(Operand::Global(g1), x);
        let r1 = b.load(Operand::Global(g1));
        b.store(Operand::Global(g1), y);
        b.store(Operand::Global(g2), x);
        let r2 = b.load(Operand::Global(g1));
        let z = b.select(Operand::Arg(0), r1, r2);
        b.ret(Some(z));
        let module = mb.build().unwrap();

        let mut analysis = analyze_module(&module).unwrap();
        let stores: Vec<InstrId> = module
            .procedure(f)
            .instructions()
            .filter(|(_, i)| matches!(i, Instruction::Store { .. }))
            .map(|(id, _)| id)
            .collect();
        let second = stores[1];
        let disjoint = stores[2];

        let storage_g1 = analysis.factory.global_node(&module, g1);
        let site_x = {
            let n = analysis.factory.node_for(&module, f, x);
            analysis.factory.arena().single_pointee(n)
        };
        let site_y = {
            let n = analysis.factory.node_for(&module, f, y);
            analysis.factory.arena().single_pointee(n)
        };
        let r1_node = analysis.factory.node_for(&module, f, r1);

        let facts = root_facts(&analysis, f);
        // The strong update kills the unique target's liveness and replaces
        // its pairs wholesale.
        assert!(!facts[second.index()].live_in.contains(storage_g1));
        assert!(facts[second.index()].live_in.contains(r1_node));
        let g1_image: Vec<NodeId> =
            facts[second.index()].points_to_out.pointees_of(storage_g1).collect();
        assert_eq!(g1_image, vec![site_y]);
        assert!(facts[second.index()].points_to_out.contains(r1_node, site_x));
        // A store through a disjoint pointer must not disturb the new value.
        assert!(facts[disjoint.index()].points_to_out.contains(storage_g1, site_y));

        let (set, _) = analysis.points_to_at(f, instr_of(r2), r2);
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec![site_y]);
    }

    #[test]
    fn weak_update_merges() {
        let mut mb = ModuleBuilder::new();
        let f = mb.declare("f", vec![Type::Int], Some(Type::ptr(Type::Int)));
        let b = mb.body(f);
        let x = b.alloca(Type::Int);
        let y = b.alloca(Type::Int);
        let w = b.alloca(Type::Int);
        let a = b.alloca(Type::ptr(Type::Int));
        let bb = b.alloca(Type::ptr(Type::Int));
        b.store(a, x);
        b.store(bb, y);
        let z = b.select(Operand::Arg(0), a, bb);
        b.store(z, w);
        let r1 = b.load(a);
        let r2 = b.load(bb);
        let r = b.select(Operand::Arg(0), r1, r2);
        b.ret(Some(r));
        let module = mb.build().unwrap();

        let mut analysis = analyze_module(&module).unwrap();
        let stores: Vec<InstrId> = module
            .procedure(f)
            .instructions()
            .filter(|(_, i)| matches!(i, Instruction::Store { .. }))
            .map(|(id, _)| id)
            .collect();
        let weak = stores[2];

        fn site(analysis: &mut Analysis<'_>, module: &Module, f: ProcId, op: Operand) -> NodeId {
            let n = analysis.factory.node_for(module, f, op);
            analysis.factory.arena().single_pointee(n)
        }
        let slot_a = site(&mut analysis, &module, f, a);
        let slot_b = site(&mut analysis, &module, f, bb);
        let site_x = site(&mut analysis, &module, f, x);
        let site_y = site(&mut analysis, &module, f, y);
        let site_w = site(&mut analysis, &module, f, w);

        let facts = root_facts(&analysis, f);
        // Nothing killed, new pairs merged in on both possible targets.
        assert!(facts[weak.index()].live_in.contains(slot_a));
        assert!(facts[weak.index()].live_in.contains(slot_b));
        let out = &facts[weak.index()].points_to_out;
        assert!(out.contains(slot_a, site_x));
        assert!(out.contains(slot_a, site_w));
        assert!(out.contains(slot_b, site_y));
        assert!(out.contains(slot_b, site_w));

        let (set1, _) = analysis.points_to_at(f, instr_of(r1), r1);
        assert_eq!(set1, [site_x, site_w].into_iter().collect());
        let (set2, _) = analysis.points_to_at(f, instr_of(r2), r2);
        assert_eq!(set2, [site_y, site_w].into_iter().collect());
    }

    fn recursive_module() -> (pt_ir::Module, ProcId) {
        let mut mb = ModuleBuilder::new();
        let f = mb.declare("fact", vec![Type::Int], Some(Type::Int));
        let b = mb.body(f);
        let base = b.add_block();
        let rec = b.add_block();
        let c = b.other(vec![Operand::Arg(0)], Some(Type::Int)).unwrap();
        b.cond_br(c, base, rec);
        b.switch_to(base);
        b.ret(Some(Operand::Const(1)));
        b.switch_to(rec);
        let m = b.other(vec![Operand::Arg(0)], Some(Type::Int)).unwrap();
        let r = b.call(Callee::Procedure(f), vec![m], Some(Type::Int)).unwrap();
        let res = b.other(vec![Operand::Arg(0), r], Some(Type::Int)).unwrap();
        b.ret(Some(res));
        (mb.build().unwrap(), f)
    }

    #[test]
    fn recursion_generalizes_to_a_cyclic_summary() {
        let (module, f) = recursive_module();
        let analysis = analyze_module(&module).unwrap();
        let cyclic: Vec<_> = analysis
            .store
            .entries(f)
            .filter(|(cs, _)| cs.is_cyclic())
            .collect();
        assert_eq!(cyclic.len(), 1);
    }

    #[test]
    fn generalized_summaries_are_idempotent() {
        let (module, f) = recursive_module();
        let mut analysis = analyze_module(&module).unwrap();
        let before: Vec<(CallString, ProcedureFacts)> =
            analysis.store.entries(f).cloned().collect();
        let (cyclic, _) = before.iter().find(|(cs, _)| cs.is_cyclic()).unwrap().clone();

        // Re-driving any literal context the cyclic summary matches leaves
        // the stored facts untouched.
        let call = module
            .procedure(f)
            .instructions()
            .find_map(|(id, i)| {
                matches!(i, Instruction::Call { .. }).then_some(crate::callstring::CallSite {
                    caller: f,
                    instr: id,
                    callee: f,
                })
            })
            .unwrap();
        let literal = CallString::empty().add_call_site(call);
        assert!(cyclic.matches(&literal));
        let entry = analysis.globals_rel.clone();
        let changed = analysis
            .drive(f, &literal, &entry, Some(&LivenessSet::new()))
            .unwrap();
        assert!(!changed);
        let after: Vec<(CallString, ProcedureFacts)> =
            analysis.store.entries(f).cloned().collect();
        assert_eq!(before, after);
    }

    #[test]
    fn fixpoint_is_stable() {
        let mut mb = ModuleBuilder::new();
        let g = mb.global("g", Type::ptr(Type::Int));
        let f = mb.declare("f", vec![], None);
        let b = mb.body(f);
        let x = b.alloca(Type::Int);
        b.store(Operand::Global(g), x);
        b.ret(None);
        let module = mb.build().unwrap();

        let mut analysis = analyze_module(&module).unwrap();
        let entry = analysis.globals_rel.clone();
        let changed = analysis.drive(f, &CallString::empty(), &entry, None).unwrap();
        assert!(!changed);
    }
}
