//! Per-procedure memoization of analysis results, indexed by call string.

use crate::callstring::CallString;
use crate::errors::{AnalysisError, AnalysisResult};
use crate::facts::{LivenessSet, PointsToRelation};
use pt_ir::ProcId;
use std::collections::BTreeMap;

/// The facts published for one instruction: liveness flowing into it and the
/// points-to relation flowing out of it. The two transient quantities
/// (liveness out, points-to in) are recomputed from neighbours and never
/// stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstrFacts {
    pub live_in: LivenessSet,
    pub points_to_out: PointsToRelation,
}

/// Facts for every instruction of a procedure, dense by instruction id.
pub type ProcedureFacts = Vec<InstrFacts>;

fn fresh_facts(n_instrs: usize) -> ProcedureFacts {
    vec![InstrFacts::default(); n_instrs]
}

/// The summary store: for each procedure, an ordered collection of
/// (call string, per-instruction facts) entries. Entries are mutated in
/// place during the fixpoint and replaced wholesale by generalization.
#[derive(Debug, Default)]
pub struct SummaryStore {
    data: BTreeMap<ProcId, Vec<(CallString, ProcedureFacts)>>,
}

impl SummaryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The entry stored for exactly `ctx`, created empty if absent.
    ///
    /// # Errors
    ///
    /// Fresh storage must never be queried with a cyclic context: cyclic
    /// entries are produced only by generalization. A literal context
    /// already covered by a generalized entry is an analysis bug as well.
    pub fn lookup_or_create(
        &mut self,
        proc: ProcId,
        ctx: &CallString,
        n_instrs: usize,
    ) -> AnalysisResult<&mut ProcedureFacts> {
        if ctx.is_cyclic() {
            return Err(AnalysisError::CyclicQuery(ctx.to_string()));
        }
        let entries = self.data.entry(proc).or_default();
        if let Some(pos) = entries
            .iter()
            .position(|(cs, _)| cs.is_cyclic() && cs.matches(ctx))
        {
            return Err(AnalysisError::Internal(format!(
                "context {ctx} is already covered by the generalized entry {}",
                entries[pos].0
            )));
        }
        let pos = match entries.iter().position(|(cs, _)| cs == ctx) {
            Some(pos) => pos,
            None => {
                entries.push((ctx.clone(), fresh_facts(n_instrs)));
                entries.len() - 1
            }
        };
        Ok(&mut entries[pos].1)
    }

    /// Replaces the facts stored for exactly `ctx`.
    pub fn publish(
        &mut self,
        proc: ProcId,
        ctx: &CallString,
        facts: ProcedureFacts,
    ) -> AnalysisResult<()> {
        let entries = self
            .data
            .get_mut(&proc)
            .ok_or_else(|| AnalysisError::Internal(format!("no entries for {proc}")))?;
        let entry = entries
            .iter_mut()
            .find(|(cs, _)| cs == ctx)
            .ok_or_else(|| AnalysisError::Internal(format!("no entry for {proc} at [{ctx}]")))?;
        entry.1 = facts;
        Ok(())
    }

    /// The widening step. Searches the non-cyclic entries for one whose
    /// context is a strict prefix of `ctx` and whose facts equal `facts`
    /// pointwise; if found, that entry's context is replaced by the cyclic
    /// context (prefix plus repeating remainder) and every other non-cyclic
    /// entry the new context matches is deleted. Once the facts are stable
    /// across one extra level of call-string extension, they are assumed
    /// stable for all further repetitions.
    ///
    /// Among several admissible prefixes the longest wins; equal lengths are
    /// broken by the lexicographic order of the stored call-site sequences,
    /// a deterministic tie-break rather than insertion order.
    pub fn attempt_generalize(
        &mut self,
        proc: ProcId,
        ctx: &CallString,
        facts: &ProcedureFacts,
    ) -> bool {
        let Some(entries) = self.data.get_mut(&proc) else {
            return false;
        };
        let mut best: Option<usize> = None;
        for (i, (cs, f)) in entries.iter().enumerate() {
            if cs.is_cyclic() || !ctx.is_non_cyclic_prefix(cs) || f != facts {
                continue;
            }
            best = match best {
                None => Some(i),
                Some(j) => {
                    let current = &entries[j].0;
                    if cs.len() > current.len() || (cs.len() == current.len() && cs < current) {
                        Some(i)
                    } else {
                        Some(j)
                    }
                }
            };
        }
        let Some(chosen) = best else {
            return false;
        };
        let cyclic = ctx.create_cyclic_from_prefix(&entries[chosen].0);
        log::debug!("generalized {proc} at [{}] into [{cyclic}]", entries[chosen].0);
        entries[chosen].0 = cyclic.clone();
        let old = std::mem::take(entries);
        for (i, entry) in old.into_iter().enumerate() {
            if i != chosen && !entry.0.is_cyclic() && cyclic.matches(&entry.0) {
                continue;
            }
            entries.push(entry);
        }
        true
    }

    /// The facts to use for a query context: a cyclic entry accepting the
    /// query exactly, an exact literal entry, or failing those the entry of
    /// the longest stored strict prefix (ties broken as in
    /// [`Self::attempt_generalize`]). `None` means "not analyzed yet" and is
    /// a normal outcome, not an error.
    #[must_use]
    pub fn longest_prefix_match(
        &self,
        proc: ProcId,
        ctx: &CallString,
    ) -> Option<&ProcedureFacts> {
        let entries = self.data.get(&proc)?;
        for (cs, facts) in entries {
            if cs.is_cyclic() && cs.matches(ctx) {
                return Some(facts);
            }
        }
        let mut best: Option<(&CallString, &ProcedureFacts)> = None;
        for (cs, facts) in entries {
            if cs.is_cyclic() {
                continue;
            }
            if cs.matches(ctx) {
                return Some(facts);
            }
            if ctx.is_non_cyclic_prefix(cs) {
                best = match best {
                    None => Some((cs, facts)),
                    Some((current, _))
                        if cs.len() > current.len()
                            || (cs.len() == current.len() && cs < current) =>
                    {
                        Some((cs, facts))
                    }
                    Some(b) => Some(b),
                };
            }
        }
        best.map(|(_, facts)| facts)
    }

    /// Whether a generalized entry already answers for this literal context.
    #[must_use]
    pub fn covered_by_cyclic(&self, proc: ProcId, ctx: &CallString) -> bool {
        self.data
            .get(&proc)
            .is_some_and(|entries| entries.iter().any(|(cs, _)| cs.is_cyclic() && cs.matches(ctx)))
    }

    #[must_use]
    pub fn has_data_for(&self, proc: ProcId) -> bool {
        self.data.get(&proc).is_some_and(|entries| !entries.is_empty())
    }

    /// Every stored (context, facts) entry of a procedure.
    pub fn entries(&self, proc: ProcId) -> impl Iterator<Item = &(CallString, ProcedureFacts)> {
        self.data.get(&proc).into_iter().flatten()
    }
}
