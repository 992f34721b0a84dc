//! Interprocedural calling contexts.
//!
//! A call string is the ordered sequence of call sites through which a
//! procedure is reached. Recursion can produce unboundedly many distinct
//! literal sequences, so a string may end with a cyclic part standing for
//! "this sub-sequence, repeated one or more times"; folding summaries into
//! cyclic strings is what makes the whole analysis terminate.

use pt_ir::{InstrId, ProcId};
use std::fmt;

/// One element of a call string: a direct call instruction together with its
/// statically known callee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CallSite {
    pub caller: ProcId,
    pub instr: InstrId,
    pub callee: ProcId,
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.caller, self.instr)
    }
}

/// A calling context: a literal call-site sequence with an optional trailing
/// cyclic part.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct CallString {
    literal: Vec<CallSite>,
    cyclic: Vec<CallSite>,
}

impl fmt::Display for CallString {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, site) in self.literal.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{site}")?;
        }
        if self.is_cyclic() {
            if !self.literal.is_empty() {
                write!(f, ", ")?;
            }
            write!(f, "[")?;
            for (i, site) in self.cyclic.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{site}")?;
            }
            write!(f, "]*")?;
        }
        Ok(())
    }
}

impl CallString {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// The context one call deeper. Pure: `self` is left untouched.
    #[must_use]
    pub fn add_call_site(&self, site: CallSite) -> Self {
        debug_assert!(!self.is_cyclic());
        let mut result = self.clone();
        result.literal.push(site);
        result
    }

    #[must_use]
    pub fn is_cyclic(&self) -> bool {
        !self.cyclic.is_empty()
    }

    /// Length of the literal part.
    #[must_use]
    pub fn len(&self) -> usize {
        self.literal.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.literal.is_empty() && self.cyclic.is_empty()
    }

    /// Whether `other`'s literal sequence is a strict, non-cyclic prefix of
    /// this one.
    #[must_use]
    pub fn is_non_cyclic_prefix(&self, other: &Self) -> bool {
        if other.is_cyclic() || other.literal.len() >= self.literal.len() {
            return false;
        }
        self.literal.starts_with(&other.literal)
    }

    /// The context equal to `prefix` with the remainder of `self` (relative
    /// to `prefix`) installed as its cyclic part.
    #[must_use]
    pub fn create_cyclic_from_prefix(&self, prefix: &Self) -> Self {
        debug_assert!(self.is_non_cyclic_prefix(prefix));
        Self {
            literal: prefix.literal.clone(),
            cyclic: self.literal[prefix.literal.len()..].to_vec(),
        }
    }

    /// Structural acceptance of a literal candidate context: the candidate
    /// must start with this string's literal part, and the remaining suffix
    /// must consist of zero or more exact, whole repetitions of the cyclic
    /// part (none for a non-cyclic string).
    #[must_use]
    pub fn matches(&self, candidate: &Self) -> bool {
        if !candidate.literal.starts_with(&self.literal) {
            return false;
        }
        let mut rest = &candidate.literal[self.literal.len()..];
        if !self.is_cyclic() {
            return rest.is_empty();
        }
        while !rest.is_empty() {
            if !rest.starts_with(&self.cyclic) {
                // A different element, or an incomplete repetition at the end.
                return false;
            }
            rest = &rest[self.cyclic.len()..];
        }
        true
    }

    /// Whether the context reaches `proc` more than once. Any occurrence in
    /// the cyclic part counts: the part denotes one or more repetitions.
    #[must_use]
    pub fn reaches_more_than_once(&self, proc: ProcId) -> bool {
        if self.cyclic.iter().any(|s| s.callee == proc) {
            return true;
        }
        self.literal.iter().filter(|s| s.callee == proc).count() >= 2
    }
}
