//! This crate provides the liveness-based points-to analysis of the
//! `PtWorks` project: a flow-, context- and field-sensitive may-point-to
//! computation, co-computed with a backward liveness analysis that prunes
//! facts nobody will ever ask about.

pub mod alias;
pub mod callstring;
pub mod controlflow;
pub mod errors;
pub mod facts;
pub mod node;
pub mod solver;
pub mod store;

pub use crate::alias::AliasKind;
pub use crate::errors::{AnalysisError, AnalysisResult};
pub use crate::solver::{analyze_module, Analysis};
