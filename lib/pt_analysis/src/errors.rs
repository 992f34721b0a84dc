//! Analysis errors definition.

use pt_ir::errors::IrError;
use thiserror::Error;

pub type AnalysisResult<T> = Result<T, AnalysisError>;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("internal error: {0}")]
    Internal(String),

    #[error("representation error: {0}")]
    Ir(#[from] IrError),

    #[error("fresh summary storage queried with a cyclic call string: {0}")]
    CyclicQuery(String),

    #[error("call to {callee} with {found} arguments, expected {expected}")]
    ArityMismatch { callee: String, expected: usize, found: usize },
}
