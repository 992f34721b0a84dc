//! Representation errors definition.

use thiserror::Error;

pub type IrResult<T> = Result<T, IrError>;

#[derive(Debug, Error)]
pub enum IrError {
    #[error("procedure {0} has no blocks")]
    NoBlocks(String),

    #[error("block b{block} of procedure {proc} is empty")]
    EmptyBlock { proc: String, block: usize },

    #[error("block b{block} of procedure {proc} does not end with a terminator")]
    MissingTerminator { proc: String, block: usize },

    #[error("terminator in the middle of block b{block} of procedure {proc}")]
    EarlyTerminator { proc: String, block: usize },

    #[error("branch to unknown block b{target} in procedure {proc}")]
    BadBlockTarget { proc: String, target: usize },

    #[error("invalid operand reference {operand} in procedure {proc}")]
    BadOperand { proc: String, operand: String },

    #[error("call to {callee} with {found} arguments, expected {expected}")]
    ArityMismatch { callee: String, expected: usize, found: usize },

    #[error("{mnemonic} in procedure {proc} expects a pointer operand")]
    PointerExpected { proc: String, mnemonic: &'static str },

    #[error("return value of procedure {proc} does not match its signature")]
    ReturnMismatch { proc: String },
}
