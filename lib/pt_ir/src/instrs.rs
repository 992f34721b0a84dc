//! Instruction definitions.

use crate::types::Type;
use crate::{BlockId, GlobalId, InstrId, ProcId};
use serde::Serialize;
use std::fmt;

/// A reference to a value usable as an instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Operand {
    /// The result of another instruction of the same procedure.
    Instr(InstrId),
    /// A formal parameter of the enclosing procedure.
    Arg(usize),
    /// The address of a module global.
    Global(GlobalId),
    /// An integer constant.
    Const(i64),
    /// An undefined value.
    Undef,
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Instr(id) => write!(f, "%{id}"),
            Self::Arg(i) => write!(f, "arg{i}"),
            Self::Global(g) => write!(f, "@{g}"),
            Self::Const(c) => write!(f, "{c}"),
            Self::Undef => write!(f, "undef"),
        }
    }
}

/// A single index of a field projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum FieldIndex {
    /// A statically known constant index.
    Const(u64),
    /// A computed index.
    Dynamic(Operand),
}

impl fmt::Display for FieldIndex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Const(i) => write!(f, "{i}"),
            Self::Dynamic(op) => write!(f, "{op}"),
        }
    }
}

/// The target of a call instruction. Only statically resolved callees exist
/// in this representation: an indirect call cannot be expressed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Callee {
    /// A procedure defined in the module.
    Procedure(ProcId),
    /// An external routine known only by name. When `no_alias_result` is
    /// set, the routine is an allocator: its result never aliases any
    /// location it did not itself create.
    External { name: String, no_alias_result: bool },
}

impl fmt::Display for Callee {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Procedure(p) => write!(f, "{p}"),
            Self::External { name, .. } => write!(f, "{name}"),
        }
    }
}

/// A single instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Instruction {
    /// Reserves a fresh stack slot and produces its address.
    Alloca { ty: Type },
    /// Reads the value `ptr` refers to.
    Load { ptr: Operand },
    /// Overwrites the value `ptr` refers to.
    Store { ptr: Operand, value: Operand },
    /// Produces the address of a member of the aggregate `base` refers to.
    Field { base: Operand, indices: Vec<FieldIndex> },
    /// Reinterprets `value` at another type without changing its referent.
    Cast { value: Operand, ty: Type },
    /// Merges one value per predecessor block.
    Phi { incomings: Vec<Operand> },
    /// Chooses between two values depending on a condition.
    Select { cond: Operand, if_true: Operand, if_false: Operand },
    /// Transfers control to a statically known callee.
    Call { callee: Callee, args: Vec<Operand>, ty: Option<Type> },
    /// Leaves the procedure.
    Return { value: Option<Operand> },
    /// Transfers control to one of `targets`. An unconditional branch has a
    /// single target and no condition.
    Branch { cond: Option<Operand>, targets: Vec<BlockId> },
    /// Any instruction without a memory interpretation (arithmetic,
    /// comparisons, ...). Produces a result iff `ty` is set.
    Other { operands: Vec<Operand>, ty: Option<Type> },
}

impl Instruction {
    #[must_use]
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Self::Alloca { .. } => "alloca",
            Self::Load { .. } => "load",
            Self::Store { .. } => "store",
            Self::Field { .. } => "field",
            Self::Cast { .. } => "cast",
            Self::Phi { .. } => "phi",
            Self::Select { .. } => "select",
            Self::Call { .. } => "call",
            Self::Return { .. } => "ret",
            Self::Branch { .. } => "br",
            Self::Other { .. } => "op",
        }
    }

    /// Whether the instruction produces a value.
    #[must_use]
    pub fn has_result(&self) -> bool {
        match self {
            Self::Alloca { .. }
            | Self::Load { .. }
            | Self::Field { .. }
            | Self::Cast { .. }
            | Self::Phi { .. }
            | Self::Select { .. } => true,
            Self::Call { ty, .. } | Self::Other { ty, .. } => ty.is_some(),
            Self::Store { .. } | Self::Return { .. } | Self::Branch { .. } => false,
        }
    }

    #[must_use]
    pub fn is_terminator(&self) -> bool {
        matches!(self, Self::Return { .. } | Self::Branch { .. })
    }

    /// Every value operand of the instruction, in syntactic order.
    #[must_use]
    pub fn operands(&self) -> Vec<Operand> {
        match self {
            Self::Alloca { .. } => vec![],
            Self::Load { ptr } => vec![*ptr],
            Self::Store { ptr, value } => vec![*ptr, *value],
            Self::Field { base, indices } => {
                let mut ops = vec![*base];
                for index in indices {
                    if let FieldIndex::Dynamic(op) = index {
                        ops.push(*op);
                    }
                }
                ops
            }
            Self::Cast { value, .. } => vec![*value],
            Self::Phi { incomings } => incomings.clone(),
            Self::Select { cond, if_true, if_false } => vec![*cond, *if_true, *if_false],
            Self::Call { args, .. } => args.clone(),
            Self::Return { value } => value.iter().copied().collect(),
            Self::Branch { cond, .. } => cond.iter().copied().collect(),
            Self::Other { operands, .. } => operands.clone(),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.mnemonic())?;
        match self {
            Self::Alloca { ty } => write!(f, " {ty}"),
            Self::Field { base, indices } => {
                write!(f, " {base}")?;
                for index in indices {
                    write!(f, "[{index}]")?;
                }
                Ok(())
            }
            Self::Cast { value, ty } => write!(f, " {value} to {ty}"),
            Self::Call { callee, args, .. } => {
                write!(f, " {callee}(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ")")
            }
            Self::Branch { cond, targets } => {
                if let Some(c) = cond {
                    write!(f, " {c}")?;
                }
                for t in targets {
                    write!(f, " b{t}")?;
                }
                Ok(())
            }
            _ => {
                for op in self.operands() {
                    write!(f, " {op}")?;
                }
                Ok(())
            }
        }
    }
}
