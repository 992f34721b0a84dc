//! This crate provides the program representation consumed by the `PtWorks`
//! analyses: typed values, instructions grouped in basic blocks with explicit
//! branch targets, procedures and globals, together with a programmatic
//! builder.
//!
//! Construction of this representation from program text is out of scope:
//! a front end hands the analyses a validated [`Module`].

pub mod builder;
pub mod errors;
pub mod instrs;
pub mod types;

use crate::errors::{IrError, IrResult};
use crate::instrs::{Callee, FieldIndex, Instruction, Operand};
use crate::types::Type;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroUsize;

/// Unique id to identify a procedure in a module.
#[derive(Debug, Clone, Copy, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize)]
pub struct ProcId(NonZeroUsize);

impl ProcId {
    pub(crate) fn new(idx: usize) -> Self {
        Self(NonZeroUsize::new(idx + 1).expect("just incremented, cannot be 0"))
    }

    #[must_use]
    pub fn idx(self) -> usize {
        self.0.get() - 1
    }
}

impl fmt::Display for ProcId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "p{}", self.idx())
    }
}

/// Unique id to identify a global in a module.
#[derive(Debug, Clone, Copy, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize)]
pub struct GlobalId(NonZeroUsize);

impl GlobalId {
    pub(crate) fn new(idx: usize) -> Self {
        Self(NonZeroUsize::new(idx + 1).expect("just incremented, cannot be 0"))
    }

    #[must_use]
    pub fn idx(self) -> usize {
        self.0.get() - 1
    }
}

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "g{}", self.idx())
    }
}

/// Index of an instruction inside its procedure.
#[derive(Debug, Clone, Copy, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize)]
pub struct InstrId(u32);

impl InstrId {
    pub(crate) const fn new(idx: usize) -> Self {
        Self(idx as u32)
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for InstrId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a basic block inside its procedure.
#[derive(Debug, Clone, Copy, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize)]
pub struct BlockId(u32);

impl BlockId {
    pub(crate) const fn new(idx: usize) -> Self {
        Self(idx as u32)
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A module global. The global names a storage location; referring to it
/// from an instruction yields its address.
#[derive(Debug, Clone, Serialize)]
pub struct Global {
    name: String,
    ty: Type,
}

impl Global {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The type of the stored value.
    #[must_use]
    pub fn ty(&self) -> &Type {
        &self.ty
    }
}

/// A basic block: a maximal sequence of instructions entered at its first
/// instruction and left through the terminator of its last.
#[derive(Debug, Clone, Serialize)]
pub struct Block {
    instrs: Vec<InstrId>,
}

impl Block {
    #[must_use]
    pub fn instr_ids(&self) -> &[InstrId] {
        &self.instrs
    }

    #[must_use]
    pub fn first(&self) -> InstrId {
        *self.instrs.first().expect("blocks are never empty")
    }

    #[must_use]
    pub fn last(&self) -> InstrId {
        *self.instrs.last().expect("blocks are never empty")
    }
}

/// A procedure with a body. Instruction ids are dense indices into the
/// instruction table; block 0 is the entry block.
#[derive(Debug, Clone, Serialize)]
pub struct Procedure {
    name: String,
    params: Vec<Type>,
    ret: Option<Type>,
    instrs: Vec<Instruction>,
    blocks: Vec<Block>,
}

impl Procedure {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn params(&self) -> &[Type] {
        &self.params
    }

    #[must_use]
    pub fn ret(&self) -> Option<&Type> {
        self.ret.as_ref()
    }

    #[must_use]
    pub fn n_instrs(&self) -> usize {
        self.instrs.len()
    }

    #[must_use]
    pub fn instr(&self, id: InstrId) -> &Instruction {
        &self.instrs[id.index()]
    }

    pub fn instructions(&self) -> impl Iterator<Item = (InstrId, &Instruction)> {
        self.instrs.iter().enumerate().map(|(i, instr)| (InstrId::new(i), instr))
    }

    #[must_use]
    pub fn n_blocks(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn blocks(&self) -> impl Iterator<Item = (BlockId, &Block)> {
        self.blocks.iter().enumerate().map(|(i, b)| (BlockId::new(i), b))
    }

    #[must_use]
    pub fn entry_block(&self) -> BlockId {
        BlockId::new(0)
    }

    /// Number of syntactic uses of every operand of the procedure.
    #[must_use]
    pub fn use_counts(&self) -> BTreeMap<Operand, usize> {
        let mut counts = BTreeMap::new();
        for instr in &self.instrs {
            for op in instr.operands() {
                *counts.entry(op).or_insert(0) += 1;
            }
        }
        counts
    }

    /// The type of the value an instruction produces, if any.
    #[must_use]
    pub fn result_type(&self, module: &Module, id: InstrId) -> Option<Type> {
        match self.instr(id) {
            Instruction::Alloca { ty } => Some(Type::ptr(ty.clone())),
            Instruction::Load { ptr } => {
                self.type_of(module, *ptr).and_then(|t| t.pointee().cloned())
            }
            Instruction::Field { base, indices } => {
                let base_ty = self.type_of(module, *base)?;
                let mut t = base_ty.pointee()?;
                // The first index steps over the pointer itself and does not
                // change the type; the remaining ones descend into the
                // aggregate.
                for index in indices.iter().skip(1) {
                    t = match index {
                        FieldIndex::Const(i) => t.field(*i)?,
                        FieldIndex::Dynamic(_) => t.element()?,
                    };
                }
                Some(Type::ptr(t.clone()))
            }
            Instruction::Cast { ty, .. } => Some(ty.clone()),
            Instruction::Phi { incomings } => {
                incomings.first().and_then(|op| self.type_of(module, *op))
            }
            Instruction::Select { if_true, .. } => self.type_of(module, *if_true),
            Instruction::Call { ty, .. } | Instruction::Other { ty, .. } => ty.clone(),
            Instruction::Store { .. } | Instruction::Return { .. } | Instruction::Branch { .. } => {
                None
            }
        }
    }

    /// The type of an operand, if it is statically known. `Undef` has no
    /// type; constants are plain integers.
    #[must_use]
    pub fn type_of(&self, module: &Module, op: Operand) -> Option<Type> {
        match op {
            Operand::Instr(id) => self.result_type(module, id),
            Operand::Arg(i) => self.params.get(i).cloned(),
            Operand::Global(g) => Some(Type::ptr(module.global(g).ty().clone())),
            Operand::Const(_) => Some(Type::Int),
            Operand::Undef => None,
        }
    }
}

/// A whole program: globals and procedures.
#[derive(Debug, Clone, Serialize)]
pub struct Module {
    globals: Vec<Global>,
    procedures: Vec<Procedure>,
}

impl Module {
    #[must_use]
    pub fn global(&self, id: GlobalId) -> &Global {
        &self.globals[id.idx()]
    }

    pub fn globals(&self) -> impl Iterator<Item = (GlobalId, &Global)> {
        self.globals.iter().enumerate().map(|(i, g)| (GlobalId::new(i), g))
    }

    #[must_use]
    pub fn procedure(&self, id: ProcId) -> &Procedure {
        &self.procedures[id.idx()]
    }

    pub fn procedures(&self) -> impl Iterator<Item = (ProcId, &Procedure)> {
        self.procedures.iter().enumerate().map(|(i, p)| (ProcId::new(i), p))
    }

    /// Checks the structural contract every analysis relies on.
    ///
    /// # Errors
    ///
    /// Returns the first violation found: empty or unterminated blocks,
    /// dangling block targets or operand references, and call-arity
    /// mismatches against known callees.
    pub fn validate(&self) -> IrResult<()> {
        for proc in &self.procedures {
            self.validate_procedure(proc)?;
        }
        Ok(())
    }

    fn validate_procedure(&self, proc: &Procedure) -> IrResult<()> {
        if proc.blocks.is_empty() {
            return Err(IrError::NoBlocks(proc.name.clone()));
        }
        for (b, block) in proc.blocks.iter().enumerate() {
            let Some((last, rest)) = block.instrs.split_last() else {
                return Err(IrError::EmptyBlock { proc: proc.name.clone(), block: b });
            };
            if !proc.instr(*last).is_terminator() {
                return Err(IrError::MissingTerminator { proc: proc.name.clone(), block: b });
            }
            if rest.iter().any(|id| proc.instr(*id).is_terminator()) {
                return Err(IrError::EarlyTerminator { proc: proc.name.clone(), block: b });
            }
        }
        for instr in &proc.instrs {
            for op in instr.operands() {
                self.validate_operand(proc, instr, op)?;
            }
            match instr {
                Instruction::Branch { targets, .. } => {
                    for t in targets {
                        if t.index() >= proc.blocks.len() {
                            return Err(IrError::BadBlockTarget {
                                proc: proc.name.clone(),
                                target: t.index(),
                            });
                        }
                    }
                }
                Instruction::Call { callee: Callee::Procedure(p), args, .. } => {
                    let callee = self.procedure(*p);
                    if callee.params.len() != args.len() {
                        return Err(IrError::ArityMismatch {
                            callee: callee.name.clone(),
                            expected: callee.params.len(),
                            found: args.len(),
                        });
                    }
                }
                Instruction::Load { ptr } | Instruction::Store { ptr, .. } => {
                    self.expect_pointer(proc, instr, *ptr)?;
                }
                Instruction::Field { base, indices } => {
                    if indices.is_empty() {
                        return Err(IrError::BadOperand {
                            proc: proc.name.clone(),
                            operand: "field access without indices".to_string(),
                        });
                    }
                    self.expect_pointer(proc, instr, *base)?;
                }
                Instruction::Return { value } => {
                    if value.is_some() != proc.ret.is_some() {
                        return Err(IrError::ReturnMismatch { proc: proc.name.clone() });
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn validate_operand(&self, proc: &Procedure, instr: &Instruction, op: Operand) -> IrResult<()> {
        let ok = match op {
            Operand::Instr(id) => {
                id.index() < proc.instrs.len() && proc.instr(id).has_result()
            }
            Operand::Arg(i) => i < proc.params.len(),
            Operand::Global(g) => g.idx() < self.globals.len(),
            Operand::Const(_) | Operand::Undef => true,
        };
        if ok {
            Ok(())
        } else {
            Err(IrError::BadOperand {
                proc: proc.name.clone(),
                operand: format!("{op} (in `{instr}`)"),
            })
        }
    }

    fn expect_pointer(&self, proc: &Procedure, instr: &Instruction, op: Operand) -> IrResult<()> {
        // An undefined pointer is accepted: loading through it produces an
        // unknown value rather than a malformed module.
        match proc.type_of(self, op) {
            Some(t) if !t.is_pointer() => Err(IrError::PointerExpected {
                proc: proc.name.clone(),
                mnemonic: instr.mnemonic(),
            }),
            _ => Ok(()),
        }
    }
}
