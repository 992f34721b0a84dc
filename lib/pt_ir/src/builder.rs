//! Programmatic construction of modules.
//!
//! Procedures are declared first (so mutually recursive calls can name their
//! callee), then filled in through [`ProcedureBuilder`]. [`ModuleBuilder::build`]
//! validates the result before handing it out.

use crate::errors::IrResult;
use crate::instrs::{Callee, FieldIndex, Instruction, Operand};
use crate::types::Type;
use crate::{Block, BlockId, Global, GlobalId, InstrId, Module, ProcId, Procedure};

#[derive(Debug, Default)]
pub struct ModuleBuilder {
    globals: Vec<Global>,
    sigs: Vec<(String, Vec<Type>, Option<Type>)>,
    bodies: Vec<ProcedureBuilder>,
}

impl ModuleBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a module global holding a value of type `ty`.
    pub fn global(&mut self, name: &str, ty: Type) -> GlobalId {
        self.globals.push(Global { name: name.to_string(), ty });
        GlobalId::new(self.globals.len() - 1)
    }

    /// Declares a procedure. Its body starts with a single empty entry block.
    pub fn declare(&mut self, name: &str, params: Vec<Type>, ret: Option<Type>) -> ProcId {
        self.sigs.push((name.to_string(), params, ret));
        self.bodies.push(ProcedureBuilder::new());
        ProcId::new(self.sigs.len() - 1)
    }

    /// The body builder of a declared procedure.
    pub fn body(&mut self, id: ProcId) -> &mut ProcedureBuilder {
        &mut self.bodies[id.idx()]
    }

    /// Assembles and validates the module.
    ///
    /// # Errors
    ///
    /// Returns the first structural violation found (see [`Module::validate`]).
    pub fn build(self) -> IrResult<Module> {
        let procedures = self
            .sigs
            .into_iter()
            .zip(self.bodies)
            .map(|((name, params, ret), body)| Procedure {
                name,
                params,
                ret,
                instrs: body.instrs,
                blocks: body.blocks.into_iter().map(|instrs| Block { instrs }).collect(),
            })
            .collect();
        let module = Module { globals: self.globals, procedures };
        module.validate()?;
        log::debug!(
            "built module: {} globals, {} procedures",
            module.globals.len(),
            module.procedures.len()
        );
        Ok(module)
    }
}

#[derive(Debug)]
pub struct ProcedureBuilder {
    instrs: Vec<Instruction>,
    blocks: Vec<Vec<InstrId>>,
    current: usize,
}

impl ProcedureBuilder {
    fn new() -> Self {
        Self { instrs: Vec::new(), blocks: vec![Vec::new()], current: 0 }
    }

    /// Appends a fresh empty block without switching to it.
    pub fn add_block(&mut self) -> BlockId {
        self.blocks.push(Vec::new());
        BlockId::new(self.blocks.len() - 1)
    }

    /// Makes `block` the insertion point.
    pub fn switch_to(&mut self, block: BlockId) {
        self.current = block.index();
    }

    /// Appends an instruction to the current block.
    pub fn push(&mut self, instr: Instruction) -> InstrId {
        let id = InstrId::new(self.instrs.len());
        self.instrs.push(instr);
        self.blocks[self.current].push(id);
        id
    }

    pub fn alloca(&mut self, ty: Type) -> Operand {
        Operand::Instr(self.push(Instruction::Alloca { ty }))
    }

    pub fn load(&mut self, ptr: Operand) -> Operand {
        Operand::Instr(self.push(Instruction::Load { ptr }))
    }

    pub fn store(&mut self, ptr: Operand, value: Operand) {
        self.push(Instruction::Store { ptr, value });
    }

    pub fn field(&mut self, base: Operand, indices: Vec<FieldIndex>) -> Operand {
        Operand::Instr(self.push(Instruction::Field { base, indices }))
    }

    /// Field projection along a statically known index path.
    pub fn field_const(&mut self, base: Operand, indices: &[u64]) -> Operand {
        self.field(base, indices.iter().copied().map(FieldIndex::Const).collect())
    }

    pub fn cast(&mut self, value: Operand, ty: Type) -> Operand {
        Operand::Instr(self.push(Instruction::Cast { value, ty }))
    }

    pub fn phi(&mut self, incomings: Vec<Operand>) -> Operand {
        Operand::Instr(self.push(Instruction::Phi { incomings }))
    }

    pub fn select(&mut self, cond: Operand, if_true: Operand, if_false: Operand) -> Operand {
        Operand::Instr(self.push(Instruction::Select { cond, if_true, if_false }))
    }

    /// Appends a call; returns the result operand when the call produces one.
    pub fn call(&mut self, callee: Callee, args: Vec<Operand>, ty: Option<Type>) -> Option<Operand> {
        let has_result = ty.is_some();
        let id = self.push(Instruction::Call { callee, args, ty });
        has_result.then_some(Operand::Instr(id))
    }

    pub fn other(&mut self, operands: Vec<Operand>, ty: Option<Type>) -> Option<Operand> {
        let has_result = ty.is_some();
        let id = self.push(Instruction::Other { operands, ty });
        has_result.then_some(Operand::Instr(id))
    }

    pub fn ret(&mut self, value: Option<Operand>) {
        self.push(Instruction::Return { value });
    }

    pub fn br(&mut self, target: BlockId) {
        self.push(Instruction::Branch { cond: None, targets: vec![target] });
    }

    pub fn cond_br(&mut self, cond: Operand, if_true: BlockId, if_false: BlockId) {
        self.push(Instruction::Branch { cond: Some(cond), targets: vec![if_true, if_false] });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::IrError;

    #[test]
    fn straight_line() {
        let mut mb = ModuleBuilder::new();
        let p = mb.declare("main", vec![], None);
        let b = mb.body(p);
        let slot = b.alloca(Type::Int);
        b.store(slot, Operand::Const(1));
        let v = b.load(slot);
        let _ = v;
        b.ret(None);
        let module = mb.build().unwrap();
        let proc = module.procedure(p);
        assert_eq!(proc.n_instrs(), 4);
        assert_eq!(proc.n_blocks(), 1);
    }

    #[test]
    fn missing_terminator() {
        let mut mb = ModuleBuilder::new();
        let p = mb.declare("f", vec![], None);
        mb.body(p).alloca(Type::Int);
        assert!(matches!(mb.build(), Err(IrError::MissingTerminator { .. })));
    }

    #[test]
    fn arity_checked() {
        let mut mb = ModuleBuilder::new();
        let f = mb.declare("f", vec![Type::ptr(Type::Int)], None);
        let g = mb.declare("g", vec![], None);
        mb.body(f).ret(None);
        let b = mb.body(g);
        b.call(Callee::Procedure(f), vec![], None);
        b.ret(None);
        assert!(matches!(mb.build(), Err(IrError::ArityMismatch { .. })));
    }

    #[test]
    fn result_types() {
        let mut mb = ModuleBuilder::new();
        let p = mb.declare("f", vec![], None);
        let b = mb.body(p);
        let slot = b.alloca(Type::Struct(vec![Type::Int, Type::ptr(Type::Int)]));
        let fld = b.field_const(slot, &[0, 1]);
        let _ = fld;
        b.ret(None);
        let module = mb.build().unwrap();
        let proc = module.procedure(p);
        assert_eq!(proc.type_of(&module, fld), Some(Type::ptr(Type::ptr(Type::Int))));
        assert_eq!(
            proc.type_of(&module, slot),
            Some(Type::ptr(Type::Struct(vec![Type::Int, Type::ptr(Type::Int)])))
        );
    }
}
