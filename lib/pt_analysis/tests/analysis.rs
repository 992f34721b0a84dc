//! End-to-end properties of the whole-module analysis.

use pt_analysis::{analyze_module, AliasKind};
use pt_ir::builder::ModuleBuilder;
use pt_ir::instrs::{Callee, Operand};
use pt_ir::types::Type;
use pt_ir::{Module, ProcId};

fn recursive_module() -> (Module, ProcId) {
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

#[test_log::test]
fn direct_recursion_terminates() {
    let (module, _) = recursive_module();
    let analysis = analyze_module(&module).unwrap();
    assert!(analysis.driver_invocations() < 100);
}

#[test_log::test]
fn mutual_recursion_terminates() {
    let mut mb = ModuleBuilder::new();
    let even = mb.declare("even", vec![Type::Int], Some(Type::Int));
    let odd = mb.declare("odd", vec![Type::Int], Some(Type::Int));
    for (this, other) in [(even, odd), (odd, even)] {
        let b = mb.body(this);
        let base = b.add_block();
        let rec = b.add_block();
        let c = b.other(vec![Operand::Arg(0)], Some(Type::Int)).unwrap();
        b.cond_br(c, base, rec);
        b.switch_to(base);
        b.ret(Some(Operand::Const(0)));
        b.switch_to(rec);
        let m = b.other(vec![Operand::Arg(0)], Some(Type::Int)).unwrap();
        let r = b.call(Callee::Procedure(other), vec![m], Some(Type::Int)).unwrap();
        b.ret(Some(r));
    }
    let module = mb.build().unwrap();
    let analysis = analyze_module(&module).unwrap();
    assert!(analysis.driver_invocations() < 200);
}

#[test_log::test]
fn same_global_must_alias() {
    let mut mb = ModuleBuilder::new();
    let g = mb.global("counter", Type::Int);
    let f = mb.declare("f", vec![], None);
    let b = mb.body(f);
    let c = b.cast(Operand::Global(g), Type::ptr(Type::Int));
    b.ret(None);
    let module = mb.build().unwrap();

    let Operand::Instr(at) = c else { unreachable!() };
    let mut analysis = analyze_module(&module).unwrap();
    assert_eq!(analysis.alias_at(f, at, Operand::Global(g), c), AliasKind::Must);
}

#[test_log::test]
fn field_and_aggregate_partially_alias() {
    let mut mb = ModuleBuilder::new();
    let f = mb.declare("f", vec![], None);
    let b = mb.body(f);
    let x = b.alloca(Type::Struct(vec![Type::Int, Type::Int]));
    let fl = b.field_const(x, &[0, 1]);
    b.ret(None);
    let module = mb.build().unwrap();

    let Operand::Instr(at) = fl else { unreachable!() };
    let mut analysis = analyze_module(&module).unwrap();
    assert_eq!(analysis.alias_at(f, at, x, fl), AliasKind::Partial);
}

#[test_log::test]
fn distinct_allocations_never_alias() {
    let mut mb = ModuleBuilder::new();
    let f = mb.declare("f", vec![], None);
    let b = mb.body(f);
    let x = b.alloca(Type::Int);
    let y = b.alloca(Type::Int);
    b.ret(None);
    let module = mb.build().unwrap();

    let Operand::Instr(at) = y else { unreachable!() };
    let mut analysis = analyze_module(&module).unwrap();
    assert_eq!(analysis.alias_at(f, at, x, y), AliasKind::No);
}

#[test_log::test]
fn external_pointer_may_alias_local() {
    let mut mb = ModuleBuilder::new();
    let f = mb.declare("f", vec![], Some(Type::Int));
    let b = mb.body(f);
    let x = b.alloca(Type::Int);
    let p = b
        .call(
            Callee::External { name: "input".to_string(), no_alias_result: false },
            vec![],
            Some(Type::ptr(Type::Int)),
        )
        .unwrap();
    let r = b.load(p);
    b.ret(Some(r));
    let module = mb.build().unwrap();

    let Operand::Instr(at) = p else { unreachable!() };
    let mut analysis = analyze_module(&module).unwrap();
    assert_eq!(analysis.alias_at(f, at, p, x), AliasKind::May);
}

#[test_log::test]
fn allocator_results_are_fresh() {
    let mut mb = ModuleBuilder::new();
    let f = mb.declare("f", vec![], Some(Type::Int));
    let b = mb.body(f);
    let x = b.alloca(Type::Int);
    let p = b
        .call(
            Callee::External { name: "alloc".to_string(), no_alias_result: true },
            vec![],
            Some(Type::ptr(Type::Int)),
        )
        .unwrap();
    let r = b.load(p);
    b.ret(Some(r));
    let module = mb.build().unwrap();

    let Operand::Instr(at) = p else { unreachable!() };
    let mut analysis = analyze_module(&module).unwrap();
    assert_eq!(analysis.alias_at(f, at, p, x), AliasKind::No);
}
