//! End-to-end interpreter scenarios
//!
//! Each test assembles the bytecode a front end would emit for a small
//! program and runs it on a fresh VM, checking the observable result:
//! closure capture by reference, prototype lookup, string interning
//! equality, and the arity error contract.

use swiftlang_runtime::{
    Chunk, ErrorKind, Function, HeapData, OpCode, Value, Vm,
};

fn script(vm: &mut Vm, chunk: Chunk) -> swiftlang_runtime::Handle {
    let name = vm.strings.intern("<script>");
    let function = Function::new(name, 0, chunk);
    vm.alloc(HeapData::Function(function)).unwrap()
}

/// var c = 0
/// fn inc() { c = c + 1; return c }
/// inc(); inc(); inc()  => 3
///
/// The counter lives as a stack local of `outer` and is captured by
/// reference; after `outer` returns, the closed-over cell keeps mutating
/// across calls.
#[test]
fn test_closures_capture_by_reference() {
    let mut vm = Vm::new();

    // inc: upvalue 0 is the shared counter cell.
    let inc_name = vm.strings.intern("inc");
    let mut inc_chunk = Chunk::new();
    inc_chunk.write_op(OpCode::GetUpvalue, 2);
    inc_chunk.write_byte(0, 2);
    inc_chunk.emit_constant(Value::Number(1.0), 2);
    inc_chunk.write_op(OpCode::Add, 2);
    inc_chunk.write_op(OpCode::SetUpvalue, 2);
    inc_chunk.write_byte(0, 2);
    inc_chunk.write_op(OpCode::Return, 2);
    let mut inc_fn = Function::new(inc_name, 0, inc_chunk);
    inc_fn.upvalue_count = 1;
    let inc_h = vm.alloc(HeapData::Function(inc_fn)).unwrap();

    // outer: local slot 1 holds c = 0, the closure captures it.
    let outer_name = vm.strings.intern("outer");
    let mut outer_chunk = Chunk::new();
    outer_chunk.emit_constant(Value::Number(0.0), 1);
    let inc_idx = outer_chunk.add_constant(Value::Function(inc_h)) as u8;
    outer_chunk.write_op(OpCode::Closure, 1);
    outer_chunk.write_byte(inc_idx, 1);
    outer_chunk.write_byte(1, 1); // is_local
    outer_chunk.write_byte(1, 1); // slot of c
    outer_chunk.write_op(OpCode::Return, 1);
    let outer_fn = Function::new(outer_name, 0, outer_chunk);
    let outer_h = vm.alloc(HeapData::Function(outer_fn)).unwrap();

    let inc_global = Value::Str(vm.strings.intern("inc"));
    let mut chunk = Chunk::new();
    let outer_idx = chunk.add_constant(Value::Function(outer_h)) as u8;
    let inc_name_idx = chunk.add_constant(inc_global) as u8;
    chunk.write_op(OpCode::Closure, 1);
    chunk.write_byte(outer_idx, 1);
    chunk.write_op(OpCode::Call, 1);
    chunk.write_byte(0, 1);
    chunk.write_op(OpCode::DefineGlobal, 1);
    chunk.write_byte(inc_name_idx, 1);
    for line in [3, 3] {
        chunk.write_op(OpCode::GetGlobal, line);
        chunk.write_byte(inc_name_idx, line);
        chunk.write_op(OpCode::Call, line);
        chunk.write_byte(0, line);
        chunk.write_op(OpCode::Pop, line);
    }
    chunk.write_op(OpCode::GetGlobal, 3);
    chunk.write_byte(inc_name_idx, 3);
    chunk.write_op(OpCode::Call, 3);
    chunk.write_byte(0, 3);
    chunk.write_op(OpCode::Return, 3);

    let handle = script(&mut vm, chunk);
    assert_eq!(vm.interpret(handle).unwrap(), Value::Number(3.0));
}

/// var a = []
/// a.push(10); a.push(20)
/// a.length  => 2
///
/// `push` is found on the Array prototype, not on the object itself.
#[test]
fn test_prototype_lookup_through_array_methods() {
    let mut vm = Vm::new();
    let push = Value::Str(vm.strings.intern("push"));
    let length = Value::Str(vm.strings.intern("length"));
    let mut chunk = Chunk::new();
    let push_idx = chunk.add_constant(push) as u8;
    let length_idx = chunk.add_constant(length) as u8;

    chunk.write_op(OpCode::BuildArray, 1);
    chunk.write_byte(0, 1);
    for (value, line) in [(10.0, 2), (20.0, 2)] {
        chunk.write_op(OpCode::Dup, line);
        chunk.emit_constant(Value::Number(value), line);
        chunk.write_op(OpCode::MethodCall, line);
        chunk.write_byte(1, line);
        chunk.write_byte(push_idx, line);
        chunk.write_op(OpCode::Pop, line);
    }
    chunk.write_op(OpCode::GetProperty, 3);
    chunk.write_byte(length_idx, 3);
    chunk.write_op(OpCode::Return, 3);

    let handle = script(&mut vm, chunk);
    assert_eq!(vm.interpret(handle).unwrap(), Value::Number(2.0));
}

/// var a = "foo"
/// var b = "fo" + "o"
/// a == b  => true, and both share the pool's canonical allocation.
#[test]
fn test_string_interning_equality() {
    let mut vm = Vm::new();
    let foo = Value::Str(vm.strings.intern("foo"));
    let fo = Value::Str(vm.strings.intern("fo"));
    let o = Value::Str(vm.strings.intern("o"));
    let a_name = Value::Str(vm.strings.intern("a"));
    let b_name = Value::Str(vm.strings.intern("b"));

    let mut chunk = Chunk::new();
    let a_idx = chunk.add_constant(a_name) as u8;
    let b_idx = chunk.add_constant(b_name) as u8;
    chunk.emit_constant(foo, 1);
    chunk.write_op(OpCode::DefineGlobal, 1);
    chunk.write_byte(a_idx, 1);
    chunk.emit_constant(fo, 2);
    chunk.emit_constant(o, 2);
    chunk.write_op(OpCode::Add, 2);
    chunk.write_op(OpCode::DefineGlobal, 2);
    chunk.write_byte(b_idx, 2);
    chunk.write_op(OpCode::GetGlobal, 3);
    chunk.write_byte(a_idx, 3);
    chunk.write_op(OpCode::GetGlobal, 3);
    chunk.write_byte(b_idx, 3);
    chunk.write_op(OpCode::Equal, 3);
    chunk.write_op(OpCode::Return, 3);

    let handle = script(&mut vm, chunk);
    assert_eq!(vm.interpret(handle).unwrap(), Value::Bool(true));

    // Pointer identity: both globals resolve to one canonical allocation.
    let a_id = vm.strings.intern("foo");
    assert_eq!(
        vm.strings.canonical_ptr(a_id),
        vm.strings.canonical_ptr(vm.strings.lookup("foo").unwrap())
    );
}

/// fn f(x) { return x }; f(1, 2)  => arity error naming <script> at the
/// call site's line.
#[test]
fn test_arity_mismatch_is_runtime_error_with_trace() {
    let mut vm = Vm::new();
    let f_name = vm.strings.intern("f");
    let mut f_chunk = Chunk::new();
    f_chunk.write_op(OpCode::GetLocal, 1);
    f_chunk.write_byte(1, 1);
    f_chunk.write_op(OpCode::Return, 1);
    let f_fn = Function::new(f_name, 1, f_chunk);
    let f_h = vm.alloc(HeapData::Function(f_fn)).unwrap();

    let mut chunk = Chunk::new();
    let f_idx = chunk.add_constant(Value::Function(f_h)) as u8;
    chunk.write_op(OpCode::Closure, 2);
    chunk.write_byte(f_idx, 2);
    chunk.emit_constant(Value::Number(1.0), 2);
    chunk.emit_constant(Value::Number(2.0), 2);
    chunk.write_op(OpCode::Call, 2);
    chunk.write_byte(2, 2);
    chunk.write_op(OpCode::Return, 2);

    let handle = script(&mut vm, chunk);
    let err = vm.interpret(handle).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Arity);
    assert_eq!(err.trace.len(), 1);
    assert_eq!(err.trace[0].function, "<script>");
    assert_eq!(err.trace[0].line, 2);

    // The dispatcher reset the machine for the embedder.
    assert_eq!(vm.stack_depth(), 0);
    assert_eq!(vm.frame_count(), 0);
}

/// Deterministic replay: the same chunk on a fresh VM gives the same
/// result.
#[test]
fn test_run_is_deterministic() {
    let build = |vm: &mut Vm| {
        let mut chunk = Chunk::new();
        chunk.emit_constant(Value::Number(6.0), 1);
        chunk.emit_constant(Value::Number(7.0), 1);
        chunk.write_op(OpCode::Multiply, 1);
        chunk.write_op(OpCode::Return, 1);
        script(vm, chunk)
    };
    let mut first = Vm::new();
    let handle = build(&mut first);
    let a = first.interpret(handle).unwrap();

    let mut second = Vm::new();
    let handle = build(&mut second);
    let b = second.interpret(handle).unwrap();
    assert_eq!(a, b);
    assert_eq!(a, Value::Number(42.0));
}
