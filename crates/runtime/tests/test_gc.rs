//! Collector behavior through the full VM
//!
//! These tests exercise the root set as the dispatcher actually builds
//! it: stack slots, globals, frames, upvalues, module scopes. The
//! short-lived-closure scenario mirrors production churn: thousands of
//! closures capturing fresh cells, all garbage once the loop ends.

use swiftlang_runtime::{
    Chunk, Closure, Function, GcConfig, HeapData, OpCode, Upvalue, Value, Vm,
};

/// Collector debug events show up under RUST_LOG=debug when a test run
/// needs them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[test]
fn test_unreachable_closures_are_reclaimed() {
    init_tracing();
    let mut vm = Vm::new();
    vm.collect_garbage();
    let baseline = vm.heap.live_bytes();

    // One closure's worth of heap, measured empirically below.
    let name = vm.strings.intern("tmp");
    let mut probe_size = 0;
    for i in 0..10_000 {
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Nil, 1);
        chunk.write_op(OpCode::Return, 1);
        let mut function = Function::new(name, 0, chunk);
        function.upvalue_count = 1;
        let function = vm.alloc(HeapData::Function(function)).unwrap();
        vm.push(Value::Function(function));
        let cell = vm
            .alloc(HeapData::Upvalue(Upvalue::Closed(Value::Number(i as f64))))
            .unwrap();
        // The cell has no value tag of its own; pin it across the closure
        // allocation.
        vm.heap.pin(cell);
        let closure = vm
            .alloc(HeapData::Closure(Closure::new(function, vec![cell])))
            .unwrap();
        vm.heap.unpin(cell);
        vm.push(Value::Closure(closure));
        if i == 0 {
            probe_size = vm.heap.live_bytes() - baseline;
        }
        // Drop the references: the closure becomes garbage immediately.
        vm.pop();
        vm.pop();
    }

    vm.collect_garbage();
    let after = vm.heap.live_bytes();
    assert!(
        after <= baseline + probe_size,
        "live bytes after collection ({}) should return to within one \
         closure's worth ({}) of the baseline ({})",
        after,
        probe_size,
        baseline
    );
}

#[test]
fn test_rooted_closures_survive_collection() {
    let mut vm = Vm::new();
    let name = vm.strings.intern("kept");
    let mut chunk = Chunk::new();
    chunk.write_op(OpCode::Nil, 1);
    chunk.write_op(OpCode::Return, 1);
    let function = vm
        .alloc(HeapData::Function(Function::new(name, 0, chunk)))
        .unwrap();
    vm.push(Value::Function(function));
    let cell = vm
        .alloc(HeapData::Upvalue(Upvalue::Closed(Value::Number(7.0))))
        .unwrap();
    let closure = vm
        .alloc(HeapData::Closure(Closure::new(function, vec![cell])))
        .unwrap();
    vm.pop();
    vm.push(Value::Closure(closure));

    vm.collect_garbage();
    assert!(vm.heap.contains(closure));
    assert!(vm.heap.contains(function), "closure keeps its function");
    assert!(vm.heap.contains(cell), "closure keeps its upvalue cell");
}

#[test]
fn test_stress_mode_runs_programs_correctly() {
    // Collecting before every allocation shakes out premature frees: any
    // object the dispatcher fails to root dies mid-program.
    let mut vm = Vm::with_config(GcConfig {
        stress: true,
        ..GcConfig::default()
    });
    let push = Value::Str(vm.strings.intern("push"));
    let mut chunk = Chunk::new();
    let push_idx = chunk.add_constant(push) as u8;
    chunk.write_op(OpCode::BuildArray, 1);
    chunk.write_byte(0, 1);
    for value in [1.0, 2.0, 3.0] {
        chunk.write_op(OpCode::Dup, 2);
        chunk.emit_constant(Value::Number(value), 2);
        chunk.write_op(OpCode::MethodCall, 2);
        chunk.write_byte(1, 2);
        chunk.write_byte(push_idx, 2);
        chunk.write_op(OpCode::Pop, 2);
    }
    chunk.write_op(OpCode::Length, 3);
    chunk.write_op(OpCode::Return, 3);

    let name = vm.strings.intern("<script>");
    let handle = vm
        .alloc(HeapData::Function(Function::new(name, 0, chunk)))
        .unwrap();
    assert_eq!(vm.interpret(handle).unwrap(), Value::Number(3.0));
    assert!(vm.gc.stats().collections > 0);
}

#[test]
fn test_gc_statistics_accumulate() {
    let mut vm = Vm::new();
    let before = vm.gc.stats();
    for _ in 0..100 {
        let h = vm
            .alloc(HeapData::Object(swiftlang_core::Object::new()))
            .unwrap();
        let _ = h;
    }
    vm.collect_garbage();
    let after = vm.gc.stats();
    assert_eq!(after.collections, before.collections + 1);
    assert!(after.bytes_allocated_total > before.bytes_allocated_total);
    assert!(after.bytes_freed_total >= before.bytes_freed_total);
    assert!(after.peak_live_bytes >= after.live_bytes);
}

#[test]
fn test_pinned_objects_survive_and_release() {
    let mut vm = Vm::new();
    let h = vm
        .alloc(HeapData::Object(swiftlang_core::Object::new()))
        .unwrap();
    vm.heap.pin(h);
    vm.collect_garbage();
    assert!(vm.heap.contains(h), "pinned object survives unrooted");
    vm.heap.unpin(h);
    vm.collect_garbage();
    assert!(!vm.heap.contains(h));
}

#[test]
fn test_incremental_cycle_through_vm() {
    let mut vm = Vm::new();
    let keep = vm
        .alloc(HeapData::Object(swiftlang_core::Object::new()))
        .unwrap();
    vm.push(Value::Object(keep));
    for _ in 0..100 {
        vm.alloc(HeapData::Object(swiftlang_core::Object::new()))
            .unwrap();
    }
    vm.gc.begin_incremental();
    let mut steps = 0;
    while !vm.gc_step(16) {
        steps += 1;
        assert!(steps < 10_000, "incremental collection must terminate");
    }
    assert!(vm.heap.contains(keep));
}
