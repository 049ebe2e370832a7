//! Bootstrap: intrinsic globals and built-in prototypes
//!
//! Installed on every VM before any guest code runs: the intrinsic
//! globals (`print`, `typeof`, `assert`) and the method-level built-ins
//! on the five prototypes. A failed `assert` terminates the host process;
//! every other intrinsic failure is reported through the native error
//! cell and surfaces as an ordinary runtime error.

use std::slice;

use swiftlang_core::{Handle, NativeFn, Value};

use crate::error::{ErrorKind, set_native_error};
use crate::nativeapi::with_vm;
use crate::vm::Vm;

/// Exit status used when a guest assertion fails.
const ASSERT_EXIT_CODE: i32 = 70;

pub(crate) fn install(vm: &mut Vm) {
    define_global(vm, "print", native_print);
    define_global(vm, "typeof", native_typeof);
    define_global(vm, "assert", native_assert);

    let array = vm.protos.array;
    set_method(vm, array, "push", native_array_push);
    set_method(vm, array, "pop", native_array_pop);

    let string = vm.protos.string;
    set_method(vm, string, "upper", native_string_upper);
    set_method(vm, string, "lower", native_string_lower);
    set_method(vm, string, "contains", native_string_contains);

    let number = vm.protos.number;
    set_method(vm, number, "floor", native_number_floor);
    set_method(vm, number, "ceil", native_number_ceil);
    set_method(vm, number, "abs", native_number_abs);

    let object = vm.protos.object;
    set_method(vm, object, "keys", native_object_keys);
    set_method(vm, object, "has", native_object_has);

    let function = vm.protos.function;
    set_method(vm, function, "name", native_function_name);
}

fn define_global(vm: &mut Vm, name: &str, f: NativeFn) {
    let id = vm.strings.intern(name);
    vm.globals.insert(id, Value::Native(f));
}

fn set_method(vm: &mut Vm, proto: Handle, name: &str, f: NativeFn) {
    let id = vm.strings.intern(name);
    if let Some(object) = vm.heap.object_mut(proto) {
        object.set_property(id, Value::Native(f));
    }
}

fn args<'a>(argc: i32, argv: *const Value) -> &'a [Value] {
    if argc <= 0 || argv.is_null() {
        return &[];
    }
    // The dispatcher hands us argc consecutive values.
    unsafe { slice::from_raw_parts(argv, argc as usize) }
}

// ---- intrinsic globals ----------------------------------------------------

/// `print(args...)`: display forms joined by spaces, newline-terminated.
extern "C" fn native_print(argc: i32, argv: *const Value) -> Value {
    let args = args(argc, argv);
    with_vm(|vm| {
        let line = args
            .iter()
            .map(|v| vm.to_display_string(*v))
            .collect::<Vec<_>>()
            .join(" ");
        println!("{}", line);
    });
    Value::Nil
}

/// `typeof(x)`: the kind of a value as an interned string.
extern "C" fn native_typeof(argc: i32, argv: *const Value) -> Value {
    let args = args(argc, argv);
    if args.len() != 1 {
        set_native_error(ErrorKind::Arity, "typeof takes exactly 1 argument");
        return Value::Nil;
    }
    with_vm(|vm| {
        let name = vm.describe(args[0]);
        Value::Str(vm.strings.intern(name))
    })
    .unwrap_or(Value::Nil)
}

/// `assert(cond, msg?)`: a falsey condition terminates the host process.
extern "C" fn native_assert(argc: i32, argv: *const Value) -> Value {
    let args = args(argc, argv);
    if args.is_empty() {
        set_native_error(ErrorKind::Arity, "assert takes 1 or 2 arguments");
        return Value::Nil;
    }
    if args[0].is_falsey() {
        let detail = with_vm(|vm| {
            args.get(1)
                .map(|m| vm.to_display_string(*m))
                .unwrap_or_else(|| "assertion failed".to_string())
        })
        .unwrap_or_else(|| "assertion failed".to_string());
        eprintln!("assertion failed: {}", detail);
        std::process::exit(ASSERT_EXIT_CODE);
    }
    Value::Nil
}

// ---- Array prototype ------------------------------------------------------

/// `array.push(values...)`: appends and returns the new length.
extern "C" fn native_array_push(argc: i32, argv: *const Value) -> Value {
    let args = args(argc, argv);
    let Some(Value::Object(receiver)) = args.first().copied() else {
        set_native_error(ErrorKind::Type, "push requires an array receiver");
        return Value::Nil;
    };
    with_vm(|vm| {
        if !vm.heap.object(receiver).map(|o| o.is_array).unwrap_or(false) {
            set_native_error(ErrorKind::Type, "push requires an array receiver");
            return Value::Nil;
        }
        let length_key = vm.known.length;
        let mut length = vm
            .heap
            .object(receiver)
            .and_then(|o| o.get_own_property(length_key))
            .and_then(Value::as_number)
            .unwrap_or(0.0) as usize;
        for &value in &args[1..] {
            let key = swiftlang_core::object::array_index_key(&mut vm.strings, length);
            if let Some(array) = vm.heap.object_mut(receiver) {
                array.set_property(key, value);
            }
            vm.gc.write_barrier(&mut vm.heap, receiver, value);
            length += 1;
        }
        if let Some(array) = vm.heap.object_mut(receiver) {
            array.set_property(length_key, Value::Number(length as f64));
        }
        vm.heap.refresh_size(receiver);
        Value::Number(length as f64)
    })
    .unwrap_or(Value::Nil)
}

/// `array.pop()`: removes and returns the last element, nil when empty.
extern "C" fn native_array_pop(argc: i32, argv: *const Value) -> Value {
    let args = args(argc, argv);
    let Some(Value::Object(receiver)) = args.first().copied() else {
        set_native_error(ErrorKind::Type, "pop requires an array receiver");
        return Value::Nil;
    };
    with_vm(|vm| {
        let length_key = vm.known.length;
        let length = vm
            .heap
            .object(receiver)
            .and_then(|o| o.get_own_property(length_key))
            .and_then(Value::as_number)
            .unwrap_or(0.0) as usize;
        if length == 0 {
            return Value::Nil;
        }
        let key = swiftlang_core::object::array_index_key(&mut vm.strings, length - 1);
        let value = vm
            .heap
            .object_mut(receiver)
            .and_then(|o| o.remove_property(key))
            .unwrap_or(Value::Nil);
        if let Some(array) = vm.heap.object_mut(receiver) {
            array.set_property(length_key, Value::Number((length - 1) as f64));
        }
        value
    })
    .unwrap_or(Value::Nil)
}

// ---- String prototype -----------------------------------------------------

fn string_receiver(args: &[Value]) -> Option<swiftlang_core::StrId> {
    match args.first().copied() {
        Some(Value::Str(id)) => Some(id),
        _ => {
            set_native_error(ErrorKind::Type, "receiver must be a string");
            None
        }
    }
}

extern "C" fn native_string_upper(argc: i32, argv: *const Value) -> Value {
    let args = args(argc, argv);
    let Some(id) = string_receiver(args) else {
        return Value::Nil;
    };
    with_vm(|vm| {
        let upper = vm.strings.resolve(id).to_uppercase();
        Value::Str(vm.strings.intern(&upper))
    })
    .unwrap_or(Value::Nil)
}

extern "C" fn native_string_lower(argc: i32, argv: *const Value) -> Value {
    let args = args(argc, argv);
    let Some(id) = string_receiver(args) else {
        return Value::Nil;
    };
    with_vm(|vm| {
        let lower = vm.strings.resolve(id).to_lowercase();
        Value::Str(vm.strings.intern(&lower))
    })
    .unwrap_or(Value::Nil)
}

extern "C" fn native_string_contains(argc: i32, argv: *const Value) -> Value {
    let args = args(argc, argv);
    let Some(id) = string_receiver(args) else {
        return Value::Nil;
    };
    let Some(Value::Str(needle)) = args.get(1).copied() else {
        set_native_error(ErrorKind::Type, "contains takes a string argument");
        return Value::Nil;
    };
    with_vm(|vm| {
        let found = vm
            .strings
            .resolve(id)
            .contains(vm.strings.resolve(needle));
        Value::Bool(found)
    })
    .unwrap_or(Value::Nil)
}

// ---- Number prototype -----------------------------------------------------

fn number_receiver(args: &[Value]) -> Option<f64> {
    match args.first().copied() {
        Some(Value::Number(n)) => Some(n),
        _ => {
            set_native_error(ErrorKind::Type, "receiver must be a number");
            None
        }
    }
}

extern "C" fn native_number_floor(argc: i32, argv: *const Value) -> Value {
    match number_receiver(args(argc, argv)) {
        Some(n) => Value::Number(n.floor()),
        None => Value::Nil,
    }
}

extern "C" fn native_number_ceil(argc: i32, argv: *const Value) -> Value {
    match number_receiver(args(argc, argv)) {
        Some(n) => Value::Number(n.ceil()),
        None => Value::Nil,
    }
}

extern "C" fn native_number_abs(argc: i32, argv: *const Value) -> Value {
    match number_receiver(args(argc, argv)) {
        Some(n) => Value::Number(n.abs()),
        None => Value::Nil,
    }
}

// ---- Object prototype -----------------------------------------------------

/// `object.keys()`: own property names as an array, in insertion order.
extern "C" fn native_object_keys(argc: i32, argv: *const Value) -> Value {
    let args = args(argc, argv);
    let Some(Value::Object(receiver)) = args.first().copied() else {
        set_native_error(ErrorKind::Type, "keys requires an object receiver");
        return Value::Nil;
    };
    with_vm(|vm| {
        let keys: Vec<swiftlang_core::StrId> = match vm.heap.object(receiver) {
            Some(object) => object.iter().map(|(k, _)| k).collect(),
            None => Vec::new(),
        };
        let mut array = swiftlang_core::Object::array();
        array.set_prototype(Some(vm.protos.array));
        for (i, key) in keys.iter().enumerate() {
            let index_key = swiftlang_core::object::array_index_key(&mut vm.strings, i);
            array.set_property(index_key, Value::Str(*key));
        }
        let length_key = vm.known.length;
        array.set_property(length_key, Value::Number(keys.len() as f64));
        match vm.alloc(swiftlang_core::HeapData::Object(array)) {
            Ok(handle) => Value::Object(handle),
            Err(err) => {
                set_native_error(err.kind, err.message);
                Value::Nil
            }
        }
    })
    .unwrap_or(Value::Nil)
}

/// `object.has(name)`: property presence, prototype chain included.
extern "C" fn native_object_has(argc: i32, argv: *const Value) -> Value {
    let args = args(argc, argv);
    let Some(Value::Object(receiver)) = args.first().copied() else {
        set_native_error(ErrorKind::Type, "has requires an object receiver");
        return Value::Nil;
    };
    let Some(Value::Str(name)) = args.get(1).copied() else {
        set_native_error(ErrorKind::Type, "has takes a string argument");
        return Value::Nil;
    };
    with_vm(|vm| {
        Value::Bool(swiftlang_core::object::has_property(
            &vm.heap, receiver, name,
        ))
    })
    .unwrap_or(Value::Nil)
}

// ---- Function prototype ---------------------------------------------------

extern "C" fn native_function_name(argc: i32, argv: *const Value) -> Value {
    let args = args(argc, argv);
    let receiver = args.first().copied().unwrap_or(Value::Nil);
    with_vm(|vm| {
        let name = match receiver {
            Value::Function(h) => vm.heap.function(h).map(|f| f.name),
            Value::Closure(h) => vm
                .heap
                .closure(h)
                .and_then(|c| vm.heap.function(c.function))
                .map(|f| f.name),
            Value::Native(_) => Some(vm.strings.intern("<native>")),
            _ => None,
        };
        match name {
            Some(id) => Value::Str(id),
            None => {
                set_native_error(ErrorKind::Type, "name requires a function receiver");
                Value::Nil
            }
        }
    })
    .unwrap_or(Value::Nil)
}

#[cfg(test)]
mod tests {
    use super::*;
    use swiftlang_core::{Chunk, Function, HeapData, OpCode};

    fn run(vm: &mut Vm, chunk: Chunk) -> Value {
        let name = vm.strings.intern("<script>");
        let function = Function::new(name, 0, chunk);
        let handle = vm.alloc(HeapData::Function(function)).unwrap();
        vm.interpret(handle).expect("script should run")
    }

    fn method_call(chunk: &mut Chunk, argc: u8, name_idx: u8, line: u32) {
        chunk.write_op(OpCode::MethodCall, line);
        chunk.write_byte(argc, line);
        chunk.write_byte(name_idx, line);
    }

    #[test]
    fn test_push_appends_and_grows_length() {
        let mut vm = Vm::new();
        let push = Value::Str(vm.strings.intern("push"));
        let mut chunk = Chunk::new();
        let push_idx = chunk.add_constant(push) as u8;
        chunk.write_op(OpCode::BuildArray, 1);
        chunk.write_byte(0, 1);
        chunk.write_op(OpCode::Dup, 2);
        chunk.emit_constant(Value::Number(10.0), 2);
        method_call(&mut chunk, 1, push_idx, 2);
        chunk.write_op(OpCode::Pop, 2);
        chunk.write_op(OpCode::Dup, 3);
        chunk.emit_constant(Value::Number(20.0), 3);
        method_call(&mut chunk, 1, push_idx, 3);
        chunk.write_op(OpCode::Pop, 3);
        chunk.write_op(OpCode::Length, 4);
        chunk.write_op(OpCode::Return, 4);
        assert_eq!(run(&mut vm, chunk), Value::Number(2.0));
    }

    #[test]
    fn test_pop_returns_last_element() {
        let mut vm = Vm::new();
        let pop = Value::Str(vm.strings.intern("pop"));
        let mut chunk = Chunk::new();
        let pop_idx = chunk.add_constant(pop) as u8;
        chunk.emit_constant(Value::Number(1.0), 1);
        chunk.emit_constant(Value::Number(2.0), 1);
        chunk.write_op(OpCode::BuildArray, 1);
        chunk.write_byte(2, 1);
        method_call(&mut chunk, 0, pop_idx, 2);
        chunk.write_op(OpCode::Return, 2);
        assert_eq!(run(&mut vm, chunk), Value::Number(2.0));
    }

    #[test]
    fn test_typeof_vocabulary() {
        let mut vm = Vm::new();
        let typeof_name = Value::Str(vm.strings.intern("typeof"));
        let mut chunk = Chunk::new();
        let typeof_idx = chunk.add_constant(typeof_name) as u8;
        chunk.write_op(OpCode::GetGlobal, 1);
        chunk.write_byte(typeof_idx, 1);
        chunk.emit_constant(Value::Number(1.0), 1);
        chunk.write_op(OpCode::Call, 1);
        chunk.write_byte(1, 1);
        chunk.write_op(OpCode::Return, 1);
        let result = run(&mut vm, chunk);
        assert_eq!(result, Value::Str(vm.strings.intern("number")));
    }

    #[test]
    fn test_string_methods() {
        let mut vm = Vm::new();
        let upper = Value::Str(vm.strings.intern("upper"));
        let hello = Value::Str(vm.strings.intern("hello"));
        let mut chunk = Chunk::new();
        let upper_idx = chunk.add_constant(upper) as u8;
        chunk.emit_constant(hello, 1);
        method_call(&mut chunk, 0, upper_idx, 1);
        chunk.write_op(OpCode::Return, 1);
        let result = run(&mut vm, chunk);
        assert_eq!(result, Value::Str(vm.strings.intern("HELLO")));
    }

    #[test]
    fn test_number_methods_via_prototype() {
        let mut vm = Vm::new();
        let floor = Value::Str(vm.strings.intern("floor"));
        let mut chunk = Chunk::new();
        let floor_idx = chunk.add_constant(floor) as u8;
        chunk.emit_constant(Value::Number(2.7), 1);
        method_call(&mut chunk, 0, floor_idx, 1);
        chunk.write_op(OpCode::Return, 1);
        assert_eq!(run(&mut vm, chunk), Value::Number(2.0));
    }

    #[test]
    fn test_object_keys_in_insertion_order() {
        let mut vm = Vm::new();
        let keys = Value::Str(vm.strings.intern("keys"));
        let b = Value::Str(vm.strings.intern("b"));
        let a = Value::Str(vm.strings.intern("a"));
        let mut chunk = Chunk::new();
        let keys_idx = chunk.add_constant(keys) as u8;
        chunk.emit_constant(b, 1);
        chunk.emit_constant(Value::Number(1.0), 1);
        chunk.emit_constant(a, 1);
        chunk.emit_constant(Value::Number(2.0), 1);
        chunk.write_op(OpCode::ObjectLiteral, 1);
        chunk.write_byte(2, 1);
        method_call(&mut chunk, 0, keys_idx, 2);
        chunk.emit_constant(Value::Number(0.0), 2);
        chunk.write_op(OpCode::GetSubscript, 2);
        chunk.write_op(OpCode::Return, 2);
        let result = run(&mut vm, chunk);
        assert_eq!(result, Value::Str(vm.strings.intern("b")));
    }

    #[test]
    fn test_unknown_method_is_type_error() {
        let mut vm = Vm::new();
        let nope = Value::Str(vm.strings.intern("nope"));
        let mut chunk = Chunk::new();
        let nope_idx = chunk.add_constant(nope) as u8;
        chunk.emit_constant(Value::Number(1.0), 1);
        method_call(&mut chunk, 0, nope_idx, 1);
        chunk.write_op(OpCode::Return, 1);
        let name = vm.strings.intern("<script>");
        let function = Function::new(name, 0, chunk);
        let handle = vm.alloc(HeapData::Function(function)).unwrap();
        let err = vm.interpret(handle).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Type);
        assert!(err.message.contains("nope"));
    }
}
