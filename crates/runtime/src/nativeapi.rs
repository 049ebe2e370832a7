//! Native function and native module API
//!
//! Natives use the C calling convention `Value (*)(int argc, Value* argv)`
//! and run with no direct access to the VM. Around every native call the
//! dispatcher arms a thread-local VM context; natives that need the heap,
//! the string pool or the globals reach it through [`with_vm`].
//!
//! Native *modules* are dynamic libraries exporting
//! `swiftlang_<mangled>_module_init(ctx)`. The initializer populates its
//! module by calling the loader-provided registration functions carried in
//! [`NativeModuleCtx`].
//!
//! # Safety contract
//!
//! These functions pass `Value` by value across `extern "C"` boundaries.
//! `Value` is not a C-layout type: the contract targets libraries built in
//! Rust against this exact crate version (the loader refuses containers
//! from other versions), not arbitrary C code. The
//! `improper_ctypes_definitions` allowance below exists for that reason.
//!
//! Natives run strictly on the VM's executing thread. The context pointer
//! is only armed for the duration of one call, and the dispatcher holds no
//! live borrows of VM state while a native runs, so the `&mut Vm` handed
//! to `with_vm` is exclusive.

use std::cell::Cell;
use std::ffi::{CStr, c_char};
use std::ptr;

use swiftlang_core::{ModuleId, NativeFn, Value};

use crate::error::{ErrorKind, set_native_error};
use crate::vm::Vm;

thread_local! {
    /// VM executing the current native call; null outside native calls.
    static CURRENT_VM: Cell<*mut Vm> = const { Cell::new(ptr::null_mut()) };
}

/// Arms the native-call context; restores the previous one on drop so
/// nested native calls (a native that re-enters the dispatcher) unwind
/// correctly.
pub(crate) struct VmGuard {
    previous: *mut Vm,
}

pub(crate) fn enter_vm(vm: *mut Vm) -> VmGuard {
    let previous = CURRENT_VM.with(|cell| cell.replace(vm));
    VmGuard { previous }
}

impl Drop for VmGuard {
    fn drop(&mut self) {
        CURRENT_VM.with(|cell| cell.set(self.previous));
    }
}

/// Run `f` against the VM of the current native call.
///
/// Returns `None` when no native call is in flight (calling runtime
/// helpers from outside a native is a host bug, reported rather than
/// crashed on).
pub fn with_vm<R>(f: impl FnOnce(&mut Vm) -> R) -> Option<R> {
    let vm = CURRENT_VM.with(|cell| cell.get());
    if vm.is_null() {
        None
    } else {
        // Exclusive per the module-level safety contract: one VM thread,
        // no dispatcher borrows live across a native call.
        Some(f(unsafe { &mut *vm }))
    }
}

/// Report an error from a native function. The dispatcher raises it as a
/// runtime error as soon as the native returns.
#[unsafe(no_mangle)]
pub extern "C" fn swiftlang_native_error(message: *const c_char) {
    let text = if message.is_null() {
        "native error".to_string()
    } else {
        unsafe { CStr::from_ptr(message) }
            .to_string_lossy()
            .into_owned()
    };
    set_native_error(ErrorKind::Type, text);
}

/// Intern a NUL-terminated string into the current VM's pool.
///
/// Returns nil when no native call is in flight or the bytes are not
/// valid UTF-8.
#[allow(improper_ctypes_definitions)]
#[unsafe(no_mangle)]
pub extern "C" fn swiftlang_intern_cstr(text: *const c_char) -> Value {
    if text.is_null() {
        return Value::Nil;
    }
    let Ok(text) = unsafe { CStr::from_ptr(text) }.to_str() else {
        set_native_error(ErrorKind::Type, "interned string must be UTF-8");
        return Value::Nil;
    };
    with_vm(|vm| Value::Str(vm.strings.intern(text))).unwrap_or(Value::Nil)
}

/// The registration surface handed to a native module's initializer.
///
/// The layout is part of the FFI contract; extend it only by appending.
#[repr(C)]
pub struct NativeModuleCtx {
    vm: *mut Vm,
    module: u32,
    pub register_native:
        extern "C" fn(*mut NativeModuleCtx, *const c_char, NativeFn, bool) -> bool,
    pub register_value: extern "C" fn(*mut NativeModuleCtx, *const c_char, Value, bool) -> bool,
    pub intern_string: extern "C" fn(*mut NativeModuleCtx, *const c_char) -> Value,
}

/// `swiftlang_<mangled>_module_init`.
pub type NativeModuleInit = unsafe extern "C" fn(*mut NativeModuleCtx) -> bool;

impl NativeModuleCtx {
    pub(crate) fn new(vm: &mut Vm, module: ModuleId) -> Self {
        Self {
            vm: vm as *mut Vm,
            module: module.0,
            register_native: ctx_register_native,
            register_value: ctx_register_value,
            intern_string: ctx_intern_string,
        }
    }
}

fn ctx_parts<'a>(ctx: *mut NativeModuleCtx) -> Option<(&'a mut Vm, ModuleId)> {
    if ctx.is_null() {
        return None;
    }
    let ctx = unsafe { &mut *ctx };
    if ctx.vm.is_null() {
        return None;
    }
    Some((unsafe { &mut *ctx.vm }, ModuleId(ctx.module)))
}

fn register(vm: &mut Vm, module: ModuleId, name: &str, value: Value, exported: bool) -> bool {
    let name = vm.strings.intern(name);
    let Some(module) = vm.modules.get_mut(module) else {
        return false;
    };
    module.define(name, value, exported);
    let object = module.object;
    if exported && let Some(obj) = vm.heap.object_mut(object) {
        obj.set_property(name, value);
    }
    true
}

#[allow(improper_ctypes_definitions)]
extern "C" fn ctx_register_native(
    ctx: *mut NativeModuleCtx,
    name: *const c_char,
    function: NativeFn,
    exported: bool,
) -> bool {
    let Some((vm, module)) = ctx_parts(ctx) else {
        return false;
    };
    if name.is_null() {
        return false;
    }
    let Ok(name) = unsafe { CStr::from_ptr(name) }.to_str() else {
        return false;
    };
    register(vm, module, name, Value::Native(function), exported)
}

#[allow(improper_ctypes_definitions)]
extern "C" fn ctx_register_value(
    ctx: *mut NativeModuleCtx,
    name: *const c_char,
    value: Value,
    exported: bool,
) -> bool {
    let Some((vm, module)) = ctx_parts(ctx) else {
        return false;
    };
    if name.is_null() {
        return false;
    }
    let Ok(name) = unsafe { CStr::from_ptr(name) }.to_str() else {
        return false;
    };
    register(vm, module, name, value, exported)
}

#[allow(improper_ctypes_definitions)]
extern "C" fn ctx_intern_string(ctx: *mut NativeModuleCtx, text: *const c_char) -> Value {
    let Some((vm, _)) = ctx_parts(ctx) else {
        return Value::Nil;
    };
    if text.is_null() {
        return Value::Nil;
    }
    let Ok(text) = unsafe { CStr::from_ptr(text) }.to_str() else {
        return Value::Nil;
    };
    Value::Str(vm.strings.intern(text))
}

/// Mangle a module path into its initializer symbol: `.` and `/` become
/// `_`, so `net/http` initializes through
/// `swiftlang_net_http_module_init`.
pub fn init_symbol(name: &str) -> String {
    let mangled: String = name
        .chars()
        .map(|c| if c == '.' || c == '/' { '_' } else { c })
        .collect();
    format!("swiftlang_{}_module_init", mangled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::take_native_error;
    use std::ffi::CString;

    #[test]
    fn test_init_symbol_mangling() {
        assert_eq!(init_symbol("io"), "swiftlang_io_module_init");
        assert_eq!(init_symbol("net/http"), "swiftlang_net_http_module_init");
        assert_eq!(init_symbol("a.b"), "swiftlang_a_b_module_init");
    }

    #[test]
    fn test_with_vm_outside_native_call_is_none() {
        assert!(with_vm(|_| ()).is_none());
    }

    #[test]
    fn test_with_vm_inside_guard() {
        let mut vm = Vm::new();
        let guard = enter_vm(&mut vm as *mut Vm);
        let interned = with_vm(|vm| vm.strings.intern("ctx"));
        assert!(interned.is_some());
        drop(guard);
        assert!(with_vm(|_| ()).is_none());
    }

    #[test]
    fn test_native_error_helper_sets_pending_error() {
        let message = CString::new("broke").unwrap();
        swiftlang_native_error(message.as_ptr());
        let pending = take_native_error();
        assert_eq!(pending, Some((ErrorKind::Type, "broke".to_string())));
    }

    #[test]
    fn test_ctx_registration_populates_module_and_object() {
        use crate::module::Module;
        use std::path::PathBuf;
        use swiftlang_core::{HeapData, Object};

        extern "C" fn sample(_argc: i32, _argv: *const Value) -> Value {
            Value::Bool(true)
        }

        let mut vm = Vm::new();
        let object = vm.alloc(HeapData::Object(Object::new())).unwrap();
        let id = vm
            .modules
            .add(Module::new("$demo".to_string(), PathBuf::new(), object));

        let mut ctx = NativeModuleCtx::new(&mut vm, id);
        let name = CString::new("ping").unwrap();
        assert!((ctx.register_native)(
            &mut ctx as *mut NativeModuleCtx,
            name.as_ptr(),
            sample,
            true
        ));

        let ping = vm.strings.intern("ping");
        let module = vm.modules.get(id).unwrap();
        assert!(matches!(module.lookup(ping), Some(Value::Native(_))));
        assert_eq!(module.exports, vec![ping]);
        assert!(matches!(
            vm.heap.object(object).unwrap().get_own_property(ping),
            Some(Value::Native(_))
        ));
    }
}
