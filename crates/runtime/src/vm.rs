//! The virtual machine
//!
//! `Vm` owns everything a guest computation touches: the value stack, the
//! call stack, globals, the open-upvalue list, the heap and collector, the
//! string pool, per-VM built-in prototypes, the module registry and the
//! loader tree. Two VMs share nothing; interned strings and prototypes are
//! per-instance.
//!
//! Guest execution is single-threaded: one host thread drives the
//! dispatcher, and the collector runs stop-the-world between opcodes.
//! The module-loader caches are independently thread-safe for concurrent
//! readers.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use tracing::debug;

use swiftlang_core::{
    Chunk, Closure, Gc, GcConfig, Handle, Heap, HeapData, KnownStrings, ModuleId, Object, StrId,
    StringPool, Upvalue, Value,
};

use crate::bootstrap;
use crate::error::{ErrorKind, RuntimeError, TraceFrame};
use crate::loader::Loader;
use crate::module::ModuleRegistry;

/// Maximum depth of the call stack.
pub const FRAMES_MAX: usize = 256;

/// Per-invocation record.
///
/// `slots` is the stack index where the callee's window begins; slot 0 is
/// the callee value itself. `saved_module` is the caller's module context,
/// restored on return. The chunk is cached out of the function so the
/// dispatcher reads code without touching the heap.
pub struct CallFrame {
    pub closure: Handle,
    pub chunk: Rc<Chunk>,
    pub ip: usize,
    pub slots: usize,
    pub saved_module: Option<ModuleId>,
    pub function_name: StrId,
}

/// The five built-in prototypes, owned by this VM.
#[derive(Debug, Clone, Copy)]
pub struct Prototypes {
    pub object: Handle,
    pub array: Handle,
    pub string: Handle,
    pub number: Handle,
    pub function: Handle,
}

/// A struct type: ordered field names plus the named prototype shared by
/// all instances of the type.
#[derive(Debug, Clone)]
pub struct StructDef {
    pub name: StrId,
    pub fields: Vec<StrId>,
    pub proto: Handle,
}

/// The compiler seam. The front end is an external collaborator; the
/// loader calls through this trait to turn module source into a compiled
/// function (the returned handle must be a `HeapData::Function` whose
/// chunk ends by returning or halting).
pub trait ModuleCompiler {
    fn compile(
        &self,
        source: &str,
        path: &std::path::Path,
        vm: &mut Vm,
    ) -> Result<Handle, crate::error::ModuleError>;
}

pub struct Vm {
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<CallFrame>,
    pub(crate) globals: HashMap<StrId, Value>,
    /// Open upvalues ordered by strictly descending stack slot.
    pub(crate) open_upvalues: Vec<Handle>,
    pub heap: Heap,
    pub gc: Gc,
    pub strings: StringPool,
    pub known: KnownStrings,
    pub(crate) protos: Prototypes,
    pub(crate) struct_defs: HashMap<StrId, StructDef>,
    pub(crate) modules: ModuleRegistry,
    pub(crate) loader: Arc<Loader>,
    pub(crate) current_module: Option<ModuleId>,
    /// Per-instruction tracing to stderr. Never alters semantics.
    pub trace_execution: bool,
    pub(crate) compiler: Option<Box<dyn ModuleCompiler>>,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(GcConfig::default())
    }

    pub fn with_config(gc_config: GcConfig) -> Self {
        let mut strings = StringPool::new();
        let known = strings.known();
        let mut heap = Heap::new();
        if gc_config.max_heap_size != 0 {
            heap.max_bytes = gc_config.max_heap_size;
        }

        // Prototypes exist before any guest code; they are reachable from
        // the VM root set for the whole VM lifetime.
        let object = heap.alloc_unchecked(HeapData::Object(Object::new()));
        let mut with_object_proto = || {
            let mut o = Object::new();
            o.set_prototype(Some(object));
            o
        };
        let array = heap.alloc_unchecked(HeapData::Object(with_object_proto()));
        let string = heap.alloc_unchecked(HeapData::Object(with_object_proto()));
        let number = heap.alloc_unchecked(HeapData::Object(with_object_proto()));
        let function = heap.alloc_unchecked(HeapData::Object(with_object_proto()));

        let mut vm = Self {
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: HashMap::new(),
            open_upvalues: Vec::new(),
            heap,
            gc: Gc::new(gc_config),
            strings,
            known,
            protos: Prototypes {
                object,
                array,
                string,
                number,
                function,
            },
            struct_defs: HashMap::new(),
            modules: ModuleRegistry::new(),
            loader: Loader::default_chain(),
            current_module: None,
            trace_execution: false,
            compiler: None,
        };
        bootstrap::install(&mut vm);
        vm
    }

    /// Install the front-end used for source modules.
    pub fn set_compiler(&mut self, compiler: Box<dyn ModuleCompiler>) {
        self.compiler = Some(compiler);
    }

    /// Replace the loader chain (the default is bootstrap → system →
    /// application rooted in the current directory).
    pub fn set_loader(&mut self, loader: Arc<Loader>) {
        self.loader = loader;
    }

    pub fn loader(&self) -> &Arc<Loader> {
        &self.loader
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Read-only view of the loaded modules.
    pub fn module_registry(&self) -> &ModuleRegistry {
        &self.modules
    }

    // ---- stack primitives -------------------------------------------------

    /// Push a value onto the operand stack. Embedders use this to root
    /// temporaries across allocations.
    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::Nil)
    }

    pub(crate) fn peek(&self, distance: usize) -> Value {
        let len = self.stack.len();
        if distance < len {
            self.stack[len - 1 - distance]
        } else {
            Value::Nil
        }
    }

    pub(crate) fn set_peek(&mut self, distance: usize, value: Value) {
        let len = self.stack.len();
        if distance < len {
            self.stack[len - 1 - distance] = value;
        }
    }

    // ---- GC-aware allocation ---------------------------------------------

    /// Allocate a heap object through the collector.
    ///
    /// In stress mode, or past the threshold, a collection runs first.
    /// If the heap ceiling would still be exceeded, one forced collection
    /// is retried before reporting an allocation error, per the failure
    /// model: the guest gets a runtime error, never an abort.
    pub fn alloc(&mut self, data: HeapData) -> Result<Handle, RuntimeError> {
        if self.gc.should_collect() {
            self.collect_garbage();
        }
        let size = data.approx_size();
        if !self.heap.can_fit(size) {
            self.collect_garbage();
            if !self.heap.can_fit(size) {
                return Err(self.error(ErrorKind::Allocation, "out of memory"));
            }
        }
        let handle = self
            .heap
            .alloc(data)
            .ok_or_else(|| self.error(ErrorKind::Allocation, "out of memory"))?;
        self.gc.on_allocated(&mut self.heap, handle, size);
        Ok(handle)
    }

    /// Force a full collection now.
    pub fn collect_garbage(&mut self) -> usize {
        let Vm {
            gc,
            heap,
            stack,
            frames,
            globals,
            open_upvalues,
            protos,
            struct_defs,
            modules,
            ..
        } = self;
        gc.collect(heap, &mut |marker| {
            visit_roots(
                marker,
                stack,
                frames,
                globals,
                open_upvalues,
                protos,
                struct_defs,
                modules,
            );
        })
    }

    /// Advance an incremental collection by `budget` units.
    pub fn gc_step(&mut self, budget: usize) -> bool {
        let Vm {
            gc,
            heap,
            stack,
            frames,
            globals,
            open_upvalues,
            protos,
            struct_defs,
            modules,
            ..
        } = self;
        gc.step(
            heap,
            &mut |marker| {
                visit_roots(
                    marker,
                    stack,
                    frames,
                    globals,
                    open_upvalues,
                    protos,
                    struct_defs,
                    modules,
                );
            },
            budget,
        )
    }

    // ---- upvalue discipline ----------------------------------------------

    /// Capture the stack slot as an upvalue, reusing an existing open cell
    /// for the same slot. The open list stays strictly descending by slot.
    pub(crate) fn capture_upvalue(&mut self, slot: usize) -> Result<Handle, RuntimeError> {
        let mut insert_at = self.open_upvalues.len();
        for (i, &handle) in self.open_upvalues.iter().enumerate() {
            match self.heap.upvalue(handle).and_then(|u| u.open_slot()) {
                Some(loc) if loc == slot => return Ok(handle),
                Some(loc) if loc < slot => {
                    insert_at = i;
                    break;
                }
                _ => {}
            }
        }
        let handle = self.alloc(HeapData::Upvalue(Upvalue::Open(slot)))?;
        self.open_upvalues.insert(insert_at, handle);
        Ok(handle)
    }

    /// Close every open upvalue at or above `from_slot`: the value moves
    /// off the stack into the cell.
    pub(crate) fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(&handle) = self.open_upvalues.first() {
            let slot = match self.heap.upvalue(handle).and_then(|u| u.open_slot()) {
                Some(slot) if slot >= from_slot => slot,
                _ => break,
            };
            let value = self.stack.get(slot).copied().unwrap_or(Value::Nil);
            if let Some(cell) = self.heap.upvalue_mut(handle) {
                *cell = Upvalue::Closed(value);
            }
            self.open_upvalues.remove(0);
        }
    }

    // ---- call discipline --------------------------------------------------

    /// Invoke a callable with `arg_count` values above it on the stack.
    /// Closures and raw functions push a frame; natives run to completion
    /// here. `receiver_slots` is 1 for method calls (the receiver sits in
    /// the callee slot and is passed to natives as argv[0]).
    pub(crate) fn call_value(
        &mut self,
        callee: Value,
        arg_count: u8,
        receiver_slots: u8,
    ) -> Result<(), RuntimeError> {
        match callee {
            Value::Closure(handle) => self.call_closure(handle, arg_count),
            Value::Function(handle) => {
                // Bare functions get a transient closure; the arguments on
                // the stack keep everything rooted across the allocation.
                let closure = self.alloc(HeapData::Closure(Closure::new(handle, Vec::new())))?;
                let slot = self.stack.len() - arg_count as usize - 1;
                self.stack[slot] = Value::Closure(closure);
                self.call_closure(closure, arg_count)
            }
            Value::Native(native) => self.call_native(native, arg_count, receiver_slots),
            _ => Err(self.error(
                ErrorKind::Type,
                format!("can only call functions, got {}", self.describe(callee)),
            )),
        }
    }

    pub(crate) fn call_closure(
        &mut self,
        closure: Handle,
        arg_count: u8,
    ) -> Result<(), RuntimeError> {
        let function_h = match self.heap.closure(closure) {
            Some(c) => c.function,
            None => return Err(self.error(ErrorKind::Type, "callee is not a closure")),
        };
        let (arity, chunk, name, module) = match self.heap.function(function_h) {
            Some(f) => (f.arity, Rc::clone(&f.chunk), f.name, f.module),
            None => return Err(self.error(ErrorKind::Type, "closure has no function")),
        };
        if arg_count != arity {
            return Err(self.error(
                ErrorKind::Arity,
                format!("expected {} arguments, got {}", arity, arg_count),
            ));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(self.error(ErrorKind::Capacity, "call stack overflow"));
        }
        let slots = self.stack.len() - arg_count as usize - 1;
        self.frames.push(CallFrame {
            closure,
            chunk,
            ip: 0,
            slots,
            saved_module: self.current_module,
            function_name: name,
        });
        if module.is_some() {
            self.current_module = module;
        }
        Ok(())
    }

    fn call_native(
        &mut self,
        native: swiftlang_core::NativeFn,
        arg_count: u8,
        receiver_slots: u8,
    ) -> Result<(), RuntimeError> {
        let total = arg_count as usize + receiver_slots as usize;
        let argv_start = self.stack.len() - total;
        // The arguments are copied out so the native sees a stable argv
        // even if it allocates (and the collector runs) through the VM
        // context; the originals stay on the stack as roots until the
        // call returns.
        let args: Vec<Value> = self.stack[argv_start..].to_vec();
        let result = {
            let _guard = crate::nativeapi::enter_vm(self as *mut Vm);
            native(args.len() as i32, args.as_ptr())
        };
        if let Some((kind, message)) = crate::error::take_native_error() {
            return Err(self.error(kind, message));
        }
        // Replace [callee, args...] with the single result.
        self.stack.truncate(self.stack.len() - arg_count as usize - 1);
        self.push(result);
        Ok(())
    }

    /// Pop the current frame: close upvalues over its window, rewind the
    /// stack, restore the caller's module, push the result.
    pub(crate) fn pop_frame(&mut self, result: Value) {
        let frame = self.frames.pop().expect("pop_frame with no frame");
        self.close_upvalues(frame.slots);
        self.stack.truncate(frame.slots);
        self.current_module = frame.saved_module;
        self.push(result);
    }

    // ---- error construction -----------------------------------------------

    /// Build a runtime error carrying the current stack trace, topmost
    /// frame first.
    pub(crate) fn error(&self, kind: ErrorKind, message: impl Into<String>) -> RuntimeError {
        let mut err = RuntimeError::bare(kind, message);
        for frame in self.frames.iter().rev() {
            let offset = frame.ip.saturating_sub(1);
            err.trace.push(TraceFrame {
                function: self.strings.resolve(frame.function_name).to_string(),
                line: frame.chunk.line_at(offset),
            });
        }
        err
    }

    /// Re-link an object's prototype. Chains must stay acyclic to keep
    /// property lookup linear, so a link that would reach back to the
    /// object itself is rejected.
    pub fn set_object_prototype(
        &mut self,
        object: Handle,
        proto: Option<Handle>,
    ) -> Result<(), RuntimeError> {
        if let Some(proto) = proto
            && swiftlang_core::object::would_create_cycle(&self.heap, object, proto)
        {
            return Err(self.error(ErrorKind::Type, "prototype chain would contain a cycle"));
        }
        match self.heap.object_mut(object) {
            Some(obj) => {
                obj.set_prototype(proto);
                if let Some(proto) = proto {
                    self.gc.write_barrier(&mut self.heap, object, Value::Object(proto));
                }
                Ok(())
            }
            None => Err(self.error(ErrorKind::Type, "prototype target is not an object")),
        }
    }

    /// Human-readable kind of a value, for error messages and `typeof`.
    pub fn describe(&self, value: Value) -> &'static str {
        match value {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Object(h) => {
                if self.heap.object(h).map(|o| o.is_array).unwrap_or(false) {
                    "array"
                } else {
                    "object"
                }
            }
            Value::Function(_) | Value::Closure(_) | Value::Native(_) => "function",
            Value::Struct(_) => "struct",
        }
    }

    // ---- entry points -----------------------------------------------------

    /// Execute a compiled top-level function to completion.
    ///
    /// On error the stack trace is printed to stderr, the stack and frame
    /// count are reset, and the error is returned to the embedder.
    pub fn interpret(&mut self, function: Handle) -> Result<Value, RuntimeError> {
        // Root the function across the closure allocation: the collector
        // may run inside `alloc`.
        self.push(Value::Function(function));
        let closure = self.alloc(HeapData::Closure(Closure::new(function, Vec::new())))?;
        self.set_peek(0, Value::Closure(closure));
        self.call_closure(closure, 0)?;
        match self.run_until(0) {
            Ok(value) => {
                // run_until leaves the result pushed; the embedder gets it
                // as a return value, not a stack slot.
                self.pop();
                Ok(value)
            }
            Err(err) => {
                eprintln!("{}", err);
                eprint!("{}", err.render_trace());
                self.reset();
                Err(err)
            }
        }
    }

    /// Run a module's top-level function inside the current execution,
    /// used by `load_module`. The module context is switched by the frame
    /// discipline and restored on return.
    pub(crate) fn run_module_body(&mut self, function: Handle) -> Result<Value, RuntimeError> {
        let base = self.frames.len();
        self.push(Value::Function(function));
        let closure = self.alloc(HeapData::Closure(Closure::new(function, Vec::new())))?;
        self.set_peek(0, Value::Closure(closure));
        self.call_closure(closure, 0)?;
        let result = self.run_until(base)?;
        // run_until pushed the body's result; the import site does not
        // want it on the stack.
        self.pop();
        Ok(result)
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        self.current_module = None;
        crate::error::clear_native_error();
        debug!("vm state reset after runtime error");
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        // Final collection with an emptied root set runs every object's
        // destructor; the arena and pool drops then release the storage.
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        self.globals.clear();
        self.struct_defs.clear();
        self.modules = ModuleRegistry::new();
        self.protos = Prototypes {
            object: Handle::from_raw(u32::MAX),
            array: Handle::from_raw(u32::MAX),
            string: Handle::from_raw(u32::MAX),
            number: Handle::from_raw(u32::MAX),
            function: Handle::from_raw(u32::MAX),
        };
        self.collect_garbage();
    }
}

/// The single root enumeration. Every long-lived value container in the
/// VM must be walked here; the collector sees nothing else.
#[allow(clippy::too_many_arguments)]
fn visit_roots(
    marker: &mut swiftlang_core::Marker<'_>,
    stack: &[Value],
    frames: &[CallFrame],
    globals: &HashMap<StrId, Value>,
    open_upvalues: &[Handle],
    protos: &Prototypes,
    struct_defs: &HashMap<StrId, StructDef>,
    modules: &ModuleRegistry,
) {
    for &value in stack {
        marker.mark_value(value);
    }
    for value in globals.values() {
        marker.mark_value(*value);
    }
    for frame in frames {
        marker.mark_handle(frame.closure);
    }
    for &upvalue in open_upvalues {
        marker.mark_handle(upvalue);
    }
    marker.mark_handle(protos.object);
    marker.mark_handle(protos.array);
    marker.mark_handle(protos.string);
    marker.mark_handle(protos.number);
    marker.mark_handle(protos.function);
    for def in struct_defs.values() {
        marker.mark_handle(def.proto);
    }
    for (_, module) in modules.iter() {
        marker.mark_handle(module.object);
        for entry in module.scope.values() {
            marker.mark_value(entry.value);
        }
        for value in module.globals.values() {
            marker.mark_value(*value);
        }
    }
}
