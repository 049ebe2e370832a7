//! swiftlang runtime: the virtual machine around the core object model
//!
//! Key design principles:
//! - Vm: owns every piece of guest-visible state; two VMs share nothing
//! - Dispatcher: one opcode completes before the next starts; the
//!   collector only runs at allocation points, stop-the-world
//! - Natives: C calling convention plus a thread-local VM context; errors
//!   cross the boundary through a pending-error cell, never by unwinding
//! - Loaders: a delegation chain of caches; the first loader to resolve a
//!   module owns it

pub mod bootstrap;
pub mod container;
pub mod convert;
pub mod dispatch;
pub mod error;
pub mod loader;
pub mod manifest;
pub mod module;
pub mod nativeapi;
pub mod trace;
pub mod vm;

// Re-export key types
pub use container::{
    Container, ContainerWriter, ExportEntry, ExportKind, ImportEntry, Metadata, NativeEntry,
    SectionType,
};
pub use convert::number_to_string;
pub use error::{ErrorKind, ModuleError, RuntimeError, TraceFrame};
pub use loader::{Loader, LoaderKind, LoaderStats};
pub use manifest::{Manifest, PackageType};
pub use module::{Module, ModuleRegistry, ModuleState, ScopeEntry};
pub use nativeapi::{NativeModuleCtx, NativeModuleInit, init_symbol, with_vm};
pub use trace::disassemble_instruction;
pub use vm::{CallFrame, FRAMES_MAX, ModuleCompiler, Prototypes, StructDef, Vm};

// The core model is part of this crate's public surface.
pub use swiftlang_core as core;
pub use swiftlang_core::{
    Chunk, Closure, Function, Gc, GcConfig, GcPhase, GcStats, Handle, Heap, HeapData, ModuleId,
    NativeFn, Object, OpCode, ProtoKind, StrId, StringPool, StructInstance, Upvalue, Value,
};
