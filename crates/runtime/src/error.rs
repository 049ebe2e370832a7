//! Runtime error handling
//!
//! Guest-level failures are [`RuntimeError`]: a kind from the fixed
//! taxonomy, a message, and the call-stack trace captured at the point of
//! failure. Every kind aborts the current guest computation; the embedder
//! receives the error after the dispatcher has printed the trace and reset
//! the stack.
//!
//! Native functions cannot return a `Result` across the `extern "C"`
//! boundary, so they report through thread-local error state instead: a
//! native sets the pending error and returns nil, and the dispatcher
//! converts the pending state into a `RuntimeError` as soon as the call
//! returns.

use std::cell::RefCell;
use std::fmt;
use std::io;
use std::path::PathBuf;

/// The §-fixed error taxonomy raised to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Wrong value kind for an operation.
    Type,
    /// Call argument count does not match the callee's arity.
    Arity,
    /// String index out of range.
    Bounds,
    /// Unknown global, unbound upvalue, or missing module export.
    UndefinedBinding,
    /// Division or modulo by zero.
    Arithmetic,
    /// Frame stack overflow.
    Capacity,
    /// The collector could not free enough memory for a request.
    Allocation,
    /// Module load, parse, compile or initialization failure.
    Module,
}

impl ErrorKind {
    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::Type => "type error",
            ErrorKind::Arity => "arity error",
            ErrorKind::Bounds => "bounds error",
            ErrorKind::UndefinedBinding => "undefined binding",
            ErrorKind::Arithmetic => "arithmetic error",
            ErrorKind::Capacity => "capacity error",
            ErrorKind::Allocation => "allocation error",
            ErrorKind::Module => "module error",
        }
    }
}

/// One call frame as it appears in a stack trace, topmost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub function: String,
    pub line: u32,
}

/// A guest computation failure.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub kind: ErrorKind,
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl RuntimeError {
    /// An error with no trace yet; the VM attaches the frames when the
    /// error crosses the dispatcher.
    pub fn bare(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            trace: Vec::new(),
        }
    }

    /// Render the trace the way the dispatcher prints it: one line per
    /// frame, topmost first.
    pub fn render_trace(&self) -> String {
        let mut out = String::new();
        for frame in &self.trace {
            out.push_str(&format!(
                "  [line {}] in {}\n",
                frame.line, frame.function
            ));
        }
        out
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.label(), self.message)
    }
}

impl std::error::Error for RuntimeError {}

/// Loader-side failures. These surface to the guest as
/// `ErrorKind::Module` but keep structured detail for embedders.
#[derive(Debug)]
pub enum ModuleError {
    /// No loader in the chain could resolve the path.
    NotFound(String),
    /// Filesystem failure while reading a module.
    Io(PathBuf, io::Error),
    /// Container failed magic/checksum/layout verification.
    Corrupt(String),
    /// The front-end compiler rejected a source module.
    Compile(String),
    /// dlopen/symbol failure or an initializer that returned false.
    Native(String),
    /// The module's top-level code raised a runtime error.
    Init(String),
    /// The module is in the Error state from an earlier failure.
    Poisoned(String),
}

impl fmt::Display for ModuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleError::NotFound(path) => write!(f, "module not found: {}", path),
            ModuleError::Io(path, err) => {
                write!(f, "failed to read module '{}': {}", path.display(), err)
            }
            ModuleError::Corrupt(msg) => write!(f, "corrupt module container: {}", msg),
            ModuleError::Compile(msg) => write!(f, "module compilation failed: {}", msg),
            ModuleError::Native(msg) => write!(f, "native module failure: {}", msg),
            ModuleError::Init(msg) => write!(f, "module initialization failed: {}", msg),
            ModuleError::Poisoned(path) => {
                write!(f, "module '{}' previously failed to load", path)
            }
        }
    }
}

impl std::error::Error for ModuleError {}

impl From<ModuleError> for RuntimeError {
    fn from(err: ModuleError) -> Self {
        RuntimeError::bare(ErrorKind::Module, err.to_string())
    }
}

thread_local! {
    /// Pending error reported by a native function. Checked and drained by
    /// the dispatcher immediately after every native call returns.
    static NATIVE_ERROR: RefCell<Option<(ErrorKind, String)>> = const { RefCell::new(None) };
}

/// Record an error from inside a native function. The value the native
/// returns is discarded once an error is pending.
pub fn set_native_error(kind: ErrorKind, msg: impl Into<String>) {
    NATIVE_ERROR.with(|e| {
        *e.borrow_mut() = Some((kind, msg.into()));
    });
}

/// Take (and clear) the pending native error.
pub fn take_native_error() -> Option<(ErrorKind, String)> {
    NATIVE_ERROR.with(|e| e.borrow_mut().take())
}

pub fn has_native_error() -> bool {
    NATIVE_ERROR.with(|e| e.borrow().is_some())
}

pub fn clear_native_error() {
    NATIVE_ERROR.with(|e| *e.borrow_mut() = None);
}
