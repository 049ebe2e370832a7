//! Modules: namespaces with private scope and exported bindings
//!
//! A module owns a private scope (name → value plus an exported bit), an
//! export list ordered by definition, a module-level globals table, and a
//! public module object whose properties mirror the exports. The module
//! object is an ordinary heap object so guest code can pass it around.
//!
//! Modules are cached and owned at loader level; the VM keeps them in a
//! central registry so the garbage collector's root walk can reach every
//! loaded module's scope, exports, globals, and module object without
//! consulting the loader tree.

use std::collections::HashMap;
use std::path::PathBuf;

use indexmap::IndexMap;
use swiftlang_core::{Handle, ModuleId, StrId, Value};

/// Lifecycle of a module.
///
/// Loading is observable: a cyclic import finds the module in `Loading`
/// and receives its partially-populated module object instead of
/// recursing forever. `Error` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Unloaded,
    Loading,
    Loaded,
    Error,
}

/// One binding in a module's private scope.
#[derive(Debug, Clone, Copy)]
pub struct ScopeEntry {
    pub value: Value,
    pub exported: bool,
}

/// A loaded (or loading) module.
#[derive(Debug)]
pub struct Module {
    /// The path the module was requested as (`"math/vec"`, `"$io"`).
    pub path: String,
    /// Resolved filesystem path; empty for native and synthetic modules.
    pub absolute_path: PathBuf,
    pub state: ModuleState,
    /// Private scope: every top-level binding, exported or not.
    pub scope: IndexMap<StrId, ScopeEntry>,
    /// Export names in definition order.
    pub exports: Vec<StrId>,
    /// Module-level globals, searched before VM globals while this module
    /// executes.
    pub globals: HashMap<StrId, Value>,
    /// The public module object; its properties equal the exports.
    pub object: Handle,
    /// Whether this module came from a native library.
    pub native: bool,
}

impl Module {
    pub fn new(path: String, absolute_path: PathBuf, object: Handle) -> Self {
        Self {
            path,
            absolute_path,
            state: ModuleState::Unloaded,
            scope: IndexMap::new(),
            exports: Vec::new(),
            globals: HashMap::new(),
            object,
            native: false,
        }
    }

    /// Define a binding in the private scope. Re-defining keeps scope
    /// position and export status unless `exported` upgrades it.
    pub fn define(&mut self, name: StrId, value: Value, exported: bool) {
        let was_exported = match self.scope.get_mut(&name) {
            Some(entry) => {
                entry.value = value;
                let was = entry.exported;
                entry.exported = entry.exported || exported;
                was
            }
            None => {
                self.scope.insert(name, ScopeEntry { value, exported });
                false
            }
        };
        if exported && !was_exported {
            self.exports.push(name);
        }
    }

    pub fn lookup(&self, name: StrId) -> Option<Value> {
        self.scope.get(&name).map(|e| e.value)
    }

    pub fn export_count(&self) -> usize {
        self.exports.len()
    }
}

/// Central table of every module any loader has cached.
///
/// Loaders own their cache entries; the registry owns nothing but the
/// storage, and never evicts on its own (a loader eviction leaves the
/// registry slot in place so live handles stay valid until the GC frees
/// what nothing references).
#[derive(Default)]
pub struct ModuleRegistry {
    modules: Vec<Module>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, module: Module) -> ModuleId {
        self.modules.push(module);
        ModuleId((self.modules.len() - 1) as u32)
    }

    pub fn get(&self, id: ModuleId) -> Option<&Module> {
        self.modules.get(id.0 as usize)
    }

    pub fn get_mut(&mut self, id: ModuleId) -> Option<&mut Module> {
        self.modules.get_mut(id.0 as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ModuleId, &Module)> {
        self.modules
            .iter()
            .enumerate()
            .map(|(i, m)| (ModuleId(i as u32), m))
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}
