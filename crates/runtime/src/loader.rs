//! The module loader hierarchy
//!
//! Loaders form a delegation chain: Bootstrap → System → Application →
//! Child. A load request consults the loader's own cache, delegates to
//! the parent, and only if the whole chain misses resolves against its
//! own search paths. The first loader to resolve a module owns its cache
//! entry; children borrow by delegation and never evict what a parent
//! owns.
//!
//! Resolution per path element:
//! - `name.sl`       source module, compiled through the VM's compiler seam
//! - `name.slb`      compiled-module container (verified before use)
//! - `name/module.json`  package directory driven by its manifest
//! - `$name`         native module: `lib<name>` / `<name>` dynamic library,
//!   initialized through `swiftlang_<mangled>_module_init`
//!
//! Caches are guarded by a reader-writer lock: concurrent readers share,
//! writers exclude. Native library handles are owned by the loader that
//! opened them and released when that loader is dropped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::debug;

use swiftlang_core::{HeapData, ModuleId, Object, Value};

use crate::error::ModuleError;
use crate::manifest::{Manifest, PackageType};
use crate::module::{Module, ModuleState};
use crate::nativeapi::{NativeModuleCtx, NativeModuleInit, init_symbol};
use crate::vm::Vm;

pub const SOURCE_EXT: &str = "sl";
pub const CONTAINER_EXT: &str = "slb";

#[cfg(target_os = "macos")]
const DYLIB_EXT: &str = "dylib";
#[cfg(not(target_os = "macos"))]
const DYLIB_EXT: &str = "so";

/// Position of a loader in the delegation chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderKind {
    Bootstrap,
    System,
    Application,
    Child,
}

#[derive(Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Snapshot of one loader's cache behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub cached: usize,
}

pub struct Loader {
    kind: LoaderKind,
    parent: Option<Arc<Loader>>,
    cache: RwLock<HashMap<String, ModuleId>>,
    counters: CacheCounters,
    search_paths: RwLock<Vec<PathBuf>>,
    /// Native libraries this loader opened; closed when it drops.
    libraries: Mutex<Vec<libloading::Library>>,
}

impl Loader {
    pub fn new(kind: LoaderKind, parent: Option<Arc<Loader>>) -> Arc<Loader> {
        Arc::new(Loader {
            kind,
            parent,
            cache: RwLock::new(HashMap::new()),
            counters: CacheCounters::default(),
            search_paths: RwLock::new(Vec::new()),
            libraries: Mutex::new(Vec::new()),
        })
    }

    /// The standard chain: a bootstrap root (intrinsics live on the VM
    /// before user code), a system loader reading `SWIFTLANG_STDLIB`, and
    /// an application loader rooted in the current directory.
    pub fn default_chain() -> Arc<Loader> {
        let bootstrap = Loader::new(LoaderKind::Bootstrap, None);
        let system = Loader::new(LoaderKind::System, Some(bootstrap));
        if let Ok(stdlib) = std::env::var("SWIFTLANG_STDLIB") {
            system.add_search_path(PathBuf::from(stdlib));
        }
        let application = Loader::new(LoaderKind::Application, Some(system));
        application.add_search_path(PathBuf::from("."));
        application
    }

    /// A child loader scoping additional search paths without touching
    /// the shared chain.
    pub fn child(parent: &Arc<Loader>) -> Arc<Loader> {
        Loader::new(LoaderKind::Child, Some(Arc::clone(parent)))
    }

    pub fn kind(&self) -> LoaderKind {
        self.kind
    }

    pub fn parent(&self) -> Option<&Arc<Loader>> {
        self.parent.as_ref()
    }

    pub fn add_search_path(&self, path: PathBuf) {
        self.search_paths
            .write()
            .expect("search path lock poisoned")
            .push(path);
    }

    pub fn stats(&self) -> LoaderStats {
        LoaderStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            cached: self.cache.read().expect("cache lock poisoned").len(),
        }
    }

    /// Drop this loader's cache entry for `spec`. The module itself stays
    /// in the VM registry; live references keep working.
    pub fn evict(&self, spec: &str) -> bool {
        let spec = normalize(spec);
        let removed = self
            .cache
            .write()
            .expect("cache lock poisoned")
            .remove(&spec)
            .is_some();
        if removed {
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Resolve `spec` to a loaded module, loading and initializing it on
    /// first use. A module whose top level is still running (a cyclic
    /// import) is returned as-is, partially populated.
    pub fn load(self: &Arc<Self>, vm: &mut Vm, spec: &str) -> Result<ModuleId, ModuleError> {
        let spec = normalize(spec);
        self.load_normalized(vm, &spec)
    }

    fn load_normalized(
        self: &Arc<Self>,
        vm: &mut Vm,
        spec: &str,
    ) -> Result<ModuleId, ModuleError> {
        let cached = self
            .cache
            .read()
            .expect("cache lock poisoned")
            .get(spec)
            .copied();
        if let Some(id) = cached {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            if vm.modules.get(id).map(|m| m.state) == Some(ModuleState::Error) {
                return Err(ModuleError::Poisoned(spec.to_string()));
            }
            return Ok(id);
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        if let Some(parent) = &self.parent {
            match parent.load_normalized(vm, spec) {
                Err(ModuleError::NotFound(_)) => {}
                other => return other,
            }
        }

        self.resolve(vm, spec)
    }

    fn resolve(self: &Arc<Self>, vm: &mut Vm, spec: &str) -> Result<ModuleId, ModuleError> {
        if let Some(native) = spec.strip_prefix('$') {
            return self.resolve_native(vm, spec, native);
        }
        let paths: Vec<PathBuf> = self
            .search_paths
            .read()
            .expect("search path lock poisoned")
            .clone();
        for dir in &paths {
            let source = dir.join(format!("{}.{}", spec, SOURCE_EXT));
            if source.is_file() {
                return self.load_source(vm, spec, &source);
            }
            let container = dir.join(format!("{}.{}", spec, CONTAINER_EXT));
            if container.is_file() {
                return self.load_container(vm, spec, &container);
            }
            let package = dir.join(spec);
            if package.join(crate::manifest::MANIFEST_FILE).is_file() {
                return self.load_package(vm, spec, &package);
            }
        }
        Err(ModuleError::NotFound(spec.to_string()))
    }

    // ---- source and container modules -------------------------------------

    fn load_source(
        self: &Arc<Self>,
        vm: &mut Vm,
        spec: &str,
        path: &Path,
    ) -> Result<ModuleId, ModuleError> {
        debug!(loader = ?self.kind, spec, path = %path.display(), "loading source module");
        let source =
            std::fs::read_to_string(path).map_err(|e| ModuleError::Io(path.to_path_buf(), e))?;

        let id = self.create_module(vm, spec, path.to_path_buf(), false)?;

        // The compiler seam borrows the VM, so the box steps aside for the
        // duration of the call.
        let compiler = vm
            .compiler
            .take()
            .ok_or_else(|| ModuleError::Compile("no compiler installed".to_string()))?;
        let compiled = compiler.compile(&source, path, vm);
        vm.compiler = Some(compiler);
        let function = match compiled {
            Ok(function) => function,
            Err(err) => {
                self.poison(vm, id);
                return Err(err);
            }
        };

        self.initialize(vm, id, function)?;
        Ok(id)
    }

    fn load_container(
        self: &Arc<Self>,
        vm: &mut Vm,
        spec: &str,
        path: &Path,
    ) -> Result<ModuleId, ModuleError> {
        debug!(loader = ?self.kind, spec, path = %path.display(), "loading container module");
        let bytes = std::fs::read(path).map_err(|e| ModuleError::Io(path.to_path_buf(), e))?;
        let container = crate::container::Container::parse(bytes)?;

        let id = self.create_module(vm, spec, path.to_path_buf(), false)?;
        let function = match container.decode_bytecode(vm) {
            Ok(function) => function,
            Err(err) => {
                self.poison(vm, id);
                return Err(err);
            }
        };
        self.initialize(vm, id, function)?;
        Ok(id)
    }

    fn load_package(
        self: &Arc<Self>,
        vm: &mut Vm,
        spec: &str,
        dir: &Path,
    ) -> Result<ModuleId, ModuleError> {
        let manifest = Manifest::load(dir)?;
        match manifest.package_type {
            PackageType::Native => {
                let stem = &manifest.name;
                for candidate in [
                    dir.join(format!("lib{}.{}", stem, DYLIB_EXT)),
                    dir.join(format!("{}.{}", stem, DYLIB_EXT)),
                ] {
                    if candidate.is_file() {
                        return self.load_native(vm, spec, stem, &candidate);
                    }
                }
                Err(ModuleError::Native(format!(
                    "package '{}' declares a native module but ships no library",
                    manifest.name
                )))
            }
            PackageType::Source => {
                let entry = manifest.entry_point().ok_or_else(|| {
                    ModuleError::Compile(format!(
                        "package '{}' has no main or sources",
                        manifest.name
                    ))
                })?;
                let path = dir.join(entry);
                if !path.is_file() {
                    return Err(ModuleError::Io(
                        path.clone(),
                        std::io::Error::new(std::io::ErrorKind::NotFound, "entry point missing"),
                    ));
                }
                self.load_source(vm, spec, &path)
            }
        }
    }

    /// Run a module's top level exactly once, transitioning Loading →
    /// Loaded (or Error).
    fn initialize(
        self: &Arc<Self>,
        vm: &mut Vm,
        id: ModuleId,
        function: swiftlang_core::Handle,
    ) -> Result<(), ModuleError> {
        stamp_module(vm, function, id);
        if let Err(err) = vm.run_module_body(function) {
            self.poison(vm, id);
            return Err(ModuleError::Init(err.to_string()));
        }
        if let Some(module) = vm.modules.get_mut(id) {
            module.state = ModuleState::Loaded;
        }
        Ok(())
    }

    // ---- native modules ----------------------------------------------------

    fn resolve_native(
        self: &Arc<Self>,
        vm: &mut Vm,
        spec: &str,
        name: &str,
    ) -> Result<ModuleId, ModuleError> {
        let paths: Vec<PathBuf> = self
            .search_paths
            .read()
            .expect("search path lock poisoned")
            .clone();
        for dir in &paths {
            for candidate in [
                dir.join(format!("lib{}.{}", name, DYLIB_EXT)),
                dir.join(format!("{}.{}", name, DYLIB_EXT)),
            ] {
                if candidate.is_file() {
                    return self.load_native(vm, spec, name, &candidate);
                }
            }
        }
        Err(ModuleError::NotFound(spec.to_string()))
    }

    fn load_native(
        self: &Arc<Self>,
        vm: &mut Vm,
        spec: &str,
        name: &str,
        path: &Path,
    ) -> Result<ModuleId, ModuleError> {
        debug!(loader = ?self.kind, spec, path = %path.display(), "loading native module");
        let library = unsafe { libloading::Library::new(path) }
            .map_err(|e| ModuleError::Native(format!("{}: {}", path.display(), e)))?;
        let symbol = init_symbol(name);
        let init: libloading::Symbol<'_, NativeModuleInit> =
            unsafe { library.get(symbol.as_bytes()) }.map_err(|e| {
                ModuleError::Native(format!("{} lacks {}: {}", path.display(), symbol, e))
            })?;
        let init: NativeModuleInit = *init;

        let id = self.create_module(vm, spec, path.to_path_buf(), true)?;
        let mut ctx = NativeModuleCtx::new(vm, id);
        let ok = unsafe { init(&mut ctx as *mut NativeModuleCtx) };
        if !ok {
            self.poison(vm, id);
            return Err(ModuleError::Native(format!(
                "{} returned failure from {}",
                path.display(),
                symbol
            )));
        }
        if let Some(module) = vm.modules.get_mut(id) {
            module.state = ModuleState::Loaded;
        }
        self.libraries
            .lock()
            .expect("library lock poisoned")
            .push(library);
        Ok(id)
    }

    // ---- shared plumbing ---------------------------------------------------

    /// Register the module (state Loading) in the VM registry and this
    /// loader's cache, so cyclic imports resolve to the same entry.
    fn create_module(
        self: &Arc<Self>,
        vm: &mut Vm,
        spec: &str,
        absolute_path: PathBuf,
        native: bool,
    ) -> Result<ModuleId, ModuleError> {
        let mut object = Object::new();
        object.set_prototype(Some(vm.protos.object));
        let object = vm
            .alloc(HeapData::Object(object))
            .map_err(|e| ModuleError::Init(e.to_string()))?;

        let mut module = Module::new(spec.to_string(), absolute_path, object);
        module.state = ModuleState::Loading;
        module.native = native;
        let id = vm.modules.add(module);
        self.cache
            .write()
            .expect("cache lock poisoned")
            .insert(spec.to_string(), id);
        Ok(id)
    }

    fn poison(&self, vm: &mut Vm, id: ModuleId) {
        if let Some(module) = vm.modules.get_mut(id) {
            module.state = ModuleState::Error;
        }
    }
}

/// Strip the decorations that would make equivalent specs distinct cache
/// keys.
fn normalize(spec: &str) -> String {
    let spec = spec.trim();
    let spec = spec.strip_prefix("./").unwrap_or(spec);
    spec.trim_end_matches('/').to_string()
}

/// Attach the module to a compiled function and, transitively, to every
/// function in its constant pools, so module-global resolution follows
/// the code wherever it is called from.
fn stamp_module(vm: &mut Vm, function: swiftlang_core::Handle, id: ModuleId) {
    let mut worklist = vec![function];
    while let Some(handle) = worklist.pop() {
        let nested: Vec<swiftlang_core::Handle> = match vm.heap.data_mut(handle) {
            Some(HeapData::Function(f)) => {
                f.module = Some(id);
                f.chunk
                    .constants()
                    .iter()
                    .filter_map(|v| match v {
                        Value::Function(h) => Some(*h),
                        _ => None,
                    })
                    .collect()
            }
            _ => Vec::new(),
        };
        worklist.extend(nested);
    }
}
