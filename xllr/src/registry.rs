//! The plugin registry and loader.
//!
//! Each plugin name gets its own init cell, so loading or releasing one
//! plugin never waits on another. Function ids and handles are looked up
//! through the runtime id they carry; once a plugin is torn down its runtime
//! id is gone for good and everything issued under it stops resolving.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use lazy_static::lazy_static;
use log::{debug, info, trace, warn};
use parking_lot::{Mutex, RwLock};

use crate::arena::{Slab, SlotId};
use crate::callback::CallbackTable;
use crate::handle::{HandleTable, Released, RuntimeId};
use crate::native::NativePlugin;
use crate::plugin::{EntityToken, ModuleLocation, ModuleToken, RuntimePlugin};
use crate::{
    Binding, EntityPath, ErrorKind, Handle, Signature, TypeDescriptor, XllrCreateInfo, XllrError,
};

pub type PluginFactory = dyn Fn() -> Result<Box<dyn RuntimePlugin>, XllrError> + Send + Sync;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

lazy_static! {
    static ref GLOBAL: Xllr = Xllr::new(XllrCreateInfo::from_env());
}

/// Names one resolved entity for as long as its plugin stays loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionId {
    runtime: RuntimeId,
    slot: SlotId,
}

impl FunctionId {
    pub fn runtime(&self) -> RuntimeId {
        self.runtime
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fn {}:{}@{}",
            self.slot.index, self.slot.generation, self.runtime.0
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PluginHandle {
    runtime: RuntimeId,
    name: Arc<str>,
}

impl PluginHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn runtime(&self) -> RuntimeId {
        self.runtime
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleHandle {
    plugin: PluginHandle,
    token: ModuleToken,
    location: Arc<str>,
}

impl ModuleHandle {
    pub fn plugin(&self) -> &PluginHandle {
        &self.plugin
    }

    pub fn location(&self) -> &str {
        &self.location
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInfo {
    pub name: String,
    pub runtime: RuntimeId,
    pub use_count: usize,
    pub modules: usize,
    pub functions: usize,
    pub live_handles: usize,
}

#[derive(Clone)]
pub(crate) struct FunctionEntry {
    pub(crate) entity: EntityToken,
    pub(crate) signature: Arc<Signature>,
    pub(crate) binding: Arc<Binding>,
    pub(crate) path: Arc<str>,
}

type ResolveKey = (ModuleToken, String, Signature);

pub(crate) struct PluginState {
    pub(crate) name: String,
    pub(crate) runtime: RuntimeId,
    pub(crate) plugin: Box<dyn RuntimePlugin>,
    pub(crate) handles: HandleTable,
    modules: Mutex<HashMap<String, ModuleToken>>,
    functions: RwLock<Slab<FunctionEntry>>,
    resolved: Mutex<HashMap<ResolveKey, FunctionId>>,
}

impl PluginState {
    pub(crate) fn add_function(
        &self,
        entity: EntityToken,
        signature: Arc<Signature>,
        binding: Arc<Binding>,
        path: &str,
    ) -> FunctionId {
        let slot = self.functions.write().insert(FunctionEntry {
            entity,
            signature,
            binding,
            path: path.into(),
        });
        FunctionId {
            runtime: self.runtime,
            slot,
        }
    }

    pub(crate) fn function(&self, function: FunctionId) -> Result<FunctionEntry, XllrError> {
        self.functions
            .read()
            .get(function.slot)
            .cloned()
            .ok_or_else(|| XllrError::UnknownFunction(function.to_string()))
    }
}

struct Loaded {
    state: Arc<PluginState>,
    use_count: usize,
}

#[derive(Default)]
struct PluginCell {
    loaded: Mutex<Option<Loaded>>,
}

pub(crate) struct XllrShared {
    id: u64,
    info: XllrCreateInfo,
    factories: RwLock<HashMap<String, Arc<PluginFactory>>>,
    plugins: Mutex<HashMap<String, Arc<PluginCell>>>,
    runtimes: RwLock<HashMap<RuntimeId, Arc<PluginState>>>,
    next_runtime: AtomicU32,
    pub(crate) callbacks: CallbackTable,
}

/// Entry point to the runtime. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Xllr {
    pub(crate) inner: Arc<XllrShared>,
}

impl fmt::Debug for Xllr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Xllr").field("id", &self.inner.id).finish()
    }
}

impl Xllr {
    pub fn new(info: XllrCreateInfo) -> Self {
        let id = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
        Self {
            inner: Arc::new(XllrShared {
                id,
                info,
                factories: RwLock::new(HashMap::new()),
                plugins: Mutex::new(HashMap::new()),
                runtimes: RwLock::new(HashMap::new()),
                next_runtime: AtomicU32::new(1),
                callbacks: CallbackTable::new(id),
            }),
        }
    }

    /// The process-wide instance, configured from the environment.
    pub fn global() -> &'static Xllr {
        &GLOBAL
    }

    pub fn create_info(&self) -> &XllrCreateInfo {
        &self.inner.info
    }

    /// Makes an in-process plugin loadable under `name`. Takes precedence
    /// over native libraries of the same name.
    pub fn register_plugin<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Result<Box<dyn RuntimePlugin>, XllrError> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!("registered in-process plugin `{name}`");
        self.inner.factories.write().insert(name, Arc::new(factory));
    }

    fn create_plugin(&self, name: &str) -> Result<Box<dyn RuntimePlugin>, XllrError> {
        let factory = self.inner.factories.read().get(name).cloned();
        if let Some(factory) = factory {
            return factory();
        }
        let path = self.inner.info.find_plugin(name)?;
        debug!("loading native plugin `{name}` from {}", path.display());
        Ok(Box::new(NativePlugin::open(&path, name)?))
    }

    fn cell(&self, name: &str) -> Arc<PluginCell> {
        self.inner
            .plugins
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Loads `name` once; later calls share it and bump its use count.
    pub fn load_runtime_plugin(&self, name: &str) -> Result<PluginHandle, XllrError> {
        let cell = self.cell(name);
        let mut loaded = cell.loaded.lock();
        if let Some(loaded) = loaded.as_mut() {
            loaded.use_count += 1;
            debug!("plugin `{name}` already loaded, use count {}", loaded.use_count);
            return Ok(PluginHandle {
                runtime: loaded.state.runtime,
                name: name.into(),
            });
        }

        let plugin = self.create_plugin(name).map_err(|err| match err.kind() {
            ErrorKind::PluginNotFound | ErrorKind::PluginLoadFailed => err,
            _ => XllrError::PluginLoadFailed {
                name: name.to_string(),
                reason: err.to_string(),
            },
        })?;
        plugin.load_runtime().map_err(|err| XllrError::PluginLoadFailed {
            name: name.to_string(),
            reason: err.to_string(),
        })?;

        let runtime = RuntimeId(self.inner.next_runtime.fetch_add(1, Ordering::Relaxed));
        let state = Arc::new(PluginState {
            name: name.to_string(),
            runtime,
            plugin,
            handles: HandleTable::new(runtime, name),
            modules: Mutex::new(HashMap::new()),
            functions: RwLock::new(Slab::new()),
            resolved: Mutex::new(HashMap::new()),
        });
        self.inner.runtimes.write().insert(runtime, state.clone());
        *loaded = Some(Loaded {
            state,
            use_count: 1,
        });
        info!("loaded runtime plugin `{name}` as runtime {}", runtime.0);
        Ok(PluginHandle {
            runtime,
            name: name.into(),
        })
    }

    /// Drops one use. The last release tears the plugin down, unless guest
    /// objects or callables it issued are still referenced.
    pub fn release_runtime_plugin(&self, plugin: &PluginHandle) -> Result<(), XllrError> {
        let not_loaded = || XllrError::PluginNotFound {
            name: plugin.name().to_string(),
            reason: "not loaded".into(),
        };
        let cell = self
            .inner
            .plugins
            .lock()
            .get(plugin.name())
            .cloned()
            .ok_or_else(not_loaded)?;
        let mut slot = cell.loaded.lock();
        let loaded = slot
            .as_mut()
            .filter(|loaded| loaded.state.runtime == plugin.runtime)
            .ok_or_else(not_loaded)?;

        if loaded.use_count > 1 {
            loaded.use_count -= 1;
            debug!(
                "released plugin `{}`, use count {}",
                plugin.name(),
                loaded.use_count
            );
            return Ok(());
        }

        let live_handles = loaded.state.handles.live_count()
            + self.inner.callbacks.live_for(plugin.runtime);
        if live_handles > 0 {
            warn!(
                "refusing to unload plugin `{}`: {live_handles} live handles",
                plugin.name()
            );
            return Err(XllrError::StillInUse {
                name: plugin.name().to_string(),
                live_handles,
            });
        }

        if let Some(loaded) = slot.take() {
            self.teardown(&loaded.state);
        }
        Ok(())
    }

    fn teardown(&self, state: &PluginState) {
        self.inner.runtimes.write().remove(&state.runtime);
        let functions = state.functions.write().drain();
        for function in &functions {
            state.plugin.release_entity(function.entity);
        }
        state.resolved.lock().clear();
        state.modules.lock().clear();
        // handles issued after the live check by calls already in flight
        for native in state.handles.drain() {
            warn!("{}: releasing guest object {:#x} at teardown", state.name, native.0);
            if let Err(err) = state.plugin.release_handle(native) {
                warn!("{}: {err}", state.name);
            }
        }
        if let Err(err) = state.plugin.free_runtime() {
            warn!("plugin `{}` failed to shut down cleanly: {err}", state.name);
        }
        info!(
            "unloaded runtime plugin `{}` (runtime {}, {} functions)",
            state.name,
            state.runtime.0,
            functions.len()
        );
    }

    pub(crate) fn state(&self, runtime: RuntimeId) -> Option<Arc<PluginState>> {
        self.inner.runtimes.read().get(&runtime).cloned()
    }

    fn plugin_state(&self, plugin: &PluginHandle) -> Result<Arc<PluginState>, XllrError> {
        self.state(plugin.runtime)
            .ok_or_else(|| XllrError::PluginNotFound {
                name: plugin.name().to_string(),
                reason: "not loaded".into(),
            })
    }

    /// Loads a module; the same location string always yields the same
    /// module.
    pub fn load_module(
        &self,
        plugin: &PluginHandle,
        location: &str,
    ) -> Result<ModuleHandle, XllrError> {
        let state = self.plugin_state(plugin)?;
        let mut modules = state.modules.lock();
        let token = match modules.get(location) {
            Some(token) => {
                debug!("{}: module `{location}` already loaded", state.name);
                *token
            }
            None => {
                let token = state
                    .plugin
                    .load_module(&ModuleLocation::new(location))
                    .map_err(|err| match err.kind() {
                        ErrorKind::ModuleNotFound | ErrorKind::ModuleLoadFailed => err,
                        _ => XllrError::ModuleLoadFailed {
                            location: location.to_string(),
                            reason: err.to_string(),
                        },
                    })?;
                modules.insert(location.to_string(), token);
                debug!("{}: loaded module `{location}`", state.name);
                token
            }
        };
        Ok(ModuleHandle {
            plugin: plugin.clone(),
            token,
            location: location.into(),
        })
    }

    /// Resolves `entity_path` in `module` for the given parameter and return
    /// types. Identical requests yield the same function id.
    pub fn load_entity(
        &self,
        module: &ModuleHandle,
        entity_path: &str,
        params: &[TypeDescriptor],
        retvals: &[TypeDescriptor],
    ) -> Result<FunctionId, XllrError> {
        let path = EntityPath::parse(entity_path)?;
        let signature = Signature::new(params.iter().cloned(), retvals.iter().cloned());
        signature.validate()?;
        let state = self.plugin_state(module.plugin())?;
        if !state.modules.lock().values().any(|token| *token == module.token) {
            return Err(XllrError::ModuleNotFound {
                location: module.location().to_string(),
                reason: format!("not loaded in plugin `{}`", state.name),
            });
        }

        let key = (module.token, entity_path.to_string(), signature.clone());
        let mut resolved = state.resolved.lock();
        if let Some(function) = resolved.get(&key) {
            trace!("{}: `{entity_path}` cached as {function}", state.name);
            return Ok(*function);
        }

        let entity = state
            .plugin
            .resolve_entity(module.token, &path, &signature)
            .map_err(|err| {
                if err.kind().is_load_time() {
                    err
                } else {
                    XllrError::EntityNotFound {
                        path: entity_path.to_string(),
                        reason: err.to_string(),
                    }
                }
            })?;
        let binding = if entity.binding.is_static() {
            "static"
        } else {
            "dynamic"
        };
        let function = state.add_function(
            entity.entity,
            Arc::new(signature),
            Arc::new(entity.binding),
            entity_path,
        );
        resolved.insert(key, function);
        debug!(
            "{}: resolved `{entity_path}` in `{}` as {function} ({binding})",
            state.name,
            module.location()
        );
        Ok(function)
    }

    pub(crate) fn release_function(&self, function: FunctionId) {
        let Some(state) = self.state(function.runtime) else {
            return;
        };
        let entry = state.functions.write().remove(function.slot);
        if let Some(entry) = entry {
            trace!("{}: released {function} ({})", state.name, entry.path);
            state.plugin.release_entity(entry.entity);
        }
    }

    pub fn retain_handle(&self, handle: Handle) -> Result<Handle, XllrError> {
        let state = self
            .state(handle.runtime())
            .ok_or(XllrError::UnknownHandle(handle))?;
        state.handles.retain(handle)
    }

    /// Drops one reference; the last one asks the owning plugin to let go of
    /// the guest object.
    pub fn release_handle(&self, handle: Handle) -> Result<(), XllrError> {
        let state = self
            .state(handle.runtime())
            .ok_or(XllrError::UnknownHandle(handle))?;
        match state.handles.release(handle)? {
            Released::Retained(_) => Ok(()),
            Released::Dropped(native) => {
                trace!("{}: dropping guest object behind {handle}", state.name);
                state.plugin.release_handle(native)
            }
        }
    }

    pub fn is_null(&self, handle: Handle) -> bool {
        handle.is_null()
    }

    /// Current count of a live handle.
    pub fn handle_count(&self, handle: Handle) -> Option<u32> {
        self.state(handle.runtime())?.handles.count(handle)
    }

    pub fn loaded_plugins(&self) -> Vec<PluginInfo> {
        let cells: Vec<Arc<PluginCell>> = self.inner.plugins.lock().values().cloned().collect();
        let mut plugins: Vec<PluginInfo> = cells
            .iter()
            .filter_map(|cell| {
                let loaded = cell.loaded.lock();
                let loaded = loaded.as_ref()?;
                let state = &loaded.state;
                Some(PluginInfo {
                    name: state.name.clone(),
                    runtime: state.runtime,
                    use_count: loaded.use_count,
                    modules: state.modules.lock().len(),
                    functions: state.functions.read().len(),
                    live_handles: state.handles.live_count(),
                })
            })
            .collect();
        plugins.sort_by_key(|plugin| plugin.runtime);
        plugins
    }
}
