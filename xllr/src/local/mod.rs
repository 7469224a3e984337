//! An in-process runtime plugin whose guest code is Rust closures.
//!
//! Modules are registered under a location string and loaded through the
//! registry like any other plugin's modules. Guest objects live in the
//! runtime's object store and reach the host as handles.

mod module;

#[cfg(test)]
pub(crate) mod fixtures;

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

pub use module::{GuestFn, LocalClass, LocalModule};

use module::{FieldGetter, FieldSetter};

use crate::arena::{Slab, SlotId};
use crate::entity::{Accessor, Member};
use crate::plugin::{
    EntityToken, ModuleLocation, ModuleToken, PluginCall, ResolvedEntity, RuntimePlugin,
};
use crate::{
    Binding, Callable, Cdt, Cdts, EntityPath, FromCdt, Handle, NativeRef, Signature, Xllr,
    XllrError,
};

/// A failure raised by guest code. Reaches the caller as `InvocationFailed`.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct GuestError {
    message: String,
    exception: Option<Handle>,
}

impl GuestError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exception: None,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn exception(&self) -> Option<Handle> {
        self.exception
    }

    fn into_xllr(self) -> XllrError {
        XllrError::InvocationFailed {
            message: self.message,
            exception: self.exception,
        }
    }
}

impl From<XllrError> for GuestError {
    fn from(err: XllrError) -> Self {
        match err {
            XllrError::InvocationFailed { message, exception } => Self { message, exception },
            other => Self::new(other.to_string()),
        }
    }
}

#[derive(Clone)]
struct GuestObject {
    class: Arc<str>,
    value: Arc<dyn Any + Send + Sync>,
}

#[derive(Clone)]
enum LocalEntity {
    Function {
        body: GuestFn,
        receiver: Option<Arc<str>>,
    },
    FieldGet {
        class: Arc<str>,
        get: FieldGetter,
    },
    FieldSet {
        class: Arc<str>,
        set: FieldSetter,
    },
    AttributeGet(Arc<Mutex<Cdt>>),
    AttributeSet(Arc<Mutex<Cdt>>),
}

struct LocalShared {
    name: String,
    modules: RwLock<HashMap<String, Arc<LocalModule>>>,
    loaded: Mutex<Slab<Vec<Arc<LocalModule>>>>,
    entities: Mutex<Slab<LocalEntity>>,
    objects: Mutex<Slab<GuestObject>>,
    running: AtomicBool,
}

impl LocalShared {
    fn object(&self, native: NativeRef) -> Result<GuestObject, XllrError> {
        self.objects
            .lock()
            .get(SlotId::from_bits(native.0))
            .cloned()
            .ok_or_else(|| XllrError::invocation(format!("no guest object {:#x}", native.0)))
    }

    fn receiver(&self, call: &PluginCall<'_>, class: &str) -> Result<GuestObject, XllrError> {
        let receiver = call.param(0)?;
        let handle = receiver.as_handle().ok_or_else(|| {
            XllrError::invocation(format!("receiver is {}, expected a handle", receiver.cdt_type()))
        })?;
        let object = self.object(call.native_of(handle)?)?;
        if &*object.class != class {
            return Err(XllrError::invocation(format!(
                "receiver {handle} is a `{}`, expected `{class}`",
                object.class
            )));
        }
        Ok(object)
    }
}

/// Cheap to clone; clones are the same runtime.
#[derive(Clone)]
pub struct LocalRuntime {
    inner: Arc<LocalShared>,
}

impl LocalRuntime {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(LocalShared {
                name: name.into(),
                modules: RwLock::new(HashMap::new()),
                loaded: Mutex::new(Slab::new()),
                entities: Mutex::new(Slab::new()),
                objects: Mutex::new(Slab::new()),
                running: AtomicBool::new(false),
            }),
        }
    }

    pub fn with_module(self, location: impl Into<String>, module: LocalModule) -> Self {
        self.add_module(location, module);
        self
    }

    pub fn add_module(&self, location: impl Into<String>, module: LocalModule) {
        self.inner
            .modules
            .write()
            .insert(location.into(), Arc::new(module));
    }

    /// Makes this runtime loadable from `xllr` under its name.
    pub fn register(&self, xllr: &Xllr) {
        let runtime = self.clone();
        xllr.register_plugin(self.inner.name.clone(), move || {
            Ok(Box::new(runtime.clone()) as Box<dyn RuntimePlugin>)
        });
    }

    pub fn live_objects(&self) -> usize {
        self.inner.objects.lock().len()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn resolve(
        &self,
        modules: &[Arc<LocalModule>],
        path: &EntityPath,
    ) -> Result<(Signature, LocalEntity), XllrError> {
        let not_found = |reason: String| XllrError::EntityNotFound {
            path: path.to_string(),
            reason,
        };
        let find_class = |owner: &str| {
            modules
                .iter()
                .find_map(|module| module.classes.get(owner))
                .ok_or_else(|| not_found(format!("no class `{owner}`")))
        };

        match path.member() {
            Member::Callable(_) => {
                let name = path.member_name();
                let Some(owner) = path.owner() else {
                    let def = modules
                        .iter()
                        .find_map(|module| module.functions.get(name))
                        .ok_or_else(|| not_found(format!("no function `{name}`")))?;
                    if path.instance_required() {
                        return Err(not_found(format!("`{name}` is a free function")));
                    }
                    return Ok((
                        def.signature.clone(),
                        LocalEntity::Function {
                            body: def.body.clone(),
                            receiver: None,
                        },
                    ));
                };

                let class = find_class(owner)?;
                if path.is_constructor() {
                    let def = class
                        .constructor
                        .as_ref()
                        .ok_or_else(|| not_found(format!("`{owner}` has no constructor")))?;
                    if path.instance_required() {
                        return Err(not_found("constructors take no receiver".into()));
                    }
                    return Ok((
                        def.signature.clone(),
                        LocalEntity::Function {
                            body: def.body.clone(),
                            receiver: None,
                        },
                    ));
                }

                let method = class
                    .methods
                    .get(name)
                    .ok_or_else(|| not_found(format!("`{owner}` has no method `{name}`")))?;
                match (method.instance, path.instance_required()) {
                    (true, false) => Err(not_found(format!(
                        "`{name}` is an instance method; add instance_required"
                    ))),
                    (false, true) => Err(not_found(format!(
                        "`{name}` is static; drop instance_required"
                    ))),
                    (true, true) => {
                        let mut params = vec![class.this_type()];
                        params.extend(method.def.signature.params.iter().cloned());
                        Ok((
                            Signature {
                                params,
                                retvals: method.def.signature.retvals.clone(),
                            },
                            LocalEntity::Function {
                                body: method.def.body.clone(),
                                receiver: Some(class.name.as_str().into()),
                            },
                        ))
                    }
                    (false, false) => Ok((
                        method.def.signature.clone(),
                        LocalEntity::Function {
                            body: method.def.body.clone(),
                            receiver: None,
                        },
                    )),
                }
            }
            Member::Field(name) => {
                let owner = path
                    .class()
                    .ok_or_else(|| not_found("fields need a `class`".into()))?;
                let class = find_class(owner)?;
                let field = class
                    .fields
                    .get(name.as_str())
                    .ok_or_else(|| not_found(format!("`{owner}` has no field `{name}`")))?;
                if !path.instance_required() {
                    return Err(not_found(format!(
                        "`{name}` is an instance field; add instance_required"
                    )));
                }
                let this = class.this_type();
                let class_name: Arc<str> = class.name.as_str().into();
                match path.accessor() {
                    Some(Accessor::Getter) => Ok((
                        Signature::new([this], [field.descriptor.clone()]),
                        LocalEntity::FieldGet {
                            class: class_name,
                            get: field.get.clone(),
                        },
                    )),
                    Some(Accessor::Setter) => {
                        let set = field
                            .set
                            .clone()
                            .ok_or_else(|| not_found(format!("`{name}` is read-only")))?;
                        Ok((
                            Signature::new([this, field.descriptor.clone()], []),
                            LocalEntity::FieldSet {
                                class: class_name,
                                set,
                            },
                        ))
                    }
                    None => Err(not_found(format!("no accessor given for `{name}`"))),
                }
            }
            Member::Attribute(name) => {
                if path.class().is_some() || path.instance_required() {
                    return Err(not_found(format!("`{name}`: attributes are module-level")));
                }
                let attribute = modules
                    .iter()
                    .find_map(|module| module.attributes.get(name.as_str()))
                    .ok_or_else(|| not_found(format!("no attribute `{name}`")))?;
                match path.accessor() {
                    Some(Accessor::Getter) => Ok((
                        Signature::new([], [attribute.descriptor.clone()]),
                        LocalEntity::AttributeGet(attribute.value.clone()),
                    )),
                    Some(Accessor::Setter) => Ok((
                        Signature::new([attribute.descriptor.clone()], []),
                        LocalEntity::AttributeSet(attribute.value.clone()),
                    )),
                    None => Err(not_found(format!("no accessor given for `{name}`"))),
                }
            }
        }
    }
}

impl RuntimePlugin for LocalRuntime {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn load_runtime(&self) -> Result<(), XllrError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(XllrError::PluginLoadFailed {
                name: self.inner.name.clone(),
                reason: "runtime already started in this process".into(),
            });
        }
        debug!("{}: runtime started", self.inner.name);
        Ok(())
    }

    fn free_runtime(&self) -> Result<(), XllrError> {
        self.inner.loaded.lock().drain();
        self.inner.entities.lock().drain();
        let leaked = self.inner.objects.lock().drain().len();
        if leaked > 0 {
            warn!("{}: {leaked} guest objects outlived the runtime", self.inner.name);
        }
        self.inner.running.store(false, Ordering::SeqCst);
        debug!("{}: runtime stopped", self.inner.name);
        Ok(())
    }

    fn load_module(&self, location: &ModuleLocation) -> Result<ModuleToken, XllrError> {
        let artifacts = location.artifacts();
        if artifacts.is_empty() {
            return Err(XllrError::ModuleNotFound {
                location: location.to_string(),
                reason: "empty location".into(),
            });
        }
        let registered = self.inner.modules.read();
        let modules = artifacts
            .iter()
            .map(|artifact| {
                let key = artifact.to_string_lossy();
                registered.get(key.as_ref()).cloned().ok_or_else(|| {
                    XllrError::ModuleNotFound {
                        location: location.to_string(),
                        reason: format!("no module registered as `{key}`"),
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let id = self.inner.loaded.lock().insert(modules);
        Ok(ModuleToken(id.to_bits()))
    }

    fn resolve_entity(
        &self,
        module: ModuleToken,
        path: &EntityPath,
        signature: &Signature,
    ) -> Result<ResolvedEntity, XllrError> {
        let modules = self
            .inner
            .loaded
            .lock()
            .get(SlotId::from_bits(module.0))
            .cloned()
            .ok_or_else(|| XllrError::ModuleNotFound {
                location: format!("{:#x}", module.0),
                reason: "module not loaded".into(),
            })?;
        let (declared, entity) = self.resolve(&modules, path)?;
        let binding = Binding::bind(&declared, signature)?;
        let id = self.inner.entities.lock().insert(entity);
        Ok(ResolvedEntity {
            entity: EntityToken(id.to_bits()),
            binding,
        })
    }

    fn invoke(&self, entity: EntityToken, call: &mut PluginCall<'_>) -> Result<(), XllrError> {
        let entity = self
            .inner
            .entities
            .lock()
            .get(SlotId::from_bits(entity.0))
            .cloned()
            .ok_or_else(|| XllrError::UnknownFunction(format!("entity {:#x}", entity.0)))?;
        call.check_params()?;

        match entity {
            LocalEntity::Function { body, receiver } => {
                if let Some(class) = &receiver {
                    self.inner.receiver(call, class)?;
                }
                let mut guest = GuestCall {
                    call: &mut *call,
                    runtime: &self.inner,
                    has_receiver: receiver.is_some(),
                };
                body(&mut guest).map_err(GuestError::into_xllr)?;
            }
            LocalEntity::FieldGet { class, get } => {
                let object = self.inner.receiver(call, &class)?;
                let value = get(object.value.as_ref()).map_err(GuestError::into_xllr)?;
                call.push_ret(value)?;
            }
            LocalEntity::FieldSet { class, set } => {
                let object = self.inner.receiver(call, &class)?;
                let value = call.param(1)?.clone();
                set(object.value.as_ref(), value).map_err(GuestError::into_xllr)?;
            }
            LocalEntity::AttributeGet(value) => {
                let value = value.lock().clone();
                call.push_ret(value)?;
            }
            LocalEntity::AttributeSet(value) => {
                *value.lock() = call.param(0)?.clone();
            }
        }
        call.check_retvals()
    }

    fn release_handle(&self, native: NativeRef) -> Result<(), XllrError> {
        self.inner
            .objects
            .lock()
            .remove(SlotId::from_bits(native.0))
            .map(|_| ())
            .ok_or_else(|| XllrError::InvalidValue(format!("no guest object {:#x}", native.0)))
    }

    fn release_entity(&self, entity: EntityToken) {
        self.inner.entities.lock().remove(SlotId::from_bits(entity.0));
    }
}

/// What guest code sees of the call it is running in.
pub struct GuestCall<'a, 'c> {
    call: &'a mut PluginCall<'c>,
    runtime: &'a LocalShared,
    has_receiver: bool,
}

impl<'a, 'c> GuestCall<'a, 'c> {
    pub fn xllr(&self) -> &Xllr {
        self.call.xllr()
    }

    fn slot(&self, index: usize) -> usize {
        index + usize::from(self.has_receiver)
    }

    /// Arguments after the receiver, if any.
    pub fn arg_count(&self) -> usize {
        self.call.params().len() - usize::from(self.has_receiver)
    }

    pub fn arg_cdt(&self, index: usize) -> Result<&Cdt, GuestError> {
        Ok(self.call.param(self.slot(index))?)
    }

    pub fn arg<T: FromCdt>(&self, index: usize) -> Result<T, GuestError> {
        Ok(self.arg_cdt(index)?.get::<T>()?)
    }

    pub fn this<T: Any + Send + Sync>(&self) -> Result<Arc<T>, GuestError> {
        if !self.has_receiver {
            return Err(GuestError::new("called without a receiver"));
        }
        let handle = self.call.param(0)?.get::<Handle>()?;
        self.object(handle)
    }

    /// The guest object behind a handle this runtime issued.
    pub fn object<T: Any + Send + Sync>(&self, handle: Handle) -> Result<Arc<T>, GuestError> {
        let object = self.runtime.object(self.call.native_of(handle)?)?;
        let class = object.class;
        object
            .value
            .downcast::<T>()
            .map_err(|_| GuestError::new(format!("{handle} is a `{class}` of another type")))
    }

    pub fn ret(&mut self, value: impl Into<Cdt>) -> Result<(), GuestError> {
        Ok(self.call.push_ret(value)?)
    }

    /// Stores `value` as a guest object and issues a handle for it.
    pub fn new_object<T: Any + Send + Sync>(&mut self, class: &str, value: T) -> Handle {
        let id = self.runtime.objects.lock().insert(GuestObject {
            class: class.into(),
            value: Arc::new(value),
        });
        self.call.issue_handle(NativeRef(id.to_bits()))
    }

    /// A failure carrying a guest exception object the caller can inspect
    /// and must release.
    pub fn raise<T: Any + Send + Sync>(
        &mut self,
        class: &str,
        value: T,
        message: impl Into<String>,
    ) -> GuestError {
        let exception = self.new_object(class, value);
        GuestError {
            message: message.into(),
            exception: Some(exception),
        }
    }

    pub fn call(
        &self,
        callable: &Callable,
        params: impl IntoIterator<Item = Cdt>,
    ) -> Result<Cdts, GuestError> {
        Ok(self.call.call(callable, params.into_iter().collect())?)
    }

    /// Gives back the references in values the guest received, such as a
    /// callback's results.
    pub fn release(&self, values: &Cdts) -> Result<(), GuestError> {
        Ok(self.xllr().release_values(values)?)
    }

    /// Hands a guest closure out as a callable.
    pub fn export<F>(&mut self, signature: Signature, body: F) -> Result<Callable, GuestError>
    where
        F: Fn(&mut GuestCall<'_, '_>) -> Result<(), GuestError> + Send + Sync + 'static,
    {
        let id = self.runtime.entities.lock().insert(LocalEntity::Function {
            body: Arc::new(body),
            receiver: None,
        });
        Ok(self.call.export_callable(EntityToken(id.to_bits()), signature)?)
    }
}
