//! The contract a runtime plugin implements.
//!
//! One plugin adapts one guest language. The core never looks inside guest
//! values: it hands the plugin a [`PluginCall`] holding the parameter buffer
//! and an empty return buffer, and the plugin converts between CDTs and
//! whatever its runtime uses.

use std::env;
use std::fmt;
use std::path::PathBuf;

use parking_lot::Mutex;

use crate::registry::PluginState;
use crate::{
    Binding, Callable, Cdt, Cdts, EntityPath, FunctionId, Handle, NativeRef, Signature, Xllr,
    XllrError,
};

/// Plugin-chosen identifier of a loaded module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleToken(pub u64);

/// Plugin-chosen identifier of a resolved entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityToken(pub u64);

#[derive(Debug, Clone)]
pub struct ResolvedEntity {
    pub entity: EntityToken,
    pub binding: Binding,
}

/// Where a module lives. The meaning is up to the plugin: a file, a package
/// name, or several artifacts joined with the platform path-list separator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleLocation(String);

impl ModuleLocation {
    pub fn new(location: impl Into<String>) -> Self {
        Self(location.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn artifacts(&self) -> Vec<PathBuf> {
        env::split_paths(&self.0)
            .filter(|path| !path.as_os_str().is_empty())
            .collect()
    }
}

impl fmt::Display for ModuleLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub trait RuntimePlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Starts the guest runtime. Called once per plugin load.
    fn load_runtime(&self) -> Result<(), XllrError>;

    /// Shuts the guest runtime down. Every handle and entity has been
    /// released by the time this runs.
    fn free_runtime(&self) -> Result<(), XllrError>;

    fn load_module(&self, location: &ModuleLocation) -> Result<ModuleToken, XllrError>;

    /// Finds the entity and binds `signature` against what the guest declares.
    fn resolve_entity(
        &self,
        module: ModuleToken,
        path: &EntityPath,
        signature: &Signature,
    ) -> Result<ResolvedEntity, XllrError>;

    /// Runs the entity, filling `call.retvals()` in declared order. Errors are
    /// reported to the caller as `InvocationFailed`.
    fn invoke(&self, entity: EntityToken, call: &mut PluginCall<'_>) -> Result<(), XllrError>;

    /// Drops the plugin's reference to a guest object whose handle count
    /// reached zero.
    fn release_handle(&self, native: NativeRef) -> Result<(), XllrError>;

    fn release_entity(&self, _entity: EntityToken) {}
}

/// References a call minted for its caller: handles it issued and callables
/// it exported, each holding one count.
#[derive(Debug, Clone, Default)]
pub(crate) struct Fresh {
    pub(crate) handles: Vec<Handle>,
    pub(crate) callables: Vec<Callable>,
}

impl Fresh {
    pub(crate) fn is_empty(&self) -> bool {
        self.handles.is_empty() && self.callables.is_empty()
    }

    /// Claims one fresh count on `handle`, if the call minted one.
    pub(crate) fn take_handle(&mut self, handle: Handle) -> bool {
        match self.handles.iter().position(|fresh| *fresh == handle) {
            Some(index) => {
                self.handles.swap_remove(index);
                true
            }
            None => false,
        }
    }

    pub(crate) fn take_callable(&mut self, callable: &Callable) -> bool {
        let bits = callable.to_bits();
        match self.callables.iter().position(|fresh| fresh.to_bits() == bits) {
            Some(index) => {
                self.callables.swap_remove(index);
                true
            }
            None => false,
        }
    }
}

/// Everything a plugin gets for one invocation.
///
/// Whatever the plugin returns is owned by the caller. A handle issued or a
/// callable exported during the call passes its count on when returned; any
/// other handle or callable in the results is retained for the caller once
/// the call succeeds. If the call fails, everything it minted is released,
/// except the exception its error carries.
pub struct PluginCall<'a> {
    pub(crate) xllr: &'a Xllr,
    pub(crate) state: &'a PluginState,
    pub(crate) function: FunctionId,
    pub(crate) signature: &'a Signature,
    pub(crate) binding: &'a Binding,
    pub(crate) params: &'a Cdts,
    pub(crate) retvals: &'a mut Cdts,
    pub(crate) fresh: Mutex<Fresh>,
}

impl<'a> PluginCall<'a> {
    pub fn xllr(&self) -> &Xllr {
        self.xllr
    }

    pub fn function(&self) -> FunctionId {
        self.function
    }

    /// The signature the caller resolved the entity with.
    pub fn signature(&self) -> &Signature {
        self.signature
    }

    pub fn binding(&self) -> &Binding {
        self.binding
    }

    pub fn params(&self) -> &Cdts {
        self.params
    }

    pub fn param(&self, index: usize) -> Result<&Cdt, XllrError> {
        self.params.get(index).ok_or(XllrError::WrongParamCount {
            expected: index + 1,
            got: self.params.len(),
        })
    }

    pub fn retvals(&mut self) -> &mut Cdts {
        self.retvals
    }

    pub fn push_ret(&mut self, cdt: impl Into<Cdt>) -> Result<(), XllrError> {
        self.retvals.push(cdt)
    }

    /// Runs the per-call checks recorded for `any` slots at resolution.
    pub fn check_params(&self) -> Result<(), XllrError> {
        self.binding.check_params(self.params)
    }

    pub fn check_retvals(&self) -> Result<(), XllrError> {
        self.binding.check_retvals(self.retvals)
    }

    /// Registers a new guest object. The handle starts with a count of one
    /// that belongs to this call until it is returned or raised.
    pub fn issue_handle(&self, native: NativeRef) -> Handle {
        let handle = self.state.handles.issue(native);
        self.fresh.lock().handles.push(handle);
        handle
    }

    pub fn native_of(&self, handle: Handle) -> Result<NativeRef, XllrError> {
        self.state.handles.native(handle)
    }

    pub fn retain_handle(&self, handle: Handle) -> Result<Handle, XllrError> {
        self.state.handles.retain(handle)
    }

    /// Publishes a guest callable so the host (or another guest) can call it.
    /// The entity is released once the last reference to the callable is.
    pub fn export_callable(
        &self,
        entity: EntityToken,
        signature: Signature,
    ) -> Result<Callable, XllrError> {
        let callable = self.xllr.export_guest_callable(self.state, entity, signature)?;
        self.fresh.lock().callables.push(callable.clone());
        Ok(callable)
    }

    /// Calls back out through the core, e.g. into a host function handed to
    /// the guest. Nested calls are ordinary invocations.
    pub fn call(&self, callable: &Callable, params: Cdts) -> Result<Cdts, XllrError> {
        self.xllr.call_callable(callable, params)
    }

    pub fn invoke(
        &self,
        function: FunctionId,
        params: &Cdts,
        retvals: &mut Cdts,
    ) -> Result<(), XllrError> {
        self.xllr.invoke(function, params, retvals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_splits_on_path_list_separator() {
        let joined = env::join_paths(["guest/code.jar", "guest/glue.jar"]).expect("join");
        let location = ModuleLocation::new(joined.to_string_lossy());
        assert_eq!(
            location.artifacts(),
            vec![PathBuf::from("guest/code.jar"), PathBuf::from("guest/glue.jar")]
        );
        assert_eq!(ModuleLocation::new("single.py").artifacts().len(), 1);
    }
}
