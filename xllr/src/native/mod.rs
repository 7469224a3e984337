//! Runtime plugins shipped as dynamic libraries.
//!
//! [`NativePlugin`] adapts the C entry points of [`abi`] to the
//! [`RuntimePlugin`] contract. Parameters are lowered into raw views that
//! borrow the caller's buffer for the duration of the call; return values are
//! copied out and handed back to the library's `xllr_free_cdts`.

pub mod abi;
mod convert;

use std::ffi::{CStr, c_char, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::ptr;

use libloading::Library;
use log::{debug, info};

use abi::{PluginVTable, RawCdts, RawHost, RawSignature, STATUS_OK, Status};
use convert::{HostCdts, Lift, Lowered, LoweredSignature, c_string, host_string, lift_signature};

use crate::dispatch::panic_message;
use crate::plugin::{
    EntityToken, ModuleLocation, ModuleToken, PluginCall, ResolvedEntity, RuntimePlugin,
};
use crate::{
    Binding, CdtType, Cdts, EntityPath, Handle, NativeRef, Signature, XllrError,
};

pub struct NativePlugin {
    name: String,
    vtable: PluginVTable,
    // dropped last; the vtable points into it
    library: Option<Library>,
}

impl std::fmt::Debug for NativePlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativePlugin")
            .field("name", &self.name)
            .field("dynamic", &self.library.is_some())
            .finish()
    }
}

unsafe fn symbol<T: Copy>(library: &Library, plugin: &str, name: &[u8]) -> Result<T, XllrError> {
    let loaded = unsafe { library.get::<T>(name) }.map_err(|err| XllrError::PluginLoadFailed {
        name: plugin.to_string(),
        reason: format!(
            "missing symbol `{}`: {err}",
            String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name))
        ),
    })?;
    Ok(*loaded)
}

impl NativePlugin {
    /// Loads the library at `path` and binds its entry points.
    pub fn open(path: &Path, name: &str) -> Result<Self, XllrError> {
        let load_failed = |reason: String| XllrError::PluginLoadFailed {
            name: name.to_string(),
            reason,
        };
        // SAFETY: loading runs the library's initialisers; plugin libraries
        // are trusted code by contract.
        let library = unsafe { Library::new(path) }
            .map_err(|err| load_failed(format!("{}: {err}", path.display())))?;
        let vtable = unsafe {
            PluginVTable {
                abi_version: symbol(&library, name, PluginVTable::ABI_VERSION_SYMBOL)?,
                load_runtime: symbol(&library, name, PluginVTable::LOAD_RUNTIME_SYMBOL)?,
                free_runtime: symbol(&library, name, PluginVTable::FREE_RUNTIME_SYMBOL)?,
                load_module: symbol(&library, name, PluginVTable::LOAD_MODULE_SYMBOL)?,
                load_entity: symbol(&library, name, PluginVTable::LOAD_ENTITY_SYMBOL)?,
                free_entity: symbol(&library, name, PluginVTable::FREE_ENTITY_SYMBOL)?,
                invoke: symbol(&library, name, PluginVTable::INVOKE_SYMBOL)?,
                release_handle: symbol(&library, name, PluginVTable::RELEASE_HANDLE_SYMBOL)?,
                free_string: symbol(&library, name, PluginVTable::FREE_STRING_SYMBOL)?,
                free_cdts: symbol(&library, name, PluginVTable::FREE_CDTS_SYMBOL)?,
            }
        };
        info!("{name}: opened {}", path.display());
        Self::new(name, vtable, Some(library))
    }

    /// A plugin linked into the host binary.
    pub fn from_vtable(name: &str, vtable: PluginVTable) -> Result<Self, XllrError> {
        Self::new(name, vtable, None)
    }

    fn new(name: &str, vtable: PluginVTable, library: Option<Library>) -> Result<Self, XllrError> {
        let version = unsafe { (vtable.abi_version)() };
        if version != abi::ABI_VERSION {
            return Err(XllrError::PluginLoadFailed {
                name: name.to_string(),
                reason: format!(
                    "plugin ABI version {version}, host expects {}",
                    abi::ABI_VERSION
                ),
            });
        }
        Ok(Self {
            name: name.to_string(),
            vtable,
            library,
        })
    }

    fn take_error(&self, error: *mut c_char) -> Option<String> {
        if error.is_null() {
            return None;
        }
        let message = unsafe { CStr::from_ptr(error) }.to_string_lossy().into_owned();
        unsafe { (self.vtable.free_string)(error) };
        Some(message)
    }

    fn check(&self, status: Status, subject: &str, error: *mut c_char) -> Result<(), XllrError> {
        let message = self.take_error(error);
        if status == STATUS_OK {
            return Ok(());
        }
        let message = message.unwrap_or_else(|| format!("{} reported status {status}", self.name));
        Err(XllrError::from_status(status, subject, message))
    }
}

impl RuntimePlugin for NativePlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn load_runtime(&self) -> Result<(), XllrError> {
        let mut error = ptr::null_mut();
        let status = unsafe { (self.vtable.load_runtime)(&mut error) };
        self.check(status, &self.name, error)
    }

    fn free_runtime(&self) -> Result<(), XllrError> {
        let mut error = ptr::null_mut();
        let status = unsafe { (self.vtable.free_runtime)(&mut error) };
        self.check(status, &self.name, error)
    }

    fn load_module(&self, location: &ModuleLocation) -> Result<ModuleToken, XllrError> {
        let raw = c_string("module location", location.as_str())?;
        let mut module = 0;
        let mut error = ptr::null_mut();
        let status = unsafe { (self.vtable.load_module)(raw.as_ptr(), &mut module, &mut error) };
        self.check(status, location.as_str(), error)?;
        debug!("{}: module `{location}` is {module:#x}", self.name);
        Ok(ModuleToken(module))
    }

    /// The library binds `any` slots itself and checks them on each call.
    fn resolve_entity(
        &self,
        module: ModuleToken,
        path: &EntityPath,
        signature: &Signature,
    ) -> Result<ResolvedEntity, XllrError> {
        let raw_path = c_string("entity path", path.as_str())?;
        let lowered = LoweredSignature::new(signature)?;
        let raw_signature = lowered.as_raw();
        let mut entity = 0;
        let mut error = ptr::null_mut();
        let status = unsafe {
            (self.vtable.load_entity)(
                module.0,
                raw_path.as_ptr(),
                &raw_signature,
                &mut entity,
                &mut error,
            )
        };
        self.check(status, path.as_str(), error)?;
        Ok(ResolvedEntity {
            entity: EntityToken(entity),
            binding: Binding::Static,
        })
    }

    fn invoke(&self, entity: EntityToken, call: &mut PluginCall<'_>) -> Result<(), XllrError> {
        let lowered = Lowered::new(call.params().as_slice());
        let params = lowered.as_raw();
        let host = RawHost {
            context: ptr::from_ref::<PluginCall<'_>>(call).cast(),
            issue_handle: host_issue_handle,
            native_of: host_native_of,
            call: host_call,
            export_callable: host_export_callable,
            release: host_release,
            free_cdts: host_free_cdts,
            free_string: host_free_string,
        };
        let mut retvals = RawCdts::empty();
        let mut exception = 0;
        let mut error = ptr::null_mut();
        let status = unsafe {
            (self.vtable.invoke)(
                entity.0,
                &host,
                &params,
                &mut retvals,
                &mut exception,
                &mut error,
            )
        };

        let runtime = call.state.runtime;
        let outcome = self.check(status, &self.name, error).and_then(|()| {
            unsafe { Lift::new(call.xllr(), runtime).values(&retvals) }
        });
        unsafe { (self.vtable.free_cdts)(&mut retvals) };
        drop(lowered);

        match outcome {
            Ok(values) => {
                for value in values {
                    call.push_ret(value)?;
                }
                Ok(())
            }
            Err(err) if exception != 0 => Err(XllrError::InvocationFailed {
                message: err.to_string(),
                exception: Some(Handle::from_bits(runtime, exception)),
            }),
            Err(err) => Err(err),
        }
    }

    fn release_handle(&self, native: NativeRef) -> Result<(), XllrError> {
        let mut error = ptr::null_mut();
        let status = unsafe { (self.vtable.release_handle)(native.0, &mut error) };
        self.check(status, &self.name, error)
    }

    fn release_entity(&self, entity: EntityToken) {
        unsafe { (self.vtable.free_entity)(entity.0) };
    }
}

/// Runs a host service for a plugin. Failures become a status plus a
/// host-owned message; panics never cross the boundary.
fn guard(error: *mut *mut c_char, service: impl FnOnce() -> Result<(), XllrError>) -> Status {
    let outcome = panic::catch_unwind(AssertUnwindSafe(service)).unwrap_or_else(|payload| {
        Err(XllrError::invocation(format!(
            "host panicked: {}",
            panic_message(payload.as_ref())
        )))
    });
    match outcome {
        Ok(()) => STATUS_OK,
        Err(err) => {
            if !error.is_null() {
                unsafe { *error = host_string(&err.to_string()) };
            }
            err.kind().code()
        }
    }
}

/// # Safety
/// `context` is the `RawHost::context` of a call that is still running.
unsafe fn context<'a>(context: *const c_void) -> &'a PluginCall<'a> {
    unsafe { &*context.cast::<PluginCall<'a>>() }
}

unsafe extern "C" fn host_issue_handle(ctx: *const c_void, native: u64) -> u64 {
    let call = unsafe { context(ctx) };
    call.issue_handle(NativeRef(native)).to_bits()
}

unsafe extern "C" fn host_native_of(
    ctx: *const c_void,
    handle: u64,
    native: *mut u64,
    error: *mut *mut c_char,
) -> Status {
    guard(error, || {
        let call = unsafe { context(ctx) };
        let handle = Handle::from_bits(call.state.runtime, handle);
        let found = call.native_of(handle)?;
        unsafe { *native = found.0 };
        Ok(())
    })
}

unsafe extern "C" fn host_call(
    ctx: *const c_void,
    callable: u64,
    params: *const RawCdts,
    retvals: *mut RawCdts,
    error: *mut *mut c_char,
) -> Status {
    guard(error, || {
        let call = unsafe { context(ctx) };
        let lift = Lift::new(call.xllr(), call.state.runtime);
        let callable = lift.callable(callable)?;
        let params = unsafe { lift.values(params) }?;
        let out = call.call(&callable, Cdts::from_vec(params))?;
        unsafe { *retvals = HostCdts::into_raw(out) };
        Ok(())
    })
}

unsafe extern "C" fn host_export_callable(
    ctx: *const c_void,
    entity: u64,
    signature: *const RawSignature,
    callable: *mut u64,
    error: *mut *mut c_char,
) -> Status {
    guard(error, || {
        let call = unsafe { context(ctx) };
        let signature = unsafe { lift_signature(signature) }?;
        let exported = call.export_callable(EntityToken(entity), signature)?;
        unsafe { *callable = exported.to_bits() };
        Ok(())
    })
}

unsafe extern "C" fn host_release(
    ctx: *const c_void,
    kind: u32,
    bits: u64,
    error: *mut *mut c_char,
) -> Status {
    guard(error, || {
        let call = unsafe { context(ctx) };
        let lift = Lift::new(call.xllr(), call.state.runtime);
        match CdtType::from_code(kind) {
            Some(CdtType::Handle) => call.xllr().release_handle(lift.handle(bits)),
            Some(CdtType::Callable) => call.xllr().release_callable(&lift.callable(bits)?),
            _ => Err(XllrError::InvalidValue(format!("type code {kind} is not a reference"))),
        }
    })
}

unsafe extern "C" fn host_free_cdts(cdts: *mut RawCdts) {
    if let Some(cdts) = unsafe { cdts.as_mut() } {
        unsafe { HostCdts::free(cdts) };
    }
}

unsafe extern "C" fn host_free_string(string: *mut c_char) {
    if !string.is_null() {
        drop(unsafe { std::ffi::CString::from_raw(string) });
    }
}
