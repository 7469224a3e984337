//! C layouts shared with dynamic-library plugins.
//!
//! A plugin library exports the `xllr_*` symbols listed on [`PluginVTable`].
//! Every fallible entry point returns a status (`0` or an
//! [`ErrorKind::code`](crate::ErrorKind::code)) and may store a message in its
//! `error` out-parameter; the message belongs to whoever produced it and goes
//! back through that side's `free_string`.
//!
//! Handles cross as their core bits. A plugin maps them to its own objects
//! through [`RawHost::native_of`] and mints new ones with
//! [`RawHost::issue_handle`], the same way an in-process plugin uses its
//! `PluginCall`.
//!
//! Returned handles and callables are owned by the receiver. A handle the
//! plugin issued during the call passes its count on when returned; any
//! other reference it returns is retained by the core. Handles and callables
//! in a callback's results belong to the plugin, which gives them back with
//! [`RawHost::release`].

use std::ffi::{c_char, c_void};
use std::ptr;

pub const ABI_VERSION: u32 = 1;

pub type Status = i32;

pub const STATUS_OK: Status = 0;

/// One value. `kind` is a [`CdtType`](crate::CdtType) code.
///
/// | kind                  | payload                                        |
/// |-----------------------|------------------------------------------------|
/// | scalars               | `bits` (floats as IEEE bits, bool as 0/1)      |
/// | string8/16/32         | `ptr`/`len` in code units                      |
/// | handle, callable      | `bits`                                         |
/// | array                 | `element`, `dimensions`, `ptr`/`len` of items |
/// | packed                | `element`, `ptr`/`len` of contiguous elements  |
///
/// Packed elements use their natural C layout; `bool` is one byte, 0 or 1.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawCdt {
    pub kind: u32,
    pub element: u32,
    pub dimensions: u32,
    pub bits: u64,
    pub ptr: *const c_void,
    pub len: usize,
}

impl RawCdt {
    pub const fn scalar(kind: u32, bits: u64) -> Self {
        Self {
            kind,
            element: 0,
            dimensions: 0,
            bits,
            ptr: ptr::null(),
            len: 0,
        }
    }
}

/// A run of values. `owner` is private to whichever side filled the buffer
/// and is handed back to that side's `free_cdts`.
#[repr(C)]
#[derive(Debug)]
pub struct RawCdts {
    pub items: *const RawCdt,
    pub len: usize,
    pub owner: *mut c_void,
}

impl RawCdts {
    pub const fn empty() -> Self {
        Self {
            items: ptr::null(),
            len: 0,
            owner: ptr::null_mut(),
        }
    }

    /// # Safety
    /// `items` must point to `len` initialised values (or be null when `len`
    /// is zero) that outlive the returned slice.
    pub unsafe fn as_slice<'a>(&self) -> &'a [RawCdt] {
        if self.items.is_null() || self.len == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.items, self.len) }
    }
}

/// Set on [`RawTypeInfo::kind`] for a packed rank-1 array of the element kind
/// in the low bits.
pub const PACKED_FLAG: u32 = 0x1_0000;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawTypeInfo {
    pub kind: u32,
    pub dimensions: u32,
    /// Nul-terminated, or null when the slot carries no alias.
    pub alias: *const c_char,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawSignature {
    pub params: *const RawTypeInfo,
    pub params_len: usize,
    pub retvals: *const RawTypeInfo,
    pub retvals_len: usize,
}

/// Services the core offers a plugin for the duration of one `xllr_invoke`.
/// `context` is only valid until that call returns.
#[repr(C)]
pub struct RawHost {
    pub context: *const c_void,
    pub issue_handle: unsafe extern "C" fn(context: *const c_void, native: u64) -> u64,
    pub native_of: unsafe extern "C" fn(
        context: *const c_void,
        handle: u64,
        native: *mut u64,
        error: *mut *mut c_char,
    ) -> Status,
    /// Calls a callable. On success `retvals` is filled by the host and must
    /// be returned through `free_cdts`.
    pub call: unsafe extern "C" fn(
        context: *const c_void,
        callable: u64,
        params: *const RawCdts,
        retvals: *mut RawCdts,
        error: *mut *mut c_char,
    ) -> Status,
    /// Publishes plugin entity `entity` as a callable with `signature`.
    pub export_callable: unsafe extern "C" fn(
        context: *const c_void,
        entity: u64,
        signature: *const RawSignature,
        callable: *mut u64,
        error: *mut *mut c_char,
    ) -> Status,
    /// Gives back one count on a handle (`kind` is the handle code) or a
    /// callable (the callable code) the plugin owns.
    pub release: unsafe extern "C" fn(
        context: *const c_void,
        kind: u32,
        bits: u64,
        error: *mut *mut c_char,
    ) -> Status,
    pub free_cdts: unsafe extern "C" fn(cdts: *mut RawCdts),
    pub free_string: unsafe extern "C" fn(string: *mut c_char),
}

pub type AbiVersionFn = unsafe extern "C" fn() -> u32;
pub type LoadRuntimeFn = unsafe extern "C" fn(error: *mut *mut c_char) -> Status;
pub type FreeRuntimeFn = unsafe extern "C" fn(error: *mut *mut c_char) -> Status;
pub type LoadModuleFn = unsafe extern "C" fn(
    location: *const c_char,
    module: *mut u64,
    error: *mut *mut c_char,
) -> Status;
pub type LoadEntityFn = unsafe extern "C" fn(
    module: u64,
    path: *const c_char,
    signature: *const RawSignature,
    entity: *mut u64,
    error: *mut *mut c_char,
) -> Status;
pub type FreeEntityFn = unsafe extern "C" fn(entity: u64);
/// On failure the plugin may store the bits of an exception handle it issued
/// in `exception`; the caller owns that reference. Every other handle or
/// callable the plugin minted during a failed call is released by the core.
pub type InvokeFn = unsafe extern "C" fn(
    entity: u64,
    host: *const RawHost,
    params: *const RawCdts,
    retvals: *mut RawCdts,
    exception: *mut u64,
    error: *mut *mut c_char,
) -> Status;
pub type ReleaseHandleFn = unsafe extern "C" fn(native: u64, error: *mut *mut c_char) -> Status;
pub type FreeStringFn = unsafe extern "C" fn(string: *mut c_char);
pub type FreeCdtsFn = unsafe extern "C" fn(cdts: *mut RawCdts);

/// The exported entry points of a plugin library.
#[derive(Debug, Clone, Copy)]
pub struct PluginVTable {
    pub abi_version: AbiVersionFn,
    pub load_runtime: LoadRuntimeFn,
    pub free_runtime: FreeRuntimeFn,
    pub load_module: LoadModuleFn,
    pub load_entity: LoadEntityFn,
    pub free_entity: FreeEntityFn,
    pub invoke: InvokeFn,
    pub release_handle: ReleaseHandleFn,
    pub free_string: FreeStringFn,
    pub free_cdts: FreeCdtsFn,
}

impl PluginVTable {
    pub const ABI_VERSION_SYMBOL: &'static [u8] = b"xllr_plugin_abi_version\0";
    pub const LOAD_RUNTIME_SYMBOL: &'static [u8] = b"xllr_load_runtime\0";
    pub const FREE_RUNTIME_SYMBOL: &'static [u8] = b"xllr_free_runtime\0";
    pub const LOAD_MODULE_SYMBOL: &'static [u8] = b"xllr_load_module\0";
    pub const LOAD_ENTITY_SYMBOL: &'static [u8] = b"xllr_load_entity\0";
    pub const FREE_ENTITY_SYMBOL: &'static [u8] = b"xllr_free_entity\0";
    pub const INVOKE_SYMBOL: &'static [u8] = b"xllr_invoke\0";
    pub const RELEASE_HANDLE_SYMBOL: &'static [u8] = b"xllr_release_handle\0";
    pub const FREE_STRING_SYMBOL: &'static [u8] = b"xllr_free_string\0";
    pub const FREE_CDTS_SYMBOL: &'static [u8] = b"xllr_free_cdts\0";
}
