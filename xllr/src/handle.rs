//! Reference-counted handles to guest-owned objects.
//!
//! Each runtime plugin gets one [`HandleTable`]. The table maps a core handle
//! to the plugin's own native reference and keeps the count; the referent
//! itself lives in the guest heap and is dropped by the plugin once the count
//! reaches zero.

use std::fmt;

use log::{trace, warn};
use parking_lot::Mutex;

use crate::arena::{Slab, SlotId};
use crate::{Xllr, XllrError};

/// Identifies one loaded runtime plugin instance. Never reused in a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuntimeId(pub u32);

impl RuntimeId {
    pub const NONE: Self = Self(0);
}

/// A plugin's own reference to one of its objects (pointer, object id, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeRef(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    runtime: RuntimeId,
    id: SlotId,
}

impl Handle {
    pub const fn null(runtime: RuntimeId) -> Self {
        Self {
            runtime,
            id: SlotId::NULL,
        }
    }

    pub const fn runtime(&self) -> RuntimeId {
        self.runtime
    }

    pub const fn is_null(&self) -> bool {
        self.id.is_null()
    }

    pub const fn to_bits(&self) -> u64 {
        self.id.to_bits()
    }

    pub const fn from_bits(runtime: RuntimeId, bits: u64) -> Self {
        Self {
            runtime,
            id: SlotId::from_bits(bits),
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return write!(f, "null@{}", self.runtime.0);
        }
        write!(
            f,
            "{}:{}@{}",
            self.id.index, self.id.generation, self.runtime.0
        )
    }
}

#[derive(Debug)]
struct HandleEntry {
    native: NativeRef,
    count: u32,
}

/// Outcome of a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Released {
    /// Still referenced, with the remaining count.
    Retained(u32),
    /// Count hit zero; the plugin must drop its native reference.
    Dropped(NativeRef),
}

#[derive(Debug)]
pub struct HandleTable {
    runtime: RuntimeId,
    name: String,
    entries: Mutex<Slab<HandleEntry>>,
}

impl HandleTable {
    pub fn new(runtime: RuntimeId, name: impl Into<String>) -> Self {
        Self {
            runtime,
            name: name.into(),
            entries: Mutex::new(Slab::new()),
        }
    }

    pub fn runtime(&self) -> RuntimeId {
        self.runtime
    }

    /// Registers a freshly produced guest object with a count of one.
    pub fn issue(&self, native: NativeRef) -> Handle {
        let id = self.entries.lock().insert(HandleEntry { native, count: 1 });
        let handle = Handle {
            runtime: self.runtime,
            id,
        };
        trace!("{}: issued handle {handle} for {:#x}", self.name, native.0);
        handle
    }

    fn check_owner(&self, handle: Handle) -> Result<(), XllrError> {
        if handle.runtime != self.runtime {
            return Err(XllrError::ForeignHandle {
                handle,
                runtime: self.name.clone(),
            });
        }
        if handle.is_null() {
            return Err(XllrError::UnknownHandle(handle));
        }
        Ok(())
    }

    pub fn retain(&self, handle: Handle) -> Result<Handle, XllrError> {
        self.check_owner(handle)?;
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(handle.id)
            .ok_or(XllrError::UnknownHandle(handle))?;
        entry.count += 1;
        trace!("{}: retain {handle} -> {}", self.name, entry.count);
        Ok(handle)
    }

    pub fn release(&self, handle: Handle) -> Result<Released, XllrError> {
        self.check_owner(handle)?;
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(handle.id)
            .ok_or(XllrError::UnknownHandle(handle))?;
        entry.count -= 1;
        trace!("{}: release {handle} -> {}", self.name, entry.count);
        if entry.count > 0 {
            return Ok(Released::Retained(entry.count));
        }
        let entry = entries
            .remove(handle.id)
            .ok_or(XllrError::UnknownHandle(handle))?;
        Ok(Released::Dropped(entry.native))
    }

    /// The plugin-side reference behind a live handle.
    pub fn native(&self, handle: Handle) -> Result<NativeRef, XllrError> {
        self.check_owner(handle)?;
        self.entries
            .lock()
            .get(handle.id)
            .map(|entry| entry.native)
            .ok_or(XllrError::UnknownHandle(handle))
    }

    pub fn count(&self, handle: Handle) -> Option<u32> {
        if handle.runtime != self.runtime {
            return None;
        }
        self.entries.lock().get(handle.id).map(|entry| entry.count)
    }

    pub fn is_live(&self, handle: Handle) -> bool {
        self.count(handle).is_some()
    }

    pub fn live_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Empties the table at teardown, returning the references to drop.
    pub fn drain(&self) -> Vec<NativeRef> {
        self.entries
            .lock()
            .drain()
            .into_iter()
            .map(|entry| entry.native)
            .collect()
    }
}

impl Drop for HandleTable {
    fn drop(&mut self) {
        let live = self.entries.get_mut().len();
        if live > 0 {
            warn!("{}: handle table dropped with {live} live handles", self.name);
        }
    }
}

/// Releases its handle when dropped.
///
/// The guest object stays alive for as long as this value does; dropping it
/// is the deterministic point at which the host gives its reference back.
#[derive(Debug)]
pub struct OwnedHandle {
    xllr: Xllr,
    handle: Option<Handle>,
}

impl OwnedHandle {
    pub fn new(xllr: &Xllr, handle: Handle) -> Self {
        Self {
            xllr: xllr.clone(),
            handle: Some(handle),
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle.unwrap_or(Handle::null(RuntimeId::NONE))
    }

    /// Gives up ownership without releasing.
    pub fn into_inner(mut self) -> Handle {
        self.handle
            .take()
            .unwrap_or(Handle::null(RuntimeId::NONE))
    }

    /// Adds a reference, returning a second owner of the same object.
    pub fn try_clone(&self) -> Result<Self, XllrError> {
        let handle = self.xllr.retain_handle(self.handle())?;
        Ok(Self::new(&self.xllr, handle))
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if handle.is_null() {
            return;
        }
        if let Err(err) = self.xllr.release_handle(handle) {
            warn!("releasing {handle} on drop failed: {err}");
        }
    }
}
