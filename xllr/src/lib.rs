mod arena;
mod args;
mod callback;
mod cdt;
mod cdts;
mod config;
mod dispatch;
mod entity;
mod error;
mod handle;
mod local;
pub mod native;
mod plugin;
mod registry;
mod types;

pub use args::{KeywordArgs, PositionalArgs};
pub use callback::{Affinity, Callable, GuestFunction, HostFn};
pub use cdt::{Cdt, CdtArray, CdtType, FromCdt, PackedArray, PackedElement};
pub use cdts::{Cdts, CdtsPair};
pub use config::{DEFAULT_LIBRARY_PREFIX, HOME_VAR, PLUGIN_PATH_VAR, XllrCreateInfo};
pub use entity::{Accessor, EntityPath, Member, PathKey};
pub use error::{ErrorKind, Result, XllrError};
pub use handle::{Handle, HandleTable, NativeRef, OwnedHandle, Released, RuntimeId};
pub use local::{GuestCall, GuestError, GuestFn, LocalClass, LocalModule, LocalRuntime};
pub use native::NativePlugin;
pub use plugin::{
    EntityToken, ModuleLocation, ModuleToken, PluginCall, ResolvedEntity, RuntimePlugin,
};
pub use registry::{FunctionId, ModuleHandle, PluginHandle, PluginInfo, Xllr};
pub use types::{Binding, Signature, SlotCheck, TypeDescriptor};
