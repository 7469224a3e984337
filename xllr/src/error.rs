use thiserror::Error;

use crate::Handle;

/// Stable error kinds. Every entry point reports exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    PluginNotFound,
    PluginLoadFailed,
    ModuleNotFound,
    ModuleLoadFailed,
    EntityNotFound,
    InvalidEntityPath,
    SignatureMismatch,
    TypeResolutionFailed,
    WrongParamCount,
    InvocationFailed,
    UnknownHandle,
    ForeignHandle,
    UnknownFunction,
    CapacityExceeded,
    InvalidValue,
    StillInUse,
}

impl ErrorKind {
    /// Load-time errors describe a broken binding or configuration and are
    /// reported once, at resolution. Everything else happens per call.
    pub fn is_load_time(self) -> bool {
        matches!(
            self,
            Self::PluginNotFound
                | Self::PluginLoadFailed
                | Self::ModuleNotFound
                | Self::ModuleLoadFailed
                | Self::EntityNotFound
                | Self::InvalidEntityPath
                | Self::SignatureMismatch
                | Self::TypeResolutionFailed
        )
    }

    /// Status code used at the native plugin boundary. `0` is success.
    pub const fn code(self) -> i32 {
        match self {
            Self::PluginNotFound => 1,
            Self::PluginLoadFailed => 2,
            Self::ModuleNotFound => 3,
            Self::ModuleLoadFailed => 4,
            Self::EntityNotFound => 5,
            Self::InvalidEntityPath => 6,
            Self::SignatureMismatch => 7,
            Self::TypeResolutionFailed => 8,
            Self::WrongParamCount => 9,
            Self::InvocationFailed => 10,
            Self::UnknownHandle => 11,
            Self::ForeignHandle => 12,
            Self::UnknownFunction => 13,
            Self::CapacityExceeded => 14,
            Self::InvalidValue => 15,
            Self::StillInUse => 16,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        let kind = match code {
            1 => Self::PluginNotFound,
            2 => Self::PluginLoadFailed,
            3 => Self::ModuleNotFound,
            4 => Self::ModuleLoadFailed,
            5 => Self::EntityNotFound,
            6 => Self::InvalidEntityPath,
            7 => Self::SignatureMismatch,
            8 => Self::TypeResolutionFailed,
            9 => Self::WrongParamCount,
            10 => Self::InvocationFailed,
            11 => Self::UnknownHandle,
            12 => Self::ForeignHandle,
            13 => Self::UnknownFunction,
            14 => Self::CapacityExceeded,
            15 => Self::InvalidValue,
            16 => Self::StillInUse,
            _ => return None,
        };
        Some(kind)
    }
}

#[derive(Debug, Clone, Error)]
pub enum XllrError {
    #[error("runtime plugin `{name}` not found: {reason}")]
    PluginNotFound { name: String, reason: String },

    #[error("runtime plugin `{name}` failed to load: {reason}")]
    PluginLoadFailed { name: String, reason: String },

    #[error("module `{location}` not found: {reason}")]
    ModuleNotFound { location: String, reason: String },

    #[error("module `{location}` failed to load: {reason}")]
    ModuleLoadFailed { location: String, reason: String },

    #[error("entity `{path}` not found: {reason}")]
    EntityNotFound { path: String, reason: String },

    #[error("invalid entity path `{path}`: {reason}")]
    InvalidEntityPath { path: String, reason: String },

    #[error("signature mismatch: {0}")]
    SignatureMismatch(String),

    #[error("type resolution failed: {0}")]
    TypeResolutionFailed(String),

    #[error("wrong parameter count: expected {expected}, got {got}")]
    WrongParamCount { expected: usize, got: usize },

    #[error("invocation failed: {message}")]
    InvocationFailed {
        message: String,
        exception: Option<Handle>,
    },

    #[error("unknown handle {0}")]
    UnknownHandle(Handle),

    #[error("handle {handle} belongs to another runtime plugin than `{runtime}`")]
    ForeignHandle { handle: Handle, runtime: String },

    #[error("unknown function id: {0}")]
    UnknownFunction(String),

    #[error("buffer capacity {capacity} exceeded")]
    CapacityExceeded { capacity: usize },

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("runtime plugin `{name}` still in use: {live_handles} live handles")]
    StillInUse { name: String, live_handles: usize },
}

impl XllrError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PluginNotFound { .. } => ErrorKind::PluginNotFound,
            Self::PluginLoadFailed { .. } => ErrorKind::PluginLoadFailed,
            Self::ModuleNotFound { .. } => ErrorKind::ModuleNotFound,
            Self::ModuleLoadFailed { .. } => ErrorKind::ModuleLoadFailed,
            Self::EntityNotFound { .. } => ErrorKind::EntityNotFound,
            Self::InvalidEntityPath { .. } => ErrorKind::InvalidEntityPath,
            Self::SignatureMismatch(_) => ErrorKind::SignatureMismatch,
            Self::TypeResolutionFailed(_) => ErrorKind::TypeResolutionFailed,
            Self::WrongParamCount { .. } => ErrorKind::WrongParamCount,
            Self::InvocationFailed { .. } => ErrorKind::InvocationFailed,
            Self::UnknownHandle(_) => ErrorKind::UnknownHandle,
            Self::ForeignHandle { .. } => ErrorKind::ForeignHandle,
            Self::UnknownFunction(_) => ErrorKind::UnknownFunction,
            Self::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            Self::InvalidValue(_) => ErrorKind::InvalidValue,
            Self::StillInUse { .. } => ErrorKind::StillInUse,
        }
    }

    /// The guest exception a failed call carries. The caller owns it.
    pub fn exception(&self) -> Option<Handle> {
        match self {
            Self::InvocationFailed { exception, .. } => *exception,
            _ => None,
        }
    }

    pub fn invocation(message: impl Into<String>) -> Self {
        Self::InvocationFailed {
            message: message.into(),
            exception: None,
        }
    }

    /// Rebuild an error that crossed the native boundary as a status code
    /// plus message. Unknown codes degrade to `InvocationFailed`.
    pub fn from_status(code: i32, subject: &str, message: String) -> Self {
        let Some(kind) = ErrorKind::from_code(code) else {
            return Self::invocation(format!("status {code}: {message}"));
        };
        let subject = subject.to_string();
        match kind {
            ErrorKind::PluginNotFound => Self::PluginNotFound {
                name: subject,
                reason: message,
            },
            ErrorKind::PluginLoadFailed => Self::PluginLoadFailed {
                name: subject,
                reason: message,
            },
            ErrorKind::ModuleNotFound => Self::ModuleNotFound {
                location: subject,
                reason: message,
            },
            ErrorKind::ModuleLoadFailed => Self::ModuleLoadFailed {
                location: subject,
                reason: message,
            },
            ErrorKind::EntityNotFound => Self::EntityNotFound {
                path: subject,
                reason: message,
            },
            ErrorKind::InvalidEntityPath => Self::InvalidEntityPath {
                path: subject,
                reason: message,
            },
            ErrorKind::SignatureMismatch => Self::SignatureMismatch(message),
            ErrorKind::TypeResolutionFailed => {
                Self::TypeResolutionFailed(message)
            }
            ErrorKind::CapacityExceeded => Self::CapacityExceeded { capacity: 0 },
            ErrorKind::InvalidValue => Self::InvalidValue(message),
            ErrorKind::StillInUse => Self::StillInUse {
                name: subject,
                live_handles: 0,
            },
            // handle/function/arity failures reported by a plugin carry no
            // structured payload, so they surface as a failed call
            _ => Self::invocation(message),
        }
    }
}

pub type Result<T, E = XllrError> = std::result::Result<T, E>;
