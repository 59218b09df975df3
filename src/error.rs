//! Error types for the registry, the channel and configuration loading.

use std::error::Error as StdError;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Initializer error shared by every waiter of one initialization attempt.
pub type SharedError = Arc<dyn StdError + Send + Sync>;

/// Why a blocking operation gave up before completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller's `CancelToken` was cancelled.
    Cancelled,
    /// The context's deadline passed.
    DeadlineExceeded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Cancelled => write!(f, "cancelled by caller"),
            CancelReason::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum RegistryError {
    #[error("initializer for '{key}' failed: {source}")]
    InitializationFailed {
        key: String,
        #[source]
        source: SharedError,
    },

    #[error("initializer for '{key}' panicked")]
    InitializerPanicked { key: String },

    #[error("waiting for '{key}' was interrupted: {reason}")]
    Cancelled { key: String, reason: CancelReason },
}

impl RegistryError {
    pub fn key(&self) -> &str {
        match self {
            RegistryError::InitializationFailed { key, .. }
            | RegistryError::InitializerPanicked { key }
            | RegistryError::Cancelled { key, .. } => key,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel is closed")]
    Closed,

    #[error("channel operation cancelled: {0}")]
    Cancelled(CancelReason),

    #[error("channel is full")]
    Full,

    #[error("channel is empty")]
    Empty,
}

impl ChannelError {
    pub fn is_closed(&self) -> bool {
        matches!(self, ChannelError::Closed)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ChannelError::Cancelled(_))
    }
}

/// A rejected `put`. The item is handed back so nothing is lost.
pub struct PutError<T> {
    item: T,
    error: ChannelError,
}

impl<T> PutError<T> {
    pub(crate) fn new(item: T, error: ChannelError) -> Self {
        PutError { item, error }
    }

    pub fn error(&self) -> ChannelError {
        self.error
    }

    pub fn into_inner(self) -> T {
        self.item
    }

    pub fn into_parts(self) -> (T, ChannelError) {
        (self.item, self.error)
    }
}

// Hand-written so that `T` does not need to be `Debug`.
impl<T> fmt::Debug for PutError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PutError")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for PutError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "put rejected: {}", self.error)
    }
}

impl<T> StdError for PutError<T> {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&self.error)
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}
