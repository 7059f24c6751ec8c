use std::path::PathBuf;

/// Errors produced while deriving, storing, recovering or installing keys.
///
/// Payloads describe what failed and where. They never carry credential
/// bytes, derived secrets or key material.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A file or directory could not be read or written.
    #[error("io error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A persisted record or input string has the wrong shape.
    #[error("format error: {0}")]
    Format(String),

    /// The on-disk version tag differs from the supported one.
    #[error("version mismatch: expected {expected:?}, found {found:?}")]
    VersionMismatch { expected: String, found: String },

    /// A KDF, cipher or tag check failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The hardware backend is unreachable or returned a non-OK status.
    #[error("hardware error: {0}")]
    Hardware(String),

    /// The hardware key blob must be upgraded before it can be used.
    #[error("hardware key requires upgrade")]
    KeyRequiresUpgrade,

    /// The secondary-factor verifier asked the caller to wait.
    #[error("slot {slot} throttled for {seconds}s")]
    Throttled { slot: u32, seconds: u32 },

    /// The kernel key registry rejected an operation.
    #[error("key registry error: {0}")]
    Registry(String),

    #[error("already exists: {}", .0.display())]
    AlreadyExists(PathBuf),
}

/// Coarse failure category used for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    Format,
    Crypto,
    NotFound,
    Hardware,
    Throttled,
    Registry,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io { .. } | Error::AlreadyExists(_) => ErrorKind::Io,
            Error::Format(_) | Error::VersionMismatch { .. } => ErrorKind::Format,
            Error::Crypto(_) => ErrorKind::Crypto,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Hardware(_) | Error::KeyRequiresUpgrade => ErrorKind::Hardware,
            Error::Throttled { .. } => ErrorKind::Throttled,
            Error::Registry(_) => ErrorKind::Registry,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
