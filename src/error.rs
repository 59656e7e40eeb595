//! Structured error types for the provchain library.
//!
//! Every public library function returns [`Result<T>`] carrying a
//! [`ProvError`].  Callers that speak HTTP use [`ProvError::status_code`];
//! the FFI boundary converts errors into [`FfiErrorCode`].

use thiserror::Error;

// ---------------------------------------------------------------------------
// Primary error enum
// ---------------------------------------------------------------------------

/// Error taxonomy for every chain-mutating and read operation.
#[derive(Error, Debug)]
pub enum ProvError {
    /// Missing or malformed input, rejected before any mutation.
    #[error("validation: {0}")]
    Validation(String),

    /// Actor role does not permit the operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// External ledger unreachable, reverted, or returned garbage.
    #[error("chain: {0}")]
    Chain(String),

    #[error("store: {0}")]
    Store(String),

    #[error("config: {0}")]
    Config(String),

    #[error("report: {0}")]
    Report(String),

    /// Direct database errors (auto-converted via `?` in the store module).
    #[error("database: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("{0}")]
    Other(String),
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, ProvError>;

impl ProvError {
    /// HTTP-equivalent status for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Forbidden(_) => 403,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::Chain(_)
            | Self::Store(_)
            | Self::Config(_)
            | Self::Report(_)
            | Self::Database(_)
            | Self::Other(_) => 500,
        }
    }

    /// Message safe to hand to an untrusted caller.  Server-side failures
    /// collapse to a generic string; the detail stays in the logs.
    pub fn public_message(&self) -> String {
        match self.status_code() {
            500 => "Server error".to_string(),
            _ => self.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// FFI error codes
// ---------------------------------------------------------------------------

/// Integer status codes returned across the C-ABI boundary.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiErrorCode {
    Ok = 0,
    InvalidArgument = -1,
    Forbidden = -2,
    NotFound = -3,
    Conflict = -4,
    ChainError = -5,
    StoreError = -6,
    DatabaseError = -7,
    ConfigError = -8,
    ReportError = -9,
    InternalError = -99,
}

impl From<&ProvError> for FfiErrorCode {
    fn from(e: &ProvError) -> Self {
        match e {
            ProvError::Validation(_) => Self::InvalidArgument,
            ProvError::Forbidden(_) => Self::Forbidden,
            ProvError::NotFound(_) => Self::NotFound,
            ProvError::Conflict(_) => Self::Conflict,
            ProvError::Chain(_) => Self::ChainError,
            ProvError::Store(_) => Self::StoreError,
            ProvError::Database(_) => Self::DatabaseError,
            ProvError::Config(_) => Self::ConfigError,
            ProvError::Report(_) => Self::ReportError,
            ProvError::Other(_) => Self::InternalError,
        }
    }
}

// ---------------------------------------------------------------------------
// Context extension traits
// ---------------------------------------------------------------------------

/// Tags any `Result<T, E>` with the originating subsystem.
///
/// ```ignore
/// tx.commit().ctx_store("commit register")?;
/// ```
pub trait ResultExt<T> {
    fn ctx_store(self, msg: &str) -> Result<T>;
    fn ctx_chain(self, msg: &str) -> Result<T>;
    fn ctx_config(self, msg: &str) -> Result<T>;
    fn ctx_report(self, msg: &str) -> Result<T>;
}

impl<T, E: std::fmt::Display> ResultExt<T> for std::result::Result<T, E> {
    fn ctx_store(self, msg: &str) -> Result<T> {
        self.map_err(|e| ProvError::Store(format!("{msg}: {e}")))
    }
    fn ctx_chain(self, msg: &str) -> Result<T> {
        self.map_err(|e| ProvError::Chain(format!("{msg}: {e}")))
    }
    fn ctx_config(self, msg: &str) -> Result<T> {
        self.map_err(|e| ProvError::Config(format!("{msg}: {e}")))
    }
    fn ctx_report(self, msg: &str) -> Result<T> {
        self.map_err(|e| ProvError::Report(format!("{msg}: {e}")))
    }
}

/// Same as [`ResultExt`] but for `Option<T>` (converts `None` into an error).
pub trait OptionExt<T> {
    fn required_config(self, msg: &str) -> Result<T>;
    fn found(self, msg: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn required_config(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| ProvError::Config(msg.to_string()))
    }
    fn found(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| ProvError::NotFound(msg.to_string()))
    }
}
