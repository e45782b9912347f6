use thiserror::Error;

/// Main error type for the Rankwise system
#[derive(Error, Debug)]
pub enum RwError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Invariant violation: {0}")]
    Invariant(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Search-backend errors. One of these for a single query is never fatal to a run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("Transport failure talking to {backend}: {message}")]
    Transport { backend: String, message: String },

    #[error("Backend {backend} answered HTTP {status}: {message}")]
    Status {
        backend: String,
        status: u16,
        message: String,
    },

    #[error("Could not parse {backend} response: {message}")]
    Parse { backend: String, message: String },

    #[error("Operation {operation} is not supported by {backend}")]
    Unsupported { backend: String, operation: String },
}

/// Repository errors
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Repository IO failed at {path}: {message}")]
    Io { path: String, message: String },

    #[error("Repository data is corrupt: {message}")]
    Corrupt { message: String },

    #[error("Score columns {actual:?} do not match scores table {expected:?}")]
    SchemaMismatch {
        expected: Vec<String>,
        actual: Vec<String>,
    },
}

/// Result type alias for Rankwise operations
pub type RwResult<T> = Result<T, RwError>;

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::RwError::Config(format!($($arg)*))
    };
}

/// Macro for creating invariant violations
#[macro_export]
macro_rules! invariant_error {
    ($($arg:tt)*) => {
        $crate::RwError::Invariant(format!($($arg)*))
    };
}
