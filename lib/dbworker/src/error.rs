use thiserror::Error;

/// Error taxonomy shared by every backend.
///
/// Native driver errors are mapped into these kinds before they cross the
/// `DbWorker` boundary; callers never see a driver-specific error type.
/// Connect-time failures are split by cause so calling code can present an
/// appropriate message instead of a generic one.
#[derive(Error, Debug)]
pub enum DbError {
    /// A required connection parameter is missing. Reconfigure, do not retry.
    #[error("incomplete connection data: {0}")]
    ConnectionDataIncomplete(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("host unreachable: {0}")]
    HostUnreachable(String),

    #[error("wrong credentials: {0}")]
    WrongCredentials(String),

    #[error("database not found: {0}")]
    DatabaseNotFound(String),

    /// Operation attempted before a successful `connect()`.
    #[error("not connected to the database")]
    NotConnected,

    /// Carries the backend error text and the offending SQL for diagnostics.
    #[error("query failed: {message}; query: {query}")]
    QueryFailed { message: String, query: String },

    /// Invalid or exhausted stream handle passed to a streaming operation.
    #[error("stream error: {0}")]
    Stream(String),

    /// A value expected to be numeric failed validation.
    #[error("data format error: {0}")]
    DataFormat(String),

    /// Missing or invalid setup (no dbworker, no table, malformed field
    /// descriptor, duplicate shard name). These are programming errors;
    /// fail fast, never retry.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The backend cannot express the requested operation.
    #[error("{backend} does not support {operation}")]
    Unsupported {
        backend: &'static str,
        operation: String,
    },
}

impl DbError {
    /// Attach the failed query text to a backend error message.
    pub fn query(message: impl Into<String>, sql: impl Into<String>) -> Self {
        DbError::QueryFailed {
            message: message.into(),
            query: sql.into(),
        }
    }
}
