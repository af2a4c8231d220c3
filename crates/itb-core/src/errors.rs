use crate::instagram::types::ApiError;

/// Core error type.
///
/// Adapter crates map their specific errors into this type so the bot core can
/// handle failures consistently (user-facing message vs retryable).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    /// A publish operation was invoked on an unauthenticated session. This is
    /// a caller bug and always propagates.
    #[error("not authenticated")]
    NotAuthenticated,

    #[error("instagram api error: {0}")]
    Api(#[from] ApiError),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("session vault error: {0}")]
    Vault(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("external error: {0}")]
    External(String),
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Persistence(e.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        Error::Persistence(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
