//! Error handling for the violation scanner

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Broker unreachable, or a declare/consume/publish/delete failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// No reply arrived on the call's reply channel in time
    #[error("RPC timeout for request {request_id}")]
    RpcTimeout { request_id: String },

    /// Reply body did not match any known response layout
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Collaborator (repository) failure
    #[error("Repository error: {0}")]
    Repository(String),

    /// SQLx database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success answer from an HTTP peer
    #[error("API error: {0}")]
    Api(String),

    /// Config error
    #[error("Config error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<lapin::Error> for Error {
    fn from(e: lapin::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

impl Error {
    /// Errors that only affect a single place's pipeline and are skipped by the scanner
    pub fn is_per_call(&self) -> bool {
        matches!(
            self,
            Error::RpcTimeout { .. } | Error::MalformedResponse(_) | Error::Http(_) | Error::Api(_)
        )
    }
}
