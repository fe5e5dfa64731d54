//! Error types for the WebSocket transport

use thiserror::Error;

/// Result type alias using the transport error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while configuring or driving a WebSocket connection
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid base URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Unsupported URL scheme '{0}', expected ws or wss")]
    UnsupportedScheme(String),

    #[error("Base URL cannot carry a path: {0}")]
    CannotBeABase(String),

    #[error("Project id must not be empty")]
    EmptyProjectId,

    #[error("No tokio runtime is running")]
    NoRuntime,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<Error> for tandem_engine::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Serialization(e) => tandem_engine::Error::Serialization(e.to_string()),
            other => tandem_engine::Error::Transport(other.to_string()),
        }
    }
}
