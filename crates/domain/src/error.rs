/// Shared error type used across all RoomBridge crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    /// An upstream provider rejected or failed a request.  `message`
    /// carries the status line and raw body (`"HTTP 400 - {...}"`) so the
    /// classifier can inspect it.
    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    /// The provider finished a round without producing any content.
    #[error("provider {provider} returned no content")]
    EmptyResponse { provider: String },

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
