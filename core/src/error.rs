/// Error types for the Flux client core
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FluxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Not authorized: {0}")]
    Unauthorized(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Push channel closed")]
    ChannelClosed,

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("History for peer {0} was superseded by a newer selection")]
    Superseded(u64),

    #[error("Not signed in")]
    NotSignedIn,
}

impl FluxError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            FluxError::Io(_)
            | FluxError::Http(_)
            | FluxError::Timeout(_) => true,
            FluxError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, FluxError>;
