use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainSimError {
    #[error("Unknown consensus type: {0}")]
    UnknownConsensus(String),

    #[error("Invalid config: {0}")]
    Config(String),

    #[error("Consensus state not initialized: {0}")]
    NotInitialized(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for ChainSimError {
    fn from(e: serde_json::Error) -> Self {
        ChainSimError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ChainSimError>;
