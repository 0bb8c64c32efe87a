use thiserror::Error;

#[derive(Error, Debug)]
pub enum GlusterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Consensus error: {0}")]
    Consensus(#[from] consensus::ConsensusError),

    #[error("API error: {0}")]
    Api(#[from] api::ApiError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, GlusterError>;
