use thiserror::Error;

/// Errors produced by the termcast broker.
#[derive(Debug, Error)]
pub enum CastError {
    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("process exited: {0}")]
    ProcessExited(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type CastResult<T> = Result<T, CastError>;
