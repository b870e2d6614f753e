use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowscopeError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unprocessable trace: {0}")]
    Unprocessable(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("trace backend error: {0}")]
    Backend(String),

    #[error("trace backend timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("io error: {0}")]
    Io(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, FlowscopeError>;
