use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShroudError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("insufficient privileges: {0}")]
    Privilege(String),

    #[error("required tool missing: {0}")]
    ResourceMissing(String),

    #[error("state error: {0}")]
    State(String),

    #[error("scope '{scope}' failed: {msg}")]
    Scope { scope: String, msg: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ShroudError>;
