use thiserror::Error;

pub type IpvaultResult<T> = Result<T, IpvaultError>;

#[derive(Debug, Error)]
pub enum IpvaultError {
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid content address: {0:?}")]
    InvalidAddress(String),

    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
