use thiserror::Error;

use crate::remote::RemoteError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("remote: {0}")]
    Remote(#[from] RemoteError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("no table configuration for '{0}'; run ensure_config first")]
    ConfigMissing(String),
    #[error("sync interrupted")]
    Interrupted,
    #[error("invalid state: {0}")]
    State(&'static str),
}

pub type Result<T> = std::result::Result<T, SyncError>;
