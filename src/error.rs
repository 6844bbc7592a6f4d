use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("missing configuration: {0}")]
    ConfigMissing(&'static str),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("reference portrait rejected: expected exactly one face, found {found}")]
    SeedRejected { found: usize },

    #[error("cannot decode {path}: {reason}")]
    DecodeFailed { path: PathBuf, reason: String },

    #[error("cannot write {path}: {reason}")]
    WriteFailed { path: PathBuf, reason: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Db(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn decode_failed(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::DecodeFailed {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn write_failed(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::WriteFailed {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
