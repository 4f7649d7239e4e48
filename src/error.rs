use std::path::PathBuf;

use thiserror::Error;


#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Image could not be decoded or pushed through the transform chain.
    #[error("cannot translate {path:?}: {reason}")]
    Translate { path: PathBuf, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("training error: {0}")]
    Training(String),

    #[error(transparent)]
    Torch(#[from] tch::TchError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}


impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io { path: path.into(), source }
    }

    pub fn translate(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::Translate { path: path.into(), reason: reason.to_string() }
    }

    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io { .. })
    }
}


pub type Result<T> = std::result::Result<T, Error>;
