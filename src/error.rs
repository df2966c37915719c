use thiserror::Error as ThisError;

/// Errors produced while loading inputs or running the benchmark pipeline.
#[derive(ThisError, Debug)]
pub enum Error {
    /// An input is missing or invalid. Checked before any registration work.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// No valid registration is possible, e.g. a crop left zero points.
    #[error("geometric degeneracy: {0}")]
    GeometricDegeneracy(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl Error {
    pub(crate) fn config<S: Into<String>>(msg: S) -> Self {
        Error::Configuration(msg.into())
    }

    pub(crate) fn degenerate<S: Into<String>>(msg: S) -> Self {
        Error::GeometricDegeneracy(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
