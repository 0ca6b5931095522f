//! Error types for the live mapping node

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SlamError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("calibration error: {0}")]
    Calibration(String),

    #[error("photometric calibration error: {0}")]
    Photometric(String),

    #[error("vocabulary error: {0}")]
    Vocabulary(String),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("export error: {0}")]
    Export(String),

    #[error("ingestion worker panicked")]
    WorkerPanicked,

    #[error("mapping thread panicked")]
    MapperPanicked,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SlamError>;
