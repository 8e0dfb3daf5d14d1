//! Error types for document processing.

use std::path::PathBuf;
use thiserror::Error;

/// Fatal, document-level failures. Page-level OCR problems never surface here,
/// they are recorded in the page's [`crate::entities::PageReport`] instead.
#[derive(Error, Debug)]
pub enum ProcessingError {
    /// The pdfium shared library could not be bound.
    #[error("PDF backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The source document could not be opened.
    #[error("Failed to open '{path}': {reason}")]
    Open { path: PathBuf, reason: String },

    /// The document opened but a page could not be read.
    #[error("Failed to parse page {page} of '{path}': {reason}")]
    Parse {
        path: PathBuf,
        page: usize,
        reason: String,
    },

    /// The image input could not be decoded.
    #[error("Failed to decode image '{path}': {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProcessingError>;

impl ProcessingError {
    pub(crate) fn open(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::Open {
            path: path.into(),
            reason: err.to_string(),
        }
    }

    pub(crate) fn parse(path: impl Into<PathBuf>, page: usize, err: &anyhow::Error) -> Self {
        Self::Parse {
            path: path.into(),
            page,
            reason: format!("{err:#}"),
        }
    }
}
