use std::path::PathBuf;
use thiserror::Error;

/// Failures tied to the dataset layout or the label mapping.
///
/// Everything else (IO, decoding, records) travels as `anyhow::Error` with context.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("dataset directory {} does not exist", .0.display())]
    MissingDataset(PathBuf),

    #[error("no class subdirectories found in {}", .0.display())]
    NoClasses(PathBuf),

    #[error("the {subset} subset is empty; add images or change the validation split")]
    EmptySubset { subset: &'static str },

    #[error("validation split must be in [0, 1), got {0}")]
    InvalidSplit(f64),

    #[error("invalid label mapping: {0}")]
    InvalidLabels(String),

    #[error("the model predicts {model} classes but the label mapping has {labels}")]
    ClassCountMismatch { model: usize, labels: usize },

    #[error("no images found at {}", .0.display())]
    NoImages(PathBuf),
}
