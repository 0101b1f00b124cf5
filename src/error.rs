use std::path::PathBuf;

use burn::record::RecorderError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("dataset not found at {0}")]
    MissingDataset(PathBuf),

    #[error("truncated record file {path}: {len} bytes is not a multiple of {record_len}")]
    TruncatedRecords {
        path: PathBuf,
        len: usize,
        record_len: usize,
    },

    #[error("label {label} out of range for {num_classes} classes in {path}")]
    LabelOutOfRange {
        path: PathBuf,
        label: usize,
        num_classes: usize,
    },

    #[error("class `{class}` in {path} is not a training class")]
    UnknownClass { path: PathBuf, class: String },

    #[error("dataset split at {0} is empty")]
    EmptyDataset(PathBuf),

    #[error("failed to decode image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("{split} images are {actual}x{actual} but the model expects {expected}x{expected}")]
    ImageSizeMismatch {
        split: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid model configuration: {0}")]
    InvalidModel(String),

    #[error("failed to read tensor data: {0}")]
    TensorData(String),

    #[error("unknown training mode `{0}` (expected baseline, cutout, mixup or cutmix)")]
    UnknownMode(String),

    #[error("record error: {0}")]
    Record(#[from] RecorderError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }
}
