//! See [`Error`].

use thiserror::Error;

/// Error types for this crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error("shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: &'static str,
        expected: String,
        actual: String,
    },

    #[error("no objects in image")]
    EmptyImage,

    #[error("ground truth box {index} has zero area")]
    DegenerateBox { index: usize },

    #[error("class label {label} is out of range for {num_classes} classes")]
    LabelOutOfRange { label: usize, num_classes: usize },

    #[error("box loss is zero, cannot compute a balance factor")]
    ZeroLoss,

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("failed to read `{path}`")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    pub(crate) fn shape(
        context: &'static str,
        expected: impl std::fmt::Debug,
        actual: impl std::fmt::Debug,
    ) -> Self {
        Error::ShapeMismatch {
            context,
            expected: format!("{expected:?}"),
            actual: format!("{actual:?}"),
        }
    }
}

/// Type alias for [`Result<T, Error>`].
pub type Result<T> = std::result::Result<T, Error>;
