//! Error types for the recognition core
//!
//! Dataset-level failures (one bad sample) are recoverable and callers skip
//! the sample. Model-level failures abort the run.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the codec, sample store, model, loss and decoder.
#[derive(Error, Debug)]
pub enum RecognitionError {
    /// A label contains a character outside the alphabet.
    #[error("character {character:?} in label {label:?} is not in the alphabet")]
    InvalidCharacter { character: char, label: String },

    /// A class index does not name a printable character.
    #[error("class index {index} is out of range 1..={max}")]
    OutOfRange { index: usize, max: usize },

    /// Source image missing or undecodable.
    #[error("failed to load image {path:?}: {reason}")]
    ImageLoad { path: PathBuf, reason: String },

    /// Label needs more CTC frames than the model emits.
    #[error("label of length {length} needs {required} timesteps but the model emits {available}")]
    LabelTooLong {
        length: usize,
        required: usize,
        available: usize,
    },

    /// Weights missing, truncated or incompatible with the configured model.
    #[error("failed to load model weights from {path:?}: {reason}")]
    ModelLoad { path: PathBuf, reason: String },

    /// Training found no sample it could use.
    #[error("no usable training samples in {0:?}")]
    EmptyDataset(PathBuf),

    /// Alphabet definition rejected (empty or duplicated characters).
    #[error("invalid alphabet: {0}")]
    InvalidAlphabet(String),

    /// Candle tensor errors.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RecognitionError {
    pub fn model_load(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::ModelLoad {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn image_load(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::ImageLoad {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether a dataset iteration may skip the offending sample and continue
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RecognitionError::ImageLoad { .. } | RecognitionError::InvalidCharacter { .. }
        )
    }
}

/// Result type alias for recognition operations.
pub type Result<T> = std::result::Result<T, RecognitionError>;
