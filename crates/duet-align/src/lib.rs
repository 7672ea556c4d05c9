//! Contrastive and distillation objectives for dual-encoder training.
//!
//! The losses in this crate operate on paired feature batches produced by two
//! encoders (image/text, or any two modalities) and reconstruct the global
//! similarity matrix when the batch is sharded across distributed workers.

pub mod caption;
pub mod ce;
pub mod config;
pub mod contrastive;
pub mod distill;
pub mod gather;
pub mod labels;
pub mod logits;
pub mod metrics;

use dt_collective::CollectiveError;
use dt_tensor::TensorError;
use thiserror::Error;

pub use caption::CaptionContrastiveLoss;
pub use config::{CaptionConfig, LossConfig};
pub use contrastive::{ContrastiveCore, ContrastiveLoss, ContrastiveOutput, LossOutput, LossTerms};
pub use distill::DistillationLoss;
pub use gather::{gather_features, GatheredFeatures, GradMode};
pub use labels::{DeviceId, LabelCache};
pub use logits::{LogitBuilder, LogitPair};

/// Errors surfaced by the alignment objectives crate.
#[derive(Debug, Error, PartialEq)]
pub enum AlignError {
    /// Raised when inputs have mismatched batch or feature dimensions.
    #[error("shape mismatch: {0}")]
    Shape(String),
    /// Raised when an invalid parameter (logit scale, weights, etc.) is provided.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Raised when the requested distributed setup cannot be honoured.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Raised when a collective call fails; never retried.
    #[error("collective communication failed: {0}")]
    Communication(#[from] CollectiveError),
}

pub type Result<T> = std::result::Result<T, AlignError>;

impl From<TensorError> for AlignError {
    fn from(err: TensorError) -> Self {
        match err {
            TensorError::InvalidDimensions { rows, cols } => {
                AlignError::Shape(format!("invalid tensor dimensions: {rows}x{cols}"))
            }
            TensorError::DataLength { expected, got } => AlignError::Shape(format!(
                "data length mismatch: expected {expected}, got {got}"
            )),
            TensorError::ShapeMismatch { left, right } => {
                AlignError::Shape(format!("shape mismatch: left={left:?}, right={right:?}"))
            }
            other => AlignError::InvalidArgument(other.to_string()),
        }
    }
}
