use serde::{Deserialize, Serialize};

use crate::{AlignError, Result};

/// Construction-time switches shared by every alignment loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    /// Compute logits from local rows against the gathered column set instead
    /// of materialising the full global matrix.
    pub local_loss: bool,
    /// Request a gradient-aware gather so every gathered row stays inside the
    /// caller's autodiff graph.
    pub gather_with_grad: bool,
    /// Memoise ground-truth labels per device.
    pub cache_labels: bool,
    /// Return named loss terms instead of the bare positional values.
    pub output_dict: bool,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            local_loss: false,
            gather_with_grad: false,
            cache_labels: false,
            output_dict: false,
        }
    }
}

/// Configuration for the caption-augmented contrastive loss.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptionConfig {
    /// Weight applied to the contrastive term.
    pub contrastive_weight: f32,
    /// Weight applied to the token-generation term.
    pub caption_weight: f32,
    /// Token id excluded from the caption cross-entropy.
    pub pad_id: usize,
    #[serde(flatten)]
    pub base: LossConfig,
}

impl Default for CaptionConfig {
    fn default() -> Self {
        Self {
            contrastive_weight: 1.0,
            caption_weight: 2.0,
            pad_id: 0,
            base: LossConfig::default(),
        }
    }
}

impl CaptionConfig {
    /// Rejects weights that would silently corrupt the combined objective.
    pub fn validate(&self) -> Result<()> {
        for (label, weight) in [
            ("contrastive_weight", self.contrastive_weight),
            ("caption_weight", self.caption_weight),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(AlignError::InvalidArgument(format!(
                    "{label} must be finite and non-negative, got {weight}"
                )));
            }
        }
        Ok(())
    }
}
