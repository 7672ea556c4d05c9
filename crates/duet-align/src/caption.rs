use std::sync::Arc;

use dt_collective::{connect, Collective, RuntimeKind};
use dt_tensor::Tensor;

use crate::ce;
use crate::config::CaptionConfig;
use crate::contrastive::{ContrastiveCore, LossOutput, LossTerms};
use crate::{AlignError, Result};

/// Contrastive alignment plus a token-generation cross-entropy, each scaled
/// by its own weight. The two terms are never summed here; composing them is
/// the caller's responsibility.
#[derive(Debug)]
pub struct CaptionContrastiveLoss {
    core: ContrastiveCore,
    contrastive_weight: f32,
    caption_weight: f32,
    pad_id: usize,
    output_dict: bool,
}

impl CaptionContrastiveLoss {
    pub fn new(config: &CaptionConfig) -> Result<Self> {
        Self::from_parts(config, None)
    }

    pub fn with_communicator(config: &CaptionConfig, comm: Arc<dyn Collective>) -> Result<Self> {
        Self::from_parts(config, Some(comm))
    }

    pub fn distributed(
        config: &CaptionConfig,
        runtime: RuntimeKind,
        group: impl Into<String>,
        rank: usize,
        world_size: usize,
    ) -> Result<Self> {
        let comm = connect(runtime, group, rank, world_size)
            .map_err(|err| AlignError::Configuration(err.to_string()))?;
        Self::with_communicator(config, comm)
    }

    fn from_parts(config: &CaptionConfig, comm: Option<Arc<dyn Collective>>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            core: ContrastiveCore::new(&config.base, comm),
            contrastive_weight: config.contrastive_weight,
            caption_weight: config.caption_weight,
            pad_id: config.pad_id,
            output_dict: config.base.output_dict,
        })
    }

    /// Forward pass over paired features plus generated token logits.
    ///
    /// `token_logits` holds one row per token position (batch-major
    /// flattening of batch x sequence), `token_labels` one target id per row.
    /// Positions labelled with the configured pad id contribute nothing to
    /// the caption term.
    pub fn forward(
        &mut self,
        features_a: &Tensor,
        features_b: &Tensor,
        token_logits: &Tensor,
        token_labels: &[usize],
        logit_scale: f32,
    ) -> Result<LossOutput> {
        let contrastive =
            self.contrastive_weight * self.core.compute(features_a, features_b, logit_scale)?.loss;
        let caption =
            self.caption_weight * ce::cross_entropy_ignore(token_logits, token_labels, self.pad_id)?;

        Ok(if self.output_dict {
            LossOutput::Terms(LossTerms {
                contrastive_loss: contrastive,
                caption_loss: Some(caption),
                distill_loss: None,
            })
        } else {
            LossOutput::Pair(contrastive, caption)
        })
    }
}
