use std::sync::Arc;

use dt_collective::{connect, Collective, RuntimeKind};
use dt_tensor::Tensor;

use crate::ce;
use crate::config::LossConfig;
use crate::labels::{DeviceId, LabelCache};
use crate::logits::{LogitBuilder, LogitPair};
use crate::{AlignError, Result};

/// Named loss terms; the mapping surface selected by `output_dict`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossTerms {
    pub contrastive_loss: f32,
    pub caption_loss: Option<f32>,
    pub distill_loss: Option<f32>,
}

/// Loss values returned by a forward pass. `Scalar` and `Pair` are the bare
/// positional forms; `Terms` is the named mapping selected by the
/// construction-time `output_dict` flag, honoured identically by every loss
/// in this crate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LossOutput {
    Scalar(f32),
    Pair(f32, f32),
    Terms(LossTerms),
}

impl LossOutput {
    /// The contrastive component, whatever the surface form.
    pub fn contrastive(&self) -> f32 {
        match self {
            LossOutput::Scalar(value) => *value,
            LossOutput::Pair(contrastive, _) => *contrastive,
            LossOutput::Terms(terms) => terms.contrastive_loss,
        }
    }

    /// The caption or distillation component, when one exists.
    pub fn auxiliary(&self) -> Option<f32> {
        match self {
            LossOutput::Scalar(_) => None,
            LossOutput::Pair(_, auxiliary) => Some(*auxiliary),
            LossOutput::Terms(terms) => terms.caption_loss.or(terms.distill_loss),
        }
    }
}

/// Result of one symmetric contrastive computation, kept around so wrapping
/// losses can reuse the logits without rebuilding them.
#[derive(Debug, Clone)]
pub struct ContrastiveOutput {
    pub loss: f32,
    pub logits: LogitPair,
    pub labels: Arc<Vec<usize>>,
}

/// Shared core of every loss in this crate: builds logits, fetches labels
/// and computes the symmetric cross-entropy. The concrete losses wrap a core
/// value instead of inheriting from each other.
#[derive(Debug)]
pub struct ContrastiveCore {
    builder: LogitBuilder,
    labels: LabelCache,
    device: DeviceId,
}

impl ContrastiveCore {
    pub fn new(config: &LossConfig, comm: Option<Arc<dyn Collective>>) -> Self {
        let rank = comm.as_ref().map(|comm| comm.rank()).unwrap_or(0);
        let world_size = comm.as_ref().map(|comm| comm.world_size()).unwrap_or(1);
        Self {
            builder: LogitBuilder::new(config.local_loss, config.gather_with_grad, comm),
            labels: LabelCache::new(rank, world_size, config.local_loss, config.cache_labels),
            device: DeviceId::cpu(),
        }
    }

    /// Overrides the device identity used to key the label cache.
    pub fn with_device(mut self, device: DeviceId) -> Self {
        self.device = device;
        self
    }

    pub fn builder(&self) -> &LogitBuilder {
        &self.builder
    }

    /// Mean of the two directional cross-entropies for one feature pair.
    pub fn compute(
        &mut self,
        features_a: &Tensor,
        features_b: &Tensor,
        logit_scale: f32,
    ) -> Result<ContrastiveOutput> {
        let logits = self.builder.build(features_a, features_b, logit_scale)?;
        let labels = self.labels.ground_truth(&self.device, logits.num_logits);
        let loss_a = ce::cross_entropy(&logits.per_feature_a, &labels)?;
        let loss_b = ce::cross_entropy(&logits.per_feature_b, &labels)?;
        Ok(ContrastiveOutput {
            loss: 0.5 * (loss_a + loss_b),
            logits,
            labels,
        })
    }
}

/// Symmetric contrastive loss over any two paired feature batches.
#[derive(Debug)]
pub struct ContrastiveLoss {
    core: ContrastiveCore,
    output_dict: bool,
}

impl ContrastiveLoss {
    /// Single-worker construction; no collective runtime is involved.
    pub fn new(config: &LossConfig) -> Self {
        Self::from_parts(config, None)
    }

    /// Construction over an already-joined collective runtime.
    pub fn with_communicator(config: &LossConfig, comm: Arc<dyn Collective>) -> Self {
        Self::from_parts(config, Some(comm))
    }

    /// Joins the requested runtime and builds the loss on top of it. Fails
    /// fast when the runtime is unavailable or the topology is invalid.
    pub fn distributed(
        config: &LossConfig,
        runtime: RuntimeKind,
        group: impl Into<String>,
        rank: usize,
        world_size: usize,
    ) -> Result<Self> {
        let comm = connect(runtime, group, rank, world_size)
            .map_err(|err| AlignError::Configuration(err.to_string()))?;
        Ok(Self::with_communicator(config, comm))
    }

    fn from_parts(config: &LossConfig, comm: Option<Arc<dyn Collective>>) -> Self {
        Self {
            core: ContrastiveCore::new(config, comm),
            output_dict: config.output_dict,
        }
    }

    pub fn core_mut(&mut self) -> &mut ContrastiveCore {
        &mut self.core
    }

    pub fn forward(
        &mut self,
        features_a: &Tensor,
        features_b: &Tensor,
        logit_scale: f32,
    ) -> Result<LossOutput> {
        let output = self.core.compute(features_a, features_b, logit_scale)?;
        Ok(if self.output_dict {
            LossOutput::Terms(LossTerms {
                contrastive_loss: output.loss,
                caption_loss: None,
                distill_loss: None,
            })
        } else {
            LossOutput::Scalar(output.loss)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AlignError;

    fn unit_pair() -> (Tensor, Tensor) {
        let a = Tensor::from_fn(3, 3, |r, c| if r == c { 1.0 } else { 0.0 }).unwrap();
        (a.clone(), a)
    }

    #[test]
    fn identical_features_with_sharp_scale_reach_zero_loss() {
        let (a, b) = unit_pair();
        let mut loss = ContrastiveLoss::new(&LossConfig::default());
        match loss.forward(&a, &b, 100.0).unwrap() {
            LossOutput::Scalar(value) => assert!(value < 1e-3),
            other => panic!("expected scalar output, got {other:?}"),
        }
    }

    #[test]
    fn output_dict_switches_to_named_terms() {
        let (a, b) = unit_pair();
        let config = LossConfig {
            output_dict: true,
            ..LossConfig::default()
        };
        let mut named = ContrastiveLoss::new(&config);
        let mut bare = ContrastiveLoss::new(&LossConfig::default());
        let named_out = named.forward(&a, &b, 10.0).unwrap();
        let bare_out = bare.forward(&a, &b, 10.0).unwrap();
        match named_out {
            LossOutput::Terms(terms) => {
                assert_eq!(terms.contrastive_loss, bare_out.contrastive());
                assert!(terms.caption_loss.is_none());
                assert!(terms.distill_loss.is_none());
            }
            other => panic!("expected named terms, got {other:?}"),
        }
    }

    #[test]
    fn loss_matches_hand_rolled_symmetric_cross_entropy() {
        let a = Tensor::from_vec(2, 2, vec![0.8, 0.6, -0.6, 0.8]).unwrap();
        let b = Tensor::from_vec(2, 2, vec![0.6, 0.8, 0.8, -0.6]).unwrap();
        let scale = 3.0;
        let mut loss = ContrastiveLoss::new(&LossConfig::default());
        let value = loss.forward(&a, &b, scale).unwrap().contrastive();

        let mut reference = 0.0f64;
        for (lhs, rhs) in [(&a, &b), (&b, &a)] {
            for i in 0..2 {
                let row: Vec<f64> = (0..2)
                    .map(|j| {
                        let mut dot = 0.0f32;
                        for k in 0..2 {
                            dot += lhs.data()[i * 2 + k] * rhs.data()[j * 2 + k];
                        }
                        (dot * scale) as f64
                    })
                    .collect();
                let denom: f64 = row.iter().map(|v| v.exp()).sum();
                reference += -(row[i].exp() / denom).ln();
            }
        }
        let reference = (reference / 4.0) as f32;
        assert!((value - reference).abs() < 1e-5);
    }

    #[test]
    fn invalid_scale_propagates() {
        let (a, b) = unit_pair();
        let mut loss = ContrastiveLoss::new(&LossConfig::default());
        assert!(matches!(
            loss.forward(&a, &b, -1.0),
            Err(AlignError::InvalidArgument(_))
        ));
    }
}
