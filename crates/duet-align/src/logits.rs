use std::ops::Range;
use std::sync::Arc;

use dt_collective::Collective;
use dt_tensor::Tensor;

use crate::gather::gather_features;
use crate::{AlignError, Result};

/// Scaled similarity matrices for one pair of feature batches.
///
/// `per_feature_a[i][j]` is the scaled similarity between row `i` of modality
/// A and row `j` of modality B; `per_feature_b` is the opposite direction.
#[derive(Debug, Clone)]
pub struct LogitPair {
    pub per_feature_a: Tensor,
    pub per_feature_b: Tensor,
    /// Row count of `per_feature_a`; the length the ground-truth labels must
    /// have.
    pub num_logits: usize,
    /// Row span of the caller's local batch inside the global index space.
    pub local_rows: Range<usize>,
}

/// Builds logit matrices from local and/or gathered features under the
/// configured loss policy.
#[derive(Debug, Clone)]
pub struct LogitBuilder {
    local_loss: bool,
    gather_with_grad: bool,
    comm: Option<Arc<dyn Collective>>,
}

impl LogitBuilder {
    pub fn new(
        local_loss: bool,
        gather_with_grad: bool,
        comm: Option<Arc<dyn Collective>>,
    ) -> Self {
        Self {
            local_loss,
            gather_with_grad,
            comm,
        }
    }

    pub fn rank(&self) -> usize {
        self.comm.as_ref().map(|comm| comm.rank()).unwrap_or(0)
    }

    pub fn world_size(&self) -> usize {
        self.comm.as_ref().map(|comm| comm.world_size()).unwrap_or(1)
    }

    pub fn local_loss(&self) -> bool {
        self.local_loss
    }

    /// Computes both directional logit matrices.
    ///
    /// With a single worker this is the plain scaled product. With several,
    /// features are gathered first; the local policy keeps only the caller's
    /// rows while the global policy materialises the full matrix and derives
    /// the second direction as an exact transpose.
    pub fn build(
        &self,
        features_a: &Tensor,
        features_b: &Tensor,
        logit_scale: f32,
    ) -> Result<LogitPair> {
        if !logit_scale.is_finite() || logit_scale <= 0.0 {
            return Err(AlignError::InvalidArgument(format!(
                "logit scale must be finite and > 0, got {logit_scale}"
            )));
        }

        let rows = features_a.rows();
        let comm = match self.comm.as_deref() {
            Some(comm) if comm.world_size() > 1 => comm,
            _ => {
                let per_feature_a = features_a
                    .matmul(&features_b.transpose())?
                    .scale(logit_scale)?;
                let per_feature_b = features_b
                    .matmul(&features_a.transpose())?
                    .scale(logit_scale)?;
                return Ok(LogitPair {
                    per_feature_a,
                    per_feature_b,
                    num_logits: rows,
                    local_rows: 0..rows,
                });
            }
        };
        let gathered = gather_features(
            features_a,
            features_b,
            comm,
            self.local_loss,
            self.gather_with_grad,
        )?;

        if self.local_loss {
            let per_feature_a = features_a
                .matmul(&gathered.all_features_b.transpose())?
                .scale(logit_scale)?;
            let per_feature_b = features_b
                .matmul(&gathered.all_features_a.transpose())?
                .scale(logit_scale)?;
            Ok(LogitPair {
                per_feature_a,
                per_feature_b,
                num_logits: rows,
                local_rows: gathered.local_rows,
            })
        } else {
            let per_feature_a = gathered
                .all_features_a
                .matmul(&gathered.all_features_b.transpose())?
                .scale(logit_scale)?;
            let per_feature_b = per_feature_a.transpose();
            let num_logits = per_feature_a.rows();
            Ok(LogitPair {
                per_feature_a,
                per_feature_b,
                num_logits,
                local_rows: gathered.local_rows,
            })
        }
    }
}
