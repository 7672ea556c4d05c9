use std::ops::Range;

use dt_collective::Collective;
use dt_tensor::Tensor;
use tracing::debug;

use crate::{AlignError, Result};

/// How gradients flow through a pair of gathered feature tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradMode {
    /// Every row of the gathered tensors participates in the caller's
    /// gradient graph.
    Full,
    /// Only the caller's own `local_rows` span carries gradient; rows
    /// contributed by peers are constants.
    LocalOnly,
}

/// Rank-ordered concatenation of every worker's feature batches, together
/// with the bookkeeping a gradient computation needs to route through the
/// caller's own contribution.
#[derive(Debug, Clone)]
pub struct GatheredFeatures {
    pub all_features_a: Tensor,
    pub all_features_b: Tensor,
    /// Row span of the caller's local batch inside the gathered tensors.
    pub local_rows: Range<usize>,
    pub grad_mode: GradMode,
}

/// Gathers both feature batches across the group.
///
/// Row block `r` of each output corresponds exactly to worker `r`'s local
/// batch. Local batch sizes must agree across the group; a disagreement is
/// detected before any feature data moves and fails on every rank.
pub fn gather_features(
    features_a: &Tensor,
    features_b: &Tensor,
    comm: &dyn Collective,
    local_loss: bool,
    gather_with_grad: bool,
) -> Result<GatheredFeatures> {
    let (rows_a, _) = features_a.shape();
    let (rows_b, _) = features_b.shape();
    if rows_a != rows_b {
        return Err(AlignError::Shape(format!(
            "paired feature batches must have matching row counts (a={rows_a}, b={rows_b})"
        )));
    }

    let rank = comm.rank();
    let world_size = comm.world_size();

    // Ragged local batches would misalign every logit row past the first
    // mismatched block, so the sizes are compared before the feature gather.
    let peer_rows = comm.all_gather(&[rows_a as f32])?;
    for (peer, &peer_count) in peer_rows.iter().enumerate() {
        if peer_count as usize != rows_a {
            return Err(AlignError::Shape(format!(
                "local batch sizes disagree: rank {rank} holds {rows_a} rows, rank {peer} holds {} rows",
                peer_count as usize
            )));
        }
    }

    debug!(
        rank,
        world_size,
        rows = rows_a,
        gather_with_grad,
        local_loss,
        "gathering paired feature batches"
    );

    let mut all_features_a = all_gather_tensor(comm, features_a)?;
    let mut all_features_b = all_gather_tensor(comm, features_b)?;
    let local_rows = rank * rows_a..(rank + 1) * rows_a;

    if gather_with_grad {
        return Ok(GatheredFeatures {
            all_features_a,
            all_features_b,
            local_rows,
            grad_mode: GradMode::Full,
        });
    }

    if !local_loss {
        // The collective output is detached from the caller's graph; writing
        // the local batch back over its own row block keeps that span
        // differentiable.
        all_features_a.write_rows(local_rows.start, features_a)?;
        all_features_b.write_rows(local_rows.start, features_b)?;
    }

    Ok(GatheredFeatures {
        all_features_a,
        all_features_b,
        local_rows,
        grad_mode: GradMode::LocalOnly,
    })
}

fn all_gather_tensor(comm: &dyn Collective, local: &Tensor) -> Result<Tensor> {
    let (rows, cols) = local.shape();
    let gathered = comm.all_gather(local.data())?;
    Ok(Tensor::from_vec(comm.world_size() * rows, cols, gathered)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dt_collective::ProcessGroup;

    #[test]
    fn single_worker_gather_is_identity_with_local_span() {
        let comm = ProcessGroup::connect("gather-solo", 0, 1).unwrap();
        let a = Tensor::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let b = Tensor::from_vec(2, 3, vec![6.0, 5.0, 4.0, 3.0, 2.0, 1.0]).unwrap();
        let gathered = gather_features(&a, &b, &comm, false, false).unwrap();
        assert_eq!(gathered.all_features_a, a);
        assert_eq!(gathered.all_features_b, b);
        assert_eq!(gathered.local_rows, 0..2);
        assert_eq!(gathered.grad_mode, GradMode::LocalOnly);
    }

    #[test]
    fn mismatched_pair_rows_are_rejected_before_any_collective() {
        let comm = ProcessGroup::connect("gather-pair", 0, 1).unwrap();
        let a = Tensor::zeros(2, 3).unwrap();
        let b = Tensor::zeros(3, 3).unwrap();
        assert!(matches!(
            gather_features(&a, &b, &comm, false, false),
            Err(AlignError::Shape(_))
        ));
    }

    #[test]
    fn grad_gather_marks_the_full_tensor() {
        let comm = ProcessGroup::connect("gather-grad", 0, 1).unwrap();
        let a = Tensor::zeros(2, 3).unwrap();
        let b = Tensor::zeros(2, 3).unwrap();
        let gathered = gather_features(&a, &b, &comm, false, true).unwrap();
        assert_eq!(gathered.grad_mode, GradMode::Full);
    }
}
