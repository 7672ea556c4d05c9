// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of DuetTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::{Collective, CollectiveError};

/// Reduction strategy applied to distributed metrics once synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricReduce {
    /// Keep the sum aggregated across all peers.
    Sum,
    /// Average the aggregated value over the world size.
    Mean,
}

/// Synchronizes gradients in-place: all-reduce sum followed by a local
/// average over the world size.
pub fn synchronize_gradients(
    comm: &dyn Collective,
    gradients: &mut [f32],
) -> Result<(), CollectiveError> {
    comm.all_reduce(gradients)?;
    let scale = 1.0 / comm.world_size() as f32;
    gradients.iter_mut().for_each(|value| *value *= scale);
    Ok(())
}

/// Aggregates metric values in-place according to the reduction policy.
pub fn aggregate_metrics(
    comm: &dyn Collective,
    metrics: &mut [f32],
    reduce: MetricReduce,
) -> Result<(), CollectiveError> {
    comm.all_reduce(metrics)?;
    if reduce == MetricReduce::Mean {
        let scale = 1.0 / comm.world_size() as f32;
        metrics.iter_mut().for_each(|value| *value *= scale);
    }
    Ok(())
}
