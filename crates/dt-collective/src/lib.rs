// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of DuetTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! In-process collective communication runtimes for DuetTorch.
//!
//! Workers are threads that join a named group and synchronize exclusively
//! through blocking collectives. Two runtimes are provided behind the
//! [`Collective`] capability trait: a rendezvous-based [`ProcessGroup`] and,
//! when the `ring` feature is enabled, a channel-based [`RingGroup`]. There
//! are no timeouts and no retries; a peer that never enters a collective
//! stalls the group, and every detectable fault is fatal.

pub mod group;
#[cfg(feature = "ring")]
pub mod ring;
pub mod sync;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

pub use group::ProcessGroup;
#[cfg(feature = "ring")]
pub use ring::RingGroup;
pub use sync::{aggregate_metrics, synchronize_gradients, MetricReduce};

/// Errors produced by the collective runtimes.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum CollectiveError {
    #[error("world size must be positive, got {0}")]
    EmptyWorldSize(usize),
    #[error("rank {rank} is out of bounds for world size {world_size}")]
    RankOutOfBounds { rank: usize, world_size: usize },
    #[error("group expects world size {expected}, got {got}")]
    WorldSizeMismatch { expected: usize, got: usize },
    #[error("rank {rank} already joined the group")]
    DuplicateRank { rank: usize },
    #[error("rank {rank} has not joined the group")]
    UnknownRank { rank: usize },
    #[error("buffer length mismatch: expected {expected}, got {got}")]
    BufferLengthMismatch { expected: usize, got: usize },
    #[error("workers entered different collective operations in the same round")]
    OperationMismatch,
    #[error("peer rank {rank} disconnected during a collective")]
    PeerDisconnected { rank: usize },
    #[error("collective backend '{backend}' is not compiled into this build")]
    BackendUnavailable { backend: &'static str },
}

/// Capability object implemented by every collective runtime.
///
/// `all_gather` output is ordered by ascending rank: block `r` of the result
/// is exactly rank `r`'s `local` buffer, regardless of arrival order.
pub trait Collective: Send + Sync + std::fmt::Debug {
    /// Identifier of the current worker inside the group.
    fn rank(&self) -> usize;
    /// Total number of workers in the group.
    fn world_size(&self) -> usize;
    /// Blocking all-gather into a freshly allocated rank-ordered buffer.
    fn all_gather(&self, local: &[f32]) -> Result<Vec<f32>, CollectiveError>;
    /// Blocking in-place all-reduce sum.
    fn all_reduce(&self, buffer: &mut [f32]) -> Result<(), CollectiveError>;
}

/// Which collective runtime a worker joins. Selection is exclusive by
/// construction; there is no way to request two runtimes at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    /// Rendezvous groups synchronized with condition variables.
    Process,
    /// Segment passing around a ring of channels.
    Ring,
}

/// Joins the requested runtime and returns it as a shared capability object.
///
/// Requesting [`RuntimeKind::Ring`] in a build without the `ring` feature is
/// a configuration error, never a silent fallback to another runtime.
pub fn connect(
    kind: RuntimeKind,
    group: impl Into<String>,
    rank: usize,
    world_size: usize,
) -> Result<Arc<dyn Collective>, CollectiveError> {
    match kind {
        RuntimeKind::Process => Ok(Arc::new(ProcessGroup::connect(group, rank, world_size)?)),
        #[cfg(feature = "ring")]
        RuntimeKind::Ring => Ok(Arc::new(RingGroup::connect(group, rank, world_size)?)),
        #[cfg(not(feature = "ring"))]
        RuntimeKind::Ring => Err(CollectiveError::BackendUnavailable { backend: "ring" }),
    }
}
