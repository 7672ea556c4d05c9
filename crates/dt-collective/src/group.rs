// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of DuetTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, Weak};
use tracing::debug;

use crate::{Collective, CollectiveError};

static GROUPS: Lazy<Mutex<HashMap<String, Weak<GroupState>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

#[derive(Debug)]
struct GroupState {
    inner: Mutex<GroupInner>,
    condvar: Condvar,
}

impl GroupState {
    fn new() -> Self {
        Self {
            inner: Mutex::new(GroupInner::default()),
            condvar: Condvar::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Reduce,
    Gather,
}

#[derive(Debug, Default)]
struct GroupInner {
    expected: usize,
    connected: HashSet<usize>,
    op: Option<Op>,
    arrived: usize,
    departing: usize,
    generation: u64,
    ready_generation: u64,
    segment_len: usize,
    buffer: Vec<f32>,
    result: Vec<f32>,
    error: Option<CollectiveError>,
}

/// Rendezvous-based collective runtime: workers sharing a group name meet at
/// every collective call and exchange buffers under a condvar barrier.
#[derive(Debug)]
pub struct ProcessGroup {
    state: Arc<GroupState>,
    group_id: String,
    rank: usize,
    world_size: usize,
}

impl ProcessGroup {
    /// Connects a worker to a rendezvous group.
    pub fn connect(
        group: impl Into<String>,
        rank: usize,
        world_size: usize,
    ) -> Result<Self, CollectiveError> {
        let group = group.into();
        if world_size == 0 {
            return Err(CollectiveError::EmptyWorldSize(world_size));
        }
        if rank >= world_size {
            return Err(CollectiveError::RankOutOfBounds { rank, world_size });
        }

        let shared = {
            let mut guard = GROUPS.lock().unwrap();
            let entry = guard.entry(group.clone()).or_insert_with(Weak::new);
            if let Some(existing) = entry.upgrade() {
                existing
            } else {
                let created = Arc::new(GroupState::new());
                *entry = Arc::downgrade(&created);
                created
            }
        };

        {
            let mut state = shared.inner.lock().unwrap();
            if state.expected == 0 {
                state.expected = world_size;
            } else if state.expected != world_size {
                return Err(CollectiveError::WorldSizeMismatch {
                    expected: state.expected,
                    got: world_size,
                });
            }
            if !state.connected.insert(rank) {
                return Err(CollectiveError::DuplicateRank { rank });
            }
        }

        debug!(group = %group, rank, world_size, "joined process group");
        Ok(Self {
            state: shared,
            group_id: group,
            rank,
            world_size,
        })
    }

    /// Runs one barrier round of the given operation. The round completes
    /// only once every member has arrived; a fault poisons the round and is
    /// returned on every participating rank.
    fn run_collective(&self, op: Op, local: &[f32]) -> Result<Vec<f32>, CollectiveError> {
        let group = &self.state;
        let mut state = group.inner.lock().unwrap();

        if !state.connected.contains(&self.rank) {
            return Err(CollectiveError::UnknownRank { rank: self.rank });
        }
        if state.expected != self.world_size {
            return Err(CollectiveError::WorldSizeMismatch {
                expected: state.expected,
                got: self.world_size,
            });
        }

        // A new round must not begin while readers of the previous result are
        // still inside the exit path.
        while state.departing > 0 {
            state = group.condvar.wait(state).unwrap();
        }

        if state.arrived == 0 {
            state.generation = state.generation.wrapping_add(1);
            state.op = Some(op);
            state.segment_len = local.len();
            let capacity = match op {
                Op::Reduce => local.len(),
                Op::Gather => local.len() * state.expected,
            };
            state.buffer.clear();
            state.buffer.resize(capacity, 0.0);
            state.error = None;
        } else if state.op != Some(op) {
            state.error = Some(CollectiveError::OperationMismatch);
        } else if state.segment_len != local.len() {
            state.error = Some(CollectiveError::BufferLengthMismatch {
                expected: state.segment_len,
                got: local.len(),
            });
        }

        if state.error.is_none() {
            match op {
                Op::Reduce => {
                    for (dst, value) in state.buffer.iter_mut().zip(local.iter()) {
                        *dst += *value;
                    }
                }
                Op::Gather => {
                    let offset = self.rank * state.segment_len;
                    state.buffer[offset..offset + local.len()].copy_from_slice(local);
                }
            }
        }

        state.arrived += 1;
        let current = state.generation;

        if state.arrived == state.expected {
            state.result = state.buffer.clone();
            state.arrived = 0;
            state.departing = state.expected;
            state.ready_generation = current;
            group.condvar.notify_all();
        } else {
            while state.ready_generation != current {
                state = group.condvar.wait(state).unwrap();
            }
        }

        let outcome = match state.error.clone() {
            Some(error) => Err(error),
            None => Ok(state.result.clone()),
        };
        state.departing -= 1;
        if state.departing == 0 {
            group.condvar.notify_all();
        }
        outcome
    }
}

impl Collective for ProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_gather(&self, local: &[f32]) -> Result<Vec<f32>, CollectiveError> {
        self.run_collective(Op::Gather, local)
    }

    fn all_reduce(&self, buffer: &mut [f32]) -> Result<(), CollectiveError> {
        let summed = self.run_collective(Op::Reduce, buffer)?;
        buffer.copy_from_slice(&summed);
        Ok(())
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        {
            let mut state = self.state.inner.lock().unwrap();
            state.connected.remove(&self.rank);
            if state.connected.is_empty() {
                state.expected = 0;
                state.op = None;
                state.arrived = 0;
                state.departing = 0;
                state.buffer.clear();
                state.result.clear();
                state.ready_generation = 0;
                state.error = None;
            }
        }

        let mut groups = GROUPS.lock().unwrap();
        let remove = groups
            .get(&self.group_id)
            .map(|weak| weak.upgrade().is_none())
            .unwrap_or(false);
        if remove {
            groups.remove(&self.group_id);
        }
    }
}
