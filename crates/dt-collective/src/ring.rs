// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of DuetTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, Weak};
use tracing::debug;

use crate::{Collective, CollectiveError};

/// Payload passed around the ring: the originating rank and its segment.
type Segment = (usize, Vec<f32>);

static HUBS: Lazy<Mutex<HashMap<String, Weak<RingHub>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

#[derive(Debug)]
struct RingHub {
    inner: Mutex<HubInner>,
    condvar: Condvar,
}

impl RingHub {
    fn new() -> Self {
        Self {
            inner: Mutex::new(HubInner::default()),
            condvar: Condvar::new(),
        }
    }
}

#[derive(Debug, Default)]
struct HubInner {
    expected: usize,
    connected: HashSet<usize>,
    senders: HashMap<usize, Sender<Segment>>,
    inboxes: HashMap<usize, Receiver<Segment>>,
}

/// Ring-based collective runtime: every worker owns an inbox channel and a
/// handle to its right neighbour; collectives circulate segments around the
/// ring in `world_size - 1` hops.
#[derive(Debug)]
pub struct RingGroup {
    hub: Arc<RingHub>,
    group_id: String,
    rank: usize,
    world_size: usize,
    right: Mutex<Sender<Segment>>,
    inbox: Mutex<Receiver<Segment>>,
}

impl RingGroup {
    /// Connects a worker to a ring group, blocking until every rank has
    /// registered its channel endpoints.
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

        let hub = {
            let mut guard = HUBS.lock().unwrap();
            let entry = guard.entry(group.clone()).or_insert_with(Weak::new);
            if let Some(existing) = entry.upgrade() {
                existing
            } else {
                let created = Arc::new(RingHub::new());
                *entry = Arc::downgrade(&created);
                created
            }
        };

        let (right, inbox) = {
            let mut state = hub.inner.lock().unwrap();
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

            let (sender, receiver) = channel();
            state.senders.insert(rank, sender);
            state.inboxes.insert(rank, receiver);
            hub.condvar.notify_all();

            while state.senders.len() < state.expected {
                state = hub.condvar.wait(state).unwrap();
            }

            let right_rank = (rank + 1) % world_size;
            let right = state.senders[&right_rank].clone();
            let inbox = state
                .inboxes
                .remove(&rank)
                .ok_or(CollectiveError::UnknownRank { rank })?;
            (right, inbox)
        };

        debug!(group = %group, rank, world_size, "joined ring group");
        Ok(Self {
            hub,
            group_id: group,
            rank,
            world_size,
            right: Mutex::new(right),
            inbox: Mutex::new(inbox),
        })
    }
}

impl Collective for RingGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_gather(&self, local: &[f32]) -> Result<Vec<f32>, CollectiveError> {
        let world = self.world_size;
        let right_rank = (self.rank + 1) % world;
        let left_rank = (self.rank + world - 1) % world;

        let mut segments: Vec<Vec<f32>> = vec![Vec::new(); world];
        segments[self.rank] = local.to_vec();
        let mut carry: Segment = (self.rank, local.to_vec());

        for _ in 1..world {
            self.right
                .lock()
                .unwrap()
                .send(carry.clone())
                .map_err(|_| CollectiveError::PeerDisconnected { rank: right_rank })?;
            let (source, data) = self
                .inbox
                .lock()
                .unwrap()
                .recv()
                .map_err(|_| CollectiveError::PeerDisconnected { rank: left_rank })?;
            if data.len() != local.len() {
                return Err(CollectiveError::BufferLengthMismatch {
                    expected: local.len(),
                    got: data.len(),
                });
            }
            segments[source] = data.clone();
            carry = (source, data);
        }

        let mut out = Vec::with_capacity(world * local.len());
        for segment in &segments {
            out.extend_from_slice(segment);
        }
        Ok(out)
    }

    fn all_reduce(&self, buffer: &mut [f32]) -> Result<(), CollectiveError> {
        if buffer.is_empty() {
            return Ok(());
        }
        let gathered = self.all_gather(buffer)?;
        buffer.iter_mut().for_each(|slot| *slot = 0.0);
        for segment in gathered.chunks(buffer.len()) {
            for (dst, value) in buffer.iter_mut().zip(segment.iter()) {
                *dst += *value;
            }
        }
        Ok(())
    }
}

impl Drop for RingGroup {
    fn drop(&mut self) {
        {
            let mut state = self.hub.inner.lock().unwrap();
            state.connected.remove(&self.rank);
            state.senders.remove(&self.rank);
            if state.connected.is_empty() {
                state.expected = 0;
                state.inboxes.clear();
            }
        }

        let mut hubs = HUBS.lock().unwrap();
        let remove = hubs
            .get(&self.group_id)
            .map(|weak| weak.upgrade().is_none())
            .unwrap_or(false);
        if remove {
            hubs.remove(&self.group_id);
        }
    }
}
