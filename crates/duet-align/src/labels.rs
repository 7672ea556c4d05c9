use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Identity of the compute device a label batch lives on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn cpu() -> Self {
        Self("cpu".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
struct LabelEntry {
    num_logits: usize,
    labels: Arc<Vec<usize>>,
}

/// Ground-truth index labels for the symmetric cross-entropy, memoised per
/// device. Every entry is invalidated independently when its own `num_logits`
/// changes, so devices with momentarily different batch sizes can never read
/// each other's stale labels.
#[derive(Debug)]
pub struct LabelCache {
    rank: usize,
    world_size: usize,
    local_loss: bool,
    cache_enabled: bool,
    entries: HashMap<DeviceId, LabelEntry>,
}

impl LabelCache {
    pub fn new(rank: usize, world_size: usize, local_loss: bool, cache_enabled: bool) -> Self {
        Self {
            rank,
            world_size,
            local_loss,
            cache_enabled,
            entries: HashMap::new(),
        }
    }

    /// Returns the labels for `num_logits` rows on `device`, reusing the
    /// cached allocation when it is still valid.
    pub fn ground_truth(&mut self, device: &DeviceId, num_logits: usize) -> Arc<Vec<usize>> {
        if let Some(entry) = self.entries.get(device) {
            if entry.num_logits == num_logits {
                return Arc::clone(&entry.labels);
            }
        }

        let offset = if self.local_loss && self.world_size > 1 {
            self.rank * num_logits
        } else {
            0
        };
        let labels: Arc<Vec<usize>> = Arc::new((offset..offset + num_logits).collect());

        if self.cache_enabled {
            debug!(device = %device, num_logits, "refreshing ground-truth label cache");
            self.entries.insert(
                device.clone(),
                LabelEntry {
                    num_logits,
                    labels: Arc::clone(&labels),
                },
            );
        }
        labels
    }
}
