//! Telemetry descriptors and diagnostics for the alignment objectives.

use once_cell::sync::Lazy;
use std::sync::RwLock;

use dt_tensor::Tensor;

/// Units associated with a metric descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricUnit {
    /// Dimensionless scalar value (losses, ratios, etc.).
    Scalar,
    /// Raw count of occurrences, batches, or steps.
    Count,
}

/// Descriptor describing a metric that can be emitted by alignment code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricDescriptor {
    /// Canonical metric name registered with the telemetry layer.
    pub name: &'static str,
    /// Unit associated with the metric value.
    pub unit: MetricUnit,
    /// Human readable description for dashboards and registries.
    pub description: &'static str,
}

/// Gauge value paired with a descriptor name.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricValue {
    /// Name matching a registered descriptor.
    pub name: &'static str,
    /// Recorded value.
    pub value: f32,
    /// Unit associated with the reading.
    pub unit: MetricUnit,
}

static REGISTRY: Lazy<RwLock<Vec<MetricDescriptor>>> = Lazy::new(|| RwLock::new(Vec::new()));

/// Registers a collection of metric descriptors, ignoring duplicates.
pub fn register_descriptors(descriptors: &[MetricDescriptor]) {
    let mut registry = REGISTRY
        .write()
        .expect("metric registry write lock should not be poisoned");
    for descriptor in descriptors {
        if registry
            .iter()
            .all(|existing| existing.name != descriptor.name)
        {
            registry.push(*descriptor);
        }
    }
}

/// Returns the list of descriptors that were registered so far.
pub fn descriptors() -> Vec<MetricDescriptor> {
    REGISTRY
        .read()
        .expect("metric registry read lock should not be poisoned")
        .clone()
}

/// Canonical descriptors exposed by the alignment objectives.
pub const ALIGN_DESCRIPTORS: &[MetricDescriptor] = &[
    MetricDescriptor {
        name: "align.contrastive.loss",
        unit: MetricUnit::Scalar,
        description: "Mean contrastive loss observed during the epoch.",
    },
    MetricDescriptor {
        name: "align.caption.loss",
        unit: MetricUnit::Scalar,
        description: "Mean weighted caption loss observed during the epoch.",
    },
    MetricDescriptor {
        name: "align.distill.loss",
        unit: MetricUnit::Scalar,
        description: "Mean distillation loss observed during the epoch.",
    },
    MetricDescriptor {
        name: "align.contrastive.batches",
        unit: MetricUnit::Count,
        description: "Total number of batches processed in the epoch.",
    },
];

/// Convenience wrapper that registers the built-in alignment descriptors.
pub fn register_align_descriptors() {
    register_descriptors(ALIGN_DESCRIPTORS);
}

/// Metric payload summarising an alignment epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignmentEpochMetrics {
    /// Mean contrastive loss recorded for the epoch.
    pub mean_contrastive_loss: f32,
    /// Mean caption loss, when the caption objective ran.
    pub mean_caption_loss: Option<f32>,
    /// Mean distillation loss, when the distillation objective ran.
    pub mean_distill_loss: Option<f32>,
    /// Total number of batches seen in the epoch.
    pub batches: usize,
}

impl AlignmentEpochMetrics {
    /// Builds gauge values suitable for publishing to the telemetry layer.
    pub fn to_values(self) -> Vec<MetricValue> {
        let mut values = vec![MetricValue {
            name: "align.contrastive.loss",
            value: self.mean_contrastive_loss,
            unit: MetricUnit::Scalar,
        }];
        if let Some(caption) = self.mean_caption_loss {
            values.push(MetricValue {
                name: "align.caption.loss",
                value: caption,
                unit: MetricUnit::Scalar,
            });
        }
        if let Some(distill) = self.mean_distill_loss {
            values.push(MetricValue {
                name: "align.distill.loss",
                value: distill,
                unit: MetricUnit::Scalar,
            });
        }
        values.push(MetricValue {
            name: "align.contrastive.batches",
            value: self.batches as f32,
            unit: MetricUnit::Count,
        });
        values
    }
}

/// Fraction of rows whose highest logit sits on the ground-truth column.
pub fn top1_accuracy(logits: &Tensor, labels: &[usize]) -> f32 {
    let (rows, cols) = logits.shape();
    if rows == 0 || labels.len() != rows {
        return 0.0;
    }
    let mut correct = 0usize;
    for (row, &label) in logits.data().chunks(cols).zip(labels.iter()) {
        let mut max_idx = 0usize;
        let mut max_value = f32::NEG_INFINITY;
        for (idx, &value) in row.iter().enumerate() {
            if value > max_value {
                max_idx = idx;
                max_value = value;
            }
        }
        if max_idx == label {
            correct += 1;
        }
    }
    correct as f32 / rows as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registering_descriptors_is_idempotent() {
        register_align_descriptors();
        register_align_descriptors();
        let registered = descriptors();
        assert_eq!(registered.len(), ALIGN_DESCRIPTORS.len());
        assert!(registered
            .iter()
            .any(|descriptor| descriptor.name == "align.contrastive.loss"));
    }

    #[test]
    fn epoch_metrics_skip_absent_terms() {
        let metrics = AlignmentEpochMetrics {
            mean_contrastive_loss: 0.42,
            mean_caption_loss: None,
            mean_distill_loss: Some(0.1),
            batches: 17,
        };
        let values = metrics.to_values();
        assert_eq!(values.len(), 3);
        assert_eq!(values[0].name, "align.contrastive.loss");
        assert_eq!(values[1].name, "align.distill.loss");
        assert_eq!(values[2].value, 17.0);
        assert_eq!(values[2].unit, MetricUnit::Count);
    }

    #[test]
    fn top1_accuracy_counts_diagonal_hits() {
        let logits =
            Tensor::from_vec(2, 2, vec![2.0, 0.0, 1.0, 0.5]).unwrap();
        let accuracy = top1_accuracy(&logits, &[0, 1]);
        assert!((accuracy - 0.5).abs() < f32::EPSILON);
    }
}
