//! Two-worker contrastive training step: gather, logits, loss, metric sync.
//!
//! Run with `cargo run -p duet-align --example distributed_contrastive`.

use std::error::Error;

use dt_collective::{aggregate_metrics, MetricReduce, RuntimeKind};
use dt_tensor::Tensor;
use duet_align::metrics::{register_align_descriptors, top1_accuracy, AlignmentEpochMetrics};
use duet_align::{AlignError, ContrastiveCore, LossConfig};
use tracing::info;

const WORLD_SIZE: usize = 2;
const STEPS: usize = 5;
const BATCH: usize = 8;
const DIM: usize = 32;

fn main() -> Result<(), Box<dyn Error>> {
    let _ = duet_config::tracing::init_tracing();
    register_align_descriptors();

    let mut handles = Vec::new();
    for rank in 0..WORLD_SIZE {
        handles.push(std::thread::spawn(move || worker(rank)));
    }

    for (rank, handle) in handles.into_iter().enumerate() {
        let mean_loss = handle.join().expect("worker thread panicked")?;
        let epoch = AlignmentEpochMetrics {
            mean_contrastive_loss: mean_loss,
            mean_caption_loss: None,
            mean_distill_loss: None,
            batches: STEPS,
        };
        for value in epoch.to_values() {
            info!(rank, name = value.name, value = value.value, "epoch gauge");
        }
    }
    Ok(())
}

fn worker(rank: usize) -> Result<f32, AlignError> {
    let comm = dt_collective::connect(RuntimeKind::Process, "demo-contrastive", rank, WORLD_SIZE)?;
    let config = LossConfig {
        cache_labels: true,
        ..LossConfig::default()
    };
    let mut core = ContrastiveCore::new(&config, Some(comm.clone()));

    let mut total_loss = 0.0f32;
    for step in 0..STEPS {
        let seed = (step * 100 + rank) as u64;
        let features_a = Tensor::random_uniform(BATCH, DIM, -1.0, 1.0, Some(seed))?;
        let features_b = Tensor::random_uniform(BATCH, DIM, -1.0, 1.0, Some(seed + 50))?;
        let output = core.compute(&features_a, &features_b, 10.0)?;
        let accuracy = top1_accuracy(&output.logits.per_feature_a, &output.labels);
        info!(rank, step, loss = output.loss, accuracy, "contrastive step");
        total_loss += output.loss;
    }

    let mut metrics = [total_loss / STEPS as f32];
    aggregate_metrics(comm.as_ref(), &mut metrics, MetricReduce::Mean)?;
    Ok(metrics[0])
}
