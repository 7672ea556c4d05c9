use std::sync::atomic::{AtomicUsize, Ordering};

use dt_collective::RuntimeKind;
use dt_tensor::Tensor;
use duet_align::{
    gather_features, AlignError, ContrastiveCore, ContrastiveLoss, GradMode, LossConfig,
};

static TEST_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_group(prefix: &str) -> String {
    let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("{prefix}-{id}")
}

/// Deterministic per-rank batches so the expected gathered tensors can be
/// reconstructed on the main thread without sharing state.
fn worker_features(rank: usize, rows: usize, dim: usize) -> (Tensor, Tensor) {
    let a = Tensor::random_uniform(rows, dim, -1.0, 1.0, Some(100 + rank as u64)).unwrap();
    let b = Tensor::random_uniform(rows, dim, -1.0, 1.0, Some(200 + rank as u64)).unwrap();
    (a, b)
}

fn full_batch(world_size: usize, rows: usize, dim: usize) -> (Tensor, Tensor) {
    let mut all_a = Vec::new();
    let mut all_b = Vec::new();
    for rank in 0..world_size {
        let (a, b) = worker_features(rank, rows, dim);
        all_a.push(a);
        all_b.push(b);
    }
    (
        Tensor::cat_rows(&all_a).unwrap(),
        Tensor::cat_rows(&all_b).unwrap(),
    )
}

fn gathered_blocks_match_inputs(runtime: RuntimeKind, prefix: &str) {
    let world_size = 3;
    let rows = 2;
    let dim = 4;
    let group = unique_group(prefix);
    let mut handles = Vec::new();

    for rank in 0..world_size {
        let group = group.clone();
        handles.push(std::thread::spawn(move || {
            let comm = dt_collective::connect(runtime, group, rank, world_size).unwrap();
            let (a, b) = worker_features(rank, rows, dim);
            gather_features(&a, &b, comm.as_ref(), false, false).unwrap()
        }));
    }

    for handle in handles {
        let gathered = handle.join().expect("worker thread panicked");
        assert_eq!(gathered.all_features_a.shape(), (world_size * rows, dim));
        assert_eq!(gathered.grad_mode, GradMode::LocalOnly);
        assert_eq!(gathered.local_rows.len(), rows);
        for rank in 0..world_size {
            let (a, b) = worker_features(rank, rows, dim);
            let block_a = gathered
                .all_features_a
                .slice_rows(rank * rows, (rank + 1) * rows)
                .unwrap();
            let block_b = gathered
                .all_features_b
                .slice_rows(rank * rows, (rank + 1) * rows)
                .unwrap();
            assert_eq!(block_a, a, "rank {rank} block of modality A");
            assert_eq!(block_b, b, "rank {rank} block of modality B");
        }
    }
}

#[test]
fn process_gather_orders_blocks_by_rank() {
    gathered_blocks_match_inputs(RuntimeKind::Process, "blocks-process");
}

#[test]
fn ring_gather_orders_blocks_by_rank() {
    gathered_blocks_match_inputs(RuntimeKind::Ring, "blocks-ring");
}

#[test]
fn global_logits_obey_the_transpose_law_and_match_single_process() {
    let world_size = 2;
    let rows = 2;
    let dim = 4;
    let scale = 7.5;
    let group = unique_group("global");
    let mut handles = Vec::new();

    for rank in 0..world_size {
        let group = group.clone();
        handles.push(std::thread::spawn(move || {
            let comm =
                dt_collective::connect(RuntimeKind::Process, group, rank, world_size).unwrap();
            let config = LossConfig::default();
            let mut core = ContrastiveCore::new(&config, Some(comm));
            let (a, b) = worker_features(rank, rows, dim);
            core.compute(&a, &b, scale).unwrap()
        }));
    }

    let (all_a, all_b) = full_batch(world_size, rows, dim);
    let mut reference = ContrastiveLoss::new(&LossConfig::default());
    let reference_loss = reference.forward(&all_a, &all_b, scale).unwrap().contrastive();

    for handle in handles {
        let output = handle.join().expect("worker thread panicked");
        assert_eq!(output.logits.per_feature_a.shape(), (4, 4));
        assert_eq!(
            output.logits.per_feature_b,
            output.logits.per_feature_a.transpose()
        );
        assert_eq!(output.labels.as_slice(), &[0, 1, 2, 3]);
        assert!((output.loss - reference_loss).abs() < 1e-5);
    }
}

#[test]
fn local_loss_rows_tile_the_global_matrix() {
    let world_size = 2;
    let rows = 2;
    let dim = 4;
    let scale = 5.0;
    let group = unique_group("local");
    let mut handles = Vec::new();

    for rank in 0..world_size {
        let group = group.clone();
        handles.push(std::thread::spawn(move || {
            let comm =
                dt_collective::connect(RuntimeKind::Process, group, rank, world_size).unwrap();
            let config = LossConfig {
                local_loss: true,
                ..LossConfig::default()
            };
            let mut core = ContrastiveCore::new(&config, Some(comm));
            let (a, b) = worker_features(rank, rows, dim);
            (rank, core.compute(&a, &b, scale).unwrap())
        }));
    }

    let (all_a, all_b) = full_batch(world_size, rows, dim);
    let global = all_a.matmul(&all_b.transpose()).unwrap().scale(scale).unwrap();
    let mut reference = ContrastiveLoss::new(&LossConfig::default());
    let reference_loss = reference.forward(&all_a, &all_b, scale).unwrap().contrastive();

    let mut local_loss_sum = 0.0f32;
    for handle in handles {
        let (rank, output) = handle.join().expect("worker thread panicked");
        // Local rows against global columns: each worker holds its own slice
        // of the full similarity matrix.
        assert_eq!(output.logits.per_feature_a.shape(), (rows, world_size * rows));
        assert_eq!(
            output.logits.per_feature_a,
            global.slice_rows(rank * rows, (rank + 1) * rows).unwrap()
        );
        let expected_labels: Vec<usize> = (rank * rows..(rank + 1) * rows).collect();
        assert_eq!(output.labels.as_slice(), expected_labels.as_slice());
        local_loss_sum += output.loss;
    }
    // The per-worker means average back to the global objective.
    assert!((local_loss_sum / world_size as f32 - reference_loss).abs() < 1e-5);
}

#[test]
fn grad_gather_produces_the_same_logits() {
    let world_size = 2;
    let rows = 2;
    let dim = 3;
    let scale = 4.0;
    let group = unique_group("with-grad");
    let mut handles = Vec::new();

    for rank in 0..world_size {
        let group = group.clone();
        handles.push(std::thread::spawn(move || {
            let comm =
                dt_collective::connect(RuntimeKind::Process, group, rank, world_size).unwrap();
            let config = LossConfig {
                gather_with_grad: true,
                ..LossConfig::default()
            };
            let mut core = ContrastiveCore::new(&config, Some(comm));
            let (a, b) = worker_features(rank, rows, dim);
            core.compute(&a, &b, scale).unwrap()
        }));
    }

    let (all_a, all_b) = full_batch(world_size, rows, dim);
    let mut reference = ContrastiveLoss::new(&LossConfig::default());
    let reference_loss = reference.forward(&all_a, &all_b, scale).unwrap().contrastive();

    for handle in handles {
        let output = handle.join().expect("worker thread panicked");
        assert!((output.loss - reference_loss).abs() < 1e-5);
    }
}

#[test]
fn ring_and_process_runtimes_agree() {
    let world_size = 2;
    let rows = 3;
    let dim = 5;
    let scale = 6.0;
    let mut losses = Vec::new();

    for runtime in [RuntimeKind::Process, RuntimeKind::Ring] {
        let group = unique_group("runtime-parity");
        let mut handles = Vec::new();
        for rank in 0..world_size {
            let group = group.clone();
            handles.push(std::thread::spawn(move || {
                let comm = dt_collective::connect(runtime, group, rank, world_size).unwrap();
                let mut core = ContrastiveCore::new(&LossConfig::default(), Some(comm));
                let (a, b) = worker_features(rank, rows, dim);
                core.compute(&a, &b, scale).unwrap().loss
            }));
        }
        for handle in handles {
            losses.push(handle.join().expect("worker thread panicked"));
        }
    }

    for pair in losses.windows(2) {
        assert!((pair[0] - pair[1]).abs() < 1e-6);
    }
}

#[test]
fn ragged_local_batches_fail_on_every_rank() {
    let world_size = 2;
    let dim = 4;
    let group = unique_group("ragged");
    let mut handles = Vec::new();

    for rank in 0..world_size {
        let group = group.clone();
        handles.push(std::thread::spawn(move || {
            let comm =
                dt_collective::connect(RuntimeKind::Process, group, rank, world_size).unwrap();
            // Rank 0 brings three rows, rank 1 only two.
            let rows = 3 - rank;
            let (a, b) = worker_features(rank, rows, dim);
            gather_features(&a, &b, comm.as_ref(), false, false)
        }));
    }

    for handle in handles {
        match handle.join().expect("worker thread panicked") {
            Err(AlignError::Shape(message)) => {
                assert!(message.contains("local batch sizes disagree"), "{message}");
            }
            other => panic!("expected shape error, got {other:?}"),
        }
    }
}

#[test]
fn batch_size_change_never_serves_stale_labels() {
    let world_size = 2;
    let dim = 4;
    let scale = 5.0;
    let group = unique_group("stale-labels");
    let mut handles = Vec::new();

    for rank in 0..world_size {
        let group = group.clone();
        handles.push(std::thread::spawn(move || {
            let comm =
                dt_collective::connect(RuntimeKind::Process, group, rank, world_size).unwrap();
            let config = LossConfig {
                cache_labels: true,
                ..LossConfig::default()
            };
            let mut core = ContrastiveCore::new(&config, Some(comm));

            let (a3, b3) = worker_features(rank, 3, dim);
            let first = core.compute(&a3, &b3, scale).unwrap();
            let (a2, b2) = worker_features(rank, 2, dim);
            let second = core.compute(&a2, &b2, scale).unwrap();
            (first, second)
        }));
    }

    for handle in handles {
        let (first, second) = handle.join().expect("worker thread panicked");
        let six: Vec<usize> = (0..6).collect();
        assert_eq!(first.labels.as_slice(), six.as_slice());
        assert_eq!(second.logits.per_feature_a.shape(), (4, 4));
        assert_eq!(second.labels.as_slice(), &[0, 1, 2, 3]);
    }
}
