//! Cross-entropy helpers over raw logits with integer class targets.

use dt_tensor::Tensor;

use crate::{AlignError, Result};

/// Mean categorical cross-entropy between the rows of `logits` and `targets`.
pub fn cross_entropy(logits: &Tensor, targets: &[usize]) -> Result<f32> {
    let (rows, cols) = logits.shape();
    if targets.len() != rows {
        return Err(AlignError::Shape(format!(
            "target count {} does not match logit rows {rows}",
            targets.len()
        )));
    }
    let mut total = 0.0f64;
    for (i, (&target, row)) in targets.iter().zip(logits.data().chunks(cols)).enumerate() {
        if target >= cols {
            return Err(AlignError::InvalidArgument(format!(
                "target {target} out of range for {cols} classes (row {i})"
            )));
        }
        total += nll_of_row(row, target);
    }
    Ok((total / rows as f64) as f32)
}

/// Mean categorical cross-entropy skipping rows whose target equals
/// `ignore_index`. Returns 0.0 when every row is ignored.
pub fn cross_entropy_ignore(
    logits: &Tensor,
    targets: &[usize],
    ignore_index: usize,
) -> Result<f32> {
    let (rows, cols) = logits.shape();
    if targets.len() != rows {
        return Err(AlignError::Shape(format!(
            "target count {} does not match logit rows {rows}",
            targets.len()
        )));
    }
    let mut total = 0.0f64;
    let mut kept = 0usize;
    for (i, (&target, row)) in targets.iter().zip(logits.data().chunks(cols)).enumerate() {
        if target == ignore_index {
            continue;
        }
        if target >= cols {
            return Err(AlignError::InvalidArgument(format!(
                "target {target} out of range for {cols} classes (row {i})"
            )));
        }
        total += nll_of_row(row, target);
        kept += 1;
    }
    if kept == 0 {
        return Ok(0.0);
    }
    Ok((total / kept as f64) as f32)
}

/// Negative log-softmax of `row[target]`, with max subtraction so large
/// logit scales stay finite.
fn nll_of_row(row: &[f32], target: usize) -> f64 {
    let max = row.iter().fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
    let mut denom = 0.0f64;
    for &v in row {
        denom += ((v - max) as f64).exp();
    }
    denom.ln() - (row[target] - max) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cross_entropy_matches_manual_value() {
        // Two rows of two classes; softmax([1, 0]) = [e/(e+1), 1/(e+1)].
        let logits = Tensor::from_vec(2, 2, vec![1.0, 0.0, 0.0, 1.0]).unwrap();
        let loss = cross_entropy(&logits, &[0, 1]).unwrap();
        let expected = -(1.0f64.exp() / (1.0f64.exp() + 1.0)).ln() as f32;
        assert!((loss - expected).abs() < 1e-6);
    }

    #[test]
    fn targets_must_match_row_count() {
        let logits = Tensor::zeros(2, 2).unwrap();
        assert!(matches!(
            cross_entropy(&logits, &[0]),
            Err(AlignError::Shape(_))
        ));
    }

    #[test]
    fn out_of_range_target_is_rejected() {
        let logits = Tensor::zeros(1, 3).unwrap();
        assert!(matches!(
            cross_entropy(&logits, &[3]),
            Err(AlignError::InvalidArgument(_))
        ));
    }

    #[test]
    fn ignored_rows_do_not_contribute() {
        let logits =
            Tensor::from_vec(3, 3, vec![2.0, 0.0, 0.0, 9.0, 9.0, 9.0, 0.0, 2.0, 0.0]).unwrap();
        let with_pad = cross_entropy_ignore(&logits, &[0, 0, 1], 0).unwrap();
        let only_kept = cross_entropy(
            &Tensor::from_vec(1, 3, vec![0.0, 2.0, 0.0]).unwrap(),
            &[1],
        )
        .unwrap();
        assert!((with_pad - only_kept).abs() < 1e-6);
    }

    #[test]
    fn all_ignored_rows_yield_zero() {
        let logits = Tensor::from_vec(2, 2, vec![5.0, -5.0, -5.0, 5.0]).unwrap();
        assert_eq!(cross_entropy_ignore(&logits, &[1, 1], 1).unwrap(), 0.0);
    }
}
