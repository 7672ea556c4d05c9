// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of DuetTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use core::fmt;
use duet_config::determinism;
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand_distr::StandardNormal;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Result alias used throughout the tensor crate.
pub type TensorResult<T> = Result<T, TensorError>;

/// Errors emitted by tensor utilities.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TensorError {
    /// A tensor constructor received an invalid shape.
    InvalidDimensions { rows: usize, cols: usize },
    /// Data provided to a constructor does not match the tensor shape.
    DataLength { expected: usize, got: usize },
    /// An operator was asked to combine tensors of incompatible shapes.
    ShapeMismatch {
        left: (usize, usize),
        right: (usize, usize),
    },
    /// A row span fell outside the tensor.
    RowRange {
        start: usize,
        end: usize,
        rows: usize,
    },
    /// Computation received an empty input which would otherwise trigger a panic.
    EmptyInput(&'static str),
    /// Generic parameter violation for tensor helpers.
    InvalidValue { label: &'static str },
}

impl fmt::Display for TensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TensorError::InvalidDimensions { rows, cols } => {
                write!(
                    f,
                    "invalid tensor dimensions ({rows} x {cols}); both axes must be non-zero"
                )
            }
            TensorError::DataLength { expected, got } => {
                write!(f, "data length mismatch: expected {expected}, got {got}")
            }
            TensorError::ShapeMismatch { left, right } => {
                write!(
                    f,
                    "shape mismatch: left={left:?}, right={right:?} cannot be combined"
                )
            }
            TensorError::RowRange { start, end, rows } => {
                write!(
                    f,
                    "row span {start}..{end} is out of bounds for {rows} rows"
                )
            }
            TensorError::EmptyInput(label) => {
                write!(f, "{label} must not be empty for this computation")
            }
            TensorError::InvalidValue { label } => {
                write!(f, "invalid value for {label}")
            }
        }
    }
}

impl std::error::Error for TensorError {}

/// Row-major dense matrix of `f32` values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

// Below this volume the rayon dispatch overhead outweighs the work.
const PAR_MATMUL_VOLUME: usize = 32_768;

impl Tensor {
    /// Create a tensor filled with zeros.
    pub fn zeros(rows: usize, cols: usize) -> TensorResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        Ok(Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        })
    }

    /// Create a tensor from raw data. The provided vector must match
    /// `rows * cols` elements.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> TensorResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        if data.len() != rows * cols {
            return Err(TensorError::DataLength {
                expected: rows * cols,
                got: data.len(),
            });
        }
        Ok(Self { rows, cols, data })
    }

    /// Construct a tensor by applying a generator function to each coordinate.
    pub fn from_fn<F>(rows: usize, cols: usize, mut f: F) -> TensorResult<Self>
    where
        F: FnMut(usize, usize) -> f32,
    {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        let mut data = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                data.push(f(r, c));
            }
        }
        Ok(Self { rows, cols, data })
    }

    fn seedable_rng(seed: Option<u64>, label: &str) -> StdRng {
        determinism::rng_from_optional(seed, label)
    }

    /// Construct a tensor by sampling a uniform distribution in `[min, max)`.
    ///
    /// When `seed` is provided the RNG becomes deterministic which makes tests
    /// reproducible. Otherwise entropy from the host is used.
    pub fn random_uniform(
        rows: usize,
        cols: usize,
        min: f32,
        max: f32,
        seed: Option<u64>,
    ) -> TensorResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        if !(min < max) {
            return Err(TensorError::InvalidValue {
                label: "random_uniform_bounds",
            });
        }
        let mut rng = Self::seedable_rng(seed, "dt-tensor/dense/uniform");
        let distribution = Uniform::new(min, max);
        let mut data = Vec::with_capacity(rows * cols);
        for _ in 0..rows * cols {
            data.push(distribution.sample(&mut rng));
        }
        Ok(Self { rows, cols, data })
    }

    /// Construct a tensor by sampling a normal distribution with the provided
    /// mean and standard deviation.
    pub fn random_normal(
        rows: usize,
        cols: usize,
        mean: f32,
        std: f32,
        seed: Option<u64>,
    ) -> TensorResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        if std <= 0.0 {
            return Err(TensorError::InvalidValue {
                label: "random_normal_std",
            });
        }
        let mut rng = Self::seedable_rng(seed, "dt-tensor/dense/normal");
        let gaussian = StandardNormal;
        let mut data = Vec::with_capacity(rows * cols);
        for _ in 0..rows * cols {
            let sample: f64 = gaussian.sample(&mut rng);
            data.push(mean + std * sample as f32);
        }
        Ok(Self { rows, cols, data })
    }

    /// Returns the `(rows, cols)` pair of the tensor.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Number of rows.
    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Total number of elements stored in the tensor.
    #[inline]
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    /// Always false; constructors reject zero-sized axes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Read-only view of the underlying row-major buffer.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable view of the underlying row-major buffer.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Borrow a single row as a slice.
    pub fn row(&self, index: usize) -> TensorResult<&[f32]> {
        if index >= self.rows {
            return Err(TensorError::RowRange {
                start: index,
                end: index + 1,
                rows: self.rows,
            });
        }
        Ok(&self.data[index * self.cols..(index + 1) * self.cols])
    }

    /// Matrix multiply: `self (m x k) · other (k x n) -> (m x n)`.
    pub fn matmul(&self, other: &Tensor) -> TensorResult<Tensor> {
        if self.cols != other.rows {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        let inner = self.cols;
        let cols = other.cols;
        // Walk the rhs by rows of its transpose so both operands stream
        // contiguously.
        let packed = other.transpose();
        let mut out = vec![0.0f32; self.rows * cols];

        let kernel = |i: usize, row_out: &mut [f32]| {
            let lhs = &self.data[i * inner..(i + 1) * inner];
            for (j, slot) in row_out.iter_mut().enumerate() {
                let rhs = &packed.data[j * inner..(j + 1) * inner];
                let mut acc = 0.0f32;
                for (a, b) in lhs.iter().zip(rhs.iter()) {
                    acc += a * b;
                }
                *slot = acc;
            }
        };

        if self.rows * cols * inner >= PAR_MATMUL_VOLUME && !determinism::lock_reduction_order() {
            out.par_chunks_mut(cols)
                .enumerate()
                .for_each(|(i, row_out)| kernel(i, row_out));
        } else {
            for (i, row_out) in out.chunks_mut(cols).enumerate() {
                kernel(i, row_out);
            }
        }
        Tensor::from_vec(self.rows, cols, out)
    }

    /// Returns the transposed tensor.
    pub fn transpose(&self) -> Tensor {
        let mut data = vec![0.0f32; self.len()];
        for r in 0..self.rows {
            let offset = r * self.cols;
            for c in 0..self.cols {
                data[c * self.rows + r] = self.data[offset + c];
            }
        }
        Tensor {
            rows: self.cols,
            cols: self.rows,
            data,
        }
    }

    /// Multiplies every element by `value`.
    pub fn scale(&self, value: f32) -> TensorResult<Tensor> {
        let data = self.data.iter().map(|v| v * value).collect();
        Tensor::from_vec(self.rows, self.cols, data)
    }

    /// Element-wise sum of two equally shaped tensors.
    pub fn add(&self, other: &Tensor) -> TensorResult<Tensor> {
        if self.shape() != other.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a + b)
            .collect();
        Tensor::from_vec(self.rows, self.cols, data)
    }

    /// Concatenates tensors along the row axis, in the order given.
    pub fn cat_rows(tensors: &[Tensor]) -> TensorResult<Tensor> {
        if tensors.is_empty() {
            return Err(TensorError::EmptyInput("Tensor::cat_rows"));
        }
        let cols = tensors[0].cols;
        let mut total_rows = 0usize;
        for tensor in tensors {
            if tensor.cols != cols {
                return Err(TensorError::ShapeMismatch {
                    left: tensor.shape(),
                    right: (tensor.rows, cols),
                });
            }
            total_rows += tensor.rows;
        }
        let mut data = Vec::with_capacity(total_rows * cols);
        for tensor in tensors {
            data.extend_from_slice(&tensor.data);
        }
        Tensor::from_vec(total_rows, cols, data)
    }

    /// Copies the row span `start..end` into a new tensor.
    pub fn slice_rows(&self, start: usize, end: usize) -> TensorResult<Tensor> {
        if start >= end || end > self.rows {
            return Err(TensorError::RowRange {
                start,
                end,
                rows: self.rows,
            });
        }
        let data = self.data[start * self.cols..end * self.cols].to_vec();
        Tensor::from_vec(end - start, self.cols, data)
    }

    /// Overwrites the rows starting at `at_row` with the contents of `source`.
    pub fn write_rows(&mut self, at_row: usize, source: &Tensor) -> TensorResult<()> {
        if source.cols != self.cols {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: source.shape(),
            });
        }
        let end = at_row + source.rows;
        if end > self.rows {
            return Err(TensorError::RowRange {
                start: at_row,
                end,
                rows: self.rows,
            });
        }
        self.data[at_row * self.cols..end * self.cols].copy_from_slice(&source.data);
        Ok(())
    }

    /// Row-wise softmax with max subtraction for numerical stability.
    pub fn row_softmax(&self) -> TensorResult<Tensor> {
        let mut data = Vec::with_capacity(self.len());
        for row in self.data.chunks(self.cols) {
            let max = row.iter().fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
            let mut denom = 0.0f64;
            for &v in row {
                denom += ((v - max) as f64).exp();
            }
            for &v in row {
                data.push((((v - max) as f64).exp() / denom) as f32);
            }
        }
        Tensor::from_vec(self.rows, self.cols, data)
    }

    /// Row-wise log-softmax: `x - max - ln(sum(exp(x - max)))`.
    pub fn row_log_softmax(&self) -> TensorResult<Tensor> {
        let mut data = Vec::with_capacity(self.len());
        for row in self.data.chunks(self.cols) {
            let max = row.iter().fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
            let mut denom = 0.0f64;
            for &v in row {
                denom += ((v - max) as f64).exp();
            }
            let log_denom = denom.ln() as f32;
            for &v in row {
                data.push(v - max - log_denom);
            }
        }
        Tensor::from_vec(self.rows, self.cols, data)
    }

    /// Computes the squared L2 norm of the tensor.
    pub fn squared_l2_norm(&self) -> f32 {
        self.data.iter().map(|v| v * v).sum()
    }
}
