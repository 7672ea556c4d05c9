// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of DuetTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Pure Rust dense tensor primitives for the DuetTorch objectives.
//!
//! Everything here is written in safe Rust with no native bindings; the
//! surface is intentionally limited to the row-major 2-D operations the
//! alignment losses actually exercise.

mod dense;

pub use dense::{Tensor, TensorError, TensorResult};
