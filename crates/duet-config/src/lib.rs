//! Process-wide configuration for DuetTorch: tracing setup and deterministic
//! seeding shared by every crate in the workspace.

pub mod determinism;
pub mod tracing;
