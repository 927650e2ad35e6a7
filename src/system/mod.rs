//! Host requirements validation.
//!
//! This module checks that the container runtime tools the orchestrator
//! drives are installed before any lifecycle operation runs.

mod requirements;

pub use requirements::{RuntimeRequirements, check_all, check_runtime, find_program};
