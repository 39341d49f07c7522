//! Core domain types
//!
//! This module contains the core domain structures used across Sluice crates.
//! Definitions are immutable once loaded; runs are owned and mutated by the
//! scheduler and the pipeline runner only.

pub mod event;
pub mod log;
pub mod pipeline;
pub mod run;
pub mod status;
