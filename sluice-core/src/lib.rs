//! Sluice Core
//!
//! Core types and abstractions for the Sluice CI orchestrator.
//!
//! This crate contains:
//! - Domain types: Core business entities (PipelineDefinition, Run, TriggerEvent, etc.)
//! - DTOs: On-disk definition format and commit-status wire bodies

pub mod domain;
pub mod dto;
