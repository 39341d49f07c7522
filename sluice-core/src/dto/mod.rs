//! Data Transfer Objects
//!
//! This module contains the serialized shapes Sluice reads and writes:
//! the on-disk pipeline definition document and the commit-status request
//! body sent to the source-hosting provider.

pub mod definition;
pub mod status;
