//! # spikewatch-core
//! Foundation types, errors, and collaborator traits for spikewatch.

pub mod constants;
pub mod error;
pub mod traits;
pub mod types;
