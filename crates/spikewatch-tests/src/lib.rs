//! End-to-end test suite for spikewatch.
//!
//! Drives the full detector cycle against in-memory and on-disk stores with
//! injected collaborator failures.

pub mod helpers;
