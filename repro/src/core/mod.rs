//! Deterministic, pure logic for reproducibility recording.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod classifier;
pub mod closure;
pub mod invariants;
pub mod provenance;
pub mod types;
