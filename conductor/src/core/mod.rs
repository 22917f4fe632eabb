//! Deterministic, pure logic shared by the engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod classifier;
pub mod invariants;
pub mod observation;
pub mod plan_number;
pub mod records;
pub mod recovery;
pub mod repair;
pub mod schedule;
pub mod sentinel;
pub mod stream;
pub mod types;
pub mod validation;
