//! Deterministic, pure logic shared by the build CLI and the cluster daemon.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod channel;
pub mod lifecycle;
pub mod naming;
pub mod resolver;
pub mod retry;
pub mod types;
