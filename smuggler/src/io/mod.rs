//! Side-effecting adapters: configuration files, git, shell checks, the
//! container runtime and the coordination store.

pub mod config;
pub mod git;
pub mod manifest;
pub mod process;
pub mod runtime;
pub mod store;
