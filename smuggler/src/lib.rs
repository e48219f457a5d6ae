//! Cluster image distribution and build resolution.
//!
//! The crate keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (rule resolution, image naming,
//!   channel layout, retry policy, daemon state machine). No I/O.
//! - **[`io`]**: Side-effecting adapters (config files, git, shell checks,
//!   container runtime, coordination store).
//!
//! Orchestration modules ([`broker`], [`dispatch`], [`daemon`], [`build`])
//! combine the two to implement the `smg` and `smgd` commands.

pub mod broker;
pub mod build;
pub mod core;
pub mod daemon;
pub mod dispatch;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
