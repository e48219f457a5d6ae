//! Stable exit codes for `smg` and `smgd`.

/// Command succeeded.
pub const OK: i32 = 0;
/// Runtime, store or I/O failure.
pub const FAILED: i32 = 1;
/// No build rule matched the branch or the explicit tag.
pub const NO_MATCHING_RULE: i32 = 2;
/// Invalid configuration or manifest.
pub const CONFIG: i32 = 3;
/// The build was aborted by a failed `onlyif` check or a malformed image name.
pub const BUILD_ABORTED: i32 = 4;
