//! Exit codes for the quantbench CLI.
//!
//! Codes are coarse and stable for scripting: success only when at least
//! the requested work is stored, cancellation is distinguishable from
//! failure so wrappers can resume.

/// Run finished; results are stored.
pub const SUCCESS: i32 = 0;

/// Hard failure: configuration, connectivity, or server state.
pub const ERROR: i32 = 1;

/// Confirmed user cancellation; partial results were preserved.
pub const CANCELLED: i32 = 2;
