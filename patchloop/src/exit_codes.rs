//! Stable exit codes for the `patchloop` CLI.

/// Run finished with `done{ok:true}`, or the command succeeded.
pub const OK: i32 = 0;
/// Fatal error: the run emitted `error`, or the CLI itself failed.
pub const ERROR: i32 = 1;
/// Run finished with `done{ok:false}`: commands still failing after the critic loop.
pub const FAILED: i32 = 2;
/// `check-diff` rejected the diff.
pub const REJECTED: i32 = 3;
