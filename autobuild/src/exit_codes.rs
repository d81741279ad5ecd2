//! Stable exit codes for autobuild CLI commands.

/// Command succeeded or the goals were accomplished.
pub const OK: i32 = 0;
/// Invalid config/arguments or any other error.
pub const INVALID: i32 = 1;
/// `autobuild run` used up `max_cycles`.
pub const CYCLES_EXHAUSTED: i32 = 2;
/// The shell session died and could not be re-established.
pub const SESSION_LOST: i32 = 3;
/// The oracle kept replying with unparseable text.
pub const ORACLE_UNPARSEABLE: i32 = 4;
