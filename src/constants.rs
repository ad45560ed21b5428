//! Global constants for fs-tracer
//!
//! Centralized location for thresholds, refresh cadences and exit codes

use std::time::Duration;

/// Binary name, also used for the config directory
pub const APP_NAME: &str = "fs-tracer";

/// Name of the external accounting tool
pub const FS_USAGE_BIN: &str = "fs_usage";

/// Any value enables debug logging of raw lines and parse failures
pub const DEBUG_ENV: &str = "FS_TRACER_DEBUG";

/// Checks with zero acceptances before attribution fails open
pub const ZERO_MATCH_BYPASS_THRESHOLD: usize = 50;

/// How often the descendant set of the traced command is refreshed
pub const CHILD_REFRESH_INTERVAL: Duration = Duration::from_millis(500);

/// How often every known process is re-probed for thread handles
pub const THREAD_REFRESH_INTERVAL: Duration = Duration::from_secs(2);

/// Capacity of the parse loop -> accumulator channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Exit code for invalid arguments or configuration
pub const EXIT_INVALID_ARGS: i32 = 90;

/// Exit code when the traced command (or sudo refresh) could not start
pub const EXIT_CMD_START: i32 = 91;

/// Exit code when fs_usage could not be started
pub const EXIT_FS_USAGE: i32 = 92;

/// Exit code for stream read or render failures
pub const EXIT_SCAN: i32 = 93;
