//! Data models module
//!
//! Defines core data structures:
//! - Event: one parsed filesystem access from the accounting stream
//! - Filters: immutable post-processing rules
//! - TraceOptions: fully resolved settings for one run
//! - OutputMode: which view the renderer produces

use std::path::PathBuf;
use time::OffsetDateTime;

/// One observed filesystem access
///
/// Events are never edited in place once parsed; rewrites such as depth
/// truncation go through [`Event::with_path`] and produce a new value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Wall-clock instant, `None` when the time-of-day token was unrecognized
    pub timestamp: Option<OffsetDateTime>,
    /// Original time-of-day token, used for display when `timestamp` is `None`
    pub raw_timestamp: String,
    /// Trailing id of the process descriptor; a PID or a thread handle
    pub process_id: u64,
    /// Short command name of the acting process or thread
    pub comm: String,
    /// Lower-cased operation mnemonic, passed through unchanged otherwise
    pub op: String,
    /// Accessed path, may contain embedded spaces
    pub path: String,
}

impl Event {
    /// Copy of this event with a different path
    pub fn with_path(&self, path: impl Into<String>) -> Event {
        Event {
            path: path.into(),
            ..self.clone()
        }
    }
}

/// Filter criteria applied to the collected events
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filters {
    /// Only keep events whose comm is listed (empty = keep all)
    pub allow_processes: Vec<String>,
    /// Drop events whose comm is listed
    pub ignore_processes: Vec<String>,
    /// Drop events whose (depth-truncated) path starts with any of these
    pub ignore_prefixes: Vec<String>,
    /// Truncate paths to this many components (0 = unlimited)
    pub max_depth: usize,
    /// Disable all filtering
    pub raw: bool,
}

/// Which rendering the run produces
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputMode {
    /// Deduplicated, sorted path list
    #[default]
    Paths,
    /// Every accepted event in arrival order
    Events,
    /// Separate read and write path sets
    SplitAccess,
    /// sandbox-exec allow rules built from the read/write sets
    SandboxSnippet,
}

/// Resolved configuration for a single traced run
#[derive(Debug, Clone, Default)]
pub struct TraceOptions {
    /// Selected view
    pub output: OutputMode,
    /// Emit JSON instead of text where the view supports it
    pub json: bool,
    /// Collapse paths to their parent directories
    pub dirs_only: bool,
    /// Post-processing rules
    pub filters: Filters,
    /// Run fs_usage without sudo
    pub no_sudo: bool,
    /// Skip process attribution entirely
    pub no_pid_filter: bool,
    /// Trace all processes and attribute descendants of the command
    pub follow_children: bool,
    /// Ignore accesses under the current working directory
    pub ignore_cwd: bool,
    /// Explicit TOML defaults file
    pub config_path: Option<PathBuf>,
    /// Command to trace followed by its arguments
    pub command: Vec<String>,
}

impl TraceOptions {
    /// Attribution only runs when fs_usage is broadened to all processes
    pub fn attribution_enabled(&self) -> bool {
        self.follow_children && !self.no_pid_filter
    }
}
