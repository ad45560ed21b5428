//! Process attribution
//!
//! Decides whether an fs_usage process id belongs to the traced command's
//! process tree. Three signals of decreasing strength are consulted in order:
//! - exact id match (the root, discovered descendants, corroborated thread handles)
//! - command name already seen among attributed processes
//! - the bypass latch, which accepts everything once attribution is unreliable
//!
//! One [`ProcessAttributor`] is built per run and shared through an `Arc`
//! between the parse loop (reads) and the periodic refreshers (writes).

pub mod procinfo;

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, warn};
use thiserror::Error;

use crate::constants::ZERO_MATCH_BYPASS_THRESHOLD;

/// Finds every descendant of a root process
pub trait ChildDiscoverer: Send + Sync {
    fn descendants(&self, root: u32) -> anyhow::Result<Vec<u32>>;
}

/// Lists the thread handles fs_usage may print instead of a PID
pub trait ThreadLister: Send + Sync {
    fn list_threads(&self, pid: u32) -> Result<Vec<u64>, ThreadListError>;
}

/// Best-effort command name lookup
pub trait CommResolver: Send + Sync {
    fn resolve_comm(&self, pid: u32) -> Option<String>;
}

impl<F> ChildDiscoverer for F
where
    F: Fn(u32) -> anyhow::Result<Vec<u32>> + Send + Sync,
{
    fn descendants(&self, root: u32) -> anyhow::Result<Vec<u32>> {
        self(root)
    }
}

impl<F> ThreadLister for F
where
    F: Fn(u32) -> Result<Vec<u64>, ThreadListError> + Send + Sync,
{
    fn list_threads(&self, pid: u32) -> Result<Vec<u64>, ThreadListError> {
        self(pid)
    }
}

impl<F> CommResolver for F
where
    F: Fn(u32) -> Option<String> + Send + Sync,
{
    fn resolve_comm(&self, pid: u32) -> Option<String> {
        self(pid)
    }
}

/// Failure classes reported by a [`ThreadLister`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ThreadListError {
    /// Permission or protection failure; attribution cannot be trusted
    #[error("thread lookup for pid {pid} denied: {reason}")]
    Denied { pid: u32, reason: String },
    /// No such process or invalid argument; the process already exited
    #[error("pid {pid} no longer exists")]
    Gone { pid: u32 },
    /// Anything else
    #[error("thread lookup for pid {pid} failed: {reason}")]
    Other { pid: u32, reason: String },
}

/// Attribution state machine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mode {
    #[default]
    Tracking,
    /// Terminal: every id is accepted for the rest of the run
    Bypass,
}

/// Why attribution gave up and failed open
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BypassReason {
    ThreadLookupDenied(String),
    ThreadLookupFailed(String),
    ZeroMatchStreak(usize),
}

impl fmt::Display for BypassReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BypassReason::ThreadLookupDenied(detail) => {
                write!(f, "thread lookup blocked (permission/protection): {}", detail)
            }
            BypassReason::ThreadLookupFailed(detail) => {
                write!(f, "thread lookup failure: {}", detail)
            }
            BypassReason::ZeroMatchStreak(checked) => {
                write!(f, "no event matched after {} checks", checked)
            }
        }
    }
}

/// Outcome of checking one event against the attribution signals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Bypass,
    KnownId,
    KnownComm,
    Rejected,
}

impl Verdict {
    pub fn is_accepted(self) -> bool {
        !matches!(self, Verdict::Rejected)
    }
}

/// Mutable per-run attribution sets
///
/// `allowed_ids` only grows and `mode` only moves from Tracking to Bypass.
#[derive(Debug, Clone, Default)]
pub struct AttributionState {
    mode: Mode,
    allowed_ids: HashSet<u64>,
    allowed_comms: HashSet<String>,
    known_pids: BTreeSet<u32>,
}

impl AttributionState {
    fn rooted_at(root: u32) -> Self {
        let mut state = Self::default();
        state.allowed_ids.insert(u64::from(root));
        state.known_pids.insert(root);
        state
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn allowed_ids(&self) -> &HashSet<u64> {
        &self.allowed_ids
    }

    pub fn allowed_comms(&self) -> &HashSet<String> {
        &self.allowed_comms
    }

    /// Real process ids (root and discovered descendants) that get re-probed
    pub fn known_pids(&self) -> &BTreeSet<u32> {
        &self.known_pids
    }

    fn verdict(&self, id: u64, comm: &str) -> Verdict {
        if self.mode == Mode::Bypass {
            Verdict::Bypass
        } else if self.allowed_ids.contains(&id) {
            Verdict::KnownId
        } else if self.allowed_comms.contains(comm) {
            Verdict::KnownComm
        } else {
            Verdict::Rejected
        }
    }

    /// Returns true only on the Tracking -> Bypass transition
    fn latch_bypass(&mut self) -> bool {
        if self.mode == Mode::Bypass {
            return false;
        }
        self.mode = Mode::Bypass;
        true
    }
}

/// Attributes fs_usage ids to a root process and its descendants
pub struct ProcessAttributor {
    root: u32,
    state: RwLock<AttributionState>,
    children: Arc<dyn ChildDiscoverer>,
    threads: Arc<dyn ThreadLister>,
    comms: Arc<dyn CommResolver>,
}

impl ProcessAttributor {
    pub fn new(
        root: u32,
        children: Arc<dyn ChildDiscoverer>,
        threads: Arc<dyn ThreadLister>,
        comms: Arc<dyn CommResolver>,
    ) -> Self {
        Self {
            root,
            state: RwLock::new(AttributionState::rooted_at(root)),
            children,
            threads,
            comms,
        }
    }

    pub fn root(&self) -> u32 {
        self.root
    }

    /// Mark a command name as ours before any probe has corroborated it
    pub fn seed_comm(&self, comm: &str) {
        let name = base_name(comm);
        if !name.is_empty() {
            self.write().allowed_comms.insert(name.to_string());
        }
    }

    /// Exact id check; always true once in Bypass
    pub fn is_allowed(&self, id: u64) -> bool {
        let state = self.read();
        state.mode == Mode::Bypass || state.allowed_ids.contains(&id)
    }

    pub fn is_known_comm(&self, comm: &str) -> bool {
        self.read().allowed_comms.contains(comm)
    }

    /// Evaluate every signal for one event under a single read lock
    pub fn check(&self, id: u64, comm: &str) -> Verdict {
        self.read().verdict(id, comm)
    }

    pub fn mode(&self) -> Mode {
        self.read().mode
    }

    /// Copy of the current sets
    pub fn snapshot(&self) -> AttributionState {
        self.read().clone()
    }

    /// Fail open for the rest of the run. Returns true if this call flipped the latch.
    pub fn enter_bypass(&self, reason: BypassReason) -> bool {
        let changed = self.write().latch_bypass();
        if changed {
            warn!("pid filter switched to allow-all: {}", reason);
        }
        changed
    }

    /// Initial probe of the root followed by a first descendant scan
    pub fn prime(&self) {
        self.probe(self.root);
        self.refresh_children();
    }

    /// Attribute newly spawned descendants of the root
    pub fn refresh_children(&self) {
        if self.mode() == Mode::Bypass {
            return;
        }
        let discovered = match self.children.descendants(self.root) {
            Ok(pids) => pids,
            Err(err) => {
                debug!("child discovery for pid {} failed: {:#}", self.root, err);
                return;
            }
        };

        let fresh: Vec<u32> = {
            let mut state = self.write();
            discovered
                .into_iter()
                .filter(|pid| state.known_pids.insert(*pid))
                .collect()
        };

        for pid in fresh {
            debug!("following child pid {}", pid);
            self.probe(pid);
        }
    }

    /// Re-probe every known process for new thread handles
    pub fn refresh_threads(&self) {
        if self.mode() == Mode::Bypass {
            return;
        }
        let pids: Vec<u32> = self.read().known_pids.iter().copied().collect();
        for pid in pids {
            self.probe(pid);
        }
    }

    /// Allow `pid` and, when its command name is corroborated, its thread handles.
    ///
    /// The external lookups run without holding the lock.
    pub fn probe(&self, pid: u32) {
        self.write().allowed_ids.insert(u64::from(pid));

        let handles = match self.threads.list_threads(pid) {
            Ok(handles) => handles,
            Err(ThreadListError::Gone { .. }) => {
                debug!("pid {} exited before thread lookup", pid);
                return;
            }
            Err(err @ ThreadListError::Denied { .. }) => {
                self.enter_bypass(BypassReason::ThreadLookupDenied(err.to_string()));
                return;
            }
            Err(err) => {
                self.enter_bypass(BypassReason::ThreadLookupFailed(err.to_string()));
                return;
            }
        };

        let Some(comm) = self.comms.resolve_comm(pid) else {
            return;
        };
        let comm = base_name(&comm);
        if comm.is_empty() || handles.is_empty() {
            return;
        }

        let mut state = self.write();
        // Only a name seen before this probe vouches for the handles
        let corroborated = state.allowed_comms.contains(comm);
        state.allowed_comms.insert(comm.to_string());
        if corroborated {
            state.allowed_ids.extend(handles);
        } else {
            debug!("ignoring {} thread handles of pid {} ({}): comm not yet corroborated",
                handles.len(), pid, comm);
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, AttributionState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, AttributionState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Counts attribution checks until the first acceptance
///
/// Once `threshold` checks have passed with nothing accepted, attribution is
/// assumed to be systematically missing and the caller should bypass it.
#[derive(Debug, Clone)]
pub struct ZeroMatchGuard {
    threshold: usize,
    checked: usize,
    accepted: usize,
}

impl ZeroMatchGuard {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            checked: 0,
            accepted: 0,
        }
    }

    /// Record one check. Returns true when the zero-match streak reached the threshold.
    pub fn record(&mut self, accepted: bool) -> bool {
        self.checked += 1;
        if accepted {
            self.accepted += 1;
        }
        self.accepted == 0 && self.checked >= self.threshold
    }

    pub fn checked(&self) -> usize {
        self.checked
    }

    pub fn accepted(&self) -> usize {
        self.accepted
    }
}

impl Default for ZeroMatchGuard {
    fn default() -> Self {
        Self::new(ZERO_MATCH_BYPASS_THRESHOLD)
    }
}

/// Last path component of a command name (`/usr/bin/ruby` -> `ruby`)
pub fn base_name(comm: &str) -> &str {
    comm.rsplit('/').next().unwrap_or(comm)
}
