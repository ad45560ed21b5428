//! Default attribution collaborators backed by the live process table
//!
//! - [`SystemProcesses`]: descendant discovery and comm lookup via sysinfo
//! - [`PsProcessTable`]: the same walk over `ps -Ao pid,ppid` output, used
//!   when sysinfo reports no processes
//! - [`NativeThreadLister`]: thread handles via `proc_pidinfo` on macOS,
//!   `/proc/<pid>/task` on Linux

use std::collections::{HashMap, HashSet, VecDeque};
use std::process::Command;
use std::sync::{Mutex, PoisonError};

use anyhow::{bail, Context, Result};
use log::debug;
use nix::errno::Errno;
use sysinfo::{Pid, ProcessesToUpdate, System};

use super::{ChildDiscoverer, CommResolver, ThreadListError, ThreadLister};

/// Process table snapshots shared by child discovery and comm lookup
pub struct SystemProcesses {
    system: Mutex<System>,
    fallback: PsProcessTable,
}

impl SystemProcesses {
    pub fn new() -> Self {
        Self::with_fallback(PsProcessTable::new())
    }

    pub fn with_fallback(fallback: PsProcessTable) -> Self {
        Self {
            system: Mutex::new(System::new()),
            fallback,
        }
    }

    fn descendants_or_fallback(&self, root: u32, parents: &HashMap<u32, u32>) -> Result<Vec<u32>> {
        if parents.is_empty() {
            debug!("process table snapshot is empty, asking {}", self.fallback.program);
            return self.fallback.descendants(root);
        }
        Ok(collect_descendants(root, parents))
    }
}

impl Default for SystemProcesses {
    fn default() -> Self {
        Self::new()
    }
}

impl ChildDiscoverer for SystemProcesses {
    fn descendants(&self, root: u32) -> Result<Vec<u32>> {
        let parents: HashMap<u32, u32> = {
            let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
            system.refresh_processes(ProcessesToUpdate::All, true);
            system
                .processes()
                .iter()
                .filter_map(|(pid, process)| process.parent().map(|ppid| (pid.as_u32(), ppid.as_u32())))
                .collect()
        };

        self.descendants_or_fallback(root, &parents)
    }
}

/// Child discovery by running `ps -Ao pid,ppid`
#[derive(Debug, Clone)]
pub struct PsProcessTable {
    program: String,
    args: Vec<String>,
}

impl PsProcessTable {
    pub fn new() -> Self {
        Self::with_command("ps", ["-Ao", "pid,ppid"])
    }

    /// Any command whose stdout has `pid ppid` pairs on each line
    pub fn with_command<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for PsProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ChildDiscoverer for PsProcessTable {
    fn descendants(&self, root: u32) -> Result<Vec<u32>> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .output()
            .with_context(|| format!("Failed to run {}", self.program))?;
        if !output.status.success() {
            bail!("{} exited with {}", self.program, output.status);
        }
        Ok(parse_descendants(root, &String::from_utf8_lossy(&output.stdout)))
    }
}

impl CommResolver for SystemProcesses {
    fn resolve_comm(&self, pid: u32) -> Option<String> {
        let pid = Pid::from_u32(pid);
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system
            .process(pid)
            .map(|process| process.name().to_string_lossy().into_owned())
    }
}

/// Breadth-first walk of a `pid -> ppid` table starting below `root`
pub fn collect_descendants(root: u32, parents: &HashMap<u32, u32>) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (&pid, &ppid) in parents {
        if pid != ppid {
            children.entry(ppid).or_default().push(pid);
        }
    }

    let mut seen = HashSet::from([root]);
    let mut out = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(current) = queue.pop_front() {
        let Some(kids) = children.get(&current) else {
            continue;
        };
        for &kid in kids {
            if seen.insert(kid) {
                out.push(kid);
                queue.push_back(kid);
            }
        }
    }
    out
}

/// Descendants of `root` from `ps -Ao pid,ppid` output
///
/// Lines that do not start with two integers (the header included) are skipped.
pub fn parse_descendants(root: u32, ps_output: &str) -> Vec<u32> {
    let parents: HashMap<u32, u32> = ps_output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let pid = fields.next()?.parse().ok()?;
            let ppid = fields.next()?.parse().ok()?;
            Some((pid, ppid))
        })
        .collect();
    collect_descendants(root, &parents)
}

/// Map an OS error from a thread lookup onto the attribution failure classes
pub fn classify_errno(pid: u32, errno: Errno) -> ThreadListError {
    match errno {
        Errno::EPERM | Errno::EACCES => ThreadListError::Denied {
            pid,
            reason: errno.desc().to_string(),
        },
        Errno::ESRCH | Errno::EINVAL | Errno::ENOENT => ThreadListError::Gone { pid },
        other => ThreadListError::Other {
            pid,
            reason: other.desc().to_string(),
        },
    }
}

/// Platform thread enumeration
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeThreadLister;

impl ThreadLister for NativeThreadLister {
    fn list_threads(&self, pid: u32) -> Result<Vec<u64>, ThreadListError> {
        platform::list_thread_handles(pid)
    }
}

#[cfg(target_os = "macos")]
#[allow(unsafe_code)]
mod platform {
    use super::{classify_errno, ThreadListError};
    use nix::errno::Errno;

    // <sys/proc_info.h>
    const PROC_PIDLISTTHREADS: libc::c_int = 6;
    const INITIAL_CAPACITY: usize = 256;
    const MAX_CAPACITY: usize = 1 << 16;

    /// Thread handles as fs_usage prints them in the process descriptor
    pub(super) fn list_thread_handles(pid: u32) -> Result<Vec<u64>, ThreadListError> {
        let handle_size = std::mem::size_of::<u64>();
        let mut capacity = INITIAL_CAPACITY;
        loop {
            let mut handles = vec![0u64; capacity];
            let buffer_size = (capacity * handle_size) as libc::c_int;
            // SAFETY: `handles` is a live allocation of exactly `buffer_size` bytes
            let written = unsafe {
                libc::proc_pidinfo(
                    pid as libc::c_int,
                    PROC_PIDLISTTHREADS,
                    0,
                    handles.as_mut_ptr().cast(),
                    buffer_size,
                )
            };
            if written <= 0 {
                return Err(classify_errno(pid, Errno::last()));
            }
            let written = written as usize;
            if written >= capacity * handle_size && capacity < MAX_CAPACITY {
                capacity *= 2;
                continue;
            }
            handles.truncate(written / handle_size);
            return Ok(handles);
        }
    }
}

#[cfg(target_os = "linux")]
mod platform {
    use super::{classify_errno, ThreadListError};
    use nix::errno::Errno;

    pub(super) fn list_thread_handles(pid: u32) -> Result<Vec<u64>, ThreadListError> {
        let entries = std::fs::read_dir(format!("/proc/{}/task", pid)).map_err(|err| match err.raw_os_error() {
            Some(code) => classify_errno(pid, Errno::from_i32(code)),
            None => ThreadListError::Other {
                pid,
                reason: err.to_string(),
            },
        })?;

        Ok(entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str().and_then(|name| name.parse().ok()))
            .collect())
    }
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
mod platform {
    use super::ThreadListError;

    pub(super) fn list_thread_handles(pid: u32) -> Result<Vec<u64>, ThreadListError> {
        Err(ThreadListError::Other {
            pid,
            reason: "thread enumeration is not supported on this platform".to_string(),
        })
    }
}
