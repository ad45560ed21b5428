//! fs_usage process management
//!
//! Starts the accounting tool with its stdout piped back to us and stops it
//! with SIGINT so it flushes buffered lines before exiting.

use anyhow::{Context, Result};
use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};

use crate::constants::FS_USAGE_BIN;

/// Line-delimited accounting output
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Producer of the accounting stream for one run
pub trait AccountingSource: Send {
    /// Start producing lines for `target_pid`
    fn open(&mut self, target_pid: u32) -> Result<ByteStream>;

    /// Ask the producer to finish; the stream reaches EOF afterwards
    ///
    /// On error the stream may never end and the reader must stop on its own.
    fn close(&mut self) -> Result<()>;
}

/// Runs `fs_usage -w -f filesys,pathname`, via sudo unless disabled
#[derive(Debug, Default)]
pub struct FsUsageRunner {
    no_sudo: bool,
    all_processes: bool,
    child: Option<Child>,
}

impl FsUsageRunner {
    pub fn new(no_sudo: bool, all_processes: bool) -> Self {
        Self {
            no_sudo,
            all_processes,
            child: None,
        }
    }

    /// Full argv for tracing `target_pid`
    pub fn command_line(&self, target_pid: u32) -> Vec<String> {
        let mut argv: Vec<String> = Vec::new();
        if !self.no_sudo {
            argv.push("sudo".to_string());
        }
        argv.extend([FS_USAGE_BIN, "-w", "-f", "filesys,pathname"].map(String::from));
        // Tracing everything lets attribution follow children
        if !self.all_processes && target_pid > 0 {
            argv.push(target_pid.to_string());
        }
        argv
    }
}

impl AccountingSource for FsUsageRunner {
    fn open(&mut self, target_pid: u32) -> Result<ByteStream> {
        let argv = self.command_line(target_pid);
        debug!("fs_usage cmd: {}", argv.join(" "));

        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("Failed to start {}", argv.join(" ")))?;

        let stdout = child
            .stdout
            .take()
            .context("Failed to capture fs_usage stdout")?;
        self.child = Some(child);
        Ok(Box::new(stdout))
    }

    fn close(&mut self) -> Result<()> {
        // Dropping the handle leaves reaping to the tokio runtime
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let Some(id) = child.id() else {
            return Ok(());
        };
        match kill(Pid::from_raw(id as i32), Signal::SIGINT) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(err) => {
                warn!("failed to interrupt fs_usage ({}), killing it", err);
                child
                    .start_kill()
                    .with_context(|| format!("Failed to stop fs_usage after SIGINT failed ({})", err))
            }
        }
    }
}
