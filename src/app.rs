//! Run orchestration
//!
//! Refreshes sudo, starts the traced command in its own process group, wires
//! fs_usage through the pipeline while the command runs, then filters and
//! renders what was collected. The traced command's exit status becomes ours.

use std::io::Write;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, error, warn};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{Pid, Uid};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::process::{Child, Command};

use crate::attribution::procinfo::{NativeThreadLister, SystemProcesses};
use crate::attribution::{ChildDiscoverer, CommResolver, ProcessAttributor, ThreadLister};
use crate::constants::{EXIT_CMD_START, EXIT_FS_USAGE, EXIT_INVALID_ARGS, EXIT_SCAN};
use crate::filter::{apply_filters, expand_ignore_prefixes};
use crate::fsusage::local_reference_date;
use crate::fsusage::runner::{AccountingSource, FsUsageRunner};
use crate::models::TraceOptions;
use crate::output::render;
use crate::pipeline::{spawn_refreshers, AttributionGate, Drain, PipelineError, Refreshers};

/// Whose credentials the traced command runs with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialPolicy {
    /// When running as root, drop to `SUDO_UID`/`SUDO_GID`
    FromSudoEnv,
    /// Keep the current user
    Inherit,
}

/// External dependencies of a run
pub struct Collaborators {
    pub source: Box<dyn AccountingSource>,
    pub children: Arc<dyn ChildDiscoverer>,
    pub threads: Arc<dyn ThreadLister>,
    pub comms: Arc<dyn CommResolver>,
    /// Date given to parsed time-of-day tokens
    pub reference_date: OffsetDateTime,
    pub credentials: CredentialPolicy,
}

impl Collaborators {
    /// Live fs_usage, process table and thread enumeration
    pub fn system(options: &TraceOptions) -> Self {
        let processes = Arc::new(SystemProcesses::new());
        Self {
            source: Box::new(FsUsageRunner::new(options.no_sudo, options.follow_children)),
            children: processes.clone(),
            threads: Arc::new(NativeThreadLister),
            comms: processes,
            reference_date: local_reference_date(),
            credentials: CredentialPolicy::FromSudoEnv,
        }
    }
}

#[derive(Error, Debug)]
pub enum RunError {
    #[error("invalid command: {0:#}")]
    InvalidCommand(anyhow::Error),

    #[error("failed to refresh sudo timestamp: {0:#}")]
    Sudo(anyhow::Error),

    #[error("failed to start yourcmd: {0:#}")]
    CommandStart(anyhow::Error),

    #[error("failed to start fs_usage: {0:#}")]
    FsUsage(anyhow::Error),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("output error: {0:#}")]
    Render(anyhow::Error),
}

impl RunError {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::InvalidCommand(_) => EXIT_INVALID_ARGS,
            RunError::Sudo(_) | RunError::CommandStart(_) => EXIT_CMD_START,
            RunError::FsUsage(_) => EXIT_FS_USAGE,
            RunError::Pipeline(_) | RunError::Render(_) => EXIT_SCAN,
        }
    }
}

/// Trace with the live system collaborators, rendering to stdout
pub async fn run_with_system(options: &TraceOptions) -> i32 {
    let mut stdout = std::io::stdout();
    run(options, Collaborators::system(options), &mut stdout).await
}

/// Trace one command and return the process exit code
pub async fn run(
    options: &TraceOptions,
    collaborators: Collaborators,
    out: &mut (dyn Write + Send),
) -> i32 {
    match trace(options, collaborators, out).await {
        Ok(code) => code,
        Err(err) => {
            error!("{}", err);
            err.exit_code()
        }
    }
}

async fn trace(
    options: &TraceOptions,
    collaborators: Collaborators,
    out: &mut (dyn Write + Send),
) -> Result<i32, RunError> {
    let Collaborators {
        mut source,
        children,
        threads,
        comms,
        reference_date,
        credentials,
    } = collaborators;

    if !options.no_sudo {
        ensure_sudo().await.map_err(RunError::Sudo)?;
    }

    let mut command =
        traced_command(&options.command, credentials).map_err(RunError::InvalidCommand)?;
    let mut child = command
        .spawn()
        .with_context(|| format!("Failed to spawn {}", options.command.join(" ")))
        .map_err(RunError::CommandStart)?;
    let root = child
        .id()
        .ok_or_else(|| RunError::CommandStart(anyhow!("yourcmd exited before tracing started")))?;
    debug!("traced command started with pid {}", root);

    let attribution = if options.attribution_enabled() {
        Some(start_attribution(root, &options.command[0], children, threads, comms).await)
    } else {
        None
    };

    let stream = match source.open(root) {
        Ok(stream) => stream,
        Err(err) => {
            if let Some((_, refreshers)) = attribution {
                refreshers.stop().await;
            }
            let _ = child.start_kill();
            return Err(RunError::FsUsage(err));
        }
    };

    let gate = attribution
        .as_ref()
        .map(|(attributor, _)| AttributionGate::new(Arc::clone(attributor)));
    let drain = Drain::start(stream, reference_date, gate);

    let waited = wait_for_command(&mut child).await;
    let drained = match source.close() {
        Ok(()) => drain.finish().await,
        Err(err) => {
            warn!("{:#}; keeping events read so far", err);
            drain.abandon().await
        }
    };
    if let Some((_, refreshers)) = attribution {
        refreshers.stop().await;
    }

    let status = waited
        .context("Failed to wait for yourcmd")
        .map_err(RunError::CommandStart)?;
    let collected = drained?;

    let cwd = if options.ignore_cwd {
        std::env::current_dir()
            .ok()
            .map(|dir| dir.to_string_lossy().into_owned())
    } else {
        None
    };
    let mut filters = options.filters.clone();
    filters.ignore_prefixes = expand_ignore_prefixes(&filters.ignore_prefixes, cwd.as_deref());

    let filtered = apply_filters(&collected.events, &filters);
    if filtered.is_empty() {
        debug!("no events after filtering");
    }
    render(out, options, &filtered).map_err(RunError::Render)?;

    Ok(exit_code(status))
}

/// Seed, prime and start refreshing attribution for `root`
async fn start_attribution(
    root: u32,
    program: &str,
    children: Arc<dyn ChildDiscoverer>,
    threads: Arc<dyn ThreadLister>,
    comms: Arc<dyn CommResolver>,
) -> (Arc<ProcessAttributor>, Refreshers) {
    let attributor = Arc::new(ProcessAttributor::new(root, children, threads, comms));
    attributor.seed_comm(program);

    let primer = Arc::clone(&attributor);
    if let Err(err) = tokio::task::spawn_blocking(move || primer.prime()).await {
        warn!("initial attribution probe failed: {}", err);
    }

    let refreshers = spawn_refreshers(Arc::clone(&attributor));
    (attributor, refreshers)
}

fn traced_command(argv: &[String], credentials: CredentialPolicy) -> Result<Command> {
    let (program, args) = argv.split_first().context("no command specified")?;

    let mut command = Command::new(program);
    command
        .args(args)
        .process_group(0)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    if credentials == CredentialPolicy::FromSudoEnv && Uid::effective().is_root() {
        let uid = std::env::var("SUDO_UID").ok();
        let gid = std::env::var("SUDO_GID").ok();
        let (uid, gid) = sudo_ids(uid.as_deref(), gid.as_deref())?;
        debug!("dropping traced command to uid {} gid {}", uid, gid);
        command.uid(uid).gid(gid);
    }

    Ok(command)
}

/// Parse the invoking user's ids as exported by sudo
pub fn sudo_ids(uid: Option<&str>, gid: Option<&str>) -> Result<(u32, u32)> {
    match (uid, gid) {
        (Some(uid), Some(gid)) if !uid.is_empty() && !gid.is_empty() => {
            let uid = uid.parse().with_context(|| format!("invalid SUDO_UID: {}", uid))?;
            let gid = gid.parse().with_context(|| format!("invalid SUDO_GID: {}", gid))?;
            Ok((uid, gid))
        }
        _ => bail!(
            "running as root is unsupported without SUDO_UID/SUDO_GID; yourcmd must run as the original user"
        ),
    }
}

async fn ensure_sudo() -> Result<()> {
    if Uid::effective().is_root() {
        return Ok(());
    }
    let status = Command::new("sudo")
        .arg("-v")
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await
        .context("Failed to run sudo -v")?;
    if !status.success() {
        bail!("sudo -v exited with {}", status);
    }
    Ok(())
}

/// Wait for the traced command, forwarding Ctrl-C to its process group
async fn wait_for_command(child: &mut Child) -> std::io::Result<ExitStatus> {
    loop {
        tokio::select! {
            status = child.wait() => return status,
            signal = tokio::signal::ctrl_c() => {
                if signal.is_err() {
                    return child.wait().await;
                }
                if let Some(pid) = child.id() {
                    debug!("forwarding SIGINT to process group {}", pid);
                    if let Err(err) = killpg(Pid::from_raw(pid as i32), Signal::SIGINT) {
                        warn!("failed to forward SIGINT: {}", err);
                    }
                }
            }
        }
    }
}

/// Exit code of the traced command, `128 + signal` when it was killed
pub fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(EXIT_CMD_START)
}
