//! Pipeline driver
//!
//! Wires the fs_usage byte stream through the line parser and the attribution
//! gate into a collector task, and runs the periodic attribution refreshers
//! next to it. The parse loop is the only producer of accepted events.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;

use crate::attribution::{BypassReason, ProcessAttributor, ZeroMatchGuard};
use crate::constants::{CHILD_REFRESH_INTERVAL, EVENT_CHANNEL_CAPACITY, THREAD_REFRESH_INTERVAL};
use crate::fsusage::parse_line;
use crate::models::Event;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("fs_usage read error: {0}")]
    Read(#[source] io::Error),

    #[error("pipeline task failed: {0}")]
    Join(#[from] JoinError),
}

/// Counters from one pass over the stream
#[derive(Debug, Default)]
pub struct LoopStats {
    pub lines: usize,
    pub parsed: usize,
    pub accepted: usize,
    pub read_error: Option<io::Error>,
    /// The loop was told to stop before the stream ended
    pub stopped: bool,
}

/// Parse loop side of attribution: per-event verdicts plus the zero-match fallback
pub struct AttributionGate {
    attributor: Arc<ProcessAttributor>,
    guard: ZeroMatchGuard,
}

impl AttributionGate {
    pub fn new(attributor: Arc<ProcessAttributor>) -> Self {
        Self::with_guard(attributor, ZeroMatchGuard::default())
    }

    pub fn with_guard(attributor: Arc<ProcessAttributor>, guard: ZeroMatchGuard) -> Self {
        Self { attributor, guard }
    }

    /// Decide whether `event` belongs to the traced process tree
    pub fn admit(&mut self, event: &Event) -> bool {
        let accepted = self.attributor.check(event.process_id, &event.comm).is_accepted();
        if self.guard.record(accepted) {
            self.attributor
                .enter_bypass(BypassReason::ZeroMatchStreak(self.guard.checked()));
            return true;
        }
        accepted
    }

    pub fn guard(&self) -> &ZeroMatchGuard {
        &self.guard
    }
}

/// Read lines until end of stream, forwarding accepted events to `tx`
///
/// Unparseable lines are skipped. A read error ends the loop and is kept in
/// the returned stats for the caller to classify.
pub async fn parse_stream<R>(
    reader: R,
    reference: OffsetDateTime,
    gate: Option<AttributionGate>,
    tx: mpsc::Sender<Event>,
) -> LoopStats
where
    R: AsyncRead + Unpin,
{
    let (_stop_tx, stop_rx) = watch::channel(false);
    parse_stream_until(reader, reference, gate, tx, stop_rx).await
}

/// [`parse_stream`] that also returns as soon as `stop` flips to true
pub async fn parse_stream_until<R>(
    reader: R,
    reference: OffsetDateTime,
    mut gate: Option<AttributionGate>,
    tx: mpsc::Sender<Event>,
    mut stop: watch::Receiver<bool>,
) -> LoopStats
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut stats = LoopStats::default();

    loop {
        buf.clear();
        let read = tokio::select! {
            read = reader.read_until(b'\n', &mut buf) => read,
            Ok(()) = stop.changed() => {
                stats.stopped = true;
                break;
            }
        };
        match read {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                stats.read_error = Some(err);
                break;
            }
        }
        stats.lines += 1;

        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\n', '\r']);
        debug!("fs_usage: {}", line);

        let event = match parse_line(line, reference) {
            Ok(event) => event,
            Err(err) => {
                debug!("skipping line ({}): {}", err, line);
                continue;
            }
        };
        stats.parsed += 1;

        if let Some(gate) = gate.as_mut() {
            if !gate.admit(&event) {
                continue;
            }
        }
        stats.accepted += 1;

        if tx.send(event).await.is_err() {
            warn!("event collector went away, stopping parse loop");
            break;
        }
    }

    debug!(
        "parse loop done: {} lines, {} parsed, {} accepted{}",
        stats.lines,
        stats.parsed,
        stats.accepted,
        if stats.stopped { ", stopped before end of stream" } else { "" }
    );
    stats
}

/// Accumulate events in arrival order until every sender is dropped
pub fn spawn_collector(mut rx: mpsc::Receiver<Event>) -> JoinHandle<Vec<Event>> {
    tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    })
}

/// Events and counters from a finished drain
#[derive(Debug)]
pub struct Collected {
    pub events: Vec<Event>,
    pub stats: LoopStats,
}

/// Running parse loop and collector for one stream
pub struct Drain {
    parse: JoinHandle<LoopStats>,
    collect: JoinHandle<Vec<Event>>,
    stop: watch::Sender<bool>,
}

impl Drain {
    pub fn start<R>(reader: R, reference: OffsetDateTime, gate: Option<AttributionGate>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (stop, stop_rx) = watch::channel(false);
        let collect = spawn_collector(rx);
        let parse = tokio::spawn(parse_stream_until(reader, reference, gate, tx, stop_rx));
        Self { parse, collect, stop }
    }

    /// Stop reading without waiting for end of stream
    ///
    /// For streams whose producer could not be shut down. Events accepted so
    /// far are kept.
    pub async fn abandon(self) -> Result<Collected, PipelineError> {
        // The loop may already have ended on its own
        let _ = self.stop.send(true);
        self.finish().await
    }

    /// Wait for end of stream and the collector to drain
    ///
    /// Read errors caused by the stream being closed during shutdown are
    /// logged and dropped; anything else is returned.
    pub async fn finish(self) -> Result<Collected, PipelineError> {
        let mut stats = self.parse.await?;
        let events = self.collect.await?;

        if let Some(err) = stats.read_error.take() {
            if !is_benign_close(&err) {
                return Err(PipelineError::Read(err));
            }
            debug!("ignoring read error after close: {}", err);
        }

        Ok(Collected { events, stats })
    }
}

/// Drive a whole stream to completion
pub async fn collect_events<R>(
    reader: R,
    reference: OffsetDateTime,
    gate: Option<AttributionGate>,
) -> Result<Collected, PipelineError>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    Drain::start(reader, reference, gate).finish().await
}

/// Read errors expected when fs_usage is stopped under an active reader
pub fn is_benign_close(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof
    ) || err.to_string().contains("closed")
}

/// Periodic child discovery and thread refresh tasks
pub struct Refreshers {
    stop: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Refreshers {
    /// Signal both refreshers and wait for them to exit
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        for handle in self.handles {
            if let Err(err) = handle.await {
                warn!("refresher task failed: {}", err);
            }
        }
    }
}

pub fn spawn_refreshers(attributor: Arc<ProcessAttributor>) -> Refreshers {
    spawn_refreshers_with(attributor, CHILD_REFRESH_INTERVAL, THREAD_REFRESH_INTERVAL)
}

pub fn spawn_refreshers_with(
    attributor: Arc<ProcessAttributor>,
    child_every: Duration,
    thread_every: Duration,
) -> Refreshers {
    let (stop, stop_rx) = watch::channel(false);
    let handles = vec![
        spawn_refresher(
            "child",
            Arc::clone(&attributor),
            child_every,
            stop_rx.clone(),
            ProcessAttributor::refresh_children,
        ),
        spawn_refresher(
            "thread",
            attributor,
            thread_every,
            stop_rx,
            ProcessAttributor::refresh_threads,
        ),
    ];
    Refreshers { stop, handles }
}

fn spawn_refresher(
    name: &'static str,
    attributor: Arc<ProcessAttributor>,
    every: Duration,
    mut stop: watch::Receiver<bool>,
    work: fn(&ProcessAttributor),
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately; prime() already covered it
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let attributor = Arc::clone(&attributor);
                    if let Err(err) = tokio::task::spawn_blocking(move || work(&attributor)).await {
                        warn!("{} refresh failed: {}", name, err);
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("{} refresher stopped", name);
    })
}
