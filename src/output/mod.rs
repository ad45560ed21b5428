//! Output formatting module
//!
//! Handles:
//! - Event log lines (text and JSON lines)
//! - Deduplicated path lists (text and JSON array)
//! - Split read/write sets (text sections and JSON object)
//! - sandbox-exec allow snippets, see [`sandbox`]

pub mod sandbox;

use std::io::Write;

use anyhow::{Context, Result};
use serde::Serialize;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;

use crate::filter::{classify_paths, unique_sorted_paths};
use crate::models::{Event, OutputMode, TraceOptions};

/// First line of every text rendering
pub const HEADER_LINE: &str = "# fs-tracer: filesystem accesses of the traced command";

const EVENT_TIMESTAMP: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]");

#[derive(Serialize)]
struct EventRecord<'a> {
    timestamp: String,
    pid: u64,
    comm: &'a str,
    op: &'a str,
    path: &'a str,
}

#[derive(Serialize)]
struct SplitAccess<'a> {
    read: &'a [String],
    write: &'a [String],
}

/// Millisecond timestamp, or the raw token when the time was not recognized
pub fn format_timestamp(event: &Event) -> String {
    event
        .timestamp
        .and_then(|ts| ts.format(EVENT_TIMESTAMP).ok())
        .unwrap_or_else(|| event.raw_timestamp.clone())
}

/// `[ts] pid=N comm=C op=O path="P"`
pub fn event_line(event: &Event) -> String {
    format!(
        "[{}] pid={} comm={} op={} path={:?}",
        format_timestamp(event),
        event.process_id,
        event.comm,
        event.op,
        event.path
    )
}

/// One JSON object per event
pub fn events_json_lines(events: &[Event]) -> Result<Vec<String>> {
    events
        .iter()
        .map(|event| {
            let record = EventRecord {
                timestamp: format_timestamp(event),
                pid: event.process_id,
                comm: &event.comm,
                op: &event.op,
                path: &event.path,
            };
            serde_json::to_string(&record).context("Failed to serialize event")
        })
        .collect()
}

pub fn paths_text(paths: &[String]) -> String {
    paths.join("\n")
}

pub fn paths_json(paths: &[String]) -> Result<String> {
    serde_json::to_string(paths).context("Failed to serialize path list")
}

/// `# READ` and `# WRITE` sections separated by a blank line
pub fn split_access_text(reads: &[String], writes: &[String]) -> String {
    format!("# READ\n{}\n\n# WRITE\n{}", reads.join("\n"), writes.join("\n"))
}

pub fn split_access_json(reads: &[String], writes: &[String]) -> Result<String> {
    serde_json::to_string(&SplitAccess {
        read: reads,
        write: writes,
    })
    .context("Failed to serialize read/write sets")
}

/// Render the filtered events in the view selected by `options`
pub fn render(out: &mut dyn Write, options: &TraceOptions, events: &[Event]) -> Result<()> {
    let text = !options.json;

    match options.output {
        OutputMode::Events if options.json => {
            for line in events_json_lines(events)? {
                writeln!(out, "{}", line)?;
            }
        }
        OutputMode::Events => {
            writeln!(out, "{}", HEADER_LINE)?;
            for event in events {
                writeln!(out, "{}", event_line(event))?;
            }
        }
        OutputMode::SandboxSnippet => {
            // Snippets are s-expressions regardless of --json
            writeln!(out, "{}", HEADER_LINE)?;
            let (reads, writes) = classify_paths(events, options.dirs_only);
            // Each block already ends with a newline
            write!(out, "{}", sandbox::build_snippets(&reads, &writes))?;
        }
        OutputMode::SplitAccess => {
            let (reads, writes) = classify_paths(events, options.dirs_only);
            if text {
                writeln!(out, "{}", HEADER_LINE)?;
                writeln!(out, "{}", split_access_text(&reads, &writes))?;
            } else {
                writeln!(out, "{}", split_access_json(&reads, &writes)?)?;
            }
        }
        OutputMode::Paths => {
            let paths = unique_sorted_paths(events, options.dirs_only);
            if text {
                writeln!(out, "{}", HEADER_LINE)?;
                writeln!(out, "{}", paths_text(&paths))?;
            } else {
                writeln!(out, "{}", paths_json(&paths)?)?;
            }
        }
    }

    out.flush().context("Failed to flush output")
}
