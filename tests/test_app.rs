//! End-to-end runs with a real traced command and a scripted fs_usage stream

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use fs_tracer::app::{run, Collaborators, CredentialPolicy};
use fs_tracer::attribution::{ChildDiscoverer, CommResolver, ThreadListError, ThreadLister};
use fs_tracer::fsusage::runner::{AccountingSource, ByteStream};
use fs_tracer::models::{Filters, OutputMode, TraceOptions};
use fs_tracer::output::HEADER_LINE;
use time::macros::datetime;
use tokio::io::{AsyncReadExt, DuplexStream};

/// Stream whose `{pid}`, `{child}` and `{thread}` placeholders are filled
/// with the traced pid, pid + 1 and pid + 999
struct TemplateSource {
    template: String,
}

impl AccountingSource for TemplateSource {
    fn open(&mut self, target_pid: u32) -> Result<ByteStream> {
        let data = self
            .template
            .replace("{pid}", &target_pid.to_string())
            .replace("{child}", &(target_pid + 1).to_string())
            .replace("{thread}", &(u64::from(target_pid) + 999).to_string());
        Ok(Box::new(Cursor::new(data.into_bytes())))
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct BrokenSource;

impl AccountingSource for BrokenSource {
    fn open(&mut self, _target_pid: u32) -> Result<ByteStream> {
        bail!("fs_usage: command not found")
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Producer that cannot be stopped: the stream stays open after `close`
struct StuckSource {
    prefix: &'static str,
    writer: Option<DuplexStream>,
}

impl AccountingSource for StuckSource {
    fn open(&mut self, _target_pid: u32) -> Result<ByteStream> {
        let (reader, writer) = tokio::io::duplex(64);
        self.writer = Some(writer);
        Ok(Box::new(Cursor::new(self.prefix.as_bytes().to_vec()).chain(reader)))
    }

    fn close(&mut self) -> Result<()> {
        bail!("Failed to interrupt fs_usage: EPERM: Operation not permitted")
    }
}

const TWO_EVENTS: &str = "10:00:00.000 open /etc/hosts 0.0001 mytool.1\n\
                          10:00:00.050 write /tmp/out 0.0001 mytool.1\n";

fn no_children() -> Arc<dyn ChildDiscoverer> {
    Arc::new(|_root: u32| -> Result<Vec<u32>> { Ok(Vec::new()) })
}

fn no_threads() -> Arc<dyn ThreadLister> {
    Arc::new(|_pid: u32| -> Result<Vec<u64>, ThreadListError> { Ok(Vec::new()) })
}

fn unknown_comm() -> Arc<dyn CommResolver> {
    Arc::new(|_pid: u32| -> Option<String> { None })
}

fn collaborators(source: Box<dyn AccountingSource>) -> Collaborators {
    Collaborators {
        source,
        children: no_children(),
        threads: no_threads(),
        comms: unknown_comm(),
        reference_date: datetime!(2025-11-29 00:00:00 +09:00),
        credentials: CredentialPolicy::Inherit,
    }
}

fn scripted(template: &str) -> Collaborators {
    collaborators(Box::new(TemplateSource {
        template: template.to_string(),
    }))
}

fn options() -> TraceOptions {
    TraceOptions {
        no_sudo: true,
        command: vec!["true".to_string()],
        ..TraceOptions::default()
    }
}

fn following() -> TraceOptions {
    TraceOptions {
        follow_children: true,
        ..options()
    }
}

async fn run_capture(options: &TraceOptions, collaborators: Collaborators) -> (i32, String) {
    let mut out = Vec::new();
    let code = run(options, collaborators, &mut out).await;
    (code, String::from_utf8(out).unwrap())
}

fn body_lines(output: &str) -> Vec<&str> {
    let mut lines = output.lines();
    assert_eq!(lines.next(), Some(HEADER_LINE));
    lines.collect()
}

#[tokio::test]
async fn test_default_output() {
    let (code, out) = run_capture(&options(), scripted(TWO_EVENTS)).await;
    assert_eq!(code, 0);
    assert_eq!(out, format!("{}\n/etc/hosts\n/tmp/out\n", HEADER_LINE));
}

#[tokio::test]
async fn test_split_access_json() {
    let opts = TraceOptions {
        json: true,
        output: OutputMode::SplitAccess,
        ..options()
    };
    let (code, out) = run_capture(&opts, scripted(TWO_EVENTS)).await;
    assert_eq!(code, 0);
    let value: serde_json::Value = serde_json::from_str(out.trim()).unwrap();
    assert_eq!(value["read"], serde_json::json!(["/etc/hosts"]));
    assert_eq!(value["write"], serde_json::json!(["/tmp/out"]));
}

#[tokio::test]
async fn test_events_json_lines() {
    let opts = TraceOptions {
        json: true,
        output: OutputMode::Events,
        ..options()
    };
    let (code, out) = run_capture(&opts, scripted(TWO_EVENTS)).await;
    assert_eq!(code, 0);
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines.len(), 2);
    let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(first["path"], "/etc/hosts");
    assert_eq!(first["timestamp"], "2025-11-29T10:00:00.000");
}

#[tokio::test]
async fn test_events_text_has_header() {
    let opts = TraceOptions {
        output: OutputMode::Events,
        ..options()
    };
    let (_, out) = run_capture(&opts, scripted(TWO_EVENTS)).await;
    let body = body_lines(&out);
    assert_eq!(body.len(), 2);
    assert!(body[0].contains("/etc/hosts"));
}

#[tokio::test]
async fn test_sandbox_snippet() {
    let opts = TraceOptions {
        output: OutputMode::SandboxSnippet,
        ..options()
    };
    let (code, out) = run_capture(&opts, scripted(TWO_EVENTS)).await;
    assert_eq!(code, 0);
    assert!(out.starts_with(HEADER_LINE));
    assert!(out.contains("(allow file-read*\n  (literal \"/etc/hosts\")\n)"));
    assert!(out.contains("(allow file-write*\n  (literal \"/tmp/out\")\n)"));
}

#[tokio::test]
async fn test_filters_are_applied_after_collection() {
    let opts = TraceOptions {
        filters: Filters {
            ignore_prefixes: vec!["/tmp".to_string()],
            ..Filters::default()
        },
        ..options()
    };
    let (_, out) = run_capture(&opts, scripted(TWO_EVENTS)).await;
    assert_eq!(body_lines(&out), vec!["/etc/hosts"]);
}

#[tokio::test]
async fn test_follow_children_filters_other_pids() {
    let template = "10:00:00.000 open /parent/file 0.0001 parent.{pid}\n\
                    10:00:00.010 open /child/file 0.0001 child.{child}\n\
                    10:00:00.020 open /other/file 0.0001 other.{thread}\n";
    let mut collab = scripted(template);
    collab.children = Arc::new(|root: u32| -> Result<Vec<u32>> { Ok(vec![root + 1]) });
    collab.threads = Arc::new(|pid: u32| -> Result<Vec<u64>, ThreadListError> {
        Ok(vec![u64::from(pid)])
    });

    let (code, out) = run_capture(&following(), collab).await;
    assert_eq!(code, 0);
    assert_eq!(out, format!("{}\n/child/file\n/parent/file\n", HEADER_LINE));
}

#[tokio::test]
async fn test_follow_children_accepts_corroborated_thread_ids() {
    let template = "10:00:00.000 open /tmp/thread 0.0001 worker.{thread}\n\
                    10:00:00.010 open /tmp/other 0.0001 stranger.{child}\n";
    let mut collab = scripted(template);
    collab.threads = Arc::new(|pid: u32| -> Result<Vec<u64>, ThreadListError> {
        Ok(vec![u64::from(pid), u64::from(pid) + 999])
    });
    // Matches the seeded name of the traced command
    collab.comms = Arc::new(|_pid: u32| -> Option<String> { Some("/usr/bin/true".to_string()) });

    let (code, out) = run_capture(&following(), collab).await;
    assert_eq!(code, 0);
    assert_eq!(body_lines(&out), vec!["/tmp/thread"]);
}

#[tokio::test]
async fn test_thread_lookup_denied_disables_filter() {
    let template = "10:00:00.000 open /tmp/thread 0.0001 root.{thread}\n\
                    10:00:00.010 open /tmp/tid 0.0001 other.{child}\n";
    let mut collab = scripted(template);
    collab.threads = Arc::new(|pid: u32| -> Result<Vec<u64>, ThreadListError> {
        Err(ThreadListError::Denied {
            pid,
            reason: "Operation not permitted".to_string(),
        })
    });

    let (code, out) = run_capture(&following(), collab).await;
    assert_eq!(code, 0);
    assert_eq!(body_lines(&out), vec!["/tmp/thread", "/tmp/tid"]);
}

#[tokio::test]
async fn test_zero_match_streak_switches_to_bypass() {
    // Ids above u32::MAX can never be a real pid
    let log: String = (0..60u64)
        .map(|i| {
            format!(
                "10:00:00.{:03} open /tmp/file{:02} 0.0001 stranger.{}\n",
                i,
                i,
                5_000_000_000 + i
            )
        })
        .collect();

    let (code, out) = run_capture(&following(), scripted(&log)).await;
    assert_eq!(code, 0);
    let body = body_lines(&out);
    // The 50th check trips the guard and is itself accepted
    assert_eq!(body.len(), 11);
    assert_eq!(body.first(), Some(&"/tmp/file49"));
    assert_eq!(body.last(), Some(&"/tmp/file59"));
}

#[tokio::test]
async fn test_pid_filter_off_without_follow_children() {
    let template = "10:00:00.000 open /tmp/file 0.0001 other.{thread}\n";
    let (_, out) = run_capture(&options(), scripted(template)).await;
    assert_eq!(body_lines(&out), vec!["/tmp/file"]);
}

#[tokio::test]
async fn test_no_pid_filter_overrides_follow_children() {
    let template = "10:00:00.000 open /tmp/file 0.0001 other.{thread}\n";
    let opts = TraceOptions {
        no_pid_filter: true,
        ..following()
    };
    let (_, out) = run_capture(&opts, scripted(template)).await;
    assert_eq!(body_lines(&out), vec!["/tmp/file"]);
}

#[tokio::test]
async fn test_command_exit_code_is_propagated() {
    let opts = TraceOptions {
        command: vec!["sh".to_string(), "-c".to_string(), "exit 7".to_string()],
        ..options()
    };
    let (code, out) = run_capture(&opts, scripted(TWO_EVENTS)).await;
    assert_eq!(code, 7);
    assert!(out.contains("/etc/hosts"));
}

#[tokio::test]
async fn test_missing_command_exits_91() {
    let opts = TraceOptions {
        command: vec!["/nonexistent/fs-tracer-test-binary".to_string()],
        ..options()
    };
    let (code, out) = run_capture(&opts, scripted(TWO_EVENTS)).await;
    assert_eq!(code, 91);
    assert!(out.is_empty());
}

#[tokio::test]
async fn test_fs_usage_start_failure_exits_92() {
    let (code, out) = run_capture(&options(), collaborators(Box::new(BrokenSource))).await;
    assert_eq!(code, 92);
    assert!(out.is_empty());
}

#[tokio::test]
async fn test_close_failure_does_not_hang() {
    let source = StuckSource {
        prefix: TWO_EVENTS,
        writer: None,
    };
    let mut out = Vec::new();
    let code = tokio::time::timeout(
        Duration::from_secs(10),
        run(&options(), collaborators(Box::new(source)), &mut out),
    )
    .await
    .expect("run did not return after close failed");

    assert_eq!(code, 0);
    let out = String::from_utf8(out).unwrap();
    assert_eq!(out, format!("{}\n/etc/hosts\n/tmp/out\n", HEADER_LINE));
}

#[tokio::test]
async fn test_fs_usage_start_failure_stops_refreshers() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let mut collab = collaborators(Box::new(BrokenSource));
    collab.children = Arc::new(move |_root: u32| -> Result<Vec<u32>> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    });

    let (code, _) = run_capture(&following(), collab).await;
    assert_eq!(code, 92);

    // Child discovery ticks every 500 ms while refreshers are alive
    let after_run = calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), after_run);
}
