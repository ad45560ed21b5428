//! fs_usage output parsing
//!
//! A line looks like
//! `22:53:18.123456  open  F=3  /etc/hosts  0.000015 W  mytool.1234`
//! where the duration and the `W` marker are optional, the path may contain
//! spaces, and arbitrary operation-specific tokens precede it.

pub mod runner;

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use time::macros::format_description;
use time::{OffsetDateTime, Time, UtcOffset};

use crate::models::Event;

/// `<comm>.<id>`, where comm may itself contain dots
static PROCESS_DESCRIPTOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.*)\.(\d+)$").expect("valid process descriptor regex"));

/// Why a line could not be turned into an [`Event`]; every variant is recoverable
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("expected at least 4 tokens, found {0}")]
    TooFewTokens(usize),
    #[error("no path region before the trailing fields")]
    NoPathRegion,
    #[error("no token starting with '/' in the path region")]
    NoPath,
    #[error("invalid process field {0:?}")]
    InvalidProcessField(String),
    #[error("process id out of range in {0:?}")]
    InvalidProcessId(String),
}

/// Parse one fs_usage line. `reference` supplies the date and UTC offset,
/// since fs_usage only prints the time of day.
pub fn parse_line(line: &str, reference: OffsetDateTime) -> Result<Event, ParseError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 4 {
        return Err(ParseError::TooFewTokens(fields.len()));
    }

    let time_token = fields[0];
    let op = fields[1];
    let descriptor = fields[fields.len() - 1];

    // Inclusive end of the path region; strip the W marker first, then the duration
    let mut path_end = fields.len() - 2;
    if fields[path_end] == "W" {
        path_end -= 1;
    }
    if looks_like_duration(fields[path_end]) {
        path_end -= 1;
    }
    if path_end < 2 {
        return Err(ParseError::NoPathRegion);
    }

    let path_start = (2..=path_end)
        .find(|&i| fields[i].starts_with('/'))
        .ok_or(ParseError::NoPath)?;
    let path = fields[path_start..=path_end].join(" ");

    let captures = PROCESS_DESCRIPTOR
        .captures(descriptor)
        .ok_or_else(|| ParseError::InvalidProcessField(descriptor.to_string()))?;
    let process_id = captures[2]
        .parse::<u64>()
        .map_err(|_| ParseError::InvalidProcessId(descriptor.to_string()))?;

    Ok(Event {
        timestamp: parse_time_of_day(time_token).map(|time| reference.replace_time(time)),
        raw_timestamp: time_token.to_string(),
        process_id,
        comm: captures[1].to_string(),
        op: op.to_lowercase(),
        path,
    })
}

/// Match the token against fractional precisions from nanoseconds down to whole seconds
fn parse_time_of_day(token: &str) -> Option<Time> {
    let formats = [
        format_description!("[hour]:[minute]:[second].[subsecond digits:9]"),
        format_description!("[hour]:[minute]:[second].[subsecond digits:8]"),
        format_description!("[hour]:[minute]:[second].[subsecond digits:7]"),
        format_description!("[hour]:[minute]:[second].[subsecond digits:6]"),
        format_description!("[hour]:[minute]:[second].[subsecond digits:5]"),
        format_description!("[hour]:[minute]:[second].[subsecond digits:4]"),
        format_description!("[hour]:[minute]:[second].[subsecond digits:3]"),
        format_description!("[hour]:[minute]:[second].[subsecond digits:2]"),
        format_description!("[hour]:[minute]:[second].[subsecond digits:1]"),
        format_description!("[hour]:[minute]:[second]"),
    ];
    formats
        .iter()
        .find_map(|format| Time::parse(token, *format).ok())
}

fn looks_like_duration(token: &str) -> bool {
    !token.is_empty() && token.parse::<f64>().is_ok()
}

/// Today in the local UTC offset, used as the date for parsed timestamps
pub fn local_reference_date() -> OffsetDateTime {
    let offset_seconds = chrono::Local::now().offset().local_minus_utc();
    let offset = UtcOffset::from_whole_seconds(offset_seconds).unwrap_or(UtcOffset::UTC);
    OffsetDateTime::now_utc().to_offset(offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn reference() -> OffsetDateTime {
        datetime!(2025-11-29 00:00:00 +09:00)
    }

    #[test]
    fn test_parse_basic_line() {
        let ev = parse_line("22:53:18.123456 open F=3 /etc/hosts 0.000015 mytool.1234", reference()).unwrap();
        assert_eq!(ev.op, "open");
        assert_eq!(ev.path, "/etc/hosts");
        assert_eq!(ev.process_id, 1234);
        assert_eq!(ev.comm, "mytool");
        assert_eq!(ev.raw_timestamp, "22:53:18.123456");
        assert_eq!(ev.timestamp, Some(datetime!(2025-11-29 22:53:18.123456 +09:00)));
    }

    #[test]
    fn test_parse_realistic_line_with_write_marker() {
        let line = "00:02:07.151327    RdData[S]       D=0x07c753d6  B=0x1000   /dev/disk3s1  /Users/testuser/Library/Application Support/app/Profiles/default/AlternateServices.bin                                             0.000952 W zen.2487526";
        let ev = parse_line(line, reference()).unwrap();
        assert_eq!(ev.process_id, 2487526);
        assert_eq!(ev.comm, "zen");
        assert_eq!(ev.op, "rddata[s]");
        assert_eq!(
            ev.path,
            "/dev/disk3s1 /Users/testuser/Library/Application Support/app/Profiles/default/AlternateServices.bin"
        );
    }

    #[test]
    fn test_parse_without_duration() {
        let ev = parse_line("10:00:00.000 stat64 /usr/lib/libc.dylib mytool.77", reference()).unwrap();
        assert_eq!(ev.path, "/usr/lib/libc.dylib");
        assert_eq!(ev.process_id, 77);
    }

    #[test]
    fn test_parse_path_with_spaces() {
        let ev = parse_line(
            "10:00:00.000 open F=4 (R_____) /Users/me/My Documents/notes.txt 0.000010 TextEdit.501",
            reference(),
        )
        .unwrap();
        assert_eq!(ev.path, "/Users/me/My Documents/notes.txt");
        assert_eq!(ev.comm, "TextEdit");
    }

    #[test]
    fn test_parse_comm_with_dots() {
        let ev = parse_line("10:00:00.000 open /tmp/x 0.0001 com.apple.foo.42", reference()).unwrap();
        assert_eq!(ev.comm, "com.apple.foo");
        assert_eq!(ev.process_id, 42);
    }

    #[test]
    fn test_op_is_lowercased() {
        let ev = parse_line("10:00:00.000 WrData[A] /tmp/out 0.0001 tool.9", reference()).unwrap();
        assert_eq!(ev.op, "wrdata[a]");
    }

    #[test]
    fn test_descriptor_without_numeric_suffix_fails() {
        let err = parse_line("10:00:00.000 open /etc/hosts 0.0001 mytool", reference()).unwrap_err();
        assert_eq!(err, ParseError::InvalidProcessField("mytool".to_string()));

        let err = parse_line("10:00:00.000 open /etc/hosts 0.0001 mytool.abc", reference()).unwrap_err();
        assert!(matches!(err, ParseError::InvalidProcessField(_)));
    }

    #[test]
    fn test_too_few_tokens() {
        assert_eq!(
            parse_line("10:00:00.000 open tool.1", reference()),
            Err(ParseError::TooFewTokens(3))
        );
        assert_eq!(parse_line("", reference()), Err(ParseError::TooFewTokens(0)));
    }

    #[test]
    fn test_no_path_region_after_stripping() {
        // Only the duration and the W marker sit between op and descriptor
        let err = parse_line("10:00:00.000 fsync 0.0001 W tool.1", reference()).unwrap_err();
        assert_eq!(err, ParseError::NoPathRegion);
    }

    #[test]
    fn test_no_slash_token_is_an_error() {
        let err = parse_line("10:00:00.000 close F=3 0.0001 tool.1", reference()).unwrap_err();
        assert_eq!(err, ParseError::NoPath);
    }

    #[test]
    fn test_leading_tokens_before_path_are_skipped() {
        let ev = parse_line("10:00:00.000 getattrlist F=3 B=0x10 [ 2] /private/var/tmp 0.000005 mdworker.88", reference()).unwrap();
        assert_eq!(ev.path, "/private/var/tmp");
    }

    #[test]
    fn test_timestamp_precisions() {
        let cases = [
            ("10:11:12.123456789", 123_456_789),
            ("10:11:12.123456", 123_456_000),
            ("10:11:12.123", 123_000_000),
            ("10:11:12.5", 500_000_000),
            ("10:11:12", 0),
        ];
        for (token, nanos) in cases {
            let line = format!("{} open /tmp/a 0.1 t.1", token);
            let ev = parse_line(&line, reference()).unwrap();
            let ts = ev.timestamp.unwrap_or_else(|| panic!("timestamp for {}", token));
            assert_eq!((ts.hour(), ts.minute(), ts.second()), (10, 11, 12));
            assert_eq!(ts.nanosecond(), nanos, "token {}", token);
            assert_eq!(ts.date(), reference().date());
            assert_eq!(ts.offset(), reference().offset());
        }
    }

    #[test]
    fn test_unrecognized_timestamp_keeps_raw_token() {
        let ev = parse_line("xx:yy open /tmp/a 0.1 t.1", reference()).unwrap();
        assert!(ev.timestamp.is_none());
        assert_eq!(ev.raw_timestamp, "xx:yy");
        assert_eq!(ev.path, "/tmp/a");
    }

    #[test]
    fn test_looks_like_duration() {
        assert!(looks_like_duration("0.000015"));
        assert!(looks_like_duration("12"));
        assert!(!looks_like_duration("W"));
        assert!(!looks_like_duration("/tmp"));
        assert!(!looks_like_duration(""));
    }

    // ==================== PROPERTY-BASED TESTS ====================

    /// One word of a path component; never numeric so it cannot pass for a duration
    fn path_word() -> impl proptest::strategy::Strategy<Value = String> {
        use proptest::prelude::*;
        "[a-z][a-z0-9_-]{0,7}".prop_filter("word parses as a float", |word| !looks_like_duration(word))
    }

    /// `/`-rooted path whose components may contain single spaces
    fn spaced_path() -> impl proptest::strategy::Strategy<Value = String> {
        use proptest::prelude::*;
        let component = prop::collection::vec(path_word(), 1..3).prop_map(|words| words.join(" "));
        prop::collection::vec(component, 1..5).prop_map(|parts| format!("/{}", parts.join("/")))
    }

    #[test]
    fn test_well_formed_lines_round_trip() {
        use proptest::prelude::*;

        proptest::proptest!(|(
            time_token in "(0[0-9]|1[0-9]|2[0-3]):[0-5][0-9]:[0-5][0-9]\\.[0-9]{6}",
            op in "[A-Za-z][A-Za-z0-9\\[\\]]{0,10}",
            noise in prop::collection::vec(
                prop_oneof!["F=[0-9]{1,3}", "B=0x[0-9a-f]{1,4}", "\\([RW_]{6}\\)"],
                0..3,
            ),
            path in spaced_path(),
            duration in prop::option::of("[0-9]\\.[0-9]{6}"),
            write_marker in any::<bool>(),
            comm in "[A-Za-z][A-Za-z0-9_.]{0,12}",
            id in any::<u64>()
        )| {
            let mut tokens = vec![time_token.clone(), op.clone()];
            tokens.extend(noise);
            tokens.push(path.clone());
            tokens.extend(duration);
            if write_marker {
                tokens.push("W".to_string());
            }
            tokens.push(format!("{}.{}", comm, id));
            let line = tokens.join("  ");

            let event = parse_line(&line, reference()).unwrap();
            prop_assert_eq!(event.path, path);
            prop_assert_eq!(event.op, op.to_lowercase());
            prop_assert_eq!(event.process_id, id);
            prop_assert_eq!(event.comm, comm);
            prop_assert_eq!(event.raw_timestamp, time_token);
            prop_assert!(event.timestamp.is_some());
        });
    }
}
