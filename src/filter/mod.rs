//! Event filtering
//!
//! Applies the allow/ignore process lists, path depth truncation and ignore
//! prefixes to the collected events. Classification into path sets lives in
//! [`classify`].

pub mod classify;

use crate::models::{Event, Filters};

pub use classify::{classify_paths, is_write_op, unique_sorted_paths};

/// Remove events matching the ignore rules unless `filters.raw` is set
pub fn apply_filters(events: &[Event], filters: &Filters) -> Vec<Event> {
    if filters.raw {
        return events.to_vec();
    }

    events
        .iter()
        .filter(|event| {
            filters.allow_processes.is_empty() || filters.allow_processes.contains(&event.comm)
        })
        .filter(|event| !filters.ignore_processes.contains(&event.comm))
        .filter_map(|event| {
            let path = truncate_depth(&event.path, filters.max_depth);
            if has_ignored_prefix(&path, &filters.ignore_prefixes) {
                return None;
            }
            if path == event.path {
                Some(event.clone())
            } else {
                Some(event.with_path(path))
            }
        })
        .collect()
}

/// Keep at most `max_depth` components (0 = unlimited)
///
/// The leading empty segment of an absolute path does not count toward the
/// depth. Truncated results always start with `/`.
pub fn truncate_depth(path: &str, max_depth: usize) -> String {
    if max_depth == 0 || path.is_empty() || path == "/" {
        return path.to_string();
    }

    let parts: Vec<&str> = path.split('/').collect();
    let start = usize::from(parts[0].is_empty());
    if parts.len() - start <= max_depth {
        return path.to_string();
    }
    format!("/{}", parts[start..start + max_depth].join("/"))
}

fn has_ignored_prefix(path: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|prefix| path.starts_with(prefix.as_str()))
}

/// Resolve the ignore prefixes for a run
///
/// With `cwd` set (the `--ignore-cwd` case), a literal `.` prefix becomes the
/// working directory and the working directory itself is appended.
pub fn expand_ignore_prefixes(prefixes: &[String], cwd: Option<&str>) -> Vec<String> {
    let mut out: Vec<String> = prefixes
        .iter()
        .map(|prefix| match cwd {
            Some(dir) if prefix == "." => dir.to_string(),
            _ => prefix.clone(),
        })
        .collect();
    if let Some(dir) = cwd {
        out.push(dir.to_string());
    }
    out
}
