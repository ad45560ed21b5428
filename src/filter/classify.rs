//! Path classification
//!
//! Turns filtered events into deduplicated, sorted path lists, optionally
//! collapsed to parent directories and split by access kind.

use std::collections::BTreeSet;

use crate::models::Event;

/// Operations that mutate the filesystem besides anything containing "write"
const MUTATING_OPS: &[&str] = &[
    "rename",
    "unlink",
    "link",
    "symlink",
    "mkdir",
    "rmdir",
    "removefile",
    "create",
    "fsync",
    "truncate",
    "ftruncate",
    "chown",
    "chmod",
    "setattrlist",
];

/// Unique paths (or parent directories) in lexicographic order
pub fn unique_sorted_paths(events: &[Event], dirs_only: bool) -> Vec<String> {
    events
        .iter()
        .map(|event| normalize_path(&event.path, dirs_only))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Split into (reads, writes), each unique and sorted
pub fn classify_paths(events: &[Event], dirs_only: bool) -> (Vec<String>, Vec<String>) {
    let mut reads = BTreeSet::new();
    let mut writes = BTreeSet::new();
    for event in events {
        let path = normalize_path(&event.path, dirs_only);
        if is_write_op(&event.op) {
            writes.insert(path);
        } else {
            reads.insert(path);
        }
    }
    (reads.into_iter().collect(), writes.into_iter().collect())
}

pub fn is_write_op(op: &str) -> bool {
    let op = op.to_lowercase();
    op.contains("write") || op.starts_with("wr") || MUTATING_OPS.contains(&op.as_str())
}

fn normalize_path(path: &str, dirs_only: bool) -> String {
    if dirs_only {
        parent_dir(path)
    } else {
        path.to_string()
    }
}

/// Lexically cleaned parent directory; paths without a separator are returned as-is
fn parent_dir(path: &str) -> String {
    let Some(idx) = path.rfind('/') else {
        return path.to_string();
    };
    let parent = clean_path(&path[..=idx]);
    if parent == "." {
        path.to_string()
    } else {
        parent
    }
}

/// Collapse repeated separators and resolve `.` and `..` without touching the filesystem
fn clean_path(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                // `..` at the root stays at the root
                _ if rooted => {}
                _ => parts.push(".."),
            },
            name => parts.push(name),
        }
    }

    let joined = parts.join("/");
    if rooted {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}
