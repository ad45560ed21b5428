//! sandbox-exec profile snippets
//!
//! Produces `(allow file-read* ...)` and `(allow file-write* ...)` rules with
//! one `literal` filter per path, ready to paste into a `.sb` profile.

/// Build the read block followed by the write block; empty sets are omitted
pub fn build_snippets(reads: &[String], writes: &[String]) -> String {
    let mut out = String::new();
    if !reads.is_empty() {
        write_block(&mut out, "file-read*", reads);
    }
    if !writes.is_empty() {
        if !reads.is_empty() {
            out.push('\n');
        }
        write_block(&mut out, "file-write*", writes);
    }
    out
}

fn write_block(out: &mut String, permission: &str, paths: &[String]) {
    out.push_str("(allow ");
    out.push_str(permission);
    out.push('\n');
    for path in paths {
        out.push_str("  (literal \"");
        out.push_str(&escape_literal(path));
        out.push_str("\")\n");
    }
    out.push_str(")\n");
}

fn escape_literal(path: &str) -> String {
    path.replace('"', "\\\"")
}
