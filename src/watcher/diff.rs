//! Line-level diff summarization for watcher events.
//!
//! Deliberately not Myers: a single forward scan with lookahead is cheap,
//! stable under duplicated lines, and good enough for a change excerpt. At
//! a mismatch, each side is scanned for the first reappearance of the other
//! side's current line; the side with the nearer match advances, emitting
//! the skipped lines as added or removed. When neither side contains the
//! other's line, a remove+add pair is emitted and both sides advance.
//!
//! Inputs above [`MAX_DIFF_LINES`] on either side produce a placeholder
//! with length-delta counts instead of a scan.

/// Bail-out threshold for the line scan.
pub const MAX_DIFF_LINES: usize = 2000;

/// How many added and how many removed lines the excerpt shows.
const EXCERPT_LINES: usize = 10;

/// Result of a diff computation.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffSummary {
    /// Unified-style excerpt (up to 10 added + 10 removed lines, then a
    /// summary tail), or a placeholder for oversized inputs.
    pub diff: String,
    pub lines_added: u32,
    pub lines_removed: u32,
}

/// Compare two text snapshots line by line.
pub fn diff_lines(old: &str, new: &str) -> DiffSummary {
    let old_lines: Vec<&str> = old.split('\n').collect();
    let new_lines: Vec<&str> = new.split('\n').collect();

    if old_lines.len() > MAX_DIFF_LINES || new_lines.len() > MAX_DIFF_LINES {
        return oversized(old_lines.len(), new_lines.len());
    }

    let mut added: u32 = 0;
    let mut removed: u32 = 0;
    let mut excerpt: Vec<String> = Vec::new();
    let mut shown_added = 0usize;
    let mut shown_removed = 0usize;

    fn push_removed(line: &str, removed: &mut u32, excerpt: &mut Vec<String>, shown: &mut usize) {
        *removed += 1;
        if *shown < EXCERPT_LINES {
            excerpt.push(format!("- {line}"));
            *shown += 1;
        }
    }
    fn push_added(line: &str, added: &mut u32, excerpt: &mut Vec<String>, shown: &mut usize) {
        *added += 1;
        if *shown < EXCERPT_LINES {
            excerpt.push(format!("+ {line}"));
            *shown += 1;
        }
    }

    let mut i = 0;
    let mut j = 0;
    while i < old_lines.len() && j < new_lines.len() {
        if old_lines[i] == new_lines[j] {
            i += 1;
            j += 1;
            continue;
        }
        // Distance until the other side's current line reappears.
        let old_ahead = old_lines[i..].iter().position(|l| *l == new_lines[j]);
        let new_ahead = new_lines[j..].iter().position(|l| *l == old_lines[i]);
        match (old_ahead, new_ahead) {
            (None, None) => {
                push_removed(old_lines[i], &mut removed, &mut excerpt, &mut shown_removed);
                push_added(new_lines[j], &mut added, &mut excerpt, &mut shown_added);
                i += 1;
                j += 1;
            }
            (Some(k), None) => {
                for line in &old_lines[i..i + k] {
                    push_removed(line, &mut removed, &mut excerpt, &mut shown_removed);
                }
                i += k;
            }
            (None, Some(l)) => {
                for line in &new_lines[j..j + l] {
                    push_added(line, &mut added, &mut excerpt, &mut shown_added);
                }
                j += l;
            }
            (Some(k), Some(l)) => {
                if k <= l {
                    for line in &old_lines[i..i + k] {
                        push_removed(line, &mut removed, &mut excerpt, &mut shown_removed);
                    }
                    i += k;
                } else {
                    for line in &new_lines[j..j + l] {
                        push_added(line, &mut added, &mut excerpt, &mut shown_added);
                    }
                    j += l;
                }
            }
        }
    }
    for line in &old_lines[i..] {
        push_removed(line, &mut removed, &mut excerpt, &mut shown_removed);
    }
    for line in &new_lines[j..] {
        push_added(line, &mut added, &mut excerpt, &mut shown_added);
    }

    let hidden_added = added as usize - shown_added;
    let hidden_removed = removed as usize - shown_removed;
    if hidden_added > 0 || hidden_removed > 0 {
        excerpt.push(format!(
            "… (+{hidden_added} more added, -{hidden_removed} more removed)"
        ));
    }

    DiffSummary {
        diff: excerpt.join("\n"),
        lines_added: added,
        lines_removed: removed,
    }
}

fn oversized(old_len: usize, new_len: usize) -> DiffSummary {
    DiffSummary {
        diff: format!("[diff too large: {old_len} -> {new_len} lines]"),
        lines_added: new_len.saturating_sub(old_len) as u32,
        lines_removed: old_len.saturating_sub(new_len) as u32,
    }
}
