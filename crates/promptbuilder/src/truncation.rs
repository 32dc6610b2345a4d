//! Byte-budget truncation helpers (spec §4.7). `truncate_head_tail` is the
//! generalization of `contextpack::truncation::truncate_per_file` to a
//! head+tail split, since the system prompt's "Workspace Context" section
//! needs both ends of `MEMORY.md` kept, not just the first N bytes.

const MARKER: &str = "\n\n[... TRUNCATED ...]\n\n";

/// Per-file truncation, unchanged from the teacher's shape: keep the first
/// `max_chars` bytes, drop the rest.
pub fn truncate_per_file(content: &str, max_bytes: usize) -> (String, bool) {
    if content.len() <= max_bytes {
        return (content.to_string(), false);
    }
    let boundary = content.floor_char_boundary(max_bytes);
    let mut result = content[..boundary].to_string();
    result.push_str("\n\n[TRUNCATED]\n");
    (result, true)
}

/// Keeps `head_frac` of the budget from the start and `tail_frac` from the
/// end, joined by a truncation marker, when `content` exceeds `budget_bytes`.
pub fn truncate_head_tail(
    content: &str,
    budget_bytes: usize,
    head_frac: f64,
    tail_frac: f64,
) -> (String, bool) {
    if content.len() <= budget_bytes {
        return (content.to_string(), false);
    }

    let head_budget = ((budget_bytes as f64) * head_frac) as usize;
    let tail_budget = ((budget_bytes as f64) * tail_frac) as usize;

    let head_boundary = content.floor_char_boundary(head_budget.min(content.len()));
    let head = &content[..head_boundary];

    let tail_start = content.len().saturating_sub(tail_budget);
    let tail_boundary = content.floor_char_boundary(tail_start);
    let tail = &content[tail_boundary..];

    (format!("{head}{MARKER}{tail}"), true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_truncation_when_under_budget() {
        let (result, truncated) = truncate_head_tail("hello world", 100, 0.7, 0.2);
        assert_eq!(result, "hello world");
        assert!(!truncated);
    }

    #[test]
    fn keeps_both_head_and_tail() {
        let content = "a".repeat(50) + &"b".repeat(50) + &"c".repeat(50);
        let (result, truncated) = truncate_head_tail(&content, 60, 0.7, 0.2);
        assert!(truncated);
        assert!(result.starts_with("aaaa"));
        assert!(result.ends_with("cccc"));
        assert!(result.contains("TRUNCATED"));
    }

    #[test]
    fn per_file_truncates_at_boundary() {
        let (result, truncated) = truncate_per_file("abcdefghij", 5);
        assert!(truncated);
        assert!(result.starts_with("abcde"));
    }
}
