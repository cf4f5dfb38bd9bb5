//! Extraction of subtasks from a coordinator's decomposition.

use once_cell::sync::Lazy;
use regex::Regex;

static SUBTASK_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:[-*•]|\d+[.)])\s+(.+)$").expect("subtask regex should be valid")
});

/// Lines starting with a bullet or number marker, marker stripped.
///
/// Falls back to the whole (trimmed) response as a single subtask when no line
/// carries a marker. Blank responses yield no subtasks.
pub fn parse_subtasks(response: &str) -> Vec<String> {
    let parsed: Vec<String> = response
        .lines()
        .filter_map(|line| SUBTASK_LINE.captures(line))
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().trim().to_string()))
        .filter(|s| !s.is_empty())
        .collect();

    if !parsed.is_empty() {
        return parsed;
    }
    let whole = response.trim();
    if whole.is_empty() { Vec::new() } else { vec![whole.to_string()] }
}

/// Assigns subtask *i* to worker *i*; surplus subtasks join the last worker's share.
///
/// Returns one entry per worker that received work, in worker order.
pub fn assign_subtasks(subtasks: &[String], workers: usize) -> Vec<String> {
    if workers == 0 || subtasks.is_empty() {
        return Vec::new();
    }
    let direct = subtasks.len().min(workers);
    let mut assigned: Vec<String> = subtasks[..direct].to_vec();
    if subtasks.len() > workers {
        if let Some(last) = assigned.last_mut() {
            for extra in &subtasks[workers..] {
                last.push('\n');
                last.push_str(extra);
            }
        }
    }
    assigned
}
