use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    NotYetOpen,
    Open,
    Closed,
}

pub fn parse_window_bound(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    let dt = DateTime::parse_from_rfc3339(raw)
        .map_err(|e| anyhow::anyhow!("bad timestamp {:?}: {}", raw, e))?;
    Ok(dt.with_timezone(&Utc))
}

/// Classify `now` against a quiz window. Both bounds are inclusive: a quiz
/// may be started or finished at exactly `open_at` and at exactly `close_at`.
pub fn window_state(open_at: &str, close_at: &str, now: DateTime<Utc>) -> anyhow::Result<WindowState> {
    let open = parse_window_bound(open_at)?;
    let close = parse_window_bound(close_at)?;
    if now < open {
        Ok(WindowState::NotYetOpen)
    } else if now > close {
        Ok(WindowState::Closed)
    } else {
        Ok(WindowState::Open)
    }
}

/// All-or-nothing scoring for a choice question: the submitted set must equal
/// the correct set exactly (no extras, no omissions) to earn the question's
/// marks; anything else scores 0. Partial credit is deliberately not a thing.
pub fn grade_choice_response(
    correct_ids: &BTreeSet<String>,
    submitted_ids: &BTreeSet<String>,
    marks: f64,
) -> f64 {
    if submitted_ids == correct_ids {
        marks
    } else {
        0.0
    }
}

/// Shared incorrectness predicate for the analytics views: a choice response
/// is incorrect when the chosen set differs from the correct set; an open
/// response is always treated as incorrect for reporting purposes, since free
/// text has no auto-determined correctness.
pub fn response_is_incorrect(
    kind: &str,
    correct_ids: &BTreeSet<String>,
    submitted_ids: &BTreeSet<String>,
) -> bool {
    match kind {
        "choice" => submitted_ids != correct_ids,
        _ => true,
    }
}
