// Copyright (C) 2026 Stratus Cloud Services
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Duration and timestamp formatting for logs and reports.

use chrono::{DateTime, Duration, Utc};

/// Render a duration as `D days HH hours MM minutes SS seconds`.
/// A zero duration renders as `0 minutes`.
pub fn format_duration(duration: Duration) -> String {
    if duration == Duration::zero() {
        return "0 minutes".to_string();
    }
    let mut remainder = duration.num_seconds();
    let days = remainder / 86_400;
    remainder %= 86_400;
    let hours = remainder / 3_600;
    remainder %= 3_600;
    let minutes = remainder / 60;
    let seconds = remainder % 60;
    format!(
        "{} days {:02} hours {:02} minutes {:02} seconds",
        days, hours, minutes, seconds
    )
}

/// Render a timestamp as `MM/DD/YYYY HH:MM:SS`, defaulting to now.
pub fn format_timestamp(timestamp: Option<DateTime<Utc>>) -> String {
    let timestamp = timestamp.unwrap_or_else(Utc::now);
    timestamp.format("%m/%d/%Y %H:%M:%S").to_string()
}

/// Clip a `[start, end]` pair to an optional window, resolving a missing
/// end to `now`. Returns `None` when the span falls entirely outside the
/// window.
pub fn clip_to_window(
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
    window_start: Option<DateTime<Utc>>,
    window_end: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let end = end.unwrap_or(now);
    let clipped_start = match window_start {
        Some(ws) if ws > start => ws,
        _ => start,
    };
    let clipped_end = match window_end {
        Some(we) if we < end => we,
        _ => end,
    };
    if clipped_start >= clipped_end {
        return None;
    }
    Some((clipped_start, clipped_end))
}
