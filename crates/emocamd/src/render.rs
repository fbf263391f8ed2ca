//! Terminal rendering of loop snapshots.

use crate::config::RenderMode;
use crate::controller::RenderFn;
use emocam_core::types::to_percent;
use emocam_core::{Connectivity, Emotion, SessionState, Snapshot};
use std::fmt::Write as _;
use std::io::Write as _;
use std::sync::Arc;

const BAR_WIDTH: usize = 20;

/// Build the controller's render callback, writing to stdout.
pub fn stdout_renderer(mode: RenderMode) -> RenderFn {
    Arc::new(move |snapshot: &Snapshot| {
        let text = format_snapshot(snapshot, mode);
        let mut out = std::io::stdout().lock();
        if let Err(e) = writeln!(out, "{text}").and_then(|_| out.flush()) {
            tracing::debug!(error = %e, "stdout write failed");
        }
    })
}

pub fn format_snapshot(snapshot: &Snapshot, mode: RenderMode) -> String {
    match mode {
        RenderMode::Text => format_text(snapshot),
        RenderMode::Json => serde_json::to_string(snapshot).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "snapshot serialization failed");
            String::from("{}")
        }),
    }
}

fn connectivity_label(c: Connectivity) -> &'static str {
    match c {
        Connectivity::Unknown => "checking",
        Connectivity::Connected => "connected",
        Connectivity::Disconnected => "disconnected",
    }
}

fn session_label(s: SessionState) -> &'static str {
    match s {
        SessionState::Idle => "idle",
        SessionState::Requesting => "requesting camera",
        SessionState::Active => "active",
        SessionState::Stopped => "stopped",
    }
}

fn bar(probability: f32) -> String {
    let filled = (usize::from(to_percent(probability)) * BAR_WIDTH + 50) / 100;
    format!("{}{}", "#".repeat(filled), ".".repeat(BAR_WIDTH - filled))
}

fn format_text(snapshot: &Snapshot) -> String {
    let mut out = String::new();

    let _ = write!(
        out,
        "[{}] session: {}",
        connectivity_label(snapshot.connectivity),
        session_label(snapshot.session)
    );
    if snapshot.session == SessionState::Active {
        out.push_str(if snapshot.video_ready {
            "  video: ready"
        } else {
            "  video: starting"
        });
    }
    if snapshot.in_flight {
        out.push_str("  (analyzing)");
    }
    out.push('\n');

    if let Some(error) = &snapshot.error {
        let _ = writeln!(out, "error: {error}");
    }

    match &snapshot.reading {
        Some(reading) => {
            let _ = writeln!(
                out,
                "current: {} {}%",
                reading.emotion,
                reading.confidence_percent()
            );
            for emotion in Emotion::ALL {
                let p = reading.probability(emotion);
                let _ = writeln!(
                    out,
                    "  {:<9} {} {:>3}%",
                    emotion.label(),
                    bar(p),
                    to_percent(p)
                );
            }
        }
        None => out.push_str("current: none\n"),
    }

    if !snapshot.history.is_empty() {
        out.push_str("history:\n");
        for entry in &snapshot.history {
            let _ = writeln!(
                out,
                "  {} {} {}%",
                entry.timestamp.format("%H:%M:%S"),
                entry.emotion,
                entry.confidence_percent()
            );
        }
    }

    let stats = snapshot.stats;
    let _ = write!(
        out,
        "requests: {} skipped: {} failed: {} no-face: {} discarded: {}",
        stats.requests_sent, stats.ticks_skipped, stats.failures, stats.no_face, stats.discarded
    );
    out
}
