use serde::Serialize;

use crate::evaluator::{CycleSummary, WindowMetrics};

/// Structured events for user-facing delivery. Formatting and channel belong
/// to the receiver.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CycleEvent {
    CycleOpened {
        variant: String,
        cycle_number: u32,
        max_draws: u32,
        model_version: String,
        numbers: Vec<u8>,
        special: Option<u8>,
    },
    DrawMatched {
        variant: String,
        cycle_number: u32,
        position: u32,
        max_draws: u32,
        draw_id: String,
        session: Option<String>,
        matched_numbers: Vec<u8>,
        matched_count: u8,
        special_matched: bool,
        prize_level: String,
    },
    CycleCompleted {
        variant: String,
        cycle_number: u32,
        summary: CycleSummary,
        /// Closed by an administrative reset rather than by reaching max_draws.
        reset: bool,
    },
    RecalibrationTriggered {
        variant: String,
        cycle_number: u32,
        reason: String,
        metrics: WindowMetrics,
        job_ref: Option<String>,
        delivery_error: Option<String>,
    },
    RecalibrationSkipped {
        variant: String,
        cycle_number: u32,
        reason: String,
    },
}

pub trait Notifier {
    fn notify(&self, event: &CycleEvent);
}

/// Writes every event as one JSON log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &CycleEvent) {
        match serde_json::to_string(event) {
            Ok(json) => log::info!(target: "lecycle::events", "{json}"),
            Err(e) => log::warn!("cannot serialize event {:?}: {}", event, e),
        }
    }
}
