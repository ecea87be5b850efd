use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// One official draw outcome, already validated against its variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawRecord {
    pub variant: String,
    pub draw_id: String,
    pub date: NaiveDate,
    pub session: Option<String>,
    /// Ascending, pairwise distinct.
    pub numbers: Vec<u8>,
    pub special: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleStatus {
    Active,
    Completed,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStatus::Active => "active",
            CycleStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(CycleStatus::Active),
            "completed" => Some(CycleStatus::Completed),
            _ => None,
        }
    }
}

impl std::fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cycle {
    pub id: i64,
    pub variant: String,
    pub cycle_number: u32,
    pub status: CycleStatus,
    pub draws_tracked: u32,
    pub max_draws: u32,
    pub model_version: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub evaluated_at: Option<DateTime<Utc>>,
}

impl Cycle {
    pub fn is_active(&self) -> bool {
        self.status == CycleStatus::Active
    }

    pub fn draws_left(&self) -> u32 {
        self.max_draws.saturating_sub(self.draws_tracked)
    }
}

/// Prediction as handed over by the predictor, before it is bound to a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPrediction {
    pub numbers: Vec<u8>,
    pub special: Option<u8>,
    pub model_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prediction {
    pub id: i64,
    pub cycle_id: i64,
    pub numbers: Vec<u8>,
    pub special: Option<u8>,
    pub model_version: String,
    pub created_at: DateTime<Utc>,
}

/// One scored draw inside a cycle. The predicted numbers are a snapshot taken
/// at match time, never a reference to the live prediction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchResult {
    pub cycle_id: i64,
    pub draw_id: String,
    pub session: Option<String>,
    pub draw_date: NaiveDate,
    pub position: u32,
    pub predicted_numbers: Vec<u8>,
    pub predicted_special: Option<u8>,
    pub actual_numbers: Vec<u8>,
    pub actual_special: Option<u8>,
    pub matched_numbers: Vec<u8>,
    pub matched_count: u8,
    pub special_matched: bool,
    pub prize_level: String,
    pub matched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainingStatus {
    Triggered,
    Success,
    Failed,
    Skipped,
}

impl TrainingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrainingStatus::Triggered => "triggered",
            TrainingStatus::Success => "success",
            TrainingStatus::Failed => "failed",
            TrainingStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "triggered" => Some(TrainingStatus::Triggered),
            "success" => Some(TrainingStatus::Success),
            "failed" => Some(TrainingStatus::Failed),
            "skipped" => Some(TrainingStatus::Skipped),
            _ => None,
        }
    }

    /// Only a `triggered` entry still waits for an outcome.
    pub fn is_pending(&self) -> bool {
        *self == TrainingStatus::Triggered
    }
}

impl std::fmt::Display for TrainingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTrainingLog {
    pub variant: String,
    pub cycle_id: Option<i64>,
    pub trigger_reason: String,
    pub params_before: Option<serde_json::Value>,
    pub performance: serde_json::Value,
    pub status: TrainingStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingLogEntry {
    pub id: i64,
    pub variant: String,
    pub cycle_id: Option<i64>,
    pub trigger_reason: String,
    pub params_before: Option<serde_json::Value>,
    pub params_after: Option<serde_json::Value>,
    pub performance: serde_json::Value,
    pub status: TrainingStatus,
    pub job_ref: Option<String>,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// "05 - 08 - 18" style rendering used by the CLI tables and log lines.
pub fn format_numbers(numbers: &[u8]) -> String {
    numbers
        .iter()
        .map(|n| format!("{:02}", n))
        .collect::<Vec<_>>()
        .join(" - ")
}
