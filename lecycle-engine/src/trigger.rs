use chrono::Utc;
use serde::{Deserialize, Serialize};

use lecycle_db::db;
use lecycle_db::models::{Cycle, NewTrainingLog, TrainingStatus};
use lecycle_db::rusqlite::Connection;

use crate::error::{EngineError, EvaluationError, Result, TriggerDeliveryError};
use crate::evaluator::{Evaluation, Verdict, WindowMetrics};
use crate::immediate;
use crate::notify::{CycleEvent, Notifier};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecalibrationRequest {
    pub variant: String,
    pub cycle_id: i64,
    pub cycle_number: u32,
    pub model_version: String,
    pub reason: String,
    pub metrics: WindowMetrics,
}

/// Remote training collaborator. `submit` hands the request over and returns
/// a job reference; it must not wait for the job to finish.
pub trait TrainingBackend {
    fn submit(&self, request: &RecalibrationRequest) -> std::result::Result<String, TriggerDeliveryError>;
}

/// Records the dispatch intent in the log and hands back a job reference.
#[derive(Debug, Clone)]
pub struct LogTrainingBackend {
    pub target: String,
}

impl Default for LogTrainingBackend {
    fn default() -> Self {
        Self { target: "training".to_string() }
    }
}

impl TrainingBackend for LogTrainingBackend {
    fn submit(&self, request: &RecalibrationRequest) -> std::result::Result<String, TriggerDeliveryError> {
        let job_ref = format!("{}/{}-c{}", self.target, request.variant, request.cycle_number);
        log::info!(
            "recalibration dispatch for {} (cycle #{}, model {}) -> {}",
            request.variant, request.cycle_number, request.model_version, job_ref
        );
        Ok(job_ref)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriggerOutcome {
    Skipped { log_id: i64, reason: String },
    Triggered { log_id: i64, job_ref: String },
    DeliveryFailed { log_id: i64, error: String },
    /// Another invocation already ran the evaluation for this cycle.
    AlreadyEvaluated,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationReport {
    pub variant: String,
    pub cycle_id: i64,
    pub cycle_number: u32,
    pub evaluation: Option<Evaluation>,
    pub outcome: TriggerOutcome,
}

/// Writes the audit entry for a completed cycle and stamps it evaluated in
/// one transaction, then dispatches the recalibration request on `fail`.
pub fn act_on_evaluation(
    conn: &Connection,
    backend: &dyn TrainingBackend,
    notifier: &dyn Notifier,
    cycle: &Cycle,
    decision: std::result::Result<Evaluation, EvaluationError>,
) -> Result<EvaluationReport> {
    let now = Utc::now();
    let evaluation = match decision {
        Ok(evaluation) => Some(evaluation),
        Err(e) => {
            log::info!("no verdict for {} cycle #{}: {}", cycle.variant, cycle.cycle_number, e);
            None
        }
    };

    let entry = match &evaluation {
        Some(ev) => NewTrainingLog {
            variant: cycle.variant.clone(),
            cycle_id: Some(cycle.id),
            trigger_reason: ev.reason.clone(),
            params_before: Some(serde_json::json!({ "model_version": cycle.model_version })),
            performance: serde_json::to_value(&ev.metrics)?,
            status: match ev.verdict {
                Verdict::Fail => TrainingStatus::Triggered,
                Verdict::Pass => TrainingStatus::Skipped,
            },
        },
        None => NewTrainingLog {
            variant: cycle.variant.clone(),
            cycle_id: Some(cycle.id),
            trigger_reason: "no verdict: evaluation skipped".to_string(),
            params_before: None,
            performance: serde_json::json!({}),
            status: TrainingStatus::Skipped,
        },
    };

    let tx = immediate(conn)?;
    if !db::mark_evaluated(&tx, cycle.id, now)? {
        log::debug!("{} cycle #{} already evaluated", cycle.variant, cycle.cycle_number);
        return Ok(EvaluationReport {
            variant: cycle.variant.clone(),
            cycle_id: cycle.id,
            cycle_number: cycle.cycle_number,
            evaluation,
            outcome: TriggerOutcome::AlreadyEvaluated,
        });
    }
    let log_id = db::insert_training_log(&tx, &entry, now)?;
    tx.commit()?;

    let outcome = match &evaluation {
        Some(ev) if ev.verdict == Verdict::Fail => dispatch(conn, backend, notifier, cycle, ev, log_id)?,
        _ => {
            log::info!("{} cycle #{}: keep model ({})", cycle.variant, cycle.cycle_number, entry.trigger_reason);
            notifier.notify(&CycleEvent::RecalibrationSkipped {
                variant: cycle.variant.clone(),
                cycle_number: cycle.cycle_number,
                reason: entry.trigger_reason.clone(),
            });
            TriggerOutcome::Skipped { log_id, reason: entry.trigger_reason }
        }
    };

    Ok(EvaluationReport {
        variant: cycle.variant.clone(),
        cycle_id: cycle.id,
        cycle_number: cycle.cycle_number,
        evaluation,
        outcome,
    })
}

fn dispatch(
    conn: &Connection,
    backend: &dyn TrainingBackend,
    notifier: &dyn Notifier,
    cycle: &Cycle,
    evaluation: &Evaluation,
    log_id: i64,
) -> Result<TriggerOutcome> {
    log::warn!("recalibration triggered for {} cycle #{}: {}", cycle.variant, cycle.cycle_number, evaluation.reason);
    let request = RecalibrationRequest {
        variant: cycle.variant.clone(),
        cycle_id: cycle.id,
        cycle_number: cycle.cycle_number,
        model_version: cycle.model_version.clone(),
        reason: evaluation.reason.clone(),
        metrics: evaluation.metrics.clone(),
    };

    let (outcome, job_ref, delivery_error) = match backend.submit(&request) {
        Ok(job_ref) => {
            db::set_training_job_ref(conn, log_id, &job_ref)?;
            (TriggerOutcome::Triggered { log_id, job_ref: job_ref.clone() }, Some(job_ref), None)
        }
        Err(e) => {
            let error = e.to_string();
            log::error!("recalibration delivery failed for {}: {}", cycle.variant, error);
            db::resolve_training_log(conn, log_id, TrainingStatus::Failed, None, Some(&error), Utc::now())?;
            (TriggerOutcome::DeliveryFailed { log_id, error: error.clone() }, None, Some(error))
        }
    };

    notifier.notify(&CycleEvent::RecalibrationTriggered {
        variant: cycle.variant.clone(),
        cycle_number: cycle.cycle_number,
        reason: evaluation.reason.clone(),
        metrics: evaluation.metrics.clone(),
        job_ref,
        delivery_error,
    });
    Ok(outcome)
}

/// Result reported by the training platform for a dispatched request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingOutcome {
    pub success: bool,
    #[serde(default)]
    pub params_after: Option<serde_json::Value>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    Resolved(TrainingStatus),
    /// The entry was not pending; nothing changed.
    AlreadyResolved(TrainingStatus),
}

/// Closes a `triggered` audit entry. Safe to call repeatedly: resolved entries
/// are never reopened or overwritten.
pub fn reconcile(conn: &Connection, log_id: i64, outcome: &TrainingOutcome) -> Result<Reconciliation> {
    let status = if outcome.success { TrainingStatus::Success } else { TrainingStatus::Failed };

    let tx = immediate(conn)?;
    let entry = db::fetch_training_log(&tx, log_id)?.ok_or(EngineError::TrainingLogNotFound(log_id))?;
    if !entry.status.is_pending() {
        if entry.status != status {
            log::warn!("training log {} is already {}, ignoring {} report", log_id, entry.status, status);
        }
        return Ok(Reconciliation::AlreadyResolved(entry.status));
    }
    db::resolve_training_log(
        &tx,
        log_id,
        status,
        outcome.params_after.as_ref(),
        outcome.message.as_deref(),
        Utc::now(),
    )?;
    tx.commit()?;
    log::info!("training log {} for {} resolved as {}", log_id, entry.variant, status);
    Ok(Reconciliation::Resolved(status))
}
