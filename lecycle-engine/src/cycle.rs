use chrono::Utc;

use lecycle_db::db;
use lecycle_db::models::{Cycle, DrawRecord, MatchResult};
use lecycle_db::rusqlite::{self, Connection, ErrorCode};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result, ValidationError};
use crate::evaluator::{self, CycleSummary};
use crate::immediate;
use crate::normalizer::{normalize_draw, normalize_prediction, RawDraw, RawPrediction};
use crate::notify::{CycleEvent, Notifier};
use crate::scorer;
use crate::trigger::{self, EvaluationReport, TrainingBackend};

#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Matched { cycle: Cycle, result: MatchResult },
    /// The draw filled the cycle. `report` is None when the evaluation step
    /// failed and was left for the pending sweep.
    Completed { cycle: Cycle, result: MatchResult, report: Option<EvaluationReport> },
    /// The draw was already scored for this cycle; nothing changed.
    Duplicate { cycle: Cycle },
}

impl RecordOutcome {
    pub fn cycle(&self) -> &Cycle {
        match self {
            RecordOutcome::Matched { cycle, .. }
            | RecordOutcome::Completed { cycle, .. }
            | RecordOutcome::Duplicate { cycle } => cycle,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Stored, but no cycle is active for the variant.
    Untracked { draw: DrawRecord, stored: bool },
    /// Already stored before the active cycle opened; it is not scored.
    Predates { draw: DrawRecord, cycle_number: u32 },
    Recorded { draw: DrawRecord, stored: bool, outcome: RecordOutcome },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResetOutcome {
    pub cycle: Cycle,
    pub report: Option<EvaluationReport>,
}

/// Cycle lifecycle for every configured variant, over one connection.
pub struct CycleEngine<'a> {
    conn: &'a Connection,
    config: &'a EngineConfig,
    notifier: &'a dyn Notifier,
    trainer: &'a dyn TrainingBackend,
}

impl<'a> CycleEngine<'a> {
    pub fn new(
        conn: &'a Connection,
        config: &'a EngineConfig,
        notifier: &'a dyn Notifier,
        trainer: &'a dyn TrainingBackend,
    ) -> Self {
        Self { conn, config, notifier, trainer }
    }

    pub fn config(&self) -> &EngineConfig {
        self.config
    }

    pub fn open_cycle(
        &self,
        variant_id: &str,
        raw: &RawPrediction,
        max_draws: u32,
        model_version: &str,
    ) -> Result<Cycle> {
        let variant = self.config.variant(variant_id)?;
        if max_draws == 0 {
            return Err(ValidationError::ZeroMaxDraws.into());
        }
        let prediction = normalize_prediction(variant, raw, model_version)?;
        let now = Utc::now();

        let tx = immediate(self.conn)?;
        if let Some(active) = db::active_cycle(&tx, &variant.id)? {
            return Err(EngineError::Conflict {
                variant: variant.id.clone(),
                cycle_number: active.cycle_number,
            });
        }
        let cycle_number = db::next_cycle_number(&tx, &variant.id)?;
        let cycle_id = match db::insert_cycle(&tx, &variant.id, cycle_number, max_draws, &prediction.model_version, now) {
            Ok(id) => id,
            Err(e) if is_constraint_violation(&e) => {
                return Err(EngineError::Conflict { variant: variant.id.clone(), cycle_number });
            }
            Err(e) => return Err(e.into()),
        };
        db::insert_prediction(&tx, cycle_id, &prediction, now)?;
        let cycle = db::fetch_cycle(&tx, cycle_id)?.ok_or(EngineError::CycleNotFound(cycle_id))?;
        tx.commit()?;

        log::info!(
            "opened {} cycle #{} ({} draws, model {})",
            cycle.variant, cycle.cycle_number, cycle.max_draws, cycle.model_version
        );
        self.notifier.notify(&CycleEvent::CycleOpened {
            variant: cycle.variant.clone(),
            cycle_number: cycle.cycle_number,
            max_draws: cycle.max_draws,
            model_version: cycle.model_version.clone(),
            numbers: prediction.numbers,
            special: prediction.special,
        });
        Ok(cycle)
    }

    /// Scores a normalized draw against the active cycle of `variant_id`.
    pub fn record_draw(&self, variant_id: &str, draw: &DrawRecord) -> Result<RecordOutcome> {
        let variant = self.config.variant(variant_id)?;
        if draw.variant != variant.id {
            return Err(ValidationError::VariantMismatch {
                expected: variant.id.clone(),
                actual: draw.variant.clone(),
            }
            .into());
        }

        let tx = immediate(self.conn)?;
        let cycle = db::active_cycle(&tx, &variant.id)?
            .ok_or_else(|| EngineError::NoActiveCycle { variant: variant.id.clone() })?;
        if db::match_exists(&tx, cycle.id, &draw.draw_id, &draw.session)? {
            log::debug!("draw {} already scored for {} cycle #{}", draw.draw_id, cycle.variant, cycle.cycle_number);
            return Ok(RecordOutcome::Duplicate { cycle });
        }
        let prediction = db::fetch_prediction(&tx, cycle.id)?.ok_or(EngineError::MissingPrediction(cycle.id))?;

        let now = Utc::now();
        let result = scorer::score(&variant.prize_table, &prediction, draw).into_result(
            cycle.id,
            cycle.draws_tracked + 1,
            now,
        );
        if !db::insert_match_result(&tx, &result)? {
            return Ok(RecordOutcome::Duplicate { cycle });
        }
        let tracked = db::advance_draws_tracked(&tx, cycle.id)?.ok_or(EngineError::CycleClosed(cycle.id))?;
        let completed = tracked >= cycle.max_draws;
        if completed {
            db::complete_cycle(&tx, cycle.id, now)?;
        }
        let cycle = db::fetch_cycle(&tx, cycle.id)?.ok_or(EngineError::CycleNotFound(cycle.id))?;
        tx.commit()?;

        log::info!(
            "{} cycle #{} draw {} ({}/{}): {} matched, tier {}",
            cycle.variant, cycle.cycle_number, result.draw_id, tracked, cycle.max_draws, result.matched_count, result.prize_level
        );
        self.notifier.notify(&CycleEvent::DrawMatched {
            variant: cycle.variant.clone(),
            cycle_number: cycle.cycle_number,
            position: result.position,
            max_draws: cycle.max_draws,
            draw_id: result.draw_id.clone(),
            session: result.session.clone(),
            matched_numbers: result.matched_numbers.clone(),
            matched_count: result.matched_count,
            special_matched: result.special_matched,
            prize_level: result.prize_level.clone(),
        });

        if !completed {
            return Ok(RecordOutcome::Matched { cycle, result });
        }
        log::info!("{} cycle #{} completed", cycle.variant, cycle.cycle_number);
        let report = self.after_completion(&cycle, false);
        let cycle = self.reload(cycle);
        Ok(RecordOutcome::Completed { cycle, result, report })
    }

    /// Ingestion entry point: validate, store the draw, then score it if a
    /// cycle is running.
    pub fn ingest_draw(&self, variant_id: &str, raw: &RawDraw) -> Result<IngestOutcome> {
        let variant = self.config.variant(variant_id)?;
        let draw = normalize_draw(variant, raw)?;
        let stored = db::insert_draw(self.conn, &draw, Utc::now())?;
        if !stored {
            log::debug!("draw {} for {} already stored", draw.draw_id, draw.variant);
            if let Some(cycle) = self.opened_after(&draw)? {
                log::info!(
                    "draw {} was stored before {} cycle #{} opened, not tracked",
                    draw.draw_id, cycle.variant, cycle.cycle_number
                );
                return Ok(IngestOutcome::Predates { draw, cycle_number: cycle.cycle_number });
            }
        }

        match self.record_draw(&variant.id, &draw) {
            Ok(outcome) => Ok(IngestOutcome::Recorded { draw, stored, outcome }),
            Err(EngineError::NoActiveCycle { variant }) => {
                log::info!("no active cycle for {}, draw {} not tracked", variant, draw.draw_id);
                Ok(IngestOutcome::Untracked { draw, stored })
            }
            Err(e) => Err(e),
        }
    }

    /// The active cycle, when it was opened after `draw` was first stored and
    /// has not scored it yet.
    fn opened_after(&self, draw: &DrawRecord) -> Result<Option<Cycle>> {
        let Some(cycle) = db::active_cycle(self.conn, &draw.variant)? else {
            return Ok(None);
        };
        if db::match_exists(self.conn, cycle.id, &draw.draw_id, &draw.session)? {
            return Ok(None);
        }
        let first_stored = db::draw_ingested_at(self.conn, &draw.variant, &draw.draw_id, &draw.session)?;
        Ok(first_stored.filter(|at| *at < cycle.created_at).map(|_| cycle))
    }

    /// Closes the active cycle early. Evaluation runs over the draws scored
    /// so far.
    pub fn reset_cycle(&self, variant_id: &str, reason: &str) -> Result<ResetOutcome> {
        let variant = self.config.variant(variant_id)?;

        let tx = immediate(self.conn)?;
        let active = db::active_cycle(&tx, &variant.id)?
            .ok_or_else(|| EngineError::NoActiveCycle { variant: variant.id.clone() })?;
        db::complete_cycle(&tx, active.id, Utc::now())?;
        let cycle = db::fetch_cycle(&tx, active.id)?.ok_or(EngineError::CycleNotFound(active.id))?;
        tx.commit()?;

        log::info!(
            "{} cycle #{} reset after {}/{} draws: {}",
            cycle.variant, cycle.cycle_number, cycle.draws_tracked, cycle.max_draws, reason
        );
        let report = self.after_completion(&cycle, true);
        let cycle = self.reload(cycle);
        Ok(ResetOutcome { cycle, report })
    }

    /// Length of the next cycle: long when the previous cycle had a draw at
    /// the hit threshold, short otherwise so the model is checked sooner.
    pub fn plan_max_draws(&self, variant_id: &str) -> Result<u32> {
        let variant = self.config.variant(variant_id)?;
        let length = &variant.cycle_length;
        let next = db::next_cycle_number(self.conn, &variant.id)?;
        let previous = db::completed_cycles_before(self.conn, &variant.id, next, 1)?;
        let Some(previous) = previous.first() else {
            return Ok(length.long);
        };
        let hits = self.cycle_summary(previous)?.hits_at(length.hit_threshold as u32);
        let planned = if hits > 0 { length.long } else { length.short };
        log::debug!(
            "{} cycle #{} had {} draw(s) with {}+ matches, next cycle runs {} draws",
            variant.id, previous.cycle_number, hits, length.hit_threshold, planned
        );
        Ok(planned)
    }

    /// Evaluates every completed cycle of the variant that has no verdict yet.
    pub fn evaluate_pending(&self, variant_id: &str) -> Result<Vec<EvaluationReport>> {
        let variant = self.config.variant(variant_id)?;
        let pending = db::cycles_pending_evaluation(self.conn, &variant.id)?;
        let mut reports = Vec::with_capacity(pending.len());
        for cycle in &pending {
            let summary = self.cycle_summary(cycle)?;
            reports.push(self.evaluate(cycle, &summary)?);
        }
        if !reports.is_empty() {
            log::info!("evaluated {} pending {} cycle(s)", reports.len(), variant.id);
        }
        Ok(reports)
    }

    pub fn delete_cycle(&self, cycle_id: i64) -> Result<()> {
        if !db::delete_cycle(self.conn, cycle_id)? {
            return Err(EngineError::CycleNotFound(cycle_id));
        }
        log::info!("deleted cycle {}", cycle_id);
        Ok(())
    }

    pub fn cycle_summary(&self, cycle: &Cycle) -> Result<CycleSummary> {
        let results = db::match_results_for_cycle(self.conn, cycle.id)?;
        Ok(CycleSummary::from_results(cycle, &results))
    }

    fn after_completion(&self, cycle: &Cycle, reset: bool) -> Option<EvaluationReport> {
        let outcome = self.cycle_summary(cycle).and_then(|summary| {
            self.notifier.notify(&CycleEvent::CycleCompleted {
                variant: cycle.variant.clone(),
                cycle_number: cycle.cycle_number,
                summary: summary.clone(),
                reset,
            });
            self.evaluate(cycle, &summary)
        });
        match outcome {
            Ok(report) => Some(report),
            Err(e) => {
                log::warn!("evaluation of {} cycle #{} deferred: {}", cycle.variant, cycle.cycle_number, e);
                None
            }
        }
    }

    /// Picks up the `evaluated_at` stamp written by the evaluation step.
    fn reload(&self, cycle: Cycle) -> Cycle {
        match db::fetch_cycle(self.conn, cycle.id) {
            Ok(Some(fresh)) => fresh,
            Ok(None) => cycle,
            Err(e) => {
                log::warn!("could not reload {} cycle #{}: {}", cycle.variant, cycle.cycle_number, e);
                cycle
            }
        }
    }

    fn evaluate(&self, cycle: &Cycle, summary: &CycleSummary) -> Result<EvaluationReport> {
        let policy = &self.config.evaluation;
        let earlier = db::completed_cycles_before(
            self.conn,
            &cycle.variant,
            cycle.cycle_number,
            policy.history_depth() as u32,
        )?;
        let history = earlier
            .iter()
            .map(|c| self.cycle_summary(c))
            .collect::<Result<Vec<_>>>()?;
        let decision = evaluator::evaluate(policy, summary, &history);
        trigger::act_on_evaluation(self.conn, self.trainer, self.notifier, cycle, decision)
    }
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EvaluationPolicy, SuccessMetric};
    use crate::evaluator::Verdict;
    use crate::notify::testing::RecordingNotifier;
    use crate::trigger::testing::{FailingBackend, RecordingBackend};
    use crate::trigger::{reconcile, Reconciliation, TrainingOutcome, TriggerOutcome};
    use lecycle_db::models::{CycleStatus, TrainingStatus};

    const PICK: [u8; 6] = [5, 8, 18, 30, 39, 44];

    struct Fixture {
        conn: Connection,
        config: EngineConfig,
        notifier: RecordingNotifier,
        backend: RecordingBackend,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                conn: db::open_in_memory().unwrap(),
                config: EngineConfig::default(),
                notifier: RecordingNotifier::default(),
                backend: RecordingBackend::default(),
            }
        }

        fn engine(&self) -> CycleEngine<'_> {
            CycleEngine::new(&self.conn, &self.config, &self.notifier, &self.backend)
        }

        fn open_mega(&self, max_draws: u32) -> Cycle {
            let prediction = RawPrediction { numbers: PICK.to_vec(), special: None };
            self.engine().open_cycle("mega_645", &prediction, max_draws, "3.0").unwrap()
        }

        fn active_count(&self, variant: &str) -> u32 {
            db::count_active_cycles(&self.conn, variant).unwrap()
        }
    }

    fn mega_draw(draw_id: &str, numbers: &[u8]) -> RawDraw {
        RawDraw {
            draw_id: draw_id.to_string(),
            date: "2024-03-01".to_string(),
            session: None,
            numbers: numbers.to_vec(),
            special: None,
        }
    }

    fn record(engine: &CycleEngine, raw: &RawDraw) -> RecordOutcome {
        let draw = normalize_draw(engine.config().variant("mega_645").unwrap(), raw).unwrap();
        engine.record_draw("mega_645", &draw).unwrap()
    }

    const MISS: [u8; 6] = [1, 2, 3, 4, 6, 7];
    const THREE: [u8; 6] = [5, 8, 18, 1, 2, 3];

    #[test]
    fn test_open_cycle_numbers_and_persists_prediction() {
        let fx = Fixture::new();
        let cycle = fx.open_mega(5);
        assert_eq!(cycle.cycle_number, 1);
        assert_eq!(cycle.status, CycleStatus::Active);
        assert_eq!(cycle.draws_tracked, 0);
        let prediction = db::fetch_prediction(&fx.conn, cycle.id).unwrap().unwrap();
        assert_eq!(prediction.numbers, PICK.to_vec());
        assert_eq!(prediction.model_version, "3.0");
        assert_eq!(fx.notifier.names(), vec!["cycle_opened"]);
    }

    #[test]
    fn test_second_open_conflicts() {
        let fx = Fixture::new();
        fx.open_mega(5);
        let prediction = RawPrediction { numbers: PICK.to_vec(), special: None };
        let err = fx.engine().open_cycle("mega_645", &prediction, 5, "3.1").unwrap_err();
        assert!(matches!(err, EngineError::Conflict { cycle_number: 1, .. }));
        assert_eq!(fx.active_count("mega_645"), 1);

        // Other variants are independent.
        let power = RawPrediction { numbers: vec![1, 2, 3, 4, 5, 6], special: Some(7) };
        fx.engine().open_cycle("power_655", &power, 5, "3.0").unwrap();
        assert_eq!(fx.active_count("power_655"), 1);
    }

    #[test]
    fn test_open_rejects_bad_input() {
        let fx = Fixture::new();
        let prediction = RawPrediction { numbers: PICK.to_vec(), special: None };
        assert!(matches!(
            fx.engine().open_cycle("mega_645", &prediction, 0, "3.0"),
            Err(EngineError::Validation(ValidationError::ZeroMaxDraws))
        ));
        let short = RawPrediction { numbers: vec![1, 2, 3], special: None };
        assert!(matches!(
            fx.engine().open_cycle("mega_645", &short, 5, "3.0"),
            Err(EngineError::Validation(ValidationError::Arity { .. }))
        ));
        assert!(matches!(
            fx.engine().open_cycle("keno", &prediction, 5, "3.0"),
            Err(EngineError::UnknownVariant(_))
        ));
        assert_eq!(fx.active_count("mega_645"), 0);
    }

    #[test]
    fn test_cycle_completes_exactly_at_max_draws() {
        let fx = Fixture::new();
        fx.open_mega(5);
        let engine = fx.engine();

        for i in 1..=4u32 {
            match record(&engine, &mega_draw(&format!("0100{i}"), &THREE)) {
                RecordOutcome::Matched { cycle, result } => {
                    assert_eq!(cycle.status, CycleStatus::Active);
                    assert_eq!(cycle.draws_tracked, i);
                    assert_eq!(result.position, i);
                    assert_eq!(result.matched_count, 3);
                    assert_eq!(result.prize_level, "third");
                }
                other => panic!("draw {i} should only match, got {other:?}"),
            }
            assert_eq!(fx.active_count("mega_645"), 1);
        }

        let RecordOutcome::Completed { cycle, result, report } = record(&engine, &mega_draw("01005", &THREE)) else {
            panic!("fifth draw should complete the cycle");
        };
        assert_eq!(cycle.status, CycleStatus::Completed);
        assert_eq!(cycle.draws_tracked, 5);
        assert!(cycle.completed_at.is_some());
        assert!(cycle.evaluated_at.is_some());
        assert_eq!(result.position, 5);
        assert_eq!(fx.active_count("mega_645"), 0);

        let report = report.expect("verdict produced synchronously");
        assert_eq!(report.evaluation.unwrap().verdict, Verdict::Pass);
        assert!(matches!(report.outcome, TriggerOutcome::Skipped { .. }));
        assert!(fx.backend.requests.borrow().is_empty());

        // A sixth draw has nowhere to go.
        let draw = normalize_draw(fx.config.variant("mega_645").unwrap(), &mega_draw("01006", &THREE)).unwrap();
        assert!(matches!(engine.record_draw("mega_645", &draw), Err(EngineError::NoActiveCycle { .. })));
    }

    #[test]
    fn test_failing_window_triggers_one_recalibration() {
        let fx = Fixture::new();
        fx.open_mega(3);
        let engine = fx.engine();
        record(&engine, &mega_draw("02001", &MISS));
        record(&engine, &mega_draw("02002", &MISS));
        let RecordOutcome::Completed { cycle, report, .. } = record(&engine, &mega_draw("02003", &MISS)) else {
            panic!("third draw should complete the cycle");
        };

        let report = report.unwrap();
        assert_eq!(report.evaluation.as_ref().unwrap().verdict, Verdict::Fail);
        assert!(matches!(report.outcome, TriggerOutcome::Triggered { .. }));

        let logs = db::training_logs_for_cycle(&fx.conn, cycle.id).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, TrainingStatus::Triggered);
        assert_eq!(fx.backend.requests.borrow().len(), 1);
        assert_eq!(
            fx.notifier.names(),
            vec![
                "cycle_opened",
                "draw_matched",
                "draw_matched",
                "draw_matched",
                "cycle_completed",
                "recalibration_triggered"
            ]
        );

        // Nothing left for the sweep.
        assert!(engine.evaluate_pending("mega_645").unwrap().is_empty());
        assert_eq!(db::training_logs_for_cycle(&fx.conn, cycle.id).unwrap().len(), 1);
    }

    #[test]
    fn test_replayed_draw_is_noop() {
        let fx = Fixture::new();
        let opened = fx.open_mega(5);
        let engine = fx.engine();
        record(&engine, &mega_draw("03001", &THREE));

        let outcome = record(&engine, &mega_draw("03001", &THREE));
        assert!(matches!(outcome, RecordOutcome::Duplicate { .. }));
        assert_eq!(outcome.cycle().draws_tracked, 1);
        assert_eq!(db::match_results_for_cycle(&fx.conn, opened.id).unwrap().len(), 1);
        assert_eq!(db::fetch_cycle(&fx.conn, opened.id).unwrap().unwrap().draws_tracked, 1);
    }

    #[test]
    fn test_draw_for_other_variant_rejected() {
        let fx = Fixture::new();
        fx.open_mega(5);
        let mut draw = normalize_draw(fx.config.variant("mega_645").unwrap(), &mega_draw("04001", &MISS)).unwrap();
        draw.variant = "power_655".to_string();
        let err = fx.engine().record_draw("mega_645", &draw).unwrap_err();
        assert!(matches!(err, EngineError::Validation(ValidationError::VariantMismatch { .. })));
    }

    #[test]
    fn test_ingest_without_cycle_is_untracked() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let outcome = engine.ingest_draw("mega_645", &mega_draw("05001", &MISS)).unwrap();
        assert!(matches!(outcome, IngestOutcome::Untracked { stored: true, .. }));
        let again = engine.ingest_draw("mega_645", &mega_draw("05001", &MISS)).unwrap();
        assert!(matches!(again, IngestOutcome::Untracked { stored: false, .. }));
        assert_eq!(db::count_draws(&fx.conn, "mega_645").unwrap(), 1);

        fx.open_mega(5);
        let outcome = engine.ingest_draw("mega_645", &mega_draw("05002", &THREE)).unwrap();
        let IngestOutcome::Recorded { stored, outcome, .. } = outcome else {
            panic!("draw should be recorded");
        };
        assert!(stored);
        assert!(matches!(outcome, RecordOutcome::Matched { .. }));

        let bad = mega_draw("05003", &[1, 2, 3]);
        assert!(matches!(engine.ingest_draw("mega_645", &bad), Err(EngineError::Validation(_))));
        assert_eq!(db::count_draws(&fx.conn, "mega_645").unwrap(), 2);
    }

    #[test]
    fn test_draw_stored_before_cycle_is_not_scored() {
        let fx = Fixture::new();
        let variant = fx.config.variant("mega_645").unwrap();
        let early = normalize_draw(variant, &mega_draw("05101", &THREE)).unwrap();
        db::insert_draw(&fx.conn, &early, Utc::now() - chrono::Duration::hours(1)).unwrap();

        let cycle = fx.open_mega(5);
        let engine = fx.engine();
        let outcome = engine.ingest_draw("mega_645", &mega_draw("05101", &THREE)).unwrap();
        assert!(matches!(outcome, IngestOutcome::Predates { cycle_number: 1, .. }));
        assert_eq!(db::fetch_cycle(&fx.conn, cycle.id).unwrap().unwrap().draws_tracked, 0);
        assert!(db::match_results_for_cycle(&fx.conn, cycle.id).unwrap().is_empty());

        // A draw stored while the cycle runs but never scored is picked up again.
        let late = normalize_draw(variant, &mega_draw("05102", &MISS)).unwrap();
        db::insert_draw(&fx.conn, &late, Utc::now()).unwrap();
        let outcome = engine.ingest_draw("mega_645", &mega_draw("05102", &MISS)).unwrap();
        let IngestOutcome::Recorded { stored, outcome, .. } = outcome else {
            panic!("draw stored during the cycle should be recorded");
        };
        assert!(!stored);
        assert_eq!(outcome.cycle().draws_tracked, 1);
    }

    #[test]
    fn test_sessions_are_distinct_draws() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let prediction = RawPrediction { numbers: vec![3, 9, 14, 27, 33], special: Some(5) };
        engine.open_cycle("lotto_535", &prediction, 2, "1.0").unwrap();

        let mut raw = RawDraw {
            draw_id: "00412".to_string(),
            date: "17/02/2026".to_string(),
            session: Some("am".to_string()),
            numbers: vec![3, 9, 14, 1, 2],
            special: Some(5),
        };
        let IngestOutcome::Recorded { outcome, .. } = engine.ingest_draw("lotto_535", &raw).unwrap() else {
            panic!("AM draw should be recorded");
        };
        let RecordOutcome::Matched { result, .. } = outcome else {
            panic!("AM draw should not close the cycle");
        };
        assert_eq!(result.session.as_deref(), Some("AM"));
        assert_eq!(result.prize_level, "third");

        raw.session = Some("PM".to_string());
        let IngestOutcome::Recorded { outcome, .. } = engine.ingest_draw("lotto_535", &raw).unwrap() else {
            panic!("PM draw should be recorded");
        };
        assert!(matches!(outcome, RecordOutcome::Completed { .. }));
    }

    #[test]
    fn test_reset_closes_early_and_evaluates() {
        let fx = Fixture::new();
        fx.open_mega(5);
        let engine = fx.engine();
        record(&engine, &mega_draw("06001", &THREE));

        let reset = engine.reset_cycle("mega_645", "model replaced").unwrap();
        assert_eq!(reset.cycle.status, CycleStatus::Completed);
        assert_eq!(reset.cycle.draws_tracked, 1);
        assert!(reset.cycle.evaluated_at.is_some());
        let report = reset.report.unwrap();
        assert_eq!(report.evaluation.unwrap().metrics.current_hits, 1);
        assert_eq!(fx.active_count("mega_645"), 0);
        assert!(fx.notifier.events.borrow().iter().any(|e| matches!(e, CycleEvent::CycleCompleted { reset: true, .. })));

        assert!(matches!(
            engine.reset_cycle("mega_645", "again"),
            Err(EngineError::NoActiveCycle { .. })
        ));
    }

    #[test]
    fn test_reset_of_empty_cycle_is_skipped() {
        let fx = Fixture::new();
        fx.open_mega(5);
        let reset = fx.engine().reset_cycle("mega_645", "bad prediction").unwrap();
        assert!(reset.cycle.evaluated_at.is_some());
        let report = reset.report.unwrap();
        assert_eq!(report.evaluation, None);
        assert!(matches!(report.outcome, TriggerOutcome::Skipped { .. }));
        assert!(fx.backend.requests.borrow().is_empty());

        // A new cycle can be opened right away.
        let next = fx.open_mega(3);
        assert_eq!(next.cycle_number, 2);
    }

    #[test]
    fn test_pending_sweep_evaluates_once() {
        let fx = Fixture::new();
        let cycle = fx.open_mega(1);
        let engine = fx.engine();

        // Close the cycle behind the engine's back so no evaluation runs.
        let draw = normalize_draw(fx.config.variant("mega_645").unwrap(), &mega_draw("07001", &MISS)).unwrap();
        let prediction = db::fetch_prediction(&fx.conn, cycle.id).unwrap().unwrap();
        let table = &fx.config.variant("mega_645").unwrap().prize_table;
        let result = scorer::score(table, &prediction, &draw).into_result(cycle.id, 1, Utc::now());
        db::insert_match_result(&fx.conn, &result).unwrap();
        db::advance_draws_tracked(&fx.conn, cycle.id).unwrap();
        db::complete_cycle(&fx.conn, cycle.id, Utc::now()).unwrap();

        let reports = engine.evaluate_pending("mega_645").unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].cycle_id, cycle.id);
        assert!(matches!(reports[0].outcome, TriggerOutcome::Triggered { .. }));
        assert!(engine.evaluate_pending("mega_645").unwrap().is_empty());
        assert_eq!(db::training_logs_for_cycle(&fx.conn, cycle.id).unwrap().len(), 1);
    }

    #[test]
    fn test_window_spans_previous_cycles() {
        let mut fx = Fixture::new();
        fx.config.evaluation = EvaluationPolicy {
            window: 2,
            min_history: 2,
            match_threshold: 3,
            metric: SuccessMetric::BestDraw,
            min_success_rate: 0.5,
        };
        fx.open_mega(1);
        let engine = fx.engine();
        let RecordOutcome::Completed { report, .. } = record(&engine, &mega_draw("08001", &THREE)) else {
            panic!("single-draw cycle should complete");
        };
        // Only one completed cycle so far.
        assert_eq!(report.unwrap().evaluation, None);

        fx.open_mega(1);
        let RecordOutcome::Completed { report, .. } = record(&engine, &mega_draw("08002", &MISS)) else {
            panic!("single-draw cycle should complete");
        };
        let evaluation = report.unwrap().evaluation.unwrap();
        assert_eq!(evaluation.metrics.cycle_numbers, vec![2, 1]);
        assert_eq!(evaluation.metrics.successes, 1);
        assert_eq!(evaluation.verdict, Verdict::Pass);
    }

    #[test]
    fn test_delivery_failure_marks_entry_failed() {
        let fx = Fixture::new();
        fx.open_mega(1);
        let engine = CycleEngine::new(&fx.conn, &fx.config, &fx.notifier, &FailingBackend);
        let RecordOutcome::Completed { cycle, report, .. } = record(&engine, &mega_draw("09001", &MISS)) else {
            panic!("single-draw cycle should complete");
        };
        assert!(matches!(report.unwrap().outcome, TriggerOutcome::DeliveryFailed { .. }));
        let logs = db::training_logs_for_cycle(&fx.conn, cycle.id).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, TrainingStatus::Failed);
    }

    #[test]
    fn test_reconcile_after_trigger() {
        let fx = Fixture::new();
        fx.open_mega(1);
        let RecordOutcome::Completed { report, .. } = record(&fx.engine(), &mega_draw("10001", &MISS)) else {
            panic!("single-draw cycle should complete");
        };
        let TriggerOutcome::Triggered { log_id, .. } = report.unwrap().outcome else {
            panic!("a miss should trigger recalibration");
        };
        let outcome = TrainingOutcome { success: false, params_after: None, message: Some("diverged".into()) };
        assert_eq!(reconcile(&fx.conn, log_id, &outcome).unwrap(), Reconciliation::Resolved(TrainingStatus::Failed));
        assert_eq!(
            reconcile(&fx.conn, log_id, &outcome).unwrap(),
            Reconciliation::AlreadyResolved(TrainingStatus::Failed)
        );
    }

    #[test]
    fn test_plan_max_draws_follows_previous_cycle() {
        let fx = Fixture::new();
        let engine = fx.engine();
        assert_eq!(engine.plan_max_draws("mega_645").unwrap(), 5);

        fx.open_mega(2);
        record(&engine, &mega_draw("11001", &MISS));
        record(&engine, &mega_draw("11002", &MISS));
        assert_eq!(engine.plan_max_draws("mega_645").unwrap(), 3);

        fx.open_mega(2);
        record(&engine, &mega_draw("11003", &MISS));
        record(&engine, &mega_draw("11004", &THREE));
        assert_eq!(engine.plan_max_draws("mega_645").unwrap(), 5);

        // lotto_535 runs longer cycles.
        assert_eq!(engine.plan_max_draws("lotto_535").unwrap(), 10);
    }

    #[test]
    fn test_delete_cycle_cascades() {
        let fx = Fixture::new();
        fx.open_mega(1);
        let engine = fx.engine();
        let RecordOutcome::Completed { cycle, .. } = record(&engine, &mega_draw("12001", &MISS)) else {
            panic!("single-draw cycle should complete");
        };
        engine.delete_cycle(cycle.id).unwrap();
        assert!(db::fetch_cycle(&fx.conn, cycle.id).unwrap().is_none());
        assert!(db::fetch_prediction(&fx.conn, cycle.id).unwrap().is_none());
        assert!(db::match_results_for_cycle(&fx.conn, cycle.id).unwrap().is_empty());

        let logs = db::fetch_training_logs(&fx.conn, Some("mega_645"), 10).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].cycle_id, None);
        assert!(matches!(engine.delete_cycle(cycle.id), Err(EngineError::CycleNotFound(_))));
    }

    #[test]
    fn test_schema_rejection_maps_to_conflict() {
        let fx = Fixture::new();
        fx.open_mega(5);
        let err = db::insert_cycle(&fx.conn, "mega_645", 2, 5, "3.1", Utc::now()).unwrap_err();
        assert!(is_constraint_violation(&err));
        assert!(!is_constraint_violation(&rusqlite::Error::QueryReturnedNoRows));
        assert_eq!(fx.active_count("mega_645"), 1);
    }

    #[test]
    fn test_full_cycle_refuses_draw_and_rolls_back() {
        let fx = Fixture::new();
        let cycle = fx.open_mega(2);
        fx.conn
            .execute("UPDATE cycles SET draws_tracked = max_draws WHERE id = ?1", [cycle.id])
            .unwrap();

        let draw = normalize_draw(fx.config.variant("mega_645").unwrap(), &mega_draw("13001", &THREE)).unwrap();
        let err = fx.engine().record_draw("mega_645", &draw).unwrap_err();
        assert!(matches!(err, EngineError::CycleClosed(id) if id == cycle.id));
        assert!(db::match_results_for_cycle(&fx.conn, cycle.id).unwrap().is_empty());
        assert_eq!(fx.notifier.names(), vec!["cycle_opened"]);
    }

    #[test]
    fn test_two_connections_race_on_one_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lecycle.db");
        db::migrate(&db::open_db(&path).unwrap()).unwrap();

        let config = EngineConfig::default();
        let draw = normalize_draw(config.variant("mega_645").unwrap(), &mega_draw("14001", &THREE)).unwrap();
        let barrier = std::sync::Barrier::new(2);

        let runs: Vec<(Result<Cycle>, Result<RecordOutcome>)> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..2)
                .map(|i| {
                    let (path, config, draw, barrier) = (&path, &config, &draw, &barrier);
                    scope.spawn(move || {
                        let conn = db::open_db(path).unwrap();
                        let notifier = RecordingNotifier::default();
                        let backend = RecordingBackend::default();
                        let engine = CycleEngine::new(&conn, config, &notifier, &backend);
                        let prediction = RawPrediction { numbers: PICK.to_vec(), special: None };
                        barrier.wait();
                        let opened = engine.open_cycle("mega_645", &prediction, 5, &format!("3.{i}"));
                        barrier.wait();
                        let recorded = engine.record_draw("mega_645", draw);
                        (opened, recorded)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let opened: Vec<_> = runs.iter().filter_map(|(o, _)| o.as_ref().ok()).collect();
        assert_eq!(opened.len(), 1);
        assert!(runs
            .iter()
            .any(|(o, _)| matches!(o, Err(EngineError::Conflict { cycle_number: 1, .. }))));

        let outcomes: Vec<&RecordOutcome> = runs.iter().map(|(_, r)| r.as_ref().unwrap()).collect();
        assert_eq!(outcomes.iter().filter(|o| matches!(o, RecordOutcome::Matched { .. })).count(), 1);
        assert_eq!(outcomes.iter().filter(|o| matches!(o, RecordOutcome::Duplicate { .. })).count(), 1);

        let conn = db::open_db(&path).unwrap();
        let cycle_id = opened[0].id;
        assert_eq!(db::count_active_cycles(&conn, "mega_645").unwrap(), 1);
        assert_eq!(db::match_results_for_cycle(&conn, cycle_id).unwrap().len(), 1);
        assert_eq!(db::fetch_cycle(&conn, cycle_id).unwrap().unwrap().draws_tracked, 1);
    }
}
