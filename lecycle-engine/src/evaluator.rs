use serde::{Deserialize, Serialize};

use lecycle_db::models::{Cycle, MatchResult};

use crate::config::{EvaluationPolicy, SuccessMetric};
use crate::error::EvaluationError;

const TREND_EPSILON: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub cycle_id: i64,
    pub cycle_number: u32,
    pub model_version: String,
    /// matched_count of each scored draw, in position order.
    pub matched_counts: Vec<u8>,
    pub special_hits: u32,
}

impl CycleSummary {
    pub fn from_results(cycle: &Cycle, results: &[MatchResult]) -> Self {
        let mut ordered: Vec<&MatchResult> = results.iter().collect();
        ordered.sort_by_key(|r| r.position);
        Self {
            cycle_id: cycle.id,
            cycle_number: cycle.cycle_number,
            model_version: cycle.model_version.clone(),
            matched_counts: ordered.iter().map(|r| r.matched_count).collect(),
            special_hits: ordered.iter().filter(|r| r.special_matched).count() as u32,
        }
    }

    pub fn draws(&self) -> usize {
        self.matched_counts.len()
    }

    pub fn best_match(&self) -> u8 {
        self.matched_counts.iter().copied().max().unwrap_or(0)
    }

    pub fn total_matched(&self) -> u32 {
        self.matched_counts.iter().map(|&c| c as u32).sum()
    }

    pub fn mean_matched(&self) -> f64 {
        if self.matched_counts.is_empty() {
            0.0
        } else {
            self.total_matched() as f64 / self.matched_counts.len() as f64
        }
    }

    pub fn hits_at(&self, threshold: u32) -> u32 {
        self.matched_counts.iter().filter(|&&c| c as u32 >= threshold).count() as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Improving,
    Declining,
    Stable,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowMetrics {
    pub cycle_numbers: Vec<u32>,
    pub successes: usize,
    pub success_rate: f64,
    pub min_success_rate: f64,
    pub match_threshold: u32,
    /// Mean matched_count per draw across the window.
    pub mean_matched: f64,
    pub previous_mean: Option<f64>,
    pub trend: Trend,
    pub current_best_match: u8,
    pub current_hits: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub verdict: Verdict,
    pub reason: String,
    pub metrics: WindowMetrics,
}

pub fn is_success(policy: &EvaluationPolicy, summary: &CycleSummary) -> bool {
    let threshold = policy.match_threshold;
    match policy.metric {
        SuccessMetric::BestDraw => summary.best_match() as u32 >= threshold,
        SuccessMetric::Cumulative => summary.total_matched() >= threshold,
        SuccessMetric::DrawsAtThreshold { min_draws } => summary.hits_at(threshold) >= min_draws,
    }
}

fn mean_per_draw(cycles: &[&CycleSummary]) -> Option<f64> {
    let draws: usize = cycles.iter().map(|c| c.draws()).sum();
    if draws == 0 {
        return None;
    }
    let total: u32 = cycles.iter().map(|c| c.total_matched()).sum();
    Some(total as f64 / draws as f64)
}

/// `history` holds earlier completed cycles of the same variant, most recent
/// first. It may be longer than the window: the surplus feeds the trend.
pub fn evaluate(
    policy: &EvaluationPolicy,
    current: &CycleSummary,
    history: &[CycleSummary],
) -> Result<Evaluation, EvaluationError> {
    if current.draws() == 0 {
        return Err(EvaluationError::EmptyCycle(current.cycle_number));
    }

    let earlier = policy.window.saturating_sub(1).min(history.len());
    let window: Vec<&CycleSummary> = std::iter::once(current).chain(history[..earlier].iter()).collect();
    if window.len() < policy.min_history {
        return Err(EvaluationError::InsufficientHistory {
            available: window.len(),
            required: policy.min_history,
        });
    }

    let successes = window.iter().filter(|c| is_success(policy, c)).count();
    let success_rate = successes as f64 / window.len() as f64;
    let mean_matched = mean_per_draw(&window).unwrap_or(0.0);

    let previous: Vec<&CycleSummary> = history[earlier..].iter().take(policy.window).collect();
    let previous_mean = mean_per_draw(&previous);
    let trend = match previous_mean {
        None => Trend::Unknown,
        Some(prev) if mean_matched > prev + TREND_EPSILON => Trend::Improving,
        Some(prev) if mean_matched < prev - TREND_EPSILON => Trend::Declining,
        Some(_) => Trend::Stable,
    };

    let verdict = if success_rate < policy.min_success_rate {
        Verdict::Fail
    } else {
        Verdict::Pass
    };
    let reason = format!(
        "{}/{} cycle(s) reached {} matches (rate {:.2} {} minimum {:.2})",
        successes,
        window.len(),
        policy.match_threshold,
        success_rate,
        if verdict == Verdict::Fail { "<" } else { ">=" },
        policy.min_success_rate,
    );

    Ok(Evaluation {
        verdict,
        reason,
        metrics: WindowMetrics {
            cycle_numbers: window.iter().map(|c| c.cycle_number).collect(),
            successes,
            success_rate,
            min_success_rate: policy.min_success_rate,
            match_threshold: policy.match_threshold,
            mean_matched,
            previous_mean,
            trend,
            current_best_match: current.best_match(),
            current_hits: current.hits_at(policy.match_threshold),
        },
    })
}
