use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeSet;

use lecycle_db::models::{DrawRecord, MatchResult, Prediction};

use crate::config::PrizeTable;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchScore {
    pub draw_id: String,
    pub session: Option<String>,
    pub draw_date: NaiveDate,
    pub predicted_numbers: Vec<u8>,
    pub predicted_special: Option<u8>,
    pub actual_numbers: Vec<u8>,
    pub actual_special: Option<u8>,
    pub matched_numbers: Vec<u8>,
    pub matched_count: u8,
    pub special_matched: bool,
    pub prize_level: String,
}

impl MatchScore {
    pub fn into_result(self, cycle_id: i64, position: u32, matched_at: DateTime<Utc>) -> MatchResult {
        MatchResult {
            cycle_id,
            draw_id: self.draw_id,
            session: self.session,
            draw_date: self.draw_date,
            position,
            predicted_numbers: self.predicted_numbers,
            predicted_special: self.predicted_special,
            actual_numbers: self.actual_numbers,
            actual_special: self.actual_special,
            matched_numbers: self.matched_numbers,
            matched_count: self.matched_count,
            special_matched: self.special_matched,
            prize_level: self.prize_level,
            matched_at,
        }
    }
}

/// Ascending intersection of two number sets.
pub fn matched_numbers(predicted: &[u8], actual: &[u8]) -> Vec<u8> {
    let actual: BTreeSet<u8> = actual.iter().copied().collect();
    predicted
        .iter()
        .copied()
        .collect::<BTreeSet<u8>>()
        .intersection(&actual)
        .copied()
        .collect()
}

/// Both sides must carry a special number for it to match.
pub fn special_matched(predicted: Option<u8>, actual: Option<u8>) -> bool {
    matches!((predicted, actual), (Some(p), Some(a)) if p == a)
}

pub fn score(table: &PrizeTable, prediction: &Prediction, draw: &DrawRecord) -> MatchScore {
    let matched = matched_numbers(&prediction.numbers, &draw.numbers);
    let matched_count = matched.len() as u8;
    let special = special_matched(prediction.special, draw.special);
    let prize_level = table.resolve(matched_count, special).to_string();

    MatchScore {
        draw_id: draw.draw_id.clone(),
        session: draw.session.clone(),
        draw_date: draw.date,
        predicted_numbers: prediction.numbers.clone(),
        predicted_special: prediction.special,
        actual_numbers: draw.numbers.clone(),
        actual_special: draw.special,
        matched_numbers: matched,
        matched_count,
        special_matched: special,
        prize_level,
    }
}

/// Tier a stored match would get under `table`, from its persisted counts.
pub fn replay_tier<'t>(table: &'t PrizeTable, result: &MatchResult) -> &'t str {
    table.resolve(result.matched_count, result.special_matched)
}
