use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use lecycle_db::models::{DrawRecord, NewPrediction};

use crate::config::VariantConfig;
use crate::error::ValidationError;

/// Draw fields as supplied by a feed, a CSV line or the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDraw {
    pub draw_id: String,
    pub date: String,
    pub session: Option<String>,
    pub numbers: Vec<u8>,
    pub special: Option<u8>,
}

/// A finished prediction as handed over by the predictor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPrediction {
    pub numbers: Vec<u8>,
    pub special: Option<u8>,
}

pub fn normalize_draw(variant: &VariantConfig, raw: &RawDraw) -> Result<DrawRecord, ValidationError> {
    let draw_id = raw.draw_id.trim();
    if draw_id.is_empty() {
        return Err(ValidationError::EmptyDrawId);
    }
    let date = parse_draw_date(&raw.date)?;
    let session = check_session(variant, raw.session.as_deref())?;
    let numbers = check_main_numbers(variant, &raw.numbers)?;
    let special = check_special(variant, raw.special, &numbers, true)?;

    Ok(DrawRecord {
        variant: variant.id.clone(),
        draw_id: draw_id.to_string(),
        date,
        session,
        numbers,
        special,
    })
}

/// Predictions follow the draw rules, except that the special number stays
/// optional even when the variant draws one.
pub fn normalize_prediction(
    variant: &VariantConfig,
    raw: &RawPrediction,
    model_version: &str,
) -> Result<NewPrediction, ValidationError> {
    let model_version = model_version.trim();
    if model_version.is_empty() {
        return Err(ValidationError::EmptyModelVersion);
    }
    let numbers = check_main_numbers(variant, &raw.numbers)?;
    let special = check_special(variant, raw.special, &numbers, false)?;
    Ok(NewPrediction {
        numbers,
        special,
        model_version: model_version.to_string(),
    })
}

/// Accepts `YYYY-MM-DD` and the `DD/MM/YYYY` form used by published results.
pub fn parse_draw_date(raw: &str) -> Result<NaiveDate, ValidationError> {
    let s = raw.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(s, "%d/%m/%Y"))
        .map_err(|_| ValidationError::InvalidDate(raw.to_string()))
}

fn check_main_numbers(variant: &VariantConfig, raw: &[u8]) -> Result<Vec<u8>, ValidationError> {
    if raw.len() != variant.main_count as usize {
        return Err(ValidationError::Arity {
            expected: variant.main_count,
            actual: raw.len(),
        });
    }
    let range = variant.main_range;
    if let Some(&n) = raw.iter().find(|&&n| !range.contains(n)) {
        return Err(ValidationError::MainOutOfRange { number: n, min: range.min, max: range.max });
    }
    let mut sorted = raw.to_vec();
    sorted.sort_unstable();
    if let Some(pair) = sorted.windows(2).find(|w| w[0] == w[1]) {
        return Err(ValidationError::DuplicateMain(pair[0]));
    }
    Ok(sorted)
}

fn check_special(
    variant: &VariantConfig,
    special: Option<u8>,
    mains: &[u8],
    required: bool,
) -> Result<Option<u8>, ValidationError> {
    match (variant.special, special) {
        (None, None) => Ok(None),
        (None, Some(_)) => Err(ValidationError::UnexpectedSpecial(variant.id.clone())),
        (Some(_), None) if required => Err(ValidationError::MissingSpecial(variant.id.clone())),
        (Some(_), None) => Ok(None),
        (Some(range), Some(n)) => {
            if !range.contains(n) {
                return Err(ValidationError::SpecialOutOfRange { number: n, min: range.min, max: range.max });
            }
            if mains.contains(&n) {
                return Err(ValidationError::SpecialOverlapsMain(n));
            }
            Ok(Some(n))
        }
    }
}

fn check_session(variant: &VariantConfig, session: Option<&str>) -> Result<Option<String>, ValidationError> {
    let session = session.map(str::trim).filter(|s| !s.is_empty());
    match session {
        None if variant.has_sessions() => Err(ValidationError::MissingSession {
            variant: variant.id.clone(),
            allowed: variant.sessions.join("/"),
        }),
        None => Ok(None),
        Some(_) if !variant.has_sessions() => Err(ValidationError::UnexpectedSession(variant.id.clone())),
        Some(tag) => variant
            .sessions
            .iter()
            .find(|s| s.eq_ignore_ascii_case(tag))
            .map(|s| Some(s.clone()))
            .ok_or_else(|| ValidationError::UnknownSession {
                variant: variant.id.clone(),
                session: tag.to_string(),
            }),
    }
}
