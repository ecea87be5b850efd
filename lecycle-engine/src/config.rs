use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumberRange {
    pub min: u8,
    pub max: u8,
}

impl NumberRange {
    pub const fn new(min: u8, max: u8) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, n: u8) -> bool {
        n >= self.min && n <= self.max
    }

    pub fn size(&self) -> usize {
        if self.max < self.min {
            0
        } else {
            (self.max - self.min) as usize + 1
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialRequirement {
    #[default]
    Any,
    Required,
}

/// One row of a prize table: at least `min_main` main numbers matched, plus
/// the special number when `special` is `Required`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrizeRule {
    pub label: String,
    pub min_main: u8,
    #[serde(default)]
    pub special: SpecialRequirement,
}

impl PrizeRule {
    pub fn new(label: &str, min_main: u8, special: SpecialRequirement) -> Self {
        Self { label: label.to_string(), min_main, special }
    }

    pub fn is_satisfied(&self, matched_count: u8, special_matched: bool) -> bool {
        matched_count >= self.min_main
            && (self.special == SpecialRequirement::Any || special_matched)
    }

    /// True when every match satisfying `other` also satisfies `self`.
    fn covers(&self, other: &PrizeRule) -> bool {
        self.min_main <= other.min_main
            && (self.special == SpecialRequirement::Any || other.special == SpecialRequirement::Required)
    }
}

/// Prize rules ordered highest tier first. The first satisfied rule wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrizeTable {
    pub rules: Vec<PrizeRule>,
    pub no_prize: String,
}

impl PrizeTable {
    pub fn resolve(&self, matched_count: u8, special_matched: bool) -> &str {
        self.rules
            .iter()
            .find(|rule| rule.is_satisfied(matched_count, special_matched))
            .map(|rule| rule.label.as_str())
            .unwrap_or(&self.no_prize)
    }

    /// 0 is the top tier; the no-prize floor ranks after every rule.
    pub fn rank(&self, label: &str) -> Option<usize> {
        if label == self.no_prize {
            return Some(self.rules.len());
        }
        self.rules.iter().position(|rule| rule.label == label)
    }

    fn validate(&self, arity: u8, has_special: bool) -> std::result::Result<(), String> {
        let mut labels = HashSet::new();
        for (i, rule) in self.rules.iter().enumerate() {
            if rule.label.is_empty() {
                return Err(format!("prize rule #{} has an empty label", i + 1));
            }
            if !labels.insert(rule.label.as_str()) || rule.label == self.no_prize {
                return Err(format!("prize label '{}' is used twice", rule.label));
            }
            if rule.min_main > arity {
                return Err(format!("prize '{}' needs {} matches but arity is {}", rule.label, rule.min_main, arity));
            }
            if rule.special == SpecialRequirement::Required && !has_special {
                return Err(format!("prize '{}' requires a special number the variant does not draw", rule.label));
            }
            if let Some(earlier) = self.rules[..i].iter().find(|earlier| earlier.covers(rule)) {
                return Err(format!("prize '{}' can never be reached after '{}'", rule.label, earlier.label));
            }
        }
        if self.no_prize.is_empty() {
            return Err("no-prize label is empty".to_string());
        }
        Ok(())
    }
}

/// Dynamic cycle length: a cycle following one with at least one draw at
/// `hit_threshold` matches runs `long` draws, otherwise `short`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleLengthPolicy {
    pub long: u32,
    pub short: u32,
    pub hit_threshold: u8,
}

impl Default for CycleLengthPolicy {
    fn default() -> Self {
        Self { long: 5, short: 3, hit_threshold: 3 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantConfig {
    pub id: String,
    pub label: String,
    pub main_count: u8,
    pub main_range: NumberRange,
    #[serde(default)]
    pub special: Option<NumberRange>,
    /// Session tags for variants drawn several times a day. Empty means a
    /// single daily draw without a tag.
    #[serde(default)]
    pub sessions: Vec<String>,
    #[serde(default)]
    pub cycle_length: CycleLengthPolicy,
    pub prize_table: PrizeTable,
}

impl VariantConfig {
    pub fn power_655() -> Self {
        use SpecialRequirement::*;
        Self {
            id: "power_655".to_string(),
            label: "Power 6/55".to_string(),
            main_count: 6,
            main_range: NumberRange::new(1, 55),
            special: Some(NumberRange::new(1, 55)),
            sessions: Vec::new(),
            cycle_length: CycleLengthPolicy::default(),
            prize_table: PrizeTable {
                rules: vec![
                    PrizeRule::new("jackpot_1", 6, Any),
                    PrizeRule::new("jackpot_2", 5, Required),
                    PrizeRule::new("first", 5, Any),
                    PrizeRule::new("second", 4, Any),
                    PrizeRule::new("third", 3, Any),
                ],
                no_prize: "none".to_string(),
            },
        }
    }

    pub fn mega_645() -> Self {
        use SpecialRequirement::*;
        Self {
            id: "mega_645".to_string(),
            label: "Mega 6/45".to_string(),
            main_count: 6,
            main_range: NumberRange::new(1, 45),
            special: None,
            sessions: Vec::new(),
            cycle_length: CycleLengthPolicy::default(),
            prize_table: PrizeTable {
                rules: vec![
                    PrizeRule::new("jackpot", 6, Any),
                    PrizeRule::new("first", 5, Any),
                    PrizeRule::new("second", 4, Any),
                    PrizeRule::new("third", 3, Any),
                ],
                no_prize: "none".to_string(),
            },
        }
    }

    pub fn lotto_535() -> Self {
        use SpecialRequirement::*;
        Self {
            id: "lotto_535".to_string(),
            label: "Lotto 5/35".to_string(),
            main_count: 5,
            main_range: NumberRange::new(1, 35),
            special: Some(NumberRange::new(1, 12)),
            sessions: vec!["AM".to_string(), "PM".to_string()],
            cycle_length: CycleLengthPolicy { long: 10, short: 5, hit_threshold: 3 },
            prize_table: PrizeTable {
                rules: vec![
                    PrizeRule::new("jackpot_1", 5, Required),
                    PrizeRule::new("jackpot_2", 5, Any),
                    PrizeRule::new("first", 4, Required),
                    PrizeRule::new("second", 4, Any),
                    PrizeRule::new("third", 3, Required),
                    PrizeRule::new("fourth", 3, Any),
                    PrizeRule::new("fifth", 2, Required),
                    PrizeRule::new("consolation", 0, Required),
                ],
                no_prize: "none".to_string(),
            },
        }
    }

    pub fn has_special(&self) -> bool {
        self.special.is_some()
    }

    pub fn has_sessions(&self) -> bool {
        !self.sessions.is_empty()
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.id.is_empty() {
            return Err("variant id is empty".to_string());
        }
        if self.main_count == 0 {
            return Err(format!("{}: main_count must be positive", self.id));
        }
        if self.main_range.size() < self.main_count as usize {
            return Err(format!(
                "{}: range {}..={} cannot hold {} distinct numbers",
                self.id, self.main_range.min, self.main_range.max, self.main_count
            ));
        }
        if let Some(special) = self.special {
            if special.size() == 0 {
                return Err(format!("{}: empty special range", self.id));
            }
        }
        let mut sessions = HashSet::new();
        if self.sessions.iter().any(|s| s.is_empty() || !sessions.insert(s)) {
            return Err(format!("{}: session tags must be unique and non-empty", self.id));
        }
        let length = &self.cycle_length;
        if length.long == 0 || length.short == 0 {
            return Err(format!("{}: cycle lengths must be positive", self.id));
        }
        if length.hit_threshold > self.main_count {
            return Err(format!("{}: hit threshold exceeds arity", self.id));
        }
        self.prize_table
            .validate(self.main_count, self.has_special())
            .map_err(|e| format!("{}: {}", self.id, e))
    }
}

/// How a single cycle counts as a success inside the evaluation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SuccessMetric {
    /// The best single draw reached the threshold.
    BestDraw,
    /// Matched counts summed over the whole cycle reached the threshold.
    Cumulative,
    /// At least `min_draws` draws reached the threshold.
    DrawsAtThreshold { min_draws: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationPolicy {
    /// Number of completed cycles in the window, current one included.
    pub window: usize,
    /// Fewer completed cycles than this and no verdict is produced.
    pub min_history: usize,
    pub match_threshold: u32,
    pub metric: SuccessMetric,
    pub min_success_rate: f64,
}

impl Default for EvaluationPolicy {
    fn default() -> Self {
        Self {
            window: 1,
            min_history: 1,
            match_threshold: 3,
            metric: SuccessMetric::DrawsAtThreshold { min_draws: 1 },
            min_success_rate: 1.0,
        }
    }
}

impl EvaluationPolicy {
    /// Earlier cycles needed for the current window plus the one before it.
    pub fn history_depth(&self) -> usize {
        (2 * self.window).saturating_sub(1)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.window == 0 {
            return Err("evaluation window must be positive".to_string());
        }
        if self.min_history == 0 || self.min_history > self.window {
            return Err(format!("min_history must be within 1..={}", self.window));
        }
        if !(0.0..=1.0).contains(&self.min_success_rate) {
            return Err(format!("min_success_rate {} outside [0, 1]", self.min_success_rate));
        }
        if let SuccessMetric::DrawsAtThreshold { min_draws: 0 } = self.metric {
            return Err("draws_at_threshold needs min_draws >= 1".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub variants: Vec<VariantConfig>,
    #[serde(default)]
    pub evaluation: EvaluationPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            variants: vec![
                VariantConfig::power_655(),
                VariantConfig::mega_645(),
                VariantConfig::lotto_535(),
            ],
            evaluation: EvaluationPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&json)?;
        config.validate()?;
        log::debug!("loaded {} variant(s) from {}", config.variants.len(), path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.variants.is_empty() {
            return Err(EngineError::Config("no variant configured".to_string()));
        }
        let mut ids = HashSet::new();
        for variant in &self.variants {
            if !ids.insert(variant.id.as_str()) {
                return Err(EngineError::Config(format!("variant '{}' is defined twice", variant.id)));
            }
            variant.validate().map_err(EngineError::Config)?;
        }
        self.evaluation.validate().map_err(EngineError::Config)
    }

    pub fn variant(&self, id: &str) -> Result<&VariantConfig> {
        self.variants
            .iter()
            .find(|v| v.id == id)
            .ok_or_else(|| EngineError::UnknownVariant(id.to_string()))
    }
}
