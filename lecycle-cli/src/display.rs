use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};

use crate::import::ImportResult;
use lecycle_db::models::{
    format_numbers, Cycle, CycleStatus, DrawRecord, MatchResult, Prediction, TrainingLogEntry, TrainingStatus,
};
use lecycle_engine::config::VariantConfig;
use lecycle_engine::cycle::{IngestOutcome, RecordOutcome};
use lecycle_engine::evaluator::{Trend, Verdict};
use lecycle_engine::trigger::{EvaluationReport, TriggerOutcome};

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

fn special_str(special: Option<u8>) -> String {
    special.map(|s| format!("{:02}", s)).unwrap_or_else(|| "—".to_string())
}

pub fn display_variants(variants: &[VariantConfig]) {
    let mut table = new_table(vec!["Variante", "Nom", "Numéros", "Spécial", "Sessions", "Cycle (long/court)", "Rangs"]);
    for v in variants {
        let special = v
            .special
            .map(|r| format!("{}..={}", r.min, r.max))
            .unwrap_or_else(|| "—".to_string());
        let sessions = if v.has_sessions() { v.sessions.join("/") } else { "—".to_string() };
        let tiers = v.prize_table.rules.iter().map(|r| r.label.as_str()).collect::<Vec<_>>().join(", ");
        table.add_row(vec![
            v.id.clone(),
            v.label.clone(),
            format!("{} parmi {}..={}", v.main_count, v.main_range.min, v.main_range.max),
            special,
            sessions,
            format!("{}/{}", v.cycle_length.long, v.cycle_length.short),
            tiers,
        ]);
    }
    println!("{table}");
}

pub fn display_cycle_status(cycle: &Cycle, prediction: Option<&Prediction>, results: &[MatchResult]) {
    println!(
        "\n{} — cycle #{} ({}, modèle {}) : {}/{} tirages",
        cycle.variant, cycle.cycle_number, cycle.status, cycle.model_version, cycle.draws_tracked, cycle.max_draws
    );
    match prediction {
        Some(p) => println!("Prédiction : {}  spécial {}", format_numbers(&p.numbers), special_str(p.special)),
        None => println!("Prédiction : absente"),
    }
    display_match_results(results);
    if cycle.is_active() {
        println!("Encore {} tirage(s) avant la clôture.", cycle.draws_left());
    }
}

pub fn display_match_results(results: &[MatchResult]) {
    if results.is_empty() {
        println!("Aucun tirage suivi pour l'instant.");
        return;
    }
    let mut table = new_table(vec!["#", "Tirage", "Date", "Résultat", "Spécial", "Trouvés", "Rang"]);
    for r in results {
        let draw = match &r.session {
            Some(session) => format!("{} {}", r.draw_id, session),
            None => r.draw_id.clone(),
        };
        let special = if r.special_matched { "✓".to_string() } else { special_str(r.actual_special) };
        let color = if r.matched_count >= 3 { Color::Green } else { Color::White };
        table.add_row(vec![
            Cell::new(r.position),
            Cell::new(draw),
            Cell::new(r.draw_date.format("%d/%m/%Y")),
            Cell::new(format_numbers(&r.actual_numbers)),
            Cell::new(special),
            Cell::new(format!("{} ({})", r.matched_count, format_numbers(&r.matched_numbers))).fg(color),
            Cell::new(&r.prize_level),
        ]);
    }
    println!("{table}");
}

pub fn display_cycles(cycles: &[Cycle]) {
    if cycles.is_empty() {
        println!("Aucun cycle enregistré.");
        return;
    }
    let mut table = new_table(vec!["Id", "Variante", "Cycle", "Statut", "Tirages", "Modèle", "Ouvert", "Évalué"]);
    for c in cycles {
        let status_color = match c.status {
            CycleStatus::Active => Color::Cyan,
            CycleStatus::Completed => Color::White,
        };
        let evaluated = c
            .evaluated_at
            .map(|t| t.format("%d/%m/%Y %H:%M").to_string())
            .unwrap_or_else(|| "—".to_string());
        table.add_row(vec![
            Cell::new(c.id),
            Cell::new(&c.variant),
            Cell::new(format!("#{}", c.cycle_number)),
            Cell::new(c.status).fg(status_color),
            Cell::new(format!("{}/{}", c.draws_tracked, c.max_draws)),
            Cell::new(&c.model_version),
            Cell::new(c.created_at.format("%d/%m/%Y %H:%M")),
            Cell::new(evaluated),
        ]);
    }
    println!("{table}");
}

pub fn display_draws(draws: &[DrawRecord]) {
    if draws.is_empty() {
        println!("Aucun tirage à afficher.");
        return;
    }
    let mut table = new_table(vec!["Tirage", "Date", "Session", "Numéros", "Spécial"]);
    for d in draws {
        table.add_row(vec![
            d.draw_id.clone(),
            d.date.format("%d/%m/%Y").to_string(),
            d.session.clone().unwrap_or_else(|| "—".to_string()),
            format_numbers(&d.numbers),
            special_str(d.special),
        ]);
    }
    println!("{table}");
}

pub fn display_ingest_outcome(outcome: &IngestOutcome) {
    match outcome {
        IngestOutcome::Untracked { draw, stored } => {
            println!(
                "Tirage {} {} ; aucun cycle actif pour {}.",
                draw.draw_id,
                if *stored { "enregistré" } else { "déjà connu" },
                draw.variant
            );
        }
        IngestOutcome::Predates { draw, cycle_number } => {
            println!(
                "Tirage {} déjà connu avant l'ouverture du cycle #{} ; non compté.",
                draw.draw_id, cycle_number
            );
        }
        IngestOutcome::Recorded { outcome, .. } => display_record_outcome(outcome),
    }
}

pub fn display_record_outcome(outcome: &RecordOutcome) {
    match outcome {
        RecordOutcome::Duplicate { cycle } => {
            println!("Tirage déjà compté dans le cycle #{} (doublon ignoré).", cycle.cycle_number);
        }
        RecordOutcome::Matched { cycle, result } => {
            println!(
                "Cycle #{} : tirage {}/{}, {} numéro(s) trouvé(s), rang {}.",
                cycle.cycle_number, result.position, cycle.max_draws, result.matched_count, result.prize_level
            );
        }
        RecordOutcome::Completed { cycle, result, report } => {
            println!(
                "Cycle #{} terminé : dernier tirage {} numéro(s) trouvé(s), rang {}.",
                cycle.cycle_number, result.matched_count, result.prize_level
            );
            match report {
                Some(report) => display_reports(std::slice::from_ref(report)),
                None => println!("Évaluation reportée ; relancez `lecycle sweep`."),
            }
        }
    }
}

pub fn display_reports(reports: &[EvaluationReport]) {
    if reports.is_empty() {
        println!("Aucun cycle en attente d'évaluation.");
        return;
    }
    let mut table = new_table(vec!["Variante", "Cycle", "Verdict", "Taux", "Tendance", "Suite", "Motif"]);
    for r in reports {
        let (verdict, rate, trend, reason) = match &r.evaluation {
            Some(ev) => (
                match ev.verdict {
                    Verdict::Pass => Cell::new("pass").fg(Color::Green),
                    Verdict::Fail => Cell::new("fail").fg(Color::Red),
                },
                format!("{:.2} (min {:.2})", ev.metrics.success_rate, ev.metrics.min_success_rate),
                trend_str(ev.metrics.trend).to_string(),
                ev.reason.clone(),
            ),
            None => (Cell::new("—"), "—".to_string(), "—".to_string(), "pas de verdict".to_string()),
        };
        let outcome = match &r.outcome {
            TriggerOutcome::Skipped { log_id, .. } => format!("conservé (log {log_id})"),
            TriggerOutcome::Triggered { log_id, job_ref } => format!("recalibrage {job_ref} (log {log_id})"),
            TriggerOutcome::DeliveryFailed { log_id, error } => format!("échec d'envoi (log {log_id}) : {error}"),
            TriggerOutcome::AlreadyEvaluated => "déjà évalué".to_string(),
        };
        table.add_row(vec![
            Cell::new(&r.variant),
            Cell::new(format!("#{}", r.cycle_number)),
            verdict,
            Cell::new(rate),
            Cell::new(trend),
            Cell::new(outcome),
            Cell::new(reason),
        ]);
    }
    println!("{table}");
}

fn trend_str(trend: Trend) -> &'static str {
    match trend {
        Trend::Improving => "↗ en hausse",
        Trend::Declining => "↘ en baisse",
        Trend::Stable => "→ stable",
        Trend::Unknown => "?",
    }
}

pub fn display_training_logs(logs: &[TrainingLogEntry]) {
    if logs.is_empty() {
        println!("Journal d'entraînement vide.");
        return;
    }
    let mut table = new_table(vec!["Id", "Variante", "Cycle", "Statut", "Job", "Motif", "Créé", "Résolu"]);
    for log in logs {
        let color = match log.status {
            TrainingStatus::Triggered => Color::Yellow,
            TrainingStatus::Success => Color::Green,
            TrainingStatus::Failed => Color::Red,
            TrainingStatus::Skipped => Color::White,
        };
        let reason = match &log.message {
            Some(message) => format!("{} [{}]", log.trigger_reason, message),
            None => log.trigger_reason.clone(),
        };
        table.add_row(vec![
            Cell::new(log.id),
            Cell::new(&log.variant),
            Cell::new(log.cycle_id.map(|id| id.to_string()).unwrap_or_else(|| "—".to_string())),
            Cell::new(log.status).fg(color),
            Cell::new(log.job_ref.as_deref().unwrap_or("—")),
            Cell::new(reason),
            Cell::new(log.created_at.format("%d/%m/%Y %H:%M")),
            Cell::new(
                log.resolved_at
                    .map(|t| t.format("%d/%m/%Y %H:%M").to_string())
                    .unwrap_or_else(|| "—".to_string()),
            ),
        ]);
    }
    println!("{table}");
}

pub fn display_import_summary(result: &ImportResult) {
    println!("Import terminé :");
    println!("  Total lignes lues : {}", result.total_records);
    println!("  Insérés           : {}", result.inserted);
    println!("  Doublons ignorés  : {}", result.skipped);
    if result.errors > 0 {
        println!("  Erreurs           : {}", result.errors);
    }
}
