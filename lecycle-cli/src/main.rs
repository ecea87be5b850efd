mod display;
mod import;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use lecycle_db::db::{
    active_cycle, count_draws, cycles_pending_evaluation, db_path, fetch_last_draws, fetch_prediction,
    fetch_training_logs, list_cycles, match_results_for_cycle, migrate, open_db,
};
use lecycle_db::rusqlite::Connection;
use lecycle_engine::config::EngineConfig;
use lecycle_engine::cycle::CycleEngine;
use lecycle_engine::normalizer::{RawDraw, RawPrediction};
use lecycle_engine::notify::LogNotifier;
use lecycle_engine::trigger::{reconcile, LogTrainingBackend, Reconciliation, TrainingOutcome};

use crate::display::{
    display_cycle_status, display_cycles, display_draws, display_import_summary, display_ingest_outcome,
    display_reports, display_training_logs, display_variants,
};
use crate::import::parse_numbers;

#[derive(Parser)]
#[command(name = "lecycle", about = "Suivi des cycles de prédiction et recalibrage des modèles")]
struct Cli {
    /// Chemin de la base SQLite (défaut : data/lecycle.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Fichier JSON de configuration des variantes
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Afficher le chemin de la base de données
    DbPath,

    /// Lister les variantes configurées
    Variants,

    /// Écrire la configuration par défaut dans un fichier JSON
    InitConfig {
        /// Fichier de sortie
        path: PathBuf,
    },

    /// Ouvrir un cycle avec une prédiction
    Open {
        /// Variante (ex: power_655)
        variant: String,

        /// Numéros prédits (ex: "05 08 18 30 39 54")
        #[arg(short, long)]
        numbers: String,

        /// Numéro spécial prédit
        #[arg(short, long)]
        special: Option<u8>,

        /// Version du modèle ayant produit la prédiction
        #[arg(short, long)]
        model: String,

        /// Nombre de tirages suivis (défaut : longueur dynamique)
        #[arg(long)]
        max_draws: Option<u32>,
    },

    /// Enregistrer un tirage publié et le comparer au cycle actif
    Ingest {
        variant: String,

        /// Identifiant du tirage
        #[arg(long)]
        id: String,

        /// Date (AAAA-MM-JJ ou JJ/MM/AAAA)
        #[arg(long)]
        date: String,

        /// Session (AM/PM) pour les variantes à deux tirages par jour
        #[arg(long)]
        session: Option<String>,

        /// Numéros tirés
        #[arg(short, long)]
        numbers: String,

        /// Numéro spécial tiré
        #[arg(short, long)]
        special: Option<u8>,
    },

    /// Importer l'historique des tirages depuis un fichier CSV
    Import {
        variant: String,

        /// Chemin vers le fichier CSV (draw_id;date;session;numbers;special)
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Lister les derniers tirages connus
    Draws {
        variant: String,

        #[arg(short, long, default_value = "10")]
        last: u32,
    },

    /// État du cycle actif
    Status {
        /// Variante (toutes si absente)
        variant: Option<String>,
    },

    /// Historique des cycles
    History {
        variant: Option<String>,

        #[arg(short, long, default_value = "10")]
        last: u32,
    },

    /// Évaluer les cycles terminés restés sans verdict
    Sweep {
        variant: Option<String>,
    },

    /// Clore le cycle actif avant son terme
    Reset {
        variant: String,

        /// Motif consigné dans le journal
        #[arg(short, long, default_value = "clôture manuelle")]
        reason: String,
    },

    /// Supprimer un cycle et ses résultats
    Delete {
        cycle_id: i64,
    },

    /// Journal des recalibrages
    Logs {
        variant: Option<String>,

        #[arg(short, long, default_value = "20")]
        last: u32,
    },

    /// Reporter le résultat d'un entraînement déclenché
    Reconcile {
        log_id: i64,

        /// L'entraînement a échoué
        #[arg(long)]
        failed: bool,

        /// Paramètres après entraînement (JSON)
        #[arg(long)]
        params: Option<String>,

        #[arg(short, long)]
        message: Option<String>,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let path = cli.db.unwrap_or_else(db_path);

    match &cli.command {
        Command::DbPath => {
            println!("{}", path.display());
            return Ok(());
        }
        Command::Variants => {
            display_variants(&config.variants);
            return Ok(());
        }
        Command::InitConfig { path } => {
            config.save(path).with_context(|| format!("Impossible d'écrire {:?}", path))?;
            println!("Configuration écrite dans {}", path.display());
            return Ok(());
        }
        _ => {}
    }

    let conn = open_db(&path)?;
    migrate(&conn)?;
    let notifier = LogNotifier;
    let trainer = LogTrainingBackend::default();
    let engine = CycleEngine::new(&conn, &config, &notifier, &trainer);

    match cli.command {
        Command::DbPath | Command::Variants | Command::InitConfig { .. } => Ok(()),
        Command::Open { variant, numbers, special, model, max_draws } => {
            cmd_open(&engine, &variant, &numbers, special, &model, max_draws)
        }
        Command::Ingest { variant, id, date, session, numbers, special } => {
            let raw = RawDraw {
                draw_id: id,
                date,
                session,
                numbers: parse_numbers(&numbers)?,
                special,
            };
            let outcome = engine.ingest_draw(&variant, &raw)?;
            display_ingest_outcome(&outcome);
            Ok(())
        }
        Command::Import { variant, file } => {
            let variant = config.variant(&variant)?;
            let result = import::import_csv(&conn, variant, &file)?;
            display_import_summary(&result);
            Ok(())
        }
        Command::Draws { variant, last } => cmd_draws(&conn, &config, &variant, last),
        Command::Status { variant } => cmd_status(&conn, &config, variant.as_deref()),
        Command::History { variant, last } => {
            display_cycles(&list_cycles(&conn, variant.as_deref(), last)?);
            Ok(())
        }
        Command::Sweep { variant } => {
            let ids = selected_variants(&config, variant.as_deref())?;
            let mut reports = Vec::new();
            for id in ids {
                reports.extend(engine.evaluate_pending(&id)?);
            }
            display_reports(&reports);
            Ok(())
        }
        Command::Reset { variant, reason } => {
            let reset = engine.reset_cycle(&variant, &reason)?;
            println!(
                "Cycle #{} clos après {}/{} tirages.",
                reset.cycle.cycle_number, reset.cycle.draws_tracked, reset.cycle.max_draws
            );
            match reset.report {
                Some(report) => display_reports(&[report]),
                None => println!("Évaluation reportée ; relancez `lecycle sweep`."),
            }
            Ok(())
        }
        Command::Delete { cycle_id } => {
            engine.delete_cycle(cycle_id)?;
            println!("Cycle {} supprimé.", cycle_id);
            Ok(())
        }
        Command::Logs { variant, last } => {
            display_training_logs(&fetch_training_logs(&conn, variant.as_deref(), last)?);
            Ok(())
        }
        Command::Reconcile { log_id, failed, params, message } => {
            cmd_reconcile(&conn, log_id, failed, params.as_deref(), message)
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path).with_context(|| format!("Configuration invalide : {:?}", path)),
        None => Ok(EngineConfig::default()),
    }
}

fn selected_variants(config: &EngineConfig, variant: Option<&str>) -> Result<Vec<String>> {
    match variant {
        Some(id) => Ok(vec![config.variant(id)?.id.clone()]),
        None => Ok(config.variants.iter().map(|v| v.id.clone()).collect()),
    }
}

fn cmd_open(
    engine: &CycleEngine,
    variant: &str,
    numbers: &str,
    special: Option<u8>,
    model: &str,
    max_draws: Option<u32>,
) -> Result<()> {
    let prediction = RawPrediction { numbers: parse_numbers(numbers)?, special };
    let max_draws = match max_draws {
        Some(n) => n,
        None => engine.plan_max_draws(variant)?,
    };
    let cycle = engine.open_cycle(variant, &prediction, max_draws, model)?;
    println!(
        "Cycle #{} ouvert pour {} : {} tirages, modèle {}.",
        cycle.cycle_number, cycle.variant, cycle.max_draws, cycle.model_version
    );
    Ok(())
}

fn cmd_draws(conn: &Connection, config: &EngineConfig, variant: &str, last: u32) -> Result<()> {
    let variant = config.variant(variant)?;
    if count_draws(conn, &variant.id)? == 0 {
        println!("Aucun tirage pour {}. Lancez d'abord : lecycle import {} --file …", variant.id, variant.id);
        return Ok(());
    }
    display_draws(&fetch_last_draws(conn, &variant.id, last)?);
    Ok(())
}

fn cmd_status(conn: &Connection, config: &EngineConfig, variant: Option<&str>) -> Result<()> {
    for id in selected_variants(config, variant)? {
        match active_cycle(conn, &id)? {
            Some(cycle) => {
                let prediction = fetch_prediction(conn, cycle.id)?;
                let results = match_results_for_cycle(conn, cycle.id)?;
                display_cycle_status(&cycle, prediction.as_ref(), &results);
            }
            None => println!("\n{} : aucun cycle actif.", id),
        }
        let pending = cycles_pending_evaluation(conn, &id)?;
        if !pending.is_empty() {
            println!("{} cycle(s) terminé(s) sans verdict ; lancez `lecycle sweep`.", pending.len());
        }
    }
    Ok(())
}

fn cmd_reconcile(
    conn: &Connection,
    log_id: i64,
    failed: bool,
    params: Option<&str>,
    message: Option<String>,
) -> Result<()> {
    let params_after = match params {
        Some(json) => Some(serde_json::from_str(json).context("Paramètres JSON invalides")?),
        None => None,
    };
    if failed && params_after.is_some() {
        bail!("--params n'a de sens que pour un entraînement réussi");
    }
    let outcome = TrainingOutcome { success: !failed, params_after, message };
    match reconcile(conn, log_id, &outcome)? {
        Reconciliation::Resolved(status) => println!("Entrée {} : {}.", log_id, status),
        Reconciliation::AlreadyResolved(status) => {
            println!("Entrée {} déjà résolue ({}), rien à faire.", log_id, status)
        }
    }
    Ok(())
}
