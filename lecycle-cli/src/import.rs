use anyhow::{bail, Context, Result};
use chrono::Utc;
use lecycle_db::rusqlite::Connection;
use std::path::Path;

use lecycle_db::db::insert_draw;
use lecycle_engine::config::VariantConfig;
use lecycle_engine::normalizer::{normalize_draw, RawDraw};

/// Splits "05 08 18", "05,08,18" or "05 - 08 - 18".
pub fn parse_numbers(s: &str) -> Result<Vec<u8>> {
    s.split(|c: char| c.is_whitespace() || c == ',' || c == '-')
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<u8>()
                .with_context(|| format!("Numéro invalide : '{}'", part))
        })
        .collect()
}

// Columns: draw_id;date;session;numbers;special
fn parse_record(record: &csv::StringRecord) -> Result<RawDraw> {
    let get = |idx: usize| -> Result<String> {
        record
            .get(idx)
            .map(|s| s.trim().to_string())
            .with_context(|| format!("Champ manquant à l'index {}", idx))
    };

    let draw_id = get(0)?;
    let date = get(1)?;
    let session = get(2).ok().filter(|s| !s.is_empty());
    let numbers = parse_numbers(&get(3)?)?;
    if numbers.is_empty() {
        bail!("Aucun numéro pour le tirage '{}'", draw_id);
    }
    let special = match get(4).unwrap_or_default() {
        s if s.is_empty() => None,
        s => Some(s.parse::<u8>().with_context(|| format!("Numéro spécial invalide : '{}'", s))?),
    };

    Ok(RawDraw {
        draw_id,
        date,
        session,
        numbers,
        special,
    })
}

pub struct ImportResult {
    pub total_records: u32,
    pub inserted: u32,
    pub skipped: u32,
    pub errors: u32,
}

/// Loads published draws into history. Cycles are not touched: live draws go
/// through `lecycle ingest`.
pub fn import_csv(conn: &Connection, variant: &VariantConfig, path: &Path) -> Result<ImportResult> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Impossible d'ouvrir {:?}", path))?;

    let tx = conn.unchecked_transaction()
        .context("Impossible de démarrer la transaction")?;

    let mut result = ImportResult {
        total_records: 0,
        inserted: 0,
        skipped: 0,
        errors: 0,
    };
    let now = Utc::now();

    for record_result in reader.records() {
        result.total_records += 1;
        let parsed = record_result
            .map_err(anyhow::Error::from)
            .and_then(|record| parse_record(&record))
            .and_then(|raw| normalize_draw(variant, &raw).map_err(anyhow::Error::from));
        match parsed {
            Ok(draw) => match insert_draw(&tx, &draw, now) {
                Ok(true) => result.inserted += 1,
                Ok(false) => result.skipped += 1,
                Err(e) => {
                    log::error!("insertion du tirage {} (ligne {}) : {}", draw.draw_id, result.total_records, e);
                    result.errors += 1;
                }
            },
            Err(e) => {
                log::warn!("ligne {} ignorée : {:#}", result.total_records, e);
                result.errors += 1;
            }
        }
    }

    tx.commit().context("Échec du commit")?;
    Ok(result)
}
