//! Catalog CSV import.
//!
//! Expected header: `id_planet, pathrow, fecha, nubosidad, visibilidad, tipo, temporada,
//! descargada`. Extra columns are ignored.
//!
//! `tipo` holds the provider item type (`PSScene`), not a product type, so it is not stored;
//! the product is resolved again at activation. Cloud cover and visibility are stored as
//! fractions like search results; values above 1 are read as percentages.

use std::io::Read;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate};
use serde::Deserialize;

use pathrow_core::{NewRecord, Season};

#[derive(Debug, Deserialize)]
struct CatalogRow {
    id_planet: String,
    pathrow: String,
    fecha: String,
    nubosidad: f64,
    visibilidad: f64,
    temporada: String,
    descargada: String,
}

/// Parse every row, failing on the first invalid one so a bad file is never half imported.
pub fn read_catalog<R: Read>(reader: R) -> Result<Vec<NewRecord>> {
    let mut csv = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut records = Vec::new();
    for (index, row) in csv.deserialize::<CatalogRow>().enumerate() {
        // Line 1 is the header.
        let line = index + 2;
        let row = row.with_context(|| format!("line {}: malformed row", line))?;
        records.push(to_record(row).with_context(|| format!("line {}", line))?);
    }
    Ok(records)
}

fn to_record(row: CatalogRow) -> Result<NewRecord> {
    if row.id_planet.is_empty() {
        return Err(anyhow!("empty id_planet"));
    }
    if row.pathrow.is_empty() {
        return Err(anyhow!("empty pathrow"));
    }
    let season: Season = row.temporada.parse().map_err(|e: String| anyhow!(e))?;
    Ok(NewRecord {
        acquired: parse_date(&row.fecha)?,
        image_id: row.id_planet,
        quadrant_id: row.pathrow,
        cloud_cover: to_fraction(row.nubosidad, "nubosidad")?,
        visibility: to_fraction(row.visibilidad, "visibilidad")?,
        product_type: None,
        season,
        downloaded: parse_flag(&row.descargada)?,
    })
}

fn to_fraction(value: f64, column: &str) -> Result<f64> {
    if !(0.0..=100.0).contains(&value) {
        return Err(anyhow!("{} out of range: {}", column, value));
    }
    if value > 1.0 {
        Ok(value / 100.0)
    } else {
        Ok(value)
    }
}

/// Accepts `YYYY-MM-DD`, RFC 3339 timestamps, and `YYYY-MM-DD HH:MM:SS`.
fn parse_date(raw: &str) -> Result<NaiveDate> {
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(date);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.date_naive());
    }
    raw.get(..10)
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        .ok_or_else(|| anyhow!("invalid fecha {:?}", raw))
}

fn parse_flag(raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "t" | "1" | "yes" => Ok(true),
        "false" | "f" | "0" | "no" | "" => Ok(false),
        other => Err(anyhow!("invalid descargada {:?}", other)),
    }
}
