//! Candle file loading — TSV/CSV price histories
//!
//! Accepts the usual broker export shapes: a `date, open, high, low, close,
//! volume` table with an optional header row, ISO (`2024-01-31`) or German
//! (`31.01.2024`) dates, and `.` or `,` decimal separators. Malformed rows
//! are dropped with a warning instead of failing the whole file.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use engine::Candle;
use tracing::{debug, info, warn};

fn parse_date(field: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(field, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(field, "%d.%m.%Y"))
        .ok()
}

fn parse_number(field: &str) -> Option<f64> {
    field
        .replace(',', ".")
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

/// Columns: date, open, high, low, close, volume. Volume may be absent.
fn parse_record(record: &csv::StringRecord) -> Option<Candle> {
    if record.len() < 5 {
        return None;
    }
    let date = parse_date(record.get(0)?)?;
    let open = parse_number(record.get(1)?)?;
    let high = parse_number(record.get(2)?)?;
    let low = parse_number(record.get(3)?)?;
    let close = parse_number(record.get(4)?)?;
    let volume = record.get(5).and_then(parse_number).unwrap_or(0.0);
    Some(Candle {
        date,
        open,
        high,
        low,
        close,
        volume,
    })
}

/// Parse candles from any reader, then sort by date and drop duplicate days.
pub fn read_candles<R: Read>(input: R, delimiter: u8) -> Vec<Candle> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .delimiter(delimiter)
        .from_reader(input);

    let mut candles = Vec::new();
    let mut dropped = 0usize;
    for (index, record) in reader.records().enumerate() {
        let row = index + 1;
        let record = match record {
            Ok(record) => record,
            Err(error) => {
                warn!(row, %error, "dropped unreadable row");
                dropped += 1;
                continue;
            }
        };
        match parse_record(&record) {
            Some(candle) => candles.push(candle),
            // The first row is usually a header line, skip it quietly
            None if index == 0 => debug!(row, "skipped header row"),
            None => {
                warn!(row, "dropped malformed row");
                dropped += 1;
            }
        }
    }

    candles.sort_by_key(|c| c.date);
    let before = candles.len();
    candles.dedup_by_key(|c| c.date);
    let duplicates = before - candles.len();
    if dropped > 0 || duplicates > 0 {
        warn!(dropped, duplicates, "input rows discarded");
    }
    candles
}

/// Load a candle file, choosing the delimiter from the extension
/// (`.tsv` is tab-separated, everything else comma-separated).
pub fn load_candles(path: &Path) -> Result<Vec<Candle>> {
    let file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let delimiter = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("tsv") => b'\t',
        _ => b',',
    };
    let candles = read_candles(BufReader::new(file), delimiter);
    if candles.is_empty() {
        bail!("no parsable candle rows in {}", path.display());
    }
    info!(
        path = %path.display(),
        rows = candles.len(),
        from = %candles[0].date,
        to = %candles[candles.len() - 1].date,
        "candles loaded"
    );
    Ok(candles)
}

/// Short dataset label for report tables, derived from the file name.
pub fn dataset_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

// ============================================================================
// Tests
// ============================================================================
