use std::collections::HashMap;
use std::io::{Read, Write};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::db::Database;
use crate::error::{ImportError, StorageError};
use crate::models::{EntrySource, Note, WeightEntry, WeightUnit, format_ts, validate_weight};

/// A single row parsed from a weight CSV.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightCsvRow {
    pub recorded_at: DateTime<Utc>,
    pub value: f64,
    pub unit: WeightUnit,
    pub note: Option<String>,
}

impl WeightCsvRow {
    /// Identity derived from the row content, so importing the same file
    /// again updates rather than duplicates.
    #[must_use]
    pub fn entry_id(&self) -> String {
        let normalized = format!(
            "{}|{:.3}|{}|{}",
            format_ts(&self.recorded_at),
            self.value,
            self.unit.as_str(),
            self.note.as_deref().unwrap_or("")
        );
        let digest = Sha256::digest(normalized.as_bytes());
        let hex: String = digest.iter().take(16).map(|b| format!("{b:02x}")).collect();
        format!("csv-{hex}")
    }

    #[must_use]
    pub fn note_id(&self) -> String {
        format!("{}-note", self.entry_id())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CsvImportSummary {
    pub rows_parsed: usize,
    pub entries_created: usize,
    pub entries_updated: usize,
    pub notes_written: usize,
}

fn parse_recorded_at(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(ts.and_utc());
        }
    }
    for fmt in ["%Y-%m-%d", "%m/%d/%Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(raw, fmt) {
            return d.and_hms_opt(0, 0, 0).map(|ts| ts.and_utc());
        }
    }
    None
}

/// Parse a weight CSV from any reader.
///
/// Expected header: `Date,Weight,Unit,Note`, matched case-insensitively.
/// `Note` is optional. Blank rows are skipped; any other bad row fails the
/// whole parse so nothing is half-imported.
pub fn parse_weight_csv<R: Read>(reader: R) -> Result<Vec<WeightCsvRow>, ImportError> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = rdr.headers()?.clone();
    let col = |name: &str| headers.iter().position(|h| h.eq_ignore_ascii_case(name));

    let idx_date = col("Date").ok_or(ImportError::MissingColumn("Date"))?;
    let idx_weight = col("Weight").ok_or(ImportError::MissingColumn("Weight"))?;
    let idx_unit = col("Unit").ok_or(ImportError::MissingColumn("Unit"))?;
    let idx_note = col("Note");

    let mut rows = Vec::new();
    for (i, result) in rdr.records().enumerate() {
        let line = i + 2;
        let record = result?;
        let field = |idx: usize| record.get(idx).unwrap_or("").trim();
        let invalid = |reason: String| ImportError::InvalidRow { line, reason };

        let date = field(idx_date);
        let weight = field(idx_weight);
        if date.is_empty() && weight.is_empty() {
            continue;
        }

        let recorded_at =
            parse_recorded_at(date).ok_or_else(|| invalid(format!("cannot parse date '{date}'")))?;
        let value: f64 = weight
            .parse()
            .map_err(|_| invalid(format!("cannot parse weight '{weight}'")))?;
        validate_weight(value).map_err(|e| invalid(e.to_string()))?;
        let unit_raw = field(idx_unit);
        let unit = WeightUnit::parse(unit_raw)
            .ok_or_else(|| invalid(format!("unknown unit '{unit_raw}'")))?;
        let note = idx_note
            .map(field)
            .filter(|n| !n.is_empty())
            .map(str::to_string);

        rows.push(WeightCsvRow {
            recorded_at,
            value,
            unit,
            note,
        });
    }
    Ok(rows)
}

/// Import parsed rows. When `dry_run` is true, nothing is written and the
/// summary reports what would happen.
pub fn import_weight_rows(
    db: &Database,
    rows: &[WeightCsvRow],
    dry_run: bool,
) -> Result<CsvImportSummary, ImportError> {
    let mut summary = CsvImportSummary {
        rows_parsed: rows.len(),
        ..CsvImportSummary::default()
    };

    db.transaction(|conn| {
        for row in rows {
            let entry_id = row.entry_id();
            if Database::get_in::<WeightEntry>(conn, &entry_id)
                .map_err(StorageError::from)?
                .is_some()
            {
                summary.entries_updated += 1;
            } else {
                summary.entries_created += 1;
            }
            if row.note.is_some() {
                summary.notes_written += 1;
            }
            if dry_run {
                continue;
            }

            let mut entry =
                WeightEntry::new(row.value, row.unit, EntrySource::ImportedCsv, row.recorded_at);
            entry.id = entry_id;
            if let Some(body) = &row.note {
                let note = Note::with_id(row.note_id(), body.as_str(), row.recorded_at);
                let note = Database::insert_or_replace_in(conn, &note)?;
                entry.note_id = Some(note.id);
            }
            Database::insert_or_replace_in(conn, &entry)?;
        }
        Ok::<_, ImportError>(())
    })?;

    if !dry_run {
        info!(
            created = summary.entries_created,
            updated = summary.entries_updated,
            "csv import complete"
        );
    }
    Ok(summary)
}

/// Write live entries in the import format, newest first.
pub fn export_weight_csv<W: Write>(db: &Database, writer: W) -> Result<usize, ImportError> {
    let notes: HashMap<String, String> = db
        .fetch_active::<Note>()?
        .into_iter()
        .map(|n| (n.id, n.body))
        .collect();
    let entries = db.fetch_active::<WeightEntry>()?;

    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record(["Date", "Weight", "Unit", "Note"])?;
    for entry in &entries {
        let note = entry
            .note_id
            .as_ref()
            .and_then(|id| notes.get(id))
            .map_or("", String::as_str);
        wtr.write_record([
            format_ts(&entry.recorded_at).as_str(),
            entry.value.to_string().as_str(),
            entry.unit.as_str(),
            note,
        ])?;
    }
    wtr.flush().map_err(csv::Error::from)?;
    Ok(entries.len())
}
