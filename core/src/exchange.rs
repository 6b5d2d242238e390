use std::io::{Read, Write};

use chrono::Utc;
use tracing::info;

use crate::db::{Database, Record};
use crate::error::{ImportError, StorageError, StorageResult};
use crate::models::{EXPORT_VERSION, ExportData, ImportSummary, Note, WeightEntry};

impl Database {
    /// Every live row plus the settings and profile singletons.
    pub fn export_data(&self) -> StorageResult<ExportData> {
        Ok(ExportData {
            version: EXPORT_VERSION,
            exported_at: Utc::now(),
            weight_entries: self.fetch_active::<WeightEntry>()?,
            notes: self.fetch_active::<Note>()?,
            settings: Some(self.settings()?),
            profile: Some(self.profile()?),
        })
    }

    /// Upsert everything in `data` by identity. Importing the same payload
    /// twice leaves the same rows as importing it once.
    pub fn import_data(&self, data: &ExportData) -> Result<ImportSummary, ImportError> {
        if data.version > EXPORT_VERSION {
            return Err(ImportError::UnsupportedVersion(data.version));
        }
        let mut summary = ImportSummary::default();

        // One transaction: a failing row leaves the store untouched.
        self.transaction(|conn| {
            // Notes go first so entry references resolve.
            for note in &data.notes {
                Self::insert_or_replace_in(conn, note)?;
                summary.notes_imported += 1;
            }
            for entry in &data.weight_entries {
                Self::insert_or_replace_in(conn, entry)?;
                summary.weight_entries_imported += 1;
            }
            if let Some(settings) = &data.settings {
                let mut settings = settings.clone();
                settings.merge_remote(Some(&Self::settings_in(conn)?));
                Self::insert_or_replace_in(conn, &settings)?;
                summary.settings_imported = true;
            }
            if let Some(profile) = &data.profile {
                Self::insert_or_replace_in(conn, profile)?;
                summary.profile_imported = true;
            }
            Ok::<_, StorageError>(())
        })?;

        info!(
            entries = summary.weight_entries_imported,
            notes = summary.notes_imported,
            "json import complete"
        );
        Ok(summary)
    }
}

pub fn export_json<W: Write>(db: &Database, writer: W) -> Result<(), ImportError> {
    let data = db.export_data()?;
    serde_json::to_writer_pretty(writer, &data)?;
    Ok(())
}

pub fn import_json<R: Read>(db: &Database, reader: R) -> Result<ImportSummary, ImportError> {
    let data: ExportData = serde_json::from_reader(reader)?;
    db.import_data(&data)
}
