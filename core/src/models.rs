use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageError;

pub const SETTINGS_ID: &str = "settings";
pub const PROFILE_ID: &str = "profile";

const LBS_PER_KG: f64 = 2.204_62;
const KG_PER_LB: f64 = 0.453_592;

/// Canonical text form of a timestamp. Fixed width, so stored values sort
/// lexicographically in time order.
#[must_use]
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| StorageError::Malformed {
            column: "timestamp",
            value: value.to_string(),
        })
}

// --- Enumerations ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Pending,
    Synced,
    Error,
}

impl SyncState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "synced" => Some(Self::Synced),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeightUnit {
    #[serde(rename = "kg")]
    Kilograms,
    #[serde(rename = "lb")]
    Pounds,
}

impl WeightUnit {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Kilograms => "kg",
            Self::Pounds => "lb",
        }
    }

    /// Accepts the spellings people type: `kg`, `kgs`, `lb`, `lbs`, `pounds`...
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "kg" | "kgs" | "kilogram" | "kilograms" => Some(Self::Kilograms),
            "lb" | "lbs" | "pound" | "pounds" => Some(Self::Pounds),
            _ => None,
        }
    }

    /// Convert `value` expressed in `self` into `target`.
    #[must_use]
    pub fn convert(self, value: f64, target: WeightUnit) -> f64 {
        match (self, target) {
            (Self::Kilograms, Self::Pounds) => value * LBS_PER_KG,
            (Self::Pounds, Self::Kilograms) => value * KG_PER_LB,
            _ => value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntrySource {
    Manual,
    Backdated,
    ImportedCsv,
    ImportedHealth,
}

impl EntrySource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Backdated => "backdated",
            Self::ImportedCsv => "imported_csv",
            Self::ImportedHealth => "imported_health",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(Self::Manual),
            "backdated" => Some(Self::Backdated),
            "imported_csv" => Some(Self::ImportedCsv),
            "imported_health" => Some(Self::ImportedHealth),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    #[default]
    Unspecified,
    Female,
    Male,
    Other,
}

impl Gender {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::Female => "female",
            Self::Male => "male",
            Self::Other => "other",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "unspecified" | "" => Some(Self::Unspecified),
            "female" => Some(Self::Female),
            "male" => Some(Self::Male),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

// --- Row bookkeeping ---

/// Change-tracking columns shared by every table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowMeta {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub is_deleted: bool,
    pub sync_state: SyncState,
}

impl RowMeta {
    #[must_use]
    pub fn new_at(now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            updated_at: now,
            is_deleted: false,
            sync_state: SyncState::Pending,
        }
    }
}

// --- Entities ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightEntry {
    pub id: String,
    pub value: f64,
    pub unit: WeightUnit,
    pub source: EntrySource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
    #[serde(flatten)]
    pub meta: RowMeta,
}

impl WeightEntry {
    #[must_use]
    pub fn new(
        value: f64,
        unit: WeightUnit,
        source: EntrySource,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            value,
            unit,
            source,
            note_id: None,
            recorded_at,
            meta: RowMeta::new_at(Utc::now()),
        }
    }

    #[must_use]
    pub fn value_in(&self, unit: WeightUnit) -> f64 {
        self.unit.convert(self.value, unit)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub body: String,
    pub recorded_at: DateTime<Utc>,
    #[serde(flatten)]
    pub meta: RowMeta,
}

impl Note {
    #[must_use]
    pub fn new(body: impl Into<String>, recorded_at: DateTime<Utc>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), body, recorded_at)
    }

    #[must_use]
    pub fn with_id(id: String, body: impl Into<String>, recorded_at: DateTime<Utc>) -> Self {
        Self {
            id,
            body: body.into(),
            recorded_at,
            meta: RowMeta::new_at(Utc::now()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub id: String,
    pub preferred_unit: WeightUnit,
    pub reminder_enabled: bool,
    pub reminder_hour: u8,
    pub reminder_minute: u8,
    pub onboarding_complete: bool,
    pub sync_enabled: bool,
    #[serde(default)]
    pub last_sync_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_sync_error: Option<String>,
    #[serde(flatten)]
    pub meta: RowMeta,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            id: SETTINGS_ID.to_string(),
            preferred_unit: WeightUnit::Kilograms,
            reminder_enabled: false,
            reminder_hour: 8,
            reminder_minute: 0,
            onboarding_complete: false,
            sync_enabled: false,
            last_sync_at: None,
            last_sync_error: None,
            meta: RowMeta::new_at(Utc::now()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    #[serde(default)]
    pub birthday: Option<NaiveDate>,
    #[serde(default)]
    pub gender: Gender,
    #[serde(default)]
    pub height_cm: Option<f64>,
    #[serde(default)]
    pub avatar_path: Option<String>,
    #[serde(flatten)]
    pub meta: RowMeta,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            id: PROFILE_ID.to_string(),
            birthday: None,
            gender: Gender::Unspecified,
            height_cm: None,
            avatar_path: None,
            meta: RowMeta::new_at(Utc::now()),
        }
    }
}

// --- Use-case inputs and views ---

#[derive(Debug, Clone)]
pub struct NewWeightEntry {
    pub value: f64,
    pub unit: WeightUnit,
    pub recorded_at: DateTime<Utc>,
    pub source: EntrySource,
    pub note: Option<String>,
}

/// Partial edit of an entry. `note: Some("")` removes the linked note.
#[derive(Debug, Clone, Default)]
pub struct UpdateWeightEntry {
    pub value: Option<f64>,
    pub unit: Option<WeightUnit>,
    pub recorded_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
}

/// An entry with its linked note resolved, for display.
#[derive(Debug, Clone, Serialize)]
pub struct EntryView {
    #[serde(flatten)]
    pub entry: WeightEntry,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

pub fn validate_weight(value: f64) -> Result<(), StorageError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(StorageError::Invalid(format!(
            "weight must be a positive number (got {value})"
        )));
    }
    Ok(())
}

// --- Sync wire types ---

/// Everything one sync cycle pushes to the remote replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSnapshot {
    pub pending_notes: Vec<Note>,
    pub pending_weight_entries: Vec<WeightEntry>,
    pub profile: Profile,
    pub settings: Settings,
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl SyncSnapshot {
    #[must_use]
    pub fn has_pending_rows(&self) -> bool {
        !self.pending_notes.is_empty() || !self.pending_weight_entries.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteChanges {
    #[serde(default)]
    pub notes: Vec<Note>,
    #[serde(default)]
    pub weight_entries: Vec<WeightEntry>,
    #[serde(default)]
    pub profile: Option<Profile>,
    #[serde(default)]
    pub settings: Option<Settings>,
}

impl RemoteChanges {
    #[must_use]
    pub fn len(&self) -> usize {
        self.notes.len()
            + self.weight_entries.len()
            + usize::from(self.profile.is_some())
            + usize::from(self.settings.is_some())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub accepted_ids: Vec<String>,
    pub remote_changes: RemoteChanges,
    pub synced_at: DateTime<Utc>,
}

// --- Export / Import types ---

pub const EXPORT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportData {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    #[serde(default)]
    pub weight_entries: Vec<WeightEntry>,
    #[serde(default)]
    pub notes: Vec<Note>,
    #[serde(default)]
    pub settings: Option<Settings>,
    #[serde(default)]
    pub profile: Option<Profile>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub weight_entries_imported: usize,
    pub notes_imported: usize,
    pub settings_imported: bool,
    pub profile_imported: bool,
}

/// Rows copied by a merge import, per kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSummary {
    pub notes: usize,
    pub weight_entries: usize,
    pub settings: usize,
    pub profile: usize,
}

impl MergeSummary {
    #[must_use]
    pub fn total(&self) -> usize {
        self.notes + self.weight_entries + self.settings + self.profile
    }
}
