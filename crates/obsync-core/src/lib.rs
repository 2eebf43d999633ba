//! Core domain model for the observation delta sync.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const CRATE_NAME: &str = "obsync-core";

/// Persisted "last synced" instant bounding incremental observation queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub timestamp: DateTime<Utc>,
    /// Assigned by the storage backend when the watermark is written.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// One page of a cursor-paginated listing. A `None` cursor ends pagination.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_cursor: None,
        }
    }
}

/// Decoded document as read from the source store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDocument {
    pub path: String,
    #[serde(default)]
    pub fields: Map<String, JsonValue>,
}

impl RawDocument {
    /// Last path segment.
    pub fn id(&self) -> Option<&str> {
        document_segments(&self.path).last().copied()
    }

    /// Id of the document owning this document's collection (`parent.parent`).
    pub fn owner_id(&self) -> Option<&str> {
        let segments = document_segments(&self.path);
        if segments.len() < 3 {
            return None;
        }
        Some(segments[segments.len() - 3])
    }
}

/// Splits a storage path into segments, dropping any `projects/.../documents/` resource prefix.
fn document_segments(path: &str) -> Vec<&str> {
    let relative = match path.find("/documents/") {
        Some(idx) => &path[idx + "/documents/".len()..],
        None => path,
    };
    relative.split('/').filter(|s| !s.is_empty()).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: String,
    #[serde(default)]
    pub attributes: Map<String, JsonValue>,
}

impl UserRecord {
    pub fn from_document(doc: &RawDocument) -> Option<Self> {
        Some(Self {
            user_id: doc.id()?.to_string(),
            attributes: doc.fields.clone(),
        })
    }
}

/// Flat observation row produced from a nested observation document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationRecord {
    pub user_id: String,
    pub metric: String,
    pub value: Option<f64>,
    pub unit: Option<String>,
    pub value_str: Option<String>,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub issued: Option<DateTime<Utc>>,
}

impl ObservationRecord {
    /// Flattens an observation document. Documents without an object-valued
    /// `effectivePeriod`, or whose owner cannot be recovered from the path, yield `None`.
    pub fn from_document(doc: &RawDocument, metric: &str) -> Option<Self> {
        let period = doc.fields.get("effectivePeriod")?.as_object()?;
        let user_id = doc.owner_id()?.to_string();
        let quantity = doc.fields.get("valueQuantity").and_then(JsonValue::as_object);

        Some(Self {
            user_id,
            metric: metric.to_string(),
            value: quantity
                .and_then(|q| q.get("value"))
                .and_then(JsonValue::as_f64),
            unit: quantity
                .and_then(|q| q.get("unit"))
                .and_then(JsonValue::as_str)
                .map(str::to_string),
            value_str: doc
                .fields
                .get("valueString")
                .and_then(JsonValue::as_str)
                .map(str::to_string),
            period_start: period.get("start").and_then(parse_instant),
            period_end: period.get("end").and_then(parse_instant),
            issued: doc.fields.get("issued").and_then(parse_instant),
        })
    }
}

/// Parses an RFC 3339 instant, or a zone-less ISO timestamp taken as UTC.
pub fn parse_instant(value: &JsonValue) -> Option<DateTime<Utc>> {
    let text = value.as_str()?.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Prefix-stripping rules reducing verbose group names to short metric labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricRules {
    pub prefixes: Vec<String>,
    pub fallback: String,
}

pub const DEFAULT_METRIC_PREFIXES: &[&str] = &[
    "HealthObservations_HKQuantityTypeIdentifier",
    "HealthObservations_HKCategoryTypeIdentifier",
    "HealthObservations_com.apple.SensorKit.",
    "HealthObservations_HKDataTypeIdentifier",
    "HealthObservations_HKWorkoutTypeIdentifier",
    "HealthObservations_MHC",
];

pub const DEFAULT_METRIC_FALLBACK: &str = "Workout";

impl Default for MetricRules {
    fn default() -> Self {
        Self {
            prefixes: DEFAULT_METRIC_PREFIXES.iter().map(|p| p.to_string()).collect(),
            fallback: DEFAULT_METRIC_FALLBACK.to_string(),
        }
    }
}

impl MetricRules {
    /// Strips the first matching prefix once. Names that strip to nothing get the fallback label.
    pub fn clean(&self, group: &str) -> String {
        let Some(rest) = self
            .prefixes
            .iter()
            .find_map(|prefix| group.strip_prefix(prefix.as_str()))
        else {
            return group.to_string();
        };
        if rest.is_empty() {
            self.fallback.clone()
        } else {
            rest.to_string()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ColumnKind {
    String,
    Bool,
    Int64,
    Float64,
    Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub kind: ColumnKind,
}

const fn col(name: &'static str, kind: ColumnKind) -> ColumnSpec {
    ColumnSpec { name, kind }
}

pub const USERS_SCHEMA: &[ColumnSpec] = &[
    col("user_id", ColumnKind::String),
    col("educationUS", ColumnKind::String),
    col("futureStudies", ColumnKind::Bool),
    col("comorbidities", ColumnKind::String),
    col("preferredNotificationTime", ColumnKind::String),
    col("householdIncomeUS", ColumnKind::Int64),
    col("mhcGenderIdentity", ColumnKind::Int64),
    col("disabled", ColumnKind::Bool),
    col("lastSignedConsentDate", ColumnKind::Timestamp),
    col("bloodType", ColumnKind::Int64),
    col("timeZone", ColumnKind::String),
    col("usRegion", ColumnKind::String),
    col("dateOfBirth", ColumnKind::Timestamp),
    col("mostRecentOnboardingStep", ColumnKind::String),
    col("raceEthnicity", ColumnKind::Int64),
    col("preferredWorkoutTypes", ColumnKind::String),
    col("fcmToken", ColumnKind::String),
    col("biologicalSexAtBirth", ColumnKind::Int64),
    col("heightInCM", ColumnKind::Float64),
    col("stageOfChange", ColumnKind::String),
    col("lastSignedConsentVersion", ColumnKind::String),
    col("latinoStatus", ColumnKind::Int64),
    col("dateOfEnrollment", ColumnKind::Timestamp),
    col("didOptInToTrial", ColumnKind::Bool),
    col("language", ColumnKind::String),
    col("lastActiveDate", ColumnKind::Timestamp),
    col("participantGroup", ColumnKind::Int64),
    col("weightInKG", ColumnKind::Float64),
    col("synced_at", ColumnKind::Timestamp),
];

pub const OBSERVATIONS_SCHEMA: &[ColumnSpec] = &[
    col("user_id", ColumnKind::String),
    col("metric", ColumnKind::String),
    col("value", ColumnKind::Float64),
    col("unit", ColumnKind::String),
    col("value_str", ColumnKind::String),
    col("period_start", ColumnKind::Timestamp),
    col("period_end", ColumnKind::Timestamp),
    col("issued", ColumnKind::Timestamp),
    col("synced_at", ColumnKind::Timestamp),
];

/// Typed warehouse cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum CellValue {
    Null,
    String(String),
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Timestamp(DateTime<Utc>),
}

impl CellValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            CellValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Coerces a loosely typed document value into a cell of the given column kind.
    /// Lists and maps bound for STRING columns become JSON text; anything that does
    /// not fit the kind becomes `Null`.
    pub fn coerce(kind: ColumnKind, value: &JsonValue) -> Self {
        if value.is_null() {
            return CellValue::Null;
        }
        match kind {
            ColumnKind::String => match value {
                JsonValue::String(s) => CellValue::String(s.clone()),
                other => CellValue::String(other.to_string()),
            },
            ColumnKind::Bool => match value {
                JsonValue::Bool(b) => CellValue::Bool(*b),
                JsonValue::String(s) => s
                    .parse::<bool>()
                    .map(CellValue::Bool)
                    .unwrap_or(CellValue::Null),
                JsonValue::Number(n) => n
                    .as_i64()
                    .map(|n| CellValue::Bool(n != 0))
                    .unwrap_or(CellValue::Null),
                _ => CellValue::Null,
            },
            ColumnKind::Int64 => match value {
                JsonValue::Number(n) => n
                    .as_i64()
                    .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                    .map(CellValue::Int64)
                    .unwrap_or(CellValue::Null),
                JsonValue::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(CellValue::Int64)
                    .unwrap_or(CellValue::Null),
                _ => CellValue::Null,
            },
            ColumnKind::Float64 => match value {
                JsonValue::Number(n) => n.as_f64().map(CellValue::Float64).unwrap_or(CellValue::Null),
                JsonValue::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(CellValue::Float64)
                    .unwrap_or(CellValue::Null),
                _ => CellValue::Null,
            },
            ColumnKind::Timestamp => parse_instant(value)
                .map(CellValue::Timestamp)
                .unwrap_or(CellValue::Null),
        }
    }
}

/// User row shaped to `USERS_SCHEMA`; `cells[i]` belongs to `USERS_SCHEMA[i]`.
#[derive(Debug, Clone, PartialEq)]
pub struct UserRow {
    pub user_id: String,
    pub cells: Vec<CellValue>,
}

impl UserRow {
    pub fn from_record(record: &UserRecord, synced_at: DateTime<Utc>) -> Self {
        let cells = USERS_SCHEMA
            .iter()
            .map(|column| match column.name {
                "user_id" => CellValue::String(record.user_id.clone()),
                "synced_at" => CellValue::Timestamp(synced_at),
                name => record
                    .attributes
                    .get(name)
                    .map(|value| CellValue::coerce(column.kind, value))
                    .unwrap_or(CellValue::Null),
            })
            .collect();
        Self {
            user_id: record.user_id.clone(),
            cells,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObservationRow {
    pub record: ObservationRecord,
    pub synced_at: DateTime<Utc>,
}

impl ObservationRow {
    /// Cells in `OBSERVATIONS_SCHEMA` order.
    pub fn cells(&self) -> Vec<CellValue> {
        let r = &self.record;
        let opt_str = |v: &Option<String>| v.clone().map(CellValue::String).unwrap_or(CellValue::Null);
        let opt_ts = |v: &Option<DateTime<Utc>>| v.map(CellValue::Timestamp).unwrap_or(CellValue::Null);
        vec![
            CellValue::String(r.user_id.clone()),
            CellValue::String(r.metric.clone()),
            r.value.map(CellValue::Float64).unwrap_or(CellValue::Null),
            opt_str(&r.unit),
            opt_str(&r.value_str),
            opt_ts(&r.period_start),
            opt_ts(&r.period_end),
            opt_ts(&r.issued),
            CellValue::Timestamp(self.synced_at),
        ]
    }
}

/// Table write semantics: replace the whole table, or add rows to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteDisposition {
    Replace,
    Append,
}
