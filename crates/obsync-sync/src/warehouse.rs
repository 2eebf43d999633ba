//! Warehouse sinks: the `Warehouse` contract plus parquet-directory and Postgres tables.

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::{
    ArrayRef, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray,
    TimestampMicrosecondArray,
};
use arrow_schema::{ArrowError, DataType, Field as ArrowField, Schema, TimeUnit};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use obsync_core::{
    CellValue, ColumnKind, ColumnSpec, ObservationRow, UserRow, WriteDisposition,
    OBSERVATIONS_SCHEMA, USERS_SCHEMA,
};
use obsync_storage::write_atomically;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::errors::ParquetError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("warehouse io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Arrow(#[from] ArrowError),
    #[error(transparent)]
    Parquet(#[from] ParquetError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("warehouse manifest {path}: {detail}")]
    Manifest { path: PathBuf, detail: String },
    #[error("table {table}: {detail}")]
    Schema { table: String, detail: String },
    #[error("parquet worker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> WarehouseError + '_ {
    move |source| WarehouseError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Analytical sink with a wide users table and a long observations table.
#[async_trait]
pub trait Warehouse: Send + Sync {
    fn describe(&self) -> String;

    /// Bulk snapshot of user ids already present in the users table.
    async fn existing_user_ids(&self) -> Result<HashSet<String>, WarehouseError>;

    async fn write_users(
        &self,
        rows: &[UserRow],
        disposition: WriteDisposition,
    ) -> Result<usize, WarehouseError>;

    async fn write_observations(
        &self,
        rows: &[ObservationRow],
        disposition: WriteDisposition,
    ) -> Result<usize, WarehouseError>;
}

fn user_cells(rows: &[UserRow]) -> Vec<Vec<CellValue>> {
    rows.iter().map(|row| row.cells.clone()).collect()
}

fn observation_cells(rows: &[ObservationRow]) -> Vec<Vec<CellValue>> {
    rows.iter().map(ObservationRow::cells).collect()
}

pub fn arrow_schema(columns: &[ColumnSpec]) -> Schema {
    Schema::new(
        columns
            .iter()
            .map(|column| {
                let data_type = match column.kind {
                    ColumnKind::String => DataType::Utf8,
                    ColumnKind::Bool => DataType::Boolean,
                    ColumnKind::Int64 => DataType::Int64,
                    ColumnKind::Float64 => DataType::Float64,
                    ColumnKind::Timestamp => {
                        DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
                    }
                };
                ArrowField::new(column.name, data_type, column.name != "user_id")
            })
            .collect::<Vec<_>>(),
    )
}

static NULL_CELL: CellValue = CellValue::Null;

fn column_array(kind: ColumnKind, idx: usize, rows: &[Vec<CellValue>]) -> ArrayRef {
    let cells = rows.iter().map(|row| row.get(idx).unwrap_or(&NULL_CELL));
    match kind {
        ColumnKind::String => Arc::new(StringArray::from(
            cells
                .map(|c| match c {
                    CellValue::String(s) => Some(s.clone()),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        ColumnKind::Bool => Arc::new(BooleanArray::from(
            cells
                .map(|c| match c {
                    CellValue::Bool(b) => Some(*b),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        ColumnKind::Int64 => Arc::new(Int64Array::from(
            cells
                .map(|c| match c {
                    CellValue::Int64(n) => Some(*n),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        ColumnKind::Float64 => Arc::new(Float64Array::from(
            cells
                .map(|c| match c {
                    CellValue::Float64(f) => Some(*f),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        ColumnKind::Timestamp => Arc::new(
            TimestampMicrosecondArray::from(
                cells
                    .map(|c| match c {
                        CellValue::Timestamp(ts) => Some(ts.timestamp_micros()),
                        _ => None,
                    })
                    .collect::<Vec<_>>(),
            )
            .with_timezone("UTC"),
        ),
    }
}

pub fn record_batch(
    columns: &[ColumnSpec],
    rows: &[Vec<CellValue>],
) -> Result<RecordBatch, ArrowError> {
    let arrays = columns
        .iter()
        .enumerate()
        .map(|(idx, column)| column_array(column.kind, idx, rows))
        .collect::<Vec<_>>();
    RecordBatch::try_new(Arc::new(arrow_schema(columns)), arrays)
}

fn encode_parquet(batch: &RecordBatch) -> Result<Vec<u8>, WarehouseError> {
    let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), None)?;
    writer.write(batch)?;
    Ok(writer.into_inner()?)
}

fn decode_parquet(path: &Path) -> Result<Vec<RecordBatch>, WarehouseError> {
    let file = File::open(path).map_err(io_err(path))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
    Ok(reader.collect::<Result<Vec<_>, _>>()?)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    #[serde(default)]
    pub tables: BTreeMap<String, Vec<ParquetManifestFile>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
    pub written_at: DateTime<Utc>,
}

const MANIFEST_FILE: &str = "_manifest.json";

/// Directory of parquet part files per table, indexed by `_manifest.json`.
#[derive(Debug)]
pub struct ParquetWarehouse {
    root: PathBuf,
    users_table: String,
    observations_table: String,
    manifest_lock: Mutex<()>,
}

impl ParquetWarehouse {
    pub fn new(
        root: impl Into<PathBuf>,
        users_table: impl Into<String>,
        observations_table: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            users_table: users_table.into(),
            observations_table: observations_table.into(),
            manifest_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub async fn load_manifest(&self) -> Result<ParquetManifest, WarehouseError> {
        let path = self.manifest_path();
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ParquetManifest {
                    schema_version: 1,
                    tables: BTreeMap::new(),
                })
            }
            Err(err) => return Err(io_err(&path)(err)),
        };
        serde_json::from_slice(&bytes).map_err(|err| WarehouseError::Manifest {
            path,
            detail: err.to_string(),
        })
    }

    async fn save_manifest(&self, manifest: &ParquetManifest) -> Result<(), WarehouseError> {
        let path = self.manifest_path();
        let bytes = serde_json::to_vec_pretty(manifest).map_err(|err| WarehouseError::Manifest {
            path: path.clone(),
            detail: err.to_string(),
        })?;
        write_atomically(&path, &bytes).await.map_err(io_err(&path))
    }

    /// Reads every row of a table back as record batches.
    pub async fn read_table(&self, table: &str) -> Result<Vec<RecordBatch>, WarehouseError> {
        let manifest = self.load_manifest().await?;
        let mut batches = Vec::new();
        for part in manifest.tables.get(table).into_iter().flatten() {
            let path = self.root.join(&part.path);
            let decoded = tokio::task::spawn_blocking(move || decode_parquet(&path)).await??;
            batches.extend(decoded);
        }
        Ok(batches)
    }

    async fn write_table(
        &self,
        table: &str,
        columns: &[ColumnSpec],
        rows: Vec<Vec<CellValue>>,
        disposition: WriteDisposition,
    ) -> Result<usize, WarehouseError> {
        if rows.is_empty() && disposition == WriteDisposition::Append {
            return Ok(0);
        }
        let _guard = self.manifest_lock.lock().await;

        let batch = record_batch(columns, &rows)?;
        let bytes = tokio::task::spawn_blocking(move || encode_parquet(&batch)).await??;
        let now = Utc::now();
        let relative = PathBuf::from(table).join(format!(
            "part-{}-{}.parquet",
            now.format("%Y%m%dT%H%M%S%6f"),
            Uuid::new_v4().simple()
        ));
        let absolute = self.root.join(&relative);
        let table_dir = self.root.join(table);
        tokio::fs::create_dir_all(&table_dir)
            .await
            .map_err(io_err(&table_dir))?;

        write_atomically(&absolute, &bytes)
            .await
            .map_err(io_err(&absolute))?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let entry = ParquetManifestFile {
            path: relative.display().to_string(),
            sha256: hex::encode(hasher.finalize()),
            bytes: bytes.len() as u64,
            rows: rows.len(),
            written_at: now,
        };

        let mut manifest = self.load_manifest().await?;
        let parts = manifest.tables.entry(table.to_string()).or_default();
        let replaced = match disposition {
            WriteDisposition::Replace => std::mem::replace(parts, vec![entry]),
            WriteDisposition::Append => {
                parts.push(entry);
                Vec::new()
            }
        };
        self.save_manifest(&manifest).await?;

        for old in replaced {
            let path = self.root.join(&old.path);
            if let Err(err) = tokio::fs::remove_file(&path).await {
                debug!(path = %path.display(), error = %err, "could not remove replaced part");
            }
        }

        info!(table, rows = rows.len(), ?disposition, part = %relative.display(), "wrote parquet part");
        Ok(rows.len())
    }
}

#[async_trait]
impl Warehouse for ParquetWarehouse {
    fn describe(&self) -> String {
        format!("parquet:{}", self.root.display())
    }

    async fn existing_user_ids(&self) -> Result<HashSet<String>, WarehouseError> {
        let mut ids = HashSet::new();
        for batch in self.read_table(&self.users_table).await? {
            let column = batch
                .column_by_name("user_id")
                .ok_or_else(|| WarehouseError::Schema {
                    table: self.users_table.clone(),
                    detail: "missing user_id column".into(),
                })?;
            let values = column
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| WarehouseError::Schema {
                    table: self.users_table.clone(),
                    detail: "user_id is not a string column".into(),
                })?;
            ids.extend(values.iter().flatten().map(str::to_string));
        }
        Ok(ids)
    }

    async fn write_users(
        &self,
        rows: &[UserRow],
        disposition: WriteDisposition,
    ) -> Result<usize, WarehouseError> {
        self.write_table(&self.users_table, USERS_SCHEMA, user_cells(rows), disposition)
            .await
    }

    async fn write_observations(
        &self,
        rows: &[ObservationRow],
        disposition: WriteDisposition,
    ) -> Result<usize, WarehouseError> {
        self.write_table(
            &self.observations_table,
            OBSERVATIONS_SCHEMA,
            observation_cells(rows),
            disposition,
        )
        .await
    }
}

/// Rows per INSERT statement.
pub const INSERT_CHUNK_ROWS: usize = 1000;

fn validate_identifier(name: &str) -> Result<String, WarehouseError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if !valid {
        return Err(WarehouseError::Schema {
            table: name.to_string(),
            detail: "table names may only contain ASCII letters, digits, `_` and `.`".into(),
        });
    }
    Ok(name
        .split('.')
        .map(|part| format!("\"{part}\""))
        .collect::<Vec<_>>()
        .join("."))
}

pub fn create_table_sql(quoted_table: &str, columns: &[ColumnSpec]) -> String {
    let defs = columns
        .iter()
        .map(|column| {
            let sql_type = match column.kind {
                ColumnKind::String => "TEXT",
                ColumnKind::Bool => "BOOLEAN",
                ColumnKind::Int64 => "BIGINT",
                ColumnKind::Float64 => "DOUBLE PRECISION",
                ColumnKind::Timestamp => "TIMESTAMPTZ",
            };
            let null = if column.name == "user_id" { " NOT NULL" } else { "" };
            format!("\"{}\" {sql_type}{null}", column.name)
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE IF NOT EXISTS {quoted_table} ({defs})")
}

/// Postgres-backed warehouse; `Replace` truncates and reloads inside one transaction.
#[derive(Debug, Clone)]
pub struct PostgresWarehouse {
    pool: PgPool,
    users_table: String,
    observations_table: String,
}

impl PostgresWarehouse {
    pub async fn connect(
        database_url: &str,
        users_table: &str,
        observations_table: &str,
    ) -> Result<Self, WarehouseError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await?;
        Self::with_pool(pool, users_table, observations_table)
    }

    pub fn with_pool(
        pool: PgPool,
        users_table: &str,
        observations_table: &str,
    ) -> Result<Self, WarehouseError> {
        Ok(Self {
            pool,
            users_table: validate_identifier(users_table)?,
            observations_table: validate_identifier(observations_table)?,
        })
    }

    pub async fn ensure_schema(&self) -> Result<(), WarehouseError> {
        for (table, columns) in [
            (&self.users_table, USERS_SCHEMA),
            (&self.observations_table, OBSERVATIONS_SCHEMA),
        ] {
            sqlx::query(&create_table_sql(table, columns))
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn write_table(
        &self,
        table: &str,
        columns: &[ColumnSpec],
        rows: Vec<Vec<CellValue>>,
        disposition: WriteDisposition,
    ) -> Result<usize, WarehouseError> {
        let mut tx = self.pool.begin().await?;
        if disposition == WriteDisposition::Replace {
            sqlx::query(&format!("TRUNCATE TABLE {table}"))
                .execute(&mut *tx)
                .await?;
        }

        let column_list = columns
            .iter()
            .map(|c| format!("\"{}\"", c.name))
            .collect::<Vec<_>>()
            .join(", ");

        for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO {table} ({column_list}) "));
            qb.push_values(chunk, |mut b, row| {
                for (column, cell) in columns.iter().zip(row) {
                    match (column.kind, cell) {
                        (_, CellValue::String(s)) => b.push_bind(s.clone()),
                        (_, CellValue::Bool(v)) => b.push_bind(*v),
                        (_, CellValue::Int64(v)) => b.push_bind(*v),
                        (_, CellValue::Float64(v)) => b.push_bind(*v),
                        (_, CellValue::Timestamp(v)) => b.push_bind(*v),
                        (ColumnKind::String, CellValue::Null) => b.push_bind(None::<String>),
                        (ColumnKind::Bool, CellValue::Null) => b.push_bind(None::<bool>),
                        (ColumnKind::Int64, CellValue::Null) => b.push_bind(None::<i64>),
                        (ColumnKind::Float64, CellValue::Null) => b.push_bind(None::<f64>),
                        (ColumnKind::Timestamp, CellValue::Null) => {
                            b.push_bind(None::<DateTime<Utc>>)
                        }
                    };
                }
            });
            qb.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        info!(table, rows = rows.len(), ?disposition, "wrote postgres rows");
        Ok(rows.len())
    }
}

#[async_trait]
impl Warehouse for PostgresWarehouse {
    fn describe(&self) -> String {
        format!("postgres:{}", self.users_table)
    }

    async fn existing_user_ids(&self) -> Result<HashSet<String>, WarehouseError> {
        let sql = format!(
            "SELECT user_id FROM {} WHERE user_id IS NOT NULL",
            self.users_table
        );
        let ids = sqlx::query_scalar::<_, String>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().collect())
    }

    async fn write_users(
        &self,
        rows: &[UserRow],
        disposition: WriteDisposition,
    ) -> Result<usize, WarehouseError> {
        self.write_table(&self.users_table, USERS_SCHEMA, user_cells(rows), disposition)
            .await
    }

    async fn write_observations(
        &self,
        rows: &[ObservationRow],
        disposition: WriteDisposition,
    ) -> Result<usize, WarehouseError> {
        self.write_table(
            &self.observations_table,
            OBSERVATIONS_SCHEMA,
            observation_cells(rows),
            disposition,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::Array;
    use chrono::TimeZone;
    use obsync_core::{ObservationRecord, UserRecord};
    use serde_json::json;
    use tempfile::tempdir;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).single().expect("ts")
    }

    fn user_row(id: &str) -> UserRow {
        let record = UserRecord {
            user_id: id.to_string(),
            attributes: json!({"comorbidities": ["asthma"], "heightInCM": 170.0})
                .as_object()
                .cloned()
                .unwrap_or_default(),
        };
        UserRow::from_record(&record, ts(1))
    }

    fn obs_row(user: &str, day: u32) -> ObservationRow {
        ObservationRow {
            record: ObservationRecord {
                user_id: user.to_string(),
                metric: "StepCount".into(),
                value: Some(100.0),
                unit: Some("count".into()),
                value_str: None,
                period_start: Some(ts(day)),
                period_end: Some(ts(day)),
                issued: Some(ts(day)),
            },
            synced_at: ts(20),
        }
    }

    fn total_rows(batches: &[RecordBatch]) -> usize {
        batches.iter().map(RecordBatch::num_rows).sum()
    }

    #[test]
    fn record_batch_follows_table_schema() {
        let rows = observation_cells(&[obs_row("u-1", 2), obs_row("u-2", 3)]);
        let batch = record_batch(OBSERVATIONS_SCHEMA, &rows).expect("batch");
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.num_columns(), OBSERVATIONS_SCHEMA.len());
        assert_eq!(
            batch.schema().field_with_name("issued").expect("issued").data_type(),
            &DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
        );
        let value_str = batch
            .column_by_name("value_str")
            .expect("value_str")
            .as_any()
            .downcast_ref::<StringArray>()
            .expect("strings");
        assert_eq!(value_str.null_count(), 2);
    }

    #[tokio::test]
    async fn replace_drops_previous_users_and_append_keeps_them() {
        let dir = tempdir().expect("tempdir");
        let wh = ParquetWarehouse::new(dir.path(), "users", "observations");
        assert!(wh.existing_user_ids().await.expect("empty").is_empty());

        wh.write_users(&[user_row("a"), user_row("b")], WriteDisposition::Replace)
            .await
            .expect("write");
        wh.write_users(&[user_row("c")], WriteDisposition::Append)
            .await
            .expect("append");
        let ids = wh.existing_user_ids().await.expect("ids");
        assert_eq!(ids.len(), 3);

        wh.write_users(&[user_row("d")], WriteDisposition::Replace)
            .await
            .expect("replace");
        let ids = wh.existing_user_ids().await.expect("ids");
        assert_eq!(ids, HashSet::from(["d".to_string()]));

        let manifest = wh.load_manifest().await.expect("manifest");
        assert_eq!(manifest.tables["users"].len(), 1);
        let parts = std::fs::read_dir(dir.path().join("users"))
            .expect("dir")
            .filter_map(|e| e.ok())
            .count();
        assert_eq!(parts, 1);
    }

    #[tokio::test]
    async fn observation_appends_accumulate_parts() {
        let dir = tempdir().expect("tempdir");
        let wh = ParquetWarehouse::new(dir.path(), "users", "observations");
        wh.write_observations(&[obs_row("u-1", 2)], WriteDisposition::Append)
            .await
            .expect("first");
        wh.write_observations(&[obs_row("u-1", 3), obs_row("u-2", 4)], WriteDisposition::Append)
            .await
            .expect("second");
        assert_eq!(
            wh.write_observations(&[], WriteDisposition::Append).await.expect("noop"),
            0
        );

        let batches = wh.read_table("observations").await.expect("read");
        assert_eq!(total_rows(&batches), 3);
        let manifest = wh.load_manifest().await.expect("manifest");
        let parts = &manifest.tables["observations"];
        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(|p| p.sha256.len() == 64 && p.bytes > 0));
        for part in parts {
            let on_disk = std::fs::read(dir.path().join(&part.path)).expect("part bytes");
            assert_eq!(on_disk.len() as u64, part.bytes);
            assert_eq!(hex::encode(Sha256::digest(&on_disk)), part.sha256);
        }
        let leftovers = std::fs::read_dir(dir.path().join("observations"))
            .expect("dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn postgres_identifiers_are_quoted_and_validated() {
        assert_eq!(validate_identifier("users3").expect("ok"), "\"users3\"");
        assert_eq!(
            validate_identifier("analytics.observations").expect("ok"),
            "\"analytics\".\"observations\""
        );
        assert!(validate_identifier("users; DROP TABLE x").is_err());

        let sql = create_table_sql("\"observations\"", OBSERVATIONS_SCHEMA);
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"observations\""));
        assert!(sql.contains("\"user_id\" TEXT NOT NULL"));
        assert!(sql.contains("\"issued\" TIMESTAMPTZ"));
        assert!(sql.contains("\"value\" DOUBLE PRECISION"));
    }
}
