//! Delta sync orchestration: watermark-bounded copy of users and health
//! observations from the document store into the warehouse.

pub mod warehouse;

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use obsync_core::{
    MetricRules, ObservationRecord, ObservationRow, UserRecord, UserRow, Watermark,
    WriteDisposition,
};
use obsync_source::{
    DocumentSource, FirestoreConfig, FirestoreSource, FirestoreWatermarkStore, FixtureSource,
    SourceError,
};
use obsync_storage::{
    token_provider_from_env, FileWatermarkStore, HttpClientConfig, RestClient, WatermarkStore,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use warehouse::{ParquetWarehouse, PostgresWarehouse, Warehouse, WarehouseError};

pub const CRATE_NAME: &str = "obsync-sync";

/// Where the next watermark comes from once a run has processed every group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WatermarkPolicy {
    /// The run's start instant, written even when some groups failed.
    SyncStart,
    /// The greatest `issued` instant actually uploaded, capped at the moment the first
    /// group was queried; held when any group failed.
    MaxIssued,
}

impl std::str::FromStr for WatermarkPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sync-start" | "sync_start" => Ok(Self::SyncStart),
            "max-issued" | "max_issued" => Ok(Self::MaxIssued),
            other => bail!("unknown watermark policy {other:?} (expected sync-start or max-issued)"),
        }
    }
}

pub fn parse_disposition(s: &str) -> Result<WriteDisposition> {
    match s.trim().to_ascii_lowercase().as_str() {
        "replace" | "truncate" => Ok(WriteDisposition::Replace),
        "append" => Ok(WriteDisposition::Append),
        other => bail!("unknown write disposition {other:?} (expected replace or append)"),
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub page_size: usize,
    pub page_delay: Duration,
    pub watermark_policy: WatermarkPolicy,
    pub users_disposition: WriteDisposition,
    pub metric_rules: MetricRules,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: 10,
            page_delay: Duration::from_millis(100),
            watermark_policy: WatermarkPolicy::SyncStart,
            users_disposition: WriteDisposition::Replace,
            metric_rules: MetricRules::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    Firestore,
    Fixture(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarehouseKind {
    Parquet(PathBuf),
    Postgres(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatermarkKind {
    Firestore,
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub source: SourceKind,
    pub firestore_project: Option<String>,
    pub firestore_database: String,
    pub warehouse: WarehouseKind,
    pub users_table: String,
    pub observations_table: String,
    pub watermark: WatermarkKind,
    pub page_size: usize,
    pub page_delay_ms: u64,
    pub watermark_policy: WatermarkPolicy,
    pub users_disposition: WriteDisposition,
    pub reports_dir: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub workspace_root: PathBuf,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("invalid {name}={raw:?}: {err}")),
        Err(_) => Ok(default),
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        let source = match env_or("OBSYNC_SOURCE", "firestore").as_str() {
            "firestore" => SourceKind::Firestore,
            "fixture" => SourceKind::Fixture(PathBuf::from(env_or(
                "OBSYNC_FIXTURE_PATH",
                "fixtures/firestore/sample/snapshot.json",
            ))),
            other => bail!("unknown OBSYNC_SOURCE {other:?} (expected firestore or fixture)"),
        };
        let warehouse = match env_or("OBSYNC_WAREHOUSE", "parquet").as_str() {
            "parquet" => WarehouseKind::Parquet(PathBuf::from(env_or(
                "OBSYNC_WAREHOUSE_DIR",
                "./warehouse",
            ))),
            "postgres" => WarehouseKind::Postgres(
                std::env::var("DATABASE_URL")
                    .context("DATABASE_URL is required for the postgres warehouse")?,
            ),
            other => bail!("unknown OBSYNC_WAREHOUSE {other:?} (expected parquet or postgres)"),
        };
        let default_watermark = if source == SourceKind::Firestore { "firestore" } else { "file" };
        let watermark = match env_or("OBSYNC_WATERMARK", default_watermark).as_str() {
            "firestore" => WatermarkKind::Firestore,
            "file" => WatermarkKind::File(PathBuf::from(env_or(
                "OBSYNC_WATERMARK_PATH",
                "./state/last_sync.json",
            ))),
            other => bail!("unknown OBSYNC_WATERMARK {other:?} (expected firestore or file)"),
        };

        Ok(Self {
            source,
            firestore_project: std::env::var("OBSYNC_FIRESTORE_PROJECT")
                .or_else(|_| std::env::var("GOOGLE_CLOUD_PROJECT"))
                .ok(),
            firestore_database: env_or("OBSYNC_FIRESTORE_DATABASE", "(default)"),
            warehouse,
            users_table: env_or("OBSYNC_USERS_TABLE", "users"),
            observations_table: env_or("OBSYNC_OBSERVATIONS_TABLE", "observations"),
            watermark,
            page_size: env_parse("OBSYNC_PAGE_SIZE", 10usize)?.max(1),
            page_delay_ms: env_parse("OBSYNC_PAGE_DELAY_MS", 100u64)?,
            watermark_policy: env_parse("OBSYNC_WATERMARK_POLICY", WatermarkPolicy::SyncStart)?,
            users_disposition: parse_disposition(&env_or("OBSYNC_USERS_WRITE", "replace"))?,
            reports_dir: match env_or("OBSYNC_REPORTS_DIR", "./reports") {
                dir if dir.is_empty() || dir == "off" => None,
                dir => Some(PathBuf::from(dir)),
            },
            scheduler_enabled: std::env::var("OBSYNC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: env_or("OBSYNC_SYNC_CRON", "0 0 6 * * *"),
            user_agent: env_or("OBSYNC_USER_AGENT", "obsync/0.1"),
            http_timeout_secs: env_parse("OBSYNC_HTTP_TIMEOUT_SECS", 20u64)?,
            workspace_root: PathBuf::from(env_or("OBSYNC_WORKSPACE_ROOT", ".")),
        })
    }

    fn needs_firestore(&self) -> bool {
        self.source == SourceKind::Firestore || self.watermark == WatermarkKind::Firestore
    }

    fn firestore_config(&self) -> Result<FirestoreConfig> {
        let project = self
            .firestore_project
            .clone()
            .context("OBSYNC_FIRESTORE_PROJECT or GOOGLE_CLOUD_PROJECT must name the Firestore project")?;
        let mut config = FirestoreConfig::new(project);
        config.database_id = self.firestore_database.clone();
        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct MetricRulesFile {
    version: u32,
    prefixes: Vec<String>,
    #[serde(default)]
    fallback: Option<String>,
}

const METRIC_RULES_VERSION: u32 = 1;

/// Loads `rules/metric_prefixes.yaml` when present, else the built-in rules.
pub fn load_metric_rules(workspace_root: &Path) -> Result<MetricRules> {
    let path = workspace_root.join("rules").join("metric_prefixes.yaml");
    if !path.exists() {
        return Ok(MetricRules::default());
    }
    let file: MetricRulesFile = serde_yaml::from_str(
        &std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?,
    )
    .with_context(|| format!("parsing {}", path.display()))?;
    if file.version != METRIC_RULES_VERSION {
        bail!(
            "{} has version {}; only version {METRIC_RULES_VERSION} is supported",
            path.display(),
            file.version
        );
    }
    let defaults = MetricRules::default();
    Ok(MetricRules {
        prefixes: file.prefixes,
        fallback: file.fallback.unwrap_or(defaults.fallback),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Reading from the document store.
    Query,
    /// Writing to the warehouse.
    Upload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl PhaseFailure {
    fn query(err: &SourceError) -> Self {
        Self {
            kind: FailureKind::Query,
            message: err.to_string(),
        }
    }

    fn upload(err: &WarehouseError) -> Self {
        Self {
            kind: FailureKind::Upload,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SyncMode {
    Full,
    Delta { since: DateTime<Utc> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPhase {
    pub pages: usize,
    pub scanned: usize,
    pub added: usize,
    pub failure: Option<PhaseFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GroupStatus {
    Synced {
        observations: usize,
        skipped_documents: usize,
        max_issued: Option<DateTime<Utc>>,
    },
    Failed(PhaseFailure),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupOutcome {
    pub group: String,
    pub metric: String,
    pub status: GroupStatus,
}

impl GroupOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, GroupStatus::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WatermarkOutcome {
    Advanced { to: DateTime<Utc> },
    Held { reason: String },
    Unchanged,
    NotRecorded { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Partial,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source: String,
    pub warehouse: String,
    pub mode: SyncMode,
    pub users: UserPhase,
    pub registry_failure: Option<PhaseFailure>,
    pub groups: Vec<GroupOutcome>,
    pub observations_uploaded: usize,
    pub watermark: WatermarkOutcome,
}

impl SyncSummary {
    pub fn failed_groups(&self) -> impl Iterator<Item = &GroupOutcome> {
        self.groups.iter().filter(|g| g.is_failed())
    }

    pub fn status(&self) -> RunStatus {
        let any_failure = self.users.failure.is_some()
            || self.registry_failure.is_some()
            || self.groups.iter().any(GroupOutcome::is_failed);
        let any_success =
            self.users.failure.is_none() || self.groups.iter().any(|g| !g.is_failed());
        match (any_failure, any_success) {
            (false, _) => RunStatus::Completed,
            (true, true) => RunStatus::Partial,
            (true, false) => RunStatus::Failed,
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("loading the existing user snapshot: {0}")]
    Snapshot(#[source] WarehouseError),
}

/// Single-writer, sequential delta sync over owned client handles.
pub struct SyncEngine {
    config: EngineConfig,
    source: Box<dyn DocumentSource>,
    warehouse: Box<dyn Warehouse>,
    watermarks: Box<dyn WatermarkStore>,
}

impl SyncEngine {
    pub fn new(
        config: EngineConfig,
        source: Box<dyn DocumentSource>,
        warehouse: Box<dyn Warehouse>,
        watermarks: Box<dyn WatermarkStore>,
    ) -> Self {
        Self {
            config,
            source,
            warehouse,
            watermarks,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn run_sync(&self) -> Result<SyncSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);
        self.run_sync_inner(run_id).instrument(span).await
    }

    async fn run_sync_inner(&self, run_id: Uuid) -> Result<SyncSummary, SyncError> {
        let started_at = Utc::now();
        let previous = self.resolve_watermark().await;
        let since = previous.map(|w| w.timestamp);
        let mode = match since {
            Some(since) => {
                info!(%since, "running delta sync for documents issued after watermark");
                SyncMode::Delta { since }
            }
            None => {
                info!("running full sync (no previous watermark)");
                SyncMode::Full
            }
        };

        let users = self.sync_users(started_at).await?;

        let mut registry_failure = None;
        let groups = match self.source.observation_groups().await {
            Ok(groups) => groups,
            Err(err) => {
                error!(error = %err, "could not read the observation group registry");
                registry_failure = Some(PhaseFailure::query(&err));
                Vec::new()
            }
        };

        let groups_started_at = Utc::now();
        let mut outcomes = Vec::with_capacity(groups.len());
        for group in &groups {
            let outcome = self
                .sync_group(group, since)
                .instrument(info_span!("group", group = %group))
                .await;
            outcomes.push(outcome);
        }
        let observations_uploaded = outcomes
            .iter()
            .map(|o| match o.status {
                GroupStatus::Synced { observations, .. } => observations,
                GroupStatus::Failed(_) => 0,
            })
            .sum();

        let watermark = self
            .advance_watermark(
                started_at,
                groups_started_at,
                since,
                registry_failure.is_some(),
                &outcomes,
            )
            .await;

        let summary = SyncSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            source: self.source.describe(),
            warehouse: self.warehouse.describe(),
            mode,
            users,
            registry_failure,
            groups: outcomes,
            observations_uploaded,
            watermark,
        };
        info!(
            status = ?summary.status(),
            users_scanned = summary.users.scanned,
            users_added = summary.users.added,
            groups = summary.groups.len(),
            failed_groups = summary.failed_groups().count(),
            observations = summary.observations_uploaded,
            "sync finished"
        );
        Ok(summary)
    }

    async fn resolve_watermark(&self) -> Option<Watermark> {
        match self.watermarks.load().await {
            Ok(Some(watermark)) => {
                info!(timestamp = %watermark.timestamp, "last sync watermark");
                Some(watermark)
            }
            Ok(None) => {
                info!("no previous sync found");
                None
            }
            Err(err) => {
                warn!(error = %err, "could not retrieve last sync watermark; falling back to full sync");
                None
            }
        }
    }

    async fn sync_users(&self, started_at: DateTime<Utc>) -> Result<UserPhase, SyncError> {
        let known = self
            .warehouse
            .existing_user_ids()
            .await
            .map_err(SyncError::Snapshot)?;
        info!(known = known.len(), "loaded existing user snapshot");

        let mut phase = UserPhase::default();
        let unseen = match self.scan_unseen_users(&known, &mut phase).await {
            Ok(unseen) => unseen,
            Err(err) => {
                error!(error = %err, scanned = phase.scanned, "user scan failed");
                phase.failure = Some(PhaseFailure::query(&err));
                return Ok(phase);
            }
        };

        if unseen.is_empty() {
            info!(scanned = phase.scanned, "no new users");
            return Ok(phase);
        }

        let rows: Vec<UserRow> = unseen
            .iter()
            .map(|user| UserRow::from_record(user, started_at))
            .collect();
        match self
            .warehouse
            .write_users(&rows, self.config.users_disposition)
            .await
        {
            Ok(written) => {
                info!(written, "uploaded users");
                phase.added = written;
            }
            Err(err) => {
                error!(error = %err, pending = rows.len(), "user upload failed");
                phase.failure = Some(PhaseFailure::upload(&err));
            }
        }
        Ok(phase)
    }

    /// Pages through the users collection and keeps users absent from `known`.
    async fn scan_unseen_users(
        &self,
        known: &HashSet<String>,
        phase: &mut UserPhase,
    ) -> Result<Vec<UserRecord>, SourceError> {
        let mut unseen = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let page = self
                .source
                .users_page(self.config.page_size, cursor.as_deref())
                .await?;
            phase.pages += 1;
            if page.items.is_empty() {
                break;
            }

            phase.scanned += page.items.len();
            for user in page.items {
                if !known.contains(&user.user_id) {
                    info!(user_id = %user.user_id, "new user");
                    unseen.push(user);
                }
            }

            match page.next_cursor {
                Some(next) if cursor.as_deref() != Some(next.as_str()) => {
                    cursor = Some(next);
                    if !self.config.page_delay.is_zero() {
                        tokio::time::sleep(self.config.page_delay).await;
                    }
                }
                Some(_) => {
                    warn!("user pagination cursor did not advance; stopping scan");
                    break;
                }
                None => break,
            }
        }
        Ok(unseen)
    }

    async fn sync_group(&self, group: &str, since: Option<DateTime<Utc>>) -> GroupOutcome {
        let metric = self.config.metric_rules.clean(group);
        let failed = |failure: PhaseFailure| GroupOutcome {
            group: group.to_string(),
            metric: metric.clone(),
            status: GroupStatus::Failed(failure),
        };

        let docs = match self.source.observations_since(group, since).await {
            Ok(docs) => docs,
            Err(err) => {
                error!(error = %err, "observation query failed; skipping group");
                return failed(PhaseFailure::query(&err));
            }
        };

        let total = docs.len();
        let records: Vec<ObservationRecord> = docs
            .iter()
            .filter_map(|doc| ObservationRecord::from_document(doc, &metric))
            .collect();
        let skipped_documents = total - records.len();
        let max_issued = records.iter().filter_map(|r| r.issued).max();
        info!(collected = records.len(), skipped_documents, "collected observations");

        if records.is_empty() {
            return GroupOutcome {
                group: group.to_string(),
                metric,
                status: GroupStatus::Synced {
                    observations: 0,
                    skipped_documents,
                    max_issued: None,
                },
            };
        }

        let synced_at = Utc::now();
        let rows: Vec<ObservationRow> = records
            .into_iter()
            .map(|record| ObservationRow { record, synced_at })
            .collect();
        match self
            .warehouse
            .write_observations(&rows, WriteDisposition::Append)
            .await
        {
            Ok(written) => {
                info!(written, "uploaded observations");
                GroupOutcome {
                    group: group.to_string(),
                    metric,
                    status: GroupStatus::Synced {
                        observations: written,
                        skipped_documents,
                        max_issued,
                    },
                }
            }
            Err(err) => {
                error!(error = %err, "observation upload failed; skipping group");
                failed(PhaseFailure::upload(&err))
            }
        }
    }

    async fn advance_watermark(
        &self,
        started_at: DateTime<Utc>,
        groups_started_at: DateTime<Utc>,
        previous: Option<DateTime<Utc>>,
        registry_failed: bool,
        outcomes: &[GroupOutcome],
    ) -> WatermarkOutcome {
        if registry_failed {
            return WatermarkOutcome::Held {
                reason: "group registry unavailable".into(),
            };
        }

        let target = match self.config.watermark_policy {
            WatermarkPolicy::SyncStart => started_at,
            WatermarkPolicy::MaxIssued => {
                let failed = outcomes.iter().filter(|o| o.is_failed()).count();
                if failed > 0 {
                    return WatermarkOutcome::Held {
                        reason: format!("{failed} group(s) failed"),
                    };
                }
                let max_issued = outcomes
                    .iter()
                    .filter_map(|o| match o.status {
                        GroupStatus::Synced { max_issued, .. } => max_issued,
                        GroupStatus::Failed(_) => None,
                    })
                    .max()
                    // Groups queried earlier may receive writes while later groups run.
                    .map(|max| max.min(groups_started_at));
                match (max_issued, previous) {
                    (Some(max), Some(prev)) if max <= prev => return WatermarkOutcome::Unchanged,
                    (Some(max), _) => max,
                    (None, _) => return WatermarkOutcome::Unchanged,
                }
            }
        };

        match self.watermarks.store(target).await {
            Ok(written) => {
                info!(timestamp = %written.timestamp, "updated sync watermark");
                WatermarkOutcome::Advanced {
                    to: written.timestamp,
                }
            }
            Err(err) => {
                error!(error = %err, "failed to update sync watermark");
                WatermarkOutcome::NotRecorded {
                    message: err.to_string(),
                }
            }
        }
    }
}

/// Wires the engine from `SyncConfig`.
pub async fn build_engine(config: &SyncConfig) -> Result<SyncEngine> {
    let http = if config.needs_firestore() {
        let tokens = token_provider_from_env().await?;
        Some(Arc::new(RestClient::new(
            HttpClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
                ..Default::default()
            },
            Some(tokens),
        )?))
    } else {
        None
    };

    let source: Box<dyn DocumentSource> = match &config.source {
        SourceKind::Firestore => {
            let http = http.clone().context("firestore source needs an http client")?;
            Box::new(FirestoreSource::new(config.firestore_config()?, http))
        }
        SourceKind::Fixture(path) => Box::new(FixtureSource::load(config.workspace_root.join(path))?),
    };

    let watermarks: Box<dyn WatermarkStore> = match &config.watermark {
        WatermarkKind::Firestore => {
            let http = http.clone().context("firestore watermark needs an http client")?;
            Box::new(FirestoreWatermarkStore::new(config.firestore_config()?, http))
        }
        WatermarkKind::File(path) => Box::new(FileWatermarkStore::new(path.clone())),
    };

    let warehouse = open_warehouse(config).await?;

    let engine_config = EngineConfig {
        page_size: config.page_size,
        page_delay: Duration::from_millis(config.page_delay_ms),
        watermark_policy: config.watermark_policy,
        users_disposition: config.users_disposition,
        metric_rules: load_metric_rules(&config.workspace_root)?,
    };
    Ok(SyncEngine::new(engine_config, source, warehouse, watermarks))
}

async fn open_warehouse(config: &SyncConfig) -> Result<Box<dyn Warehouse>> {
    let warehouse: Box<dyn Warehouse> = match &config.warehouse {
        WarehouseKind::Parquet(dir) => Box::new(ParquetWarehouse::new(
            dir.clone(),
            config.users_table.clone(),
            config.observations_table.clone(),
        )),
        WarehouseKind::Postgres(url) => {
            let wh = PostgresWarehouse::connect(url, &config.users_table, &config.observations_table)
                .await
                .context("connecting to postgres warehouse")?;
            wh.ensure_schema().await.context("creating warehouse tables")?;
            Box::new(wh)
        }
    };
    Ok(warehouse)
}

#[derive(Debug, Clone)]
pub struct CompletedRun {
    pub summary: SyncSummary,
    pub report_dir: Option<PathBuf>,
}

pub async fn run_sync_once_from_env() -> Result<CompletedRun> {
    let config = SyncConfig::from_env()?;
    let engine = build_engine(&config).await?;
    run_and_report(&engine, config.reports_dir.as_deref()).await
}

async fn run_and_report(engine: &SyncEngine, reports_dir: Option<&Path>) -> Result<CompletedRun> {
    let summary = engine.run_sync().await?;
    let report_dir = match reports_dir {
        Some(root) => Some(write_run_report(root, &summary).await?),
        None => None,
    };
    Ok(CompletedRun {
        summary,
        report_dir,
    })
}

/// Creates the Postgres tables; other warehouses need no preparation.
pub async fn migrate_from_env() -> Result<String> {
    let config = SyncConfig::from_env()?;
    match &config.warehouse {
        WarehouseKind::Postgres(_) => {
            let wh = open_warehouse(&config).await?;
            Ok(format!("warehouse tables ready: {}", wh.describe()))
        }
        WarehouseKind::Parquet(dir) => Ok(format!(
            "parquet warehouse at {} needs no migration",
            dir.display()
        )),
    }
}

pub async fn show_watermark_from_env() -> Result<Option<Watermark>> {
    let config = SyncConfig::from_env()?;
    let engine = build_engine(&config).await?;
    Ok(engine.watermarks.load().await?)
}

pub fn brief_markdown(summary: &SyncSummary) -> String {
    let mut metrics: BTreeMap<&str, usize> = BTreeMap::new();
    for group in &summary.groups {
        if let GroupStatus::Synced { observations, .. } = group.status {
            *metrics.entry(group.metric.as_str()).or_default() += observations;
        }
    }
    let mode = match &summary.mode {
        SyncMode::Full => "full".to_string(),
        SyncMode::Delta { since } => format!("delta since {since}"),
    };
    let watermark = match &summary.watermark {
        WatermarkOutcome::Advanced { to } => format!("advanced to {to}"),
        WatermarkOutcome::Held { reason } => format!("held ({reason})"),
        WatermarkOutcome::Unchanged => "unchanged".to_string(),
        WatermarkOutcome::NotRecorded { message } => format!("not recorded ({message})"),
    };

    let mut lines = vec![
        "# obsync Sync Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Status: {:?}", summary.status()),
        format!("- Mode: {mode}"),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Users scanned: {}", summary.users.scanned),
        format!("- Users added: {}", summary.users.added),
        format!("- Observations uploaded: {}", summary.observations_uploaded),
        format!("- Watermark: {watermark}"),
        String::new(),
        "## Metrics".to_string(),
    ];
    lines.extend(metrics.iter().map(|(k, v)| format!("- {k}: {v}")));

    let failures: Vec<String> = summary
        .users
        .failure
        .iter()
        .map(|f| format!("- users ({:?}): {}", f.kind, f.message))
        .chain(
            summary
                .registry_failure
                .iter()
                .map(|f| format!("- registry: {}", f.message)),
        )
        .chain(summary.failed_groups().filter_map(|g| match &g.status {
            GroupStatus::Failed(f) => Some(format!("- {} ({:?}): {}", g.group, f.kind, f.message)),
            GroupStatus::Synced { .. } => None,
        }))
        .collect();
    if !failures.is_empty() {
        lines.push(String::new());
        lines.push("## Failures".to_string());
        lines.extend(failures);
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Writes `<root>/<run_id>/sync_summary.json` and `sync_brief.md`.
pub async fn write_run_report(root: &Path, summary: &SyncSummary) -> Result<PathBuf> {
    let dir = root.join(summary.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing sync summary")?;
    fs::write(dir.join("sync_summary.json"), json)
        .await
        .context("writing sync_summary.json")?;
    fs::write(dir.join("sync_brief.md"), brief_markdown(summary))
        .await
        .context("writing sync_brief.md")?;
    Ok(dir)
}

/// Markdown digest of the most recent `runs` reports under `reports_root`.
pub fn recent_runs_markdown(reports_root: &Path, runs: usize) -> Result<String> {
    let mut summaries = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .map(|entry| entry.path().join("sync_summary.json"))
        .filter(|path| path.exists())
        .map(|path| -> Result<SyncSummary> {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;
    summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    let mut lines = vec!["# obsync Recent Runs".to_string(), String::new()];
    for summary in summaries.iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- started: {}", summary.started_at));
        lines.push(format!("- status: {:?}", summary.status()));
        lines.push(format!("- users added: {}", summary.users.added));
        lines.push(format!("- observations: {}", summary.observations_uploaded));
        lines.push(format!("- failed groups: {}", summary.failed_groups().count()));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

/// Runs the engine on `cron`, skipping a firing while the previous run is still going.
pub async fn build_scheduler(
    engine: Arc<SyncEngine>,
    cron: &str,
    reports_dir: Option<PathBuf>,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let running = Arc::new(Mutex::new(()));

    let job = Job::new_async(cron, move |_uuid, _l| {
        let engine = Arc::clone(&engine);
        let running = Arc::clone(&running);
        let reports_dir = reports_dir.clone();
        Box::pin(async move {
            let Ok(_guard) = running.try_lock() else {
                warn!("previous sync still running; skipping scheduled run");
                return;
            };
            match run_and_report(&engine, reports_dir.as_deref()).await {
                Ok(run) => info!(
                    run_id = %run.summary.run_id,
                    status = ?run.summary.status(),
                    "scheduled sync finished"
                ),
                Err(err) => error!(error = %err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

pub async fn run_scheduler_from_env() -> Result<()> {
    let config = SyncConfig::from_env()?;
    if !config.scheduler_enabled {
        bail!("scheduler disabled; set OBSYNC_SCHEDULER_ENABLED=true");
    }
    let engine = Arc::new(build_engine(&config).await?);
    let mut sched = build_scheduler(engine, &config.sync_cron, config.reports_dir.clone()).await?;
    sched.start().await.context("starting scheduler")?;
    info!(cron = %config.sync_cron, "scheduler started");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).single().expect("ts")
    }

    fn summary_with(groups: Vec<GroupOutcome>, users_failed: bool) -> SyncSummary {
        SyncSummary {
            run_id: Uuid::nil(),
            started_at: ts(2024, 1, 5),
            finished_at: ts(2024, 1, 5),
            source: "fixture:test".into(),
            warehouse: "parquet:test".into(),
            mode: SyncMode::Delta {
                since: ts(2024, 1, 1),
            },
            users: UserPhase {
                failure: users_failed.then(|| PhaseFailure {
                    kind: FailureKind::Upload,
                    message: "boom".into(),
                }),
                ..Default::default()
            },
            registry_failure: None,
            groups,
            observations_uploaded: 0,
            watermark: WatermarkOutcome::Unchanged,
        }
    }

    fn synced(group: &str, n: usize) -> GroupOutcome {
        GroupOutcome {
            group: group.into(),
            metric: group.into(),
            status: GroupStatus::Synced {
                observations: n,
                skipped_documents: 0,
                max_issued: None,
            },
        }
    }

    fn failed(group: &str) -> GroupOutcome {
        GroupOutcome {
            group: group.into(),
            metric: group.into(),
            status: GroupStatus::Failed(PhaseFailure {
                kind: FailureKind::Query,
                message: "missing index".into(),
            }),
        }
    }

    #[test]
    fn run_status_distinguishes_partial_and_total_failure() {
        assert_eq!(summary_with(vec![synced("A", 1)], false).status(), RunStatus::Completed);
        assert_eq!(
            summary_with(vec![synced("A", 1), failed("B")], false).status(),
            RunStatus::Partial
        );
        assert_eq!(summary_with(vec![failed("A")], false).status(), RunStatus::Partial);
        assert_eq!(summary_with(vec![failed("A")], true).status(), RunStatus::Failed);
    }

    #[test]
    fn policies_and_dispositions_parse() {
        assert_eq!(
            "sync-start".parse::<WatermarkPolicy>().expect("policy"),
            WatermarkPolicy::SyncStart
        );
        assert_eq!(
            "MAX_ISSUED".parse::<WatermarkPolicy>().expect("policy"),
            WatermarkPolicy::MaxIssued
        );
        assert!("latest".parse::<WatermarkPolicy>().is_err());
        assert_eq!(EngineConfig::default().watermark_policy, WatermarkPolicy::SyncStart);
        assert_eq!(parse_disposition("append").expect("append"), WriteDisposition::Append);
        assert_eq!(parse_disposition("Replace").expect("replace"), WriteDisposition::Replace);
        assert!(parse_disposition("merge").is_err());
    }

    #[test]
    fn metric_rules_fall_back_to_builtin_without_yaml() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(load_metric_rules(dir.path()).expect("rules"), MetricRules::default());

        std::fs::create_dir_all(dir.path().join("rules")).expect("mkdir");
        std::fs::write(
            dir.path().join("rules").join("metric_prefixes.yaml"),
            "version: 1\nprefixes:\n  - Obs_\n",
        )
        .expect("write");
        let rules = load_metric_rules(dir.path()).expect("rules");
        assert_eq!(rules.clean("Obs_HeartRate"), "HeartRate");
        assert_eq!(rules.clean("Obs_"), "Workout");

        std::fs::write(
            dir.path().join("rules").join("metric_prefixes.yaml"),
            "version: 2\nprefixes:\n  - Obs_\n",
        )
        .expect("write");
        let err = load_metric_rules(dir.path()).unwrap_err();
        assert!(err.to_string().contains("only version 1"));
    }

    #[test]
    fn brief_lists_failures_and_metric_counts() {
        let summary = summary_with(vec![synced("StepCount", 3), failed("HeartRate")], false);
        let brief = brief_markdown(&summary);
        assert!(brief.contains("- StepCount: 3"));
        assert!(brief.contains("## Failures"));
        assert!(brief.contains("HeartRate (Query): missing index"));
        assert!(brief.contains("Status: Partial"));
    }

    #[tokio::test]
    async fn reports_round_trip_into_recent_runs_digest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let summary = summary_with(vec![synced("StepCount", 2)], false);
        let run_dir = write_run_report(dir.path(), &summary).await.expect("report");
        assert!(run_dir.join("sync_brief.md").exists());

        let digest = recent_runs_markdown(dir.path(), 5).expect("digest");
        assert!(digest.contains(&format!("## Run `{}`", Uuid::nil())));
        assert!(digest.contains("- status: Completed"));
    }
}
