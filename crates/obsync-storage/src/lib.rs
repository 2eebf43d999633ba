//! Watermark persistence + authenticated REST plumbing for obsync.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use obsync_core::Watermark;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "obsync-storage";

#[derive(Debug, Error)]
pub enum WatermarkError {
    #[error("watermark io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("watermark document at {path} is unreadable: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("watermark document is malformed: {0}")]
    Malformed(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Persisted "last synced" instant. Read once at run start, written once at the end.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn load(&self) -> Result<Option<Watermark>, WatermarkError>;

    /// Overwrites the watermark. The backend assigns `updated_at`.
    async fn store(&self, timestamp: DateTime<Utc>) -> Result<Watermark, WatermarkError>;
}

/// JSON file holding `{timestamp, updated_at}`, replaced atomically on every write.
#[derive(Debug, Clone)]
pub struct FileWatermarkStore {
    path: PathBuf,
}

impl FileWatermarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> WatermarkError {
        WatermarkError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl WatermarkStore for FileWatermarkStore {
    async fn load(&self) -> Result<Option<Watermark>, WatermarkError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(self.io_err(err)),
        };
        let watermark = serde_json::from_slice(&bytes).map_err(|source| WatermarkError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        Ok(Some(watermark))
    }

    async fn store(&self, timestamp: DateTime<Utc>) -> Result<Watermark, WatermarkError> {
        let watermark = Watermark {
            timestamp,
            updated_at: Some(Utc::now()),
        };
        let bytes = serde_json::to_vec_pretty(&watermark).map_err(|source| WatermarkError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        write_atomically(&self.path, &bytes)
            .await
            .map_err(|err| self.io_err(err))?;
        Ok(watermark)
    }
}

/// Writes `bytes` to a sibling temp file and renames it over `path`.
pub async fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).await?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {detail}")]
    HttpStatus {
        status: u16,
        url: String,
        detail: String,
    },
    #[error("access token unavailable: {0}")]
    Auth(String),
}

impl FetchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::HttpStatus { status: 404, .. })
    }
}

/// OAuth scope covering Firestore reads and writes.
pub const FIRESTORE_SCOPES: &[&str] = &["https://www.googleapis.com/auth/datastore"];

/// Supplies OAuth bearer tokens for outgoing requests.
#[async_trait]
pub trait TokenProvider: Send + Sync + std::fmt::Debug {
    async fn access_token(&self) -> Result<String, FetchError>;
}

/// A caller-supplied token, e.g. from `gcloud auth print-access-token`.
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self) -> Result<String, FetchError> {
        Ok(self.0.clone())
    }
}

/// Google credentials resolved by `gcp_auth`, which caches and refreshes tokens itself.
pub struct GoogleToken {
    label: &'static str,
    inner: Arc<dyn gcp_auth::TokenProvider>,
}

impl GoogleToken {
    pub fn new(label: &'static str, inner: Arc<dyn gcp_auth::TokenProvider>) -> Self {
        Self { label, inner }
    }

    pub fn label(&self) -> &str {
        self.label
    }
}

impl std::fmt::Debug for GoogleToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleToken").field("label", &self.label).finish()
    }
}

#[async_trait]
impl TokenProvider for GoogleToken {
    async fn access_token(&self) -> Result<String, FetchError> {
        let token = self
            .inner
            .token(FIRESTORE_SCOPES)
            .await
            .map_err(|err| FetchError::Auth(format!("{}: {err}", self.label)))?;
        Ok(token.as_str().to_string())
    }
}

/// Resolves the token provider: `OBSYNC_ACCESS_TOKEN`, then the service-account key named
/// by `GOOGLE_APPLICATION_CREDENTIALS`, then `gcp_auth`'s ambient chain (gcloud
/// application-default credentials, metadata server, gcloud CLI).
pub async fn token_provider_from_env() -> anyhow::Result<Arc<dyn TokenProvider>> {
    if let Ok(token) = std::env::var("OBSYNC_ACCESS_TOKEN") {
        if !token.trim().is_empty() {
            info!("using access token from OBSYNC_ACCESS_TOKEN");
            return Ok(Arc::new(StaticToken(token.trim().to_string())));
        }
    }

    if let Ok(path) = std::env::var("GOOGLE_APPLICATION_CREDENTIALS") {
        let path = PathBuf::from(path);
        if path.exists() {
            info!(path = %path.display(), "initializing with local credentials");
            return Ok(Arc::new(token_provider_from_file(&path)?));
        }
        warn!(path = %path.display(), "GOOGLE_APPLICATION_CREDENTIALS points at a missing file");
    }

    info!("initializing with application default credentials");
    let provider = gcp_auth::provider()
        .await
        .context("resolving application default credentials")?;
    Ok(Arc::new(GoogleToken::new("application-default", provider)))
}

/// Loads a service-account key file.
pub fn token_provider_from_file(path: &Path) -> anyhow::Result<GoogleToken> {
    let account = gcp_auth::CustomServiceAccount::from_file(path)
        .with_context(|| format!("loading service account key {}", path.display()))?;
    Ok(GoogleToken::new("service-account", Arc::new(account)))
}

fn truncate_detail(mut detail: String) -> String {
    const MAX: usize = 512;
    if detail.len() > MAX {
        let mut cut = MAX;
        while !detail.is_char_boundary(cut) {
            cut -= 1;
        }
        detail.truncate(cut);
    }
    detail
}

/// JSON-over-HTTPS client with bearer auth and bounded retries.
#[derive(Debug)]
pub struct RestClient {
    client: reqwest::Client,
    tokens: Option<Arc<dyn TokenProvider>>,
    backoff: BackoffPolicy,
}

impl RestClient {
    pub fn new(
        config: HttpClientConfig,
        tokens: Option<Arc<dyn TokenProvider>>,
    ) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            tokens,
            backoff: config.backoff,
        })
    }

    /// GET returning `None` on 404.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<Option<T>, FetchError> {
        match self.send(|| self.client.get(url)).await {
            Ok(resp) => Ok(Some(resp.json::<T>().await?)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn post_json<B, T>(&self, url: &str, body: &B) -> Result<T, FetchError>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let resp = self.send(|| self.client.post(url).json(body)).await?;
        Ok(resp.json::<T>().await?)
    }

    async fn send<F>(&self, build: F) -> Result<reqwest::Response, FetchError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let mut request = build();
            if let Some(tokens) = &self.tokens {
                request = request.bearer_auth(tokens.access_token().await?);
            }

            let span = info_span!("rest_request", attempt);
            match request.send().instrument(span).await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }

                    let url = resp.url().to_string();
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%status, %url, attempt, "retrying request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    let detail = resp.text().await.unwrap_or_default();
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url,
                        detail: truncate_detail(detail),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying request");
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        match last_request_error {
            Some(err) => Err(FetchError::Request(err)),
            None => Err(FetchError::Auth("retry loop exhausted without a response".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_watermark_file_means_full_sync() {
        let dir = tempdir().expect("tempdir");
        let store = FileWatermarkStore::new(dir.path().join("state").join("last_sync.json"));
        assert_eq!(store.load().await.expect("load"), None);
    }

    #[tokio::test]
    async fn stored_watermark_round_trips_with_backend_timestamp() {
        let dir = tempdir().expect("tempdir");
        let store = FileWatermarkStore::new(dir.path().join("state").join("last_sync.json"));
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().expect("ts");

        let written = store.store(ts).await.expect("store");
        assert!(written.updated_at.is_some());

        let loaded = store.load().await.expect("load").expect("present");
        assert_eq!(loaded.timestamp, ts);
        assert_eq!(loaded, written);

        let later = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).single().expect("ts");
        store.store(later).await.expect("overwrite");
        assert_eq!(store.load().await.expect("load").expect("present").timestamp, later);

        let leftovers = std::fs::read_dir(dir.path().join("state"))
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn corrupt_watermark_is_reported() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("last_sync.json");
        std::fs::write(&path, b"not json").expect("write");
        let err = FileWatermarkStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, WatermarkError::Corrupt { .. }));
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::SERVICE_UNAVAILABLE), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::NonRetryable);
    }

    fn credentials_fixture() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/credentials/test_service_account.json")
    }

    #[test]
    fn service_account_key_file_is_loaded() {
        let provider = token_provider_from_file(&credentials_fixture()).expect("service account");
        assert_eq!(provider.label(), "service-account");
    }

    #[test]
    fn unreadable_key_files_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("key.json");
        std::fs::write(&path, r#"{"type":"service_account","client_email":"x@y"}"#).expect("write");
        assert!(token_provider_from_file(&path).is_err());
        assert!(token_provider_from_file(&dir.path().join("missing.json")).is_err());
    }

    #[tokio::test]
    async fn static_token_is_passed_through() {
        let token = StaticToken("ya29.local".into());
        assert_eq!(token.access_token().await.expect("token"), "ya29.local");
    }

    #[test]
    fn long_error_bodies_are_truncated_on_char_boundaries() {
        let body = "é".repeat(400);
        let cut = truncate_detail(body);
        assert!(cut.len() <= 512);
        assert!(cut.chars().all(|c| c == 'é'));
    }
}
