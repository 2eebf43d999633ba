//! Document-store sources: the `DocumentSource` contract, the Firestore REST
//! implementation, and a fixture-backed implementation for local runs.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use obsync_core::{parse_instant, Page, RawDocument, UserRecord, Watermark};
use obsync_storage::{FetchError, RestClient, WatermarkError, WatermarkStore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "obsync-source";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed source response: {0}")]
    Malformed(String),
}

/// Read side of the document store.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    fn describe(&self) -> String;

    /// One page of the users collection, ordered by document key, starting after `cursor`.
    async fn users_page(
        &self,
        page_size: usize,
        cursor: Option<&str>,
    ) -> Result<Page<UserRecord>, SourceError>;

    /// Names of the observation groups listed in the registry document.
    async fn observation_groups(&self) -> Result<Vec<String>, SourceError>;

    /// Every document of `group` across all users with `issued > since`, ordered by
    /// `issued`. `None` returns the whole group.
    async fn observations_since(
        &self,
        group: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawDocument>, SourceError>;
}

pub fn format_instant(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Decodes a typed Firestore REST value (`{"stringValue": ..}`, `{"mapValue": ..}`, ...)
/// into plain JSON. Timestamps stay RFC 3339 text.
pub fn decode_value(value: &JsonValue) -> JsonValue {
    let Some((kind, inner)) = value.as_object().and_then(|obj| obj.iter().next()) else {
        return JsonValue::Null;
    };
    match kind.as_str() {
        "nullValue" => JsonValue::Null,
        "integerValue" => inner
            .as_str()
            .and_then(|s| s.parse::<i64>().ok())
            .map(JsonValue::from)
            .unwrap_or_else(|| inner.clone()),
        "booleanValue" | "doubleValue" | "stringValue" | "timestampValue" | "referenceValue"
        | "bytesValue" | "geoPointValue" => inner.clone(),
        "mapValue" => JsonValue::Object(decode_fields(inner.get("fields"))),
        "arrayValue" => JsonValue::Array(
            inner
                .get("values")
                .and_then(JsonValue::as_array)
                .map(|values| values.iter().map(decode_value).collect())
                .unwrap_or_default(),
        ),
        other => {
            debug!(kind = other, "unknown firestore value kind");
            JsonValue::Null
        }
    }
}

pub fn decode_fields(fields: Option<&JsonValue>) -> Map<String, JsonValue> {
    fields
        .and_then(JsonValue::as_object)
        .map(|fields| {
            fields
                .iter()
                .map(|(name, value)| (name.clone(), decode_value(value)))
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Clone, Deserialize)]
struct FirestoreDocument {
    name: String,
    #[serde(default)]
    fields: Option<JsonValue>,
}

impl FirestoreDocument {
    fn into_raw(self) -> RawDocument {
        RawDocument {
            fields: decode_fields(self.fields.as_ref()),
            path: self.name,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RunQueryItem {
    #[serde(default)]
    document: Option<FirestoreDocument>,
}

#[derive(Debug, Clone)]
pub struct FirestoreConfig {
    pub project_id: String,
    pub database_id: String,
    pub base_url: String,
    pub users_collection: String,
    pub registry_document: String,
    pub watermark_document: String,
    pub issued_field: String,
}

impl FirestoreConfig {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database_id: "(default)".to_string(),
            base_url: "https://firestore.googleapis.com/v1".to_string(),
            users_collection: "users".to_string(),
            registry_document: "variables/healthobservation_cols".to_string(),
            watermark_document: "_sync_metadata/last_sync".to_string(),
            issued_field: "issued".to_string(),
        }
    }

    /// `projects/{p}/databases/{d}/documents`
    pub fn documents_root(&self) -> String {
        format!(
            "projects/{}/databases/{}/documents",
            self.project_id, self.database_id
        )
    }

    fn url(&self, suffix: &str) -> String {
        format!(
            "{}/{}{}",
            self.base_url.trim_end_matches('/'),
            self.documents_root(),
            suffix
        )
    }

    pub fn users_query(&self, page_size: usize, cursor: Option<&str>) -> JsonValue {
        let mut query = json!({
            "from": [{"collectionId": self.users_collection}],
            "orderBy": [{"field": {"fieldPath": "__name__"}, "direction": "ASCENDING"}],
            "limit": page_size,
        });
        if let Some(cursor) = cursor {
            query["startAt"] = json!({
                "values": [{"referenceValue": cursor}],
                "before": false,
            });
        }
        json!({ "structuredQuery": query })
    }

    pub fn group_query(&self, group: &str, since: Option<DateTime<Utc>>) -> JsonValue {
        let mut query = json!({
            "from": [{"collectionId": group, "allDescendants": true}],
        });
        if let Some(since) = since {
            query["where"] = json!({
                "fieldFilter": {
                    "field": {"fieldPath": self.issued_field},
                    "op": "GREATER_THAN",
                    "value": {"timestampValue": format_instant(since)},
                }
            });
            query["orderBy"] = json!([
                {"field": {"fieldPath": self.issued_field}, "direction": "ASCENDING"}
            ]);
        }
        json!({ "structuredQuery": query })
    }
}

/// Firestore over its REST API.
#[derive(Debug, Clone)]
pub struct FirestoreSource {
    config: FirestoreConfig,
    http: Arc<RestClient>,
}

impl FirestoreSource {
    pub fn new(config: FirestoreConfig, http: Arc<RestClient>) -> Self {
        Self { config, http }
    }

    async fn run_query(&self, body: &JsonValue) -> Result<Vec<RawDocument>, SourceError> {
        let items: Vec<RunQueryItem> = self
            .http
            .post_json(&self.config.url(":runQuery"), body)
            .await?;
        Ok(items
            .into_iter()
            .filter_map(|item| item.document)
            .map(FirestoreDocument::into_raw)
            .collect())
    }
}

#[async_trait]
impl DocumentSource for FirestoreSource {
    fn describe(&self) -> String {
        format!("firestore:{}", self.config.documents_root())
    }

    async fn users_page(
        &self,
        page_size: usize,
        cursor: Option<&str>,
    ) -> Result<Page<UserRecord>, SourceError> {
        let docs = self
            .run_query(&self.config.users_query(page_size, cursor))
            .await?;
        let next_cursor = if docs.len() >= page_size {
            docs.last().map(|doc| doc.path.clone())
        } else {
            None
        };
        let items = docs
            .iter()
            .map(|doc| {
                UserRecord::from_document(doc)
                    .ok_or_else(|| SourceError::Malformed(format!("user document without id: {}", doc.path)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page { items, next_cursor })
    }

    async fn observation_groups(&self) -> Result<Vec<String>, SourceError> {
        let url = self.config.url(&format!("/{}", self.config.registry_document));
        let Some(doc) = self.http.get_json::<FirestoreDocument>(&url).await? else {
            warn!(document = %self.config.registry_document, "group registry document not found");
            return Ok(Vec::new());
        };
        registry_groups(&doc.into_raw())
    }

    async fn observations_since(
        &self,
        group: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawDocument>, SourceError> {
        self.run_query(&self.config.group_query(group, since)).await
    }
}

fn registry_groups(doc: &RawDocument) -> Result<Vec<String>, SourceError> {
    match doc.fields.get("cols") {
        None | Some(JsonValue::Null) => Ok(Vec::new()),
        Some(JsonValue::Array(values)) => values
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| SourceError::Malformed(format!("non-string group name {v}")))
            })
            .collect(),
        Some(other) => Err(SourceError::Malformed(format!(
            "registry `cols` is not a list: {other}"
        ))),
    }
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    #[serde(default, rename = "writeResults")]
    write_results: Vec<WriteResult>,
    #[serde(default, rename = "commitTime")]
    commit_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WriteResult {
    #[serde(default, rename = "transformResults")]
    transform_results: Vec<JsonValue>,
}

/// Watermark kept in a single Firestore document as `{timestamp, updated_at}`.
#[derive(Debug, Clone)]
pub struct FirestoreWatermarkStore {
    config: FirestoreConfig,
    http: Arc<RestClient>,
}

impl FirestoreWatermarkStore {
    pub fn new(config: FirestoreConfig, http: Arc<RestClient>) -> Self {
        Self { config, http }
    }

    pub fn commit_body(&self, timestamp: DateTime<Utc>) -> JsonValue {
        json!({
            "writes": [{
                "update": {
                    "name": format!("{}/{}", self.config.documents_root(), self.config.watermark_document),
                    "fields": {"timestamp": {"timestampValue": format_instant(timestamp)}},
                },
                "updateTransforms": [
                    {"fieldPath": "updated_at", "setToServerValue": "REQUEST_TIME"}
                ],
            }]
        })
    }
}

#[async_trait]
impl WatermarkStore for FirestoreWatermarkStore {
    async fn load(&self) -> Result<Option<Watermark>, WatermarkError> {
        let url = self.config.url(&format!("/{}", self.config.watermark_document));
        let Some(doc) = self.http.get_json::<FirestoreDocument>(&url).await? else {
            return Ok(None);
        };
        let doc = doc.into_raw();
        let timestamp = doc
            .fields
            .get("timestamp")
            .and_then(parse_instant)
            .ok_or_else(|| WatermarkError::Malformed(format!("{} has no timestamp", doc.path)))?;
        Ok(Some(Watermark {
            timestamp,
            updated_at: doc.fields.get("updated_at").and_then(parse_instant),
        }))
    }

    async fn store(&self, timestamp: DateTime<Utc>) -> Result<Watermark, WatermarkError> {
        let resp: CommitResponse = self
            .http
            .post_json(&self.config.url(":commit"), &self.commit_body(timestamp))
            .await?;
        let updated_at = resp
            .write_results
            .first()
            .and_then(|w| w.transform_results.first())
            .map(decode_value)
            .and_then(|v| parse_instant(&v))
            .or_else(|| {
                resp.commit_time
                    .as_ref()
                    .and_then(|t| parse_instant(&JsonValue::String(t.clone())))
            });
        Ok(Watermark {
            timestamp,
            updated_at,
        })
    }
}

/// Snapshot of a document store as a JSON file: users with their observation
/// sub-collections, plus the group registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureSnapshot {
    #[serde(default)]
    pub registry: Vec<String>,
    #[serde(default)]
    pub users: Vec<FixtureUser>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureUser {
    pub id: String,
    #[serde(default)]
    pub fields: Map<String, JsonValue>,
    #[serde(default)]
    pub collections: std::collections::BTreeMap<String, Vec<FixtureDocument>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureDocument {
    pub id: String,
    #[serde(default)]
    pub fields: Map<String, JsonValue>,
}

pub fn load_fixture_snapshot(path: impl AsRef<Path>) -> Result<FixtureSnapshot> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Serves a `FixtureSnapshot` with the same ordering, filtering and paging as Firestore.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    label: String,
    snapshot: FixtureSnapshot,
}

impl FixtureSource {
    pub fn new(label: impl Into<String>, mut snapshot: FixtureSnapshot) -> Self {
        snapshot.users.sort_by(|a, b| a.id.cmp(&b.id));
        Self {
            label: label.into(),
            snapshot,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        Ok(Self::new(
            path.display().to_string(),
            load_fixture_snapshot(path)?,
        ))
    }
}

#[async_trait]
impl DocumentSource for FixtureSource {
    fn describe(&self) -> String {
        format!("fixture:{}", self.label)
    }

    async fn users_page(
        &self,
        page_size: usize,
        cursor: Option<&str>,
    ) -> Result<Page<UserRecord>, SourceError> {
        let page_size = page_size.max(1);
        let items: Vec<UserRecord> = self
            .snapshot
            .users
            .iter()
            .filter(|user| cursor.map_or(true, |after| user.id.as_str() > after))
            .take(page_size)
            .map(|user| UserRecord {
                user_id: user.id.clone(),
                attributes: user.fields.clone(),
            })
            .collect();
        let next_cursor = if items.len() == page_size {
            items.last().map(|u| u.user_id.clone())
        } else {
            None
        };
        Ok(Page { items, next_cursor })
    }

    async fn observation_groups(&self) -> Result<Vec<String>, SourceError> {
        Ok(self.snapshot.registry.clone())
    }

    async fn observations_since(
        &self,
        group: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawDocument>, SourceError> {
        let docs = self.snapshot.users.iter().flat_map(|user| {
            user.collections
                .get(group)
                .into_iter()
                .flatten()
                .map(move |doc| RawDocument {
                    path: format!("users/{}/{}/{}", user.id, group, doc.id),
                    fields: doc.fields.clone(),
                })
        });

        let Some(since) = since else {
            return Ok(docs.collect());
        };
        let mut matched: Vec<(DateTime<Utc>, RawDocument)> = docs
            .filter_map(|doc| {
                let issued = doc.fields.get("issued").and_then(parse_instant)?;
                (issued > since).then_some((issued, doc))
            })
            .collect();
        matched.sort_by_key(|(issued, _)| *issued);
        Ok(matched.into_iter().map(|(_, doc)| doc).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use obsync_core::{MetricRules, ObservationRecord};
    use std::path::PathBuf;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    fn obs(id: &str, issued: &str) -> FixtureDocument {
        FixtureDocument {
            id: id.to_string(),
            fields: json!({
                "effectivePeriod": {"start": issued, "end": issued},
                "valueQuantity": {"value": 1.5, "unit": "h"},
                "issued": issued,
            })
            .as_object()
            .cloned()
            .unwrap_or_default(),
        }
    }

    fn user(id: &str, group: &str, docs: Vec<FixtureDocument>) -> FixtureUser {
        FixtureUser {
            id: id.to_string(),
            fields: Map::new(),
            collections: [(group.to_string(), docs)].into_iter().collect(),
        }
    }

    #[test]
    fn firestore_values_decode_to_plain_json() {
        let fields = json!({
            "name": {"stringValue": "Ada"},
            "age": {"integerValue": "42"},
            "height": {"doubleValue": 171.5},
            "consented": {"booleanValue": true},
            "issued": {"timestampValue": "2024-01-02T03:04:05.123456Z"},
            "nothing": {"nullValue": null},
            "tags": {"arrayValue": {"values": [{"stringValue": "a"}, {"integerValue": "2"}]}},
            "empty": {"arrayValue": {}},
            "period": {"mapValue": {"fields": {"start": {"timestampValue": "2024-01-01T00:00:00Z"}}}},
        });
        let decoded = decode_fields(Some(&fields));
        assert_eq!(decoded["name"], json!("Ada"));
        assert_eq!(decoded["age"], json!(42));
        assert_eq!(decoded["height"], json!(171.5));
        assert_eq!(decoded["consented"], json!(true));
        assert_eq!(decoded["issued"], json!("2024-01-02T03:04:05.123456Z"));
        assert_eq!(decoded["nothing"], JsonValue::Null);
        assert_eq!(decoded["tags"], json!(["a", 2]));
        assert_eq!(decoded["empty"], json!([]));
        assert_eq!(decoded["period"], json!({"start": "2024-01-01T00:00:00Z"}));
    }

    #[test]
    fn delta_group_query_filters_and_orders_on_issued() {
        let config = FirestoreConfig::new("demo");
        let since = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().expect("ts");
        let body = config.group_query("HealthObservations_MHCSteps", Some(since));
        let query = &body["structuredQuery"];
        assert_eq!(query["from"][0]["allDescendants"], json!(true));
        assert_eq!(query["where"]["fieldFilter"]["op"], json!("GREATER_THAN"));
        assert_eq!(
            query["where"]["fieldFilter"]["value"]["timestampValue"],
            json!("2024-01-01T00:00:00.000000Z")
        );
        assert_eq!(query["orderBy"][0]["field"]["fieldPath"], json!("issued"));

        let full = config.group_query("HealthObservations_MHCSteps", None);
        assert!(full["structuredQuery"].get("where").is_none());
    }

    #[test]
    fn users_query_resumes_after_cursor() {
        let config = FirestoreConfig::new("demo");
        let first = config.users_query(10, None);
        assert!(first["structuredQuery"].get("startAt").is_none());
        assert_eq!(first["structuredQuery"]["limit"], json!(10));

        let cursor = "projects/demo/databases/(default)/documents/users/u-9";
        let next = config.users_query(10, Some(cursor));
        assert_eq!(
            next["structuredQuery"]["startAt"]["values"][0]["referenceValue"],
            json!(cursor)
        );
        assert_eq!(next["structuredQuery"]["startAt"]["before"], json!(false));
    }

    #[test]
    fn watermark_commit_asks_for_server_timestamp() {
        let config = FirestoreConfig::new("demo");
        let http = Arc::new(
            RestClient::new(obsync_storage::HttpClientConfig::default(), None).expect("client"),
        );
        let store = FirestoreWatermarkStore::new(config, http);
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().expect("ts");
        let body = store.commit_body(ts);
        let write = &body["writes"][0];
        assert_eq!(
            write["update"]["name"],
            json!("projects/demo/databases/(default)/documents/_sync_metadata/last_sync")
        );
        assert_eq!(
            write["updateTransforms"][0]["setToServerValue"],
            json!("REQUEST_TIME")
        );
    }

    #[test]
    fn registry_must_be_a_list_of_names() {
        let ok = RawDocument {
            path: "variables/healthobservation_cols".into(),
            fields: json!({"cols": ["A", "B"]}).as_object().cloned().unwrap_or_default(),
        };
        assert_eq!(registry_groups(&ok).expect("groups"), vec!["A", "B"]);

        let bad = RawDocument {
            path: "variables/healthobservation_cols".into(),
            fields: json!({"cols": "A"}).as_object().cloned().unwrap_or_default(),
        };
        assert!(registry_groups(&bad).is_err());
    }

    #[tokio::test]
    async fn fixture_users_page_in_key_order() {
        let snapshot = FixtureSnapshot {
            registry: vec![],
            users: ["c", "a", "b"]
                .iter()
                .map(|id| FixtureUser {
                    id: id.to_string(),
                    fields: Map::new(),
                    collections: Default::default(),
                })
                .collect(),
        };
        let source = FixtureSource::new("inline", snapshot);

        let first = source.users_page(2, None).await.expect("page");
        let ids: Vec<_> = first.items.iter().map(|u| u.user_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(first.next_cursor.as_deref(), Some("b"));

        let second = source.users_page(2, first.next_cursor.as_deref()).await.expect("page");
        assert_eq!(second.items.len(), 1);
        assert_eq!(second.items[0].user_id, "c");
        assert_eq!(second.next_cursor, None);
    }

    #[tokio::test]
    async fn fixture_group_query_is_strictly_after_watermark_and_ordered() {
        let group = "G";
        let snapshot = FixtureSnapshot {
            registry: vec![group.into()],
            users: vec![
                user("u-2", group, vec![obs("o3", "2024-01-03T00:00:00Z")]),
                user(
                    "u-1",
                    group,
                    vec![
                        obs("o2", "2024-01-02T00:00:00Z"),
                        obs("o1", "2023-12-31T00:00:00Z"),
                        obs("o0", "2024-01-01T00:00:00Z"),
                    ],
                ),
            ],
        };
        let source = FixtureSource::new("inline", snapshot);
        let since = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().expect("ts");

        let docs = source.observations_since(group, Some(since)).await.expect("docs");
        let paths: Vec<_> = docs.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(paths, vec!["users/u-1/G/o2", "users/u-2/G/o3"]);

        let all = source.observations_since(group, None).await.expect("docs");
        assert_eq!(all.len(), 4);
    }

    #[tokio::test]
    async fn sample_fixture_snapshot_flattens() {
        let path = workspace_root().join("fixtures/firestore/sample/snapshot.json");
        let source = FixtureSource::load(&path).expect("fixture loads");
        let rules = MetricRules::default();

        let groups = source.observation_groups().await.expect("groups");
        assert!(!groups.is_empty());

        let mut flattened = 0;
        for group in &groups {
            for doc in source.observations_since(group, None).await.expect("docs") {
                if let Some(record) = ObservationRecord::from_document(&doc, &rules.clean(group)) {
                    assert!(!record.user_id.is_empty());
                    assert!(!record.metric.starts_with("HealthObservations_"));
                    flattened += 1;
                }
            }
        }
        assert!(flattened > 0);
    }
}
