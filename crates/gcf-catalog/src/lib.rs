//! Startup catalog build: collections, backdrops and the color index.
//!
//! The build never fails. A missing top-level document leaves that catalog empty and
//! an unreadable color file is skipped; both are logged and the process serves
//! whatever was assembled.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use gcf_core::{Backdrop, Collection, Color, ColorIndex, ModelColorRecord};
use gcf_http::{FetchError, HttpFetcher, HttpRequest};
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gcf-catalog";

pub const DEFAULT_COLLECTIONS_URL: &str = "https://cdn.changes.tg/gifts/id-to-name.json";
pub const DEFAULT_BACKDROPS_URL: &str = "https://cdn.changes.tg/gifts/backdrops.json";
pub const DEFAULT_COLOR_LISTING_URL: &str =
    "https://api.github.com/repos/Vasiliy-katsyka/colorGifts/contents/";

const SOURCE_ID: &str = "catalog";

#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub collections_url: String,
    pub backdrops_url: String,
    pub color_listing_url: String,
    /// When set, documents are read from this directory instead of over HTTP.
    pub local_dir: Option<PathBuf>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            collections_url: DEFAULT_COLLECTIONS_URL.to_string(),
            backdrops_url: DEFAULT_BACKDROPS_URL.to_string(),
            color_listing_url: DEFAULT_COLOR_LISTING_URL.to_string(),
            local_dir: None,
        }
    }
}

impl CatalogConfig {
    pub fn from_env() -> Self {
        Self {
            collections_url: std::env::var("GCF_COLLECTIONS_URL")
                .unwrap_or_else(|_| DEFAULT_COLLECTIONS_URL.to_string()),
            backdrops_url: std::env::var("GCF_BACKDROPS_URL")
                .unwrap_or_else(|_| DEFAULT_BACKDROPS_URL.to_string()),
            color_listing_url: std::env::var("GCF_COLOR_LISTING_URL")
                .unwrap_or_else(|_| DEFAULT_COLOR_LISTING_URL.to_string()),
            local_dir: std::env::var("GCF_CATALOG_DIR").ok().map(PathBuf::from),
        }
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("decoding {document}: {source}")]
    Decode {
        document: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{document} has no download location")]
    MissingLocation { document: String },
}

/// One entry of the content listing that enumerates per-collection color files.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ColorFileEntry {
    pub name: String,
    #[serde(default)]
    pub download_url: Option<String>,
}

impl ColorFileEntry {
    /// `"DeskCalendar.json"` -> `Some("DeskCalendar")`; non-JSON entries yield `None`.
    pub fn collection_name(&self) -> Option<&str> {
        self.name.strip_suffix(".json").filter(|n| !n.is_empty())
    }
}

#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn collections_document(&self) -> Result<Vec<u8>, CatalogError>;

    async fn backdrops_document(&self) -> Result<Vec<u8>, CatalogError>;

    async fn color_file_listing(&self) -> Result<Vec<ColorFileEntry>, CatalogError>;

    async fn color_file(&self, entry: &ColorFileEntry) -> Result<Vec<u8>, CatalogError>;
}

pub struct HttpCatalogSource {
    http: Arc<HttpFetcher>,
    config: CatalogConfig,
    build_id: Uuid,
}

impl HttpCatalogSource {
    pub fn new(http: Arc<HttpFetcher>, config: CatalogConfig) -> Self {
        Self {
            http,
            config,
            build_id: Uuid::new_v4(),
        }
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>, CatalogError> {
        let resp = self
            .http
            .execute(self.build_id, SOURCE_ID, &HttpRequest::get(url))
            .await?;
        Ok(resp.body)
    }
}

#[async_trait]
impl CatalogSource for HttpCatalogSource {
    async fn collections_document(&self) -> Result<Vec<u8>, CatalogError> {
        self.get(&self.config.collections_url).await
    }

    async fn backdrops_document(&self) -> Result<Vec<u8>, CatalogError> {
        self.get(&self.config.backdrops_url).await
    }

    async fn color_file_listing(&self) -> Result<Vec<ColorFileEntry>, CatalogError> {
        let body = self.get(&self.config.color_listing_url).await?;
        parse_listing(&body)
    }

    async fn color_file(&self, entry: &ColorFileEntry) -> Result<Vec<u8>, CatalogError> {
        let url = entry
            .download_url
            .as_deref()
            .ok_or_else(|| CatalogError::MissingLocation {
                document: entry.name.clone(),
            })?;
        self.get(url).await
    }
}

/// Offline source laid out as `id-to-name.json`, `backdrops.json` and `colors/*.json`.
#[derive(Debug, Clone)]
pub struct DirCatalogSource {
    root: PathBuf,
}

impl DirCatalogSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>, CatalogError> {
        tokio::fs::read(path).await.map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })
    }
}

#[async_trait]
impl CatalogSource for DirCatalogSource {
    async fn collections_document(&self) -> Result<Vec<u8>, CatalogError> {
        self.read(&self.root.join("id-to-name.json")).await
    }

    async fn backdrops_document(&self) -> Result<Vec<u8>, CatalogError> {
        self.read(&self.root.join("backdrops.json")).await
    }

    async fn color_file_listing(&self) -> Result<Vec<ColorFileEntry>, CatalogError> {
        let dir = self.root.join("colors");
        let io_err = |source: std::io::Error| CatalogError::Io {
            path: dir.display().to_string(),
            source,
        };
        let mut read_dir = tokio::fs::read_dir(&dir).await.map_err(io_err)?;
        let mut entries = Vec::new();
        while let Some(entry) = read_dir.next_entry().await.map_err(io_err)? {
            let name = entry.file_name().to_string_lossy().to_string();
            entries.push(ColorFileEntry {
                download_url: Some(format!("colors/{name}")),
                name,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn color_file(&self, entry: &ColorFileEntry) -> Result<Vec<u8>, CatalogError> {
        let rel = entry
            .download_url
            .as_deref()
            .ok_or_else(|| CatalogError::MissingLocation {
                document: entry.name.clone(),
            })?;
        self.read(&self.root.join(rel)).await
    }
}

pub fn source_from_config(http: Arc<HttpFetcher>, config: CatalogConfig) -> Arc<dyn CatalogSource> {
    match &config.local_dir {
        Some(dir) => Arc::new(DirCatalogSource::new(dir.clone())),
        None => Arc::new(HttpCatalogSource::new(http, config)),
    }
}

fn decode<T: serde::de::DeserializeOwned>(document: &str, bytes: &[u8]) -> Result<T, CatalogError> {
    serde_json::from_slice(bytes).map_err(|source| CatalogError::Decode {
        document: document.to_string(),
        source,
    })
}

/// `id -> name` object. Non-string names are skipped.
pub fn parse_collections(bytes: &[u8]) -> Result<Vec<Collection>, CatalogError> {
    let map: Map<String, JsonValue> = decode("collections", bytes)?;
    Ok(map
        .into_iter()
        .filter_map(|(id, name)| match name {
            JsonValue::String(name) => Some(Collection { id, name }),
            _ => None,
        })
        .collect())
}

pub fn parse_backdrops(bytes: &[u8]) -> Result<Vec<Backdrop>, CatalogError> {
    decode("backdrops", bytes)
}

pub fn parse_listing(bytes: &[u8]) -> Result<Vec<ColorFileEntry>, CatalogError> {
    decode("color file listing", bytes)
}

/// Color of one `model -> data` entry, or `None` when the entry is skipped.
///
/// An object takes its `main_color` (absent or non-string means `unknown`), a bare
/// string is the color itself, anything else is skipped.
pub fn entry_color(data: &JsonValue) -> Option<Color> {
    match data {
        JsonValue::Object(obj) => Some(
            obj.get("main_color")
                .and_then(JsonValue::as_str)
                .map_or(Color::Unknown, Color::normalize),
        ),
        JsonValue::String(raw) => Some(Color::normalize(raw)),
        _ => None,
    }
}

pub fn parse_color_file(
    collection: &str,
    bytes: &[u8],
) -> Result<Vec<ModelColorRecord>, CatalogError> {
    let models: Map<String, JsonValue> = decode(collection, bytes)?;
    Ok(models
        .into_iter()
        .filter_map(|(model, data)| {
            entry_color(&data).map(|main_color| ModelColorRecord {
                collection: collection.to_string(),
                model,
                main_color,
            })
        })
        .collect())
}

/// Immutable result of one catalog build. Published once behind an `Arc`; a reload
/// would build a fresh snapshot rather than mutate this one.
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    pub collections: Vec<Collection>,
    pub backdrops: Vec<Backdrop>,
    pub index: Arc<ColorIndex>,
    pub built_at: DateTime<Utc>,
}

impl CatalogSnapshot {
    pub fn empty() -> Self {
        Self {
            collections: Vec::new(),
            backdrops: Vec::new(),
            index: Arc::new(ColorIndex::default()),
            built_at: Utc::now(),
        }
    }
}

pub struct CatalogBuilder {
    source: Arc<dyn CatalogSource>,
}

impl CatalogBuilder {
    pub fn new(source: Arc<dyn CatalogSource>) -> Self {
        Self { source }
    }

    pub async fn build(&self) -> CatalogSnapshot {
        info!("loading catalog");
        let (collections, backdrops, records) = tokio::join!(
            self.load_collections(),
            self.load_backdrops(),
            self.load_color_records(),
        );
        let index = Arc::new(ColorIndex::from_records(records));
        info!(
            collections = collections.len(),
            backdrops = backdrops.len(),
            indexed_pairs = index.len(),
            "catalog loaded"
        );
        CatalogSnapshot {
            collections,
            backdrops,
            index,
            built_at: Utc::now(),
        }
    }

    async fn load_collections(&self) -> Vec<Collection> {
        let result = self
            .source
            .collections_document()
            .await
            .and_then(|bytes| parse_collections(&bytes));
        result.unwrap_or_else(|err| {
            warn!(error = %err, "collection catalog unavailable; continuing with none");
            Vec::new()
        })
    }

    async fn load_backdrops(&self) -> Vec<Backdrop> {
        let result = self
            .source
            .backdrops_document()
            .await
            .and_then(|bytes| parse_backdrops(&bytes));
        result.unwrap_or_else(|err| {
            warn!(error = %err, "backdrop catalog unavailable; continuing with none");
            Vec::new()
        })
    }

    async fn load_color_records(&self) -> Vec<ModelColorRecord> {
        let listing = match self.source.color_file_listing().await {
            Ok(listing) => listing,
            Err(err) => {
                warn!(error = %err, "color file listing unavailable; color index will be empty");
                return Vec::new();
            }
        };

        let files = listing
            .iter()
            .filter_map(|entry| entry.collection_name().map(|name| (entry, name)))
            .collect::<Vec<_>>();

        let results = join_all(files.iter().map(|&(entry, collection)| async move {
            self.source
                .color_file(entry)
                .await
                .and_then(|bytes| parse_color_file(collection, &bytes))
        }))
        .await;

        let mut records = Vec::new();
        let mut failed = 0usize;
        for ((entry, _), result) in files.iter().zip(results) {
            match result {
                Ok(mut file_records) => records.append(&mut file_records),
                Err(err) => {
                    failed += 1;
                    warn!(file = %entry.name, error = %err, "skipping color file");
                }
            }
        }
        info!(
            files_loaded = files.len() - failed,
            files_failed = failed,
            "color files processed"
        );
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gcf_core::CollectionModel;
    use std::collections::HashMap;

    fn fixtures_dir() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/catalog")
            .canonicalize()
            .expect("fixtures dir")
    }

    /// In-memory source; a `None` document simulates an upstream failure.
    #[derive(Default)]
    struct MemorySource {
        collections: Option<String>,
        backdrops: Option<String>,
        listing: Option<Vec<&'static str>>,
        files: HashMap<String, String>,
    }

    fn unavailable(what: &str) -> CatalogError {
        CatalogError::Io {
            path: what.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "simulated outage"),
        }
    }

    #[async_trait]
    impl CatalogSource for MemorySource {
        async fn collections_document(&self) -> Result<Vec<u8>, CatalogError> {
            self.collections
                .clone()
                .map(String::into_bytes)
                .ok_or_else(|| unavailable("collections"))
        }

        async fn backdrops_document(&self) -> Result<Vec<u8>, CatalogError> {
            self.backdrops
                .clone()
                .map(String::into_bytes)
                .ok_or_else(|| unavailable("backdrops"))
        }

        async fn color_file_listing(&self) -> Result<Vec<ColorFileEntry>, CatalogError> {
            let names = self.listing.clone().ok_or_else(|| unavailable("listing"))?;
            Ok(names
                .into_iter()
                .map(|name| ColorFileEntry {
                    name: name.to_string(),
                    download_url: Some(name.to_string()),
                })
                .collect())
        }

        async fn color_file(&self, entry: &ColorFileEntry) -> Result<Vec<u8>, CatalogError> {
            self.files
                .get(&entry.name)
                .cloned()
                .map(String::into_bytes)
                .ok_or_else(|| unavailable(&entry.name))
        }
    }

    #[test]
    fn entry_color_follows_ingestion_rules() {
        assert_eq!(entry_color(&serde_json::json!({"main_color": "red"})), Some(Color::Red));
        assert_eq!(entry_color(&serde_json::json!({"main_color": "teal"})), Some(Color::Unknown));
        assert_eq!(entry_color(&serde_json::json!({})), Some(Color::Unknown));
        assert_eq!(entry_color(&serde_json::json!({"main_color": 3})), Some(Color::Unknown));
        assert_eq!(entry_color(&serde_json::json!("Blue")), Some(Color::Blue));
        assert_eq!(entry_color(&serde_json::json!(42)), None);
        assert_eq!(entry_color(&serde_json::json!(null)), None);
        assert_eq!(entry_color(&serde_json::json!(["red"])), None);
    }

    #[test]
    fn listing_keeps_only_json_files_as_collections() {
        let bytes = std::fs::read(fixtures_dir().join("listing.json")).unwrap();
        let listing = parse_listing(&bytes).unwrap();
        let names = listing
            .iter()
            .filter_map(ColorFileEntry::collection_name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["DeskCalendar", "LolPop", "PlushPepe"]);
        assert_eq!(listing[4].download_url, None);
    }

    #[test]
    fn color_file_that_is_not_an_object_is_malformed() {
        let err = parse_color_file("DeskCalendar", b"[1, 2, 3]").unwrap_err();
        assert!(matches!(err, CatalogError::Decode { .. }));
    }

    #[tokio::test]
    async fn invalid_color_file_is_skipped_and_build_completes() {
        let mut files = HashMap::new();
        files.insert(
            "DeskCalendar.json".to_string(),
            r#"{"Amber": {"main_color": "red"}, "Snow": {"main_color": "white"}}"#.to_string(),
        );
        files.insert("LolPop.json".to_string(), r#"{"Cherry": {"main_color": "#.to_string());
        files.insert("PlushPepe.json".to_string(), r#"{"Ruby": "red"}"#.to_string());
        let source = MemorySource {
            collections: Some(r#"{"1": "Desk Calendar", "2": "Plush Pepe"}"#.to_string()),
            backdrops: Some(r#"[{"name": "Onyx Black"}]"#.to_string()),
            listing: Some(vec!["DeskCalendar.json", "LolPop.json", "PlushPepe.json"]),
            files,
        };

        let snapshot = CatalogBuilder::new(Arc::new(source)).build().await;
        assert_eq!(
            snapshot.index.lookup(Color::Red),
            &[
                CollectionModel::new("DeskCalendar", "Amber"),
                CollectionModel::new("PlushPepe", "Ruby"),
            ]
        );
        assert_eq!(snapshot.index.len(), 3);
        assert!(snapshot
            .index
            .lookup(Color::Red)
            .iter()
            .all(|pair| pair.collection != "LolPop"));
        assert_eq!(snapshot.collections.len(), 2);
        assert_eq!(snapshot.backdrops.len(), 1);
    }

    #[tokio::test]
    async fn unavailable_top_level_documents_degrade_to_empty() {
        let mut files = HashMap::new();
        files.insert("DeskCalendar.json".to_string(), r#"{"Amber": "red"}"#.to_string());
        let source = MemorySource {
            collections: None,
            backdrops: Some("not json".to_string()),
            listing: Some(vec!["DeskCalendar.json", "Missing.json"]),
            files,
        };
        let snapshot = CatalogBuilder::new(Arc::new(source)).build().await;
        assert!(snapshot.collections.is_empty());
        assert!(snapshot.backdrops.is_empty());
        assert_eq!(snapshot.index.lookup(Color::Red).len(), 1);
    }

    #[tokio::test]
    async fn unavailable_listing_leaves_index_empty() {
        let source = MemorySource {
            collections: Some(r#"{"1": "Desk Calendar"}"#.to_string()),
            backdrops: Some("[]".to_string()),
            listing: None,
            files: HashMap::new(),
        };
        let snapshot = CatalogBuilder::new(Arc::new(source)).build().await;
        assert!(snapshot.index.is_empty());
        assert_eq!(snapshot.collections.len(), 1);
        assert!(Color::ALL.iter().all(|c| snapshot.index.lookup(*c).is_empty()));
    }

    #[tokio::test]
    async fn directory_source_builds_from_fixtures() {
        let snapshot = CatalogBuilder::new(Arc::new(DirCatalogSource::new(fixtures_dir())))
            .build()
            .await;

        assert_eq!(snapshot.collections.len(), 3);
        assert_eq!(snapshot.backdrops.len(), 2);

        // LolPop.json is truncated and contributes nothing.
        let red = snapshot.index.lookup(Color::Red);
        assert_eq!(
            red,
            &[
                CollectionModel::new("DeskCalendar", "Amber"),
                CollectionModel::new("PlushPepe", "Ruby"),
            ]
        );
        assert_eq!(
            snapshot.index.lookup(Color::Gray),
            &[CollectionModel::new("DeskCalendar", "Plain Stone")]
        );
        // "Ghost" has no main_color, "Neon" has an unrecognized one.
        assert_eq!(
            snapshot.index.lookup(Color::Unknown),
            &[
                CollectionModel::new("DeskCalendar", "Ghost"),
                CollectionModel::new("PlushPepe", "Neon"),
            ]
        );
        // "Broken": 42 is skipped.
        assert_eq!(snapshot.index.len(), 7);
    }
}
