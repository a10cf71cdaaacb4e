//! Catalog manager
//!
//! Holds the in-memory item map and the SQLite store behind it, installs
//! the catalog subscriber on downloads so every ledger-shaping event is
//! persisted before user callbacks see it, and resolves download ids back
//! into runnable [`Downloader`]s for resume.

use crate::engine::download_task::{default_data_dir, Downloader, DownloaderOpts};
use crate::engine::events::EventSubscriber;
use crate::engine::persistence::CatalogDb;
use crate::engine::{DEF_USER_AGENT, MAIN_ID};
use crate::error::BlitzError;
use async_trait::async_trait;
use blitzdl_types::{DownloadId, Item, ItemOpts, ItemPart, SegmentId};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// How often coalesced progress updates reach the store.
const PROGRESS_PERSIST_EVERY: Duration = Duration::from_millis(500);

const CATALOG_FILE_NAME: &str = "catalog.db";

/// Configuration for [`Manager::new`]. Both roots default to the platform
/// directories.
#[derive(Debug, Clone, Default)]
pub struct ManagerConfig {
    /// Directory holding the catalog store.
    pub config_dir: Option<PathBuf>,
    /// Root under which per-download working directories live.
    pub data_dir: Option<PathBuf>,
}

/// Build the HTTP client downloads run on: default User-Agent, bounded
/// connect and read timeouts, no cap on total request duration (range
/// bodies stream for as long as they need).
pub fn build_http_client() -> Result<Client, BlitzError> {
    Ok(Client::builder()
        .user_agent(DEF_USER_AGENT)
        .connect_timeout(Duration::from_secs(30))
        .read_timeout(Duration::from_secs(60))
        .build()?)
}

type ItemsMap = Arc<RwLock<HashMap<DownloadId, Item>>>;

/// The durable download catalog.
pub struct Manager {
    items: ItemsMap,
    db: CatalogDb,
    data_dir: PathBuf,
    client: Client,
}

impl Manager {
    /// Open (or create) the catalog store and load all items, so a fresh
    /// process starts with the previous state.
    pub async fn new(config: ManagerConfig) -> Result<Self, BlitzError> {
        let config_dir = config.config_dir.unwrap_or_else(default_config_dir);
        let data_dir = config.data_dir.unwrap_or_else(default_data_dir);
        let db = CatalogDb::new(config_dir.join(CATALOG_FILE_NAME)).await?;
        let items: HashMap<DownloadId, Item> = db
            .load_all()
            .await?
            .into_iter()
            .map(|item| (item.id.clone(), item))
            .collect();
        tracing::info!(count = items.len(), "catalog loaded");
        Ok(Self {
            items: Arc::new(RwLock::new(items)),
            db,
            data_dir,
            client: build_http_client()?,
        })
    }

    /// The client this manager resumes downloads with; callers can share it
    /// when constructing their own [`Downloader`]s.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Register a download in the catalog and attach the persistence
    /// subscriber to its event bus.
    pub async fn add_download(
        &self,
        download: &Downloader,
        opts: ItemOpts,
    ) -> Result<Item, BlitzError> {
        let item = Item {
            id: download.id().clone(),
            name: download.file_name().to_string(),
            url: download.url().to_string(),
            date_added: Utc::now(),
            total_size: download.content_length(),
            downloaded: 0,
            download_location: download.download_dir().clone(),
            absolute_location: opts.absolute_location,
            hidden: opts.hidden,
            is_child: opts.is_child,
            parent_id: opts.parent_id,
            max_connections: download.max_connections(),
            max_segments: download.max_segments(),
            parts: BTreeMap::new(),
        };
        self.items.write().insert(item.id.clone(), item.clone());
        self.db.upsert_item(&item).await?;
        self.attach(download);
        Ok(item)
    }

    /// Rebuild a [`Downloader`] from a catalog item and run the scheduler's
    /// resume over its ledger. Blocks until the download terminates.
    pub async fn resume_download(
        &self,
        id: &DownloadId,
        subscribers: Vec<Arc<dyn EventSubscriber>>,
    ) -> Result<(), BlitzError> {
        let item = self
            .get_item(id)
            .ok_or_else(|| BlitzError::DownloadNotFound(id.clone()))?;

        let opts = DownloaderOpts {
            skip_setup: true,
            id: Some(item.id.clone()),
            file_name: Some(item.name.clone()),
            known_length: Some(item.total_size),
            download_dir: Some(item.download_location.clone()),
            data_dir: Some(self.data_dir.clone()),
            max_connections: item.max_connections,
            max_segments: item.max_segments,
            subscribers,
            ..Default::default()
        };
        let download = Downloader::new(self.client.clone(), &item.url, opts).await?;

        // Reseed the byte count from the compiled ledger entries; the
        // resume-progress events add the recovered scratch lengths back.
        let compiled: i64 = item
            .parts
            .iter()
            .filter(|(_, part)| part.compiled)
            .map(|(ioff, part)| part.final_offset - ioff + 1)
            .sum();
        if let Some(snapshot) = {
            let mut items = self.items.write();
            items.get_mut(id).map(|it| {
                it.downloaded = compiled;
                it.clone()
            })
        } {
            self.db.upsert_item(&snapshot).await?;
        }

        self.attach(&download);
        download.resume(&item.parts).await
    }

    fn attach(&self, download: &Downloader) {
        download.subscribe_first(Arc::new(CatalogSubscriber {
            id: download.id().clone(),
            items: self.items.clone(),
            db: self.db.clone(),
            cancel: download.cancel_token(),
            last_persist: Mutex::new(Instant::now()),
        }));
    }

    pub fn get_items(&self) -> Vec<Item> {
        self.items.read().values().cloned().collect()
    }

    pub fn get_item(&self, id: &DownloadId) -> Option<Item> {
        self.items.read().get(id).cloned()
    }

    pub fn get_incomplete_items(&self) -> Vec<Item> {
        self.items
            .read()
            .values()
            .filter(|item| !item.is_complete())
            .cloned()
            .collect()
    }

    pub fn get_completed_items(&self) -> Vec<Item> {
        self.items
            .read()
            .values()
            .filter(|item| item.is_complete())
            .cloned()
            .collect()
    }

    /// Remove every item from the catalog together with its working
    /// directory (scratch files and per-download log).
    pub async fn flush(&self) -> Result<(), BlitzError> {
        let ids: Vec<DownloadId> = self.items.read().keys().cloned().collect();
        for id in &ids {
            let work_dir = self.data_dir.join(id.as_str());
            match tokio::fs::remove_dir_all(&work_dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "failed to remove working directory")
                }
            }
        }
        self.items.write().clear();
        self.db.clear().await
    }

    pub async fn close(&self) {
        self.db.close().await;
    }

    /// Export the whole catalog as JSON.
    pub fn export_data(&self) -> Result<String, BlitzError> {
        let data = serde_json::json!({
            "version": 1,
            "items": self.get_items(),
        });
        Ok(serde_json::to_string_pretty(&data)?)
    }

    /// Import items from a previous [`Manager::export_data`] dump. Entries
    /// that fail to parse are skipped.
    pub async fn import_data(&self, json: &str) -> Result<(), BlitzError> {
        let data: serde_json::Value = serde_json::from_str(json)?;
        let Some(values) = data.get("items").and_then(|v| v.as_array()) else {
            return Ok(());
        };
        for value in values {
            if let Ok(item) = serde_json::from_value::<Item>(value.clone()) {
                self.db.upsert_item(&item).await?;
                self.items.write().insert(item.id.clone(), item);
            }
        }
        Ok(())
    }
}

fn default_config_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "blitzdl")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".blitzdl"))
}

/// First-position bus subscriber that mirrors every event into the catalog.
/// Ledger-shape and completion writes are immediate and fatal on failure;
/// progress writes are coalesced and dropped on failure.
struct CatalogSubscriber {
    id: DownloadId,
    items: ItemsMap,
    db: CatalogDb,
    cancel: CancellationToken,
    last_persist: Mutex<Instant>,
}

impl CatalogSubscriber {
    /// Mutate the item under the map lock and hand back a snapshot to
    /// persist outside it.
    fn mutate(&self, f: impl FnOnce(&mut Item)) -> Option<Item> {
        let mut items = self.items.write();
        let item = items.get_mut(&self.id)?;
        f(item);
        Some(item.clone())
    }

    /// A failed identity write means resume would lose track of a segment;
    /// stop the download rather than keep fetching untracked bytes.
    async fn persist_identity(&self, snapshot: Option<Item>) {
        let Some(item) = snapshot else { return };
        if let Err(error) = self.db.upsert_item(&item).await {
            tracing::error!(id = %self.id, %error, "catalog write failed, stopping download");
            self.cancel.cancel();
        }
    }

    async fn persist_progress(&self, snapshot: Option<Item>) {
        let Some(item) = snapshot else { return };
        {
            let mut last = self.last_persist.lock();
            if last.elapsed() < PROGRESS_PERSIST_EVERY {
                return;
            }
            *last = Instant::now();
        }
        if let Err(error) = self.db.upsert_item(&item).await {
            tracing::warn!(id = %self.id, %error, "catalog progress write failed");
        }
    }
}

#[async_trait]
impl EventSubscriber for CatalogSubscriber {
    async fn on_spawn(&self, id: &SegmentId, ioff: i64, foff: i64) {
        let snapshot = self.mutate(|item| {
            item.parts.insert(
                ioff,
                ItemPart {
                    id: id.clone(),
                    final_offset: foff,
                    compiled: false,
                },
            );
        });
        self.persist_identity(snapshot).await;
    }

    async fn on_respawn(&self, _id: &SegmentId, original_ioff: i64, _ioff: i64, foff: i64) {
        let snapshot = self.mutate(|item| {
            if let Some(part) = item.parts.get_mut(&original_ioff) {
                part.final_offset = foff;
            }
        });
        self.persist_identity(snapshot).await;
    }

    async fn on_download_progress(&self, _id: &SegmentId, chunk: usize) {
        let snapshot = self.mutate(|item| item.downloaded += chunk as i64);
        self.persist_progress(snapshot).await;
    }

    async fn on_resume_progress(&self, chunk: usize) {
        let snapshot = self.mutate(|item| item.downloaded += chunk as i64);
        self.persist_progress(snapshot).await;
    }

    async fn on_compile_complete(&self, id: &SegmentId, _total: i64) {
        let snapshot = self.mutate(|item| {
            if let Some(part) = item.parts.values_mut().find(|part| &part.id == id) {
                part.compiled = true;
            }
        });
        self.persist_identity(snapshot).await;
    }

    async fn on_download_complete(&self, id: &str, total: i64) {
        if id != MAIN_ID {
            return;
        }
        let snapshot = self.mutate(|item| {
            item.downloaded = total;
            item.parts.clear();
        });
        self.persist_identity(snapshot).await;
    }
}
