mod common;

use blitzdl_core::{
    BlitzError, CatalogDb, Downloader, DownloaderOpts, Manager, ManagerConfig,
};
use blitzdl_types::{ContentLength, DownloadId, Item, ItemOpts, ItemPart, SegmentId};
use chrono::Utc;
use common::{serve_ranged, test_body, Recorder};
use std::collections::BTreeMap;
use std::sync::Arc;

struct Roots {
    config: tempfile::TempDir,
    data: tempfile::TempDir,
    out: tempfile::TempDir,
}

impl Roots {
    fn new() -> Self {
        Self {
            config: tempfile::tempdir().unwrap(),
            data: tempfile::tempdir().unwrap(),
            out: tempfile::tempdir().unwrap(),
        }
    }

    fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            config_dir: Some(self.config.path().to_path_buf()),
            data_dir: Some(self.data.path().to_path_buf()),
        }
    }

    fn downloader_opts(&self) -> DownloaderOpts {
        DownloaderOpts {
            data_dir: Some(self.data.path().to_path_buf()),
            download_dir: Some(self.out.path().to_path_buf()),
            chunk_size: Some(64 * 1024),
            base_segments: Some(2),
            ..Default::default()
        }
    }
}

#[tokio::test]
async fn completed_download_is_recorded_with_an_empty_ledger() {
    let body = test_body(300_000);
    let server = serve_ranged(body.clone()).await;
    let roots = Roots::new();

    let manager = Manager::new(roots.manager_config()).await.unwrap();
    let download = Downloader::new(
        manager.client().clone(),
        &server.uri(),
        roots.downloader_opts(),
    )
    .await
    .unwrap();
    let id = download.id().clone();

    manager
        .add_download(&download, ItemOpts::default())
        .await
        .unwrap();
    assert_eq!(manager.get_incomplete_items().len(), 1);
    assert!(manager.get_completed_items().is_empty());

    download.start().await.unwrap();

    let item = manager.get_item(&id).unwrap();
    assert!(item.is_complete());
    assert_eq!(item.downloaded, 300_000);
    assert_eq!(item.total_size, ContentLength::new(300_000));
    assert!(item.parts.is_empty());
    assert_eq!(item.percentage(), 100);
    assert_eq!(manager.get_completed_items().len(), 1);
    assert!(manager.get_incomplete_items().is_empty());

    manager.close().await;
}

#[tokio::test]
async fn catalog_survives_a_process_restart() {
    let body = test_body(120_000);
    let server = serve_ranged(body.clone()).await;
    let roots = Roots::new();

    let id;
    {
        let manager = Manager::new(roots.manager_config()).await.unwrap();
        let download = Downloader::new(
            manager.client().clone(),
            &server.uri(),
            roots.downloader_opts(),
        )
        .await
        .unwrap();
        id = download.id().clone();
        manager
            .add_download(&download, ItemOpts::default())
            .await
            .unwrap();
        download.start().await.unwrap();
        manager.close().await;
    }

    // A fresh manager over the same config root sees the same state.
    let manager = Manager::new(roots.manager_config()).await.unwrap();
    let item = manager.get_item(&id).unwrap();
    assert!(item.is_complete());
    assert_eq!(item.downloaded, 120_000);
    assert_eq!(item.url, server.uri());
    manager.close().await;
}

#[tokio::test]
async fn resume_download_finishes_an_interrupted_item() {
    let body = test_body(400_000);
    let server = serve_ranged(body.clone()).await;
    let roots = Roots::new();

    // Fabricate the on-disk state a killed process leaves behind: a catalog
    // item with a two-entry ledger and partially filled scratch files.
    let id = DownloadId::from("abcd1234");
    let work_dir = roots.data.path().join(id.as_str());
    std::fs::create_dir_all(&work_dir).unwrap();
    std::fs::write(work_dir.join("aaaa1111"), &body[..50_000]).unwrap();
    std::fs::write(work_dir.join("bbbb2222"), b"").unwrap();

    let mut parts = BTreeMap::new();
    parts.insert(
        0,
        ItemPart {
            id: SegmentId::from("aaaa1111"),
            final_offset: 199_999,
            compiled: false,
        },
    );
    parts.insert(
        200_000,
        ItemPart {
            id: SegmentId::from("bbbb2222"),
            final_offset: 399_999,
            compiled: false,
        },
    );
    let item = Item {
        id: id.clone(),
        name: "out.bin".into(),
        url: server.uri(),
        date_added: Utc::now(),
        total_size: ContentLength::new(400_000),
        downloaded: 50_000,
        download_location: roots.out.path().to_path_buf(),
        absolute_location: None,
        hidden: false,
        is_child: false,
        parent_id: None,
        max_connections: 4,
        max_segments: 8,
        parts,
    };
    let db = CatalogDb::new(roots.config.path().join("catalog.db"))
        .await
        .unwrap();
    db.upsert_item(&item).await.unwrap();
    db.close().await;

    let manager = Manager::new(roots.manager_config()).await.unwrap();
    assert_eq!(manager.get_incomplete_items().len(), 1);

    let recorder = Recorder::new();
    manager
        .resume_download(&id, vec![recorder.clone() as Arc<_>])
        .await
        .unwrap();

    let written = std::fs::read(roots.out.path().join("out.bin")).unwrap();
    assert_eq!(written, body);

    let item = manager.get_item(&id).unwrap();
    assert!(item.is_complete());
    assert_eq!(item.downloaded, 400_000);
    assert!(item.parts.is_empty());
    manager.close().await;
}

#[tokio::test]
async fn resume_of_an_unknown_id_fails() {
    let roots = Roots::new();
    let manager = Manager::new(roots.manager_config()).await.unwrap();
    let result = manager
        .resume_download(&DownloadId::from("ffffffff"), Vec::new())
        .await;
    assert!(matches!(result, Err(BlitzError::DownloadNotFound(_))));
    manager.close().await;
}

#[tokio::test]
async fn flush_clears_items_and_working_directories() {
    let body = test_body(60_000);
    let server = serve_ranged(body).await;
    let roots = Roots::new();

    let manager = Manager::new(roots.manager_config()).await.unwrap();
    let download = Downloader::new(
        manager.client().clone(),
        &server.uri(),
        roots.downloader_opts(),
    )
    .await
    .unwrap();
    let id = download.id().clone();
    manager
        .add_download(&download, ItemOpts::default())
        .await
        .unwrap();
    download.start().await.unwrap();

    let work_dir = roots.data.path().join(id.as_str());
    assert!(work_dir.exists());

    manager.flush().await.unwrap();
    assert!(manager.get_items().is_empty());
    assert!(!work_dir.exists());

    // The emptiness survives a restart.
    manager.close().await;
    let manager = Manager::new(roots.manager_config()).await.unwrap();
    assert!(manager.get_items().is_empty());
    manager.close().await;
}

#[tokio::test]
async fn export_import_roundtrip() {
    let body = test_body(90_000);
    let server = serve_ranged(body).await;
    let roots = Roots::new();

    let manager = Manager::new(roots.manager_config()).await.unwrap();
    let download = Downloader::new(
        manager.client().clone(),
        &server.uri(),
        roots.downloader_opts(),
    )
    .await
    .unwrap();
    let id = download.id().clone();
    manager
        .add_download(&download, ItemOpts::default())
        .await
        .unwrap();
    download.start().await.unwrap();

    let dump = manager.export_data().unwrap();
    manager.flush().await.unwrap();
    assert!(manager.get_items().is_empty());

    manager.import_data(&dump).await.unwrap();
    let item = manager.get_item(&id).unwrap();
    assert!(item.is_complete());
    assert_eq!(item.downloaded, 90_000);
    manager.close().await;
}

#[tokio::test]
async fn item_linkage_options_are_persisted() {
    let body = test_body(40_000);
    let server = serve_ranged(body).await;
    let roots = Roots::new();

    let manager = Manager::new(roots.manager_config()).await.unwrap();
    let download = Downloader::new(
        manager.client().clone(),
        &server.uri(),
        roots.downloader_opts(),
    )
    .await
    .unwrap();
    let id = download.id().clone();
    manager
        .add_download(
            &download,
            ItemOpts {
                hidden: true,
                is_child: true,
                parent_id: Some(DownloadId::from("00000000")),
                absolute_location: None,
            },
        )
        .await
        .unwrap();
    manager.close().await;

    let manager = Manager::new(roots.manager_config()).await.unwrap();
    let item = manager.get_item(&id).unwrap();
    assert!(item.hidden);
    assert!(item.is_child);
    assert_eq!(item.parent_id, Some(DownloadId::from("00000000")));
    manager.close().await;
}
