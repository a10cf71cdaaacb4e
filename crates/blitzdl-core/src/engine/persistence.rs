//! SQLite-backed catalog store
//!
//! Items and their segment ledgers live in two tables; every update rewrites
//! the affected item and its ledger rows in one transaction, so a crash at
//! any point leaves a readable store that is at or behind the bytes on disk.

use crate::error::BlitzError;
use blitzdl_types::{ContentLength, DownloadId, Item, ItemPart, SegmentId};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use sqlx::Row;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Connection pool over the catalog store file.
#[derive(Clone, Debug)]
pub struct CatalogDb {
    pool: SqlitePool,
}

impl CatalogDb {
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, BlitzError> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS items (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                url TEXT NOT NULL,
                date_added TEXT NOT NULL,
                total_size INTEGER NOT NULL,
                downloaded INTEGER NOT NULL DEFAULT 0,
                download_location TEXT NOT NULL,
                absolute_location TEXT,
                hidden INTEGER NOT NULL DEFAULT 0,
                is_child INTEGER NOT NULL DEFAULT 0,
                parent_id TEXT,
                max_connections INTEGER NOT NULL DEFAULT 0,
                max_segments INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS item_parts (
                item_id TEXT NOT NULL,
                initial_offset INTEGER NOT NULL,
                segment_id TEXT NOT NULL,
                final_offset INTEGER NOT NULL,
                compiled INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (item_id, initial_offset),
                FOREIGN KEY (item_id) REFERENCES items(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_item_parts_item ON item_parts(item_id);
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Rewrite an item and its segment ledger in one transaction.
    pub async fn upsert_item(&self, item: &Item) -> Result<(), BlitzError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO items (
                id, name, url, date_added, total_size, downloaded,
                download_location, absolute_location, hidden, is_child,
                parent_id, max_connections, max_segments
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                url = excluded.url,
                total_size = excluded.total_size,
                downloaded = excluded.downloaded,
                download_location = excluded.download_location,
                absolute_location = excluded.absolute_location,
                hidden = excluded.hidden,
                is_child = excluded.is_child,
                parent_id = excluded.parent_id,
                max_connections = excluded.max_connections,
                max_segments = excluded.max_segments
            "#,
        )
        .bind(item.id.as_str())
        .bind(&item.name)
        .bind(&item.url)
        .bind(item.date_added.to_rfc3339())
        .bind(item.total_size.get())
        .bind(item.downloaded)
        .bind(item.download_location.to_string_lossy().to_string())
        .bind(
            item.absolute_location
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
        )
        .bind(item.hidden as i64)
        .bind(item.is_child as i64)
        .bind(item.parent_id.as_ref().map(|p| p.as_str().to_string()))
        .bind(item.max_connections as i64)
        .bind(item.max_segments as i64)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM item_parts WHERE item_id = ?")
            .bind(item.id.as_str())
            .execute(&mut *tx)
            .await?;

        for (ioff, part) in &item.parts {
            sqlx::query(
                r#"
                INSERT INTO item_parts (
                    item_id, initial_offset, segment_id, final_offset, compiled
                ) VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(item.id.as_str())
            .bind(*ioff)
            .bind(part.id.as_str())
            .bind(part.final_offset)
            .bind(part.compiled as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Load every item with its ledger. Used once at manager start so a
    /// fresh process sees the previous state.
    pub async fn load_all(&self) -> Result<Vec<Item>, BlitzError> {
        let item_rows = sqlx::query("SELECT * FROM items ORDER BY date_added")
            .fetch_all(&self.pool)
            .await?;

        let part_rows =
            sqlx::query("SELECT * FROM item_parts ORDER BY item_id, initial_offset")
                .fetch_all(&self.pool)
                .await?;

        let mut parts_map: std::collections::HashMap<String, BTreeMap<i64, ItemPart>> =
            std::collections::HashMap::new();
        for row in part_rows {
            let item_id: String = row.get("item_id");
            let ioff: i64 = row.get("initial_offset");
            let part = ItemPart {
                id: SegmentId::from(row.get::<String, _>("segment_id")),
                final_offset: row.get("final_offset"),
                compiled: row.get::<i64, _>("compiled") != 0,
            };
            parts_map.entry(item_id).or_default().insert(ioff, part);
        }

        let mut items = Vec::with_capacity(item_rows.len());
        for row in item_rows {
            let id: String = row.get("id");
            let parts = parts_map.remove(&id).unwrap_or_default();
            items.push(row_to_item(row, parts)?);
        }
        Ok(items)
    }

    pub async fn delete_item(&self, id: &DownloadId) -> Result<(), BlitzError> {
        sqlx::query("DELETE FROM items WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM item_parts WHERE item_id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drop every item and ledger row.
    pub async fn clear(&self) -> Result<(), BlitzError> {
        sqlx::query("DELETE FROM item_parts")
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM items").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn row_to_item(
    row: sqlx::sqlite::SqliteRow,
    parts: BTreeMap<i64, ItemPart>,
) -> Result<Item, BlitzError> {
    let date_added = DateTime::parse_from_rfc3339(row.get::<String, _>("date_added").as_str())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    Ok(Item {
        id: DownloadId::from(row.get::<String, _>("id")),
        name: row.get("name"),
        url: row.get("url"),
        date_added,
        total_size: ContentLength::new(row.get("total_size")),
        downloaded: row.get("downloaded"),
        download_location: PathBuf::from(row.get::<String, _>("download_location")),
        absolute_location: row
            .get::<Option<String>, _>("absolute_location")
            .map(PathBuf::from),
        hidden: row.get::<i64, _>("hidden") != 0,
        is_child: row.get::<i64, _>("is_child") != 0,
        parent_id: row
            .get::<Option<String>, _>("parent_id")
            .map(DownloadId::from),
        max_connections: row.get::<i64, _>("max_connections") as usize,
        max_segments: row.get::<i64, _>("max_segments") as usize,
        parts,
    })
}
