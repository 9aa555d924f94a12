//! SQLite implementation of the `Store` port
//!
//! Maps the four logical buckets (`metadata`, `content`, `delta_cursor`,
//! `uploads`) plus the node-ID counter onto five tables. All queries use
//! the dynamic `sqlx::query`/`query_as` API; the workspace's `sqlx`
//! feature set carries no compile-time-checked macros.
//!
//! ## Type mapping
//!
//! | Domain type          | SQL type | Strategy |
//! |-----------------------|----------|----------|
//! | `RemoteId`            | TEXT     | `.as_str()` / `RemoteId::new()` |
//! | `FileHash`            | TEXT     | `.as_str()` / `FileHash::try_from()` |
//! | `DeltaToken`          | TEXT     | `.as_str()` / `DeltaToken::new()` |
//! | `DateTime<Utc>`       | TEXT     | `to_rfc3339()` / `DateTime::parse_from_rfc3339()` |
//! | `Vec<RemoteId>` (children) | TEXT (nullable JSON) | `serde_json` array of id strings |
//! | `UploadSession`       | TEXT     | whole struct as one JSON document |

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use onedrivefs_core::domain::{DeltaToken, FileHash, Inode, RemoteId, UploadSession};
use onedrivefs_core::ports::Store;

use crate::StoreError;

/// SQLite-backed implementation of [`Store`].
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::SerializationError(format!("invalid timestamp {s}: {e}")))
}

fn row_to_inode(row: &SqliteRow) -> Result<Inode, StoreError> {
    let id: String = row.try_get("id")?;
    let parent_id: Option<String> = row.try_get("parent_id")?;
    let hash: Option<String> = row.try_get("hash")?;
    let children: Option<String> = row.try_get("children")?;
    let mtime: String = row.try_get("mtime")?;

    let parent_id = parent_id
        .map(RemoteId::new)
        .transpose()
        .map_err(|e| StoreError::SerializationError(e.to_string()))?;
    let hash = hash
        .map(FileHash::try_from)
        .transpose()
        .map_err(|e| StoreError::SerializationError(e.to_string()))?;
    let children = children
        .map(|raw| {
            let ids: Vec<String> = serde_json::from_str(&raw)
                .map_err(|e| StoreError::SerializationError(e.to_string()))?;
            ids.into_iter()
                .map(RemoteId::new)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| StoreError::SerializationError(e.to_string()))
        })
        .transpose()?;

    Ok(Inode {
        id: RemoteId::new(id).map_err(|e| StoreError::SerializationError(e.to_string()))?,
        name: row.try_get("name")?,
        size: row.try_get::<i64, _>("size")? as u64,
        mtime: parse_datetime(&mtime)?,
        parent_id,
        hash,
        etag: row.try_get("etag")?,
        is_directory: row.try_get::<i64, _>("is_directory")? != 0,
        node_id: row.try_get::<i64, _>("node_id")? as u64,
        children,
        data: None,
        has_changes: row.try_get::<i64, _>("has_changes")? != 0,
        subdir_count: row.try_get::<i64, _>("subdir_count")? as u32,
        mode: row.try_get::<i64, _>("mode")? as u32,
    })
}

#[async_trait::async_trait]
impl Store for SqliteStore {
    // --- metadata bucket ---

    async fn save_inode(&self, inode: &Inode) -> anyhow::Result<()> {
        let children = inode
            .children
            .as_ref()
            .map(|ids| {
                serde_json::to_string(&ids.iter().map(RemoteId::as_str).collect::<Vec<_>>())
            })
            .transpose()?;

        sqlx::query(
            "INSERT INTO metadata
                (id, node_id, parent_id, name, size, mtime, hash, etag, is_directory, mode, has_changes, subdir_count, children)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                node_id = excluded.node_id,
                parent_id = excluded.parent_id,
                name = excluded.name,
                size = excluded.size,
                mtime = excluded.mtime,
                hash = excluded.hash,
                etag = excluded.etag,
                is_directory = excluded.is_directory,
                mode = excluded.mode,
                has_changes = excluded.has_changes,
                subdir_count = excluded.subdir_count,
                children = excluded.children",
        )
        .bind(inode.id.as_str())
        .bind(inode.node_id as i64)
        .bind(inode.parent_id.as_ref().map(RemoteId::as_str))
        .bind(&inode.name)
        .bind(inode.size as i64)
        .bind(inode.mtime.to_rfc3339())
        .bind(inode.hash.as_ref().map(FileHash::as_str))
        .bind(inode.etag.as_deref())
        .bind(inode.is_directory as i64)
        .bind(inode.mode as i64)
        .bind(inode.has_changes as i64)
        .bind(inode.subdir_count as i64)
        .bind(children)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_inode(&self, id: &RemoteId) -> anyhow::Result<Option<Inode>> {
        let row = sqlx::query("SELECT * FROM metadata WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_inode).transpose().map_err(Into::into)
    }

    async fn delete_inode(&self, id: &RemoteId) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM metadata WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn move_inode(&self, old: &RemoteId, new: &RemoteId) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE metadata SET id = ? WHERE id = ?")
            .bind(new.as_str())
            .bind(old.as_str())
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE metadata SET parent_id = ? WHERE parent_id = ?")
            .bind(new.as_str())
            .bind(old.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn all_inodes(&self) -> anyhow::Result<Vec<Inode>> {
        let rows = sqlx::query("SELECT * FROM metadata").fetch_all(&self.pool).await?;
        rows.iter()
            .map(row_to_inode)
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    // --- content bucket ---

    async fn save_content(&self, id: &RemoteId, data: &[u8]) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO content (id, data) VALUES (?, ?)
             ON CONFLICT(id) DO UPDATE SET data = excluded.data",
        )
        .bind(id.as_str())
        .bind(data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_content(&self, id: &RemoteId) -> anyhow::Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT data FROM content WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        Ok(match row {
            Some(row) => Some(row.try_get::<Vec<u8>, _>("data")?),
            None => None,
        })
    }

    async fn delete_content(&self, id: &RemoteId) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM content WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn move_content(&self, old: &RemoteId, new: &RemoteId) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT data FROM content WHERE id = ?")
            .bind(old.as_str())
            .fetch_optional(&mut *tx)
            .await?;

        if let Some(row) = row {
            let data: Vec<u8> = row.try_get("data")?;
            sqlx::query(
                "INSERT INTO content (id, data) VALUES (?, ?)
                 ON CONFLICT(id) DO UPDATE SET data = excluded.data",
            )
            .bind(new.as_str())
            .bind(data)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM content WHERE id = ?")
                .bind(old.as_str())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    // --- delta bucket ---

    async fn get_delta_cursor(&self) -> anyhow::Result<Option<DeltaToken>> {
        let row = sqlx::query("SELECT value FROM delta_cursor WHERE key = 'cursor'")
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let value: String = row.try_get("value")?;
                Ok(Some(DeltaToken::new(value)?))
            }
            None => Ok(None),
        }
    }

    async fn save_delta_cursor(&self, cursor: &DeltaToken) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO delta_cursor (key, value) VALUES ('cursor', ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(cursor.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- uploads bucket ---

    async fn save_upload_session(&self, session: &UploadSession) -> anyhow::Result<()> {
        // Keyed by `old_id`, not `id`: `id` mutates in place once the remote
        // promotes a local placeholder (§4.4 "promotion"), but callers must
        // keep addressing the same row across that transition.
        let serialized = serde_json::to_string(session)?;
        sqlx::query(
            "INSERT INTO uploads (id, session) VALUES (?, ?)
             ON CONFLICT(id) DO UPDATE SET session = excluded.session",
        )
        .bind(session.old_id.as_str())
        .bind(serialized)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_upload_session(&self, id: &RemoteId) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM uploads WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn all_upload_sessions(&self) -> anyhow::Result<Vec<UploadSession>> {
        let rows = sqlx::query("SELECT session FROM uploads")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let raw: String = row.try_get("session")?;
                let session: UploadSession = serde_json::from_str(&raw)
                    .map_err(|e| StoreError::SerializationError(e.to_string()))?;
                Ok(session)
            })
            .collect::<Result<Vec<_>, StoreError>>()
            .map_err(Into::into)
    }

    // --- node-ID assignment ---

    async fn next_node_id(&self) -> anyhow::Result<u64> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT next_value FROM node_ids WHERE key = 'counter'")
            .fetch_one(&mut *tx)
            .await?;
        let next: i64 = row.try_get("next_value")?;

        sqlx::query("UPDATE node_ids SET next_value = next_value + 1 WHERE key = 'counter'")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(next as u64)
    }
}
