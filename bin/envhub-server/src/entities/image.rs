use std::future::Future;

use chrono::{DateTime, Utc};
use envhub_core::{BuildStatus, ImageMeta};
use tracing::warn;
use uuid::Uuid;

use crate::entities::{ImageRecord, SqliteStore};

/// Persistence for build records.
///
/// Writes that touch the log or the status only apply while the record is
/// still `building`, so terminal records are frozen by the store itself.
pub trait ImageStore: Send + Sync + 'static {
    fn insert_image(&self, record: ImageRecord) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    fn get_image(&self, uid: Uuid) -> impl Future<Output = Result<Option<ImageRecord>, sqlx::Error>> + Send;

    fn find_image_by_name(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<ImageRecord>, sqlx::Error>> + Send;

    /// Newest first.
    fn list_images(&self) -> impl Future<Output = Result<Vec<ImageRecord>, sqlx::Error>> + Send;

    /// Append to the log. `false` when the record is gone or already terminal.
    fn append_log(&self, uid: Uuid, chunk: &str) -> impl Future<Output = Result<bool, sqlx::Error>> + Send;

    /// Move a building record to a terminal status, optionally renaming it.
    /// `false` when the record is gone or already terminal.
    fn finish_build(
        &self,
        uid: Uuid,
        status: BuildStatus,
        name: Option<&str>,
    ) -> impl Future<Output = Result<bool, sqlx::Error>> + Send;

    fn delete_image(&self, uid: Uuid) -> impl Future<Output = Result<bool, sqlx::Error>> + Send;
}

type ImageRow = (String, String, String, String, String, String, String);

const SELECT_COLUMNS: &str = "SELECT uid, name, status, log, image_meta, created_at, updated_at FROM images";

fn decode_err(e: impl std::error::Error + Send + Sync + 'static) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(e))
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>().unwrap_or_else(|e| {
        warn!(value = raw, error = %e, "unparseable timestamp in images table");
        Utc::now()
    })
}

fn from_row(row: ImageRow) -> Result<ImageRecord, sqlx::Error> {
    let (uid, name, status, log, image_meta, created_at, updated_at) = row;
    Ok(ImageRecord {
        uid: uid.parse::<Uuid>().map_err(decode_err)?,
        name,
        status: status.parse::<BuildStatus>().map_err(decode_err)?,
        log,
        image_meta: serde_json::from_str::<ImageMeta>(&image_meta).map_err(decode_err)?,
        created_at: parse_time(&created_at),
        updated_at: parse_time(&updated_at),
    })
}

impl ImageStore for SqliteStore {
    async fn insert_image(&self, record: ImageRecord) -> Result<(), sqlx::Error> {
        let image_meta = serde_json::to_string(&record.image_meta).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        sqlx::query(
            "INSERT INTO images (uid, name, status, log, image_meta, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(record.uid.to_string())
        .bind(&record.name)
        .bind(record.status.as_ref())
        .bind(&record.log)
        .bind(&image_meta)
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_image(&self, uid: Uuid) -> Result<Option<ImageRecord>, sqlx::Error> {
        let row: Option<ImageRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE uid = ?1"))
            .bind(uid.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(from_row).transpose()
    }

    async fn find_image_by_name(&self, name: &str) -> Result<Option<ImageRecord>, sqlx::Error> {
        let row: Option<ImageRow> =
            sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE name = ?1 ORDER BY created_at DESC LIMIT 1"))
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        row.map(from_row).transpose()
    }

    async fn list_images(&self) -> Result<Vec<ImageRecord>, sqlx::Error> {
        let rows: Vec<ImageRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} ORDER BY created_at DESC"))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(from_row).collect()
    }

    async fn append_log(&self, uid: Uuid, chunk: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE images SET log = log || ?1, updated_at = ?2 WHERE uid = ?3 AND status = 'building'",
        )
        .bind(chunk)
        .bind(Utc::now().to_rfc3339())
        .bind(uid.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn finish_build(&self, uid: Uuid, status: BuildStatus, name: Option<&str>) -> Result<bool, sqlx::Error> {
        if !status.is_terminal() {
            return Ok(false);
        }
        let result = sqlx::query(
            "UPDATE images SET status = ?1, name = COALESCE(?2, name), updated_at = ?3 \
             WHERE uid = ?4 AND status = 'building'",
        )
        .bind(status.as_ref())
        .bind(name)
        .bind(Utc::now().to_rfc3339())
        .bind(uid.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_image(&self, uid: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM images WHERE uid = ?1")
            .bind(uid.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
