use chrono::{DateTime, Utc};
use envhub_core::{BuildStatus, ImageMeta};
use uuid::Uuid;

/// A row in the `images` table.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    pub uid: Uuid,
    /// `<slug>:<tag>` until the build succeeds, then the builder-reported name.
    pub name: String,
    pub status: BuildStatus,
    pub log: String,
    pub image_meta: ImageMeta,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImageRecord {
    /// A fresh record for a build that is about to start.
    pub fn building(uid: Uuid, name: String, image_meta: ImageMeta) -> Self {
        let now = Utc::now();
        Self {
            uid,
            name,
            status: BuildStatus::Building,
            log: String::new(),
            image_meta,
            created_at: now,
            updated_at: now,
        }
    }
}
