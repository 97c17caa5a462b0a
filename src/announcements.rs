//! Announcement documents shown on the student dashboard.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::store::{DocStore, StoreError};

pub const ANNOUNCEMENTS: &str = "announcements";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub id: String,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub author: String,
    pub created_at: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AnnouncementError {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub fn create_announcement(
    store: &DocStore,
    title: &str,
    body: &str,
    author: &str,
) -> Result<Announcement, AnnouncementError> {
    let title = title.trim();
    let body = body.trim();
    if title.is_empty() {
        return Err(AnnouncementError::Validation(
            "announcement title is required".to_string(),
        ));
    }
    if body.is_empty() {
        return Err(AnnouncementError::Validation(
            "announcement body is required".to_string(),
        ));
    }

    let announcement = Announcement {
        id: Uuid::new_v4().to_string(),
        title: title.to_string(),
        body: body.to_string(),
        author: author.trim().to_string(),
        created_at: Utc::now().to_rfc3339(),
    };
    let doc = serde_json::to_value(&announcement).map_err(StoreError::from)?;
    store.run_transaction(|tx| -> Result<(), StoreError> {
        tx.read(ANNOUNCEMENTS, &announcement.id)?;
        tx.write(ANNOUNCEMENTS, &announcement.id, doc.clone());
        Ok(())
    })?;
    Ok(announcement)
}

/// Newest first; ties on timestamp fall back to id so the order is stable.
pub fn list_announcements(store: &DocStore) -> Result<Vec<Announcement>, StoreError> {
    let mut announcements = Vec::new();
    for snap in store.list(ANNOUNCEMENTS)? {
        announcements.push(snap.parse::<Announcement>(ANNOUNCEMENTS)?);
    }
    announcements.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
    Ok(announcements)
}

pub fn delete_announcement(store: &DocStore, id: &str) -> Result<bool, StoreError> {
    store.run_transaction(|tx| {
        if tx.read(ANNOUNCEMENTS, id)?.is_none() {
            return Ok(false);
        }
        tx.delete(ANNOUNCEMENTS, id);
        Ok(true)
    })
}
