//! Durable resource rows behind `nanobot://resource/<uuid>` URIs.

use std::path::Path;
use std::sync::Mutex;

use base64::Engine;
use chrono::Utc;
use nanobot_types::{Resource, ResourceContents};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::db;
use crate::store::StoreError;

pub const RESOURCE_URI_PREFIX: &str = "nanobot://resource/";

/// One stored resource row.
#[derive(Debug, Clone)]
pub struct StoredResource {
    pub account_id: String,
    pub session_id: String,
    pub name: String,
    pub uuid: String,
    pub mime_type: Option<String>,
    pub text: Option<String>,
    pub blob: Option<Vec<u8>>,
    pub size: u64,
}

impl StoredResource {
    pub fn uri(&self) -> String {
        format!("{}{}", RESOURCE_URI_PREFIX, self.uuid)
    }

    pub fn to_resource(&self) -> Resource {
        Resource {
            uri: self.uri(),
            name: self.name.clone(),
            mime_type: self.mime_type.clone(),
            size: Some(self.size),
            annotations: None,
            meta: None,
        }
    }

    pub fn to_contents(&self) -> ResourceContents {
        ResourceContents {
            uri: self.uri(),
            name: Some(self.name.clone()),
            mime_type: self.mime_type.clone(),
            text: self.text.clone(),
            blob: self
                .blob
                .as_ref()
                .map(|b| base64::engine::general_purpose::STANDARD.encode(b)),
        }
    }
}

/// Rows are keyed `(account_id, session_id, name)`; the uuid column keeps
/// external URIs stable across in-place updates.
pub struct ResourceStore {
    conn: Mutex<Connection>,
}

impl ResourceStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            conn: Mutex::new(db::open_database(path)?),
        })
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self {
            conn: Mutex::new(db::open_in_memory()?),
        })
    }

    /// Create a resource, or update in place when `(session, name)` already
    /// exists for this account. The uuid, and therefore the URI, is kept.
    pub fn create(
        &self,
        account_id: &str,
        session_id: &str,
        name: &str,
        mime_type: Option<String>,
        text: Option<String>,
        blob: Option<Vec<u8>>,
    ) -> Result<StoredResource, StoreError> {
        let mime_type = mime_type.or_else(|| guess_mime(name));
        let size = text
            .as_ref()
            .map(|t| t.len() as u64)
            .or_else(|| blob.as_ref().map(|b| b.len() as u64))
            .unwrap_or(0);
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().expect("lock");

        let existing: Option<String> = conn
            .query_row(
                "SELECT uuid FROM resources WHERE account_id=? AND session_id=? AND name=?",
                params![account_id, session_id, name],
                |row| row.get(0),
            )
            .optional()?;

        let uuid = match existing {
            Some(uuid) => {
                conn.execute(
                    "UPDATE resources SET mime_type=?, text_content=?, blob_content=?, size=?, updated_at=?
                     WHERE account_id=? AND session_id=? AND name=?",
                    params![mime_type, text, blob, size as i64, now, account_id, session_id, name],
                )?;
                uuid
            }
            None => {
                let uuid = Uuid::new_v4().to_string();
                conn.execute(
                    "INSERT INTO resources
                        (account_id, session_id, name, uuid, mime_type, text_content, blob_content, size, created_at, updated_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    params![
                        account_id, session_id, name, uuid, mime_type, text, blob, size as i64,
                        now, now
                    ],
                )?;
                uuid
            }
        };

        Ok(StoredResource {
            account_id: account_id.to_string(),
            session_id: session_id.to_string(),
            name: name.to_string(),
            uuid,
            mime_type,
            text,
            blob,
            size,
        })
    }

    /// Look a resource up by its `nanobot://resource/<uuid>` URI, scoped to
    /// the owning account.
    pub fn read(&self, account_id: &str, uri: &str) -> Result<Option<StoredResource>, StoreError> {
        let Some(uuid) = uri.strip_prefix(RESOURCE_URI_PREFIX) else {
            return Ok(None);
        };
        let conn = self.conn.lock().expect("lock");
        let row = conn
            .query_row(
                "SELECT account_id, session_id, name, uuid, mime_type, text_content, blob_content, size
                 FROM resources WHERE uuid=? AND account_id=?",
                params![uuid, account_id],
                row_to_resource,
            )
            .optional()?;
        Ok(row)
    }

    pub fn delete(&self, account_id: &str, uri: &str) -> Result<bool, StoreError> {
        let Some(uuid) = uri.strip_prefix(RESOURCE_URI_PREFIX) else {
            return Ok(false);
        };
        let conn = self.conn.lock().expect("lock");
        let affected = conn.execute(
            "DELETE FROM resources WHERE uuid=? AND account_id=?",
            params![uuid, account_id],
        )?;
        Ok(affected > 0)
    }

    pub fn list(&self, account_id: &str, session_id: &str) -> Result<Vec<StoredResource>, StoreError> {
        let conn = self.conn.lock().expect("lock");
        let mut stmt = conn.prepare(
            "SELECT account_id, session_id, name, uuid, mime_type, text_content, blob_content, size
             FROM resources WHERE account_id=? AND session_id=? ORDER BY name",
        )?;
        let rows = stmt
            .query_map(params![account_id, session_id], row_to_resource)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }
}

fn row_to_resource(row: &rusqlite::Row) -> rusqlite::Result<StoredResource> {
    let size: i64 = row.get(7)?;
    Ok(StoredResource {
        account_id: row.get(0)?,
        session_id: row.get(1)?,
        name: row.get(2)?,
        uuid: row.get(3)?,
        mime_type: row.get(4)?,
        text: row.get(5)?,
        blob: row.get(6)?,
        size: size as u64,
    })
}

fn guess_mime(name: &str) -> Option<String> {
    let ext = name.rsplit('.').next()?.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "json" => "application/json",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "pdf" => "application/pdf",
        "wav" => "audio/wav",
        "mp3" => "audio/mpeg",
        _ => return None,
    };
    Some(mime.to_string())
}
