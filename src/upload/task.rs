use std::path::Path;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use super::constants::DEFAULT_MIME_TYPE;
use super::errors::Result;
use super::types::{Category, TaskId, TaskSource, TaskStatus};

/// One user-visible unit of work in the task list.
///
/// Serialized snapshots also carry `progress`, computed from `bytesSent` and
/// `size`; it is ignored when deserializing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTask {
    pub id: TaskId,
    pub source: TaskSource,
    pub name: String,
    pub category: Category,
    pub size: u64,
    pub bytes_sent: u64,
    pub status: TaskStatus,
    pub error: Option<String>,
    pub upload_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadTask {
    pub(crate) fn new(
        id: TaskId,
        source: TaskSource,
        name: String,
        category: Category,
        size: u64,
        created_at: DateTime<Utc>,
    ) -> Self {
        let status = match source {
            TaskSource::File => TaskStatus::Queued,
            TaskSource::Path => TaskStatus::Uploading,
        };

        Self {
            id,
            source,
            name,
            category,
            size,
            bytes_sent: 0,
            status,
            error: None,
            upload_id: None,
            created_at,
            updated_at: created_at,
        }
    }

    /// Fraction of the payload confirmed, always derived from `bytes_sent` and `size`.
    pub fn progress(&self) -> f64 {
        if self.size == 0 {
            return 0.0;
        }

        (self.bytes_sent as f64 / self.size as f64).min(1.0)
    }

    /// Records transferred bytes, never past a known size.
    pub(crate) fn set_bytes_sent(&mut self, bytes: u64) {
        self.bytes_sent = if self.size > 0 { bytes.min(self.size) } else { bytes };
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl Serialize for UploadTask {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("UploadTask", 12)?;
        state.serialize_field("id", &self.id)?;
        state.serialize_field("source", &self.source)?;
        state.serialize_field("name", &self.name)?;
        state.serialize_field("category", &self.category)?;
        state.serialize_field("size", &self.size)?;
        state.serialize_field("bytesSent", &self.bytes_sent)?;
        state.serialize_field("progress", &self.progress())?;
        state.serialize_field("status", &self.status)?;
        state.serialize_field("error", &self.error)?;
        state.serialize_field("uploadId", &self.upload_id)?;
        state.serialize_field("createdAt", &self.created_at)?;
        state.serialize_field("updatedAt", &self.updated_at)?;
        state.end()
    }
}

/// In-memory payload of a file task.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    pub mime_type: String,
    pub data: Bytes,
}

impl UploadFile {
    /// MIME type is guessed from the file extension.
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let name = name.into();
        let mime_type = mime_guess::from_path(&name)
            .first()
            .map(|mime| mime.essence_str().to_string())
            .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string());

        Self {
            name,
            mime_type,
            data: data.into(),
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    /// Reads a local file fully into memory.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read(path).await?;
        let name = basename_from_path(&path.to_string_lossy());

        Ok(Self::new(name, data))
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Last path segment, accepting both `/` and `\` separators.
pub fn basename_from_path(path: &str) -> String {
    path.trim()
        .replace('\\', "/")
        .split('/')
        .filter(|part| !part.is_empty())
        .last()
        .unwrap_or("file")
        .to_string()
}
