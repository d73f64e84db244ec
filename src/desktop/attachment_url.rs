use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use crate::upload::{GatewayProbe, Result};

const ATTACH_SCHEME: &str = "attach://";
const ATTACHMENT_ID_LEN: usize = 24;

/// A `attach://<id>` reference found in text.
struct Reference<'a> {
    start: usize,
    end: usize,
    id: &'a str,
}

fn references(content: &str) -> Vec<Reference<'_>> {
    content
        .match_indices(ATTACH_SCHEME)
        .filter_map(|(start, _)| {
            let id_start = start + ATTACH_SCHEME.len();
            let id = content.get(id_start..id_start + ATTACHMENT_ID_LEN)?;
            id.bytes().all(|b| b.is_ascii_hexdigit()).then(|| Reference {
                start,
                end: id_start + ATTACHMENT_ID_LEN,
                id,
            })
        })
        .collect()
}

/// Unique attachment ids referenced as `attach://<24 hex>`, in order of first appearance.
pub fn extract_attachment_ids(content: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for reference in references(content) {
        if !ids.iter().any(|id| id == reference.id) {
            ids.push(reference.id.to_string());
        }
    }
    ids
}

/// Resolves attachment ids to URLs served by the local gateway.
pub struct AttachmentUrlCache {
    gateway: Arc<dyn GatewayProbe>,
    urls: Mutex<HashMap<String, String>>,
}

impl AttachmentUrlCache {
    pub fn new(gateway: Arc<dyn GatewayProbe>) -> Self {
        Self {
            gateway,
            urls: Mutex::new(HashMap::new()),
        }
    }

    /// `{gateway}/attachments/{id}`; `None` for an empty id.
    pub async fn url_for(&self, attachment_id: &str) -> Result<Option<String>> {
        let attachment_id = attachment_id.trim();
        if attachment_id.is_empty() {
            return Ok(None);
        }

        if let Some(url) = self.urls.lock().await.get(attachment_id) {
            return Ok(Some(url.clone()));
        }

        let gateway = self.gateway.ensure_ready().await?;
        let url = format!("{}/attachments/{}", gateway, attachment_id);
        self.urls.lock().await.insert(attachment_id.to_string(), url.clone());

        Ok(Some(url))
    }

    /// Batch form of [`url_for`](Self::url_for); empty ids are skipped.
    pub async fn urls_for<I, S>(&self, attachment_ids: I) -> Result<HashMap<String, String>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut urls = HashMap::new();
        for attachment_id in attachment_ids {
            let attachment_id = attachment_id.as_ref();
            if let Some(url) = self.url_for(attachment_id).await? {
                urls.insert(attachment_id.trim().to_string(), url);
            }
        }

        Ok(urls)
    }

    /// Replaces every `attach://<id>` reference with its gateway URL.
    pub async fn resolve(&self, content: &str) -> Result<String> {
        let refs = references(content);
        if refs.is_empty() {
            return Ok(content.to_string());
        }

        let urls = self.urls_for(refs.iter().map(|r| r.id)).await?;
        let mut resolved = String::with_capacity(content.len());
        let mut cursor = 0;
        for reference in &refs {
            resolved.push_str(&content[cursor..reference.start]);
            match urls.get(reference.id) {
                Some(url) => resolved.push_str(url),
                None => resolved.push_str(&content[reference.start..reference.end]),
            }
            cursor = reference.end;
        }
        resolved.push_str(&content[cursor..]);

        Ok(resolved)
    }

    /// Drops the cached URL of a deleted attachment.
    pub async fn invalidate(&self, attachment_id: &str) {
        self.urls.lock().await.remove(attachment_id.trim());
    }

    pub async fn clear(&self) {
        self.urls.lock().await.clear();
    }

    pub async fn cached_count(&self) -> usize {
        self.urls.lock().await.len()
    }
}
