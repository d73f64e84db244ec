use std::future::Future;
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;
use crate::config::Config;
use super::constants::{ATTACHMENT_TOKEN_HEADER, DEFAULT_MIME_TYPE, DEFAULT_REQUEST_TIMEOUT, PROGRESS_PIECE_SIZE};
use super::errors::{Result, UploadError};
use super::progress_stream::{ChunkProgressStream, piece_stream};
use super::traits::{ChunkProgress, ChunkTransport};
use super::types::{AttachmentDescriptor, SessionMeta};

/// `{success, message, data}` wrapper used by every backend response.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: Option<bool>,
    message: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitData {
    upload_id: Option<String>,
}

/// HTTP implementation of the resumable attachment upload protocol.
#[derive(Debug, Clone)]
pub struct ResumableClient {
    client: Client,
    base_url: Url,
    token: Option<String>,
    attachment_token: Option<String>,
}

impl ResumableClient {
    pub fn new(server_url: &str) -> Result<Self> {
        Self::with_timeout(server_url, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(server_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(server_url)?;
        if base_url.cannot_be_a_base() || !matches!(base_url.scheme(), "http" | "https") {
            return Err(UploadError::ConfigError(format!("Invalid server url: {}", server_url)));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url,
            token: None,
            attachment_token: None,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let mut client = Self::with_timeout(
            &config.server_url,
            Duration::from_secs(config.request_timeout_secs),
        )?;
        client.token = config.token.clone();
        client.attachment_token = config.attachment_token.clone();

        Ok(client)
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_attachment_token(mut self, token: impl Into<String>) -> Self {
        self.attachment_token = Some(token.into());
        self
    }

    fn create_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &self.token {
            headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {}", token))?);
        }
        if let Some(token) = &self.attachment_token {
            headers.insert(ATTACHMENT_TOKEN_HEADER, HeaderValue::from_str(token)?);
        }

        Ok(headers)
    }

    /// `{base}/attachments/uploads/{segments..}`
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| UploadError::ConfigError(format!("Invalid server url: {}", self.base_url)))?
            .pop_if_empty()
            .extend(["attachments", "uploads"])
            .extend(segments);

        Ok(url)
    }

    async fn read_envelope<T: DeserializeOwned>(response: Response) -> Result<Option<T>> {
        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            let message = serde_json::from_slice::<Envelope<Value>>(&body)
                .ok()
                .and_then(|envelope| envelope.message)
                .unwrap_or_else(|| format!("Request failed with status {}", status));
            return Err(UploadError::server_error(status.as_u16(), message));
        }

        let envelope: Envelope<T> = serde_json::from_slice(&body)
            .map_err(|err| UploadError::InvalidResponse(err.to_string()))?;

        if envelope.success == Some(false) {
            let message = envelope.message.unwrap_or_else(|| "Request rejected".to_string());
            return Err(UploadError::server_error(status.as_u16(), message));
        }

        Ok(envelope.data)
    }
}

/// Races `operation` against `cancel`.
async fn cancellable<T>(cancel: &CancellationToken, operation: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(UploadError::Cancelled),
        result = operation => result,
    }
}

/// Missing, negative or malformed values count as nothing received.
pub(crate) fn parse_bytes_received(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Number(number)) => number
            .as_u64()
            .or_else(|| {
                number
                    .as_f64()
                    .filter(|f| f.is_finite() && *f > 0.0)
                    .map(|f| f as u64)
            })
            .unwrap_or(0),
        Some(Value::String(text)) => text.trim().parse::<u64>().unwrap_or(0),
        _ => 0,
    }
}

#[async_trait]
impl ChunkTransport for ResumableClient {
    async fn init_session(&self, meta: &SessionMeta, cancel: &CancellationToken) -> Result<String> {
        let url = self.endpoint(&["init"])?;
        let headers = self.create_headers()?;

        let data: Option<InitData> = cancellable(cancel, async {
            let response = self.client.post(url).headers(headers).json(meta).send().await?;
            Self::read_envelope(response).await
        })
        .await?;

        data.and_then(|data| data.upload_id)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| UploadError::InvalidResponse("No 'uploadId' in init response".to_string()))
    }

    async fn get_status(&self, upload_id: &str, cancel: &CancellationToken) -> Result<u64> {
        let url = self.endpoint(&[upload_id])?;
        let headers = self.create_headers()?;

        let data: Option<Value> = cancellable(cancel, async {
            let response = self.client.get(url).headers(headers).send().await?;
            Self::read_envelope(response).await
        })
        .await?;

        Ok(parse_bytes_received(data.as_ref().and_then(|data| data.get("bytesReceived"))))
    }

    async fn upload_chunk(
        &self,
        upload_id: &str,
        offset: u64,
        chunk: Bytes,
        on_progress: ChunkProgress,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let url = self.endpoint(&[upload_id, "chunk"])?;
        let headers = self.create_headers()?;
        let length = chunk.len() as u64;

        let body = reqwest::Body::wrap_stream(ChunkProgressStream::new(
            piece_stream(chunk, PROGRESS_PIECE_SIZE),
            on_progress,
        ));
        let part = Part::stream_with_length(body, length)
            .file_name("chunk")
            .mime_str(DEFAULT_MIME_TYPE)?;
        let form = Form::new().part("chunk", part);

        debug!(upload_id, offset, length, "sending chunk");
        let _: Option<Value> = cancellable(cancel, async {
            let response = self.client
                .post(url)
                .headers(headers)
                .query(&[("offset", offset)])
                .multipart(form)
                .send()
                .await?;
            Self::read_envelope(response).await
        })
        .await?;

        Ok(())
    }

    async fn complete_session(&self, upload_id: &str, cancel: &CancellationToken) -> Result<AttachmentDescriptor> {
        let url = self.endpoint(&[upload_id, "complete"])?;
        let headers = self.create_headers()?;

        let data: Option<AttachmentDescriptor> = cancellable(cancel, async {
            let response = self.client.post(url).headers(headers).send().await?;
            Self::read_envelope(response).await
        })
        .await?;

        data.ok_or_else(|| UploadError::InvalidResponse("No attachment in complete response".to_string()))
    }

    async fn abort_session(&self, upload_id: &str) {
        let result: Result<()> = async {
            let url = self.endpoint(&[upload_id])?;
            let headers = self.create_headers()?;
            self.client.delete(url).headers(headers).send().await?;
            Ok::<(), UploadError>(())
        }
        .await;

        if let Err(err) = result {
            warn!(upload_id, error = %err, "failed to abort upload session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_endpoint_joins_base_path() {
        let client = ResumableClient::new("http://127.0.0.1:5000/api/").unwrap();
        let url = client.endpoint(&["abc-123", "chunk"]).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:5000/api/attachments/uploads/abc-123/chunk");

        let client = ResumableClient::new("http://127.0.0.1:5000/api").unwrap();
        let url = client.endpoint(&["init"]).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:5000/api/attachments/uploads/init");
    }

    #[test]
    fn test_rejects_non_http_server_url() {
        assert!(ResumableClient::new("ftp://example.com").is_err());
        assert!(ResumableClient::new("not a url").is_err());
    }

    #[test]
    fn test_auth_headers() {
        let client = ResumableClient::new("http://localhost/api")
            .unwrap()
            .with_token("jwt")
            .with_attachment_token("att");
        let headers = client.create_headers().unwrap();

        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer jwt");
        assert_eq!(headers.get(ATTACHMENT_TOKEN_HEADER).unwrap(), "att");
    }

    #[test]
    fn test_parse_bytes_received() {
        assert_eq!(parse_bytes_received(Some(&json!(4194304))), 4194304);
        assert_eq!(parse_bytes_received(Some(&json!("1024"))), 1024);
        assert_eq!(parse_bytes_received(Some(&json!(-5))), 0);
        assert_eq!(parse_bytes_received(Some(&json!("abc"))), 0);
        assert_eq!(parse_bytes_received(Some(&json!(null))), 0);
        assert_eq!(parse_bytes_received(None), 0);
    }

    #[tokio::test]
    async fn test_cancellable_prefers_fired_token() {
        let token = CancellationToken::new();
        token.cancel();

        let result = cancellable(&token, async { Ok(1) }).await;
        assert!(matches!(result, Err(UploadError::Cancelled)));
    }
}
