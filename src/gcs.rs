//! Google Cloud Storage backend for [`ObjectStore`].
//!
//! Talks to the JSON API directly with `reqwest`:
//!
//! | Operation | Request |
//! |-----------|---------|
//! | put       | `POST upload/storage/v1/b/{bucket}/o?uploadType=media&name={key}` |
//! | list      | `GET storage/v1/b/{bucket}/o?prefix={prefix}` (paged) |
//! | get       | `GET storage/v1/b/{bucket}/o/{key}?alt=media` |
//! | delete    | `DELETE storage/v1/b/{bucket}/o/{key}` |

use crate::auth::TokenSource;
use crate::error::RelayError;
use crate::storage::{ObjectStore, RemoteObject};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://storage.googleapis.com";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    items: Vec<ObjectResource>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectResource {
    name: String,
    /// The JSON API encodes 64-bit sizes as strings.
    #[serde(default)]
    size: Option<String>,
}

/// Object store backed by Google Cloud Storage.
#[derive(Debug, Clone)]
pub struct GcsObjectStore {
    http: reqwest::Client,
    tokens: Arc<TokenSource>,
    base_url: String,
}

impl GcsObjectStore {
    pub fn new(http: reqwest::Client, tokens: Arc<TokenSource>) -> Self {
        Self::with_base_url(http, tokens, DEFAULT_BASE_URL)
    }

    /// Point the client at an emulator or proxy instead of the public endpoint.
    pub fn with_base_url(
        http: reqwest::Client,
        tokens: Arc<TokenSource>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            http,
            tokens,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, segments: &[&str]) -> Result<Url, RelayError> {
        let mut url = Url::parse(&self.base_url).map_err(|e| RelayError::storage("build url", e))?;
        url.path_segments_mut()
            .map_err(|_| RelayError::storage("build url", "base URL cannot have a path"))?
            .extend(segments);
        Ok(url)
    }

    fn object_url(&self, bucket: &str, key: &str) -> Result<Url, RelayError> {
        self.url(&["storage", "v1", "b", bucket, "o", key])
    }
}

/// Turn a non-2xx response into a storage error carrying the body text.
async fn check(op: &'static str, response: reqwest::Response) -> Result<reqwest::Response, RelayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RelayError::storage(op, format!("HTTP {status}: {}", body.trim())))
}

#[async_trait]
impl ObjectStore for GcsObjectStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), RelayError> {
        let url = self.url(&["upload", "storage", "v1", "b", bucket, "o"])?;
        let token = self.tokens.token().await?;
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .query(&[("uploadType", "media"), ("name", key)])
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| RelayError::storage("upload", e))?;
        check("upload", response).await?;
        Ok(())
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<RemoteObject>, RelayError> {
        let url = self.url(&["storage", "v1", "b", bucket, "o"])?;
        let mut objects = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let token = self.tokens.token().await?;
            let mut request = self
                .http
                .get(url.clone())
                .bearer_auth(token)
                .query(&[("prefix", prefix)]);
            if let Some(ref page) = page_token {
                request = request.query(&[("pageToken", page.as_str())]);
            }
            let response = request
                .send()
                .await
                .map_err(|e| RelayError::storage("list", e))?;
            let page: ListResponse = check("list", response)
                .await?
                .json()
                .await
                .map_err(|e| RelayError::storage("list", e))?;

            objects.extend(page.items.into_iter().map(|item| RemoteObject {
                bucket: bucket.to_string(),
                size: item.size.and_then(|s| s.parse().ok()).unwrap_or(0),
                key: item.name,
            }));

            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }

        debug!("GCS list gs://{}/{}: {} objects", bucket, prefix, objects.len());
        Ok(objects)
    }

    async fn get_object(&self, object: &RemoteObject) -> Result<Bytes, RelayError> {
        let url = self.object_url(&object.bucket, &object.key)?;
        let token = self.tokens.token().await?;
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .query(&[("alt", "media")])
            .send()
            .await
            .map_err(|e| RelayError::storage("download", e))?;
        check("download", response)
            .await?
            .bytes()
            .await
            .map_err(|e| RelayError::storage("download", e))
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), RelayError> {
        let url = self.object_url(bucket, key)?;
        let token = self.tokens.token().await?;
        let response = self
            .http
            .delete(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| RelayError::storage("delete", e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check("delete", response).await?;
        Ok(())
    }

    /// Stream the object body to disk chunk by chunk.
    async fn download_to(&self, object: &RemoteObject, dest: &Path) -> Result<(), RelayError> {
        let url = self.object_url(&object.bucket, &object.key)?;
        let token = self.tokens.token().await?;
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .query(&[("alt", "media")])
            .send()
            .await
            .map_err(|e| RelayError::storage("download", e))?;
        let response = check("download", response).await?;

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| RelayError::fs(dest, e))?;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| RelayError::storage("download", e))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| RelayError::fs(dest, e))?;
        }
        file.flush().await.map_err(|e| RelayError::fs(dest, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> GcsObjectStore {
        GcsObjectStore::new(reqwest::Client::new(), Arc::new(TokenSource::fixed("t")))
    }

    #[test]
    fn object_keys_are_percent_encoded() {
        let url = store().object_url("bucket", "run/a b.pdf").unwrap();
        assert_eq!(
            url.as_str(),
            "https://storage.googleapis.com/storage/v1/b/bucket/o/run%2Fa%20b.pdf"
        );
    }

    #[test]
    fn list_page_parses_string_sizes() {
        let raw = r#"{
            "kind": "storage#objects",
            "items": [
                {"name": "out/r/1/0/a-0.json", "size": "2048"},
                {"name": "out/r/"}
            ],
            "nextPageToken": "abc"
        }"#;
        let page: ListResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].size.as_deref(), Some("2048"));
        assert_eq!(page.next_page_token.as_deref(), Some("abc"));
    }

    #[test]
    fn empty_listing_has_no_items_field() {
        let page: ListResponse = serde_json::from_str(r#"{"kind":"storage#objects"}"#).unwrap();
        assert!(page.items.is_empty());
        assert!(page.next_page_token.is_none());
    }

    #[test]
    fn base_url_trailing_slash_is_ignored() {
        let s = GcsObjectStore::with_base_url(
            reqwest::Client::new(),
            Arc::new(TokenSource::fixed("t")),
            "http://localhost:4443/",
        );
        let url = s.object_url("b", "k").unwrap();
        assert_eq!(url.as_str(), "http://localhost:4443/storage/v1/b/b/o/k");
    }
}
