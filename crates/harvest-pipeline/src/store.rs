//! HTTP client for the downstream document store
//!
//! - `GET  documents/latest?identity=<id>` returns the current version or 404
//! - `POST documents?identity=<id>` creates the first version
//! - `POST documents/<version>/versions?identity=<id>` adds a version
//!
//! Documents are posted raw with their own content type; the store answers with the
//! new version identifier.

use async_trait::async_trait;
use reqwest::{header::CONTENT_TYPE, Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

use crate::document::CanonicalDocument;
use crate::error::{PipelineError, Result};
use crate::stages::{DownstreamStore, StoredDocument};

pub struct StoreClient {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LatestResponse {
    version: String,
    content_type: String,
    body: String,
}

#[derive(Debug, Deserialize)]
struct PublishResponse {
    version: String,
}

impl StoreClient {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        let base_url = Url::parse(&normalized)
            .map_err(|e| PipelineError::config(format!("Invalid store URL '{}': {}", base_url, e)))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn documents_url(&self, segments: &[&str], identity: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| PipelineError::config(format!("Store URL {} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .push("documents")
            .extend(segments);
        url.query_pairs_mut().append_pair("identity", identity);
        Ok(url)
    }
}

#[async_trait]
impl DownstreamStore for StoreClient {
    async fn fetch_current(&self, record_identity: &str) -> Result<Option<StoredDocument>> {
        let url = self.documents_url(&["latest"], record_identity)?;
        let response = self
            .authed(self.client.get(url.clone()))
            .send()
            .await
            .map_err(|e| PipelineError::publish(format!("{}: {}", url, e)))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let latest = response
            .error_for_status()
            .map_err(|e| PipelineError::publish(e.to_string()))?
            .json::<LatestResponse>()
            .await
            .map_err(|e| PipelineError::publish(format!("Malformed store response: {}", e)))?;

        Ok(Some(StoredDocument {
            version: latest.version,
            document: CanonicalDocument::new(latest.body, latest.content_type),
        }))
    }

    async fn publish(
        &self,
        record_identity: &str,
        document: &CanonicalDocument,
        previous_version: Option<&str>,
    ) -> Result<String> {
        let url = match previous_version {
            Some(version) => self.documents_url(&[version, "versions"], record_identity)?,
            None => self.documents_url(&[], record_identity)?,
        };
        let response = self
            .authed(self.client.post(url.clone()))
            .header(CONTENT_TYPE, &document.content_type)
            .body(document.body.clone())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| PipelineError::publish(format!("{}: {}", url, e)))?;

        let published = response
            .json::<PublishResponse>()
            .await
            .map_err(|e| PipelineError::publish(format!("Malformed publish response: {}", e)))?;
        Ok(published.version)
    }
}
