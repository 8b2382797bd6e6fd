//! JSON:API client for the record source
//!
//! One client serves as record source, parent resolver and default transformer.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{ParentRef, ParentResolver, RecordSource};
use crate::document::{CanonicalDocument, CONTENT_TYPE_JSON_LD};
use crate::error::{PipelineError, Result};
use crate::filters::FilterParams;
use crate::model::{IdentityScheme, RecordDescriptor, RecordKind};
use crate::stages::Transformer;

/// Default page size for listings
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Default HTTP timeout in seconds
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;

pub struct ApiClient {
    client: Client,
    base_url: Url,
    token: Option<String>,
    page_size: u32,
    scheme: IdentityScheme,
}

#[derive(Debug, Deserialize)]
struct ListPage {
    data: Vec<Resource>,
    #[serde(default)]
    links: PageLinks,
}

#[derive(Debug, Default, Deserialize)]
struct PageLinks {
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SingleResource {
    data: Resource,
}

#[derive(Debug, Deserialize)]
struct Resource {
    id: String,
    #[serde(default)]
    attributes: Map<String, Value>,
    #[serde(default)]
    relationships: Map<String, Value>,
}

impl Resource {
    fn parent_href(&self) -> Option<&str> {
        let parent = self.relationships.get("parent")?;
        parent
            .pointer("/links/related/href")
            .or_else(|| parent.pointer("/links/related"))
            .and_then(Value::as_str)
    }
}

struct Listing {
    kind: RecordKind,
    next: Option<Url>,
    buffered: VecDeque<Result<RecordDescriptor>>,
}

impl ApiClient {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        page_size: u32,
        timeout: Duration,
        scheme: IdentityScheme,
    ) -> Result<Self> {
        let base_url = Url::parse(&with_trailing_slash(base_url))
            .map_err(|e| PipelineError::config(format!("Invalid API base URL '{}': {}", base_url, e)))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            token,
            page_size,
            scheme,
        })
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn record_url(&self, kind: RecordKind, id: &str) -> Result<Url> {
        self.base_url
            .join(&format!("{}/{}/", kind.collection(), id))
            .map_err(|e| PipelineError::source_fetch(format!("Invalid record id '{}': {}", id, e)))
    }

    fn listing_url(&self, kind: RecordKind, filters: &FilterParams) -> Result<Url> {
        let mut url = self
            .base_url
            .join(&format!("{}/", kind.collection()))
            .map_err(|e| PipelineError::config(format!("Invalid listing URL: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("page[size]", &self.page_size.to_string())
            .append_pair("sort", &format!("-{}", kind.filter_field()))
            .extend_pairs(filters.iter());
        Ok(url)
    }

    async fn fetch_page(&self, url: Url) -> Result<ListPage> {
        debug!(url = %url, "Fetching listing page");
        let response = self
            .authed(self.client.get(url.clone()))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| PipelineError::source_fetch(format!("{}: {}", url, e)))?;
        response
            .json::<ListPage>()
            .await
            .map_err(|e| PipelineError::source_fetch(format!("Malformed listing at {}: {}", url, e)))
    }

    async fn fetch_record(&self, kind: RecordKind, id: &str) -> Result<Resource> {
        let url = self.record_url(kind, id)?;
        let response = self
            .authed(self.client.get(url.clone()))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| PipelineError::source_fetch(format!("{}: {}", url, e)))?;
        let single = response
            .json::<SingleResource>()
            .await
            .map_err(|e| PipelineError::source_fetch(format!("Malformed record at {}: {}", url, e)))?;
        Ok(single.data)
    }

    fn descriptor(
        kind: RecordKind,
        resource: Resource,
        retrieved: DateTime<Utc>,
    ) -> Result<RecordDescriptor> {
        let field = kind.filter_field();
        let raw = resource
            .attributes
            .get(field)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                PipelineError::source_fetch(format!("Record {} has no {}", resource.id, field))
            })?;
        let filter_timestamp = parse_source_timestamp(raw).ok_or_else(|| {
            PipelineError::source_fetch(format!(
                "Record {} has unparseable {} '{}'",
                resource.id, field, raw
            ))
        })?;

        Ok(RecordDescriptor {
            identity: resource.id,
            kind,
            filter_timestamp,
            retrieved_timestamp: retrieved,
        })
    }
}

impl RecordSource for ApiClient {
    fn open(
        &self,
        kind: RecordKind,
        filters: &FilterParams,
    ) -> BoxStream<'_, Result<RecordDescriptor>> {
        let mut listing = Listing {
            kind,
            next: None,
            buffered: VecDeque::new(),
        };
        match self.listing_url(kind, filters) {
            Ok(url) => listing.next = Some(url),
            Err(e) => listing.buffered.push_back(Err(e)),
        }

        stream::unfold(listing, move |mut listing| async move {
            loop {
                if let Some(item) = listing.buffered.pop_front() {
                    return Some((item, listing));
                }
                let url = listing.next.take()?;
                match self.fetch_page(url).await {
                    Ok(page) => {
                        let retrieved = Utc::now();
                        listing.next = page.links.next.and_then(|next| Url::parse(&next).ok());
                        listing.buffered.extend(
                            page.data
                                .into_iter()
                                .map(|resource| Self::descriptor(listing.kind, resource, retrieved)),
                        );
                    }
                    // The cursor is lost with the page, so the listing ends here
                    Err(e) => return Some((Err(e), listing)),
                }
            }
        })
        .boxed()
    }
}

#[async_trait]
impl ParentResolver for ApiClient {
    async fn parent_of(&self, kind: RecordKind, id: &str) -> Result<Option<ParentRef>> {
        let resource = self.fetch_record(kind, id).await?;
        let Some(href) = resource.parent_href() else {
            return Ok(None);
        };
        let parent_id = last_path_segment(href).ok_or_else(|| {
            PipelineError::source_fetch(format!("Unusable parent link '{}' on {}", href, id))
        })?;
        Ok(Some(ParentRef {
            id: parent_id,
            url: href.to_string(),
        }))
    }

    async fn is_accessible(&self, parent: &ParentRef) -> Result<bool> {
        let response = self
            .client
            .get(&parent.url)
            .send()
            .await
            .map_err(|e| PipelineError::source_fetch(format!("{}: {}", parent.url, e)))?;
        Ok(!matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ))
    }
}

#[async_trait]
impl Transformer for ApiClient {
    async fn transform(&self, kind: RecordKind, id: &str) -> Result<CanonicalDocument> {
        let resource = self
            .fetch_record(kind, id)
            .await
            .map_err(|e| PipelineError::transform(e.to_string()))?;

        let document = json!({
            "@id": self.scheme.record_identity(&resource.id),
            "@type": kind.as_str(),
            "source": self.scheme.source_uri(kind, &resource.id),
            "attributes": Value::Object(resource.attributes),
        });
        let body = serde_json::to_vec(&document)
            .map_err(|e| PipelineError::transform(format!("Failed to serialize {}: {}", id, e)))?;
        Ok(CanonicalDocument::new(body, CONTENT_TYPE_JSON_LD))
    }
}

fn with_trailing_slash(base: &str) -> String {
    if base.ends_with('/') {
        base.to_string()
    } else {
        format!("{}/", base)
    }
}

fn last_path_segment(href: &str) -> Option<String> {
    let url = Url::parse(href).ok()?;
    url.path_segments()?
        .filter(|segment| !segment.is_empty())
        .last()
        .map(str::to_string)
}

/// Source timestamps come with or without an offset; offset-less ones are UTC
fn parse_source_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_source_timestamp() {
        let expected = Utc.with_ymd_and_hms(2017, 5, 5, 14, 28, 41).unwrap();
        assert_eq!(parse_source_timestamp("2017-05-05T14:28:41"), Some(expected));
        assert_eq!(parse_source_timestamp("2017-05-05T14:28:41Z"), Some(expected));
        assert_eq!(parse_source_timestamp("2017-05-05T16:28:41+02:00"), Some(expected));
        assert!(parse_source_timestamp("2017-05-05T14:28:41.123456").is_some());
        assert!(parse_source_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_last_path_segment() {
        assert_eq!(
            last_path_segment("https://api.osf.io/v2/nodes/abc12/").as_deref(),
            Some("abc12")
        );
        assert_eq!(last_path_segment("not a url"), None);
    }

    #[test]
    fn test_listing_url() {
        let scheme = IdentityScheme::new("https://osf.io/", "https://api.osf.io/v2/");
        let client = ApiClient::new(
            "https://api.osf.io/v2",
            None,
            50,
            Duration::from_secs(5),
            scheme,
        )
        .unwrap();
        let filters = FilterParams::parse("filter[public]=true").unwrap();

        let url = client.listing_url(RecordKind::User, &filters).unwrap();
        assert_eq!(url.path(), "/v2/users/");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("page[size]".to_string(), "50".to_string())));
        assert!(pairs.contains(&("sort".to_string(), "-date_registered".to_string())));
        assert!(pairs.contains(&("filter[public]".to_string(), "true".to_string())));
    }
}
