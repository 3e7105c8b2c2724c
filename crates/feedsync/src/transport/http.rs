//! [`FeedSource`] backed by the news API over HTTP, SSE and WebSocket.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

use super::{push, sse, FeedSource, FetchOutcome, InboundStream, Tier, TierSet};
use crate::config::{EndpointConfig, FeedConfig};
use crate::cursor::Cursor;
use crate::error::FeedError;
use crate::item::Item;

/// `{ data: Item[] }`; pagination extras (`nextCursor`, `hasMore`, `total`) are ignored.
#[derive(Debug, Deserialize)]
struct ListResponse {
    data: Vec<Item>,
}

pub struct HttpSource {
    client: reqwest::Client,
    items_url: Url,
    stream_url: Option<Url>,
    push_url: Option<String>,
    push_topic: String,
    request_timeout: Duration,
}

impl HttpSource {
    pub fn new(endpoints: &EndpointConfig, request_timeout: Duration) -> Result<Self, FeedError> {
        let base = Url::parse(&endpoints.api_base)?;
        let items_url = base.join(&endpoints.items_path)?;
        let stream_url = endpoints
            .stream_path
            .as_deref()
            .map(|p| base.join(p))
            .transpose()?;
        // Per-request timeouts only; a client-wide one would cut the event stream.
        let client = reqwest::Client::builder()
            .no_proxy()
            .connect_timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            items_url,
            stream_url,
            push_url: endpoints.push_url.clone(),
            push_topic: endpoints.push_topic.clone(),
            request_timeout,
        })
    }

    pub fn from_config(config: &FeedConfig) -> Result<Self, FeedError> {
        Self::new(&config.endpoints, config.request_timeout())
    }

    async fn list(
        &self,
        query: &[(&str, String)],
        revision: Option<String>,
    ) -> Result<FetchOutcome, FeedError> {
        let mut req = self
            .client
            .get(self.items_url.clone())
            .query(query)
            .header(reqwest::header::ACCEPT, "application/json")
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .timeout(self.request_timeout);
        if let Some(tag) = revision {
            req = req.header(reqwest::header::IF_NONE_MATCH, tag);
        }
        let resp = req.send().await.map_err(|e| self.network(e))?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_MODIFIED {
            return Ok(FetchOutcome::NotModified);
        }
        if !status.is_success() {
            return Err(FeedError::Status {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        let revision = resp
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = resp.bytes().await.map_err(|e| self.network(e))?;
        let list: ListResponse = serde_json::from_slice(&body)?;
        Ok(FetchOutcome::Items {
            items: list.data,
            revision,
        })
    }

    fn network(&self, e: reqwest::Error) -> FeedError {
        if e.is_timeout() {
            FeedError::Timeout(self.request_timeout)
        } else {
            FeedError::Http(e)
        }
    }
}

#[async_trait]
impl FeedSource for HttpSource {
    async fn fetch_after(
        &self,
        cursor: Cursor,
        limit: usize,
        revision: Option<String>,
    ) -> Result<FetchOutcome, FeedError> {
        self.list(
            &[("after", cursor.to_query()), ("limit", limit.to_string())],
            revision,
        )
        .await
    }

    async fn fetch_before(&self, cursor: Cursor, limit: usize) -> Result<Vec<Item>, FeedError> {
        let outcome = self
            .list(
                &[("cursor", cursor.to_query()), ("limit", limit.to_string())],
                None,
            )
            .await?;
        Ok(match outcome {
            FetchOutcome::Items { items, .. } => items,
            FetchOutcome::NotModified => Vec::new(),
        })
    }

    fn tiers(&self) -> TierSet {
        TierSet {
            push: self.push_url.is_some(),
            stream: self.stream_url.is_some(),
        }
    }

    async fn subscribe(&self, tier: Tier, cursor: Cursor) -> Result<InboundStream, FeedError> {
        let unavailable = |reason: &str| FeedError::TransportDegraded {
            from: tier,
            reason: reason.to_string(),
        };
        match tier {
            Tier::Push => {
                let url = self.push_url.as_deref().ok_or_else(|| unavailable("no push url"))?;
                push::open(url, &self.push_topic).await
            }
            Tier::Stream => {
                let url = self
                    .stream_url
                    .clone()
                    .ok_or_else(|| unavailable("no stream path"))?;
                sse::open(&self.client, url, cursor).await
            }
            Tier::Polling => Err(unavailable("polling has no subscription")),
        }
    }
}
