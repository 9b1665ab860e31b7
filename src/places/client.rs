use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use super::normalize::RawPlace;
use crate::clock::Clock;
use crate::error::{CrawlError, Result};
use crate::settings::Settings;

/// One logical search: every hit for a free-text query, all pages followed.
#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<RawPlace>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageRequest {
    Query(String),
    Continuation(String),
}

/// Decoded body of one text-search response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchPage {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub results: Vec<RawPlace>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

impl SearchPage {
    pub fn parse(http_status: u16, body: &str) -> Result<Self> {
        let page: SearchPage = serde_json::from_str(body).map_err(|e| {
            CrawlError::upstream(Some(http_status), None, format!("malformed response: {}", e))
        })?;
        page.check_status(http_status)?;
        Ok(page)
    }

    /// `OK` and `ZERO_RESULTS` are success; anything else (including
    /// `INVALID_REQUEST` for a token presented too early) is an upstream error.
    fn check_status(&self, http_status: u16) -> Result<()> {
        match self.status.as_deref() {
            None | Some("OK") | Some("ZERO_RESULTS") => Ok(()),
            Some(other) => Err(CrawlError::upstream(
                Some(http_status),
                Some(other),
                self.error_message.clone().unwrap_or_else(|| "request rejected".into()),
            )),
        }
    }

    fn token(&self) -> Option<&str> {
        self.next_page_token.as_deref().filter(|t| !t.is_empty())
    }
}

/// Transport for a single page request.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, request: &PageRequest) -> Result<SearchPage>;
}

pub struct HttpPageFetcher {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpPageFetcher {
    pub fn new(settings: &Settings) -> Result<Self> {
        let api_key = settings.require_api_key()?.to_string();
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .map_err(|e| CrawlError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            endpoint: settings.endpoint.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch(&self, request: &PageRequest) -> Result<SearchPage> {
        let params: [(&str, &str); 2] = match request {
            PageRequest::Query(q) => [("query", q.as_str()), ("key", self.api_key.as_str())],
            PageRequest::Continuation(t) => [("pagetoken", t.as_str()), ("key", self.api_key.as_str())],
        };

        let response = self.http.get(&self.endpoint).query(&params).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let snippet: String = body.chars().take(200).collect();
            return Err(CrawlError::upstream(Some(status.as_u16()), None, snippet));
        }
        SearchPage::parse(status.as_u16(), &body)
    }
}

/// Follows continuation tokens, waiting `page_delay` before each follow-up
/// and stopping after `max_pages` pages.
pub struct PaginatedSearch<F> {
    fetcher: F,
    clock: Arc<dyn Clock>,
    page_delay: Duration,
    max_pages: usize,
}

impl<F: PageFetcher> PaginatedSearch<F> {
    pub fn new(fetcher: F, clock: Arc<dyn Clock>, settings: &Settings) -> Self {
        Self {
            fetcher,
            clock,
            page_delay: settings.page_delay(),
            max_pages: settings.max_pages.max(1),
        }
    }
}

#[async_trait]
impl<F: PageFetcher> SearchClient for PaginatedSearch<F> {
    async fn search(&self, query: &str) -> Result<Vec<RawPlace>> {
        let mut hits = Vec::new();
        let mut request = PageRequest::Query(query.to_string());
        let mut pages = 0;

        loop {
            let page = self.fetcher.fetch(&request).await?;
            pages += 1;
            debug!(query, page = pages, hits = page.results.len(), "page fetched");

            let token = page.token().map(str::to_string);
            hits.extend(page.results);

            let Some(token) = token else { break };
            if pages >= self.max_pages {
                warn!(query, pages, "page cap reached, ignoring further continuation token");
                break;
            }
            self.clock.sleep(self.page_delay).await;
            request = PageRequest::Continuation(token);
        }

        Ok(hits)
    }
}
