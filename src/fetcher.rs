//! Cached HTTP GET for the schedule board.
//!
//! Failures never reach the caller as errors: a page that cannot be fetched
//! is logged and reported as `None`, and the run moves on.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::StatusCode;
use tracing::{debug, warn};
use url::Url;

pub const CACHE_TTL: Duration = Duration::from_secs(300);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
    (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status} for {url}")]
    HttpStatus { status: StatusCode, url: String },
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

struct CachedPage {
    body: String,
    fetched_at: Instant,
}

pub struct HttpFetcher {
    client: reqwest::Client,
    cache: HashMap<String, CachedPage>,
    ttl: Duration,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, FetchError> {
        Self::with_ttl(CACHE_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
        );
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static("pt-BR,pt;q=0.9,en;q=0.8"),
        );

        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .connect_timeout(REQUEST_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            cache: HashMap::new(),
            ttl,
        })
    }

    /// Returns the page body, from cache when the entry is younger than the TTL.
    pub async fn fetch(&mut self, url: &str) -> Option<String> {
        if let Some(page) = self.cache.get(url) {
            if page.fetched_at.elapsed() < self.ttl {
                debug!(url = %url, "cache hit");
                return Some(page.body.clone());
            }
        }

        match self.fetch_fresh(url).await {
            Ok(body) => {
                self.cache.insert(
                    url.to_string(),
                    CachedPage {
                        body: body.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                Some(body)
            }
            Err(e) => {
                warn!(url = %url, error = %e, "fetch failed, treating as no data");
                None
            }
        }
    }

    async fn fetch_fresh(&self, url: &str) -> Result<String, FetchError> {
        let parsed = Url::parse(url)?;
        let response = self.client.get(parsed).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status,
                url: url.to_string(),
            });
        }

        Ok(response.text().await?)
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    pub fn cached_pages(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn second_fetch_is_served_from_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
            .expect(1)
            .mount(&server)
            .await;

        let mut fetcher = HttpFetcher::new().unwrap();
        let url = format!("{}/page", server.uri());
        assert_eq!(fetcher.fetch(&url).await.as_deref(), Some("<html>ok</html>"));
        assert_eq!(fetcher.fetch(&url).await.as_deref(), Some("<html>ok</html>"));
        assert_eq!(fetcher.cached_pages(), 1);
    }

    #[tokio::test]
    async fn stale_entry_is_refetched() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(ResponseTemplate::new(200).set_body_string("body"))
            .expect(2)
            .mount(&server)
            .await;

        let mut fetcher = HttpFetcher::with_ttl(Duration::from_millis(1)).unwrap();
        let url = format!("{}/page", server.uri());
        fetcher.fetch(&url).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fetcher.fetch(&url).await.as_deref(), Some("body"));
    }

    #[tokio::test]
    async fn error_status_is_reported_as_no_data() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let mut fetcher = HttpFetcher::new().unwrap();
        let url = format!("{}/missing", server.uri());
        assert!(fetcher.fetch(&url).await.is_none());
        assert_eq!(fetcher.cached_pages(), 0);
    }

    #[tokio::test]
    async fn unparseable_url_is_reported_as_no_data() {
        let mut fetcher = HttpFetcher::new().unwrap();
        assert!(fetcher.fetch("not a url").await.is_none());
    }

    #[tokio::test]
    async fn clear_cache_drops_entries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x"))
            .mount(&server)
            .await;

        let mut fetcher = HttpFetcher::new().unwrap();
        fetcher.fetch(&format!("{}/a", server.uri())).await;
        fetcher.fetch(&format!("{}/b", server.uri())).await;
        assert_eq!(fetcher.cached_pages(), 2);
        fetcher.clear_cache();
        assert_eq!(fetcher.cached_pages(), 0);
    }
}
