use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;

use crate::ical::{self, IcalError, ParsedFeed};
use crate::limits::MAX_FEED_BYTES;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("invalid iCal URL")]
    InvalidUrl,
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Transport(String),
    /// Non-2xx response. Displayed with the status code first.
    #[error("{status} {reason}")]
    Status { status: u16, reason: String },
    #[error("feed larger than {MAX_FEED_BYTES} bytes")]
    TooLarge,
    #[error(transparent)]
    Parse(#[from] IcalError),
}

/// Raw outcome of one GET against a feed URL.
#[derive(Debug, Clone)]
pub struct FeedResponse {
    pub status: u16,
    pub body: String,
}

/// Where calendar bodies come from. The HTTP client in production, canned
/// bodies in tests.
#[async_trait]
pub trait CalendarFetcher: Send + Sync {
    async fn get(&self, url: &str) -> Result<FeedResponse, FetchError>;

    /// GET + status check + parse.
    async fn fetch_events(&self, url: &str) -> Result<ParsedFeed, FetchError> {
        let response = self.get(url).await?;
        if !(200..300).contains(&response.status) {
            return Err(FetchError::Status {
                status: response.status,
                reason: reason_phrase(response.status).to_string(),
            });
        }
        Ok(ical::parse(&response.body)?)
    }
}

/// `reqwest` client with a whole-request timeout.
pub struct HttpFetcher {
    client: Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("roomsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl CalendarFetcher for HttpFetcher {
    async fn get(&self, url: &str) -> Result<FeedResponse, FetchError> {
        if !url.get(..4).is_some_and(|p| p.eq_ignore_ascii_case("http")) {
            return Err(FetchError::InvalidUrl);
        }
        let started = Instant::now();
        let result = self.download(url).await;
        metrics::histogram!(crate::observability::FEED_FETCH_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        result
    }
}

impl HttpFetcher {
    async fn download(&self, url: &str) -> Result<FeedResponse, FetchError> {
        let response = self.client.get(url).send().await.map_err(|e| self.classify(e))?;
        let status = response.status().as_u16();
        if response
            .content_length()
            .is_some_and(|len| len > MAX_FEED_BYTES as u64)
        {
            return Err(FetchError::TooLarge);
        }
        let bytes = response.bytes().await.map_err(|e| self.classify(e))?;
        if bytes.len() > MAX_FEED_BYTES {
            return Err(FetchError::TooLarge);
        }
        Ok(FeedResponse {
            status,
            body: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }

    fn classify(&self, e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else {
            FetchError::Transport(e.without_url().to_string())
        }
    }
}

fn reason_phrase(status: u16) -> &'static str {
    reqwest::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unexpected status")
}
