//! Remote "mutual friends of user X" interface.
//!
//! Implementations report what the service said for a single logical request;
//! pacing, retries and backoff belong to [`crate::fetcher::MutualFetcher`].

use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use reqwest::header::{COOKIE, USER_AGENT};
use serde::Deserialize;
use std::thread;
use std::time::Duration;

use crate::config::ApiConfig;
use crate::error::{NetworkError, Result};
use crate::session::Session;

/// A mutual connection as returned by the service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutualFriend {
    pub user_id: String,
    pub display_name: Option<String>,
}

impl MutualFriend {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: None,
        }
    }

    pub fn named(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: Some(display_name.into()),
        }
    }
}

/// Outcome of one `fetch_mutuals` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiOutcome {
    Found(Vec<MutualFriend>),
    NotFound,
    RateLimited,
    /// The session was rejected; nothing further can succeed this run
    Unauthorized,
    Transient(String),
}

pub trait MutualsApi: Send + Sync {
    fn fetch_mutuals(&self, session: &dyn Session, user_id: &str) -> ApiOutcome;
}

#[derive(Debug, Deserialize)]
struct MutualEntry {
    #[serde(default)]
    id: Option<String>,
    #[serde(default, rename = "displayName")]
    display_name: Option<String>,
}

/// Blocking HTTP client for `GET /users/{id}/mutuals/friends`, paginated
pub struct HttpMutualsApi {
    client: Client,
    config: ApiConfig,
    base: Url,
    page_spacing: Duration,
}

impl HttpMutualsApi {
    pub fn new(config: ApiConfig) -> Result<Self> {
        let base = Url::parse(&config.base_url)
            .map_err(|e| NetworkError::Config(format!("api.base_url: {}", e)))?;
        if base.cannot_be_a_base() {
            return Err(NetworkError::Config(format!(
                "api.base_url is not a hierarchical URL: {}",
                config.base_url
            )));
        }
        let client = Client::builder().timeout(config.timeout()).build()?;
        let page_spacing = config.page_delay();
        Ok(Self {
            client,
            config,
            base,
            page_spacing,
        })
    }

    /// Never put two page requests on the wire closer than `min_interval`
    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.page_spacing = self.config.page_delay().max(min_interval);
        self
    }

    pub fn page_spacing(&self) -> Duration {
        self.page_spacing
    }

    /// The id is one encoded path segment, so `/`, `?` or `#` stay inside it
    fn page_url(&self, user_id: &str) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["users", user_id, "mutuals", "friends"]);
        }
        url
    }
}

impl MutualsApi for HttpMutualsApi {
    fn fetch_mutuals(&self, session: &dyn Session, user_id: &str) -> ApiOutcome {
        let Some(cookie) = session.cookie_header() else {
            return ApiOutcome::Unauthorized;
        };

        let url = self.page_url(user_id);
        let page_size = self.config.page_size;
        let mut mutuals = Vec::new();
        let mut offset = 0usize;

        loop {
            let response = self
                .client
                .get(url.clone())
                .header(USER_AGENT, &self.config.user_agent)
                .header(COOKIE, &cookie)
                .query(&[("n", page_size), ("offset", offset)])
                .send();

            let response = match response {
                Ok(response) => response,
                Err(e) => return ApiOutcome::Transient(e.to_string()),
            };

            let page: Vec<MutualEntry> = match response.status() {
                StatusCode::OK => match response.json() {
                    Ok(page) => page,
                    Err(e) => return ApiOutcome::Transient(format!("bad response body: {}", e)),
                },
                StatusCode::NOT_FOUND => return ApiOutcome::NotFound,
                StatusCode::TOO_MANY_REQUESTS => return ApiOutcome::RateLimited,
                StatusCode::UNAUTHORIZED => return ApiOutcome::Unauthorized,
                status => return ApiOutcome::Transient(format!("HTTP {}", status)),
            };

            let page_len = page.len();
            mutuals.extend(page.into_iter().filter_map(|entry| {
                entry.id.filter(|id| !id.is_empty()).map(|id| MutualFriend {
                    user_id: id,
                    display_name: entry.display_name,
                })
            }));

            if page_len < page_size {
                break;
            }
            offset += page_size;
            thread::sleep(self.page_spacing);
        }

        ApiOutcome::Found(mutuals)
    }
}
