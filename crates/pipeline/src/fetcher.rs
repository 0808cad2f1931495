//! External source client.

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::Url;
use thiserror::Error;
use tracing::{debug, info};

use etl_core::config::SourceConfig;
use etl_core::SourceRecord;

/// Why no batch could be obtained from the source.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid source URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} responded with status {status}")]
    Status { url: String, status: u16 },

    #[error("{url} returned a malformed payload: {source}")]
    Malformed {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Something that yields one batch of source records per call.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self) -> Result<Vec<SourceRecord>, FetchError>;
}

/// Fetches a JSON array of records with a single GET.
#[derive(Debug, Clone)]
pub struct HttpSourceFetcher {
    client: reqwest::Client,
    url: Url,
}

impl HttpSourceFetcher {
    /// Builds the request URL by resolving `params` against `endpoint`, so
    /// `"?count=5"` appends a query and `"items"` replaces the last segment.
    pub fn new(config: &SourceConfig) -> Result<Self, FetchError> {
        let invalid = |reason: String| FetchError::InvalidUrl {
            url: format!("{}{}", config.endpoint, config.params),
            reason,
        };
        let base = Url::parse(&config.endpoint).map_err(|e| invalid(e.to_string()))?;
        let url = if config.params.is_empty() {
            base
        } else {
            base.join(&config.params).map_err(|e| invalid(e.to_string()))?
        };

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;

        Ok(Self { client, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl SourceFetcher for HttpSourceFetcher {
    async fn fetch(&self) -> Result<Vec<SourceRecord>, FetchError> {
        let url = self.url.to_string();
        debug!(%url, "requesting source data");

        let resp = self
            .client
            .get(self.url.clone())
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|source| FetchError::Transport {
                url: url.clone(),
                source,
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url,
                status: status.as_u16(),
            });
        }

        let records: Vec<SourceRecord> = resp
            .json()
            .await
            .map_err(|source| FetchError::Malformed { url, source })?;
        info!(records = records.len(), "source data retrieved");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn config(endpoint: &str, params: &str) -> SourceConfig {
        SourceConfig {
            endpoint: endpoint.into(),
            params: params.into(),
            request_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn query_params_are_appended() {
        let f = HttpSourceFetcher::new(&config("http://source.local/api/items", "?count=5")).unwrap();
        assert_eq!(f.url().as_str(), "http://source.local/api/items?count=5");
    }

    #[test]
    fn empty_params_keep_the_endpoint() {
        let f = HttpSourceFetcher::new(&config("http://source.local/api/items", "")).unwrap();
        assert_eq!(f.url().as_str(), "http://source.local/api/items");
    }

    #[test]
    fn relative_path_resolves_against_endpoint() {
        let f = HttpSourceFetcher::new(&config("http://source.local/api/", "items?page=2")).unwrap();
        assert_eq!(f.url().as_str(), "http://source.local/api/items?page=2");
    }

    #[test]
    fn unparseable_endpoint_is_rejected() {
        let err = HttpSourceFetcher::new(&config("not a url", "")).unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl { .. }));
    }
}
