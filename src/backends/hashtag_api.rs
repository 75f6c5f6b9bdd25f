//! Hashtag statistics API adapter backed by `ureq`.

use std::sync::Arc;
use std::time::Duration;

use log::warn;

use crate::backends::{BackendFailure, HashtagBackend};
use crate::config::RemoteConfig;

const HASHTAG_ENDPOINT_PATH: &str = "/api/v1/hashtag";

pub struct HashtagApiBackend {
    http_client: ureq::Agent,
    base_url: String,
    account_id: String,
}

impl HashtagApiBackend {
    pub fn new(config: &RemoteConfig) -> Result<Self, String> {
        let mut builder = ureq::AgentBuilder::new();
        if let Some(timeout_secs) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(timeout_secs));
        }
        if config.accept_invalid_certs {
            warn!(
                "TLS certificate validation is disabled for {}; set remote.accept_invalid_certs = false once the endpoint serves a valid chain",
                config.base_url
            );
            let connector = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .build()
                .map_err(|err| format!("failed to create hashtag api tls connector: {err}"))?;
            builder = builder.tls_connector(Arc::new(connector));
        }

        Ok(Self {
            http_client: builder.build(),
            base_url: Self::endpoint_base(&config.base_url),
            account_id: config.account_id.clone(),
        })
    }

    fn endpoint_base(base_url: &str) -> String {
        base_url.trim().trim_end_matches('/').to_string()
    }

    pub fn request_url(base_url: &str, account_id: &str, chunk: &str) -> String {
        format!(
            "{}{HASHTAG_ENDPOINT_PATH}?id={}&tags={}",
            Self::endpoint_base(base_url),
            urlencoding::encode(account_id),
            urlencoding::encode(chunk)
        )
    }

    fn classify_ureq_failure(error: &ureq::Error) -> BackendFailure {
        let message = format!("Hashtag request failed: {error}");
        match error {
            ureq::Error::Status(429, _) => BackendFailure::rate_limited(message),
            ureq::Error::Status(_, _) | ureq::Error::Transport(_) => BackendFailure::hard(message),
        }
    }
}

impl HashtagBackend for HashtagApiBackend {
    fn fetch_chunk(&self, chunk: &str) -> Result<String, BackendFailure> {
        let url = Self::request_url(&self.base_url, &self.account_id, chunk);
        let response = self
            .http_client
            .get(&url)
            .set("Content-Type", "application/json")
            .call()
            .map_err(|error| Self::classify_ureq_failure(&error))?;
        response
            .into_string()
            .map_err(|error| BackendFailure::hard(format!("Failed to read response: {error}")))
    }
}
