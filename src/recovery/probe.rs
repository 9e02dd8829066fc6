//! Liveness probing of the gateway.
//!
//! A probe only answers "is anything listening". Auth failures count as
//! reachable, and transport failures defer to the platform connectivity flag.

use reqwest::StatusCode;
use thiserror::Error;
use url::Url;

use crate::config::RecoveryConfig;
use crate::observability::metrics;

const API_KEY_HEADER: &str = "X-API-Key";

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid probe URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("failed to build probe client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Result of a single probe request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Responded(StatusCode),
    /// No response: connection refused, timeout or similar.
    Failed(String),
}

/// Whether a response status means the gateway is up.
pub fn status_is_reachable(status: StatusCode) -> bool {
    status.is_success() || status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

impl ProbeOutcome {
    /// Classify this outcome given the platform connectivity flag.
    pub fn is_reachable(&self, platform_online: bool) -> bool {
        match self {
            ProbeOutcome::Responded(status) => status_is_reachable(*status),
            ProbeOutcome::Failed(_) => platform_online,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthProbe {
    client: reqwest::Client,
    url: Url,
    api_key: Option<String>,
}

impl HealthProbe {
    pub fn new(config: &RecoveryConfig) -> Result<Self, ProbeError> {
        let url = Url::parse(&format!(
            "{}{}",
            config.probe_base_url.trim_end_matches('/'),
            config.probe_path
        ))?;
        let client = reqwest::Client::builder()
            .timeout(config.probe_timeout())
            .build()?;

        Ok(Self {
            client,
            url,
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Issue one GET against the probe URL.
    pub async fn probe(&self) -> ProbeOutcome {
        let mut request = self.client.get(self.url.clone());
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }

        match request.send().await {
            Ok(response) => ProbeOutcome::Responded(response.status()),
            Err(e) => ProbeOutcome::Failed(e.to_string()),
        }
    }

    /// Probe and classify. Logs and counts the result.
    pub async fn check(&self, platform_online: bool) -> bool {
        let outcome = self.probe().await;
        let reachable = outcome.is_reachable(platform_online);

        match &outcome {
            ProbeOutcome::Responded(status) if !reachable => {
                tracing::warn!(url = %self.url, status = %status, "Health probe failed: non-success status");
            }
            ProbeOutcome::Failed(error) => {
                tracing::warn!(url = %self.url, error = %error, platform_online, "Health probe failed: no response");
            }
            ProbeOutcome::Responded(status) => {
                tracing::trace!(url = %self.url, status = %status, "Health probe ok");
            }
        }

        metrics::record_probe(reachable);
        reachable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(status_is_reachable(StatusCode::OK));
        assert!(status_is_reachable(StatusCode::NO_CONTENT));
        assert!(status_is_reachable(StatusCode::UNAUTHORIZED));
        assert!(status_is_reachable(StatusCode::FORBIDDEN));
        assert!(!status_is_reachable(StatusCode::NOT_FOUND));
        assert!(!status_is_reachable(StatusCode::SERVICE_UNAVAILABLE));
    }

    #[test]
    fn test_transport_failure_defers_to_platform() {
        let failed = ProbeOutcome::Failed("connection refused".into());
        assert!(failed.is_reachable(true));
        assert!(!failed.is_reachable(false));

        let down = ProbeOutcome::Responded(StatusCode::BAD_GATEWAY);
        assert!(!down.is_reachable(true));
    }

    #[test]
    fn test_probe_url_and_invalid_base() {
        let mut config = RecoveryConfig {
            probe_base_url: "http://gateway.local:8080/".into(),
            ..Default::default()
        };
        let probe = HealthProbe::new(&config).unwrap();
        assert_eq!(probe.url().as_str(), "http://gateway.local:8080/health");

        config.probe_base_url = "not a url".into();
        assert!(matches!(HealthProbe::new(&config), Err(ProbeError::InvalidUrl(_))));
    }
}
