use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::Value;
use std::fmt;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::TransportError;
use crate::model::Pod;

const REMOTE_API_PREFIX: &str = "api/v1/remote/";

/// Delivers one batch payload to one pod.
#[async_trait]
pub trait PodTransport: Send + Sync {
    async fn send(&self, pod: &Pod, endpoint: &str, payload: &Value) -> Result<(), TransportError>;
}

#[derive(Clone)]
pub struct HttpPodTransport {
    http: Client,
    scheme: String,
}

impl fmt::Debug for HttpPodTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpPodTransport")
            .field("scheme", &self.scheme)
            .finish_non_exhaustive()
    }
}

impl HttpPodTransport {
    pub fn new(scheme: &str, user_agent: &str) -> Result<Self> {
        let http = Client::builder()
            .user_agent(user_agent)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            scheme: scheme.to_string(),
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        Self::new(&cfg.transport.scheme, &cfg.transport.user_agent)
    }

    /// `{scheme}://{host}/api/v1/remote/{endpoint}`
    pub fn endpoint_url(&self, pod: &Pod, endpoint: &str) -> Result<Url> {
        let base = Url::parse(&format!("{}://{}/", self.scheme, pod.host))
            .with_context(|| format!("invalid pod host {}", pod.host))?;
        base.join(REMOTE_API_PREFIX)
            .and_then(|u| u.join(endpoint))
            .with_context(|| format!("invalid endpoint {}", endpoint))
    }

    pub fn build_request(&self, pod: &Pod, endpoint: &str, payload: &Value) -> Result<reqwest::Request> {
        let url = self.endpoint_url(pod, endpoint)?;
        self.http
            .post(url)
            .json(payload)
            .build()
            .context("failed to build pod request")
    }
}

#[async_trait]
impl PodTransport for HttpPodTransport {
    async fn send(&self, pod: &Pod, endpoint: &str, payload: &Value) -> Result<(), TransportError> {
        let request = self
            .build_request(pod, endpoint, payload)
            .map_err(|err| TransportError::InvalidAddress(format!("{:#}", err)))?;
        debug!(pod_id = pod.id, url = %request.url(), "sending pod request");
        let res = self.http.execute(request).await?;
        let status = res.status();
        if !status.is_success() {
            let body = res
                .text()
                .await
                .unwrap_or_else(|err| format!("<unreadable body: {err}>"));
            warn!(pod_id = pod.id, %status, "pod rejected request");
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod() -> Pod {
        Pod {
            id: 3,
            host: "pod-a.example:9000".into(),
        }
    }

    #[test]
    fn builds_remote_endpoint_url() {
        let transport = HttpPodTransport::new("https", "test-agent").unwrap();
        let url = transport.endpoint_url(&pod(), "videos/qadu").unwrap();
        assert_eq!(url.as_str(), "https://pod-a.example:9000/api/v1/remote/videos/qadu");
    }

    #[test]
    fn request_carries_json_payload() {
        let transport = HttpPodTransport::new("http", "test-agent").unwrap();
        let payload = json!({ "endpoint": "videos/qadu", "data": [] });
        let req = transport.build_request(&pod(), "videos/qadu", &payload).unwrap();
        assert_eq!(req.method(), &reqwest::Method::POST);
        assert_eq!(
            req.headers().get("content-type").unwrap(),
            "application/json"
        );
        let body = req.body().and_then(|b| b.as_bytes()).unwrap();
        let sent: Value = serde_json::from_slice(body).unwrap();
        assert_eq!(sent, payload);
    }

    #[test]
    fn rejects_bad_host() {
        let transport = HttpPodTransport::new("https", "test-agent").unwrap();
        let bad = Pod {
            id: 1,
            host: "not a host".into(),
        };
        assert!(transport.endpoint_url(&bad, "videos/qadu").is_err());
    }
}
