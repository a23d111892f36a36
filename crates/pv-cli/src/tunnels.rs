//! Reading tunnel URLs back from the agent
//!
//! The agent may still be starting when `docker compose up` returns, so
//! queries are retried. Every attempt is a complete request; nothing from a
//! failed attempt is kept.

use std::time::Duration;

use async_trait::async_trait;

use pv_core::error::TunnelQueryError;
use pv_core::types::TunnelResult;
use pv_core::RetryPolicy;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// One attempt at fetching the current tunnels
#[async_trait]
pub trait TunnelEndpoint: Send + Sync {
    async fn fetch(&self, services: &[String]) -> Result<TunnelResult, TunnelQueryError>;
}

/// The agent's HTTP API at `base_url`
pub struct AgentEndpoint {
    http: reqwest::Client,
    base_url: String,
}

impl AgentEndpoint {
    pub fn new(base_url: impl Into<String>) -> Result<Self, TunnelQueryError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TunnelQueryError::Unreachable(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, services: &[String]) -> String {
        if services.is_empty() {
            format!("{}/tunnels", self.base_url)
        } else {
            format!("{}/tunnels?services={}", self.base_url, services.join(","))
        }
    }
}

#[async_trait]
impl TunnelEndpoint for AgentEndpoint {
    async fn fetch(&self, services: &[String]) -> Result<TunnelResult, TunnelQueryError> {
        let response = self
            .http
            .get(self.url(services))
            .send()
            .await
            .map_err(|e| TunnelQueryError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TunnelQueryError::BadStatus {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| TunnelQueryError::InvalidBody(e.to_string()))
    }
}

/// Retries tunnel queries under a policy
pub struct TunnelQueryClient {
    policy: RetryPolicy,
}

impl Default for TunnelQueryClient {
    fn default() -> Self {
        Self::new(RetryPolicy::tunnel_query())
    }
}

impl TunnelQueryClient {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Query until an attempt succeeds or attempts run out.
    ///
    /// An empty `services` list means all services.
    pub async fn query_tunnels<E: TunnelEndpoint + ?Sized>(
        &self,
        endpoint: &E,
        services: &[String],
    ) -> Result<TunnelResult, TunnelQueryError> {
        self.policy
            .retry_if(
                "tunnel query",
                || endpoint.fetch(services),
                |e| !matches!(e, TunnelQueryError::InvalidBody(_)),
            )
            .await
            .map_err(|e| {
                let attempts = e.attempts;
                match e.into_inner() {
                    invalid @ TunnelQueryError::InvalidBody(_) => invalid,
                    last => TunnelQueryError::Exhausted {
                        attempts,
                        last: Box::new(last),
                    },
                }
            })
    }
}
