//! HTTP transport used by the provider adapter
//!
//! [`HttpClient`] is the seam between [`HttpModelClient`](crate::provider::HttpModelClient) and
//! the network, so tests can swap in a canned transport.
use async_trait::async_trait;
use axum::response::IntoResponse;
use hyper_util::{client::legacy::Client, rt::TokioExecutor};
use std::time::Duration;

pub type HyperClient = Client<
    hyper_tls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>,
    axum::body::Body,
>;

pub type TransportError = Box<dyn std::error::Error + Send + Sync>;

#[async_trait]
pub trait HttpClient: std::fmt::Debug + Send + Sync {
    async fn request(
        &self,
        req: axum::extract::Request,
    ) -> Result<axum::response::Response, TransportError>;
}

#[async_trait]
impl HttpClient for HyperClient {
    async fn request(
        &self,
        req: axum::extract::Request,
    ) -> Result<axum::response::Response, TransportError> {
        self.request(req)
            .await
            .map(|res| res.into_response())
            .map_err(|e| Box::new(e) as TransportError)
    }
}

/// Connection pool settings for [`create_hyper_client`].
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_idle_per_host: 100,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

pub fn create_hyper_client(pool: PoolSettings) -> HyperClient {
    let https = hyper_tls::HttpsConnector::new();

    tracing::debug!(
        idle_timeout_secs = pool.idle_timeout.as_secs(),
        max_idle_per_host = pool.max_idle_per_host,
        "HTTP client pool config"
    );

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(pool.idle_timeout)
        .pool_max_idle_per_host(pool.max_idle_per_host)
        .pool_timer(hyper_util::rt::TokioTimer::new())
        .build(https)
}
