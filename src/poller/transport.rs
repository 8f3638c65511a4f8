//! Fetching metric values from nodes.

use crate::dci::DataSource;
use crate::node::Node;

use chrono::Utc;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Fetch error types.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("metric not supported")]
    NotSupported,
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// What to fetch.
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    pub node: &'a Node,
    pub source: DataSource,
    pub name: &'a str,
    pub instance: &'a str,
}

pub trait Transport: Send + Sync {
    fn fetch(&self, request: &FetchRequest<'_>) -> impl Future<Output = Result<String, FetchError>> + Send;
}

/// Agent access over HTTP: `GET http://<node>:<port>/v1/metrics?name=..`.
/// The agent answers 404 for metrics it does not know.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    port: u16,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(port: u16, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;
        Ok(Self { client, port, timeout })
    }
}

impl Transport for HttpTransport {
    async fn fetch(&self, request: &FetchRequest<'_>) -> Result<String, FetchError> {
        let ip = request
            .node
            .primary_ip
            .ok_or_else(|| FetchError::Config(format!("node {} has no primary address", request.node.name)))?;
        let url = format!("http://{}/v1/metrics", SocketAddr::new(ip, self.port));

        let mut query = vec![("name", request.name)];
        if !request.instance.is_empty() {
            query.push(("instance", request.instance));
        }

        let response = self.client.get(&url).query(&query).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(self.timeout)
            } else {
                FetchError::Network(e.to_string())
            }
        })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::NotSupported);
        }
        if !response.status().is_success() {
            return Err(FetchError::Network(format!("agent returned {}", response.status())));
        }

        let body = response.text().await.map_err(|e| FetchError::Network(e.to_string()))?;
        Ok(body.trim().to_string())
    }
}

/// Values the server computes itself.
pub fn internal_value(name: &str) -> Result<String, FetchError> {
    match name {
        "Dummy" => Ok("0".to_string()),
        "Server.Time" => Ok(Utc::now().timestamp().to_string()),
        _ => Err(FetchError::NotSupported),
    }
}

/// Routes each request by data source.
#[derive(Debug, Clone)]
pub struct SourceTransport {
    agent: HttpTransport,
}

impl SourceTransport {
    pub fn new(agent: HttpTransport) -> Self {
        Self { agent }
    }
}

impl Transport for SourceTransport {
    async fn fetch(&self, request: &FetchRequest<'_>) -> Result<String, FetchError> {
        match request.source {
            DataSource::Internal => internal_value(request.name),
            DataSource::Agent => self.agent.fetch(request).await,
            DataSource::Snmp => Err(FetchError::NotSupported),
            DataSource::Push => Err(FetchError::Config("push items are not polled".to_string())),
        }
    }
}
