//! RPC client used by agents

use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::{GetTestRequest, GetTestResponse, ResultRequest, ResultResponse, GET_TEST_ROUTE, RESULT_ROUTE};
use crate::utils::RetryPolicy;

/// Transport-level failures; callers retry these with backoff
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("failed to create RPC client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered {status}")]
    Status { url: String, status: StatusCode },

    #[error("invalid response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Client side of the dispatcher RPC surface
#[derive(Clone, Debug)]
pub struct RpcClient {
    client: Client,
    base_url: String,
}

impl RpcClient {
    /// Create a client for the dispatcher at `addr` (`host:port` or a URL).
    ///
    /// The connect timeout follows the retry policy's delay cap so a dead
    /// endpoint is reported before the next backoff step.
    pub fn new(addr: &str, retry: &RetryPolicy) -> Result<Self, RpcError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(retry.max_delay().max(Duration::from_millis(100)))
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .map_err(RpcError::Client)?;

        let base_url = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{addr}")
        };

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get_test(&self, req: &GetTestRequest) -> Result<GetTestResponse, RpcError> {
        self.call(GET_TEST_ROUTE, req).await
    }

    pub async fn result(&self, req: &ResultRequest) -> Result<ResultResponse, RpcError> {
        self.call(RESULT_ROUTE, req).await
    }

    async fn call<Req, Resp>(&self, route: &str, req: &Req) -> Result<Resp, RpcError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, route);
        debug!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .json(req)
            .send()
            .await
            .map_err(|source| RpcError::Transport {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RpcError::Status { url, status });
        }

        response
            .json::<Resp>()
            .await
            .map_err(|source| RpcError::Decode { url, source })
    }
}
