//! HTTP transport to analysis engines.
//!
//! Every failure is folded into a [`SyncError`]: network trouble and
//! timeouts are `Transport`, anything the engine said that was not a
//! usable 200 is `Engine`. Nothing here panics or retries; retry policy
//! belongs to the dispatcher.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bsync_core::{DispatchRequest, EngineResponse, EngineSpec, SyncError, parse_reply};

#[async_trait]
pub trait EngineTransport: Send + Sync {
    /// Offer one event to one engine.
    async fn send(
        &self,
        engine: &EngineSpec,
        request: &DispatchRequest,
    ) -> Result<EngineResponse, SyncError>;

    /// Call `{endpoint}/health`. Returns the round-trip time in seconds.
    async fn health(&self, engine: &EngineSpec, timeout: Duration) -> Result<f64, SyncError>;
}

pub struct HttpEngineClient {
    http: reqwest::Client,
}

impl HttpEngineClient {
    pub fn new() -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("bsync/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self { http })
    }
}

fn transport_error(engine: &EngineSpec, e: reqwest::Error) -> SyncError {
    if e.is_timeout() {
        SyncError::Transport(format!(
            "{} timed out after {:.1}s",
            engine.id,
            engine.timeout.as_secs_f64()
        ))
    } else {
        SyncError::Transport(e.to_string())
    }
}

#[async_trait]
impl EngineTransport for HttpEngineClient {
    async fn send(
        &self,
        engine: &EngineSpec,
        request: &DispatchRequest,
    ) -> Result<EngineResponse, SyncError> {
        let start = Instant::now();
        let mut builder = self
            .http
            .post(engine.analysis_url())
            .bearer_auth(&engine.token)
            .timeout(engine.timeout)
            .json(&request.payload_for(engine));
        for (name, value) in request.headers_for(engine) {
            builder = builder.header(name, value);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| transport_error(engine, e))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(engine, e))?;
        let elapsed = start.elapsed().as_secs_f64();

        let reply = parse_reply(status, &body)?;
        tracing::debug!(
            "{} answered event {} in {elapsed:.3}s",
            engine.id,
            request.event.id()
        );
        Ok(EngineResponse::ok(reply, elapsed))
    }

    async fn health(&self, engine: &EngineSpec, timeout: Duration) -> Result<f64, SyncError> {
        let start = Instant::now();
        let response = self
            .http
            .get(engine.health_url())
            .bearer_auth(&engine.token)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| transport_error(engine, e))?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(SyncError::Engine {
                status,
                message: "health check failed".into(),
            });
        }
        Ok(start.elapsed().as_secs_f64())
    }
}
