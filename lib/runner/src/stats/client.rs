// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Consumer side of the runner stats endpoint.
//!
//! The runner may be briefly unready when the query starts, so the client polls
//! on a short fixed interval until it gets a well-formed answer, a terminal
//! failure, or the caller gives up.

use std::time::Duration;

use derive_builder::Builder;
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{RunnerStats, STATS_PATH};
use crate::config::RunnerConfig;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// What the stats client needs to know about a runner process.
pub trait RunnerHandle: Send + Sync {
    /// Local port the runner serves HTTP on.
    fn port(&self) -> u16;

    /// Whether the runner process has exited.
    fn has_exited(&self) -> bool;
}

#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    #[error("failed to finish runner stats query before timeout")]
    Timeout,

    #[error("runner stats query cancelled")]
    Cancelled,

    #[error("runner stats reporting not supported")]
    NotSupported,

    #[error("runner crashed")]
    Crashed,

    #[error("runner error: {body}")]
    Runner { status: u16, body: String },

    #[error("failed to create request: {0}")]
    Request(#[source] reqwest::Error),

    #[error("failed to create HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

#[derive(Debug, Clone, Builder)]
pub struct StatsClientConfig {
    #[builder(default = "\"127.0.0.1\".to_string()", setter(into))]
    pub host: String,

    #[builder(default = "DEFAULT_POLL_INTERVAL")]
    pub poll_interval: Duration,

    /// Deadline used by [`StatsClient::query`].
    #[builder(default = "DEFAULT_TIMEOUT")]
    pub timeout: Duration,
}

impl StatsClientConfig {
    pub fn builder() -> StatsClientConfigBuilder {
        StatsClientConfigBuilder::default()
    }
}

impl Default for StatsClientConfig {
    fn default() -> Self {
        StatsClientConfig::builder().build().unwrap()
    }
}

/// Polls a runner's `/stats` endpoint.
#[derive(Debug, Clone)]
pub struct StatsClient {
    http: reqwest::Client,
    config: StatsClientConfig,
}

impl StatsClient {
    pub fn new(config: StatsClientConfig) -> Result<Self, StatsError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(StatsError::Client)?;
        Ok(Self { http, config })
    }

    /// Client for the runner described by `config`.
    pub fn from_config(config: &RunnerConfig) -> Result<Self, StatsError> {
        Self::new(config.stats_client())
    }

    pub fn poll_interval(&self) -> Duration {
        self.config.poll_interval
    }

    /// [`StatsClient::fetch`] with the configured timeout.
    pub async fn query(
        &self,
        runner: &dyn RunnerHandle,
        cancel: &CancellationToken,
    ) -> Result<RunnerStats, StatsError> {
        self.fetch(runner, cancel, self.config.timeout).await
    }

    fn url(&self, port: u16) -> String {
        format!("http://{}:{}{}", self.config.host, port, STATS_PATH)
    }

    /// Query the runner's stats, retrying transient failures every poll
    /// interval until `timeout` elapses or `cancel` fires.
    ///
    /// Terminal outcomes:
    /// - HTTP 404: [`StatsError::NotSupported`]
    /// - transport failure after the runner exited: [`StatsError::Crashed`]
    /// - any other non-200 status: [`StatsError::Runner`] with the response body
    ///
    /// Transport failures while the runner is alive, unreadable bodies and
    /// malformed payloads are retried.
    pub async fn fetch(
        &self,
        runner: &dyn RunnerHandle,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<RunnerStats, StatsError> {
        let url = self.url(runner.port());
        let deadline = Instant::now() + timeout;
        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.config.poll_interval,
            self.config.poll_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StatsError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return Err(StatsError::Timeout),
                _ = ticker.tick() => {}
            }

            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StatsError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return Err(StatsError::Timeout),
                attempt = self.poll_once(&url, runner) => attempt?,
            };

            if let Some(stats) = attempt {
                return Ok(stats);
            }
        }
    }

    /// One request. `Ok(None)` means retry on the next tick.
    async fn poll_once(
        &self,
        url: &str,
        runner: &dyn RunnerHandle,
    ) -> Result<Option<RunnerStats>, StatsError> {
        let response = match self
            .http
            .get(url)
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_builder() => return Err(StatsError::Request(e)),
            Err(e) => {
                if runner.has_exited() {
                    return Err(StatsError::Crashed);
                }
                tracing::trace!(url, error = %e, "runner stats request failed, retrying");
                return Ok(None);
            }
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StatsError::NotSupported);
        }

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                tracing::trace!(url, error = %e, "failed to read runner stats body, retrying");
                return Ok(None);
            }
        };

        if status != StatusCode::OK {
            let body = String::from_utf8_lossy(&body).into_owned();
            tracing::trace!(
                status = status.as_u16(),
                response = %body,
                "runner failed to report stats"
            );
            return Err(StatsError::Runner {
                status: status.as_u16(),
                body,
            });
        }

        match serde_json::from_slice::<RunnerStats>(&body) {
            Ok(stats) => Ok(Some(stats)),
            Err(e) => {
                tracing::trace!(url, error = %e, "malformed runner stats payload, retrying");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeRunner {
        port: u16,
        exited: AtomicBool,
    }

    impl RunnerHandle for FakeRunner {
        fn port(&self) -> u16 {
            self.port
        }

        fn has_exited(&self) -> bool {
            self.exited.load(Ordering::SeqCst)
        }
    }

    /// A port nothing listens on.
    async fn closed_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_config_builder_defaults() {
        let config = StatsClientConfig::builder().build().unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);

        let default = StatsClientConfig::default();
        assert_eq!(default.host, config.host);
        assert_eq!(default.poll_interval, config.poll_interval);
        assert_eq!(default.timeout, config.timeout);

        let config = StatsClientConfig::builder()
            .host("localhost")
            .poll_interval(Duration::from_millis(25))
            .build()
            .unwrap();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.poll_interval, Duration::from_millis(25));
    }

    #[tokio::test]
    async fn test_exited_runner_is_crashed() {
        let runner = FakeRunner {
            port: closed_port().await,
            exited: AtomicBool::new(true),
        };
        let client = StatsClient::new(StatsClientConfig::default()).unwrap();

        let err = client
            .fetch(&runner, &CancellationToken::new(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, StatsError::Crashed), "got {err:?}");
    }

    #[tokio::test]
    async fn test_unreachable_live_runner_times_out() {
        let runner = FakeRunner {
            port: closed_port().await,
            exited: AtomicBool::new(false),
        };
        let client = StatsClient::new(StatsClientConfig::default()).unwrap();

        let started = std::time::Instant::now();
        let err = client
            .fetch(&runner, &CancellationToken::new(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, StatsError::Timeout), "got {err:?}");
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(
            err.to_string(),
            "failed to finish runner stats query before timeout"
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_first_poll() {
        let runner = FakeRunner {
            port: closed_port().await,
            exited: AtomicBool::new(false),
        };
        let client = StatsClient::new(StatsClientConfig::default()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = client
            .fetch(&runner, &cancel, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, StatsError::Cancelled), "got {err:?}");
    }

    #[tokio::test]
    async fn test_runner_exits_mid_poll() {
        let runner = std::sync::Arc::new(FakeRunner {
            port: closed_port().await,
            exited: AtomicBool::new(false),
        });
        let client = StatsClient::new(StatsClientConfig::default()).unwrap();

        let exiting = runner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            exiting.exited.store(true, Ordering::SeqCst);
        });

        let err = client
            .fetch(runner.as_ref(), &CancellationToken::new(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, StatsError::Crashed), "got {err:?}");
    }
}
