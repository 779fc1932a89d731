// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::get};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::runner::Runner;
use crate::stats::STATS_PATH;

/// Router serving `/stats`, `/health` and `/metrics` for `runner`.
pub fn router(runner: Arc<Runner>) -> Router {
    Router::new()
        .route(
            STATS_PATH,
            get({
                let runner = Arc::clone(&runner);
                move || stats_handler(runner)
            }),
        )
        .route(
            "/health",
            get({
                let runner = Arc::clone(&runner);
                move || health_handler(runner)
            }),
        )
        .route(
            "/metrics",
            get({
                let runner = Arc::clone(&runner);
                move || metrics_handler(runner)
            }),
        )
}

/// Bind the runner's HTTP endpoint. Returns the listener and the address it
/// actually bound, which differs from `port` when `port` is 0.
pub async fn bind(host: &str, port: u16) -> anyhow::Result<(TcpListener, SocketAddr)> {
    let address = format!("{}:{}", host, port);
    tracing::debug!("Starting HTTP server on: {}", address);

    match TcpListener::bind(&address).await {
        Ok(listener) => {
            let actual_address = listener.local_addr()?;
            tracing::debug!("HTTP server bound to: {}", actual_address);
            Ok((listener, actual_address))
        }
        Err(e) => {
            tracing::error!("Failed to bind to address {}: {}", address, e);
            Err(anyhow::anyhow!("Failed to bind to address: {}", e))
        }
    }
}

/// Serve `runner` on `listener` until `cancel_token` fires.
pub async fn serve(
    listener: TcpListener,
    cancel_token: CancellationToken,
    runner: Arc<Runner>,
) -> anyhow::Result<()> {
    let observer = cancel_token.child_token();
    if let Err(e) = axum::serve(listener, router(runner))
        .with_graceful_shutdown(observer.cancelled_owned())
        .await
    {
        tracing::error!("HTTP server error: {}", e);
    }
    Ok(())
}

/// Bind `host:port` and serve `runner` until `cancel_token` fires.
pub async fn start_stats_server(
    host: &str,
    port: u16,
    cancel_token: CancellationToken,
    runner: Arc<Runner>,
) -> anyhow::Result<()> {
    let (listener, _) = bind(host, port).await?;
    serve(listener, cancel_token, runner).await
}

/// Fresh snapshot on every request.
async fn stats_handler(runner: Arc<Runner>) -> impl IntoResponse {
    (StatusCode::OK, Json(runner.stats()))
}

async fn health_handler(runner: Arc<Runner>) -> impl IntoResponse {
    let uptime = runner.uptime();
    let response = format!("OK\nUptime: {} seconds", uptime.as_secs());
    (StatusCode::OK, response)
}

async fn metrics_handler(runner: Arc<Runner>) -> impl IntoResponse {
    match runner.metrics().encode(&runner.stats()) {
        Ok(response) => (StatusCode::OK, response),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to encode metrics".to_string(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunnerConfig;
    use crate::stats::RunnerStats;
    use tokio::time::{Duration, sleep};

    fn runner() -> Arc<Runner> {
        let config = RunnerConfig {
            parallelism: 2,
            ..Default::default()
        };
        Arc::new(Runner::from_config(&config).unwrap())
    }

    async fn body_string(response: axum::response::Response) -> (StatusCode, String) {
        let (parts, body) = response.into_parts();
        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        (parts.status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_http_server_lifecycle() {
        let cancel_token = CancellationToken::new();
        let cancel_token_for_server = cancel_token.clone();
        let runner = runner();

        let server_handle = tokio::spawn(async move {
            let _ = start_stats_server("127.0.0.1", 0, cancel_token_for_server, runner).await;
        });

        // wait for a while to let the server start
        sleep(Duration::from_millis(100)).await;

        cancel_token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), server_handle).await;
        assert!(
            result.is_ok(),
            "HTTP server should shut down when cancel token is cancelled"
        );
    }

    #[tokio::test]
    async fn test_stats_handler() {
        let runner = runner();
        let _seq = runner
            .new_sequence(&CancellationToken::new(), false)
            .await
            .unwrap();

        let (status, body) = body_string(stats_handler(runner).await.into_response()).await;
        assert_eq!(status, StatusCode::OK);

        let stats: RunnerStats = serde_json::from_str(&body).unwrap();
        assert_eq!(stats.slots, 2);
        assert_eq!(stats.slots_in_use, 1);
        assert_eq!(stats.context_initial, 4096);
        assert_eq!(stats.context_max, 262144);
    }

    #[tokio::test]
    async fn test_health_handler() {
        let (status, body) = body_string(health_handler(runner()).await.into_response()).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("OK"));
        assert!(body.contains("Uptime:"));
    }

    #[tokio::test]
    async fn test_metrics_handler() {
        let (status, body) = body_string(metrics_handler(runner()).await.into_response()).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("dynamo_runner_slots 2"));
    }
}
