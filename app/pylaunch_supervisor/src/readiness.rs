/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is dual-licensed under either the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree or the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree. You may select, at your option, one of the
 * above-listed licenses.
 */

//! Readiness probe: an HTTP endpoint and/or a marker file, with a drain
//! window on shutdown so load balancers stop routing before the process
//! goes away.

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use pylaunch_common::config::ResolvedReadiness;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub struct ReadinessProbe {
    config: ResolvedReadiness,
    ready: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
    shutdown: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<std::io::Result<()>>>,
}

impl ReadinessProbe {
    pub fn new(config: ResolvedReadiness) -> Self {
        Self {
            config,
            ready: Arc::new(AtomicBool::new(false)),
            local_addr: None,
            shutdown: None,
            server: None,
        }
    }

    /// The bound address, once the HTTP server is up. Port 0 in the config
    /// binds an ephemeral port.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Start the HTTP endpoint (when enabled). Does not mark ready; the
    /// supervisor does that only after the child is spawned.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let listener =
            tokio::net::TcpListener::bind(("0.0.0.0", self.config.http_port)).await?;
        self.local_addr = Some(listener.local_addr()?);

        let app = Router::new()
            .route(&self.config.http_path, get(ready_handler))
            .with_state(Arc::clone(&self.ready));

        let (tx, rx) = oneshot::channel::<()>();
        self.shutdown = Some(tx);
        self.server = Some(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await
        }));

        tracing::info!(
            "Readiness probe listening on :{}{}",
            self.local_addr.map(|a| a.port()).unwrap_or_default(),
            self.config.http_path
        );
        Ok(())
    }

    /// Flip to ready and write the marker file when configured.
    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
        if let Some(path) = &self.config.file_path {
            if let Err(e) = write_marker(path) {
                tracing::warn!("Failed to write readiness file {}: {}", path, e);
            }
        }
        tracing::info!("Service marked as ready");
    }

    /// Flip to not-ready, remove the marker, hold for the drain window,
    /// then stop the HTTP server. 503s are served throughout the window.
    pub async fn drain(&mut self) {
        if !self.config.enabled && self.config.file_path.is_none() {
            return;
        }

        self.ready.store(false, Ordering::SeqCst);
        if let Some(path) = &self.config.file_path {
            let _ = std::fs::remove_file(path);
        }

        let window = Duration::from_secs(self.config.drain_seconds);
        tracing::info!("Draining for {:?} before shutdown", window);
        tokio::time::sleep(window).await;

        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(server) = self.server.take() {
            if let Ok(Err(e)) = server.await {
                tracing::warn!("Readiness probe server error: {}", e);
            }
        }
    }
}

async fn ready_handler(State(ready): State<Arc<AtomicBool>>) -> (StatusCode, &'static str) {
    if ready.load(Ordering::SeqCst) {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

fn write_marker(path: &str) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::write(path, "ready\n")?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644))
}
