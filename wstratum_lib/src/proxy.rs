// Copyright (C) 2024, 2025 Wstratum Developers (see AUTHORS)
//
// This file is part of Wstratum
//
// Wstratum is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Wstratum is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// Wstratum. If not, see <https://www.gnu.org/licenses/>.

//! The proxy entry point: accepts browser WebSockets, binds each one to
//! an upstream connection from a keyed pool, and serves aggregate stats.

use crate::config::ProxyConfig;
use crate::connector::Connector;
use crate::donation::Donation;
use crate::error::Error;
use crate::miner::{Miner, MinerOptions};
use crate::upstream::{spawn_upstream, SessionRole, UpstreamHandle};
use axum::{
    extract::ws::{WebSocket, WebSocketUpgrade},
    extract::{Query, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

const AGENT: &str = concat!("wstratum/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Total miner sessions across all upstream connections.
    pub miners: usize,
    /// Upstream connections serving miners; donation connections are not
    /// counted.
    pub connections: usize,
}

struct ProxyState {
    config: ProxyConfig,
    connector: Connector,
    /// `"host:port"` to its ordered connections. Only `get_connection`,
    /// `purge` and `kill` touch this map.
    pool: Mutex<HashMap<String, Vec<UpstreamHandle>>>,
    next_connection_id: AtomicU64,
    next_session_id: AtomicU64,
}

impl ProxyState {
    fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn next_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Return an upstream connection with spare capacity for the key,
    /// dialing a new one when every existing connection is full. The
    /// most recently created available connection wins, which lets older
    /// connections drain and get purged.
    async fn get_connection(
        &self,
        host: &str,
        port: u16,
        donation: bool,
    ) -> Result<UpstreamHandle, Error> {
        let max = self.config.max_miners_per_connection;
        let mut pool = self.pool.lock().await;
        let connections = pool.entry(format!("{}:{}", host, port)).or_default();
        connections.retain(|handle| !handle.is_closed());

        for handle in connections.iter().rev() {
            if handle.donation != donation {
                continue;
            }
            if let Ok((miners, donations)) = handle.counts().await {
                if miners < max && donations < max {
                    return Ok(handle.clone());
                }
            }
        }

        let id = self.next_connection_id();
        let stream = self.connector.connect(host, port, self.config.ssl).await?;
        let handle = spawn_upstream(id, host.to_string(), port, donation, max, stream);
        info!(
            "Opened upstream connection {} to {}:{} (donation: {})",
            id, host, port, donation
        );
        connections.push(handle.clone());
        Ok(handle)
    }

    /// Keep at most one empty connection per key; kill and drop the rest.
    async fn purge(&self) {
        let mut pool = self.pool.lock().await;
        for (key, connections) in pool.iter_mut() {
            connections.retain(|handle| !handle.is_closed());
            let mut kept_empty = false;
            let mut keep = Vec::with_capacity(connections.len());
            for handle in connections.drain(..) {
                let empty = matches!(handle.counts().await, Ok((0, 0)));
                if empty {
                    if kept_empty {
                        info!("Purging idle upstream connection {} to {}", handle.id, key);
                        handle.shutdown().await;
                        continue;
                    }
                    kept_empty = true;
                }
                keep.push(handle);
            }
            *connections = keep;
        }
        pool.retain(|_, connections| !connections.is_empty());
    }

    /// Tear down every upstream connection. Sessions observe the closure
    /// through their own event channels and unwind themselves.
    async fn kill_connections(&self) {
        let mut pool = self.pool.lock().await;
        for (_, connections) in pool.drain() {
            for handle in connections {
                handle.shutdown().await;
            }
        }
    }

    async fn stats(&self) -> StatsSnapshot {
        let pool = self.pool.lock().await;
        let mut miners = 0;
        let mut connections = 0;
        for handle in pool.values().flatten() {
            if handle.is_closed() {
                continue;
            }
            if let Ok((m, _)) = handle.counts().await {
                miners += m;
            }
            if !handle.donation {
                connections += 1;
            }
        }
        StatsSnapshot {
            miners,
            connections,
        }
    }
}

/// Resolve the upstream a client goes to. With `dynamic_pool` enabled, a
/// `pool=host:port:pass` query picks the pool per client; empty fields
/// fall back to the configured defaults.
fn resolve_pool(config: &ProxyConfig, query: Option<&str>) -> (String, u16, String) {
    let defaults = (config.host.clone(), config.port, config.pass.clone());
    if !config.dynamic_pool {
        return defaults;
    }
    let Some(query) = query else {
        return defaults;
    };

    let mut parts = query.splitn(3, ':');
    let host = match parts.next() {
        Some(host) if !host.is_empty() => host.to_string(),
        _ => defaults.0,
    };
    let port = parts
        .next()
        .and_then(|port| port.parse::<u16>().ok())
        .unwrap_or(defaults.1);
    let pass = match parts.next() {
        Some(pass) if !pass.is_empty() => pass.to_string(),
        _ => defaults.2,
    };
    (host, port, pass)
}

/// The proxy server. Owns the pool, the purge timer and the HTTP(S)
/// acceptor.
pub struct ProxyServer {
    state: Arc<ProxyState>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    purge_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    tls_handle: Mutex<Option<axum_server::Handle>>,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            state: Arc::new(ProxyState {
                config,
                connector: Connector::new(),
                pool: Mutex::new(HashMap::new()),
                next_connection_id: AtomicU64::new(0),
                next_session_id: AtomicU64::new(0),
            }),
            shutdown_tx: Mutex::new(None),
            purge_task: Mutex::new(None),
            tls_handle: Mutex::new(None),
        }
    }

    pub async fn get_connection(
        &self,
        host: &str,
        port: u16,
        donation: bool,
    ) -> Result<UpstreamHandle, Error> {
        self.state.get_connection(host, port, donation).await
    }

    pub async fn purge(&self) {
        self.state.purge().await;
    }

    pub async fn stats(&self) -> StatsSnapshot {
        self.state.stats().await
    }

    /// The proxy's routes as a plain axum Router, for callers that mount
    /// the proxy into a server of their own instead of using [`listen`].
    ///
    /// [`listen`]: ProxyServer::listen
    pub fn router(&self) -> Router {
        Router::new()
            .route("/stats", get(stats_handler))
            .route("/health", get(health_handler))
            .route(&self.state.config.path, get(ws_handler))
            .with_state(self.state.clone())
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(
                        CorsLayer::new()
                            .allow_origin(Any)
                            .allow_methods(Any)
                            .allow_headers(Any),
                    ),
            )
    }

    /// Bind the HTTP(S) listener and start accepting WebSockets. Returns
    /// the bound address once the acceptor is live; a bind or TLS setup
    /// failure here is the only unrecoverable error in the proxy.
    pub async fn listen(&self) -> Result<SocketAddr, Error> {
        let app = self.router();
        let bind_address = format!(
            "{}:{}",
            self.state.config.listen_hostname, self.state.config.listen_port
        );

        if self.state.config.purge_interval > 0 {
            let state = self.state.clone();
            let period = Duration::from_millis(state.config.purge_interval);
            let task = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    state.purge().await;
                }
            });
            *self.purge_task.lock().await = Some(task);
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        *self.shutdown_tx.lock().await = Some(shutdown_tx);

        let tls = match (&self.state.config.cert, &self.state.config.key) {
            (Some(cert), Some(key)) => Some(
                axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key)
                    .await
                    .map_err(|e| Error::TlsError(e.to_string()))?,
            ),
            (None, None) => None,
            _ => {
                warn!("Ignoring TLS config: both key and cert are required");
                None
            }
        };

        let local_addr = if let Some(tls) = tls {
            let addr: SocketAddr = bind_address
                .parse()
                .map_err(|e| Error::BindError(format!("{}: {}", bind_address, e)))?;
            let handle = axum_server::Handle::new();
            *self.tls_handle.lock().await = Some(handle.clone());

            let server_handle = handle.clone();
            tokio::spawn(async move {
                if let Err(e) = axum_server::bind_rustls(addr, tls)
                    .handle(server_handle)
                    .serve(app.into_make_service())
                    .await
                {
                    error!("HTTPS server error: {}", e);
                }
            });

            let stop_handle = handle.clone();
            tokio::spawn(async move {
                shutdown_rx.await.ok();
                stop_handle.shutdown();
            });

            handle
                .listening()
                .await
                .ok_or_else(|| Error::BindError(bind_address.clone()))?
        } else {
            let listener = tokio::net::TcpListener::bind(&bind_address)
                .await
                .map_err(|e| Error::BindError(format!("{}: {}", bind_address, e)))?;
            let local_addr = listener.local_addr()?;

            tokio::spawn(async move {
                let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                    shutdown_rx.await.ok();
                });
                if let Err(e) = server.await {
                    error!("HTTP server error: {}", e);
                }
            });
            local_addr
        };

        info!(
            "Proxy listening on {} (websocket path {})",
            local_addr, self.state.config.path
        );
        Ok(local_addr)
    }

    /// Tear down every connection and miner and stop the acceptor.
    pub async fn kill(&self) {
        info!("Shutting down proxy");
        if let Some(task) = self.purge_task.lock().await.take() {
            task.abort();
        }
        self.state.kill_connections().await;
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            tx.send(()).ok();
        }
        if let Some(handle) = self.tls_handle.lock().await.take() {
            handle.shutdown();
        }
    }
}

async fn stats_handler(State(state): State<Arc<ProxyState>>) -> Json<StatsSnapshot> {
    Json(state.stats().await)
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<Arc<ProxyState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        if let Err(e) = handle_miner_socket(socket, state, query).await {
            debug!("Miner socket ended: {}", e);
        }
    })
}

/// Bind a fresh WebSocket to an upstream connection and run the session
/// to completion.
async fn handle_miner_socket(
    socket: WebSocket,
    state: Arc<ProxyState>,
    query: HashMap<String, String>,
) -> Result<(), Error> {
    let (host, port, pass) =
        resolve_pool(&state.config, query.get("pool").map(String::as_str));

    let upstream = state.get_connection(&host, port, false).await?;
    let session_id = state.next_session_id();
    let (events_tx, events_rx) = tokio::sync::mpsc::channel(64);

    let mut donations = Vec::with_capacity(state.config.donations.len());
    for donation_config in &state.config.donations {
        let handle = match state
            .get_connection(&donation_config.host, donation_config.port, true)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                warn!(
                    "Skipping donation to {}:{}: {}",
                    donation_config.host, donation_config.port, e
                );
                continue;
            }
        };
        let donation_session_id = state.next_session_id();
        if let Err(e) = handle
            .register(donation_session_id, SessionRole::Donation, events_tx.clone())
            .await
        {
            warn!("Skipping donation, register failed: {}", e);
            continue;
        }
        let donation = Donation::new(
            donation_session_id,
            handle,
            donation_config.address.clone(),
            donation_config.pass.clone(),
            donation_config.percentage,
            Instant::now(),
        );
        if let Err(e) = donation.login(AGENT).await {
            warn!("Donation login send failed: {}", e);
            donation.upstream.unregister(donation_session_id).await;
            continue;
        }
        donations.push(donation);
    }

    if let Err(e) = upstream
        .register(session_id, SessionRole::Miner, events_tx)
        .await
    {
        for donation in &donations {
            donation.upstream.unregister(donation.session_id).await;
        }
        return Err(e);
    }

    let options = MinerOptions {
        diff: state.config.diff,
        address: state.config.address.clone(),
        user: state.config.user.clone(),
    };
    let miner = Miner::new(session_id, upstream, pass, options, donations, events_rx);
    miner.run(socket).await;
    Ok(())
}
