//! Single WebSocket connection with auto-reconnect and ping keep-alive.
//!
//! Each `WsConnection` runs as a tokio task that:
//! 1. Connects to the endpoint (TLS via `tokio-tungstenite`).
//! 2. Sends the subscription message, if any.
//! 3. Forwards every inbound text frame to an `mpsc` channel.
//! 4. Sends periodic ping frames when configured and answers server pings.
//! 5. Reconnects after any disconnect, waiting on a jittered [`Backoff`].
//!
//! The task exits when `stop` is called or when the receiving half of the
//! frame channel is dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::backoff::{Backoff, BackoffPolicy};

/// Configuration for a single WebSocket connection.
#[derive(Debug, Clone)]
pub struct WsConnConfig {
    /// Full WebSocket URL (e.g. `wss://stream.binance.com:9443/stream`).
    pub url: String,
    /// Message sent immediately after every (re)connect.
    pub subscribe_msg: Option<String>,
    /// Interval between client ping frames.
    pub ping_interval: Option<Duration>,
    /// Reconnect delay policy.
    pub reconnect: BackoffPolicy,
    /// Label used in log lines.
    pub label: String,
}

/// A single WebSocket connection managed by a background tokio task.
pub struct WsConnection {
    config: WsConnConfig,
    shutdown_tx: Option<watch::Sender<bool>>,
    task: Option<tokio::task::JoinHandle<()>>,
    reconnects: Arc<AtomicU64>,
}

impl WsConnection {
    /// Create a new (not yet started) connection.
    pub fn new(config: WsConnConfig) -> Self {
        Self {
            config,
            shutdown_tx: None,
            task: None,
            reconnects: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start the connection task; text frames are sent to `frames`.
    pub fn start(&mut self, frames: mpsc::Sender<String>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = self.config.clone();
        let reconnects = Arc::clone(&self.reconnects);

        self.task = Some(tokio::spawn(async move {
            connection_loop(config, frames, shutdown_rx, reconnects).await;
        }));
        self.shutdown_tx = Some(shutdown_tx);
    }

    /// Number of reconnects since start.
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Stop the connection and wait for the task to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Host part of a URL, for log lines.
fn extract_host(url: &str) -> String {
    url::Url::parse(url)
        .map(|u| u.host_str().unwrap_or("").to_string())
        .unwrap_or_default()
}

/// Why the inner read loop ended.
enum Disconnect {
    Shutdown,
    ReceiverGone,
    Lost,
}

/// Main connection loop: connect, subscribe, read and reconnect until shutdown.
async fn connection_loop(
    config: WsConnConfig,
    frames: mpsc::Sender<String>,
    mut shutdown_rx: watch::Receiver<bool>,
    reconnects: Arc<AtomicU64>,
) {
    let label = &config.label;
    let mut backoff = Backoff::new(config.reconnect.clone());

    loop {
        if *shutdown_rx.borrow() {
            info!("[{label}] shutdown requested");
            return;
        }

        info!("[{label}] connecting to {}", extract_host(&config.url));

        match tokio_tungstenite::connect_async(config.url.as_str()).await {
            Ok((stream, _response)) => {
                backoff.reset();
                info!("[{label}] connected");
                match session(&config, stream, &frames, &mut shutdown_rx).await {
                    Disconnect::Shutdown | Disconnect::ReceiverGone => return,
                    Disconnect::Lost => {}
                }
            }
            Err(e) => {
                error!("[{label}] connection failed: {e}");
            }
        }

        let delay = backoff.next_delay();
        reconnects.fetch_add(1, Ordering::Relaxed);
        warn!("[{label}] disconnected, reconnecting in {delay:?}");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {},
            _ = shutdown_rx.changed() => return,
        }
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Drive one established connection until it drops or shutdown is signalled.
async fn session(
    config: &WsConnConfig,
    stream: WsStream,
    frames: &mpsc::Sender<String>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Disconnect {
    let label = &config.label;
    let (mut ws_write, mut ws_read) = stream.split();

    if let Some(ref sub_msg) = config.subscribe_msg {
        debug!("[{label}] subscribing: {sub_msg}");
        if let Err(e) = ws_write.send(Message::Text(sub_msg.clone().into())).await {
            error!("[{label}] subscribe send failed: {e}");
            return Disconnect::Lost;
        }
    }

    let mut ping = config.ping_interval.map(tokio::time::interval);

    loop {
        let ping_tick = async {
            match ping.as_mut() {
                Some(interval) => {
                    interval.tick().await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = shutdown_rx.changed() => {
                info!("[{label}] shutdown signal received");
                let _ = ws_write.close().await;
                return Disconnect::Shutdown;
            }

            msg = ws_read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if frames.send(text.as_str().to_owned()).await.is_err() {
                            debug!("[{label}] frame receiver dropped");
                            let _ = ws_write.close().await;
                            return Disconnect::ReceiverGone;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        warn!("[{label}] received close frame");
                        return Disconnect::Lost;
                    }
                    Some(Err(e)) => {
                        error!("[{label}] read error: {e}");
                        return Disconnect::Lost;
                    }
                    None => {
                        warn!("[{label}] stream ended");
                        return Disconnect::Lost;
                    }
                    _ => {} // Binary, Pong, Frame: ignore
                }
            }

            _ = ping_tick => {
                if let Err(e) = ws_write.send(Message::Ping(Vec::new().into())).await {
                    error!("[{label}] ping send error: {e}");
                    return Disconnect::Lost;
                }
            }
        }
    }
}
