//! Core broker: accepts viewer connections and routes their messages to
//! sessions.
//!
//! One task per connection runs a select loop between the connection's
//! outbound queue (filled by session fan-out) and its inbound frames.
//! Failures stay local: a bad message, a dead viewer or a failed spawn
//! never takes down another viewer, another session, or the broker.

use crate::config::BrokerConfig;
use crate::http;
use crate::session::{SessionRegistry, Viewer, VIEWER_QUEUE_SIZE};
use crate::transport::websocket::{self, WebSocketConnection};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use termcast_core::{CastError, CastResult, ClientIntent, ClientMessage, ServerMessage};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// How often the idle-session collector runs.
const GC_INTERVAL: Duration = Duration::from_secs(60);

/// The termcast broker instance.
pub struct Broker {
    config: BrokerConfig,
    registry: Arc<SessionRegistry>,
    /// Monotonic id source for viewer connections.
    next_conn_id: AtomicU64,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.clone()));
        Self {
            config,
            registry,
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// The session registry; the HTTP layer resolves sessions through
    /// this exact entry point too.
    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Serve until the process is stopped: HTTP front-end on `port`,
    /// WebSocket viewers on `port + 1`, plus the idle collector.
    pub async fn run(self) -> CastResult<()> {
        let broker = Arc::new(self);

        let http_addr: SocketAddr = format!("0.0.0.0:{}", broker.config.port)
            .parse()
            .map_err(|e| CastError::Other(format!("invalid address: {e}")))?;
        let ws_port = broker.config.port + 1;
        let ws_addr: SocketAddr = format!("0.0.0.0:{ws_port}")
            .parse()
            .map_err(|e| CastError::Other(format!("invalid address: {e}")))?;

        // HTTP front-end (bootstrap page + static assets)
        let app = http::router(
            broker.registry.clone(),
            broker.config.assets_dir.clone(),
            ws_port,
        );
        let http_listener = tokio::net::TcpListener::bind(http_addr)
            .await
            .map_err(|e| CastError::Transport(format!("HTTP bind failed: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = axum::serve(http_listener, app).await {
                error!(error = %e, "HTTP server error");
            }
        });

        // WebSocket listener
        let mut ws_rx = websocket::start_listener(ws_addr).await?;

        // Idle session collector
        if broker.config.idle_timeout > 0 {
            let gc_registry = broker.registry.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(GC_INTERVAL);
                loop {
                    interval.tick().await;
                    gc_registry.gc().await;
                }
            });
        }

        info!(
            http_port = broker.config.port,
            ws_port,
            shell = %broker.config.shell,
            "termcast-server ready"
        );

        while let Some(conn) = ws_rx.recv().await {
            let broker = broker.clone();
            tokio::spawn(async move {
                if let Err(e) = broker.handle_connection(conn).await {
                    debug!(error = %e, "connection ended with error");
                }
            });
        }

        info!("WebSocket listener closed, shutting down");
        Ok(())
    }

    /// Per-viewer loop: pump session output out, dispatch inbound intents.
    async fn handle_connection(&self, mut conn: WebSocketConnection) -> CastResult<()> {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let remote = conn.remote_addr;
        debug!(conn = conn_id, remote = %remote, "viewer connected");

        // Sessions hold the sending half of this queue as the viewer's
        // fan-out target.
        let (viewer_tx, mut viewer_rx) = mpsc::channel::<ServerMessage>(VIEWER_QUEUE_SIZE);

        loop {
            tokio::select! {
                Some(msg) = viewer_rx.recv() => {
                    match serde_json::to_string(&msg) {
                        Ok(text) => {
                            if let Err(e) = websocket::ws_send_text(&mut conn.ws_stream, &text).await {
                                debug!(conn = conn_id, error = %e, "viewer send failed");
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(conn = conn_id, error = %e, "outbound message encode failed");
                        }
                    }
                }

                result = websocket::ws_recv_text(&mut conn.ws_stream) => {
                    match result {
                        Ok(Some(text)) => {
                            self.dispatch(conn_id, &viewer_tx, &text).await;
                        }
                        Ok(None) => {
                            debug!(conn = conn_id, "viewer closed connection");
                            break;
                        }
                        Err(e) => {
                            debug!(conn = conn_id, error = %e, "viewer receive failed");
                            break;
                        }
                    }
                }
            }
        }

        // Transport gone: drop the membership, leave process and buffer
        // alone.
        if let Some(session) = self.registry.remove_viewer(conn_id).await {
            debug!(conn = conn_id, session_id = %session.id(), "viewer removed on close");
        }

        Ok(())
    }

    /// Parse and route one inbound frame. Malformed frames degrade to
    /// keepalives; per-message failures are logged and swallowed.
    async fn dispatch(&self, conn_id: u64, viewer_tx: &mpsc::Sender<ServerMessage>, text: &str) {
        let msg: ClientMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(conn = conn_id, error = %e, "unparseable message ignored");
                return;
            }
        };

        match msg.classify() {
            ClientIntent::Attach { id } => match self.registry.get_or_create(&id).await {
                Ok(session) => {
                    session
                        .attach(Viewer {
                            conn: conn_id,
                            tx: viewer_tx.clone(),
                        })
                        .await;
                }
                Err(e) => {
                    warn!(conn = conn_id, session_id = %id, error = %e, "attach failed");
                }
            },
            ClientIntent::Input { id, data } => match self.registry.get_or_create(&id).await {
                Ok(session) => {
                    if let Err(e) = session.write_input(&data).await {
                        warn!(session_id = %id, error = %e, "input dropped");
                    }
                }
                Err(e) => {
                    warn!(conn = conn_id, session_id = %id, error = %e, "input failed");
                }
            },
            ClientIntent::Resize { id, size } => match self.registry.get_or_create(&id).await {
                Ok(session) => {
                    if let Err(e) = session.resize(size.cols, size.rows).await {
                        warn!(session_id = %id, error = %e, "resize dropped");
                    }
                }
                Err(e) => {
                    warn!(conn = conn_id, session_id = %id, error = %e, "resize failed");
                }
            },
            ClientIntent::Keepalive => {}
        }
    }
}
