//! Core server: accepts WebSocket connections and runs one message loop per
//! connection against the shared hub.

use crate::config::ServerConfig;
use crate::geo::GeoResolver;
use crate::hub::Hub;
use crate::journal::{Journal, JsonlJournal, NullJournal};
use crate::matching::{CloseReason, DisconnectReason, Outbound};
use crate::transport::websocket::{self, WebSocketConnection};
use duet_core::{decode_text, encode_text, ClientMessage, ConnId, DuetResult, ServerMessage};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, warn};

/// Per-connection outbound buffer. A client that falls this far behind
/// starts losing signaling frames.
const OUTBOUND_CAPACITY: usize = 256;

/// Interval of the housekeeping task.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// How long connection tasks get to send their close frames on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The duet server instance.
pub struct DuetServer {
    config: ServerConfig,
    hub: Hub,
    /// Broadcast sender for server shutdown notification.
    shutdown_tx: broadcast::Sender<()>,
}

impl DuetServer {
    /// Create a new server instance. Must be called within a tokio runtime.
    pub fn new(config: ServerConfig) -> Self {
        let journal: Arc<dyn Journal> = match &config.journal_path {
            Some(path) => {
                info!(path = %path.display(), "journal enabled");
                Arc::new(JsonlJournal::spawn(path.clone()))
            }
            None => Arc::new(NullJournal),
        };

        let geo = GeoResolver::new(
            config.geo_endpoint.clone(),
            Duration::from_millis(config.geo_timeout_ms),
        );
        if !geo.is_enabled() {
            info!("geolocation disabled");
        }

        let hub = Hub::new(&config.match_settings(), journal, geo);

        Self {
            config,
            hub,
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    /// Bind the listener and serve until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> DuetResult<()>
    where
        F: Future<Output = ()>,
    {
        let bind_addr = SocketAddr::new(self.config.bind, self.config.port);
        let (local_addr, ws_rx) = websocket::start_listener(bind_addr).await?;
        self.serve(local_addr, ws_rx, shutdown).await
    }

    /// Accept connections from `ws_rx` until `shutdown` resolves or the
    /// listener goes away, then close every client socket.
    async fn serve<F>(
        self,
        local_addr: SocketAddr,
        mut ws_rx: mpsc::Receiver<WebSocketConnection>,
        shutdown: F,
    ) -> DuetResult<()>
    where
        F: Future<Output = ()>,
    {
        let server = Arc::new(self);

        // Housekeeping: drop lapsed report tallies, log counters
        let maint_hub = server.hub.clone();
        let maintenance = tokio::spawn(async move {
            let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
            loop {
                interval.tick().await;
                let stats = maint_hub.maintain().await;
                debug!(
                    connections = stats.connections,
                    queued = stats.queued,
                    sessions = stats.sessions,
                    reported = stats.reported,
                    "matchmaker stats"
                );
            }
        });

        info!(
            addr = %local_addr,
            idle_timeout = server.config.idle_timeout,
            report_threshold = server.config.report_threshold,
            "duet-server ready"
        );

        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }

                accepted = ws_rx.recv() => {
                    let Some(ws_conn) = accepted else {
                        info!("listener closed");
                        break;
                    };
                    // Subscribed before spawning so no task can miss the broadcast.
                    let shutdown_rx = server.shutdown_tx.subscribe();
                    let srv = server.clone();
                    connections.spawn(async move {
                        if let Err(e) = srv.handle_websocket(ws_conn, shutdown_rx).await {
                            warn!(error = %e, "WebSocket connection error");
                        }
                    });
                }

                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(ws_rx);
        maintenance.abort();

        info!(open = connections.len(), "notifying connected clients");
        let _ = server.shutdown_tx.send(());
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = connections.len(), "connections still open after grace period");
            connections.shutdown().await;
        }

        Ok(())
    }

    /// Register a connection with the hub and run its message loop.
    async fn handle_websocket(
        &self,
        mut conn: WebSocketConnection,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> DuetResult<()> {
        let remote = conn.remote_addr;

        if self.hub.connection_count().await >= self.config.max_connections {
            warn!(remote = %remote, max = self.config.max_connections, "rejecting connection, server full");
            let reason = CloseReason::ServerFull.to_string();
            return websocket::ws_close(&mut conn.ws_stream, CloseCode::Again, &reason).await;
        }

        let id = ConnId::random();
        let (tx, rx) = mpsc::channel::<Outbound>(OUTBOUND_CAPACITY);
        if let Err(e) = self.hub.connect(id.clone(), tx, Some(remote)).await {
            let _ = websocket::ws_close(&mut conn.ws_stream, CloseCode::Error, "connect rejected").await;
            return Err(e);
        }
        info!(conn = %id, remote = %remote, "client connected");

        let result = self.connection_loop(&mut conn, &id, rx, shutdown_rx).await;

        // Idempotent: a forced close already removed the record.
        self.hub.disconnect(&id, DisconnectReason::ClientClosed).await;
        result
    }

    async fn connection_loop(
        &self,
        conn: &mut WebSocketConnection,
        id: &ConnId,
        mut rx: mpsc::Receiver<Outbound>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> DuetResult<()> {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(conn = %id, "shutdown signal received, closing client");
                    let reason = CloseReason::Shutdown.to_string();
                    let _ = websocket::ws_close(&mut conn.ws_stream, CloseCode::Away, &reason).await;
                    break;
                }

                outbound = rx.recv() => {
                    match outbound {
                        Some(Outbound::Message(msg)) => {
                            websocket::ws_send_text(&mut conn.ws_stream, encode_text(&msg)?).await?;
                        }
                        Some(Outbound::Close(reason)) => {
                            info!(conn = %id, %reason, "closing connection");
                            let _ = websocket::ws_close(&mut conn.ws_stream, CloseCode::Policy, &reason.to_string()).await;
                            break;
                        }
                        None => {
                            // Record removed by the hub without a close notice.
                            let _ = websocket::ws_close(&mut conn.ws_stream, CloseCode::Normal, "").await;
                            break;
                        }
                    }
                }

                ws_result = websocket::ws_recv_text(&mut conn.ws_stream) => {
                    match ws_result {
                        Ok(Some(text)) => match decode_text::<ClientMessage>(&text) {
                            Ok(msg) => {
                                debug!(conn = %id, ?msg, "client message");
                                self.hub.dispatch(id, msg).await;
                            }
                            Err(e) => {
                                debug!(conn = %id, error = %e, "malformed client frame");
                                let reply = ServerMessage::Error { message: e.to_string() };
                                websocket::ws_send_text(&mut conn.ws_stream, encode_text(&reply)?).await?;
                            }
                        },
                        Ok(None) => {
                            debug!(conn = %id, "WebSocket session ended (peer closed)");
                            break;
                        }
                        Err(e) => {
                            debug!(conn = %id, error = %e, "WebSocket session ended");
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }
}
