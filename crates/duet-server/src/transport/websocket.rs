//! WebSocket listener using tokio-tungstenite.
//!
//! Signaling frames are JSON text messages. Binary frames are not part of
//! the protocol and are ignored.

use duet_core::{DuetError, DuetResult, MAX_FRAME_SIZE};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Pause after a failed `accept` before retrying.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
}

/// Start the WebSocket listener.
///
/// Returns the bound address and a receiver that yields accepted
/// connections. The accept loop ends once the receiver is dropped.
pub async fn start_listener(
    bind_addr: SocketAddr,
) -> DuetResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| DuetError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = tx.closed() => {
                    debug!(addr = %local_addr, "WebSocket listener stopped");
                    break;
                }
                accepted = tcp_listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    // Usually fd exhaustion.
                    error!(error = %e, "TCP accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    });

    Ok((local_addr, rx))
}

/// Send a text frame.
pub async fn ws_send_text(
    ws: &mut tokio_tungstenite::WebSocketStream<TcpStream>,
    text: String,
) -> DuetResult<()> {
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| DuetError::Transport(format!("WS send failed: {e}")))
}

/// Send a close frame with a human-readable reason.
pub async fn ws_close(
    ws: &mut tokio_tungstenite::WebSocketStream<TcpStream>,
    code: CloseCode,
    reason: &str,
) -> DuetResult<()> {
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    ws.send(Message::Close(Some(frame)))
        .await
        .map_err(|e| DuetError::Transport(format!("WS close failed: {e}")))
}

/// Receive the next text frame.
///
/// Returns `None` if the connection is closed. Rejects frames larger than
/// [`MAX_FRAME_SIZE`].
pub async fn ws_recv_text(
    ws: &mut tokio_tungstenite::WebSocketStream<TcpStream>,
) -> DuetResult<Option<String>> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                if text.len() > MAX_FRAME_SIZE {
                    return Err(DuetError::InvalidMessage(format!(
                        "WS frame too large: {} bytes (max {})",
                        text.len(),
                        MAX_FRAME_SIZE
                    )));
                }
                return Ok(Some(text.as_str().to_string()));
            }
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(Message::Ping(payload))) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            Some(Ok(_)) => {
                // Binary, pong and raw frames carry nothing for us
                continue;
            }
            Some(Err(e)) => {
                return Err(DuetError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        }
    }
}
