//! Connection Manager (§4.E): accepts duplex client connections, assigns
//! ids, and spawns the reader/writer task pair the spec calls for —
//! "avoiding shared mutable socket state" by splitting the WebSocket stream
//! and giving each half its own task, communicating only through the
//! session's outbound channel.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::connection::session::ClientSession;
use crate::hub::Hub;
use crate::protocol::{ClientMessage, ServerMessage, WireViewport};

const INSTANCE_ID_ENV: &str = "MARKERHUBD_INSTANCE_ID";
/// Violations-per-window threshold from §7: "do not disconnect unless
/// violations exceed a threshold (default 10 in 60s)".
const VIOLATION_THRESHOLD: u32 = 10;
const VIOLATION_WINDOW: std::time::Duration = std::time::Duration::from_secs(60);

pub struct ConnectionManager {
    hub: Arc<Hub>,
    instance_id: String,
}

impl ConnectionManager {
    pub fn new(hub: Arc<Hub>) -> Self {
        let instance_id = std::env::var(INSTANCE_ID_ENV).unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());
        ConnectionManager { hub, instance_id }
    }

    /// Binds `listen_port` and accepts connections until `shutdown` fires.
    pub async fn run(&self, listen_port: u16, mut shutdown: tokio::sync::watch::Receiver<bool>) -> crate::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", listen_port)).await?;
        info!("{:15.15}[>] {:20} listening on :{}", "manager", "bind", listen_port);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("{:15.15}[<] {:20} connection manager stopping", "manager", "shutdown");
                        return Ok(());
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let hub = Arc::clone(&self.hub);
                            let instance_id = self.instance_id.clone();
                            let conn_shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(hub, instance_id, stream, addr, conn_shutdown).await {
                                    debug!("{:15.15}[x] {:20} connection from {} ended: {}", "manager", "conn-error", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("{:15.15}[x] {:20} accept failed: {}", "manager", "accept-fail", e);
                        }
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    hub: Arc<Hub>,
    instance_id: String,
    stream: TcpStream,
    addr: std::net::SocketAddr,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sink, mut ws_stream) = ws_stream.split();

    let client_id = uuid::Uuid::new_v4().to_string();
    let (tx, rx) = flume::bounded::<ServerMessage>(hub.config.outbound_queue_cap);
    let session = Arc::new(ClientSession::new(client_id.clone(), addr, tx.clone()));
    let key = hub.register_session(Arc::clone(&session));

    info!(
        "{:15.15}[>] {:20} client_id={} addr={}",
        "manager", "connected", client_id, addr
    );

    let _ = tx.try_send(ServerMessage::ConnectionEstablished {
        client_id: client_id.clone(),
        instance_id,
    });

    let writer_session = Arc::clone(&session);
    let mut writer_shutdown = shutdown.clone();
    let writer = tokio::spawn(async move {
        let mut rx = rx.into_stream();
        loop {
            tokio::select! {
                biased;
                _ = writer_shutdown.changed() => {
                    if *writer_shutdown.borrow() {
                        break;
                    }
                }
                next = rx.next() => {
                    let Some(msg) = next else { break };
                    let Ok(text) = serde_json::to_string(&msg) else {
                        continue;
                    };
                    if ws_sink.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
            }
        }
        // Always send a normal close frame on the way out, per the
        // shutdown requirement that connections close with one rather
        // than just dropping the socket.
        let _ = ws_sink.send(WsMessage::Close(None)).await;
        let _ = ws_sink.close().await;
        drop(writer_session);
    });

    let idle_timeout = hub.config.idle_timeout;
    let reader_hub = Arc::clone(&hub);
    let reader_session = Arc::clone(&session);
    let shutdown_check = shutdown.clone();
    let mut reader_shutdown = shutdown;
    let reader = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = reader_shutdown.changed() => {
                    if *reader_shutdown.borrow() {
                        debug!(
                            "{:15.15}[<] {:20} client_id={} closing for shutdown",
                            "manager", "shutdown", reader_session.client_id
                        );
                        return;
                    }
                }
                next = tokio::time::timeout(idle_timeout, ws_stream.next()) => {
                    let frame = match next {
                        Ok(Some(Ok(frame))) => frame,
                        Ok(Some(Err(_))) | Ok(None) => return,
                        Err(_elapsed) => {
                            debug!(
                                "{:15.15}[x] {:20} client_id={} idle timeout",
                                "manager", "idle-timeout", reader_session.client_id
                            );
                            return;
                        }
                    };

                    let text = match frame {
                        WsMessage::Text(t) => t.to_string(),
                        WsMessage::Close(_) => return,
                        _ => {
                            reader_session.touch_activity();
                            continue;
                        }
                    };
                    reader_session.touch_activity();

                    if dispatch_message(&reader_hub, &reader_session, &text).should_disconnect() {
                        return;
                    }
                }
            }
        }
    });

    session.attach_tasks(reader.abort_handle(), writer.abort_handle());

    let _ = reader.await;
    if *shutdown_check.borrow() {
        // Give the writer a chance to notice shutdown on its own and send
        // its close frame before falling back to a hard abort.
        if tokio::time::timeout(std::time::Duration::from_millis(500), &mut writer)
            .await
            .is_err()
        {
            writer.abort();
        }
    } else {
        writer.abort();
    }
    let _ = hub.remove_session(key);
    info!(
        "{:15.15}[<] {:20} client_id={} addr={}",
        "manager", "disconnected", client_id, addr
    );
    Ok(())
}

/// Whether a dispatched message should end the connection, per §7's
/// "do not disconnect unless violations exceed a threshold".
enum Outcome {
    Continue,
    Disconnect,
}

impl Outcome {
    fn should_disconnect(&self) -> bool {
        matches!(self, Outcome::Disconnect)
    }

    fn from_violation_threshold_exceeded(exceeded: bool) -> Self {
        if exceeded {
            Outcome::Disconnect
        } else {
            Outcome::Continue
        }
    }
}

/// Parses one inbound frame and dispatches to the Viewport Tracker (§4.F).
/// Unknown message types are ignored on ingress per §4.I; malformed JSON or
/// an invalid viewport counts as a protocol violation (§7) that disconnects
/// the session once the rolling-window threshold is exceeded.
fn dispatch_message(hub: &Hub, session: &Arc<ClientSession>, text: &str) -> Outcome {
    let parsed: Result<ClientMessage, _> = serde_json::from_str(text);
    let msg = match parsed {
        Ok(msg) => msg,
        Err(e) => {
            let err = crate::Error::Protocol {
                client_id: session.client_id.clone(),
                reason: format!("malformed message: {}", e),
            };
            warn!("{:15.15}[x] {:20} {}", "manager", "protocol-violation", err);
            let _ = session.outbound.try_send(ServerMessage::Error {
                reason: "malformed message".to_string(),
            });
            let exceeded = session.record_violation(VIOLATION_WINDOW, VIOLATION_THRESHOLD);
            if exceeded {
                let _ = session.outbound.try_send(ServerMessage::Error {
                    reason: "too many protocol violations".to_string(),
                });
            }
            return Outcome::from_violation_threshold_exceeded(exceeded);
        }
    };

    match msg {
        ClientMessage::ViewportUpdate { viewport } => {
            if let Err(e) = handle_viewport_update(hub, session, viewport) {
                let err = crate::Error::Protocol {
                    client_id: session.client_id.clone(),
                    reason: format!("invalid viewport: {}", e),
                };
                warn!("{:15.15}[x] {:20} {}", "manager", "protocol-violation", err);
                let _ = session.outbound.try_send(ServerMessage::Error {
                    reason: e.to_string(),
                });
                let exceeded = session.record_violation(VIOLATION_WINDOW, VIOLATION_THRESHOLD);
                return Outcome::from_violation_threshold_exceeded(exceeded);
            }
        }
        ClientMessage::Ping => {
            // Activity already recorded on frame receipt; no response required.
        }
        ClientMessage::Unknown => {}
    }
    Outcome::Continue
}

fn handle_viewport_update(
    hub: &Hub,
    session: &Arc<ClientSession>,
    viewport: WireViewport,
) -> Result<(), crate::model::ViewportError> {
    session.handle_viewport_update(viewport, |bbox| hub.search_viewport(bbox))
}
