use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::Response;
use tracing::{debug, info};

use super::ServerState;
use crate::connection::tx::ConnectionTx;
use crate::connection::Connection;

/// WebSocket upgrade handler. The connection's trust domain is the host
/// part of the page's `Origin` header; non-browser clients without one
/// get an empty domain, which no trust list contains.
pub async fn ws_upgrade(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let domain = origin_domain(&headers);
    ws.on_upgrade(move |socket| handle_socket(socket, state, domain))
}

/// Extract the bare host from an `Origin` header value, dropping the
/// scheme and any port.
fn origin_domain(headers: &HeaderMap) -> String {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let without_scheme = origin
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(origin);
    let host = without_scheme.split('/').next().unwrap_or_default();
    host.rsplit_once(':')
        .map(|(host, port)| {
            if port.chars().all(|c| c.is_ascii_digit()) {
                host
            } else {
                // Not a port suffix (e.g. bare IPv6); keep as-is.
                without_scheme
            }
        })
        .unwrap_or(host)
        .to_lowercase()
}

/// Drive one WebSocket until it closes: outbound frames from the
/// connection's channel are serialized onto the socket, inbound text
/// frames are parsed and dispatched, and teardown runs unconditionally
/// afterwards.
async fn handle_socket(mut socket: WebSocket, state: Arc<ServerState>, domain: String) {
    state.connection_opened();
    let (tx, mut rx) = ConnectionTx::channel();
    let conn = Connection::new(state.core.clone(), domain.clone(), tx);
    info!(conn = conn.conn_id(), domain = %domain, "page connected");

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(frame) => {
                        let json = match serde_json::to_string(&frame) {
                            Ok(json) => json,
                            Err(e) => {
                                debug!(error = %e, "failed to serialize outbound frame");
                                continue;
                            }
                        };
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => conn.handle_frame(&text).await,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(conn = conn.conn_id(), error = %e, "socket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!(conn = conn.conn_id(), domain = %domain, "page disconnected");
    conn.cleanup().await;
    state.connection_closed();
}
