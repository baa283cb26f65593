//! WebSocket front end for the broker.
//!
//! Each accepted socket becomes one logical broker connection:
//! 1. Optional bearer-token check during the handshake.
//! 2. Register with the broker and receive the connection's outbound queue.
//! 3. Forward queued messages to the socket; decode client requests from it.
//! 4. On close or error, deregister from every channel.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use pulse_core::{Action, ClientRequest};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, error, info, warn};

use crate::actor::BrokerHandle;

/// Accept connections until `shutdown` flips to `true`.
pub async fn serve(
    listener: TcpListener,
    broker: BrokerHandle,
    auth_token: Option<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    match listener.local_addr() {
        Ok(addr) => info!("[broker-ws] listening on {addr}"),
        Err(e) => warn!("[broker-ws] listening (local addr unavailable: {e})"),
    }

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("[broker-ws] shutdown requested");
                return;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        error!("[broker-ws] accept failed: {e}");
                        continue;
                    }
                };
                let broker = broker.clone();
                let token = auth_token.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, broker, token, shutdown).await {
                        warn!("[broker-ws] {peer}: {e}");
                    }
                });
            }
        }
    }
}

/// Check `Authorization: Bearer <token>` against the configured token.
fn authorize(expected: Option<&str>, req: &Request) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    req.headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == expected)
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    broker: BrokerHandle,
    auth_token: Option<String>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let check = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        if authorize(auth_token.as_deref(), req) {
            Ok(resp)
        } else {
            let mut denied = ErrorResponse::new(Some("missing or invalid bearer token".into()));
            *denied.status_mut() = StatusCode::UNAUTHORIZED;
            Err(denied)
        }
    };
    let ws = tokio_tungstenite::accept_hdr_async(stream, check).await?;
    let (id, mut outbound) = broker.connect().await?;
    info!("[broker-ws] {peer} connected as conn-{id}");

    let (mut ws_write, mut ws_read) = ws.split();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = ws_write.close().await;
                break;
            }

            // Broker → client
            msg = outbound.recv() => {
                let Some(msg) = msg else { break };
                if let Err(e) = ws_write.send(Message::Text(msg.to_json().into())).await {
                    debug!("[broker-ws] conn-{id} send failed: {e}");
                    break;
                }
            }

            // Client → broker
            frame = ws_read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => match ClientRequest::decode(&text) {
                        Ok(req) => {
                            // Rejections are already queued to the client as `error` frames.
                            let result = match req.action {
                                Action::Subscribe => broker.subscribe(id, &req.channel).await.map(|_| ()),
                                Action::Unsubscribe => broker.unsubscribe(id, &req.channel).await,
                            };
                            if let Err(e) = result {
                                debug!("[broker-ws] conn-{id} {} {}: {e}", req.action, req.channel);
                            }
                        }
                        Err(e) => {
                            warn!("[broker-ws] conn-{id} malformed request: {e}");
                            broker.send_error(id, e.to_string()).await;
                        }
                    },
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!("[broker-ws] conn-{id} read error: {e}");
                        break;
                    }
                    _ => {} // Binary, Pong, Frame — ignore
                }
            }
        }
    }

    broker.disconnect(id).await;
    info!("[broker-ws] conn-{id} closed");
    Ok(())
}
