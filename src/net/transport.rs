//! WebSocket transport
//!
//! Clients connect to `/ws/game/{lobby_id}` with a `token` (query parameter or
//! `Authorization: Bearer` header) and, for private lobbies, a `code`. The
//! handshake is refused for unknown paths or bad tokens; join refusals close
//! the upgraded socket with the reason before any engine sees the client.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::accept_hdr_async;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::Authenticator;
use crate::lobby::LobbyManager;
use crate::net::engine::ClientSink;

const GAME_PATH_PREFIX: &str = "/ws/game/";

/// What the handshake carried
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub lobby_id: Uuid,
    pub token: Option<String>,
    pub code: Option<String>,
}

/// Client admitted by the handshake
struct Admission {
    lobby_id: Uuid,
    user_id: String,
    code: Option<String>,
}

/// Outbound half of a socket, fed through the writer task
struct WebSocketSink {
    tx: mpsc::UnboundedSender<Message>,
}

impl ClientSink for WebSocketSink {
    fn send(&self, frame: String) {
        // Writer gone means the socket is closing
        let _ = self.tx.send(Message::Text(frame));
    }

    fn close(&self, reason: &str) {
        let _ = self.tx.send(close_message(CloseCode::Normal, reason));
    }
}

fn close_message(code: CloseCode, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }))
}

/// Accept connections until the listener fails
pub async fn serve(
    listener: TcpListener,
    manager: Arc<LobbyManager>,
    authenticator: Arc<dyn Authenticator>,
) -> anyhow::Result<()> {
    info!(
        "WebSocket server listening on ws://{}{}{{lobby_id}}",
        listener.local_addr()?,
        GAME_PATH_PREFIX
    );

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                continue;
            }
        };

        let manager = Arc::clone(&manager);
        let authenticator = Arc::clone(&authenticator);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, manager, authenticator).await {
                debug!("Connection {} ended with error: {}", peer, e);
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    manager: Arc<LobbyManager>,
    authenticator: Arc<dyn Authenticator>,
) -> Result<(), WsError> {
    let mut admission = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let Some(connect) = parse_connect_request(request) else {
            return Err(reject(StatusCode::NOT_FOUND, "Unknown path"));
        };
        match authenticator.authenticate(connect.token.as_deref().unwrap_or_default()) {
            Ok(user_id) => {
                admission = Some(Admission {
                    lobby_id: connect.lobby_id,
                    user_id,
                    code: connect.code,
                });
                Ok(response)
            }
            Err(e) => Err(reject(StatusCode::UNAUTHORIZED, &e.to_string())),
        }
    };

    let handshake = accept_hdr_async(stream, callback).await;
    let ws_stream = match handshake {
        Ok(ws_stream) => ws_stream,
        Err(e) => {
            debug!("Handshake with {} refused: {}", peer, e);
            return Ok(());
        }
    };
    let Some(Admission { lobby_id, user_id, code }) = admission else {
        return Ok(());
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sink = Arc::new(WebSocketSink { tx });

    let network = match manager.connect_client(lobby_id, &user_id, code.as_deref(), sink) {
        Ok(network) => network,
        Err(e) => {
            info!(lobby = %lobby_id, user = %user_id, "Connection from {} refused: {}", peer, e);
            ws_sender.send(close_message(CloseCode::Policy, &e.to_string())).await?;
            return Ok(());
        }
    };
    info!(lobby = %lobby_id, user = %user_id, "Client connected from {}", peer);

    // Ends once the engine drops the sink or a close frame went out
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if ws_sender.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    while let Some(message) = ws_receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if let Err(e) = network.receive_message(&user_id, &text) {
                    debug!(lobby = %lobby_id, user = %user_id, "Dropping malformed frame: {}", e);
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(lobby = %lobby_id, user = %user_id, "WebSocket error: {}", e);
                break;
            }
        }
    }

    // No-op if the lobby already shut down and dropped us
    network.unregister_client(&user_id);
    info!(lobby = %lobby_id, user = %user_id, "Client disconnected");
    Ok(())
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// Pull lobby id, token and join code out of an upgrade request
pub fn parse_connect_request(request: &Request) -> Option<ConnectRequest> {
    let lobby_id = parse_lobby_path(request.uri().path())?;
    let query = request.uri().query().unwrap_or_default();

    let token = query_param(query, "token").or_else(|| {
        request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(bearer_token)
    });

    Some(ConnectRequest {
        lobby_id,
        token,
        code: query_param(query, "code"),
    })
}

/// `/ws/game/{id}` -> id
pub fn parse_lobby_path(path: &str) -> Option<Uuid> {
    path.strip_prefix(GAME_PATH_PREFIX)?
        .trim_end_matches('/')
        .parse()
        .ok()
}

// Tokens and join codes are URL-safe, so values are taken verbatim
fn query_param(query: &str, name: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

fn bearer_token(header: &str) -> Option<String> {
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}
