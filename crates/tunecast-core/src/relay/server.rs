// # Relay Server
//
// WebSocket listener feeding the shared `RelayState`.
//
// Each accepted connection runs on its own task (spawned by the websocket
// upgrade) with a blocking receive loop. The server and every connection
// stop when the cancellation token fires.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::RelayState;
use crate::config::RelayConfig;
use crate::error::{Error, Result};

type TextFrames = Pin<Box<dyn Stream<Item = std::result::Result<String, axum::Error>> + Send>>;

#[derive(Clone)]
struct ServerState {
    relay: Arc<RelayState>,
    cancel: CancellationToken,
}

/// Bound relay listener
pub struct RelayServer {
    listener: TcpListener,
    relay: Arc<RelayState>,
}

impl RelayServer {
    /// Bind the listener described by `config`
    pub async fn bind(config: &RelayConfig, relay: Arc<RelayState>) -> Result<Self> {
        let listener = TcpListener::bind(config.address())
            .await
            .map_err(|e| Error::relay(format!("failed to bind {}: {}", config.address(), e)))?;

        Ok(Self { listener, relay })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        let state = ServerState {
            relay: self.relay,
            cancel: cancel.clone(),
        };

        let app = Router::new()
            .route("/", get(upgrade))
            .with_state(state);

        info!("Relay listening on ws://{}", addr);

        axum::serve(self.listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;

        info!("Relay stopped");
        Ok(())
    }
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<ServerState>) -> Response {
    ws.on_upgrade(move |socket| async move {
        state
            .relay
            .serve_connection(text_frames(socket), state.cancel.clone())
            .await;
    })
}

/// Text payloads of a websocket; control frames are skipped
fn text_frames(socket: WebSocket) -> TextFrames {
    Box::pin(socket.filter_map(|message| match message {
        Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
        // Invalid UTF-8 then fails JSON decoding, which keeps the connection open.
        Ok(Message::Binary(bytes)) => Some(Ok(String::from_utf8_lossy(&bytes).into_owned())),
        Ok(Message::Ping(_) | Message::Pong(_) | Message::Close(_)) => None,
        Err(e) => Some(Err(e)),
    }))
}
