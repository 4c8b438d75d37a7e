// # Discord Presence Channel
//
// Presence channel implementation speaking Discord's local IPC protocol.
//
// ## Protocol
//
// 1. Open `discord-ipc-N` (unix socket or windows named pipe)
// 2. Handshake: opcode 0 `{"v": 1, "client_id": ...}`, answered by a
//    `READY` dispatch
// 3. Commands: opcode 1 `{"cmd": "SET_ACTIVITY", "args": {...}, "nonce": ...}`,
//    answered by a frame carrying the same nonce
// 4. Opcode 2 closes the connection (either side)
//
// ## Error Mapping
//
// | Fault                                   | PresenceError     |
// |-----------------------------------------|-------------------|
// | no endpoint accepts a connection        | `HostUnreachable` |
// | peer closed, EOF, broken pipe, reset    | `ChannelSevered`  |
// | bad frame or payload, timeout           | `ChannelSevered`  |
// | `ERROR` event                           | `Channel`         |
//
// A bad frame or a timeout leaves the stream mid-frame, so it is dropped.
// Only an `ERROR` event keeps the connection.
//
// The channel never retries; recovery belongs to the supervisor.

pub mod frame;
pub mod transport;

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, trace};

use tunecast_core::catalog::SourceDescriptor;
use tunecast_core::error::{PresenceError, PresenceResult};
use tunecast_core::traits::{Activity, PresenceChannel, PresenceChannelFactory};

use frame::{Opcode, read_frame, write_frame};
use transport::IpcStream;

/// Discord activity type rendered as "Listening to ..."
pub const ACTIVITY_TYPE_LISTENING: u8 = 2;

/// IPC protocol version sent in the handshake
pub const IPC_VERSION: u8 = 1;

/// Default time Discord has to answer a handshake or command
const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Faults on the IPC connection
#[derive(Error, Debug)]
pub enum IpcError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// Discord sent a close frame
    #[error("closed by Discord ({code}): {message}")]
    Closed { code: i64, message: String },

    /// Discord answered with an `ERROR` event
    #[error("Discord rejected the request: {0}")]
    Rejected(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("Discord is not running")]
    NotRunning,
}

impl From<IpcError> for PresenceError {
    fn from(err: IpcError) -> Self {
        match err {
            IpcError::NotRunning => PresenceError::HostUnreachable,
            IpcError::Closed { .. } => PresenceError::ChannelSevered,
            IpcError::Io(e) => match e.kind() {
                io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => {
                    PresenceError::HostUnreachable
                }
                io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::NotConnected
                | io::ErrorKind::UnexpectedEof => PresenceError::ChannelSevered,
                _ => PresenceError::channel(e.to_string()),
            },
            IpcError::Json(_) | IpcError::Protocol(_) | IpcError::Timeout(_) => {
                PresenceError::ChannelSevered
            }
            IpcError::Rejected(message) => PresenceError::channel(message),
        }
    }
}

/// JSON `activity` object for `SET_ACTIVITY`
///
/// Absent fields are omitted rather than sent as null.
pub fn activity_payload(activity: &Activity) -> Value {
    let mut payload = json!({
        "type": ACTIVITY_TYPE_LISTENING,
        "details": activity.details,
        "state": activity.state,
    });

    let mut assets = serde_json::Map::new();
    assets.insert("large_image".to_string(), json!(activity.large_image));
    if let Some(text) = &activity.large_text {
        assets.insert("large_text".to_string(), json!(text));
    }
    if let Some(image) = &activity.small_image {
        assets.insert("small_image".to_string(), json!(image));
    }
    if let Some(text) = &activity.small_text {
        assets.insert("small_text".to_string(), json!(text));
    }
    payload["assets"] = Value::Object(assets);

    let mut timestamps = serde_json::Map::new();
    if let Some(start) = activity.start_ms {
        timestamps.insert("start".to_string(), json!(start));
    }
    if let Some(end) = activity.end_ms {
        timestamps.insert("end".to_string(), json!(end));
    }
    if !timestamps.is_empty() {
        payload["timestamps"] = Value::Object(timestamps);
    }

    if !activity.buttons.is_empty() {
        payload["buttons"] = activity
            .buttons
            .iter()
            .map(|b| json!({ "label": b.label, "url": b.url }))
            .collect();
    }

    payload
}

/// One IPC connection bound to a source's Discord application
pub struct DiscordIpcChannel {
    source: &'static SourceDescriptor,
    client_id: String,
    endpoints: Vec<PathBuf>,
    response_timeout: Duration,
    stream: Option<Box<dyn IpcStream>>,
    nonce: u64,
}

impl DiscordIpcChannel {
    /// Create an unconnected channel
    ///
    /// # Parameters
    ///
    /// - `source`: the source whose activity slot this is
    /// - `client_id`: Discord application id
    /// - `endpoints`: IPC paths tried in order on connect
    pub fn new(
        source: &'static SourceDescriptor,
        client_id: impl Into<String>,
        endpoints: Vec<PathBuf>,
    ) -> Self {
        Self {
            source,
            client_id: client_id.into(),
            endpoints,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            stream: None,
            nonce: 0,
        }
    }

    /// Override how long Discord has to answer
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn open(&self) -> Result<Box<dyn IpcStream>, IpcError> {
        for path in &self.endpoints {
            match transport::open(path).await {
                Ok(stream) => {
                    debug!("Opened Discord IPC at {}", path.display());
                    return Ok(stream);
                }
                Err(e) => trace!("No Discord IPC at {}: {}", path.display(), e),
            }
        }
        Err(IpcError::NotRunning)
    }

    async fn handshake(&self, stream: &mut dyn IpcStream) -> Result<(), IpcError> {
        let hello = json!({ "v": IPC_VERSION, "client_id": self.client_id });
        write_frame(stream, Opcode::Handshake, &hello).await?;

        tokio::time::timeout(self.response_timeout, await_ready(stream))
            .await
            .map_err(|_| IpcError::Timeout(self.response_timeout))?
    }

    /// Send `SET_ACTIVITY` and wait for the matching response
    async fn set_activity(&mut self, activity: Option<&Activity>) -> Result<(), IpcError> {
        self.nonce += 1;
        let nonce = format!("{}-{}", self.source.key, self.nonce);

        let mut args = json!({ "pid": std::process::id() });
        if let Some(activity) = activity {
            args["activity"] = activity_payload(activity);
        }
        let command = json!({ "cmd": "SET_ACTIVITY", "args": args, "nonce": nonce });

        let timeout = self.response_timeout;
        let stream = self
            .stream
            .as_deref_mut()
            .ok_or_else(|| IpcError::Io(io::ErrorKind::NotConnected.into()))?;

        write_frame(stream, Opcode::Frame, &command).await?;

        tokio::time::timeout(timeout, await_response(stream, &nonce))
            .await
            .map_err(|_| IpcError::Timeout(timeout))?
    }

    /// Map an error and drop the stream unless Discord merely refused the request
    fn fail(&mut self, err: IpcError) -> PresenceError {
        if !matches!(err, IpcError::Rejected(_)) {
            self.stream = None;
        }
        PresenceError::from(err)
    }
}

#[async_trait]
impl PresenceChannel for DiscordIpcChannel {
    async fn connect(&mut self) -> PresenceResult<()> {
        self.stream = None;

        let mut stream = self.open().await?;
        self.handshake(stream.as_mut()).await?;

        self.stream = Some(stream);
        info!("Connected to Discord as {}", self.source.display_name);
        Ok(())
    }

    async fn update(&mut self, activity: &Activity) -> PresenceResult<()> {
        match self.set_activity(Some(activity)).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn clear(&mut self) -> PresenceResult<()> {
        match self.set_activity(None).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn close(&mut self) -> PresenceResult<()> {
        if let Some(mut stream) = self.stream.take() {
            // Best effort: the peer may already be gone.
            if let Err(e) = write_frame(stream.as_mut(), Opcode::Close, &json!({})).await {
                trace!("Close frame not delivered: {}", e);
            }
            debug!("Closed Discord IPC for {}", self.source.display_name);
        }
        Ok(())
    }
}

impl std::fmt::Debug for DiscordIpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordIpcChannel")
            .field("source", &self.source.key)
            .field("client_id", &self.client_id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

async fn await_ready(stream: &mut dyn IpcStream) -> Result<(), IpcError> {
    loop {
        let (op, payload) = read_frame(stream).await?;
        match op {
            Opcode::Frame if payload["evt"] == "READY" => return Ok(()),
            Opcode::Frame if payload["evt"] == "ERROR" => {
                return Err(IpcError::Rejected(error_message(&payload)));
            }
            // An invalid application id is answered with a close frame.
            Opcode::Close => return Err(IpcError::Rejected(error_message(&payload))),
            Opcode::Ping => write_frame(stream, Opcode::Pong, &payload).await?,
            _ => {}
        }
    }
}

async fn await_response(stream: &mut dyn IpcStream, nonce: &str) -> Result<(), IpcError> {
    loop {
        let (op, payload) = read_frame(stream).await?;
        match op {
            Opcode::Frame if payload["nonce"] == nonce => {
                if payload["evt"] == "ERROR" {
                    return Err(IpcError::Rejected(error_message(&payload)));
                }
                return Ok(());
            }
            Opcode::Close => {
                return Err(IpcError::Closed {
                    code: payload["code"].as_i64().unwrap_or_default(),
                    message: error_message(&payload),
                });
            }
            Opcode::Ping => write_frame(stream, Opcode::Pong, &payload).await?,
            _ => {}
        }
    }
}

fn error_message(payload: &Value) -> String {
    payload["data"]["message"]
        .as_str()
        .or_else(|| payload["message"].as_str())
        .unwrap_or("no message")
        .to_string()
}

/// Factory for Discord IPC channels
#[derive(Debug, Clone)]
pub struct DiscordIpcFactory {
    endpoints: Option<Vec<PathBuf>>,
    response_timeout: Duration,
}

impl Default for DiscordIpcFactory {
    fn default() -> Self {
        Self {
            endpoints: None,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

impl DiscordIpcFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect only to `path` instead of discovering Discord's endpoints
    pub fn with_endpoint(mut self, path: impl Into<PathBuf>) -> Self {
        self.endpoints = Some(vec![path.into()]);
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }
}

impl PresenceChannelFactory for DiscordIpcFactory {
    fn create(
        &self,
        source: &'static SourceDescriptor,
        client_id: &str,
    ) -> PresenceResult<Box<dyn PresenceChannel>> {
        if client_id.trim().is_empty() {
            return Err(PresenceError::channel(format!(
                "no Discord application id for {}",
                source.display_name
            )));
        }

        let endpoints = self
            .endpoints
            .clone()
            .unwrap_or_else(transport::candidate_paths);

        let channel = DiscordIpcChannel::new(source, client_id, endpoints)
            .with_response_timeout(self.response_timeout);
        Ok(Box::new(channel))
    }
}
