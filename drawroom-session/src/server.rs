//! WebSocket session server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌── RoomRegistry ── RoomStore
//!            ├── connection task ──► SessionCoordinator
//! Client B ──┘   (select! loop)        ├── BroadcastChannel ──┐
//!                     ▲                └── SnapshotStore      │
//!                     │                       (RocksDB/memory)│
//!                     └────────── Subscription ◄──────────────┘
//! ```
//!
//! Each connection runs in its own task and owns at most one room
//! subscription at a time. Joining a different room leaves the previous one.
//! Inbound frames are decoded and handed to the coordinator; room events
//! coming back through the subscription are encoded and written out in the
//! order the room produced them.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::{ConnectionInfo, Subscription};
use crate::coordinator::{CoordinatorConfig, Dispatch, SessionCoordinator, DEFAULT_BROADCAST_CAPACITY};
use crate::error::{SessionError, WireError};
use crate::protocol::{ClientFrame, InboundEvent, RoomEvent, ServerFrame};
use crate::resync::DEFAULT_RESYNC_TIMEOUT;
use crate::room::{RoomId, RoomRegistry};
use crate::storage::{MemoryStore, RocksStore, StoreConfig};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum connections per room channel
    pub max_connections_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// How long a `request-canvas-state` waits for an answer
    pub resync_timeout: Duration,
    /// How often expired resync requests are swept
    pub sweep_interval: Duration,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_connections_per_room: 100,
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
            resync_timeout: DEFAULT_RESYNC_TIMEOUT,
            sweep_interval: Duration::from_secs(1),
            storage_path: None,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `DRAWROOM_BIND`, `DRAWROOM_STORAGE`,
    /// `DRAWROOM_BROADCAST_CAPACITY` and `DRAWROOM_RESYNC_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self, SessionError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, SessionError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(addr) = lookup("DRAWROOM_BIND") {
            config.bind_addr = addr;
        }
        if let Some(path) = lookup("DRAWROOM_STORAGE").filter(|p| !p.is_empty()) {
            config.storage_path = Some(PathBuf::from(path));
        }
        if let Some(raw) = lookup("DRAWROOM_BROADCAST_CAPACITY") {
            config.broadcast_capacity = parse_env("DRAWROOM_BROADCAST_CAPACITY", &raw)?;
            if config.broadcast_capacity == 0 {
                return Err(SessionError::validation(
                    "DRAWROOM_BROADCAST_CAPACITY must be greater than zero",
                ));
            }
        }
        if let Some(raw) = lookup("DRAWROOM_RESYNC_TIMEOUT_MS") {
            let ms: u64 = parse_env("DRAWROOM_RESYNC_TIMEOUT_MS", &raw)?;
            config.resync_timeout = Duration::from_millis(ms);
        }
        Ok(config)
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            broadcast_capacity: self.broadcast_capacity,
            resync_timeout: self.resync_timeout,
            max_connections_per_room: self.max_connections_per_room,
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, SessionError> {
    raw.trim()
        .parse()
        .map_err(|_| SessionError::validation(format!("{key}: cannot parse '{raw}'")))
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Frames that failed to decode
    pub rejected_frames: u64,
    pub active_rooms: usize,
}

/// The session server.
pub struct SessionServer {
    config: ServerConfig,
    coordinator: Arc<SessionCoordinator>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SessionServer {
    /// Build a server, opening RocksDB storage when `storage_path` is set.
    pub fn new(config: ServerConfig) -> Result<Self, SessionError> {
        let coordinator = match &config.storage_path {
            Some(path) => {
                let store = Arc::new(RocksStore::open(StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                })?);
                SessionCoordinator::new(
                    Arc::new(RoomRegistry::with_store(store.clone())),
                    store,
                    config.coordinator_config(),
                )
            }
            None => SessionCoordinator::new(
                Arc::new(RoomRegistry::new()),
                Arc::new(MemoryStore::new()),
                config.coordinator_config(),
            ),
        };
        Ok(Self::with_coordinator(config, Arc::new(coordinator)))
    }

    pub fn with_coordinator(config: ServerConfig, coordinator: Arc<SessionCoordinator>) -> Self {
        Self {
            config,
            coordinator,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// In-memory server with default configuration.
    pub fn with_defaults() -> Self {
        let config = ServerConfig::default();
        let coordinator = SessionCoordinator::new(
            Arc::new(RoomRegistry::new()),
            Arc::new(MemoryStore::new()),
            config.coordinator_config(),
        );
        Self::with_coordinator(config, Arc::new(coordinator))
    }

    /// Restore persisted rooms so reconnecting clients find them.
    pub async fn recover(&self) -> Result<usize, SessionError> {
        self.coordinator.registry().recover().await
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), SessionError> {
        let recovered = self.recover().await?;
        if recovered > 0 {
            log::info!("Recovered {recovered} rooms from persistent storage");
        }

        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|e| SessionError::Transport(format!("bind {}: {e}", self.config.bind_addr)))?;
        log::info!("Session server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), SessionError> {
        let sweeper = {
            let coordinator = self.coordinator.clone();
            let period = self.config.sweep_interval;
            AbortOnDrop(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    ticker.tick().await;
                    coordinator.sweep_resyncs().await;
                }
            }))
        };

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("Failed to accept connection: {e}");
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let coordinator = self.coordinator.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, coordinator, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });

            if sweeper.0.is_finished() {
                return Err(SessionError::Transport("resync sweeper stopped".into()));
            }
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        coordinator: Arc<SessionCoordinator>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), SessionError> {
        let ws_stream = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let mut connection = ConnectionInfo::anonymous();
        let mut subscription: Option<Subscription> = None;
        log::info!(
            "WebSocket connection {} established from {addr}",
            connection.connection_id
        );

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let welcome = ServerFrame::Welcome {
            connection_id: connection.connection_id,
        };
        let mut result = send_frame(&mut ws_sender, &welcome).await;

        while result.is_ok() {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += data.len() as u64;
                            }
                            match ClientFrame::decode(&data) {
                                Ok(frame) => {
                                    result = Self::dispatch(
                                        frame,
                                        &coordinator,
                                        &mut connection,
                                        &mut subscription,
                                        &mut ws_sender,
                                    )
                                    .await;
                                }
                                Err(e) => {
                                    stats.write().await.rejected_frames += 1;
                                    log::warn!("Failed to decode frame from {addr}: {e}");
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            result = ws_sender
                                .send(Message::Pong(data))
                                .await
                                .map_err(|e| SessionError::Transport(e.to_string()));
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                event = next_event(&mut subscription) => {
                    match event {
                        Some((room_id, event)) => {
                            result = send_frame(&mut ws_sender, &ServerFrame::Event { room_id, event }).await;
                        }
                        None => subscription = None,
                    }
                }
            }
        }

        if let Some(sub) = subscription.take() {
            let room_id = sub.room_id().to_string();
            drop(sub);
            coordinator.leave(&connection, &room_id).await;
        }

        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::debug!("Connection {} from {addr} cleaned up", connection.connection_id);
        result
    }

    async fn dispatch(
        frame: ClientFrame,
        coordinator: &SessionCoordinator,
        connection: &mut ConnectionInfo,
        subscription: &mut Option<Subscription>,
        ws_sender: &mut WsSink,
    ) -> Result<(), SessionError> {
        match frame {
            ClientFrame::Event(event) => {
                let name = event.name();
                let leaving = match &event {
                    InboundEvent::LeaveChannel { room_id } => Some(room_id.clone()),
                    _ => None,
                };
                // Identity the previous room knows this connection by
                let before = connection.clone();

                match coordinator.handle(connection, event).await {
                    Ok(Dispatch::Joined(sub)) => {
                        if let Some(previous) = subscription.replace(sub) {
                            let switched = subscription
                                .as_ref()
                                .is_some_and(|current| current.room_id() != previous.room_id());
                            if switched {
                                let room_id = previous.room_id().to_string();
                                drop(previous);
                                coordinator.leave(&before, &room_id).await;
                            }
                        }
                    }
                    Ok(Dispatch::Left { was_member }) => {
                        let current = subscription
                            .as_ref()
                            .is_some_and(|sub| leaving.as_deref() == Some(sub.room_id()));
                        if was_member && current {
                            *subscription = None;
                        }
                    }
                    Ok(Dispatch::Drawn(outcome)) => log::trace!("Canvas push: {outcome:?}"),
                    Ok(Dispatch::CanvasRequested { recipients }) => {
                        log::debug!("Canvas state requested from {recipients} connections")
                    }
                    Err(e) => log::debug!(
                        "Event {name} from {} rejected: {e}",
                        connection.connection_id
                    ),
                }
                Ok(())
            }

            ClientFrame::Request {
                request_id,
                request,
            } => {
                let name = request.name();
                let result = coordinator
                    .handle_request(Some(connection), request)
                    .await
                    .map_err(|e| {
                        log::debug!("Request {name} #{request_id} failed: {e}");
                        WireError::from(e)
                    });
                send_frame(ws_sender, &ServerFrame::Response { request_id, result }).await
            }

            ClientFrame::Ping => send_frame(ws_sender, &ServerFrame::Pong).await,
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.coordinator.channel().room_count().await;
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<SessionCoordinator> {
        &self.coordinator
    }
}

/// Stops the background sweeper when the accept loop goes away.
struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn send_frame(ws_sender: &mut WsSink, frame: &ServerFrame) -> Result<(), SessionError> {
    let encoded = frame.encode()?;
    ws_sender
        .send(Message::Binary(encoded.into()))
        .await
        .map_err(|e| SessionError::Transport(e.to_string()))
}

/// Next event on the current subscription; pends forever without one.
async fn next_event(subscription: &mut Option<Subscription>) -> Option<(RoomId, RoomEvent)> {
    match subscription {
        Some(sub) => {
            let event = sub.recv().await?;
            Some((sub.room_id().to_string(), event))
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_connections_per_room, 100);
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.resync_timeout, Duration::from_secs(5));
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_config_from_env_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("DRAWROOM_BIND", "0.0.0.0:8080"),
            ("DRAWROOM_STORAGE", "/var/lib/drawroom"),
            ("DRAWROOM_BROADCAST_CAPACITY", "512"),
            ("DRAWROOM_RESYNC_TIMEOUT_MS", "2500"),
        ]))
        .unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.storage_path, Some(PathBuf::from("/var/lib/drawroom")));
        assert_eq!(config.broadcast_capacity, 512);
        assert_eq!(config.resync_timeout, Duration::from_millis(2500));
    }

    #[test]
    fn test_config_from_env_empty_uses_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.bind_addr, ServerConfig::default().bind_addr);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_config_from_env_rejects_garbage() {
        let err = ServerConfig::from_lookup(lookup(&[("DRAWROOM_BROADCAST_CAPACITY", "lots")]))
            .unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)));

        let err = ServerConfig::from_lookup(lookup(&[("DRAWROOM_BROADCAST_CAPACITY", "0")]))
            .unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)));
    }

    #[test]
    fn test_coordinator_config_mapping() {
        let config = ServerConfig {
            broadcast_capacity: 32,
            resync_timeout: Duration::from_millis(100),
            max_connections_per_room: 7,
            ..ServerConfig::default()
        };
        let cc = config.coordinator_config();
        assert_eq!(cc.broadcast_capacity, 32);
        assert_eq!(cc.resync_timeout, Duration::from_millis(100));
        assert_eq!(cc.max_connections_per_room, 7);
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = SessionServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_rooms, 0);
    }

    #[tokio::test]
    async fn test_server_recovery_empty() {
        let server = SessionServer::with_defaults();
        assert_eq!(server.recover().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_server_with_storage_recovers_rooms() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage_path: Some(dir.path().join("db")),
            ..ServerConfig::default()
        };

        let room_id = {
            let server = SessionServer::new(config.clone()).unwrap();
            server
                .coordinator()
                .create_room(Some("alice"))
                .await
                .unwrap()
                .room_id
        };

        let server = SessionServer::new(config).unwrap();
        assert_eq!(server.recover().await.unwrap(), 1);
        let info = server.coordinator().session_info(&room_id).await.unwrap();
        assert_eq!(info.owner_id, "alice");
    }
}
