//! WebSocket client for the session server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Request/response calls correlated by request id, with a timeout
//! - Fire-and-forget room events (join/leave channel, canvas pushes)
//! - A stream of [`ClientEvent`]s for the application

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::coordinator::{JoinIdentity, RoomCreated};
use crate::error::{SessionError, WireError};
use crate::protocol::{
    CanvasFrame, ClientFrame, InboundEvent, ProtocolError, Request, Response, RoomEvent, ServerFrame,
};
use crate::room::{ParticipantId, RoomId, SessionInfo};
use crate::storage::{CanvasSnapshot, SnapshotRecord};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The server greeted us
    Connected { connection_id: Uuid },
    /// Something happened in the subscribed room
    Room { room_id: RoomId, event: RoomEvent },
    /// Connection lost
    Disconnected,
}

type PendingRequests = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Response, WireError>>>>>;
type PendingPings = Arc<Mutex<VecDeque<oneshot::Sender<()>>>>;

pub struct SessionClient {
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    connection_id: Arc<RwLock<Option<Uuid>>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    pending: PendingRequests,
    pings: PendingPings,
    next_request_id: AtomicU64,
    request_timeout: Duration,

    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    event_tx: mpsc::Sender<ClientEvent>,
}

impl SessionClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            connection_id: Arc::new(RwLock::new(None)),
            outgoing_tx: None,
            pending: Arc::new(Mutex::new(HashMap::new())),
            pings: Arc::new(Mutex::new(VecDeque::new())),
            next_request_id: AtomicU64::new(1),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(SessionError::Transport(format!(
                    "connect {}: {e}",
                    self.server_url
                )));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        *self.state.write().await = ConnectionState::Connected;

        // Reader task: route responses, surface room events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let connection_id = self.connection_id.clone();
        let pending = self.pending.clone();
        let pings = self.pings.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let data = match msg {
                    Ok(Message::Binary(data)) => data,
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => continue,
                };
                let frame = match ServerFrame::decode(&data) {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::warn!("Dropping undecodable server frame: {e}");
                        continue;
                    }
                };

                match frame {
                    ServerFrame::Welcome { connection_id: id } => {
                        *connection_id.write().await = Some(id);
                        let _ = event_tx.send(ClientEvent::Connected { connection_id: id }).await;
                    }
                    ServerFrame::Event { room_id, event } => {
                        let _ = event_tx.send(ClientEvent::Room { room_id, event }).await;
                    }
                    ServerFrame::Response { request_id, result } => {
                        match pending.lock().await.remove(&request_id) {
                            Some(waiter) => {
                                let _ = waiter.send(result);
                            }
                            None => log::debug!("Response for unknown request #{request_id}"),
                        }
                    }
                    ServerFrame::Pong => {
                        if let Some(waiter) = pings.lock().await.pop_front() {
                            let _ = waiter.send(());
                        }
                    }
                }
            }

            // Connection lost: fail everything still waiting
            *state.write().await = ConnectionState::Disconnected;
            *connection_id.write().await = None;
            pending.lock().await.clear();
            pings.lock().await.clear();
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Close the connection. Outstanding requests fail.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    async fn send_frame(&self, frame: &ClientFrame) -> Result<(), SessionError> {
        let encoded = frame.encode()?;
        let tx = self
            .outgoing_tx
            .as_ref()
            .ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(encoded)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        Ok(())
    }

    /// Send one request and wait for its response.
    pub async fn request(&self, request: Request) -> Result<Response, SessionError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);

        let frame = ClientFrame::Request {
            request_id,
            request,
        };
        if let Err(e) = self.send_frame(&frame).await {
            self.pending.lock().await.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result.map_err(SessionError::from),
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed.into()),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err(ProtocolError::Timeout.into())
            }
        }
    }

    /// Round trip to the server. Everything sent before it has been
    /// processed once this returns.
    pub async fn ping(&self) -> Result<Duration, SessionError> {
        let started = Instant::now();
        let (tx, rx) = oneshot::channel();
        self.pings.lock().await.push_back(tx);
        self.send_frame(&ClientFrame::Ping).await?;

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(())) => Ok(started.elapsed()),
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed.into()),
            Err(_) => Err(ProtocolError::Timeout.into()),
        }
    }

    // ─── Requests ─────────────────────────────────────────────────────

    pub async fn create_room(&self, owner_identity: Option<&str>) -> Result<RoomCreated, SessionError> {
        let request = Request::CreateRoom {
            owner_identity: owner_identity.map(str::to_string),
        };
        match self.request(request).await? {
            Response::RoomCreated { room_id, owner_id } => Ok(RoomCreated { room_id, owner_id }),
            other => Err(unexpected("create-room", &other)),
        }
    }

    pub async fn join_room(&self, room_id: &str, who: JoinIdentity) -> Result<ParticipantId, SessionError> {
        let request = Request::JoinRoom {
            room_id: room_id.to_string(),
            identity: who.authenticated,
            guest_name: who.guest_name,
        };
        match self.request(request).await? {
            Response::Joined { participant_id } => Ok(participant_id),
            other => Err(unexpected("join-room", &other)),
        }
    }

    pub async fn session_info(&self, room_id: &str) -> Result<SessionInfo, SessionError> {
        let request = Request::SessionInfo {
            room_id: room_id.to_string(),
        };
        match self.request(request).await? {
            Response::SessionInfo(info) => Ok(info),
            other => Err(unexpected("session-info", &other)),
        }
    }

    pub async fn grant_drawer(&self, room_id: &str, requested_by: &str, target: &str) -> Result<(), SessionError> {
        self.ack(Request::GrantDrawer {
            room_id: room_id.to_string(),
            requested_by: requested_by.to_string(),
            target_identity: target.to_string(),
        })
        .await
        .map(drop)
    }

    pub async fn revoke_drawer(&self, room_id: &str, requested_by: &str) -> Result<(), SessionError> {
        self.ack(Request::RevokeDrawer {
            room_id: room_id.to_string(),
            requested_by: requested_by.to_string(),
        })
        .await
        .map(drop)
    }

    pub async fn claim_ownership(&self, room_id: &str, identity: &str) -> Result<bool, SessionError> {
        self.ack(Request::ClaimOwnership {
            room_id: room_id.to_string(),
            identity: identity.to_string(),
        })
        .await
    }

    pub async fn save_snapshot(
        &self,
        room_id: &str,
        snapshot: CanvasSnapshot,
        identity: Option<&str>,
    ) -> Result<(), SessionError> {
        self.ack(Request::SaveSnapshot {
            room_id: room_id.to_string(),
            data: snapshot.data,
            width: snapshot.width,
            height: snapshot.height,
            identity: identity.map(str::to_string),
        })
        .await
        .map(drop)
    }

    pub async fn load_snapshot(&self, room_id: &str) -> Result<Option<CanvasSnapshot>, SessionError> {
        let request = Request::LoadSnapshot {
            room_id: room_id.to_string(),
        };
        match self.request(request).await? {
            Response::Snapshot(snapshot) => Ok(snapshot),
            other => Err(unexpected("load-snapshot", &other)),
        }
    }

    pub async fn list_saved(&self, identity: &str) -> Result<Vec<SnapshotRecord>, SessionError> {
        let request = Request::ListSaved {
            identity: identity.to_string(),
        };
        match self.request(request).await? {
            Response::SavedList(records) => Ok(records),
            other => Err(unexpected("list-saved", &other)),
        }
    }

    pub async fn delete_saved(&self, room_id: &str, identity: &str) -> Result<bool, SessionError> {
        self.ack(Request::DeleteSaved {
            room_id: room_id.to_string(),
            identity: identity.to_string(),
        })
        .await
    }

    async fn ack(&self, request: Request) -> Result<bool, SessionError> {
        let name = request.name();
        match self.request(request).await? {
            Response::Ack { success } => Ok(success),
            other => Err(unexpected(name, &other)),
        }
    }

    // ─── Room events ──────────────────────────────────────────────────

    /// Subscribe this connection to a room, optionally bound to a member id.
    pub async fn join_channel(&self, room_id: &str, participant_id: Option<&str>) -> Result<(), SessionError> {
        self.send_frame(&ClientFrame::Event(InboundEvent::JoinChannel {
            room_id: room_id.to_string(),
            participant_id: participant_id.map(str::to_string),
        }))
        .await
    }

    pub async fn leave_channel(&self, room_id: &str) -> Result<(), SessionError> {
        self.send_frame(&ClientFrame::Event(InboundEvent::LeaveChannel {
            room_id: room_id.to_string(),
        }))
        .await
    }

    /// Push the current canvas to the room.
    pub async fn draw(&self, frame: CanvasFrame) -> Result<(), SessionError> {
        self.send_frame(&ClientFrame::Event(InboundEvent::WhiteboardUpdate(frame)))
            .await
    }

    pub async fn request_canvas_state(&self, room_id: &str) -> Result<(), SessionError> {
        self.send_frame(&ClientFrame::Event(InboundEvent::RequestCanvasState {
            room_id: room_id.to_string(),
        }))
        .await
    }

    // ─── Accessors ────────────────────────────────────────────────────

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Server-assigned id, known once the welcome frame arrived.
    pub async fn connection_id(&self) -> Option<Uuid> {
        *self.connection_id.read().await
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub async fn pending_requests(&self) -> usize {
        self.pending.lock().await.len()
    }
}

fn unexpected(request: &str, response: &Response) -> SessionError {
    SessionError::Transport(format!("unexpected response to {request}: {response:?}"))
}
