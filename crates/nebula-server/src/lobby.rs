//! Room-based chat lobby built on the transport's rooms and registry.
//!
//! Each accepted connection gets a [`Session`]. A session belongs to at most
//! one room at a time: entering a new room leaves the old one first. Every
//! membership change is followed by a [`Presence`] broadcast to the room,
//! and chat lines are relayed to everyone in the room except the speaker.

use std::net::SocketAddr;
use std::sync::Arc;

use nebula_net::{
    Connection, ConnectionConfig, ConnectionError, ConnectionRegistry, DisconnectReason, Frame,
    FrameConfig, FramedHandler, PacketHandler, RoomDirectory,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::protocol::{
    ChatRelay, ChatSay, ClientPacket, EnterRoom, Presence, ProtocolError, ServerPacket,
};

// ---------------------------------------------------------------------------
// Lobby
// ---------------------------------------------------------------------------

/// Shared server state: who is connected and who is in which room.
#[derive(Debug)]
pub struct Lobby {
    rooms: RoomDirectory<String>,
    registry: ConnectionRegistry,
    frame_config: FrameConfig,
}

impl Lobby {
    /// Create a lobby admitting at most `max_connections` sessions.
    pub fn new(max_connections: usize, frame_config: FrameConfig) -> Arc<Self> {
        Arc::new(Self {
            rooms: RoomDirectory::new(),
            registry: ConnectionRegistry::new(max_connections),
            frame_config,
        })
    }

    /// Connection factory for [`nebula_net::Acceptor::run`].
    pub fn factory(
        self: &Arc<Self>,
        conn_config: ConnectionConfig,
    ) -> impl Fn() -> Arc<Connection> + Send + Sync + 'static {
        let lobby = Arc::clone(self);
        move || {
            let session = Session::new(Arc::clone(&lobby));
            let handler = FramedHandler::new(lobby.frame_config.clone(), session);
            Connection::new(Arc::new(handler), conn_config.clone())
        }
    }

    /// Number of admitted connections.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Members currently in `room`.
    pub fn room_members(&self, room: &str) -> usize {
        self.rooms.get(&room.to_string()).map_or(0, |r| r.len())
    }

    /// Close every admitted connection.
    pub fn disconnect_all(&self) -> usize {
        self.registry
            .connections()
            .iter()
            .filter(|conn| conn.disconnect())
            .count()
    }

    fn enter(&self, room: &str, conn: &Arc<Connection>) {
        let members = self.rooms.enter(room.to_string(), Arc::clone(conn));
        self.announce(room, members);
    }

    fn leave(&self, room: &str, conn: &Connection) {
        if let Some(members) = self.rooms.leave(&room.to_string(), conn) {
            self.announce(room, members);
        }
    }

    fn announce(&self, room: &str, members: usize) {
        let presence = ServerPacket::Presence(Presence {
            room: room.to_string(),
            members: u32::try_from(members).unwrap_or(u32::MAX),
        });
        match presence.encode(&self.frame_config) {
            Ok(bytes) => {
                self.rooms.broadcast(&room.to_string(), &bytes, None);
            }
            Err(err) => warn!("Could not encode presence for room {room}: {err}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SessionState {
    name: Option<String>,
    room: Option<String>,
}

/// Per-connection protocol handler.
pub struct Session {
    lobby: Arc<Lobby>,
    state: Mutex<SessionState>,
}

impl Session {
    /// A fresh session bound to `lobby`.
    pub fn new(lobby: Arc<Lobby>) -> Self {
        Self {
            lobby,
            state: Mutex::new(SessionState::default()),
        }
    }

    fn handle(&self, conn: &Arc<Connection>, packet: ClientPacket) -> Result<(), ProtocolError> {
        match packet {
            ClientPacket::Enter(EnterRoom { room, name }) => {
                let previous = {
                    let mut state = self.state.lock();
                    state.name = Some(name.clone());
                    state.room.replace(room.clone())
                };
                if let Some(previous) = previous {
                    self.lobby.leave(&previous, conn);
                }
                info!("Connection {:?} entered room {room:?} as {name:?}", conn.id());
                self.lobby.enter(&room, conn);
            }
            ClientPacket::Leave => {
                let previous = self.state.lock().room.take();
                match previous {
                    Some(room) => {
                        debug!("Connection {:?} left room {room:?}", conn.id());
                        self.lobby.leave(&room, conn);
                    }
                    None => debug!("Connection {:?} sent leave outside a room", conn.id()),
                }
            }
            ClientPacket::Chat(ChatSay { text }) => {
                let (room, from) = {
                    let state = self.state.lock();
                    (state.room.clone(), state.name.clone())
                };
                let (Some(room), Some(from)) = (room, from) else {
                    debug!("Connection {:?} chatted outside a room", conn.id());
                    return Ok(());
                };
                let relay = ServerPacket::ChatRelay(ChatRelay { from, text })
                    .encode(&self.lobby.frame_config)?;
                let delivered = self.lobby.rooms.broadcast(&room, &relay, Some(&**conn));
                tracing::trace!("Relayed chat in {room:?} to {delivered} members");
            }
        }
        Ok(())
    }
}

impl PacketHandler for Session {
    fn on_connected(&self, conn: &Arc<Connection>, peer: SocketAddr) {
        if let Err(err) = self.lobby.registry.insert(Arc::clone(conn)) {
            warn!("Rejecting {peer}: {err}");
            conn.disconnect();
        }
    }

    fn on_recv_packet(&self, conn: &Arc<Connection>, frame: Frame<'_>) -> Result<(), ConnectionError> {
        let packet = ClientPacket::from_frame(frame).map_err(ConnectionError::handler)?;
        self.handle(conn, packet).map_err(ConnectionError::handler)
    }

    fn on_disconnected(&self, conn: &Arc<Connection>, peer: SocketAddr, reason: &DisconnectReason) {
        let room = self.state.lock().room.take();
        if let Some(room) = room {
            self.lobby.leave(&room, conn);
        }
        if self.lobby.registry.remove(conn.id()).is_some() {
            info!("Session {:?} from {peer} ended: {reason:?}", conn.id());
        }
    }
}
