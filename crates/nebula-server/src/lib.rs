//! Reference lobby server for the Nebula transport: clients enter named
//! rooms and chat, and the server relays lines and presence counts.

pub mod lobby;
pub mod protocol;
pub mod server;

pub use lobby::{Lobby, Session};
pub use protocol::{ClientPacket, ProtocolError, ServerPacket};
pub use server::{Server, ServerError};
