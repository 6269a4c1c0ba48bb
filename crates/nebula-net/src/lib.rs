//! TCP transport core: accept loop, length-prefixed framing, coalescing
//! per-connection send queues, and broadcast rooms.

pub mod acceptor;
pub mod connection;
pub mod connector;
pub mod cursor;
pub mod framing;
pub mod platform;
pub mod registry;
pub mod room;
pub mod send_buffer;

#[cfg(test)]
mod testing;

pub use acceptor::{AcceptError, Acceptor, ConnectionFactory};
pub use connection::{
    Connection, ConnectionConfig, ConnectionError, ConnectionHandler, ConnectionId,
    ConnectionState, DisconnectReason, IdGenerator,
};
pub use connector::connect;
pub use cursor::{CursorError, ReceiveCursor};
pub use framing::{
    Frame, FrameConfig, FrameDecoder, FrameError, FramedHandler, LengthField, PacketHandler,
    encode_frame, encode_frame_with, encode_packet,
};
pub use platform::{KeepaliveConfig, SocketConfig, configure_stream, create_listener};
pub use registry::{ConnectionLimitReached, ConnectionRegistry};
pub use room::{Room, RoomDirectory};
pub use send_buffer::{
    SendBufferAllocator, SendBufferError, send_chunk_size, set_send_chunk_size, with_send_buffer,
};
