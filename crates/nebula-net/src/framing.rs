//! Length-prefixed framing for TCP streams.
//!
//! The default policy is a 2-byte little-endian length that counts itself,
//! followed by a 2-byte packet tag and the payload:
//!
//! ```text
//! +-------------------+-------------------+---------------------+
//! | length (2 bytes)  | tag (2 bytes)     | payload             |
//! | u16 little-endian | u16 little-endian | (length - 4 bytes)  |
//! +-------------------+-------------------+---------------------+
//! ```
//!
//! The decoder only validates the length field. Tag and payload are opaque
//! to it and are exposed through [`Frame`] for packet handlers. Other
//! header layouts (a 4-byte length, or a length that excludes the header)
//! are selected through [`FrameConfig`] rather than separate decoder types.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;

use crate::connection::{Connection, ConnectionError, ConnectionHandler, DisconnectReason};
use crate::send_buffer::{SendBufferError, with_send_buffer};

/// Size of the packet tag that follows the length field.
pub const TAG_LEN: usize = 2;

/// Width of the length field at the start of each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthField {
    /// 2-byte little-endian length.
    U16,
    /// 4-byte little-endian length.
    U32,
}

impl LengthField {
    /// Number of bytes the field occupies.
    pub fn width(self) -> usize {
        match self {
            LengthField::U16 => 2,
            LengthField::U32 => 4,
        }
    }

    fn read(self, buf: &[u8]) -> usize {
        match self {
            LengthField::U16 => u16::from_le_bytes([buf[0], buf[1]]) as usize,
            LengthField::U32 => u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize,
        }
    }

    fn write(self, buf: &mut [u8], value: usize) -> Result<(), FrameError> {
        match self {
            LengthField::U16 => {
                let v = u16::try_from(value).map_err(|_| FrameError::Unrepresentable(value))?;
                buf[..2].copy_from_slice(&v.to_le_bytes());
            }
            LengthField::U32 => {
                let v = u32::try_from(value).map_err(|_| FrameError::Unrepresentable(value))?;
                buf[..4].copy_from_slice(&v.to_le_bytes());
            }
        }
        Ok(())
    }
}

/// Framing policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameConfig {
    /// Width of the length prefix. Default: [`LengthField::U16`].
    pub length_field: LengthField,
    /// Whether the declared length counts the prefix itself. Default: true.
    pub length_includes_header: bool,
    /// Smallest acceptable total frame size. Default: 4.
    pub min_frame: usize,
    /// Largest acceptable total frame size. Default: 65536.
    pub max_frame: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            length_field: LengthField::U16,
            length_includes_header: true,
            min_frame: LengthField::U16.width() + TAG_LEN,
            max_frame: 65_536,
        }
    }
}

impl FrameConfig {
    /// Policy with a 4-byte length prefix and the same frame bounds.
    pub fn wide() -> Self {
        Self {
            length_field: LengthField::U32,
            min_frame: LengthField::U32.width() + TAG_LEN,
            ..Self::default()
        }
    }

    /// Header size: length prefix plus tag.
    pub fn header_len(&self) -> usize {
        self.length_field.width() + TAG_LEN
    }
}

/// Errors produced while decoding or encoding frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The declared frame size is below the configured minimum.
    #[error("frame size {size} below minimum {min}")]
    FrameTooShort {
        /// Total frame size implied by the length field.
        size: usize,
        /// The configured minimum.
        min: usize,
    },

    /// The declared frame size exceeds the configured maximum.
    #[error("frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Total frame size implied by the length field.
        size: usize,
        /// The configured maximum.
        max: usize,
    },

    /// The frame is too short to carry a packet tag.
    #[error("frame of {size} bytes has no packet tag")]
    MissingTag {
        /// Total frame size.
        size: usize,
    },

    /// The length does not fit the configured length field.
    #[error("length {0} does not fit the length field")]
    Unrepresentable(usize),

    /// A payload writer reported more bytes than it was given room for.
    #[error("payload writer reported {written} bytes into a {capacity} byte region")]
    PayloadOverrun {
        /// Bytes reported written.
        written: usize,
        /// Size of the region handed to the writer.
        capacity: usize,
    },

    /// The send buffer was misused.
    #[error(transparent)]
    SendBuffer(#[from] SendBufferError),
}

/// One complete frame, borrowed from the receive buffer.
///
/// Valid only for the duration of the dispatch call. Copy the bytes out to
/// keep them.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    bytes: &'a [u8],
    header_len: usize,
}

impl<'a> Frame<'a> {
    /// The whole frame, length prefix included.
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Total frame length.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always false; a frame holds at least its length prefix.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Packet tag, if the frame is long enough to carry one.
    pub fn tag(&self) -> Option<u16> {
        let at = self.header_len - TAG_LEN;
        self.bytes
            .get(at..self.header_len)
            .map(|t| u16::from_le_bytes([t[0], t[1]]))
    }

    /// Bytes after the tag.
    pub fn payload(&self) -> &'a [u8] {
        self.bytes.get(self.header_len..).unwrap_or(&[])
    }
}

/// Extracts complete frames from a readable byte range.
#[derive(Debug, Clone, Default)]
pub struct FrameDecoder {
    config: FrameConfig,
}

impl FrameDecoder {
    /// Create a decoder for the given policy.
    ///
    /// `min_frame` is raised to at least the prefix width so every frame
    /// makes progress.
    pub fn new(mut config: FrameConfig) -> Self {
        config.min_frame = config.min_frame.max(config.length_field.width());
        Self { config }
    }

    /// The active policy.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    /// Dispatch every complete frame in `buf` in order.
    ///
    /// Returns the number of bytes consumed; a trailing partial frame is
    /// left for the next call. A length outside the configured bounds
    /// fails with [`ConnectionError::Protocol`] before anything after it is
    /// dispatched. A handler error stops decoding and is returned as is.
    pub fn decode<F>(&self, buf: &[u8], mut on_frame: F) -> Result<usize, ConnectionError>
    where
        F: FnMut(Frame<'_>) -> Result<(), ConnectionError>,
    {
        let field = self.config.length_field;
        let mut consumed = 0;

        while buf.len() - consumed >= field.width() {
            let rest = &buf[consumed..];
            let declared = field.read(rest);
            let size = if self.config.length_includes_header {
                declared
            } else {
                declared.saturating_add(field.width())
            };

            if size < self.config.min_frame {
                return Err(FrameError::FrameTooShort {
                    size,
                    min: self.config.min_frame,
                }
                .into());
            }
            if size > self.config.max_frame {
                return Err(FrameError::FrameTooLarge {
                    size,
                    max: self.config.max_frame,
                }
                .into());
            }
            if rest.len() < size {
                break;
            }

            on_frame(Frame {
                bytes: &rest[..size],
                header_len: self.config.header_len(),
            })?;
            consumed += size;
        }

        Ok(consumed)
    }
}

/// Encode one frame through the thread's send buffer.
///
/// `fill` writes the payload into the region it is given and returns the
/// number of bytes written. `max_payload` bounds that region.
pub fn encode_frame_with<E, F>(
    config: &FrameConfig,
    tag: u16,
    max_payload: usize,
    fill: F,
) -> Result<Bytes, E>
where
    E: From<FrameError>,
    F: FnOnce(&mut [u8]) -> Result<usize, E>,
{
    let header_len = config.header_len();
    with_send_buffer(|alloc| {
        let region = alloc.open(header_len + max_payload);
        let (header, body) = region.split_at_mut(header_len);
        let written = fill(&mut body[..max_payload])?;
        if written > max_payload {
            return Err(FrameError::PayloadOverrun {
                written,
                capacity: max_payload,
            }
            .into());
        }

        let size = header_len + written;
        if size > config.max_frame {
            return Err(FrameError::FrameTooLarge {
                size,
                max: config.max_frame,
            }
            .into());
        }
        let declared = if config.length_includes_header {
            size
        } else {
            size - config.length_field.width()
        };
        config.length_field.write(header, declared)?;
        header[header_len - TAG_LEN..].copy_from_slice(&tag.to_le_bytes());

        alloc.close(size).map_err(|e| FrameError::from(e).into())
    })
}

/// Encode a frame carrying `tag` and a copy of `payload`.
pub fn encode_frame(config: &FrameConfig, tag: u16, payload: &[u8]) -> Result<Bytes, FrameError> {
    encode_frame_with(config, tag, payload.len(), |buf| {
        buf[..payload.len()].copy_from_slice(payload);
        Ok(payload.len())
    })
}

/// Encode a frame with the default policy.
pub fn encode_packet(tag: u16, payload: &[u8]) -> Result<Bytes, FrameError> {
    encode_frame(&FrameConfig::default(), tag, payload)
}

/// Packet-level callbacks, driven by [`FramedHandler`].
pub trait PacketHandler: Send + Sync + 'static {
    /// The connection is up.
    fn on_connected(&self, _conn: &Arc<Connection>, _peer: SocketAddr) {}

    /// One complete frame arrived.
    fn on_recv_packet(&self, conn: &Arc<Connection>, frame: Frame<'_>)
        -> Result<(), ConnectionError>;

    /// A flush of `bytes` bytes completed.
    fn on_send(&self, _conn: &Arc<Connection>, _bytes: usize) {}

    /// The connection is gone. Called exactly once.
    fn on_disconnected(&self, _conn: &Arc<Connection>, _peer: SocketAddr, _reason: &DisconnectReason) {
    }
}

/// Adapts a [`PacketHandler`] into a [`ConnectionHandler`] by running a
/// [`FrameDecoder`] over every receive.
pub struct FramedHandler<P> {
    decoder: FrameDecoder,
    inner: P,
}

impl<P: PacketHandler> FramedHandler<P> {
    /// Wrap `inner` with the given framing policy.
    pub fn new(config: FrameConfig, inner: P) -> Self {
        Self {
            decoder: FrameDecoder::new(config),
            inner,
        }
    }

    /// The wrapped packet handler.
    pub fn inner(&self) -> &P {
        &self.inner
    }
}

impl<P: PacketHandler> ConnectionHandler for FramedHandler<P> {
    fn on_connected(&self, conn: &Arc<Connection>, peer: SocketAddr) {
        self.inner.on_connected(conn, peer);
    }

    fn on_recv(&self, conn: &Arc<Connection>, data: &[u8]) -> Result<usize, ConnectionError> {
        self.decoder
            .decode(data, |frame| self.inner.on_recv_packet(conn, frame))
    }

    fn on_send(&self, conn: &Arc<Connection>, bytes: usize) {
        self.inner.on_send(conn, bytes);
    }

    fn on_disconnected(&self, conn: &Arc<Connection>, peer: SocketAddr, reason: &DisconnectReason) {
        self.inner.on_disconnected(conn, peer, reason);
    }
}
