//! Lobby wire protocol: packet tags and postcard-encoded payloads carried in
//! the default length-prefixed framing.
//!
//! ```text
//! [len: u16 LE, header included] [tag: u16 LE] [postcard payload]
//! ```

use bytes::Bytes;
use nebula_net::{Frame, FrameConfig, FrameError, encode_frame_with};
use serde::{Deserialize, Serialize};

/// Client asks to join a room under a display name.
pub const TAG_ENTER: u16 = 1;
/// Client leaves its current room. Empty payload.
pub const TAG_LEAVE: u16 = 2;
/// Client says something in its current room.
pub const TAG_CHAT: u16 = 3;
/// Server relays a chat line to the rest of the room.
pub const TAG_CHAT_RELAY: u16 = 4;
/// Server announces a room's new member count.
pub const TAG_PRESENCE: u16 = 5;

/// Largest payload the encoder will produce.
pub const MAX_PAYLOAD: usize = 4 * 1024;
/// Longest accepted room or display name, in bytes.
pub const MAX_NAME_LEN: usize = 32;
/// Longest accepted chat line, in bytes.
pub const MAX_TEXT_LEN: usize = 500;

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Payload of [`TAG_ENTER`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EnterRoom {
    /// Room to join. Created on first entry.
    pub room: String,
    /// Display name shown to other members.
    pub name: String,
}

/// Payload of [`TAG_CHAT`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChatSay {
    /// The line to relay.
    pub text: String,
}

/// Payload of [`TAG_CHAT_RELAY`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChatRelay {
    /// Display name of the speaker.
    pub from: String,
    /// What they said.
    pub text: String,
}

/// Payload of [`TAG_PRESENCE`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Presence {
    /// The room whose membership changed.
    pub room: String,
    /// Members after the change.
    pub members: u32,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A packet that cannot be decoded or encoded.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The tag is not part of the protocol (or not valid in this direction).
    #[error("unknown packet tag {0}")]
    UnknownTag(u16),

    /// The payload does not decode, or does not fit [`MAX_PAYLOAD`].
    #[error("malformed payload: {0}")]
    Payload(#[from] postcard::Error),

    /// A string field is empty or longer than allowed.
    #[error("{field} must be 1..={max} bytes, got {len}")]
    FieldLength {
        /// Which field.
        field: &'static str,
        /// Its length.
        len: usize,
        /// The limit.
        max: usize,
    },

    /// Framing failed.
    #[error(transparent)]
    Frame(#[from] FrameError),
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), ProtocolError> {
    let len = value.len();
    if len == 0 || len > max {
        return Err(ProtocolError::FieldLength { field, len, max });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

/// Everything a client may send.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientPacket {
    /// [`TAG_ENTER`]
    Enter(EnterRoom),
    /// [`TAG_LEAVE`]
    Leave,
    /// [`TAG_CHAT`]
    Chat(ChatSay),
}

impl ClientPacket {
    /// Decode and validate a received frame.
    pub fn from_frame(frame: Frame<'_>) -> Result<Self, ProtocolError> {
        let tag = frame
            .tag()
            .ok_or(FrameError::MissingTag { size: frame.len() })?;
        let payload = frame.payload();

        let packet = match tag {
            TAG_ENTER => {
                let enter: EnterRoom = postcard::from_bytes(payload)?;
                check_len("room", &enter.room, MAX_NAME_LEN)?;
                check_len("name", &enter.name, MAX_NAME_LEN)?;
                ClientPacket::Enter(enter)
            }
            TAG_LEAVE => ClientPacket::Leave,
            TAG_CHAT => {
                let say: ChatSay = postcard::from_bytes(payload)?;
                check_len("text", &say.text, MAX_TEXT_LEN)?;
                ClientPacket::Chat(say)
            }
            other => return Err(ProtocolError::UnknownTag(other)),
        };
        Ok(packet)
    }

    /// Encode for sending to a server.
    pub fn encode(&self, config: &FrameConfig) -> Result<Bytes, ProtocolError> {
        match self {
            ClientPacket::Enter(enter) => encode_message(config, TAG_ENTER, enter),
            ClientPacket::Leave => Ok(nebula_net::encode_frame(config, TAG_LEAVE, &[])?),
            ClientPacket::Chat(say) => encode_message(config, TAG_CHAT, say),
        }
    }
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

/// Everything the server sends.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerPacket {
    /// [`TAG_CHAT_RELAY`]
    ChatRelay(ChatRelay),
    /// [`TAG_PRESENCE`]
    Presence(Presence),
}

impl ServerPacket {
    /// Decode a server packet from its tag and payload.
    pub fn decode(tag: u16, payload: &[u8]) -> Result<Self, ProtocolError> {
        match tag {
            TAG_CHAT_RELAY => Ok(ServerPacket::ChatRelay(postcard::from_bytes(payload)?)),
            TAG_PRESENCE => Ok(ServerPacket::Presence(postcard::from_bytes(payload)?)),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }

    /// Encode into one frame, ready for [`nebula_net::Room::broadcast`].
    pub fn encode(&self, config: &FrameConfig) -> Result<Bytes, ProtocolError> {
        match self {
            ServerPacket::ChatRelay(relay) => encode_message(config, TAG_CHAT_RELAY, relay),
            ServerPacket::Presence(presence) => encode_message(config, TAG_PRESENCE, presence),
        }
    }
}

/// Serialize `msg` with postcard straight into the send buffer.
pub fn encode_message<T: Serialize>(
    config: &FrameConfig,
    tag: u16,
    msg: &T,
) -> Result<Bytes, ProtocolError> {
    encode_frame_with(config, tag, MAX_PAYLOAD, |buf| {
        Ok(postcard::to_slice(msg, buf)?.len())
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use nebula_net::FrameDecoder;

    /// Run `bytes` through a decoder and collect the client packets.
    fn decode_client(bytes: &[u8]) -> Vec<Result<ClientPacket, String>> {
        let mut out = Vec::new();
        FrameDecoder::default()
            .decode(bytes, |frame| {
                out.push(ClientPacket::from_frame(frame).map_err(|e| e.to_string()));
                Ok(())
            })
            .unwrap();
        out
    }

    fn split(frame: &[u8]) -> (u16, &[u8]) {
        let tag = u16::from_le_bytes([frame[2], frame[3]]);
        (tag, &frame[4..])
    }

    #[test]
    fn test_client_packets_decode() {
        let config = FrameConfig::default();
        let enter = ClientPacket::Enter(EnterRoom {
            room: "lobby".into(),
            name: "alice".into(),
        });
        let chat = ClientPacket::Chat(ChatSay { text: "hi".into() });

        let mut stream = Vec::new();
        stream.extend_from_slice(&enter.encode(&config).unwrap());
        stream.extend_from_slice(&chat.encode(&config).unwrap());
        stream.extend_from_slice(&ClientPacket::Leave.encode(&config).unwrap());

        let decoded: Vec<_> = decode_client(&stream).into_iter().map(Result::unwrap).collect();
        assert_eq!(decoded, vec![enter, chat, ClientPacket::Leave]);
    }

    #[test]
    fn test_frame_header_matches_default_framing() {
        let bytes = ServerPacket::Presence(Presence {
            room: "r".into(),
            members: 3,
        })
        .encode(&FrameConfig::default())
        .unwrap();

        let declared = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
        assert_eq!(declared, bytes.len());
        let (tag, payload) = split(&bytes);
        assert_eq!(tag, TAG_PRESENCE);
        assert_eq!(
            ServerPacket::decode(tag, payload).unwrap(),
            ServerPacket::Presence(Presence {
                room: "r".into(),
                members: 3
            })
        );
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let bytes = nebula_net::encode_packet(99, b"").unwrap();
        let decoded = decode_client(&bytes);
        assert_eq!(decoded.len(), 1);
        assert!(decoded[0].as_ref().unwrap_err().contains("unknown packet tag 99"));

        // Server-only tags are not valid from a client.
        let relay = nebula_net::encode_packet(TAG_CHAT_RELAY, b"").unwrap();
        assert!(decode_client(&relay)[0].is_err());
    }

    #[test]
    fn test_garbage_payload_rejected() {
        let bytes = nebula_net::encode_packet(TAG_ENTER, &[0xFF, 0xFF, 0xFF]).unwrap();
        let decoded = decode_client(&bytes);
        assert!(decoded[0].as_ref().unwrap_err().contains("malformed payload"));
    }

    #[test]
    fn test_field_limits_enforced() {
        let config = FrameConfig::default();
        let empty_room = encode_message(
            &config,
            TAG_ENTER,
            &EnterRoom {
                room: String::new(),
                name: "bob".into(),
            },
        )
        .unwrap();
        let long_text = encode_message(
            &config,
            TAG_CHAT,
            &ChatSay {
                text: "x".repeat(MAX_TEXT_LEN + 1),
            },
        )
        .unwrap();

        assert!(decode_client(&empty_room)[0].as_ref().unwrap_err().contains("room"));
        assert!(decode_client(&long_text)[0].as_ref().unwrap_err().contains("text"));
    }

    #[test]
    fn test_oversized_message_fails_to_encode() {
        let huge = ChatSay {
            text: "y".repeat(MAX_PAYLOAD + 1),
        };
        let result = encode_message(&FrameConfig::default(), TAG_CHAT, &huge);
        assert!(matches!(result, Err(ProtocolError::Payload(_))));
    }

    #[test]
    fn test_postcard_payload_is_compact() {
        let bytes = ClientPacket::Chat(ChatSay { text: "hey".into() })
            .encode(&FrameConfig::default())
            .unwrap();
        // header (4) + varint length (1) + 3 bytes of text
        assert_eq!(bytes.len(), 8);
    }
}
