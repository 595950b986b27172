//! Framing: `|`-delimited text frames for discovery, general relay and direct sessions.

use chrono::{DateTime, Utc};

use crate::identity::{KeyParseError, PublicKey};
use crate::protocol::{Message, DISCOVERY_MARKER, MAX_DATAGRAM_LEN};

const DELIMITER: char = '|';
const BROADCAST_FIELDS: usize = 5;
const DIRECT_FIELDS: usize = 2;

/// Largest direct-session frame accepted on the point-to-point transport.
pub const MAX_DIRECT_FRAME_LEN: usize = 64 * 1024;

/// Heartbeat announcing a node: who it is, its public value and its session port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryFrame {
    pub sender_id: String,
    pub sender_name: String,
    pub public_key: PublicKey,
    pub port: u16,
}

/// A general-room message relayed over multicast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneralFrame {
    pub room_id: String,
    pub sender_id: String,
    pub message: Message,
}

/// Anything that arrives on the multicast group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastFrame {
    Discovery(DiscoveryFrame),
    General(GeneralFrame),
}

/// Encrypted payload on a direct session. `ciphertext` is opaque text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectFrame {
    pub sender_id: String,
    pub ciphertext: String,
}

/// Error encoding a frame: a field would break the delimiter structure, or the
/// frame would not fit its transport.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("field `{0}` contains the frame delimiter")]
    Delimiter(&'static str),
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
}

/// Malformed frame.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("frame is not valid utf-8")]
    NotUtf8,
    #[error("bad field count: expected {expected}, got {got}")]
    FieldCount { expected: usize, got: usize },
    #[error("bad public value: {0}")]
    PublicKey(#[from] KeyParseError),
    #[error("bad port `{0}`")]
    Port(String),
    #[error("bad timestamp `{0}`")]
    Timestamp(String),
}

fn check(name: &'static str, value: &str) -> Result<(), FrameEncodeError> {
    if value.contains(DELIMITER) {
        return Err(FrameEncodeError::Delimiter(name));
    }
    Ok(())
}

fn check_len(len: usize, max: usize) -> Result<(), FrameEncodeError> {
    if len > max {
        return Err(FrameEncodeError::TooLarge { len, max });
    }
    Ok(())
}

/// Strip NUL padding left by fixed-size receive buffers.
pub fn strip_padding(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| *b != 0).map_or(start, |i| i + 1);
    &bytes[start..end]
}

fn split_fields(bytes: &[u8], expected: usize) -> Result<Vec<&str>, FrameDecodeError> {
    let text = std::str::from_utf8(strip_padding(bytes)).map_err(|_| FrameDecodeError::NotUtf8)?;
    let fields: Vec<&str> = text.split(DELIMITER).collect();
    if fields.len() != expected {
        return Err(FrameDecodeError::FieldCount {
            expected,
            got: fields.len(),
        });
    }
    Ok(fields)
}

/// `P2P|<id>|<name>|<public value>|<port>`
pub fn encode_discovery(frame: &DiscoveryFrame) -> Result<Vec<u8>, FrameEncodeError> {
    check("sender id", &frame.sender_id)?;
    check("sender name", &frame.sender_name)?;
    let bytes = format!(
        "{}|{}|{}|{}|{}",
        DISCOVERY_MARKER,
        frame.sender_id,
        frame.sender_name,
        frame.public_key.to_decimal(),
        frame.port
    )
    .into_bytes();
    check_len(bytes.len(), MAX_DATAGRAM_LEN)?;
    Ok(bytes)
}

/// `<room id>|<sender id>|<RFC3339>|<content>|<author>`
///
/// Must fit one datagram: a receiver truncates anything longer.
pub fn encode_general(frame: &GeneralFrame) -> Result<Vec<u8>, FrameEncodeError> {
    check("room id", &frame.room_id)?;
    check("sender id", &frame.sender_id)?;
    check("content", &frame.message.content)?;
    check("author", &frame.message.author)?;
    let bytes = format!(
        "{}|{}|{}|{}|{}",
        frame.room_id,
        frame.sender_id,
        frame.message.rfc3339(),
        frame.message.content,
        frame.message.author
    )
    .into_bytes();
    check_len(bytes.len(), MAX_DATAGRAM_LEN)?;
    Ok(bytes)
}

/// Decode one multicast datagram (NUL padding allowed).
pub fn decode_broadcast(bytes: &[u8]) -> Result<BroadcastFrame, FrameDecodeError> {
    let f = split_fields(bytes, BROADCAST_FIELDS)?;
    if f[0] == DISCOVERY_MARKER {
        let public_key = PublicKey::from_decimal(f[3])?;
        let port = f[4]
            .parse::<u16>()
            .map_err(|_| FrameDecodeError::Port(f[4].to_string()))?;
        return Ok(BroadcastFrame::Discovery(DiscoveryFrame {
            sender_id: f[1].to_string(),
            sender_name: f[2].to_string(),
            public_key,
            port,
        }));
    }
    let time = DateTime::parse_from_rfc3339(f[2])
        .map_err(|_| FrameDecodeError::Timestamp(f[2].to_string()))?
        .with_timezone(&Utc);
    Ok(BroadcastFrame::General(GeneralFrame {
        room_id: f[0].to_string(),
        sender_id: f[1].to_string(),
        message: Message::new(time, f[3], f[4]),
    }))
}

/// `<sender id>|<ciphertext>`
pub fn encode_direct(frame: &DirectFrame) -> Result<String, FrameEncodeError> {
    check("sender id", &frame.sender_id)?;
    check("ciphertext", &frame.ciphertext)?;
    let text = format!("{}|{}", frame.sender_id, frame.ciphertext);
    check_len(text.len(), MAX_DIRECT_FRAME_LEN)?;
    Ok(text)
}

pub fn decode_direct(bytes: &[u8]) -> Result<DirectFrame, FrameDecodeError> {
    let f = split_fields(bytes, DIRECT_FIELDS)?;
    Ok(DirectFrame {
        sender_id: f[0].to_string(),
        ciphertext: f[1].to_string(),
    })
}
