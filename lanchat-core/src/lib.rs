//! LAN chat protocol core.
//! No I/O: identity and key agreement, the message model and the text wire frames.

pub mod identity;
pub mod protocol;
pub mod wire;

pub use identity::{Identity, Keypair, PublicKey};
pub use protocol::{Message, GENERAL_ROOM_ID, GENERAL_ROOM_NAME};
pub use wire::{
    decode_broadcast, decode_direct, encode_direct, encode_discovery, encode_general,
    BroadcastFrame, DirectFrame, DiscoveryFrame, FrameDecodeError, FrameEncodeError, GeneralFrame,
};
