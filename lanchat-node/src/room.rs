//! Rooms: the general broadcast room and one room per discovered peer.

use std::net::SocketAddr;

use lanchat_core::identity::{encrypt_text, sealed_len, WireCryptoError};
use lanchat_core::wire::{
    encode_direct, encode_general, DirectFrame, FrameEncodeError, GeneralFrame,
    MAX_DIRECT_FRAME_LEN,
};
use lanchat_core::{Identity, Message, PublicKey, GENERAL_ROOM_ID, GENERAL_ROOM_NAME};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::direct::DirectConnection;

/// Outbound queue length of a peer room.
pub const PEER_QUEUE_LEN: usize = 10;

/// A framed direct message waiting for the relay task, with a slot for the outcome.
#[derive(Debug)]
pub struct DirectSend {
    pub frame: String,
    pub done: oneshot::Sender<Result<(), SendError>>,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The direct session failed or the relay is gone. The caller should evict the room.
    #[error("peer disconnected")]
    Disconnected,
    #[error("general relay queue closed")]
    QueueClosed,
    #[error("room has no remote public value")]
    NoPublicKey,
    /// The encoded frame would not fit its transport. Nothing was sent.
    #[error("message too long: {len} byte frame, limit {max}")]
    TooLong { len: usize, max: usize },
    #[error("encrypt: {0}")]
    Crypto(#[from] WireCryptoError),
    #[error("frame: {0}")]
    Frame(FrameEncodeError),
}

impl From<FrameEncodeError> for SendError {
    fn from(e: FrameEncodeError) -> Self {
        match e {
            FrameEncodeError::TooLarge { len, max } => SendError::TooLong { len, max },
            other => SendError::Frame(other),
        }
    }
}

enum Outbound {
    General {
        tx: mpsc::Sender<Message>,
        rx: Mutex<Option<mpsc::Receiver<Message>>>,
    },
    Direct {
        tx: mpsc::Sender<DirectSend>,
        rx: Mutex<Option<mpsc::Receiver<DirectSend>>>,
    },
}

pub struct Room {
    id: String,
    name: String,
    remote_key: Option<PublicKey>,
    host: Option<SocketAddr>,
    messages: RwLock<Vec<Message>>,
    outbound: Outbound,
    connection: Mutex<Option<DirectConnection>>,
    cancel: CancellationToken,
}

impl Room {
    /// The shared broadcast room. `capacity` bounds its outbound queue.
    pub fn general(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            id: GENERAL_ROOM_ID.to_string(),
            name: GENERAL_ROOM_NAME.to_string(),
            remote_key: None,
            host: None,
            messages: RwLock::new(Vec::new()),
            outbound: Outbound::General {
                tx,
                rx: Mutex::new(Some(rx)),
            },
            connection: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Room for a discovered peer. `cancel` is usually a child of the broker's token.
    pub fn peer(
        id: impl Into<String>,
        name: impl Into<String>,
        remote_key: PublicKey,
        host: SocketAddr,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(PEER_QUEUE_LEN);
        Self {
            id: id.into(),
            name: name.into(),
            remote_key: Some(remote_key),
            host: Some(host),
            messages: RwLock::new(Vec::new()),
            outbound: Outbound::Direct {
                tx,
                rx: Mutex::new(Some(rx)),
            },
            connection: Mutex::new(None),
            cancel,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn remote_key(&self) -> Option<&PublicKey> {
        self.remote_key.as_ref()
    }

    pub fn host(&self) -> Option<SocketAddr> {
        self.host
    }

    pub fn is_general(&self) -> bool {
        matches!(self.outbound, Outbound::General { .. })
    }

    /// Fires when the room is closed or the whole node shuts down.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn append(&self, message: Message) {
        self.messages.write().await.push(message);
    }

    /// Append a message stamped now.
    pub async fn add_message(&self, text: impl Into<String>, author: impl Into<String>) {
        self.append(Message::now(text, author)).await;
    }

    /// Snapshot of the history in insertion order.
    pub async fn messages(&self) -> Vec<Message> {
        self.messages.read().await.clone()
    }

    pub async fn last_message(&self) -> Option<Message> {
        self.messages.read().await.last().cloned()
    }

    /// Hand the general queue's consumer to the broadcast relay. Only the first call gets it.
    pub async fn take_general_receiver(&self) -> Option<mpsc::Receiver<Message>> {
        match &self.outbound {
            Outbound::General { rx, .. } => rx.lock().await.take(),
            Outbound::Direct { .. } => None,
        }
    }

    /// Hand the direct queue's consumer to the direct relay. Only the first call gets it.
    pub async fn take_direct_receiver(&self) -> Option<mpsc::Receiver<DirectSend>> {
        match &self.outbound {
            Outbound::Direct { rx, .. } => rx.lock().await.take(),
            Outbound::General { .. } => None,
        }
    }

    /// Cached direct connection, filled lazily by the relay on first send.
    pub fn connection(&self) -> &Mutex<Option<DirectConnection>> {
        &self.connection
    }

    /// Send to the room.
    ///
    /// General room: the latest appended message goes to the multicast relay, in
    /// plaintext. Peer room: `text` is encrypted for the peer and handed to the direct
    /// relay; this waits for the write and returns [`SendError::Disconnected`] if it failed.
    pub async fn send_message(&self, identity: &Identity, text: &str) -> Result<(), SendError> {
        match &self.outbound {
            Outbound::General { tx, .. } => {
                let Some(last) = self.last_message().await else {
                    return Ok(());
                };
                self.check_general(identity, &last)?;
                tx.send(last).await.map_err(|_| SendError::QueueClosed)
            }
            Outbound::Direct { tx, .. } => {
                let remote = self.remote_key.as_ref().ok_or(SendError::NoPublicKey)?;
                let key = identity.keypair().session_key(remote);
                let frame = encode_direct(&DirectFrame {
                    sender_id: identity.id().to_string(),
                    ciphertext: encrypt_text(&key, text)?,
                })?;
                let (done, outcome) = oneshot::channel();
                tx.send(DirectSend { frame, done })
                    .await
                    .map_err(|_| SendError::Disconnected)?;
                outcome.await.map_err(|_| SendError::Disconnected)?
            }
        }
    }

    /// Append our own message and send it, the way a front end does on Enter.
    /// A message that cannot be framed is refused before it reaches the history.
    pub async fn post(&self, identity: &Identity, text: &str) -> Result<(), SendError> {
        let message = Message::now(text, identity.name());
        match &self.outbound {
            Outbound::General { .. } => self.check_general(identity, &message)?,
            Outbound::Direct { .. } => {
                let len = identity.id().len() + 1 + sealed_len(text.len());
                if len > MAX_DIRECT_FRAME_LEN {
                    return Err(SendError::TooLong {
                        len,
                        max: MAX_DIRECT_FRAME_LEN,
                    });
                }
            }
        }
        self.append(message).await;
        self.send_message(identity, text).await
    }

    fn check_general(&self, identity: &Identity, message: &Message) -> Result<(), SendError> {
        encode_general(&GeneralFrame {
            room_id: self.id.clone(),
            sender_id: identity.id().to_string(),
            message: message.clone(),
        })?;
        Ok(())
    }

    /// Stop the room's relay and release its connection.
    pub async fn close(&self) {
        self.cancel.cancel();
        if let Some(conn) = self.connection.lock().await.take() {
            conn.shutdown().await;
        }
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("host", &self.host)
            .field("is_general", &self.is_general())
            .finish_non_exhaustive()
    }
}
