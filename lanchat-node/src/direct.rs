//! Direct channel: a small HTTP/1.1 server with a liveness stub and an upgrade endpoint
//! for encrypted sessions, plus the lazy outbound dial used by peer rooms.
//!
//! After `101 Switching Protocols` the stream carries direct frames, each prefixed by
//! its length (4 bytes LE).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use lanchat_core::identity::decrypt_text;
use lanchat_core::wire::{decode_direct, MAX_DIRECT_FRAME_LEN};
use lanchat_core::Identity;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::directory::Directory;
use crate::log::Logger;
use crate::room::{DirectSend, Room, SendError};

/// Path of the session upgrade endpoint.
pub const SESSION_PATH: &str = "/ws";
/// Value of the `Upgrade` header for direct sessions.
pub const UPGRADE_PROTOCOL: &str = "lanchat-direct";
/// How long the server waits for open sessions after cancellation.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// How long a peer may take to send a complete HTTP head.
pub const HEAD_TIMEOUT: Duration = Duration::from_secs(5);

const LEN_SIZE: usize = 4;
const MAX_HEAD_LEN: usize = 8192;
const MAX_HEADERS: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum DirectError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed http head: {0}")]
    Http(String),
    #[error("upgrade refused with status {0}")]
    Refused(u16),
    #[error("frame of {0} bytes exceeds limit")]
    TooLarge(usize),
    #[error("timed out waiting for http head")]
    Timeout,
    #[error("no connection")]
    NotConnected,
}

/// Read an HTTP head up to the blank line. Bytes after it stay in `reader`.
/// Never buffers more than `MAX_HEAD_LEN` bytes.
async fn read_head(reader: &mut BufReader<TcpStream>) -> Result<Vec<u8>, DirectError> {
    let mut head = Vec::new();
    let mut limited = reader.take(MAX_HEAD_LEN as u64);
    loop {
        let start = head.len();
        let n = limited.read_until(b'\n', &mut head).await?;
        if n == 0 {
            if head.len() >= MAX_HEAD_LEN {
                return Err(DirectError::Http("head too large".into()));
            }
            return Err(DirectError::Http("connection closed in head".into()));
        }
        let line = &head[start..];
        if line == b"\r\n" || line == b"\n" {
            return Ok(head);
        }
    }
}

/// Read one length-prefixed frame. `None` on clean end of stream.
async fn read_frame(reader: &mut BufReader<TcpStream>) -> Result<Option<Vec<u8>>, DirectError> {
    let mut len_buf = [0u8; LEN_SIZE];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_DIRECT_FRAME_LEN {
        return Err(DirectError::TooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

async fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> Result<(), DirectError> {
    if payload.len() > MAX_DIRECT_FRAME_LEN {
        return Err(DirectError::TooLarge(payload.len()));
    }
    let len = payload.len() as u32;
    stream.write_all(&len.to_le_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Outbound session to a peer's `/ws` endpoint.
pub struct DirectConnection {
    stream: BufReader<TcpStream>,
    peer: SocketAddr,
}

impl DirectConnection {
    /// Connect and perform the upgrade handshake.
    pub async fn dial(host: SocketAddr) -> Result<Self, DirectError> {
        let mut stream = TcpStream::connect(host).await?;
        stream.set_nodelay(true)?;
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: {}\r\n\r\n",
            SESSION_PATH, host, UPGRADE_PROTOCOL
        );
        stream.write_all(request.as_bytes()).await?;
        stream.flush().await?;

        let mut stream = BufReader::new(stream);
        let head = tokio::time::timeout(HEAD_TIMEOUT, read_head(&mut stream))
            .await
            .map_err(|_| DirectError::Timeout)??;
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut resp = httparse::Response::new(&mut headers);
        let status = resp
            .parse(&head)
            .map_err(|e| DirectError::Http(e.to_string()))?;
        if !status.is_complete() {
            return Err(DirectError::Http("incomplete response".into()));
        }
        match resp.code {
            Some(101) => Ok(Self { stream, peer: host }),
            Some(code) => Err(DirectError::Refused(code)),
            None => Err(DirectError::Http("missing status".into())),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn send(&mut self, frame: &str) -> Result<(), DirectError> {
        write_frame(self.stream.get_mut(), frame.as_bytes()).await
    }

    pub async fn shutdown(mut self) {
        let _ = self.stream.get_mut().shutdown().await;
    }
}

/// Start the outbound relay for a peer room.
pub fn spawn_relay(room: Arc<Room>, log: Logger) -> JoinHandle<()> {
    tokio::spawn(run_relay(room, log))
}

/// Drain a peer room's outbound queue onto its (lazily dialed) session.
///
/// The first failed write ends the relay: the waiting sender gets
/// [`SendError::Disconnected`] and so does every later send.
pub async fn run_relay(room: Arc<Room>, log: Logger) {
    let Some(mut rx) = room.take_direct_receiver().await else {
        return;
    };
    let Some(host) = room.host() else {
        return;
    };
    let cancel = room.cancellation().clone();
    loop {
        let item: DirectSend = tokio::select! {
            _ = cancel.cancelled() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };
        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = item.done.send(Err(SendError::Disconnected));
                break;
            }
            r = deliver(&room, host, &item.frame) => r,
        };
        match outcome {
            Ok(()) => {
                let _ = item.done.send(Ok(()));
            }
            // Nothing was written; the session is still usable.
            Err(DirectError::TooLarge(len)) => {
                let _ = item.done.send(Err(SendError::TooLong {
                    len,
                    max: MAX_DIRECT_FRAME_LEN,
                }));
            }
            Err(e) => {
                log.error(format!("Room-Relay: {} ({}): {}", room.name(), host, e));
                if let Some(conn) = room.connection().lock().await.take() {
                    conn.shutdown().await;
                }
                let _ = item.done.send(Err(SendError::Disconnected));
                break;
            }
        }
    }
    log.debug(format!("Room-Relay: {} stopped", room.name()));
}

async fn deliver(room: &Room, host: SocketAddr, frame: &str) -> Result<(), DirectError> {
    let mut slot = room.connection().lock().await;
    if slot.is_none() {
        *slot = Some(DirectConnection::dial(host).await?);
    }
    let Some(conn) = slot.as_mut() else {
        return Err(DirectError::NotConnected);
    };
    conn.send(frame).await
}

/// Inbound side: what a session handler needs to turn frames into messages.
struct Inbound {
    identity: Arc<Identity>,
    directory: Arc<Directory>,
    log: Logger,
    head_timeout: Duration,
}

impl Inbound {
    async fn handle_frame(&self, bytes: &[u8]) {
        let frame = match decode_direct(bytes) {
            Ok(f) => f,
            Err(e) => {
                self.log.warn(format!("WS: dropped frame: {}", e));
                return;
            }
        };
        let Some(room) = self.directory.get(&frame.sender_id).await else {
            self.log
                .debug(format!("WS: frame from unknown peer {}", frame.sender_id));
            return;
        };
        let Some(remote) = room.remote_key() else {
            return;
        };
        let key = self.identity.keypair().session_key(remote);
        match decrypt_text(&key, &frame.ciphertext) {
            Ok(text) => {
                self.log.info(format!("WS: MESSAGE from {}", room.name()));
                room.add_message(text, room.name()).await;
            }
            Err(e) => self.log.error(format!("WS: CHAT {} from {}", e, room.name())),
        }
    }
}

enum Route {
    Liveness { with_body: bool },
    Session,
    NotFound,
}

fn route(head: &[u8]) -> Result<Route, DirectError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let status = req
        .parse(head)
        .map_err(|e| DirectError::Http(e.to_string()))?;
    if !status.is_complete() {
        return Err(DirectError::Http("incomplete request".into()));
    }
    let method = req.method.unwrap_or_default();
    let path = req.path.unwrap_or_default();
    let upgrade = req.headers.iter().any(|h| {
        h.name.eq_ignore_ascii_case("Upgrade")
            && std::str::from_utf8(h.value)
                .map(|v| v.trim().eq_ignore_ascii_case(UPGRADE_PROTOCOL))
                .unwrap_or(false)
    });
    Ok(match (method, path) {
        ("GET", "/") => Route::Liveness { with_body: true },
        ("HEAD", "/") => Route::Liveness { with_body: false },
        ("GET", SESSION_PATH) if upgrade => Route::Session,
        _ => Route::NotFound,
    })
}

async fn handle_connection(
    stream: TcpStream,
    from: SocketAddr,
    inbound: Arc<Inbound>,
    cancel: CancellationToken,
) -> Result<(), DirectError> {
    let mut reader = BufReader::new(stream);
    let head = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        h = tokio::time::timeout(inbound.head_timeout, read_head(&mut reader)) => {
            h.map_err(|_| DirectError::Timeout)??
        }
    };
    match route(&head)? {
        Route::Liveness { with_body } => {
            let body = if with_body { "OK" } else { "" };
            let resp = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{}",
                body
            );
            reader.get_mut().write_all(resp.as_bytes()).await?;
            reader.get_mut().shutdown().await?;
            Ok(())
        }
        Route::NotFound => {
            reader
                .get_mut()
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await?;
            reader.get_mut().shutdown().await?;
            Ok(())
        }
        Route::Session => {
            let resp = format!(
                "HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: {}\r\n\r\n",
                UPGRADE_PROTOCOL
            );
            reader.get_mut().write_all(resp.as_bytes()).await?;
            reader.get_mut().flush().await?;
            inbound.log.info(format!("WS: Handshake from {}", from));
            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => break,
                    f = read_frame(&mut reader) => f,
                };
                match frame {
                    Ok(Some(bytes)) => inbound.handle_frame(&bytes).await,
                    Ok(None) => break,
                    Err(e) => {
                        inbound.log.error(format!("WS: Read {}: {}", from, e));
                        break;
                    }
                }
            }
            inbound.log.info(format!("WS: END {}", from));
            Ok(())
        }
    }
}

/// Accepts direct sessions for the local node.
pub struct DirectServer {
    listener: TcpListener,
    inbound: Arc<Inbound>,
    grace: Duration,
}

impl DirectServer {
    /// Bind the session listener. Failure here is fatal to the node.
    pub async fn bind(
        addr: SocketAddr,
        identity: Arc<Identity>,
        directory: Arc<Directory>,
        log: Logger,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Self::from_listener(listener, identity, directory, log)
    }

    /// Serve on a listener bound by the caller.
    pub fn from_listener(
        listener: TcpListener,
        identity: Arc<Identity>,
        directory: Arc<Directory>,
        log: Logger,
    ) -> std::io::Result<Self> {
        log.info(format!("P2P: listening on {}", listener.local_addr()?));
        Ok(Self {
            listener,
            inbound: Arc::new(Inbound {
                identity,
                directory,
                log,
                head_timeout: HEAD_TIMEOUT,
            }),
            grace: SHUTDOWN_GRACE,
        })
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Must be called before `run`.
    pub fn with_head_timeout(mut self, timeout: Duration) -> Self {
        if let Some(inbound) = Arc::get_mut(&mut self.inbound) {
            inbound.head_timeout = timeout;
        }
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until cancelled, then give open sessions `grace` to finish.
    pub async fn run(self, cancel: CancellationToken) {
        let log = self.inbound.log.clone();
        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, from)) => {
                        let inbound = self.inbound.clone();
                        let cancel = cancel.clone();
                        let log = log.clone();
                        sessions.spawn(async move {
                            if let Err(e) = handle_connection(stream, from, inbound, cancel).await {
                                log.warn(format!("P2P: {}: {}", from, e));
                            }
                        });
                    }
                    Err(e) => {
                        log.error(format!("P2P: accept {}", e));
                        break;
                    }
                },
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        }
        drop(self.listener);
        let drained = tokio::time::timeout(self.grace, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            log.warn(format!("P2P: forcing {} sessions closed", sessions.len()));
            sessions.shutdown().await;
        }
        log.info("P2P: Shutdown".to_string());
    }
}
