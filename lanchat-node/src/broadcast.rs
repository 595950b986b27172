//! LAN broadcast: UDP multicast heartbeats, general-room relay, discovery of peers.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use lanchat_core::protocol::MAX_DATAGRAM_LEN;
use lanchat_core::wire::{
    decode_broadcast, encode_discovery, encode_general, BroadcastFrame, DiscoveryFrame,
    GeneralFrame,
};
use lanchat_core::Identity;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::direct;
use crate::directory::Directory;
use crate::log::Logger;
use crate::room::Room;

pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 1);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Bind `0.0.0.0:port` with address reuse and join `group`. TTL 1 keeps frames on the LAN.
pub fn make_multicast_socket(group: Ipv4Addr, port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_ttl_v4(1)?;
    socket.set_multicast_loop_v4(true)?;
    UdpSocket::from_std(socket.into())
}

/// Turns inbound datagrams into directory inserts and general-room messages.
pub struct Ingest {
    identity: Arc<Identity>,
    directory: Arc<Directory>,
    log: Logger,
    /// Parent of every peer room's token.
    cancel: CancellationToken,
}

impl Ingest {
    pub fn new(
        identity: Arc<Identity>,
        directory: Arc<Directory>,
        log: Logger,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            identity,
            directory,
            log,
            cancel,
        }
    }

    /// Handle one datagram received from `from`. Malformed frames are logged and dropped.
    pub async fn handle_datagram(&self, bytes: &[u8], from: SocketAddr) {
        let frame = match decode_broadcast(bytes) {
            Ok(f) => f,
            Err(e) => {
                self.log
                    .warn(format!("ListenCasting: dropped frame from {}: {}", from, e));
                return;
            }
        };
        match frame {
            BroadcastFrame::Discovery(d) => self.on_discovery(d, from).await,
            BroadcastFrame::General(g) => self.on_general(g).await,
        }
    }

    async fn on_discovery(&self, d: DiscoveryFrame, from: SocketAddr) {
        if d.sender_id == self.identity.id() || self.directory.contains(&d.sender_id).await {
            return;
        }
        let host = SocketAddr::new(from.ip(), d.port);
        let room = Arc::new(Room::peer(
            d.sender_id,
            d.sender_name,
            d.public_key,
            host,
            self.cancel.child_token(),
        ));
        if self.directory.add(room.clone()).await {
            self.log.info(format!(
                "ListenCasting: JOINING {} - {}",
                room.name(),
                host
            ));
            direct::spawn_relay(room, self.log.clone());
        }
    }

    async fn on_general(&self, g: GeneralFrame) {
        if g.sender_id == self.identity.id() {
            return;
        }
        match self.directory.get(&g.room_id).await {
            Some(room) if room.is_general() => {
                self.log
                    .info(format!("ListenCasting: MESSAGE from {}", g.message.author));
                room.append(g.message).await;
            }
            Some(_) => self.log.warn(format!(
                "ListenCasting: plaintext relay for peer room {} ignored",
                g.room_id
            )),
            None => {}
        }
    }
}

/// Send our discovery frame to `dest` on every tick.
pub async fn heartbeat_loop(
    socket: Arc<UdpSocket>,
    dest: SocketAddr,
    identity: Arc<Identity>,
    every: Duration,
    cancel: CancellationToken,
    log: Logger,
) {
    let frame = match encode_discovery(&DiscoveryFrame {
        sender_id: identity.id().to_string(),
        sender_name: identity.name().to_string(),
        public_key: *identity.public_key(),
        port: identity.port(),
    }) {
        Ok(f) => f,
        Err(e) => {
            log.error(format!("BroadcastChannel: heartbeat {}", e));
            return;
        }
    };
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Err(e) = socket.send_to(&frame, dest).await {
            log.error(format!("BroadcastChannel: Casting {}", e));
            return;
        }
    }
}

/// Drain a general room's outbound queue onto `dest`.
pub async fn relay_general(
    socket: Arc<UdpSocket>,
    dest: SocketAddr,
    room: Arc<Room>,
    sender_id: String,
    cancel: CancellationToken,
    log: Logger,
) {
    let Some(mut rx) = room.take_general_receiver().await else {
        return;
    };
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            m = rx.recv() => match m {
                Some(m) => m,
                None => break,
            },
        };
        let frame = GeneralFrame {
            room_id: room.id().to_string(),
            sender_id: sender_id.clone(),
            message,
        };
        let bytes = match encode_general(&frame) {
            Ok(b) => b,
            Err(e) => {
                log.warn(format!("BroadcastMessage: not sent: {}", e));
                continue;
            }
        };
        if let Err(e) = socket.send_to(&bytes, dest).await {
            log.error(format!("BroadcastMessage: {}", e));
            return;
        }
    }
}

/// Receive datagrams until cancelled. A socket error ends the listener.
pub async fn listen(socket: Arc<UdpSocket>, ingest: Arc<Ingest>, cancel: CancellationToken) {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            r = socket.recv_from(&mut buf) => r,
        };
        match received {
            Ok((n, from)) => ingest.handle_datagram(&buf[..n], from).await,
            Err(e) => {
                ingest
                    .log
                    .error(format!("ReadFromUDPConnection: {}", e));
                return;
            }
        }
    }
}

/// Multicast side of the node: heartbeat, general relay and the inbound listener.
pub struct BroadcastChannel {
    socket: Arc<UdpSocket>,
    dest: SocketAddr,
    identity: Arc<Identity>,
    directory: Arc<Directory>,
    log: Logger,
    heartbeat: Duration,
}

impl BroadcastChannel {
    /// Bind the multicast socket. Failure here is fatal to the node.
    pub fn bind(
        group: Ipv4Addr,
        identity: Arc<Identity>,
        directory: Arc<Directory>,
        log: Logger,
    ) -> std::io::Result<Self> {
        let port = identity.port();
        let socket = make_multicast_socket(group, port)?;
        log.info(format!("Broker: multicast group {}:{}", group, port));
        Ok(Self::with_socket(
            Arc::new(socket),
            SocketAddr::V4(SocketAddrV4::new(group, port)),
            identity,
            directory,
            log,
        ))
    }

    /// Use an already bound socket and send to `dest`.
    pub fn with_socket(
        socket: Arc<UdpSocket>,
        dest: SocketAddr,
        identity: Arc<Identity>,
        directory: Arc<Directory>,
        log: Logger,
    ) -> Self {
        Self {
            socket,
            dest,
            identity,
            directory,
            log,
            heartbeat: HEARTBEAT_INTERVAL,
        }
    }

    pub fn with_heartbeat(mut self, every: Duration) -> Self {
        self.heartbeat = every;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Run every broadcast task until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        self.log.info("BroadcastChannel: START".to_string());
        let mut tasks = JoinSet::new();
        tasks.spawn(heartbeat_loop(
            self.socket.clone(),
            self.dest,
            self.identity.clone(),
            self.heartbeat,
            cancel.clone(),
            self.log.clone(),
        ));
        for room in self.directory.list_general().await {
            tasks.spawn(relay_general(
                self.socket.clone(),
                self.dest,
                room,
                self.identity.id().to_string(),
                cancel.clone(),
                self.log.clone(),
            ));
        }
        let ingest = Arc::new(Ingest::new(
            self.identity.clone(),
            self.directory.clone(),
            self.log.clone(),
            cancel.clone(),
        ));
        tasks.spawn(listen(self.socket.clone(), ingest, cancel.clone()));
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                self.log.error(format!("BroadcastChannel: task failed: {}", e));
            }
        }
        self.log.info("BroadcastChannel: STOP".to_string());
    }
}
