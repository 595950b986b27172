//! Two nodes on loopback: discovery, general relay, encrypted direct chat, departure.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use lanchat_core::{Identity, Message, GENERAL_ROOM_ID};
use lanchat_node::broadcast::BroadcastChannel;
use lanchat_node::direct::DirectServer;
use lanchat_node::directory::HttpProbe;
use lanchat_node::{log, Broker, Directory, Room};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Node {
    identity: Arc<Identity>,
    directory: Arc<Directory>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Half {
    identity: Arc<Identity>,
    directory: Arc<Directory>,
    listener: TcpListener,
    socket: Arc<UdpSocket>,
}

async fn half(name: &str) -> Half {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let identity = Arc::new(Identity::new(name, port));
    let directory = Arc::new(Directory::new(log::null()));
    directory.add(Arc::new(Room::general(10))).await;
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    Half {
        identity,
        directory,
        listener,
        socket,
    }
}

/// Start a node whose broadcast traffic goes to `dest` only.
fn start(h: Half, dest: SocketAddr) -> Node {
    let broadcast = BroadcastChannel::with_socket(
        h.socket,
        dest,
        h.identity.clone(),
        h.directory.clone(),
        log::null(),
    )
    .with_heartbeat(Duration::from_millis(50));
    let direct = DirectServer::from_listener(
        h.listener,
        h.identity.clone(),
        h.directory.clone(),
        log::null(),
    )
    .unwrap()
    .with_grace(Duration::from_millis(200));
    let probe = HttpProbe::new(Duration::from_millis(500)).unwrap();
    let broker = Broker::from_parts(
        h.identity.clone(),
        h.directory.clone(),
        broadcast,
        direct,
        probe,
        Duration::from_millis(100),
        log::null(),
    );
    let cancel = CancellationToken::new();
    let task = tokio::spawn(broker.run(cancel.clone()));
    Node {
        identity: h.identity,
        directory: h.directory,
        cancel,
        task,
    }
}

async fn pair() -> (Node, Node) {
    let a = half("Alice").await;
    let b = half("Bob").await;
    let a_udp = a.socket.local_addr().unwrap();
    let b_udp = b.socket.local_addr().unwrap();
    (start(a, b_udp), start(b, a_udp))
}

async fn wait_for_room(dir: &Directory, id: &str) -> Arc<Room> {
    for _ in 0..300 {
        if let Some(room) = dir.get(id).await {
            return room;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("room {} never appeared", id);
}

async fn wait_for_message(room: &Room, content: &str) -> Message {
    for _ in 0..300 {
        if let Some(m) = room.messages().await.into_iter().find(|m| m.content == content) {
            return m;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{:?} never arrived in {}", content, room.name());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn peers_discover_each_other_and_chat() {
    let (a, b) = pair().await;

    let b_on_a = wait_for_room(&a.directory, b.identity.id()).await;
    let a_on_b = wait_for_room(&b.directory, a.identity.id()).await;
    assert_eq!(b_on_a.name(), "Bob");
    assert_eq!(b_on_a.remote_key(), Some(b.identity.public_key()));
    assert_eq!(a.directory.len().await, 2);

    // Encrypted direct chat, both ways.
    a_on_b.post(&b.identity, "hello").await.unwrap();
    let got = wait_for_message(&b_on_a, "hello").await;
    assert_eq!(got.author, "Bob");
    b_on_a.post(&a.identity, "hi bob").await.unwrap();
    assert_eq!(wait_for_message(&a_on_b, "hi bob").await.author, "Alice");

    // General room, plaintext over the broadcast channel.
    let general_a = a.directory.get(GENERAL_ROOM_ID).await.unwrap();
    let general_b = b.directory.get(GENERAL_ROOM_ID).await.unwrap();
    general_a.post(&a.identity, "hello all").await.unwrap();
    let got = wait_for_message(&general_b, "hello all").await;
    assert_eq!(got.author, "Alice");
    assert_eq!(general_a.messages().await.len(), 1);

    for n in [a, b] {
        n.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(3), n.task)
            .await
            .unwrap()
            .unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stopped_peer_is_evicted_once() {
    let (a, b) = pair().await;
    let mut removed = a.directory.subscribe_removed();
    let b_on_a = wait_for_room(&a.directory, b.identity.id()).await;

    b.cancel.cancel();
    b.task.await.unwrap();

    let id = tokio::time::timeout(Duration::from_secs(5), removed.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(id, b.identity.id());
    assert!(!a.directory.contains(b.identity.id()).await);
    assert!(b_on_a.cancellation().is_cancelled());
    assert_eq!(a.directory.len().await, 1);

    a.cancel.cancel();
    a.task.await.unwrap();
    assert!(removed.try_recv().is_err());
}
