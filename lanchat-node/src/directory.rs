//! Peer directory: every known room, liveness probing, removal notifications.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::log::Logger;
use crate::room::Room;

/// Liveness probe timeout.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
/// Time between two liveness sweeps.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(1);

const REMOVED_BACKLOG: usize = 64;

/// Map from room id to room. Writers (`add`, `delete`) take the lock exclusively.
pub struct Directory {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    removed: broadcast::Sender<String>,
    log: Logger,
}

impl Directory {
    pub fn new(log: Logger) -> Self {
        let (removed, _) = broadcast::channel(REMOVED_BACKLOG);
        Self {
            rooms: RwLock::new(HashMap::new()),
            removed,
            log,
        }
    }

    /// Insert unless the id is already present. Returns whether the room was inserted.
    pub async fn add(&self, room: Arc<Room>) -> bool {
        let mut rooms = self.rooms.write().await;
        if rooms.contains_key(room.id()) {
            return false;
        }
        rooms.insert(room.id().to_string(), room);
        true
    }

    /// Remove if present.
    pub async fn delete(&self, id: &str) -> Option<Arc<Room>> {
        self.rooms.write().await.remove(id)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.rooms.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rooms.read().await.is_empty()
    }

    pub async fn list_general(&self) -> Vec<Arc<Room>> {
        self.rooms
            .read()
            .await
            .values()
            .filter(|r| r.is_general())
            .cloned()
            .collect()
    }

    /// All rooms, ascending by id.
    pub async fn list_all(&self) -> Vec<Arc<Room>> {
        let mut out: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        out.sort_by(|a, b| a.id().cmp(b.id()));
        out
    }

    /// Ids of departed rooms, one per eviction.
    pub fn subscribe_removed(&self) -> broadcast::Receiver<String> {
        self.removed.subscribe()
    }

    /// Remove a room, release its queue and connection, and publish its id.
    /// Returns false if the id was not present (nothing is published then).
    pub async fn evict(&self, id: &str) -> bool {
        let Some(room) = self.delete(id).await else {
            return false;
        };
        room.close().await;
        self.log.info(format!("Directory: LEAVING {} ({})", room.name(), room.id()));
        // No subscribers is fine.
        let _ = self.removed.send(room.id().to_string());
        true
    }

    /// Probe every peer room once, all concurrently, and evict the unreachable ones.
    /// Returns the evicted ids in ascending order.
    pub async fn sweep(&self, probe: &HttpProbe) -> Vec<String> {
        let mut checks = JoinSet::new();
        for room in self.list_all().await {
            if room.is_general() {
                continue;
            }
            let Some(host) = room.host() else {
                continue;
            };
            let probe = probe.clone();
            checks.spawn(async move {
                let result = probe.check(host).await;
                (room, host, result)
            });
        }
        let mut evicted = Vec::new();
        while let Some(joined) = checks.join_next().await {
            let (room, host, result) = match joined {
                Ok(r) => r,
                Err(e) => {
                    self.log.error(format!("PING: probe task failed: {}", e));
                    continue;
                }
            };
            if let Err(reason) = result {
                self.log.error(format!("PING: {} {}", host, reason));
                if self.evict(room.id()).await {
                    evicted.push(room.id().to_string());
                }
            }
        }
        evicted.sort();
        evicted
    }

    /// Sweep on every tick until cancelled.
    pub async fn run_liveness(&self, probe: HttpProbe, every: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately; peers get one interval before the first probe.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.sweep(&probe).await;
        }
        self.log.debug("Directory: liveness stopped".to_string());
    }
}

/// `HEAD http://<host>/` with a short timeout.
#[derive(Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("status {0}")]
    Status(u16),
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .no_proxy()
            .build()?;
        Ok(Self { client })
    }

    /// Ok if the host answered 200.
    pub async fn check(&self, host: SocketAddr) -> Result<(), ProbeError> {
        let resp = self.client.head(format!("http://{}/", host)).send().await?;
        if resp.status() != reqwest::StatusCode::OK {
            return Err(ProbeError::Status(resp.status().as_u16()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log;
    use lanchat_core::Keypair;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn peer(id: &str, host: SocketAddr) -> Arc<Room> {
        Arc::new(Room::peer(
            id,
            format!("name-{}", id),
            *Keypair::generate().public_key(),
            host,
            CancellationToken::new(),
        ))
    }

    fn unused() -> SocketAddr {
        "127.0.0.1:1".parse().unwrap()
    }

    /// Address nobody listens on.
    async fn closed_port() -> SocketAddr {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = l.local_addr().unwrap();
        drop(l);
        addr
    }

    /// Minimal server answering every request with the given status line.
    async fn answering(status: &'static str) -> SocketAddr {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = l.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut s, _)) = l.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = s.read(&mut buf).await;
                    let resp = format!("HTTP/1.1 {}\r\nContent-Length: 2\r\n\r\n", status);
                    let _ = s.write_all(resp.as_bytes()).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn add_is_idempotent() {
        let dir = Directory::new(log::null());
        assert!(dir.add(peer("a", unused())).await);
        assert!(!dir.add(peer("a", unused())).await);
        assert_eq!(dir.len().await, 1);
        assert!(dir.delete("missing").await.is_none());
        assert!(dir.delete("a").await.is_some());
        assert!(dir.is_empty().await);
    }

    #[tokio::test]
    async fn list_all_sorted_and_general_filtered() {
        let dir = Directory::new(log::null());
        for id in ["m", "z", "b", "k"] {
            dir.add(peer(id, unused())).await;
        }
        dir.add(Arc::new(Room::general(10))).await;
        let ids: Vec<String> = dir.list_all().await.iter().map(|r| r.id().to_string()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert_eq!(ids.len(), 5);

        let general = dir.list_general().await;
        assert_eq!(general.len(), 1);
        assert_eq!(general[0].id(), lanchat_core::GENERAL_ROOM_ID);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_mutation_keeps_map_consistent() {
        let dir = Arc::new(Directory::new(log::null()));
        let mut tasks = Vec::new();
        // Every id is added twice, concurrently.
        for i in 0..200 {
            let dir = dir.clone();
            tasks.push(tokio::spawn(async move {
                let id = format!("peer-{:03}", i % 100);
                let inserted = dir.add(peer(&id, unused())).await;
                let _ = dir.get(&id).await;
                let _ = dir.list_all().await;
                inserted
            }));
        }
        let mut inserted = 0;
        for t in tasks {
            if t.await.unwrap() {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 100);
        assert_eq!(dir.len().await, 100);

        let mut tasks = Vec::new();
        for i in 0..40 {
            let dir = dir.clone();
            tasks.push(tokio::spawn(async move {
                let id = format!("peer-{:03}", i);
                let a = dir.delete(&id).await.is_some();
                let b = dir.delete(&id).await.is_some();
                a as usize + b as usize
            }));
        }
        let mut deleted = 0;
        for t in tasks {
            deleted += t.await.unwrap();
        }
        assert_eq!(deleted, 40);
        assert_eq!(dir.len().await, 60);
    }

    #[tokio::test]
    async fn failed_probe_evicts_once() {
        let dir = Directory::new(log::null());
        let mut removed = dir.subscribe_removed();
        let gone = peer("gone", closed_port().await);
        dir.add(gone.clone()).await;
        dir.add(peer("alive", answering("200 OK").await)).await;
        dir.add(Arc::new(Room::general(10))).await;

        let probe = HttpProbe::new(PROBE_TIMEOUT).unwrap();
        assert_eq!(dir.sweep(&probe).await, vec!["gone".to_string()]);
        assert_eq!(removed.recv().await.unwrap(), "gone");
        assert!(matches!(
            removed.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        assert!(gone.cancellation().is_cancelled());
        assert!(!dir.contains("gone").await);
        assert!(dir.contains("alive").await);
        assert_eq!(dir.len().await, 2);

        // Already removed: nothing more to publish.
        assert!(!dir.evict("gone").await);
        assert!(matches!(
            removed.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn non_ok_status_is_departure() {
        let dir = Directory::new(log::null());
        dir.add(peer("teapot", answering("418 I'm a teapot").await)).await;
        let probe = HttpProbe::new(PROBE_TIMEOUT).unwrap();
        assert_eq!(dir.sweep(&probe).await, vec!["teapot".to_string()]);
    }

    #[tokio::test]
    async fn unresponsive_peers_are_probed_concurrently() {
        let dir = Directory::new(log::null());
        // Accepts connections (backlog) but never answers.
        let mut silent = Vec::new();
        for id in ["s1", "s2", "s3", "s4"] {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            dir.add(peer(id, l.local_addr().unwrap())).await;
            silent.push(l);
        }
        let timeout = Duration::from_millis(300);
        let probe = HttpProbe::new(timeout).unwrap();
        let started = tokio::time::Instant::now();
        let evicted = dir.sweep(&probe).await;
        assert_eq!(evicted, ["s1", "s2", "s3", "s4"]);
        assert!(started.elapsed() < timeout * 3);
        assert!(dir.is_empty().await);
    }

    #[tokio::test]
    async fn liveness_loop_stops_on_cancel() {
        let dir = Arc::new(Directory::new(log::null()));
        let mut removed = dir.subscribe_removed();
        dir.add(peer("gone", closed_port().await)).await;
        let cancel = CancellationToken::new();
        let task = {
            let dir = dir.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let probe = HttpProbe::new(PROBE_TIMEOUT).unwrap();
                dir.run_liveness(probe, Duration::from_millis(20), cancel).await
            })
        };
        assert_eq!(removed.recv().await.unwrap(), "gone");
        cancel.cancel();
        task.await.unwrap();
        assert!(dir.is_empty().await);
    }
}
