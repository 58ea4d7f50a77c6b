// SPDX-FileCopyrightText: 2026 The ebbtide Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Admits tracker candidates into live peer sessions.
//!
//! Candidates flow through a bounded queue into a fixed pool of dial
//! workers. De-duplication lives in the admission table, not the queue:
//! insertion is a check-then-insert under one exclusive lock, so two
//! workers racing on the same address admit exactly one session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{event, Level};

use super::protocol::Handshake;
use super::session::{run_session, PeerHandle, SessionContext};
use crate::config::PeerConfig;
use crate::event::EventSender;
use crate::tracker::PeerCandidate;
use crate::types::{InfoHash, PeerId};

type AdmissionTable = Arc<RwLock<HashMap<String, PeerHandle>>>;

pub struct PeerManager {
    shared: Arc<DialShared>,

    candidates_tx: mpsc::Sender<PeerCandidate>,
    /// Taken by `start`; the dial workers share the receiving end.
    candidates_rx: Mutex<Option<mpsc::Receiver<PeerCandidate>>>,

    closed: AtomicBool,
    workers: Mutex<JoinSet<()>>,
}

/// Everything a dial worker needs, independent of the manager's own
/// lifecycle state.
struct DialShared {
    info_hash: InfoHash,
    peer_id: PeerId,
    ctx: Arc<SessionContext>,
    peers: AdmissionTable,
    sessions: Mutex<JoinSet<()>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl PeerManager {
    pub fn new(
        info_hash: InfoHash,
        peer_id: PeerId,
        piece_count: usize,
        cfg: PeerConfig,
        events: EventSender,
    ) -> Self {
        let (candidates_tx, candidates_rx) = mpsc::channel(cfg.candidate_queue);
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            shared: Arc::new(DialShared {
                info_hash,
                peer_id,
                ctx: Arc::new(SessionContext {
                    piece_count,
                    cfg,
                    events,
                }),
                peers: Arc::new(RwLock::new(HashMap::new())),
                sessions: Mutex::new(JoinSet::new()),
                shutdown_tx,
            }),
            candidates_tx,
            candidates_rx: Mutex::new(Some(candidates_rx)),
            closed: AtomicBool::new(false),
            workers: Mutex::new(JoinSet::new()),
        }
    }

    /// Spawns the dial worker pool. Workers run until `stop`.
    pub async fn start(&self) {
        let Some(candidates_rx) = self.candidates_rx.lock().await.take() else {
            return;
        };
        let queue = Arc::new(Mutex::new(candidates_rx));

        // Subscribed here so a stop() immediately after start() cannot
        // fire before a worker is listening.
        let mut workers = self.workers.lock().await;
        for _ in 0..self.shared.ctx.cfg.dial_workers {
            workers.spawn(dial_worker(
                Arc::clone(&self.shared),
                Arc::clone(&queue),
                self.shared.shutdown_tx.subscribe(),
            ));
        }
    }

    /// Queues candidates for dialing. Addresses already admitted and
    /// overflow beyond the queue bound are dropped silently; trackers
    /// re-announce, so drops are cheap.
    pub fn enqueue(&self, from: &str, candidates: Vec<PeerCandidate>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        for candidate in candidates {
            if self.shared.peers.read().contains_key(&candidate.addr()) {
                continue;
            }
            if self.candidates_tx.try_send(candidate).is_err() {
                event!(Level::TRACE, from = %from, "candidate queue full, dropping");
            }
        }
    }

    pub fn peer_count(&self) -> usize {
        self.shared.peers.read().len()
    }

    pub fn peer_addrs(&self) -> Vec<String> {
        self.shared.peers.read().keys().cloned().collect()
    }

    /// Stops intake, drains the dial workers, then signals every
    /// admitted session and waits for its tasks to exit. Idempotent.
    pub async fn stop(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shared.shutdown_tx.send(());

        let mut workers = self.workers.lock().await;
        while workers.join_next().await.is_some() {}
        drop(workers);

        let handles: Vec<PeerHandle> = self.shared.peers.read().values().cloned().collect();
        for handle in handles {
            handle.stop();
        }

        let mut sessions = self.shared.sessions.lock().await;
        while sessions.join_next().await.is_some() {}
        event!(Level::DEBUG, "peer manager stopped");
    }
}

async fn dial_worker(
    shared: Arc<DialShared>,
    queue: Arc<Mutex<mpsc::Receiver<PeerCandidate>>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        // Hold the queue lock only while waiting; dialing happens with
        // the lock released so the pool connects in parallel.
        let candidate = {
            let mut queue = queue.lock().await;
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                candidate = queue.recv() => match candidate {
                    Some(candidate) => candidate,
                    None => return,
                },
            }
        };

        dial_one(&shared, candidate).await;
    }
}

async fn dial_one(shared: &DialShared, candidate: PeerCandidate) {
    let cfg = &shared.ctx.cfg;
    let addr = candidate.addr();

    {
        let peers = shared.peers.read();
        if peers.len() >= cfg.max_peers {
            event!(Level::TRACE, addr = %addr, "peer table full, dropping candidate");
            return;
        }
        if peers.contains_key(&addr) {
            return;
        }
    }

    let mut stream =
        match tokio::time::timeout(cfg.handshake_timeout(), TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                event!(Level::TRACE, addr = %addr, error = %e, "dial failed");
                return;
            }
            Err(_) => {
                event!(Level::TRACE, addr = %addr, "dial timed out");
                return;
            }
        };

    let handshake = Handshake::new(shared.info_hash, shared.peer_id);
    if let Err(e) = handshake
        .perform(&mut stream, None, cfg.handshake_timeout())
        .await
    {
        event!(Level::DEBUG, addr = %addr, error = %e, "handshake failed");
        return;
    }

    let (handle, mailbox_rx) = PeerHandle::new(addr.clone(), cfg.mailbox_capacity);
    {
        // Another worker may have admitted this address while we were
        // handshaking; re-check under the exclusive lock.
        let mut peers = shared.peers.write();
        if peers.len() >= cfg.max_peers || peers.contains_key(&addr) {
            event!(Level::DEBUG, addr = %addr, "lost the admission race, closing connection");
            return;
        }
        peers.insert(addr.clone(), handle.clone());
    }

    let ctx = Arc::clone(&shared.ctx);
    let peers = Arc::clone(&shared.peers);
    shared.sessions.lock().await.spawn(async move {
        run_session(stream, addr.clone(), ctx, handle, mailbox_rx).await;
        peers.write().remove(&addr);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EVENT_CHANNEL_CAPACITY;
    use std::net::IpAddr;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn info_hash() -> InfoHash {
        InfoHash([0x33; 20])
    }

    fn manager(cfg: PeerConfig) -> PeerManager {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        PeerManager::new(
            info_hash(),
            PeerId(*b"-EB0001-cdefghijklmn"),
            16,
            cfg,
            events,
        )
    }

    fn candidate(addr: std::net::SocketAddr) -> PeerCandidate {
        PeerCandidate {
            ip: addr.ip(),
            port: addr.port(),
        }
    }

    /// Accepts every connection, answers the handshake with a matching
    /// info hash, then keeps the connection open.
    async fn handshake_server(listener: TcpListener, accepted: Arc<AtomicUsize>) {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            accepted.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = [0u8; 68];
                if socket.read_exact(&mut buf).await.is_err() {
                    return;
                }
                let reply = Handshake::new(info_hash(), PeerId(*b"-EB0001-STUBSTUBSTUB")).to_bytes();
                if socket.write_all(&reply).await.is_err() {
                    return;
                }
                let mut sink = [0u8; 1024];
                loop {
                    match socket.read(&mut sink).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) => {}
                    }
                }
            });
        }
    }

    async fn settle(manager: &PeerManager, expected: usize) {
        for _ in 0..100 {
            if manager.peer_count() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn concurrent_duplicates_admit_exactly_one_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        tokio::spawn(handshake_server(listener, Arc::clone(&accepted)));

        let manager = manager(PeerConfig::default());
        manager.start().await;

        for _ in 0..100 {
            manager.enqueue("test", vec![candidate(addr)]);
        }

        settle(&manager, 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(manager.peer_count(), 1);
        assert_eq!(manager.peer_addrs(), vec![addr.to_string()]);
        // Raced dials may have opened and closed extra sockets, but at
        // least one connection was made and only one session survived.
        assert!(accepted.load(Ordering::SeqCst) >= 1);

        manager.stop().await;
        assert_eq!(manager.peer_count(), 0);
    }

    #[tokio::test]
    async fn max_peers_caps_admissions() {
        let cfg = PeerConfig {
            max_peers: 1,
            ..PeerConfig::default()
        };

        let listener_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listener_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr_a = listener_a.local_addr().unwrap();
        let addr_b = listener_b.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        tokio::spawn(handshake_server(listener_a, Arc::clone(&accepted)));
        tokio::spawn(handshake_server(listener_b, Arc::clone(&accepted)));

        let manager = manager(cfg);
        manager.start().await;
        manager.enqueue("test", vec![candidate(addr_a), candidate(addr_b)]);

        settle(&manager, 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.peer_count(), 1);

        manager.stop().await;
    }

    #[tokio::test]
    async fn failed_dials_are_dropped_quietly() {
        let cfg = PeerConfig {
            handshake_timeout_secs: 1,
            ..PeerConfig::default()
        };
        let manager = manager(cfg);
        manager.start().await;

        // Nothing listens here.
        manager.enqueue(
            "test",
            vec![PeerCandidate {
                ip: "127.0.0.1".parse::<IpAddr>().unwrap(),
                port: 1,
            }],
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(manager.peer_count(), 0);
        manager.stop().await;
    }

    #[tokio::test]
    async fn enqueue_after_stop_is_a_no_op() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        tokio::spawn(handshake_server(listener, Arc::clone(&accepted)));

        let manager = manager(PeerConfig::default());
        manager.start().await;
        manager.stop().await;
        manager.stop().await; // idempotent

        manager.enqueue("test", vec![candidate(addr)]);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.peer_count(), 0);
        assert_eq!(accepted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn queue_overflow_drops_without_blocking() {
        let cfg = PeerConfig {
            candidate_queue: 4,
            ..PeerConfig::default()
        };
        let manager = manager(cfg);
        // Workers not started: the queue fills and further candidates
        // must be dropped without blocking this thread.
        let candidates: Vec<PeerCandidate> = (1..=100)
            .map(|port| PeerCandidate {
                ip: "10.0.0.1".parse::<IpAddr>().unwrap(),
                port,
            })
            .collect();
        manager.enqueue("test", candidates);
        assert_eq!(manager.peer_count(), 0);
    }
}
