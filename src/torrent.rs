// SPDX-FileCopyrightText: 2026 The ebbtide Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Lifecycle handle tying one torrent's tracker and peer subsystems
//! together for the embedding host.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{event, Level};

use crate::config::Settings;
use crate::event::{Event, EventSender, EVENT_CHANNEL_CAPACITY};
use crate::metainfo::{self, Metainfo, ParseError};
use crate::peer::PeerManager;
use crate::tracker::manager::{PeerSink, TrackerIdentity};
use crate::tracker::{PeerCandidate, TrackerError, TrackerManager};
use crate::types::{InfoHash, PeerId};

/// Peer batches in flight between the tracker manager and the peer
/// manager's candidate queue.
const PEER_SINK_CAPACITY: usize = 16;

/// One open torrent: immutable metainfo plus the tracker and peer
/// managers driving it. Created by [`Torrent::open`], started once,
/// stopped idempotently.
pub struct Torrent {
    metainfo: Arc<Metainfo>,
    peer_id: PeerId,

    tracker_manager: Arc<TrackerManager>,
    peer_manager: Arc<PeerManager>,

    events: EventSender,

    peers_rx: Mutex<Option<mpsc::Receiver<(String, Vec<PeerCandidate>)>>>,
    forward_task: Mutex<Option<JoinHandle<()>>>,

    started: AtomicBool,
}

impl Torrent {
    /// Parses `.torrent` bytes and opens the result.
    pub fn from_bytes(data: &[u8], settings: &Settings) -> Result<Self, ParseError> {
        Ok(Self::open(metainfo::parse_metainfo(data)?, settings))
    }

    /// Wires up managers for a parsed descriptor. Nothing touches the
    /// network until [`Torrent::start`].
    pub fn open(metainfo: Metainfo, settings: &Settings) -> Self {
        let peer_id = PeerId::generate();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (peers_tx, peers_rx): (PeerSink, _) = mpsc::channel(PEER_SINK_CAPACITY);

        let peer_manager = Arc::new(PeerManager::new(
            metainfo.info.hash,
            peer_id,
            metainfo.piece_count(),
            settings.peer.clone(),
            events.clone(),
        ));

        let tracker_manager = Arc::new(TrackerManager::new(
            &metainfo.announce_urls,
            TrackerIdentity {
                info_hash: metainfo.info.hash,
                peer_id,
                port: settings.client_port,
                uploaded: 0,
                downloaded: 0,
                left: metainfo.total_size,
            },
            settings.tracker.clone(),
            peers_tx,
            events.clone(),
        ));

        Self {
            metainfo: Arc::new(metainfo),
            peer_id,
            tracker_manager,
            peer_manager,
            events,
            peers_rx: Mutex::new(Some(peers_rx)),
            forward_task: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    pub fn metainfo(&self) -> &Metainfo {
        &self.metainfo
    }

    pub fn info_hash(&self) -> InfoHash {
        self.metainfo.info.hash
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Subscribes to the push event stream. Slow subscribers lose the
    /// oldest events instead of stalling the loops.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Starts the peer manager, the tracker loops, and the task
    /// forwarding announced peers into the candidate queue.
    pub async fn start(&self) -> Result<(), TrackerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        event!(Level::DEBUG, info_hash = %self.info_hash(), "torrent starting");

        self.peer_manager.start().await;

        if let Some(mut peers_rx) = self.peers_rx.lock().await.take() {
            let peer_manager = Arc::clone(&self.peer_manager);
            let forward = tokio::spawn(async move {
                while let Some((from, peers)) = peers_rx.recv().await {
                    peer_manager.enqueue(&from, peers);
                }
            });
            *self.forward_task.lock().await = Some(forward);
        }

        Arc::clone(&self.tracker_manager).start().await
    }

    /// Forwards progress counters into subsequent announces.
    pub fn update_stats(&self, uploaded: u64, downloaded: u64, left: u64) {
        self.tracker_manager.update_stats(uploaded, downloaded, left);
    }

    /// Stops tracker loops (with best-effort stopped announces), then
    /// all peer sessions. Idempotent.
    pub async fn stop(&self) {
        self.tracker_manager.stop().await;
        self.peer_manager.stop().await;

        if let Some(forward) = self.forward_task.lock().await.take() {
            forward.abort();
            let _ = forward.await;
        }
        event!(Level::DEBUG, info_hash = %self.info_hash(), "torrent stopped");
    }
}
