// SPDX-FileCopyrightText: 2026 The ebbtide Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Announce and scrape loops for all of a torrent's trackers.
//!
//! Each tracker gets an independent loop: a failing tracker backs off by
//! itself and never blocks the others. Peers from successful announces
//! are pushed to the peer manager through a bounded sink; stats are read
//! atomically before every request so the host can update them at any
//! time.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{event, Level};

use super::{
    AnnounceEvent, AnnounceRequest, PeerCandidate, ScrapeResponse, Tracker, TrackerError,
};
use crate::config::TrackerConfig;
use crate::event::{emit, Event, EventSender};
use crate::types::{InfoHash, PeerId};

/// Batches of peer candidates handed to the peer manager, tagged with
/// the announce URL they came from.
pub type PeerSink = mpsc::Sender<(String, Vec<PeerCandidate>)>;

/// What the manager announces on behalf of: swarm identity plus the
/// initial progress counters.
#[derive(Debug, Clone)]
pub struct TrackerIdentity {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

pub struct TrackerManager {
    cfg: TrackerConfig,
    trackers: Vec<Arc<Tracker>>,

    info_hash: InfoHash,
    peer_id: PeerId,
    port: u16,

    /// Announce key, constant for the manager's lifetime.
    key: u32,

    uploaded: AtomicU64,
    downloaded: AtomicU64,
    left: AtomicU64,

    closed: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,

    peers_tx: PeerSink,
    events: EventSender,

    tasks: Mutex<JoinSet<()>>,
}

impl TrackerManager {
    /// Builds one transport per announce URL. URLs that fail to parse or
    /// use an unsupported scheme are skipped with a warning; the torrent
    /// still works off the remaining trackers.
    pub fn new(
        announce_urls: &[String],
        identity: TrackerIdentity,
        cfg: TrackerConfig,
        peers_tx: PeerSink,
        events: EventSender,
    ) -> Self {
        let mut trackers = Vec::with_capacity(announce_urls.len());
        for url in announce_urls {
            match Tracker::new(url) {
                Ok(tracker) => {
                    event!(Level::DEBUG, url = %url, "tracker added");
                    trackers.push(Arc::new(tracker));
                }
                Err(e) => {
                    event!(Level::WARN, url = %url, error = %e, "tracker init failed");
                }
            }
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            cfg,
            trackers,
            info_hash: identity.info_hash,
            peer_id: identity.peer_id,
            port: identity.port,
            key: rand::rng().random(),
            uploaded: AtomicU64::new(identity.uploaded),
            downloaded: AtomicU64::new(identity.downloaded),
            left: AtomicU64::new(identity.left),
            closed: AtomicBool::new(false),
            shutdown_tx,
            peers_tx,
            events,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub fn tracker_urls(&self) -> Vec<&str> {
        self.trackers.iter().map(|t| t.url()).collect()
    }

    /// Atomically updates the progress counters included in subsequent
    /// announces.
    pub fn update_stats(&self, uploaded: u64, downloaded: u64, left: u64) {
        self.uploaded.store(uploaded, Ordering::Relaxed);
        self.downloaded.store(downloaded, Ordering::Relaxed);
        self.left.store(left, Ordering::Relaxed);
    }

    /// Launches one announce loop per tracker, plus a scrape loop where
    /// enabled and supported.
    pub async fn start(self: Arc<Self>) -> Result<(), TrackerError> {
        if self.trackers.is_empty() {
            event!(Level::WARN, info_hash = %self.info_hash, "no trackers to start");
            return Err(TrackerError::NoTrackers);
        }

        // Receivers are subscribed here, not inside the tasks, so a
        // stop() racing a freshly spawned loop cannot slip past it.
        let mut tasks = self.tasks.lock().await;
        for tracker in &self.trackers {
            event!(Level::DEBUG, url = %tracker.url(), "announce loop starting");
            tasks.spawn(announce_loop(
                Arc::clone(&self),
                Arc::clone(tracker),
                self.shutdown_tx.subscribe(),
            ));

            if !self.cfg.scrape_every().is_zero() && tracker.supports_scrape() {
                event!(Level::DEBUG, url = %tracker.url(), "scrape loop starting");
                tasks.spawn(scrape_loop(
                    Arc::clone(&self),
                    Arc::clone(tracker),
                    self.shutdown_tx.subscribe(),
                ));
            }
        }

        Ok(())
    }

    /// Signals every loop to stop and waits for them to finish. Each
    /// loop makes one best-effort "stopped" announce on the way out.
    /// Idempotent.
    pub async fn stop(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());

        let mut tasks = self.tasks.lock().await;
        while tasks.join_next().await.is_some() {}
        event!(Level::DEBUG, "tracker manager stopped");
    }

    /// On-demand scrape of every scrape-capable tracker.
    pub async fn scrape(
        &self,
        deadline: Duration,
    ) -> Vec<(String, Result<ScrapeResponse, TrackerError>)> {
        let mut results = Vec::new();
        for tracker in self.trackers.iter().filter(|t| t.supports_scrape()) {
            let result = tracker.scrape(&[self.info_hash], deadline).await;
            results.push((tracker.url().to_owned(), result));
        }
        results
    }

    fn build_request(&self, event: AnnounceEvent, tracker_id: Option<String>) -> AnnounceRequest {
        AnnounceRequest {
            info_hash: self.info_hash,
            peer_id: self.peer_id,
            port: self.port,
            uploaded: self.uploaded.load(Ordering::Relaxed),
            downloaded: self.downloaded.load(Ordering::Relaxed),
            left: self.left.load(Ordering::Relaxed),
            event,
            num_want: if event == AnnounceEvent::Stopped {
                0
            } else {
                self.cfg.num_want
            },
            key: self.key,
            tracker_id,
        }
    }

    async fn send_stopped(&self, tracker: &Tracker) {
        let request = self.build_request(AnnounceEvent::Stopped, None);
        match tracker.announce(&request, self.cfg.stopped_timeout()).await {
            Ok(_) => event!(Level::DEBUG, url = %tracker.url(), "stopped event sent"),
            // Best effort only; shutdown proceeds regardless.
            Err(e) => {
                event!(Level::DEBUG, url = %tracker.url(), error = %e, "stopped announce failed")
            }
        }
    }
}

async fn announce_loop(
    manager: Arc<TrackerManager>,
    tracker: Arc<Tracker>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut announce_event = AnnounceEvent::Started;
    let mut completed_sent = false;
    let mut backoff = manager.cfg.initial_backoff();
    let mut tracker_id: Option<String> = None;

    loop {
        // Exactly one completed announce, the first time left hits zero.
        if announce_event == AnnounceEvent::None
            && !completed_sent
            && manager.left.load(Ordering::Relaxed) == 0
        {
            announce_event = AnnounceEvent::Completed;
            completed_sent = true;
        }

        let request = manager.build_request(announce_event, tracker_id.clone());
        event!(
            Level::DEBUG,
            url = %tracker.url(),
            announce_event = %announce_event,
            num_want = request.num_want,
            "announce attempt"
        );

        let result = tokio::select! {
            _ = shutdown_rx.recv() => {
                manager.send_stopped(&tracker).await;
                return;
            }
            result = tracker.announce(&request, manager.cfg.announce_timeout()) => result,
        };

        let sleep_for = match result {
            Ok(response) => {
                event!(
                    Level::DEBUG,
                    url = %tracker.url(),
                    interval = response.interval.as_secs(),
                    peers = response.peers.len(),
                    "announce success"
                );

                backoff = manager.cfg.initial_backoff();
                if response.tracker_id.is_some() {
                    tracker_id = response.tracker_id.clone();
                }

                emit(
                    &manager.events,
                    Event::TrackerAnnounce {
                        url: tracker.url().to_owned(),
                        seeders: response.seeders,
                        leechers: response.leechers,
                        interval: response.interval,
                        min_interval: response.min_interval,
                        peer_count: response.peers.len(),
                    },
                );

                let next = effective_interval(
                    &manager.cfg,
                    response.interval,
                    response.min_interval,
                );

                // The sink takes ownership of the batch; a full sink
                // drops it, trackers re-announce soon enough.
                if !response.peers.is_empty() {
                    let batch = (tracker.url().to_owned(), response.peers);
                    if manager.peers_tx.try_send(batch).is_err() {
                        event!(Level::DEBUG, url = %tracker.url(), "peer sink full, dropping batch");
                    }
                }

                announce_event = AnnounceEvent::None;
                next
            }
            Err(e) => {
                event!(Level::WARN, url = %tracker.url(), error = %e, "announce failed");
                let delay = backoff;
                backoff = next_backoff(&manager.cfg, backoff);
                // Retries never replay started or completed.
                announce_event = AnnounceEvent::None;
                delay
            }
        };

        let sleep_for = jitter(&manager.cfg, sleep_for);
        tokio::select! {
            _ = shutdown_rx.recv() => {
                manager.send_stopped(&tracker).await;
                return;
            }
            _ = tokio::time::sleep(sleep_for) => {}
        }
    }
}

async fn scrape_loop(
    manager: Arc<TrackerManager>,
    tracker: Arc<Tracker>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => return,
            _ = tokio::time::sleep(jitter(&manager.cfg, manager.cfg.scrape_every())) => {}
        }

        match tracker
            .scrape(&[manager.info_hash], manager.cfg.announce_timeout())
            .await
        {
            Ok(response) => {
                let stats = response.stats.get(&manager.info_hash);
                event!(
                    Level::DEBUG,
                    url = %tracker.url(),
                    seeders = stats.map_or(0, |s| s.seeders),
                    leechers = stats.map_or(0, |s| s.leechers),
                    completed = stats.map_or(0, |s| s.completed),
                    "scrape success"
                );
            }
            Err(e) => {
                event!(Level::DEBUG, url = %tracker.url(), error = %e, "scrape failed");
            }
        }
    }
}

/// The tracker's interval, raised to `min interval` when the config says
/// to respect it.
fn effective_interval(
    cfg: &TrackerConfig,
    interval: Duration,
    min_interval: Option<Duration>,
) -> Duration {
    match min_interval {
        Some(min) if cfg.respect_min_interval && min > interval => min,
        _ => interval,
    }
}

fn next_backoff(cfg: &TrackerConfig, current: Duration) -> Duration {
    (current * 2).min(cfg.max_backoff())
}

/// Multiplies `d` by a uniform factor in [1-f, 1+f]. A zero duration
/// falls back to the configured interval so a loop never spins.
fn jitter(cfg: &TrackerConfig, d: Duration) -> Duration {
    let d = if d.is_zero() {
        cfg.fallback_interval()
    } else {
        d
    };

    let f = cfg.jitter_fraction;
    if f <= 0.0 {
        return d;
    }

    let (lo, hi) = (d.as_secs_f64() * (1.0 - f), d.as_secs_f64() * (1.0 + f));
    Duration::from_secs_f64(lo + rand::rng().random::<f64>() * (hi - lo))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EVENT_CHANNEL_CAPACITY;
    use std::sync::Mutex as StdMutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn identity() -> TrackerIdentity {
        TrackerIdentity {
            info_hash: InfoHash([0x21; 20]),
            peer_id: PeerId(*b"-EB0001-qrstuvwxyzab"),
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 1000,
        }
    }

    fn manager_with(
        urls: &[String],
        cfg: TrackerConfig,
    ) -> (
        Arc<TrackerManager>,
        mpsc::Receiver<(String, Vec<PeerCandidate>)>,
        broadcast::Receiver<Event>,
    ) {
        let (peers_tx, peers_rx) = mpsc::channel(16);
        let (events_tx, events_rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let manager = Arc::new(TrackerManager::new(
            urls,
            identity(),
            cfg,
            peers_tx,
            events_tx,
        ));
        (manager, peers_rx, events_rx)
    }

    #[test]
    fn jitter_stays_within_the_configured_band() {
        let cfg = TrackerConfig {
            jitter_fraction: 0.10,
            ..TrackerConfig::default()
        };
        let base = Duration::from_secs(100);
        for _ in 0..200 {
            let jittered = jitter(&cfg, base);
            assert!(jittered >= Duration::from_secs(90), "{jittered:?}");
            assert!(jittered <= Duration::from_secs(110), "{jittered:?}");
        }
    }

    #[test]
    fn zero_jitter_is_identity_and_zero_duration_falls_back() {
        let cfg = TrackerConfig {
            jitter_fraction: 0.0,
            ..TrackerConfig::default()
        };
        assert_eq!(jitter(&cfg, Duration::from_secs(42)), Duration::from_secs(42));
        assert_eq!(jitter(&cfg, Duration::ZERO), cfg.fallback_interval());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let cfg = TrackerConfig::default();
        let mut backoff = cfg.initial_backoff();
        backoff = next_backoff(&cfg, backoff);
        assert_eq!(backoff, Duration::from_secs(20));
        backoff = next_backoff(&cfg, backoff);
        assert_eq!(backoff, Duration::from_secs(40));
        for _ in 0..10 {
            backoff = next_backoff(&cfg, backoff);
        }
        assert_eq!(backoff, cfg.max_backoff());
    }

    #[test]
    fn min_interval_clamps_only_when_respected() {
        let respect = TrackerConfig::default();
        let ignore = TrackerConfig {
            respect_min_interval: false,
            ..TrackerConfig::default()
        };
        let interval = Duration::from_secs(60);

        assert_eq!(
            effective_interval(&respect, interval, Some(Duration::from_secs(120))),
            Duration::from_secs(120)
        );
        assert_eq!(
            effective_interval(&respect, interval, Some(Duration::from_secs(30))),
            interval
        );
        assert_eq!(effective_interval(&respect, interval, None), interval);
        assert_eq!(
            effective_interval(&ignore, interval, Some(Duration::from_secs(120))),
            interval
        );
    }

    #[test]
    fn skips_unusable_announce_urls() {
        let urls = vec![
            "not a url".to_owned(),
            "wss://nope.example/announce".to_owned(),
            "http://ok.example/announce".to_owned(),
        ];
        let (manager, _peers, _events) = manager_with(&urls, TrackerConfig::default());
        assert_eq!(manager.tracker_urls(), vec!["http://ok.example/announce"]);
    }

    #[tokio::test]
    async fn start_fails_without_usable_trackers() {
        let (manager, _peers, _events) = manager_with(&[], TrackerConfig::default());
        assert!(matches!(
            Arc::clone(&manager).start().await,
            Err(TrackerError::NoTrackers)
        ));
    }

    /// Minimal HTTP tracker: serves a canned announce response and
    /// records the query string of every request it sees.
    async fn stub_http_tracker(
        listener: TcpListener,
        queries: Arc<StdMutex<Vec<String>>>,
        body: &'static [u8],
    ) {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let mut request = Vec::new();
            let mut buf = [0u8; 2048];
            loop {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        request.extend_from_slice(&buf[..n]);
                        if request.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                }
            }
            if let Some(line) = request.split(|&b| b == b'\r').next() {
                queries
                    .lock()
                    .unwrap()
                    .push(String::from_utf8_lossy(line).into_owned());
            }
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.write_all(body).await;
        }
    }

    #[tokio::test]
    async fn announce_loop_delivers_peers_then_sends_stopped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let queries = Arc::new(StdMutex::new(Vec::new()));
        tokio::spawn(stub_http_tracker(
            listener,
            Arc::clone(&queries),
            b"d8:intervali1e5:peers6:\x0a\x00\x00\x01\x1a\xe1e",
        ));

        let cfg = TrackerConfig {
            jitter_fraction: 0.0,
            ..TrackerConfig::default()
        };
        let (manager, mut peers_rx, mut events_rx) =
            manager_with(&[format!("http://{addr}/announce")], cfg);
        Arc::clone(&manager).start().await.unwrap();

        let (from, peers) = tokio::time::timeout(Duration::from_secs(5), peers_rx.recv())
            .await
            .expect("timed out waiting for peers")
            .expect("peer sink closed");
        assert_eq!(from, format!("http://{addr}/announce"));
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].addr(), "10.0.0.1:6881");

        let announce_event = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        match announce_event {
            Event::TrackerAnnounce {
                interval,
                peer_count,
                ..
            } => {
                assert_eq!(interval, Duration::from_secs(1));
                assert_eq!(peer_count, 1);
            }
            other => panic!("unexpected event {other:?}"),
        }

        manager.stop().await;

        let recorded = queries.lock().unwrap().clone();
        assert!(!recorded.is_empty());
        assert!(
            recorded[0].contains("event=started"),
            "first announce must carry started: {recorded:?}"
        );
        assert!(
            recorded.last().unwrap().contains("event=stopped"),
            "final announce must carry stopped: {recorded:?}"
        );
        assert!(
            recorded.last().unwrap().contains("GET /announce?"),
            "{recorded:?}"
        );
    }

    #[tokio::test]
    async fn on_demand_scrape_queries_capable_trackers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let queries = Arc::new(StdMutex::new(Vec::new()));
        // The identity info hash is twenty 0x21 bytes, i.e. twenty '!'.
        tokio::spawn(stub_http_tracker(
            listener,
            Arc::clone(&queries),
            b"d5:filesd20:!!!!!!!!!!!!!!!!!!!!d8:completei3e10:incompletei1e10:downloadedi9eeee",
        ));

        let (manager, _peers, _events) = manager_with(
            &[format!("http://{addr}/announce")],
            TrackerConfig::default(),
        );

        let results = manager.scrape(Duration::from_secs(5)).await;
        assert_eq!(results.len(), 1);
        let response = results[0].1.as_ref().unwrap();
        let stats = &response.stats[&InfoHash([0x21; 20])];
        assert_eq!(stats.seeders, 3);
        assert_eq!(stats.leechers, 1);
        assert_eq!(stats.completed, 9);

        assert!(queries.lock().unwrap()[0].contains("GET /scrape?info_hash="));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let queries = Arc::new(StdMutex::new(Vec::new()));
        tokio::spawn(stub_http_tracker(
            listener,
            Arc::clone(&queries),
            b"d8:intervali1ee",
        ));

        let cfg = TrackerConfig {
            jitter_fraction: 0.0,
            ..TrackerConfig::default()
        };
        let (manager, _peers_rx, mut events_rx) =
            manager_with(&[format!("http://{addr}/announce")], cfg);
        Arc::clone(&manager).start().await.unwrap();

        // First announce has gone through once we see its event.
        let _ = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .expect("timed out waiting for announce");

        manager.stop().await;
        manager.stop().await;

        let stopped_count = queries
            .lock()
            .unwrap()
            .iter()
            .filter(|q| q.contains("event=stopped"))
            .count();
        assert_eq!(stopped_count, 1);
    }
}
