// SPDX-FileCopyrightText: 2026 The ebbtide Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Tracker transports and the announce/scrape manager.
//!
//! A tracker is reached over HTTP(S) (BEP 3) or UDP (BEP 15). Both
//! transports sit behind the [`Tracker`] sum type so the manager can
//! drive either through the same capability set: `url`,
//! `supports_scrape`, `announce`, `scrape`.

pub mod http;
pub mod manager;
pub mod udp;

pub use http::HttpTracker;
pub use manager::TrackerManager;
pub use udp::UdpTracker;

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use strum_macros::Display;
use thiserror::Error;
use url::Url;

use crate::bencode::BencodeError;
use crate::types::{InfoHash, PeerId};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker: invalid announce url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("tracker: unsupported url scheme {0:?}")]
    UnsupportedScheme(String),
    #[error("tracker: request timed out")]
    Timeout,
    #[error("tracker: http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("tracker: i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("tracker: rejected: {0}")]
    Failure(String),
    #[error("tracker: response missing or invalid 'interval'")]
    MissingInterval,
    #[error("tracker: malformed response: {0}")]
    MalformedResponse(&'static str),
    #[error("tracker: {0}")]
    Bencode(#[from] BencodeError),
    #[error("tracker: udp response mismatch (action={action}, txn={txn})")]
    Mismatch { action: u32, txn: u32 },
    #[error("tracker: scrape is not supported by this transport")]
    ScrapeUnsupported,
    #[error("tracker: no usable trackers")]
    NoTrackers,
}

/// Lifecycle transitions reported to trackers (BEP 3).
///
/// The `Display` form is the HTTP query value; `code` is the UDP wire
/// value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
#[strum(serialize_all = "lowercase")]
pub enum AnnounceEvent {
    #[default]
    None,
    Started,
    Stopped,
    Completed,
}

impl AnnounceEvent {
    pub fn code(self) -> u32 {
        match self {
            AnnounceEvent::None => 0,
            AnnounceEvent::Started => 1,
            AnnounceEvent::Stopped => 2,
            AnnounceEvent::Completed => 3,
        }
    }
}

/// Parameters of a single announce request.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,

    /// The TCP port we accept incoming peers on.
    pub port: u16,

    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,

    pub event: AnnounceEvent,

    /// Desired number of peers; trackers may ignore or cap it.
    pub num_want: i32,

    /// Client-generated key letting the tracker match future announces.
    pub key: u32,

    /// Opaque id previously returned by this tracker, echoed back.
    pub tracker_id: Option<String>,
}

/// A successful announce: tracker directives plus peer candidates.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnounceResponse {
    /// Recommended delay before the next regular announce. Always > 0.
    pub interval: Duration,

    /// Minimum allowed delay between announces, when given.
    pub min_interval: Option<Duration>,

    pub seeders: u32,
    pub leechers: u32,

    pub peers: Vec<PeerCandidate>,

    pub tracker_id: Option<String>,
}

/// A peer address returned by a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerCandidate {
    pub ip: IpAddr,
    pub port: u16,
}

impl PeerCandidate {
    /// Canonical `host:port` form; IPv6 hosts are bracketed. This string
    /// keys the peer manager's admission table.
    pub fn addr(&self) -> String {
        SocketAddr::new(self.ip, self.port).to_string()
    }
}

impl fmt::Display for PeerCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", SocketAddr::new(self.ip, self.port))
    }
}

/// Aggregate swarm counts for one torrent, from a scrape.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScrapeStats {
    pub seeders: u32,
    pub leechers: u32,
    /// Times the torrent has been downloaded to completion.
    pub completed: u32,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScrapeResponse {
    pub stats: HashMap<InfoHash, ScrapeStats>,
}

/// A tracker transport. HTTP(S) and UDP are dispatched through this sum
/// type; both are safe to call serially from a single owner.
#[derive(Debug)]
pub enum Tracker {
    Http(HttpTracker),
    Udp(UdpTracker),
}

impl Tracker {
    pub fn new(announce_url: &str) -> Result<Self, TrackerError> {
        let url = Url::parse(announce_url).map_err(|e| TrackerError::InvalidUrl {
            url: announce_url.to_owned(),
            reason: e.to_string(),
        })?;

        match url.scheme() {
            "http" | "https" => Ok(Tracker::Http(HttpTracker::new(url))),
            "udp" => Ok(Tracker::Udp(UdpTracker::new(url)?)),
            other => Err(TrackerError::UnsupportedScheme(other.to_owned())),
        }
    }

    pub fn url(&self) -> &str {
        match self {
            Tracker::Http(t) => t.url(),
            Tracker::Udp(t) => t.url(),
        }
    }

    pub fn supports_scrape(&self) -> bool {
        match self {
            Tracker::Http(t) => t.supports_scrape(),
            Tracker::Udp(t) => t.supports_scrape(),
        }
    }

    /// Announces within `deadline`. Cancellation surfaces as
    /// [`TrackerError::Timeout`] and never leaks sockets.
    pub async fn announce(
        &self,
        request: &AnnounceRequest,
        deadline: Duration,
    ) -> Result<AnnounceResponse, TrackerError> {
        match self {
            Tracker::Http(t) => t.announce(request, deadline).await,
            Tracker::Udp(t) => t.announce(request, deadline).await,
        }
    }

    pub async fn scrape(
        &self,
        info_hashes: &[InfoHash],
        deadline: Duration,
    ) -> Result<ScrapeResponse, TrackerError> {
        match self {
            Tracker::Http(t) => t.scrape(info_hashes, deadline).await,
            Tracker::Udp(t) => t.scrape(info_hashes, deadline).await,
        }
    }
}
