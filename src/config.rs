// SPDX-FileCopyrightText: 2026 The ebbtide Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use tracing::{event, Level};

/// Tuning for tracker announces and scrapes.
///
/// Durations are stored as plain seconds so the struct round-trips
/// through TOML and environment overrides without custom adapters.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TrackerConfig {
    /// How many peers to ask for in each announce.
    pub num_want: i32,

    /// Scrape cadence; 0 disables the scrape loop.
    pub scrape_every_secs: u64,

    /// Per-request deadline for announces.
    pub announce_timeout_secs: u64,

    /// Starting delay after the first announce failure; doubles on each
    /// subsequent failure.
    pub initial_backoff_secs: u64,

    /// Upper bound on the failure backoff.
    pub max_backoff_secs: u64,

    /// Interval used when the tracker response omits one.
    pub fallback_interval_secs: u64,

    /// Honor the tracker's `min interval` when it exceeds `interval`.
    pub respect_min_interval: bool,

    /// All sleeps are multiplied by a uniform value in [1-f, 1+f] so
    /// clients do not announce in lock-step.
    pub jitter_fraction: f64,

    /// Deadline for the final "stopped" announce during shutdown.
    pub stopped_timeout_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            num_want: 100,
            scrape_every_secs: 0,
            announce_timeout_secs: 12,
            initial_backoff_secs: 10,
            max_backoff_secs: 15 * 60,
            fallback_interval_secs: 30 * 60,
            respect_min_interval: true,
            jitter_fraction: 0.10,
            stopped_timeout_secs: 5,
        }
    }
}

impl TrackerConfig {
    pub fn scrape_every(&self) -> Duration {
        Duration::from_secs(self.scrape_every_secs)
    }

    pub fn announce_timeout(&self) -> Duration {
        Duration::from_secs(self.announce_timeout_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_secs(self.initial_backoff_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn fallback_interval(&self) -> Duration {
        Duration::from_secs(self.fallback_interval_secs)
    }

    pub fn stopped_timeout(&self) -> Duration {
        Duration::from_secs(self.stopped_timeout_secs)
    }
}

/// Tuning for the peer manager and per-peer sessions.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PeerConfig {
    /// Cap on concurrently admitted peer sessions.
    pub max_peers: usize,

    /// Number of dial workers consuming the candidate queue.
    pub dial_workers: usize,

    /// Candidate queue depth; overflow is dropped silently, trackers
    /// re-announce.
    pub candidate_queue: usize,

    /// Per-peer outbound mailbox depth.
    pub mailbox_capacity: usize,

    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub keep_alive_secs: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            max_peers: 100,
            dial_workers: 50,
            candidate_queue: 1000,
            mailbox_capacity: 128,
            read_timeout_secs: 120,
            write_timeout_secs: 30,
            handshake_timeout_secs: 10,
            keep_alive_secs: 30,
        }
    }
}

impl PeerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

/// Host-supplied configuration for a torrent session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// TCP port advertised to trackers for incoming peers.
    pub client_port: u16,

    pub tracker: TrackerConfig,
    pub peer: PeerConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            client_port: 6881,
            tracker: TrackerConfig::default(),
            peer: PeerConfig::default(),
        }
    }
}

/// Loads settings from a TOML file merged with `EBBTIDE_`-prefixed
/// environment variables. Falls back to defaults on any load error.
pub fn load_settings(config_file: &Path) -> Settings {
    match Figment::new()
        .merge(Toml::file(config_file))
        .merge(Env::prefixed("EBBTIDE_").split("__"))
        .extract::<Settings>()
    {
        Ok(settings) => settings,
        Err(e) => {
            event!(
                Level::ERROR,
                path = %config_file.display(),
                error = %e,
                "failed to load settings, using defaults"
            );
            Settings::default()
        }
    }
}
