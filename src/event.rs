// SPDX-FileCopyrightText: 2026 The ebbtide Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Push events surfaced to the embedding host.
//!
//! Emission is non-blocking: events fan out over a bounded broadcast
//! channel, and a lagging subscriber loses the oldest entries rather
//! than stalling any loop.

use std::time::Duration;

use tokio::sync::broadcast;

pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A successful announce to one tracker.
    TrackerAnnounce {
        url: String,
        seeders: u32,
        leechers: u32,
        interval: Duration,
        min_interval: Option<Duration>,
        peer_count: usize,
    },

    /// A peer session passed the handshake and its tasks are running.
    PeerStarted { addr: String },

    /// A peer session ended (stop, read/write error, or remote close).
    PeerStopped { addr: String },

    /// A wire message arrived from a peer.
    PeerMessage { addr: String, kind: String },
}

pub(crate) type EventSender = broadcast::Sender<Event>;

/// Sends without blocking; a send with no live subscribers is fine.
pub(crate) fn emit(events: &EventSender, event: Event) {
    let _ = events.send(event);
}
