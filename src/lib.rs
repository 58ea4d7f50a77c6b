// SPDX-FileCopyrightText: 2026 The ebbtide Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! BitTorrent client core.
//!
//! Given a parsed torrent descriptor, this crate discovers peers through
//! HTTP(S) and UDP trackers, maintains long-lived peer sessions over the
//! BitTorrent wire protocol, and exposes lifecycle control plus a push
//! event stream to an embedding host. Piece storage, verification, and
//! selection policy live in a higher layer.

pub mod bencode;
pub mod bitfield;
pub mod config;
pub mod event;
pub mod metainfo;
pub mod peer;
pub mod torrent;
pub mod tracker;
pub mod types;

pub use config::{PeerConfig, Settings, TrackerConfig};
pub use event::Event;
pub use metainfo::{parse_metainfo, FileMode, Info, Metainfo, ParseError};
pub use torrent::Torrent;
pub use types::{InfoHash, PeerId};
