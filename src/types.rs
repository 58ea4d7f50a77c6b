// SPDX-FileCopyrightText: 2026 The ebbtide Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::fmt;

use data_encoding::HEXLOWER;
use rand::Rng;

/// Length in bytes of both info-hashes and peer ids.
pub const ID_LEN: usize = 20;

/// SHA-1 of the canonical bencoding of a torrent's "info" dictionary.
///
/// Equal info-hashes identify the same swarm. The value is stable for the
/// lifetime of the torrent.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash(pub [u8; ID_LEN]);

impl InfoHash {
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }
}

impl From<[u8; ID_LEN]> for InfoHash {
    fn from(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for InfoHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&HEXLOWER.encode(&self.0))
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({self})")
    }
}

/// The 20-byte identifier this client presents to trackers and peers.
///
/// The first eight bytes are the client prefix, the remaining twelve are
/// random. One id is generated per torrent session.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; ID_LEN]);

const CLIENT_PREFIX: &[u8; 8] = b"-EB0001-";

impl PeerId {
    pub fn generate() -> Self {
        const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

        let mut id = [0u8; ID_LEN];
        id[..CLIENT_PREFIX.len()].copy_from_slice(CLIENT_PREFIX);

        let mut rng = rand::rng();
        for byte in id[CLIENT_PREFIX.len()..].iter_mut() {
            *byte = CHARSET[rng.random_range(0..CHARSET.len())];
        }

        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }
}

impl From<[u8; ID_LEN]> for PeerId {
    fn from(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&HEXLOWER.encode(&self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", String::from_utf8_lossy(&self.0))
    }
}
