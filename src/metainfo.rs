// SPDX-FileCopyrightText: 2026 The ebbtide Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Torrent descriptor parsing.
//!
//! Converts the bencoded contents of a `.torrent` file into a typed
//! [`Metainfo`]. The info-hash is computed by re-encoding the decoded
//! "info" dictionary with the canonical encoder; the codec round-trip is
//! byte-identical for conformant input, which is what makes the hash
//! stable.

use chrono::{DateTime, TimeZone, Utc};
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::bencode::{self, Value};
use crate::types::InfoHash;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("metainfo: {0}")]
    Bencode(#[from] bencode::BencodeError),
    #[error("metainfo: top-level value is not a dictionary")]
    NotADictionary,
    #[error("metainfo: missing or invalid 'info' dictionary")]
    MissingInfo,
    #[error("metainfo: missing or invalid '{0}'")]
    InvalidField(&'static str),
    #[error("metainfo: 'pieces' length is not a multiple of 20 bytes")]
    PiecesLength,
    #[error("metainfo: file entry {0} is malformed")]
    InvalidFileEntry(usize),
}

/// Top-level torrent descriptor (BEP 3). Immutable once parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct Metainfo {
    pub info: Info,

    /// All tracker announce URLs, flattened across announce-list tiers in
    /// order, de-duplicated. May be empty; the tracker manager rejects an
    /// empty list at start-up.
    pub announce_urls: Vec<String>,

    pub creation_date: Option<DateTime<Utc>>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub encoding: Option<String>,

    pub mode: FileMode,

    /// Total payload size: the single file's length, or the sum of all
    /// file lengths in multi-file mode.
    pub total_size: u64,
}

/// The "info" dictionary: payload description and piece layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Info {
    /// SHA-1 of the canonical bencoding of this dictionary; the swarm
    /// identifier.
    pub hash: InfoHash,

    pub name: String,

    /// Bytes per piece; all pieces except the last are this size.
    pub piece_length: u64,

    /// Per-piece SHA-1 hashes, in order.
    pub pieces: Vec<[u8; 20]>,

    /// File entries in multi-file mode, `None` for single-file torrents.
    pub files: Option<Vec<FileEntry>>,

    /// BEP 27: restrict peer discovery to the metainfo's trackers.
    pub private: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    pub length: u64,
    /// Relative path as ordered elements, e.g. `["dir", "file.ext"]`.
    pub path: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Single,
    Multiple,
}

impl Metainfo {
    pub fn piece_count(&self) -> usize {
        self.info.pieces.len()
    }
}

/// Parses the raw bytes of a `.torrent` file.
pub fn parse_metainfo(data: &[u8]) -> Result<Metainfo, ParseError> {
    let root = bencode::from_bytes(data)?;
    let Value::Dict(ref top) = root else {
        return Err(ParseError::NotADictionary);
    };

    let info_value = top.get(b"info".as_slice()).ok_or(ParseError::MissingInfo)?;
    let (info, total_size) = parse_info(info_value)?;

    let mode = match info.files {
        Some(_) => FileMode::Multiple,
        None => FileMode::Single,
    };

    Ok(Metainfo {
        info,
        announce_urls: parse_announce_urls(&root),
        creation_date: root
            .get(b"creation date")
            .and_then(Value::as_int)
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        comment: string_field(&root, b"comment"),
        created_by: string_field(&root, b"created by"),
        encoding: string_field(&root, b"encoding"),
        mode,
        total_size,
    })
}

fn parse_info(info_value: &Value) -> Result<(Info, u64), ParseError> {
    let Value::Dict(info) = info_value else {
        return Err(ParseError::MissingInfo);
    };

    let hash = InfoHash(Sha1::digest(bencode::to_bytes(info_value)).into());

    let piece_length = info
        .get(b"piece length".as_slice())
        .and_then(Value::as_int)
        .filter(|&n| n > 0)
        .ok_or(ParseError::InvalidField("piece length"))? as u64;

    let pieces_raw = info
        .get(b"pieces".as_slice())
        .and_then(Value::as_bytes)
        .ok_or(ParseError::InvalidField("pieces"))?;
    if pieces_raw.len() % 20 != 0 {
        return Err(ParseError::PiecesLength);
    }
    let pieces = pieces_raw
        .chunks_exact(20)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect();

    let (files, total_size) = parse_files_section(info)?;

    let name = info
        .get(b"name".as_slice())
        .and_then(Value::as_bytes)
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_default();

    let private = info
        .get(b"private".as_slice())
        .and_then(Value::as_int)
        .is_some_and(|v| v == 1);

    let info = Info {
        hash,
        name,
        piece_length,
        pieces,
        files,
        private,
    };
    Ok((info, total_size))
}

/// "files" presence decides multi-file mode; otherwise a non-negative
/// "length" gives single-file mode. One of the two must hold.
fn parse_files_section(
    info: &std::collections::BTreeMap<Vec<u8>, Value>,
) -> Result<(Option<Vec<FileEntry>>, u64), ParseError> {
    if let Some(files_value) = info.get(b"files".as_slice()) {
        let entries = files_value
            .as_list()
            .ok_or(ParseError::InvalidField("files"))?;

        let mut files = Vec::with_capacity(entries.len());
        let mut total = 0u64;
        for (i, entry) in entries.iter().enumerate() {
            let file = parse_file_entry(entry).ok_or(ParseError::InvalidFileEntry(i))?;
            total += file.length;
            files.push(file);
        }
        return Ok((Some(files), total));
    }

    let length = info
        .get(b"length".as_slice())
        .and_then(Value::as_int)
        .filter(|&n| n >= 0)
        .ok_or(ParseError::InvalidField("length"))?;
    Ok((None, length as u64))
}

fn parse_file_entry(entry: &Value) -> Option<FileEntry> {
    let length = entry.get(b"length").and_then(Value::as_int)?;
    if length < 0 {
        return None;
    }

    let path_elements = entry.get(b"path").and_then(Value::as_list)?;
    if path_elements.is_empty() {
        return None;
    }

    let mut path = Vec::with_capacity(path_elements.len());
    for element in path_elements {
        let bytes = element.as_bytes()?;
        if bytes.is_empty() {
            return None;
        }
        path.push(String::from_utf8_lossy(bytes).into_owned());
    }

    Some(FileEntry {
        length: length as u64,
        path,
    })
}

/// Flattens announce-list tiers in order, dropping empty strings and
/// duplicates; falls back to the single "announce" string.
fn parse_announce_urls(root: &Value) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();

    if let Some(tiers) = root.get(b"announce-list").and_then(Value::as_list) {
        for tier in tiers {
            // Skip invalid tier shapes.
            let Some(tier) = tier.as_list() else {
                continue;
            };
            for url in tier {
                let Some(url) = url.as_str() else {
                    continue;
                };
                if url.is_empty() || urls.iter().any(|seen| seen == url) {
                    continue;
                }
                urls.push(url.to_owned());
            }
        }
    }

    if urls.is_empty() {
        if let Some(announce) = root.get(b"announce").and_then(Value::as_str) {
            if !announce.is_empty() {
                urls.push(announce.to_owned());
            }
        }
    }

    urls
}

fn string_field(root: &Value, key: &[u8]) -> Option<String> {
    root.get(key)
        .and_then(Value::as_bytes)
        .map(|b| String::from_utf8_lossy(b).into_owned())
}
