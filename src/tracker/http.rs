// SPDX-FileCopyrightText: 2026 The ebbtide Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! HTTP(S) tracker transport (BEP 3, with the conventional scrape
//! endpoint).
//!
//! `info_hash` and `peer_id` travel as percent-encoded raw bytes, so the
//! request URL is assembled by hand instead of going through a UTF-8
//! query builder.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use tracing::{event, Level};
use url::Url;

use super::{
    AnnounceEvent, AnnounceRequest, AnnounceResponse, PeerCandidate, ScrapeResponse, ScrapeStats,
    TrackerError,
};
use crate::bencode::{self, Value};
use crate::types::InfoHash;

/// Bytes of an error body we keep for diagnostics.
const ERROR_BODY_LIMIT: usize = 1024;

const V4_PEER_STRIDE: usize = 6;
const V6_PEER_STRIDE: usize = 18;

#[derive(Debug)]
pub struct HttpTracker {
    announce_url: Url,
    client: reqwest::Client,
}

impl HttpTracker {
    pub(crate) fn new(announce_url: Url) -> Self {
        Self {
            announce_url,
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self) -> &str {
        self.announce_url.as_str()
    }

    /// Scrape is a convention, not part of BEP 3: it only exists when the
    /// final path segment begins with "announce".
    pub fn supports_scrape(&self) -> bool {
        last_path_segment(&self.announce_url).starts_with("announce")
    }

    pub async fn announce(
        &self,
        request: &AnnounceRequest,
        deadline: Duration,
    ) -> Result<AnnounceResponse, TrackerError> {
        let url = self.build_announce_url(request);

        let body = tokio::time::timeout(deadline, self.fetch(url))
            .await
            .map_err(|_| TrackerError::Timeout)??;

        parse_announce_response(&body)
    }

    pub async fn scrape(
        &self,
        info_hashes: &[InfoHash],
        deadline: Duration,
    ) -> Result<ScrapeResponse, TrackerError> {
        if !self.supports_scrape() {
            return Err(TrackerError::ScrapeUnsupported);
        }

        let url = self.build_scrape_url(info_hashes);

        let body = tokio::time::timeout(deadline, self.fetch(url))
            .await
            .map_err(|_| TrackerError::Timeout)??;

        parse_scrape_response(&body)
    }

    async fn fetch(&self, url: String) -> Result<Vec<u8>, TrackerError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            let snippet = &body[..body.len().min(ERROR_BODY_LIMIT)];
            return Err(TrackerError::Failure(format!(
                "status {}: {}",
                status,
                String::from_utf8_lossy(snippet)
            )));
        }

        Ok(body.to_vec())
    }

    fn build_announce_url(&self, request: &AnnounceRequest) -> String {
        let mut url = self.announce_url.to_string();
        let mut separator = match self.announce_url.query() {
            Some(_) => '&',
            None => '?',
        };

        let mut push = |key: &str, value: &str| {
            url.push(separator);
            separator = '&';
            url.push_str(key);
            url.push('=');
            url.push_str(value);
        };

        push(
            "info_hash",
            &urlencoding::encode_binary(request.info_hash.as_bytes()),
        );
        push(
            "peer_id",
            &urlencoding::encode_binary(request.peer_id.as_bytes()),
        );
        push("port", &request.port.to_string());
        push("uploaded", &request.uploaded.to_string());
        push("downloaded", &request.downloaded.to_string());
        push("left", &request.left.to_string());
        push("compact", "1");

        if request.num_want > 0 {
            push("numwant", &request.num_want.to_string());
        }
        if request.key != 0 {
            push("key", &request.key.to_string());
        }
        if let Some(ref tracker_id) = request.tracker_id {
            push("trackerid", &urlencoding::encode(tracker_id));
        }
        if request.event != AnnounceEvent::None {
            push("event", &request.event.to_string());
        }

        url
    }

    /// Replaces "announce" with "scrape" in the last path segment and
    /// appends one raw `info_hash` parameter per hash.
    fn build_scrape_url(&self, info_hashes: &[InfoHash]) -> String {
        let mut scrape_url = self.announce_url.clone();
        let scrape_segment = last_path_segment(&self.announce_url).replacen("announce", "scrape", 1);
        let path = self.announce_url.path();
        let parent = &path[..path.rfind('/').map_or(0, |i| i + 1)];
        scrape_url.set_path(&format!("{parent}{scrape_segment}"));

        let mut url = scrape_url.to_string();
        let mut separator = match scrape_url.query() {
            Some(_) => '&',
            None => '?',
        };
        for hash in info_hashes {
            url.push(separator);
            separator = '&';
            url.push_str("info_hash=");
            url.push_str(&urlencoding::encode_binary(hash.as_bytes()));
        }

        url
    }
}

fn last_path_segment(url: &Url) -> &str {
    let path = url.path();
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

fn parse_announce_response(body: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    let root = bencode::from_bytes(body)?;
    let dict = root
        .as_dict()
        .ok_or(TrackerError::MalformedResponse("response is not a dictionary"))?;

    if let Some(reason) = root.get(b"failure reason").and_then(Value::as_bytes) {
        return Err(TrackerError::Failure(
            String::from_utf8_lossy(reason).into_owned(),
        ));
    }

    if let Some(warning) = root.get(b"warning message").and_then(Value::as_bytes) {
        event!(
            Level::WARN,
            warning = %String::from_utf8_lossy(warning),
            "tracker warning"
        );
    }

    let interval = root
        .get(b"interval")
        .and_then(Value::as_int)
        .filter(|&n| n > 0)
        .ok_or(TrackerError::MissingInterval)?;

    let min_interval = root
        .get(b"min interval")
        .and_then(Value::as_int)
        .filter(|&n| n > 0)
        .map(|n| Duration::from_secs(n as u64));

    let seeders = root.get(b"complete").and_then(Value::as_int).unwrap_or(0) as u32;
    let leechers = root.get(b"incomplete").and_then(Value::as_int).unwrap_or(0) as u32;
    let tracker_id = root
        .get(b"tracker id")
        .and_then(Value::as_str)
        .map(str::to_owned);

    // Trackers commonly omit 'peers' when they have none.
    let mut peers = match dict.get(b"peers".as_slice()) {
        None => Vec::new(),
        Some(Value::Bytes(compact)) => parse_compact_peers(compact, V4_PEER_STRIDE)?,
        Some(Value::List(entries)) => parse_dict_peers(entries),
        Some(_) => {
            return Err(TrackerError::MalformedResponse(
                "'peers' is neither a byte string nor a list",
            ))
        }
    };
    if let Some(compact) = root.get(b"peers6").and_then(Value::as_bytes) {
        peers.extend(parse_compact_peers(compact, V6_PEER_STRIDE)?);
    }

    Ok(AnnounceResponse {
        interval: Duration::from_secs(interval as u64),
        min_interval,
        seeders,
        leechers,
        peers,
        tracker_id,
    })
}

fn parse_compact_peers(data: &[u8], stride: usize) -> Result<Vec<PeerCandidate>, TrackerError> {
    if data.len() % stride != 0 {
        return Err(TrackerError::MalformedResponse(
            "compact peer list length is not a multiple of the entry size",
        ));
    }

    let peers = data
        .chunks_exact(stride)
        .map(|chunk| {
            let (ip_bytes, port_bytes) = chunk.split_at(stride - 2);
            let ip: IpAddr = if stride == V4_PEER_STRIDE {
                let octets: [u8; 4] = ip_bytes.try_into().unwrap_or_default();
                Ipv4Addr::from(octets).into()
            } else {
                let octets: [u8; 16] = ip_bytes.try_into().unwrap_or_default();
                Ipv6Addr::from(octets).into()
            };
            let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);
            PeerCandidate { ip, port }
        })
        .collect();

    Ok(peers)
}

/// Non-compact peer list. Malformed entries are skipped, not fatal.
fn parse_dict_peers(entries: &[Value]) -> Vec<PeerCandidate> {
    entries
        .iter()
        .filter_map(|entry| {
            let ip: IpAddr = entry.get(b"ip")?.as_str()?.parse().ok()?;
            let port = entry.get(b"port")?.as_int()?;
            let port = u16::try_from(port).ok().filter(|&p| p > 0)?;
            Some(PeerCandidate { ip, port })
        })
        .collect()
}

fn parse_scrape_response(body: &[u8]) -> Result<ScrapeResponse, TrackerError> {
    let root = bencode::from_bytes(body)?;
    if root.as_dict().is_none() {
        return Err(TrackerError::MalformedResponse(
            "scrape response is not a dictionary",
        ));
    }

    let mut response = ScrapeResponse::default();
    let Some(files) = root.get(b"files").and_then(Value::as_dict) else {
        // Some trackers return empty stats; treat as an empty map.
        return Ok(response);
    };

    for (key, entry) in files {
        // Keys must be raw 20-byte info-hashes; anything else is skipped.
        let Ok(hash_bytes) = <[u8; 20]>::try_from(key.as_slice()) else {
            continue;
        };

        let mut stats = ScrapeStats::default();
        if let Some(n) = entry.get(b"complete").and_then(Value::as_int) {
            stats.seeders = n.max(0) as u32;
        }
        if let Some(n) = entry.get(b"incomplete").and_then(Value::as_int) {
            stats.leechers = n.max(0) as u32;
        }
        if let Some(n) = entry.get(b"downloaded").and_then(Value::as_int) {
            stats.completed = n.max(0) as u32;
        }
        stats.name = entry
            .get(b"name")
            .and_then(Value::as_bytes)
            .map(|b| String::from_utf8_lossy(b).into_owned());

        response.stats.insert(InfoHash(hash_bytes), stats);
    }

    Ok(response)
}
