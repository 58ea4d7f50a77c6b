// SPDX-FileCopyrightText: 2026 The ebbtide Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! UDP tracker transport (BEP 15).
//!
//! Announces ride a three-packet exchange on a connected socket: a
//! connect handshake yields a connection id, which authorizes the
//! announce proper. Lost datagrams are retransmitted with exponentially
//! growing timeouts and a fresh transaction id each time.

use std::net::SocketAddr;
use std::time::Duration;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{event, Level};
use url::Url;

use super::{
    AnnounceRequest, AnnounceResponse, PeerCandidate, ScrapeResponse, TrackerError,
};
use crate::types::InfoHash;

const PROTOCOL_MAGIC: u64 = 0x0417_2710_1980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

/// A connection id is valid for one minute after the connect exchange.
const CONNECTION_ID_TTL: Duration = Duration::from_secs(60);

const DEFAULT_RETRY_BASE: Duration = Duration::from_secs(15);
const DEFAULT_MAX_RETRIES: u32 = 8;

const CONNECT_REQUEST_LEN: usize = 16;
const ANNOUNCE_REQUEST_LEN: usize = 98;
const ANNOUNCE_HEADER_LEN: usize = 20;

const V4_PEER_STRIDE: usize = 6;
const V6_PEER_STRIDE: usize = 18;

#[derive(Debug)]
struct CachedConnection {
    id: u64,
    acquired_at: Instant,
}

#[derive(Debug)]
pub struct UdpTracker {
    announce_url: String,
    target: String,

    /// Announce key, fixed for the transport's lifetime.
    key: u32,

    retry_base: Duration,
    max_retries: u32,

    connection: Mutex<Option<CachedConnection>>,
}

impl UdpTracker {
    pub(crate) fn new(url: Url) -> Result<Self, TrackerError> {
        let host = url.host_str().ok_or_else(|| TrackerError::InvalidUrl {
            url: url.to_string(),
            reason: "missing host".to_owned(),
        })?;
        let port = url.port().ok_or_else(|| TrackerError::InvalidUrl {
            url: url.to_string(),
            reason: "missing port".to_owned(),
        })?;

        Ok(Self {
            target: format!("{host}:{port}"),
            announce_url: url.to_string(),
            key: rand::rng().random(),
            retry_base: DEFAULT_RETRY_BASE,
            max_retries: DEFAULT_MAX_RETRIES,
            connection: Mutex::new(None),
        })
    }

    /// Overrides the retransmit schedule; the default is the BEP 15
    /// 15 s base with 8 attempts.
    pub fn with_retry_schedule(mut self, base: Duration, max_retries: u32) -> Self {
        self.retry_base = base;
        self.max_retries = max_retries;
        self
    }

    pub fn url(&self) -> &str {
        &self.announce_url
    }

    pub fn supports_scrape(&self) -> bool {
        false
    }

    pub async fn scrape(
        &self,
        _info_hashes: &[InfoHash],
        _deadline: Duration,
    ) -> Result<ScrapeResponse, TrackerError> {
        Err(TrackerError::ScrapeUnsupported)
    }

    pub async fn announce(
        &self,
        request: &AnnounceRequest,
        deadline: Duration,
    ) -> Result<AnnounceResponse, TrackerError> {
        tokio::time::timeout(deadline, self.announce_inner(request))
            .await
            .map_err(|_| TrackerError::Timeout)?
    }

    async fn announce_inner(
        &self,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        let socket = self.open_socket().await?;
        let is_v6 = socket.peer_addr()?.is_ipv6();

        // A stale connection id shows up as an action/txn mismatch; that
        // invalidates the cache and earns one immediate retry with a
        // fresh connect exchange rather than a backoff.
        let mut last_mismatch = None;
        for _ in 0..2 {
            let connection_id = self.connection_id(&socket).await?;

            match self.announce_exchange(&socket, connection_id, request, is_v6).await {
                Err(TrackerError::Mismatch { action, txn }) => {
                    event!(
                        Level::DEBUG,
                        url = %self.announce_url,
                        action,
                        txn,
                        "udp announce mismatch, discarding cached connection id"
                    );
                    self.connection.lock().await.take();
                    last_mismatch = Some(TrackerError::Mismatch { action, txn });
                }
                other => return other,
            }
        }

        Err(last_mismatch.unwrap_or(TrackerError::Timeout))
    }

    async fn open_socket(&self) -> Result<UdpSocket, TrackerError> {
        let target: SocketAddr = tokio::net::lookup_host(&self.target)
            .await?
            .next()
            .ok_or_else(|| TrackerError::InvalidUrl {
                url: self.announce_url.clone(),
                reason: "host did not resolve".to_owned(),
            })?;

        let bind_addr = if target.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(target).await?;
        Ok(socket)
    }

    async fn connection_id(&self, socket: &UdpSocket) -> Result<u64, TrackerError> {
        let mut cached = self.connection.lock().await;
        if let Some(connection) = cached.as_ref() {
            if connection.acquired_at.elapsed() < CONNECTION_ID_TTL {
                return Ok(connection.id);
            }
        }

        let id = self.connect_exchange(socket).await?;
        *cached = Some(CachedConnection {
            id,
            acquired_at: Instant::now(),
        });
        Ok(id)
    }

    async fn connect_exchange(&self, socket: &UdpSocket) -> Result<u64, TrackerError> {
        let (txn, datagram) = self.exchange(socket, connect_packet).await?;

        let action = read_u32(&datagram, 0);
        let response_txn = read_u32(&datagram, 4);
        if action == ACTION_ERROR {
            return Err(error_packet_failure(&datagram));
        }
        if action != ACTION_CONNECT || response_txn != txn {
            return Err(TrackerError::Mismatch {
                action,
                txn: response_txn,
            });
        }
        if datagram.len() < 16 {
            return Err(TrackerError::MalformedResponse("short connect response"));
        }

        Ok(u64::from_be_bytes(
            datagram[8..16].try_into().unwrap_or_default(),
        ))
    }

    async fn announce_exchange(
        &self,
        socket: &UdpSocket,
        connection_id: u64,
        request: &AnnounceRequest,
        is_v6: bool,
    ) -> Result<AnnounceResponse, TrackerError> {
        let (txn, datagram) = self
            .exchange(socket, |txn| {
                announce_packet(connection_id, txn, self.key, request)
            })
            .await?;

        let action = read_u32(&datagram, 0);
        let response_txn = read_u32(&datagram, 4);
        if action == ACTION_ERROR {
            return Err(error_packet_failure(&datagram));
        }
        if action != ACTION_ANNOUNCE || response_txn != txn {
            return Err(TrackerError::Mismatch {
                action,
                txn: response_txn,
            });
        }
        if datagram.len() < ANNOUNCE_HEADER_LEN {
            return Err(TrackerError::MalformedResponse("short announce response"));
        }

        let interval = read_u32(&datagram, 8);
        if interval == 0 {
            return Err(TrackerError::MissingInterval);
        }
        let leechers = read_u32(&datagram, 12);
        let seeders = read_u32(&datagram, 16);

        let stride = if is_v6 { V6_PEER_STRIDE } else { V4_PEER_STRIDE };
        let peers = datagram[ANNOUNCE_HEADER_LEN..]
            .chunks_exact(stride)
            .map(|chunk| {
                let (ip_bytes, port_bytes) = chunk.split_at(stride - 2);
                let ip = if is_v6 {
                    let octets: [u8; 16] = ip_bytes.try_into().unwrap_or_default();
                    std::net::Ipv6Addr::from(octets).into()
                } else {
                    let octets: [u8; 4] = ip_bytes.try_into().unwrap_or_default();
                    std::net::Ipv4Addr::from(octets).into()
                };
                PeerCandidate {
                    ip,
                    port: u16::from_be_bytes([port_bytes[0], port_bytes[1]]),
                }
            })
            .collect();

        Ok(AnnounceResponse {
            interval: Duration::from_secs(interval as u64),
            min_interval: None,
            seeders,
            leechers,
            peers,
            tracker_id: None,
        })
    }

    /// Sends a packet and waits for one datagram, retransmitting with a
    /// timeout of `base << attempt` and a fresh transaction id per try.
    async fn exchange<F>(
        &self,
        socket: &UdpSocket,
        mut make_packet: F,
    ) -> Result<(u32, Vec<u8>), TrackerError>
    where
        F: FnMut(u32) -> Vec<u8>,
    {
        let mut buf = vec![0u8; 4096];

        for attempt in 0..self.max_retries {
            let txn: u32 = rand::rng().random();
            socket.send(&make_packet(txn)).await?;

            let wait = self
                .retry_base
                .checked_mul(1 << attempt)
                .unwrap_or(Duration::MAX);
            match tokio::time::timeout(wait, socket.recv(&mut buf)).await {
                Err(_) => {
                    event!(
                        Level::DEBUG,
                        url = %self.announce_url,
                        attempt,
                        "udp tracker timed out, retransmitting"
                    );
                }
                Ok(Ok(n)) => {
                    if n < 8 {
                        return Err(TrackerError::MalformedResponse("short datagram"));
                    }
                    return Ok((txn, buf[..n].to_vec()));
                }
                Ok(Err(e)) => return Err(e.into()),
            }
        }

        Err(TrackerError::Timeout)
    }
}

fn connect_packet(txn: u32) -> Vec<u8> {
    let mut packet = Vec::with_capacity(CONNECT_REQUEST_LEN);
    packet.extend_from_slice(&PROTOCOL_MAGIC.to_be_bytes());
    packet.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
    packet.extend_from_slice(&txn.to_be_bytes());
    packet
}

fn announce_packet(connection_id: u64, txn: u32, key: u32, request: &AnnounceRequest) -> Vec<u8> {
    let mut packet = Vec::with_capacity(ANNOUNCE_REQUEST_LEN);
    packet.extend_from_slice(&connection_id.to_be_bytes());
    packet.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
    packet.extend_from_slice(&txn.to_be_bytes());
    packet.extend_from_slice(request.info_hash.as_bytes());
    packet.extend_from_slice(request.peer_id.as_bytes());
    packet.extend_from_slice(&request.downloaded.to_be_bytes());
    packet.extend_from_slice(&request.left.to_be_bytes());
    packet.extend_from_slice(&request.uploaded.to_be_bytes());
    packet.extend_from_slice(&request.event.code().to_be_bytes());
    // ip = 0: let the tracker infer our address.
    packet.extend_from_slice(&0u32.to_be_bytes());
    packet.extend_from_slice(&key.to_be_bytes());
    packet.extend_from_slice(&(request.num_want as u32).to_be_bytes());
    packet.extend_from_slice(&request.port.to_be_bytes());
    packet
}

fn error_packet_failure(datagram: &[u8]) -> TrackerError {
    let message = String::from_utf8_lossy(&datagram[8..]);
    TrackerError::Failure(message.into_owned())
}

fn read_u32(datagram: &[u8], offset: usize) -> u32 {
    datagram
        .get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_be_bytes)
        .unwrap_or(0)
}
