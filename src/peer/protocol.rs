// SPDX-FileCopyrightText: 2026 The ebbtide Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! The BitTorrent handshake and length-prefixed wire messages (BEP 3).
//!
//! Readers consume exactly one frame per call and writers emit exactly
//! one; partial socket reads are extended to completion or error.

use std::time::Duration;

use strum_macros::Display;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::types::{InfoHash, PeerId, ID_LEN};

pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// Handshake length with the standard protocol string:
/// pstrlen + pstr + reserved + info_hash + peer_id.
pub const HANDSHAKE_LEN: usize = 1 + 19 + 8 + ID_LEN + ID_LEN;

const RESERVED_LEN: usize = 8;

/// Upper bound on a single frame; a Piece block is 16 KiB by convention
/// and bitfields for very large torrents stay well under this.
const MAX_FRAME_LEN: u32 = 2 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake: i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake: timed out waiting for the remote handshake")]
    Timeout,
    #[error("handshake: protocol string length is zero")]
    PstrLenZero,
    #[error("handshake: info hash mismatch")]
    InfoHashMismatch,
    #[error("handshake: peer id mismatch")]
    PeerIdMismatch,
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("wire: i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("wire: unknown message id {0}")]
    UnknownId(u8),
    #[error("wire: invalid payload length {len} for {kind}")]
    BadPayload { kind: MessageKind, len: usize },
    #[error("wire: frame length {0} exceeds the limit")]
    FrameTooLarge(u32),
}

/// The 68-byte opener of every peer connection:
/// `[pstrlen][pstr][reserved:8][info_hash:20][peer_id:20]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self { info_hash, peer_id }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HANDSHAKE_LEN);
        buf.push(PROTOCOL_STRING.len() as u8);
        buf.extend_from_slice(PROTOCOL_STRING.as_bytes());
        buf.extend_from_slice(&[0u8; RESERVED_LEN]);
        buf.extend_from_slice(self.info_hash.as_bytes());
        buf.extend_from_slice(self.peer_id.as_bytes());
        buf
    }

    /// Writes our handshake, then reads and verifies the remote's under
    /// `deadline`. The info hash must match ours; the peer id is only
    /// checked when `expected_peer_id` pins one.
    pub async fn perform<S>(
        &self,
        stream: &mut S,
        expected_peer_id: Option<PeerId>,
        deadline: Duration,
    ) -> Result<Handshake, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        stream.write_all(&self.to_bytes()).await?;

        let remote = tokio::time::timeout(deadline, read_handshake(stream))
            .await
            .map_err(|_| HandshakeError::Timeout)??;

        if remote.info_hash != self.info_hash {
            return Err(HandshakeError::InfoHashMismatch);
        }
        if let Some(expected) = expected_peer_id {
            if remote.peer_id != expected {
                return Err(HandshakeError::PeerIdMismatch);
            }
        }

        Ok(remote)
    }
}

/// Reads one handshake. The remote's protocol string may differ in
/// length; identity checks are the caller's (via [`Handshake::perform`]).
pub async fn read_handshake<R>(reader: &mut R) -> Result<Handshake, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let mut pstrlen = [0u8; 1];
    reader.read_exact(&mut pstrlen).await?;
    let pstrlen = pstrlen[0] as usize;
    if pstrlen == 0 {
        return Err(HandshakeError::PstrLenZero);
    }

    let mut rest = vec![0u8; pstrlen + RESERVED_LEN + ID_LEN + ID_LEN];
    reader.read_exact(&mut rest).await?;

    let mut info_hash = [0u8; ID_LEN];
    let mut peer_id = [0u8; ID_LEN];
    let hash_start = pstrlen + RESERVED_LEN;
    info_hash.copy_from_slice(&rest[hash_start..hash_start + ID_LEN]);
    peer_id.copy_from_slice(&rest[hash_start + ID_LEN..]);

    Ok(Handshake {
        info_hash: InfoHash(info_hash),
        peer_id: PeerId(peer_id),
    })
}

/// A wire message. The frame is `[length:u32 BE][id:u8][payload]`;
/// length 0 is a keep-alive with no id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
}

/// Message discriminant, used for logging and host events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum MessageKind {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have,
    Bitfield,
    Request,
    Piece,
    Cancel,
}

const ID_CHOKE: u8 = 0;
const ID_UNCHOKE: u8 = 1;
const ID_INTERESTED: u8 = 2;
const ID_NOT_INTERESTED: u8 = 3;
const ID_HAVE: u8 = 4;
const ID_BITFIELD: u8 = 5;
const ID_REQUEST: u8 = 6;
const ID_PIECE: u8 = 7;
const ID_CANCEL: u8 = 8;

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::KeepAlive => MessageKind::KeepAlive,
            Message::Choke => MessageKind::Choke,
            Message::Unchoke => MessageKind::Unchoke,
            Message::Interested => MessageKind::Interested,
            Message::NotInterested => MessageKind::NotInterested,
            Message::Have(_) => MessageKind::Have,
            Message::Bitfield(_) => MessageKind::Bitfield,
            Message::Request { .. } => MessageKind::Request,
            Message::Piece { .. } => MessageKind::Piece,
            Message::Cancel { .. } => MessageKind::Cancel,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Message::KeepAlive => vec![0, 0, 0, 0],
            Message::Choke => frame(ID_CHOKE, &[]),
            Message::Unchoke => frame(ID_UNCHOKE, &[]),
            Message::Interested => frame(ID_INTERESTED, &[]),
            Message::NotInterested => frame(ID_NOT_INTERESTED, &[]),
            Message::Have(index) => frame(ID_HAVE, &index.to_be_bytes()),
            Message::Bitfield(bits) => frame(ID_BITFIELD, bits),
            Message::Request {
                index,
                begin,
                length,
            } => frame(ID_REQUEST, &block_info(*index, *begin, *length)),
            Message::Piece {
                index,
                begin,
                block,
            } => {
                let mut payload = Vec::with_capacity(8 + block.len());
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(block);
                frame(ID_PIECE, &payload)
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => frame(ID_CANCEL, &block_info(*index, *begin, *length)),
        }
    }
}

fn frame(id: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + 1 + payload.len());
    buf.extend_from_slice(&(1 + payload.len() as u32).to_be_bytes());
    buf.push(id);
    buf.extend_from_slice(payload);
    buf
}

fn block_info(index: u32, begin: u32, length: u32) -> [u8; 12] {
    let mut payload = [0u8; 12];
    payload[0..4].copy_from_slice(&index.to_be_bytes());
    payload[4..8].copy_from_slice(&begin.to_be_bytes());
    payload[8..12].copy_from_slice(&length.to_be_bytes());
    payload
}

/// Reads exactly one frame. An unknown id consumes its frame before
/// failing, so the caller may log it and keep the stream.
pub async fn read_message<R>(reader: &mut R) -> Result<Message, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let frame_len = u32::from_be_bytes(len_buf);

    if frame_len == 0 {
        return Ok(Message::KeepAlive);
    }
    if frame_len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(frame_len));
    }

    let mut buf = vec![0u8; frame_len as usize];
    reader.read_exact(&mut buf).await?;

    let id = buf[0];
    let payload = &buf[1..];
    match id {
        ID_CHOKE => expect_empty(MessageKind::Choke, payload).map(|_| Message::Choke),
        ID_UNCHOKE => expect_empty(MessageKind::Unchoke, payload).map(|_| Message::Unchoke),
        ID_INTERESTED => expect_empty(MessageKind::Interested, payload).map(|_| Message::Interested),
        ID_NOT_INTERESTED => {
            expect_empty(MessageKind::NotInterested, payload).map(|_| Message::NotInterested)
        }
        ID_HAVE => {
            let index = fixed_u32s::<1>(MessageKind::Have, payload)?;
            Ok(Message::Have(index[0]))
        }
        ID_BITFIELD => Ok(Message::Bitfield(payload.to_vec())),
        ID_REQUEST => {
            let [index, begin, length] = fixed_u32s::<3>(MessageKind::Request, payload)?;
            Ok(Message::Request {
                index,
                begin,
                length,
            })
        }
        ID_PIECE => {
            if payload.len() < 8 {
                return Err(WireError::BadPayload {
                    kind: MessageKind::Piece,
                    len: payload.len(),
                });
            }
            let index = u32::from_be_bytes(payload[0..4].try_into().unwrap_or_default());
            let begin = u32::from_be_bytes(payload[4..8].try_into().unwrap_or_default());
            Ok(Message::Piece {
                index,
                begin,
                block: payload[8..].to_vec(),
            })
        }
        ID_CANCEL => {
            let [index, begin, length] = fixed_u32s::<3>(MessageKind::Cancel, payload)?;
            Ok(Message::Cancel {
                index,
                begin,
                length,
            })
        }
        other => Err(WireError::UnknownId(other)),
    }
}

/// Writes exactly one frame.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&message.to_bytes()).await?;
    Ok(())
}

fn expect_empty(kind: MessageKind, payload: &[u8]) -> Result<(), WireError> {
    if payload.is_empty() {
        Ok(())
    } else {
        Err(WireError::BadPayload {
            kind,
            len: payload.len(),
        })
    }
}

fn fixed_u32s<const N: usize>(kind: MessageKind, payload: &[u8]) -> Result<[u32; N], WireError> {
    if payload.len() != N * 4 {
        return Err(WireError::BadPayload {
            kind,
            len: payload.len(),
        });
    }
    let mut out = [0u32; N];
    for (i, chunk) in payload.chunks_exact(4).enumerate() {
        out[i] = u32::from_be_bytes(chunk.try_into().unwrap_or_default());
    }
    Ok(out)
}
