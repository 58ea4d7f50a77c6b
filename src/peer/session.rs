// SPDX-FileCopyrightText: 2026 The ebbtide Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Per-peer session: one reader and one writer task sharing a socket.
//!
//! The reader is the only party that reads and the writer the only one
//! that writes; outbound frames are serialized FIFO through a bounded
//! mailbox. A single-use stop flag makes both tasks exit, which drops
//! the socket halves and closes the connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{event, Level};

use super::protocol::{self, Message, WireError};
use crate::bitfield::Bitfield;
use crate::config::PeerConfig;
use crate::event::{emit, Event, EventSender};

/// How long a control frame may wait on a full mailbox. Data frames
/// never wait; they are dropped instead.
const CONTROL_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Read-only configuration a session carries instead of a reference to
/// the manager that spawned it.
#[derive(Debug, Clone)]
pub(crate) struct SessionContext {
    pub piece_count: usize,
    pub cfg: PeerConfig,
    pub events: EventSender,
}

/// The manager's view of an admitted session: its address, the outbound
/// mailbox, and the stop signal. The socket itself stays with the
/// session tasks.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    addr: String,
    mailbox: mpsc::Sender<Message>,
    stop: Arc<StopSignal>,
}

/// Single-use stop flag. Waiters register interest before checking the
/// flag, so a stop raised before a task starts waiting is still
/// observed.
#[derive(Debug, Default)]
struct StopSignal {
    closed: AtomicBool,
    notify: Notify,
}

impl PeerHandle {
    pub(crate) fn new(addr: String, mailbox_capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (mailbox, mailbox_rx) = mpsc::channel(mailbox_capacity);
        (
            Self {
                addr,
                mailbox,
                stop: Arc::new(StopSignal::default()),
            },
            mailbox_rx,
        )
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.stop.closed.load(Ordering::SeqCst)
    }

    /// Signals both session tasks to exit. Idempotent.
    pub fn stop(&self) {
        if !self.stop.closed.swap(true, Ordering::SeqCst) {
            self.stop.notify.notify_waiters();
        }
    }

    /// Resolves once `stop` has been called, no matter which happened
    /// first.
    pub(crate) async fn stopped(&self) {
        let notified = self.stop.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_closed() {
            return;
        }
        notified.await;
    }

    /// Queues an outbound frame. Control frames block briefly on a full
    /// mailbox; data frames are dropped instead. Returns whether the
    /// frame was accepted.
    pub async fn send(&self, message: Message) -> bool {
        if self.is_closed() {
            return false;
        }

        match message {
            Message::Piece { .. } => self.mailbox.try_send(message).is_ok(),
            _ => tokio::time::timeout(CONTROL_SEND_TIMEOUT, self.mailbox.send(message))
                .await
                .map(|sent| sent.is_ok())
                .unwrap_or(false),
        }
    }
}

/// Connection state for one remote peer.
struct PeerSession {
    addr: String,
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
    remote_bitfield: Bitfield,
    ctx: Arc<SessionContext>,
}

impl PeerSession {
    fn new(addr: String, ctx: Arc<SessionContext>) -> Self {
        Self {
            addr,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            remote_bitfield: Bitfield::new(ctx.piece_count),
            ctx,
        }
    }

    /// Applies one inbound message. Returns false when the session must
    /// close.
    fn handle_message(&mut self, message: Message) -> bool {
        emit(
            &self.ctx.events,
            Event::PeerMessage {
                addr: self.addr.clone(),
                kind: message.kind().to_string(),
            },
        );

        match message {
            // The read deadline restarting is all a keep-alive does.
            Message::KeepAlive => {}
            Message::Choke => self.peer_choking = true,
            Message::Unchoke => self.peer_choking = false,
            Message::Interested => self.peer_interested = true,
            Message::NotInterested => self.peer_interested = false,
            Message::Bitfield(bytes) => {
                let expected = self.ctx.piece_count.div_ceil(8);
                if bytes.len() != expected {
                    event!(
                        Level::DEBUG,
                        addr = %self.addr,
                        got = bytes.len(),
                        expected,
                        "bitfield length does not match piece count, closing"
                    );
                    return false;
                }
                self.remote_bitfield = Bitfield::from_bytes(&bytes);
            }
            Message::Have(index) => self.remote_bitfield.set(index as usize),
            // Block traffic belongs to the piece subsystem, which lives
            // in a higher layer. Parsing and dispatching here keeps the
            // reader responsive.
            Message::Request { .. } | Message::Piece { .. } | Message::Cancel { .. } => {}
        }

        true
    }
}

/// Runs a session to completion over any duplex byte stream.
pub(crate) async fn run_session<S>(
    stream: S,
    addr: String,
    ctx: Arc<SessionContext>,
    handle: PeerHandle,
    mailbox_rx: mpsc::Receiver<Message>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    emit(&ctx.events, Event::PeerStarted { addr: addr.clone() });

    let (read_half, write_half) = tokio::io::split(stream);

    let reader = tokio::spawn(reader_task(
        read_half,
        addr.clone(),
        Arc::clone(&ctx),
        handle.clone(),
    ));
    let writer = tokio::spawn(writer_task(
        write_half,
        addr.clone(),
        Arc::clone(&ctx),
        handle.clone(),
        mailbox_rx,
    ));

    let _ = reader.await;
    // Whichever task exits first flips the stop flag; this covers the
    // reader-finished-normally path so the writer unblocks too.
    handle.stop();
    let _ = writer.await;

    emit(&ctx.events, Event::PeerStopped { addr });
}

async fn reader_task<R>(mut reader: R, addr: String, ctx: Arc<SessionContext>, handle: PeerHandle)
where
    R: AsyncRead + Unpin + Send,
{
    let mut session = PeerSession::new(addr, Arc::clone(&ctx));

    loop {
        tokio::select! {
            _ = handle.stopped() => break,

            result = tokio::time::timeout(
                ctx.cfg.read_timeout(),
                protocol::read_message(&mut reader),
            ) => {
                match result {
                    // A timeout without data closes the session.
                    Err(_) => {
                        event!(Level::DEBUG, addr = %session.addr, "peer read timed out, closing");
                        break;
                    }
                    Ok(Err(WireError::UnknownId(id))) => {
                        event!(Level::WARN, addr = %session.addr, id, "unknown message id, frame discarded");
                    }
                    Ok(Err(e)) => {
                        event!(Level::DEBUG, addr = %session.addr, error = %e, "peer read error, closing");
                        break;
                    }
                    Ok(Ok(message)) => {
                        event!(Level::TRACE, addr = %session.addr, kind = %message.kind(), "message received");
                        if !session.handle_message(message) {
                            break;
                        }
                    }
                }
            }
        }
    }

    event!(
        Level::DEBUG,
        addr = %session.addr,
        am_choking = session.am_choking,
        am_interested = session.am_interested,
        peer_choking = session.peer_choking,
        peer_interested = session.peer_interested,
        remote_pieces = session.remote_bitfield.count(),
        "peer session closing"
    );
    handle.stop();
}

async fn writer_task<W>(
    mut writer: W,
    addr: String,
    ctx: Arc<SessionContext>,
    handle: PeerHandle,
    mut mailbox_rx: mpsc::Receiver<Message>,
) where
    W: AsyncWrite + Unpin + Send,
{
    let keep_alive = ctx.cfg.keep_alive();
    let mut ticker = tokio::time::interval_at(Instant::now() + keep_alive, keep_alive);
    let mut last_write = Instant::now();

    loop {
        tokio::select! {
            _ = handle.stopped() => break,

            _ = ticker.tick() => {
                // Suppressed while regular traffic is flowing.
                if last_write.elapsed() < keep_alive {
                    continue;
                }
                if !write_frame(&mut writer, &Message::KeepAlive, &ctx, &addr).await {
                    break;
                }
                event!(Level::TRACE, addr = %addr, "keep-alive sent");
                last_write = Instant::now();
            }

            outbound = mailbox_rx.recv() => {
                let Some(message) = outbound else { break };
                if !write_frame(&mut writer, &message, &ctx, &addr).await {
                    break;
                }
                last_write = Instant::now();
            }
        }
    }

    handle.stop();
}

async fn write_frame<W>(writer: &mut W, message: &Message, ctx: &SessionContext, addr: &str) -> bool
where
    W: AsyncWrite + Unpin,
{
    match tokio::time::timeout(
        ctx.cfg.write_timeout(),
        protocol::write_message(writer, message),
    )
    .await
    {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            event!(Level::DEBUG, addr = %addr, error = %e, "peer write error, closing");
            false
        }
        Err(_) => {
            event!(Level::DEBUG, addr = %addr, "peer write timed out, closing");
            false
        }
    }
}
