// SPDX-FileCopyrightText: 2026 The ebbtide Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod manager;
pub mod protocol;
pub mod session;

// Re-export key types for easier access.
pub use manager::PeerManager;
pub use protocol::{Handshake, HandshakeError, Message, MessageKind, WireError};
pub use session::PeerHandle;
