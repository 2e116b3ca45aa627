// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Protocol constants and runtime configuration for the KTP transport.
// The compile-time constants fix the layout of the shared control region
// and the wire format; the config structs carry the per-deployment knobs
// (IPC namespace, retransmission timeout, simulated loss rate).

use std::time::Duration;

/// Socket type marker accepted by [`KtpContext::socket`](crate::KtpContext::socket).
pub const SOCK_KTP: i32 = 3;

/// Maximum number of concurrently allocated KTP sockets per daemon.
pub const MAX_SOCKETS: usize = 10;

/// Per-socket buffer depth, in messages, for each direction.
pub const BUFFER_SLOTS: usize = 10;

/// Size of the modular sequence-number space (8-bit sequence numbers).
pub const SEQ_SPACE: usize = 256;

/// Maximum payload per message, in bytes.
pub const MAX_MSG_SIZE: usize = 512;

/// Default retransmission timeout (the protocol's `T`).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default probability that the receiver drops an inbound datagram
/// before processing, to exercise the retransmission path.
pub const DEFAULT_DROP_PROB: f64 = 0.05;

/// Default IPC namespace shared by the daemon and its clients.
pub const DEFAULT_NAMESPACE: &str = "ktp";

/// Daemon-side configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Prefix for every named IPC object (shm segments, mutexes, semaphores).
    /// Daemon and clients must agree on it; distinct namespaces give fully
    /// independent transport instances on one host.
    pub namespace: String,
    /// Retransmission timeout `T`. The sender and receiver loops run at `T/2`,
    /// the reaper at `T`.
    pub timeout: Duration,
    /// Probability in `[0, 1]` of dropping an inbound datagram unprocessed.
    pub drop_prob: f64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            timeout: DEFAULT_TIMEOUT,
            drop_prob: DEFAULT_DROP_PROB,
        }
    }
}

/// Client-side configuration: only the namespace to attach to.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub namespace: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

impl ClientConfig {
    pub fn with_namespace(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
        }
    }
}
