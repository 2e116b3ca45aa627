// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error taxonomy for the public socket API.

use std::io;

/// Errors surfaced by [`KtpContext`](crate::KtpContext) operations.
#[derive(Debug, thiserror::Error)]
pub enum KtpError {
    /// The daemon's shared control region or synchronization primitives
    /// could not be found. Raised on the first library call in a process.
    #[error("transport daemon not running: {0}")]
    DaemonNotRunning(#[source] io::Error),

    /// Bad domain/type, out-of-range descriptor, oversized payload, or a
    /// descriptor that names a free slot.
    #[error("invalid argument")]
    InvalidArgument,

    /// No socket slot, send-buffer slot, or sequence number available.
    /// The caller may retry once capacity frees up.
    #[error("no space available")]
    NoSpace,

    /// The destination does not match the peer recorded at bind time.
    #[error("destination does not match bound peer")]
    NotBound,

    /// Nothing to deliver right now; the caller is expected to retry.
    #[error("no message available")]
    NoMessage,

    /// The daemon failed to create or bind the underlying UDP endpoint.
    /// Carries the daemon-side errno.
    #[error("broker request failed (os error {errno})")]
    Broker { errno: i32 },

    /// A failure in the IPC layer itself (locking, shared memory access).
    #[error("ipc failure: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, KtpError>;
