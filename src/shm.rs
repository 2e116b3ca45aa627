// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named shared memory segment handle.
// Thin facade over platform::PlatformShm; the transport's two segments
// (socket-state region and broker mailbox) are built on this.

use std::io;

use crate::platform::PlatformShm;

pub use crate::platform::OpenMode;

/// A named, inter-process shared memory region.
///
/// The mapped region carries a trailing cross-process reference counter;
/// the backing object is unlinked when the last mapping is dropped, so a
/// crashed daemon does not leave segments behind once its clients exit.
pub struct ShmSegment {
    inner: PlatformShm,
}

impl ShmSegment {
    /// Acquire a named segment of `size` usable bytes.
    pub fn acquire(name: &str, size: usize, mode: OpenMode) -> io::Result<Self> {
        let inner = PlatformShm::acquire(name, size, mode)?;
        Ok(Self { inner })
    }

    /// Pointer to the start of the usable region.
    pub fn as_ptr(&self) -> *const u8 {
        self.inner.as_ptr()
    }

    /// Mutable pointer to the start of the usable region.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.inner.as_mut_ptr()
    }

    /// Usable size in bytes (what the caller asked for).
    pub fn user_size(&self) -> usize {
        self.inner.user_size()
    }

    /// Number of processes currently mapping this segment.
    pub fn ref_count(&self) -> i32 {
        self.inner.ref_count()
    }

    /// Remove the backing object for a named segment without opening it.
    pub fn clear_storage(name: &str) {
        PlatformShm::unlink_by_name(name);
    }
}
