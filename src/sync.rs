// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named cross-process synchronization primitives.
//
// NamedMutex guards the socket-state region and the broker mailbox;
// NamedSemaphore is the broker's request/reply rendezvous pair. Both are
// created by the daemon and opened (never created) by clients.

use std::io;
use std::time::Duration;

use crate::platform::{OpenMode, PlatformMutex, PlatformSem};

/// A named, inter-process mutex (robust + process-shared pthread mutex
/// in shared memory).
pub struct NamedMutex {
    inner: PlatformMutex,
}

impl NamedMutex {
    /// Create the mutex, failing if it already exists. Daemon side.
    pub fn create(name: &str) -> io::Result<Self> {
        let inner = PlatformMutex::acquire(name, OpenMode::Create)?;
        Ok(Self { inner })
    }

    /// Open an existing mutex. Client side.
    pub fn open(name: &str) -> io::Result<Self> {
        let inner = PlatformMutex::acquire(name, OpenMode::Open)?;
        Ok(Self { inner })
    }

    /// Lock, returning a guard that unlocks on drop.
    pub fn lock(&self) -> io::Result<MutexGuard<'_>> {
        self.inner.lock()?;
        Ok(MutexGuard { mutex: self })
    }

    pub fn clear_storage(name: &str) {
        PlatformMutex::clear_storage(name);
    }
}

/// RAII guard for [`NamedMutex`].
pub struct MutexGuard<'a> {
    mutex: &'a NamedMutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        let _ = self.mutex.inner.unlock();
    }
}

/// A named counting semaphore.
pub struct NamedSemaphore {
    inner: PlatformSem,
}

impl NamedSemaphore {
    /// Create the semaphore with an initial count, failing if it already
    /// exists. Daemon side.
    pub fn create(name: &str, initial: u32) -> io::Result<Self> {
        let inner = PlatformSem::acquire(name, initial, OpenMode::Create)?;
        Ok(Self { inner })
    }

    /// Open an existing semaphore. Client side.
    pub fn open(name: &str) -> io::Result<Self> {
        let inner = PlatformSem::acquire(name, 0, OpenMode::Open)?;
        Ok(Self { inner })
    }

    /// Wait (P). `Ok(false)` means the timeout elapsed.
    pub fn wait(&self, timeout: Option<Duration>) -> io::Result<bool> {
        self.inner.wait(timeout)
    }

    /// Post (V) `count` times.
    pub fn post(&self, count: u32) -> io::Result<()> {
        self.inner.post(count)
    }

    pub fn clear_storage(name: &str) {
        PlatformSem::clear_storage(name);
    }
}
