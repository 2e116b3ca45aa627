// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// POSIX plumbing for the named IPC objects the transport uses: shared
// memory segments (shm_open + mmap), process-shared robust mutexes
// (pthread_mutex_t in shared memory), and counting semaphores (sem_open).
//
// Ownership model: the daemon creates every object with exclusive-create
// semantics (unlinking stale leftovers first) and is responsible for
// unlinking at shutdown; clients open existing objects and never create.
// Segments additionally carry a trailing cross-process reference counter
// so the backing file is unlinked when the last mapping goes away even if
// the daemon died uncleanly.

use std::ffi::CString;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Object naming
// ---------------------------------------------------------------------------

/// FNV-1a 64-bit hash, used to shorten over-long object names.
fn fnv1a_64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Platform limit for shm/sem names. macOS caps at PSHMNAMLEN (31);
/// elsewhere names are long enough that no truncation is needed.
#[cfg(target_os = "macos")]
const NAME_MAX: usize = 31;

#[cfg(not(target_os = "macos"))]
const NAME_MAX: usize = 0; // 0 = no truncation

/// Turn a logical object name into a POSIX one: leading '/', and — where
/// the platform caps name length — a truncated prefix plus a 16-hex-digit
/// FNV-1a hash so distinct long names stay distinct.
pub fn posix_name(name: &str) -> String {
    let full = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    };

    if NAME_MAX == 0 || full.len() <= NAME_MAX {
        return full;
    }

    let hash = fnv1a_64(full.as_bytes());
    let keep = NAME_MAX.saturating_sub(1 + 17); // '/' + '_' + 16 hex digits
    let body = &full[1..];
    let prefix = &body[..keep.min(body.len())];
    format!("/{prefix}_{hash:016x}")
}

fn c_name(name: &str) -> io::Result<CString> {
    CString::new(posix_name(name).into_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

// ---------------------------------------------------------------------------
// Shared memory
// ---------------------------------------------------------------------------

/// How to acquire a named object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Create exclusively; fail with EEXIST if it is already there.
    Create,
    /// Open an existing object; fail with ENOENT if it is not there.
    Open,
}

const PERMS: libc::mode_t = 0o666;

/// Rounds the user size up to the ref-counter alignment and appends the
/// trailing `AtomicI32` reference counter.
const ALIGN: usize = std::mem::align_of::<AtomicI32>();

fn mapped_size(user_size: usize) -> usize {
    let aligned = ((user_size.wrapping_sub(1) / ALIGN) + 1) * ALIGN;
    aligned + std::mem::size_of::<AtomicI32>()
}

/// The trailing reference counter of a mapped region.
///
/// # Safety
/// `mem` must point to a mapped region of at least `total` bytes.
unsafe fn ref_counter(mem: *mut u8, total: usize) -> &'static AtomicI32 {
    let offset = total - std::mem::size_of::<AtomicI32>();
    &*(mem.add(offset) as *const AtomicI32)
}

/// A named POSIX shared memory mapping with a cross-process refcount.
pub struct PlatformShm {
    mem: *mut u8,
    size: usize, // total mapped size, including the ref counter
    user_size: usize,
    name: String, // POSIX name, with leading '/'
}

// The region is process-shared by design; all access is externally
// synchronized by the owning layer's mutex.
unsafe impl Send for PlatformShm {}
unsafe impl Sync for PlatformShm {}

impl PlatformShm {
    pub fn acquire(name: &str, user_size: usize, mode: OpenMode) -> io::Result<Self> {
        if name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "name is empty"));
        }
        if user_size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size is 0"));
        }

        let cname = c_name(name)?;
        let total = mapped_size(user_size);

        let fd = match mode {
            OpenMode::Create => {
                let fd = unsafe {
                    libc::shm_open(
                        cname.as_ptr(),
                        libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                        PERMS as libc::c_uint,
                    )
                };
                if fd == -1 {
                    return Err(io::Error::last_os_error());
                }
                unsafe { libc::fchmod(fd, PERMS) };
                if unsafe { libc::ftruncate(fd, total as libc::off_t) } != 0 {
                    let err = io::Error::last_os_error();
                    unsafe {
                        libc::close(fd);
                        libc::shm_unlink(cname.as_ptr());
                    }
                    return Err(err);
                }
                fd
            }
            OpenMode::Open => {
                let fd =
                    unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, PERMS as libc::c_uint) };
                if fd == -1 {
                    return Err(io::Error::last_os_error());
                }
                fd
            }
        };

        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if mem == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let mem = mem as *mut u8;
        unsafe { ref_counter(mem, total).fetch_add(1, Ordering::AcqRel) };

        Ok(Self {
            mem,
            size: total,
            user_size,
            name: posix_name(name),
        })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.mem
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mem
    }

    pub fn user_size(&self) -> usize {
        self.user_size
    }

    /// Number of live mappings of this segment across all processes.
    pub fn ref_count(&self) -> i32 {
        unsafe { ref_counter(self.mem, self.size).load(Ordering::Acquire) }
    }

    pub fn unlink_by_name(name: &str) {
        if let Ok(cname) = c_name(name) {
            unsafe { libc::shm_unlink(cname.as_ptr()) };
        }
    }
}

impl Drop for PlatformShm {
    fn drop(&mut self) {
        if self.mem.is_null() {
            return;
        }
        let prev = unsafe { ref_counter(self.mem, self.size).fetch_sub(1, Ordering::AcqRel) };
        unsafe { libc::munmap(self.mem as *mut libc::c_void, self.size) };
        if prev <= 1 {
            if let Ok(cname) = CString::new(self.name.as_bytes()) {
                unsafe { libc::shm_unlink(cname.as_ptr()) };
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Process-shared robust mutex
// ---------------------------------------------------------------------------

// Robust-mutex symbols are not exposed by the libc crate on every target.
// macOS has no robust mutexes at all; there a dead lock holder is simply
// not recovered from.
#[cfg(not(target_os = "macos"))]
extern "C" {
    fn pthread_mutexattr_setrobust(
        attr: *mut libc::pthread_mutexattr_t,
        robustness: libc::c_int,
    ) -> libc::c_int;
    fn pthread_mutex_consistent(mutex: *mut libc::pthread_mutex_t) -> libc::c_int;
}

#[cfg(not(target_os = "macos"))]
const PTHREAD_MUTEX_ROBUST: libc::c_int = 1;

/// A named inter-process mutex: a `pthread_mutex_t` in its own shared
/// memory segment, initialized process-shared and (where available)
/// robust, so a client that dies mid-critical-section does not wedge the
/// daemon.
pub struct PlatformMutex {
    shm: PlatformShm,
}

impl PlatformMutex {
    pub fn acquire(name: &str, mode: OpenMode) -> io::Result<Self> {
        let shm = PlatformShm::acquire(name, std::mem::size_of::<libc::pthread_mutex_t>(), mode)?;
        if mode == OpenMode::Create {
            let mtx = shm.as_mut_ptr() as *mut libc::pthread_mutex_t;
            unsafe {
                ptr::write_bytes(mtx, 0, 1);

                let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
                let mut eno = libc::pthread_mutexattr_init(&mut attr);
                if eno != 0 {
                    return Err(io::Error::from_raw_os_error(eno));
                }
                eno = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
                if eno == 0 {
                    #[cfg(not(target_os = "macos"))]
                    {
                        eno = pthread_mutexattr_setrobust(&mut attr, PTHREAD_MUTEX_ROBUST);
                    }
                }
                if eno == 0 {
                    eno = libc::pthread_mutex_init(mtx, &attr);
                }
                libc::pthread_mutexattr_destroy(&mut attr);
                if eno != 0 {
                    return Err(io::Error::from_raw_os_error(eno));
                }
            }
        }
        Ok(Self { shm })
    }

    fn mtx_ptr(&self) -> *mut libc::pthread_mutex_t {
        self.shm.as_mut_ptr() as *mut libc::pthread_mutex_t
    }

    /// Blocking lock. A previous owner having died with the lock held is
    /// recovered via `pthread_mutex_consistent` and counts as success.
    pub fn lock(&self) -> io::Result<()> {
        let eno = unsafe { libc::pthread_mutex_lock(self.mtx_ptr()) };
        match eno {
            0 => Ok(()),
            #[cfg(not(target_os = "macos"))]
            libc::EOWNERDEAD => {
                let eno2 = unsafe { pthread_mutex_consistent(self.mtx_ptr()) };
                if eno2 != 0 {
                    return Err(io::Error::from_raw_os_error(eno2));
                }
                Ok(())
            }
            _ => Err(io::Error::from_raw_os_error(eno)),
        }
    }

    pub fn unlock(&self) -> io::Result<()> {
        let eno = unsafe { libc::pthread_mutex_unlock(self.mtx_ptr()) };
        if eno != 0 {
            return Err(io::Error::from_raw_os_error(eno));
        }
        Ok(())
    }

    pub fn clear_storage(name: &str) {
        PlatformShm::unlink_by_name(name);
    }
}

// pthread_mutex_destroy is deliberately never called: the segment-level
// munmap/unlink in PlatformShm::drop reclaims the memory, and destroying
// a mutex other processes may still map is undefined.

// ---------------------------------------------------------------------------
// Named counting semaphore
// ---------------------------------------------------------------------------

/// A named POSIX semaphore (`sem_open`). The broker's rendezvous pair and
/// nothing else; the state region uses [`PlatformMutex`].
pub struct PlatformSem {
    sem: *mut libc::sem_t,
}

unsafe impl Send for PlatformSem {}
unsafe impl Sync for PlatformSem {}

impl PlatformSem {
    pub fn acquire(name: &str, initial: u32, mode: OpenMode) -> io::Result<Self> {
        let cname = c_name(name)?;
        let sem = match mode {
            OpenMode::Create => unsafe {
                libc::sem_open(
                    cname.as_ptr(),
                    libc::O_CREAT | libc::O_EXCL,
                    PERMS as libc::c_uint,
                    initial as libc::c_uint,
                )
            },
            OpenMode::Open => unsafe { libc::sem_open(cname.as_ptr(), 0) },
        };
        if sem == libc::SEM_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { sem })
    }

    /// Wait (P). With `timeout == None`, blocks until posted; otherwise
    /// returns `Ok(false)` once the timeout elapses without a post.
    ///
    /// The timed path polls `sem_trywait` with a short sleep instead of
    /// `sem_timedwait`, which macOS does not implement.
    pub fn wait(&self, timeout: Option<Duration>) -> io::Result<bool> {
        match timeout {
            None => loop {
                if unsafe { libc::sem_wait(self.sem) } == 0 {
                    return Ok(true);
                }
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EINTR) {
                    return Err(err);
                }
            },
            Some(limit) => {
                let deadline = Instant::now() + limit;
                loop {
                    if unsafe { libc::sem_trywait(self.sem) } == 0 {
                        return Ok(true);
                    }
                    let err = io::Error::last_os_error();
                    match err.raw_os_error() {
                        Some(libc::EAGAIN) | Some(libc::EINTR) => {}
                        _ => return Err(err),
                    }
                    if Instant::now() >= deadline {
                        return Ok(false);
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }

    /// Post (V) `count` times.
    pub fn post(&self, count: u32) -> io::Result<()> {
        for _ in 0..count {
            if unsafe { libc::sem_post(self.sem) } != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    pub fn clear_storage(name: &str) {
        if let Ok(cname) = c_name(name) {
            unsafe { libc::sem_unlink(cname.as_ptr()) };
        }
    }
}

impl Drop for PlatformSem {
    fn drop(&mut self) {
        unsafe { libc::sem_close(self.sem) };
    }
}
