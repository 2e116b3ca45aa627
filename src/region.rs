// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The shared control region between the daemon and client processes.
//
// Two named segments per IPC namespace:
//   <ns>_state   — the socket slot table, guarded by <ns>_state_lock
//   <ns>_broker  — a one-request mailbox, guarded by <ns>_broker_lock
//                  plus the rendezvous semaphores <ns>_req / <ns>_rep
//
// Everything stored in a segment is #[repr(C)] plain integers and byte
// arrays; no pointers, no atomics. All access to the slot table goes
// through StateGuard, which holds the state lock for its lifetime. The
// mailbox is written by at most one party at a time by construction: a
// client holds the broker lock for its entire request/reply dialogue and
// parks on <ns>_rep while the daemon touches the mailbox.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use crate::config::{BUFFER_SLOTS, MAX_MSG_SIZE, MAX_SOCKETS, SEQ_SPACE};
use crate::platform::OpenMode;
use crate::shm::ShmSegment;
use crate::sync::{MutexGuard, NamedMutex, NamedSemaphore};

/// "No buffer slot" marker in the sequence→slot maps.
pub const NO_SLOT: i16 = -1;
/// "Never transmitted" marker in the per-sequence timestamp array.
pub const UNSENT: i64 = -1;

/// A sliding window over the 8-bit sequence space.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Window {
    /// First sequence number of the window.
    pub start: u8,
    /// Current window size; for `rwnd` this doubles as the advertised
    /// flow-control credit.
    pub size: u8,
}

/// Per-socket state. One fixed-size slot per KTP socket, all guarded by
/// the region mutex; while `in_use == 0` every other field is undefined.
#[repr(C)]
pub struct SocketSlot {
    /// 0 = free, 1 = allocated.
    pub in_use: i32,
    /// Pid of the owning application process.
    pub owner_pid: i32,
    /// Raw fd of the daemon-owned UDP endpoint. Only meaningful inside
    /// the daemon process.
    pub udp_fd: i32,
    /// Bound peer; 0.0.0.0:0 until bind records it.
    pub peer_ip: u32,
    pub peer_port: u16,

    /// Send window: base + peer-advertised capacity.
    pub swnd: Window,
    /// Receive window: next expected sequence + free receive slots.
    pub rwnd: Window,

    pub send_buf: [[u8; MAX_MSG_SIZE]; BUFFER_SLOTS],
    pub send_len: [u16; BUFFER_SLOTS],
    pub send_free_slots: i32,
    /// Sequence number → send buffer slot, NO_SLOT when unassigned.
    pub send_slot_of_seq: [i16; SEQ_SPACE],
    /// Last transmission time per sequence (Unix ms), UNSENT before the
    /// first transmission and after acknowledgment.
    pub sent_at_ms: [i64; SEQ_SPACE],

    pub recv_buf: [[u8; MAX_MSG_SIZE]; BUFFER_SLOTS],
    pub recv_len: [u16; BUFFER_SLOTS],
    pub recv_active: [u8; BUFFER_SLOTS],
    /// Next receive slot the application will drain.
    pub recv_base_idx: u32,
    /// Sequence number → receive buffer slot, NO_SLOT outside the
    /// currently mapped window.
    pub recv_slot_of_seq: [i16; SEQ_SPACE],

    /// Set when the receive buffer fills; the receiver emits a window
    /// update and clears it once space reappears.
    pub window_update_due: i32,
}

impl SocketSlot {
    /// Reset the transfer state of a freshly allocated socket: both
    /// windows at sequence 0 with full capacity, sequence maps cleared,
    /// receive slots 0..B mapped identity.
    pub fn init_transfer_state(&mut self) {
        self.peer_ip = 0;
        self.peer_port = 0;
        self.swnd = Window {
            start: 0,
            size: BUFFER_SLOTS as u8,
        };
        self.rwnd = Window {
            start: 0,
            size: BUFFER_SLOTS as u8,
        };
        self.send_len = [0; BUFFER_SLOTS];
        self.send_free_slots = BUFFER_SLOTS as i32;
        self.send_slot_of_seq = [NO_SLOT; SEQ_SPACE];
        self.sent_at_ms = [UNSENT; SEQ_SPACE];
        self.recv_len = [0; BUFFER_SLOTS];
        self.recv_active = [0; BUFFER_SLOTS];
        self.recv_base_idx = 0;
        self.recv_slot_of_seq = [NO_SLOT; SEQ_SPACE];
        for (i, m) in self.recv_slot_of_seq.iter_mut().take(BUFFER_SLOTS).enumerate() {
            *m = i as i16;
        }
        self.window_update_due = 0;
    }

    pub fn is_free(&self) -> bool {
        self.in_use == 0
    }

    /// The bound peer, if bind has recorded one.
    pub fn peer(&self) -> Option<SocketAddrV4> {
        if self.peer_ip == 0 && self.peer_port == 0 {
            None
        } else {
            Some(SocketAddrV4::new(
                Ipv4Addr::from(self.peer_ip),
                self.peer_port,
            ))
        }
    }

    pub fn set_peer(&mut self, addr: SocketAddrV4) {
        self.peer_ip = u32::from(*addr.ip());
        self.peer_port = addr.port();
    }
}

// ---------------------------------------------------------------------------
// State region
// ---------------------------------------------------------------------------

fn state_name(ns: &str) -> String {
    format!("{ns}_state")
}

fn state_lock_name(ns: &str) -> String {
    format!("{ns}_state_lock")
}

/// The socket slot table plus its lock.
pub struct StateRegion {
    shm: ShmSegment,
    lock: NamedMutex,
}

impl StateRegion {
    /// Daemon side: clear stale storage, create the segment and lock, and
    /// initialize every slot to free. A zeroed slot is a free slot, and
    /// fresh segments are zero-filled, but the daemon clears explicitly
    /// anyway.
    pub fn create(ns: &str) -> io::Result<Self> {
        Self::clear_storage(ns);
        let shm = ShmSegment::acquire(
            &state_name(ns),
            std::mem::size_of::<[SocketSlot; MAX_SOCKETS]>(),
            OpenMode::Create,
        )?;
        let lock = NamedMutex::create(&state_lock_name(ns))?;
        let region = Self { shm, lock };
        {
            let mut guard = region.lock()?;
            for slot in guard.iter_mut() {
                slot.in_use = 0;
            }
        }
        Ok(region)
    }

    /// Client side: attach to a daemon's existing region.
    pub fn attach(ns: &str) -> io::Result<Self> {
        let shm = ShmSegment::acquire(
            &state_name(ns),
            std::mem::size_of::<[SocketSlot; MAX_SOCKETS]>(),
            OpenMode::Open,
        )?;
        let lock = NamedMutex::open(&state_lock_name(ns))?;
        Ok(Self { shm, lock })
    }

    /// Lock the region and return an accessor for the slot table.
    pub fn lock(&self) -> io::Result<StateGuard<'_>> {
        let guard = self.lock.lock()?;
        Ok(StateGuard {
            slots: self.shm.as_mut_ptr() as *mut SocketSlot,
            _guard: guard,
        })
    }

    pub fn clear_storage(ns: &str) {
        ShmSegment::clear_storage(&state_name(ns));
        NamedMutex::clear_storage(&state_lock_name(ns));
    }
}

/// Locked view of the slot table. Holds the region mutex until dropped.
pub struct StateGuard<'a> {
    slots: *mut SocketSlot,
    _guard: MutexGuard<'a>,
}

impl Deref for StateGuard<'_> {
    type Target = [SocketSlot; MAX_SOCKETS];

    fn deref(&self) -> &Self::Target {
        // The segment was sized for exactly this array, and the mutex
        // held by _guard serializes every mapping of it.
        unsafe { &*(self.slots as *const [SocketSlot; MAX_SOCKETS]) }
    }
}

impl DerefMut for StateGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *(self.slots as *mut [SocketSlot; MAX_SOCKETS]) }
    }
}

// ---------------------------------------------------------------------------
// Broker mailbox
// ---------------------------------------------------------------------------

/// Mailbox operation: create a UDP endpoint.
pub const OP_CREATE: i32 = 1;
/// Mailbox operation: bind an endpoint to a local address.
pub const OP_BIND: i32 = 2;

/// The one-request broker mailbox. The client fills `op` (+ arguments),
/// posts `req`, and reads the reply after `rep`; `udp_fd == -1` signals
/// failure and `err` carries the daemon-side errno.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct BrokerMailbox {
    pub op: i32,
    pub udp_fd: i32,
    pub ip: u32,
    pub port: u16,
    pub err: i32,
}

fn broker_name(ns: &str) -> String {
    format!("{ns}_broker")
}

fn broker_lock_name(ns: &str) -> String {
    format!("{ns}_broker_lock")
}

fn req_name(ns: &str) -> String {
    format!("{ns}_req")
}

fn rep_name(ns: &str) -> String {
    format!("{ns}_rep")
}

/// How long a client waits for the broker before concluding the daemon
/// is gone.
const DIALOGUE_TIMEOUT: Duration = Duration::from_secs(5);

/// The broker request channel: mailbox segment, dialogue lock, and the
/// request/reply rendezvous semaphores.
pub struct BrokerChannel {
    shm: ShmSegment,
    lock: NamedMutex,
    req: NamedSemaphore,
    rep: NamedSemaphore,
}

impl BrokerChannel {
    pub fn create(ns: &str) -> io::Result<Self> {
        Self::clear_storage(ns);
        let shm = ShmSegment::acquire(
            &broker_name(ns),
            std::mem::size_of::<BrokerMailbox>(),
            OpenMode::Create,
        )?;
        let lock = NamedMutex::create(&broker_lock_name(ns))?;
        let req = NamedSemaphore::create(&req_name(ns), 0)?;
        let rep = NamedSemaphore::create(&rep_name(ns), 0)?;
        let channel = Self { shm, lock, req, rep };
        channel.with_mailbox(|mb| *mb = BrokerMailbox::default());
        Ok(channel)
    }

    pub fn attach(ns: &str) -> io::Result<Self> {
        let shm = ShmSegment::acquire(
            &broker_name(ns),
            std::mem::size_of::<BrokerMailbox>(),
            OpenMode::Open,
        )?;
        let lock = NamedMutex::open(&broker_lock_name(ns))?;
        let req = NamedSemaphore::open(&req_name(ns))?;
        let rep = NamedSemaphore::open(&rep_name(ns))?;
        Ok(Self { shm, lock, req, rep })
    }

    /// Client side: run one request/reply dialogue. The broker lock is
    /// held for the whole exchange, so dialogues from different processes
    /// never interleave on the mailbox.
    pub fn request(&self, fill: impl FnOnce(&mut BrokerMailbox)) -> io::Result<BrokerMailbox> {
        let _guard = self.lock.lock()?;
        self.with_mailbox(|mb| {
            *mb = BrokerMailbox::default();
            fill(mb);
        });
        self.req.post(1)?;
        if !self.rep.wait(Some(DIALOGUE_TIMEOUT))? {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "broker did not answer",
            ));
        }
        let reply = self.with_mailbox(|mb| {
            let copy = *mb;
            *mb = BrokerMailbox::default();
            copy
        });
        Ok(reply)
    }

    /// Daemon side: block for the next request, up to `timeout`.
    pub fn wait_request(&self, timeout: Duration) -> io::Result<bool> {
        self.req.wait(Some(timeout))
    }

    /// Daemon side: release the client parked on the reply semaphore.
    pub fn complete(&self) -> io::Result<()> {
        self.rep.post(1)
    }

    /// Access the mailbox. Daemon-side calls are safe without the lock
    /// only between `wait_request` returning true and `complete` — the
    /// requesting client holds the dialogue lock and is parked on `rep`.
    pub fn with_mailbox<R>(&self, f: impl FnOnce(&mut BrokerMailbox) -> R) -> R {
        let mb = unsafe { &mut *(self.shm.as_mut_ptr() as *mut BrokerMailbox) };
        f(mb)
    }

    pub fn clear_storage(ns: &str) {
        ShmSegment::clear_storage(&broker_name(ns));
        NamedMutex::clear_storage(&broker_lock_name(ns));
        NamedSemaphore::clear_storage(&req_name(ns));
        NamedSemaphore::clear_storage(&rep_name(ns));
    }
}

/// Remove every IPC object of a namespace. Used by daemon shutdown and
/// by `ktpd` before creating a fresh instance.
pub fn clear_storage(ns: &str) {
    StateRegion::clear_storage(ns);
    BrokerChannel::clear_storage(ns);
}
