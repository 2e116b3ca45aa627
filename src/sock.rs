// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The client-side socket API.
//
// A KtpContext attaches to a running daemon's IPC namespace and exposes
// the socket calls. The library never touches the network: send buffers
// a payload in the shared region for the daemon's sender thread, recv
// drains what the daemon's receiver thread stored. Only socket/bind talk
// to the daemon directly, through the broker mailbox.
//
// No call blocks on the protocol: recv returns NoMessage immediately
// when the buffer is empty, send returns NoSpace immediately when it is
// full. Callers poll at their own cadence.

use std::net::{Ipv4Addr, SocketAddrV4};

use log::debug;

use crate::config::{ClientConfig, BUFFER_SLOTS, MAX_MSG_SIZE, MAX_SOCKETS, SEQ_SPACE, SOCK_KTP};
use crate::error::{KtpError, Result};
use crate::region::{BrokerChannel, StateRegion, NO_SLOT, OP_BIND, OP_CREATE, UNSENT};
use crate::seq;

/// Handle to a daemon's transport instance. One per process is the
/// expected shape; every socket call goes through it.
pub struct KtpContext {
    state: StateRegion,
    broker: BrokerChannel,
}

impl KtpContext {
    /// Attach to the daemon's shared region and primitives. Fails with
    /// [`KtpError::DaemonNotRunning`] when they do not exist.
    pub fn attach(cfg: &ClientConfig) -> Result<Self> {
        let state = StateRegion::attach(&cfg.namespace).map_err(KtpError::DaemonNotRunning)?;
        let broker = BrokerChannel::attach(&cfg.namespace).map_err(KtpError::DaemonNotRunning)?;
        Ok(Self { state, broker })
    }

    /// Attach using the default namespace.
    pub fn attach_default() -> Result<Self> {
        Self::attach(&ClientConfig::default())
    }

    /// Create a KTP socket. `domain` must be `AF_INET` and `sock_type`
    /// must be [`SOCK_KTP`]. Returns the socket descriptor.
    pub fn socket(&self, domain: i32, sock_type: i32, _protocol: i32) -> Result<i32> {
        if domain != libc::AF_INET || sock_type != SOCK_KTP {
            return Err(KtpError::InvalidArgument);
        }

        let pid = std::process::id() as i32;
        let idx = {
            let mut slots = self.state.lock()?;
            let idx = slots
                .iter()
                .position(|s| s.is_free())
                .ok_or(KtpError::NoSpace)?;
            slots[idx].in_use = 1;
            slots[idx].owner_pid = pid;
            idx
        };

        // Ask the broker for a UDP endpoint; on any failure the slot
        // claimed above must be released again.
        let reply = match self.broker.request(|mb| mb.op = OP_CREATE) {
            Ok(reply) => reply,
            Err(e) => {
                self.release_slot(idx);
                return Err(e.into());
            }
        };
        if reply.udp_fd < 0 {
            self.release_slot(idx);
            return Err(KtpError::Broker { errno: reply.err });
        }

        let mut slots = self.state.lock()?;
        slots[idx].udp_fd = reply.udp_fd;
        slots[idx].init_transfer_state();
        debug!("socket {idx}: created (endpoint fd {})", reply.udp_fd);
        Ok(idx as i32)
    }

    /// Bind the caller's socket: the underlying endpoint to `local`, and
    /// the transport to the single permitted peer `remote`. Must precede
    /// any send. Targets the caller's oldest socket that has no peer
    /// recorded yet.
    pub fn bind(&self, local: SocketAddrV4, remote: SocketAddrV4) -> Result<()> {
        let pid = std::process::id() as i32;
        let (idx, udp_fd) = {
            let slots = self.state.lock()?;
            let idx = slots
                .iter()
                .position(|s| !s.is_free() && s.owner_pid == pid && s.peer().is_none())
                .ok_or(KtpError::InvalidArgument)?;
            (idx, slots[idx].udp_fd)
        };

        let reply = self.broker.request(|mb| {
            mb.op = OP_BIND;
            mb.udp_fd = udp_fd;
            mb.ip = u32::from(*local.ip());
            mb.port = local.port();
        })?;
        if reply.udp_fd < 0 {
            return Err(KtpError::Broker { errno: reply.err });
        }

        let mut slots = self.state.lock()?;
        slots[idx].set_peer(remote);
        debug!("socket {idx}: bound {local} -> {remote}");
        Ok(())
    }

    /// Queue `buf` for reliable delivery to `dest`, which must equal the
    /// bound peer. Returns the number of bytes accepted (always
    /// `buf.len()`); transmission happens asynchronously in the daemon.
    pub fn send_to(&self, fd: i32, buf: &[u8], dest: SocketAddrV4) -> Result<usize> {
        let idx = check_fd(fd)?;
        if buf.len() > MAX_MSG_SIZE {
            return Err(KtpError::InvalidArgument);
        }

        let mut slots = self.state.lock()?;
        let slot = &mut slots[idx];
        if slot.is_free() {
            return Err(KtpError::InvalidArgument);
        }
        if slot.peer() != Some(dest) {
            return Err(KtpError::NotBound);
        }
        if slot.send_free_slots <= 0 {
            return Err(KtpError::NoSpace);
        }

        // Next unassigned sequence number at or after the window base.
        // The guard caps the scan at one full lap of the sequence ring.
        let mut s = slot.swnd.start;
        let mut checked = 0;
        while slot.send_slot_of_seq[s as usize] != NO_SLOT {
            s = seq::next(s);
            checked += 1;
            if checked >= SEQ_SPACE {
                return Err(KtpError::NoSpace);
            }
        }

        // First buffer slot not referenced by any in-flight sequence.
        let mut referenced = [false; BUFFER_SLOTS];
        for &m in slot.send_slot_of_seq.iter() {
            if m != NO_SLOT {
                referenced[m as usize] = true;
            }
        }
        let b = referenced
            .iter()
            .position(|&r| !r)
            .ok_or(KtpError::NoSpace)?;

        slot.send_slot_of_seq[s as usize] = b as i16;
        slot.send_buf[b][..buf.len()].copy_from_slice(buf);
        slot.send_len[b] = buf.len() as u16;
        slot.sent_at_ms[s as usize] = UNSENT;
        slot.send_free_slots -= 1;
        debug!("socket {idx}: queued seq {s} ({} bytes)", buf.len());
        Ok(buf.len())
    }

    /// Drain the oldest received payload into `buf`, returning the
    /// copied length and the peer address. [`KtpError::NoMessage`] when
    /// nothing has been delivered yet.
    pub fn recv_from(&self, fd: i32, buf: &mut [u8]) -> Result<(usize, SocketAddrV4)> {
        let idx = check_fd(fd)?;

        let mut slots = self.state.lock()?;
        let slot = &mut slots[idx];
        if slot.is_free() {
            return Err(KtpError::InvalidArgument);
        }

        let b = slot.recv_base_idx as usize;
        if slot.recv_active[b] == 0 {
            return Err(KtpError::NoMessage);
        }

        let n = (slot.recv_len[b] as usize).min(buf.len());
        buf[..n].copy_from_slice(&slot.recv_buf[b][..n]);
        slot.recv_active[b] = 0;

        // Retire this slot's sequence number and hand the slot to the
        // sequence one full buffer ahead, keeping the window sliding.
        if let Some(s) = (0..SEQ_SPACE).find(|&s| slot.recv_slot_of_seq[s] == b as i16) {
            slot.recv_slot_of_seq[s] = NO_SLOT;
            slot.recv_slot_of_seq[(s + BUFFER_SLOTS) % SEQ_SPACE] = b as i16;
            slot.recv_base_idx = ((b + 1) % BUFFER_SLOTS) as u32;
            if (slot.rwnd.size as usize) < BUFFER_SLOTS {
                slot.rwnd.size += 1;
                // Space just reappeared after a full buffer: have the
                // receiver advertise it with a window update.
                if slot.rwnd.size == 1 {
                    slot.window_update_due = 1;
                }
            }
        }

        let src = slot
            .peer()
            .unwrap_or_else(|| SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
        Ok((n, src))
    }

    /// Release the socket slot. The daemon closes the underlying
    /// endpoint (reaper or shutdown path).
    pub fn close(&self, fd: i32) -> Result<()> {
        let idx = check_fd(fd)?;
        let mut slots = self.state.lock()?;
        if slots[idx].is_free() {
            return Err(KtpError::InvalidArgument);
        }
        slots[idx].in_use = 0;
        debug!("socket {idx}: closed");
        Ok(())
    }

    fn release_slot(&self, idx: usize) {
        if let Ok(mut slots) = self.state.lock() {
            slots[idx].in_use = 0;
        }
    }
}

fn check_fd(fd: i32) -> Result<usize> {
    if fd < 0 || fd as usize >= MAX_SOCKETS {
        return Err(KtpError::InvalidArgument);
    }
    Ok(fd as usize)
}
