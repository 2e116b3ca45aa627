// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The receiver: drains inbound datagrams for every allocated socket and
// drives the receive window and the peer's send window.
//
// Each pass: emit any overdue window updates and snapshot the watched
// endpoints (under the state lock), select on them with a T/2 timeout,
// then process whatever arrived. Inbound datagrams are drop-sampled
// before parsing to exercise the retransmission path; malformed ones are
// discarded silently.

use std::io;
use std::net::SocketAddr;
use std::net::SocketAddrV4;
use std::ptr;
use std::time::Duration;

use log::{debug, error, info};
use rand::Rng;

use super::DaemonInner;
use crate::config::{BUFFER_SLOTS, MAX_SOCKETS};
use crate::region::{SocketSlot, NO_SLOT, UNSENT};
use crate::seq;
use crate::wire::{self, Frame};

pub(crate) fn run(inner: &DaemonInner) {
    let tick = inner.cfg.timeout / 2;
    let mut rng = rand::thread_rng();
    let mut scratch = [0u8; wire::MAX_DATAGRAM + 16];

    info!("receiver: running");
    while !inner.shutting_down() {
        // Window updates + snapshot of (slot index, endpoint fd) pairs.
        let mut watched: Vec<(usize, i32)> = Vec::with_capacity(MAX_SOCKETS);
        match inner.state.lock() {
            Ok(mut slots) => {
                for i in 0..MAX_SOCKETS {
                    let slot = &mut slots[i];
                    if slot.is_free() {
                        continue;
                    }
                    if slot.window_update_due != 0 && slot.rwnd.size > 0 {
                        slot.window_update_due = 0;
                        if let Some(peer) = slot.peer() {
                            let ack = seq::prev(slot.rwnd.start);
                            info!(
                                "receiver: sock {i} window update: ack {ack} window {}",
                                slot.rwnd.size
                            );
                            let frame = wire::encode_ack(ack, slot.rwnd.size);
                            inner.send_datagram(slot.udp_fd, &frame, peer);
                        }
                    }
                    watched.push((i, slot.udp_fd));
                }
            }
            Err(e) => {
                error!("receiver: state lock failed: {e}");
                std::thread::sleep(tick);
                continue;
            }
        }

        let ready = match select_readable(&watched, tick) {
            Ok(ready) => ready,
            // EINTR, or EBADF when the reaper closed an endpoint after
            // the snapshot; the next pass rebuilds the set.
            Err(_) => continue,
        };
        if ready.is_empty() {
            continue;
        }

        let mut slots = match inner.state.lock() {
            Ok(slots) => slots,
            Err(e) => {
                error!("receiver: state lock failed: {e}");
                continue;
            }
        };
        for (i, fd) in watched {
            if !ready.contains(&fd) {
                continue;
            }
            let slot = &mut slots[i];
            if slot.is_free() || slot.udp_fd != fd {
                continue;
            }

            let received = {
                let endpoints = inner.endpoints.lock().unwrap();
                match endpoints.get(&fd) {
                    Some(sock) => sock.recv_from(&mut scratch),
                    None => continue,
                }
            };
            let (len, src) = match received {
                Ok(ok) => ok,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    debug!("receiver: sock {i} read failed: {e}");
                    continue;
                }
            };
            let src = match src {
                SocketAddr::V4(v4) => v4,
                SocketAddr::V6(_) => continue,
            };

            if rng.gen::<f64>() < inner.cfg.drop_prob {
                debug!("receiver: sock {i} dropped a datagram (simulated loss)");
                continue;
            }

            match Frame::parse(&scratch[..len]) {
                Ok(Frame::Data { seq, payload }) => {
                    process_data(inner, i, slot, seq, payload, src);
                }
                Ok(Frame::Ack { seq, window }) => {
                    process_ack(i, slot, seq, window);
                }
                Err(e) => {
                    debug!("receiver: sock {i} discarding malformed datagram: {e}");
                }
            }
        }
    }
}

/// Store a DATA arrival and answer with the cumulative ACK.
fn process_data(
    inner: &DaemonInner,
    idx: usize,
    slot: &mut SocketSlot,
    q: u8,
    payload: &[u8],
    src: SocketAddrV4,
) {
    debug!("receiver: sock {idx} DATA seq {q} len {}", payload.len());

    if q == slot.rwnd.start {
        // In order: store, then advance the window base past the
        // contiguous prefix of already-stored arrivals. The advance is
        // bounded by one buffer's worth so a fully mapped ring cannot
        // loop it forever.
        let m = slot.recv_slot_of_seq[q as usize];
        if m != NO_SLOT {
            let b = m as usize;
            slot.recv_buf[b][..payload.len()].copy_from_slice(payload);
            slot.recv_len[b] = payload.len() as u16;
            slot.recv_active[b] = 1;
            slot.rwnd.size -= 1;

            let mut next = q;
            for _ in 0..BUFFER_SLOTS {
                next = seq::next(next);
                slot.rwnd.start = next;
                let m = slot.recv_slot_of_seq[next as usize];
                if m == NO_SLOT || slot.recv_active[m as usize] == 0 {
                    break;
                }
            }
        }
    } else if seq::in_window(q, slot.rwnd.start, BUFFER_SLOTS as u8) {
        // Out of order but inside the window: store it where its
        // sequence maps, once.
        let m = slot.recv_slot_of_seq[q as usize];
        if m != NO_SLOT && slot.recv_active[m as usize] == 0 {
            let b = m as usize;
            slot.recv_buf[b][..payload.len()].copy_from_slice(payload);
            slot.recv_len[b] = payload.len() as u16;
            slot.recv_active[b] = 1;
            slot.rwnd.size -= 1;
        }
    }
    // Outside the window: nothing stored; the ACK below repeats our
    // state and re-teaches the peer.

    if slot.rwnd.size == 0 {
        slot.window_update_due = 1;
        info!("receiver: sock {idx} receive buffer full");
    }

    let ack = seq::prev(slot.rwnd.start);
    debug!(
        "receiver: sock {idx} ACK seq {ack} window {} -> {src}",
        slot.rwnd.size
    );
    let frame = wire::encode_ack(ack, slot.rwnd.size);
    inner.send_datagram(slot.udp_fd, &frame, src);
}

/// Apply a cumulative ACK and the peer's window advertisement.
fn process_ack(idx: usize, slot: &mut SocketSlot, a: u8, w: u8) {
    debug!("receiver: sock {idx} ACK seq {a} window {w}");

    if seq::in_window(a, slot.swnd.start, slot.swnd.size) {
        // Release every sequence from the window base through the acked
        // one; the cumulative ACK covers them all.
        let mut c = slot.swnd.start;
        loop {
            if slot.send_slot_of_seq[c as usize] != NO_SLOT {
                slot.send_slot_of_seq[c as usize] = NO_SLOT;
                slot.send_free_slots += 1;
            }
            slot.sent_at_ms[c as usize] = UNSENT;
            let done = c == a;
            c = seq::next(c);
            if done {
                break;
            }
        }
        slot.swnd.start = seq::next(a);
        debug!(
            "receiver: sock {idx} send window base now {} ({} slots free)",
            slot.swnd.start, slot.send_free_slots
        );
    }

    // A duplicate ACK refreshes send capacity without freeing anything.
    slot.swnd.size = w;
}

/// Wait up to `timeout` for any of the watched fds to become readable.
fn select_readable(watched: &[(usize, i32)], timeout: Duration) -> io::Result<Vec<i32>> {
    if watched.is_empty() {
        std::thread::sleep(timeout);
        return Ok(Vec::new());
    }

    unsafe {
        let mut set: libc::fd_set = std::mem::zeroed();
        libc::FD_ZERO(&mut set);
        let mut max_fd = 0;
        for &(_, fd) in watched {
            libc::FD_SET(fd, &mut set);
            max_fd = max_fd.max(fd);
        }

        let mut tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        let n = libc::select(
            max_fd + 1,
            &mut set,
            ptr::null_mut(),
            ptr::null_mut(),
            &mut tv,
        );
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        if n == 0 {
            return Ok(Vec::new());
        }
        Ok(watched
            .iter()
            .map(|&(_, fd)| fd)
            .filter(|&fd| libc::FD_ISSET(fd, &set))
            .collect())
    }
}
