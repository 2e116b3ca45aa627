// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The sender: every T/2, scan each socket's outstanding window.
//
// If any transmitted sequence in the window has aged past T, the whole
// assigned window is retransmitted (Go-Back-N — the ACKs are cumulative,
// so the peer re-acknowledges everything it has). Otherwise the unsent
// sequences in the window — freshly queued application payloads — get
// their first transmission. Both paths share the encode path and stamp
// the transmission time.

use log::{debug, error, info};

use super::{now_ms, DaemonInner};
use crate::config::MAX_SOCKETS;
use crate::region::{SocketSlot, NO_SLOT, UNSENT};
use crate::seq;
use crate::wire;

pub(crate) fn run(inner: &DaemonInner) {
    let mut frame = Vec::with_capacity(wire::MAX_DATAGRAM);
    let timeout_ms = inner.cfg.timeout.as_millis() as i64;

    info!("sender: running");
    while inner.sleep_poll(inner.cfg.timeout / 2) {
        let mut slots = match inner.state.lock() {
            Ok(slots) => slots,
            Err(e) => {
                error!("sender: state lock failed: {e}");
                continue;
            }
        };

        let now = now_ms();
        for i in 0..MAX_SOCKETS {
            let slot = &mut slots[i];
            if slot.is_free() {
                continue;
            }
            let Some(peer) = slot.peer() else {
                // Opened but not yet bound; nothing can be in the buffer.
                continue;
            };

            let timed_out = seq::window(slot.swnd.start, slot.swnd.size).any(|s| {
                slot.send_slot_of_seq[s as usize] != NO_SLOT
                    && slot.sent_at_ms[s as usize] != UNSENT
                    && now - slot.sent_at_ms[s as usize] >= timeout_ms
            });

            if timed_out {
                info!("sender: sock {i} timeout, retransmitting window");
                for s in seq::window(slot.swnd.start, slot.swnd.size) {
                    if slot.send_slot_of_seq[s as usize] != NO_SLOT {
                        transmit(inner, i, slot, s, peer, now, &mut frame, true);
                    }
                }
            } else {
                for s in seq::window(slot.swnd.start, slot.swnd.size) {
                    if slot.send_slot_of_seq[s as usize] != NO_SLOT
                        && slot.sent_at_ms[s as usize] == UNSENT
                    {
                        transmit(inner, i, slot, s, peer, now, &mut frame, false);
                    }
                }
            }
        }
    }
}

fn transmit(
    inner: &DaemonInner,
    idx: usize,
    slot: &mut SocketSlot,
    s: u8,
    peer: std::net::SocketAddrV4,
    now: i64,
    frame: &mut Vec<u8>,
    retransmission: bool,
) {
    let b = slot.send_slot_of_seq[s as usize] as usize;
    let len = slot.send_len[b] as usize;
    wire::encode_data(s, &slot.send_buf[b][..len], frame);
    inner.send_datagram(slot.udp_fd, frame, peer);
    slot.sent_at_ms[s as usize] = now;
    debug!(
        "sender: sock {idx} {} seq {s} ({len} bytes)",
        if retransmission { "retransmitted" } else { "sent" }
    );
}
