// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The reaper: every T, free the slots of sockets whose owning process
// no longer exists, and close their endpoints. This is the only
// reclamation path for clients that exit without close().

use log::{error, info};

use super::DaemonInner;
use crate::config::MAX_SOCKETS;
use crate::process::pid_alive;

pub(crate) fn run(inner: &DaemonInner) {
    info!("reaper: running");
    while inner.sleep_poll(inner.cfg.timeout) {
        let mut slots = match inner.state.lock() {
            Ok(slots) => slots,
            Err(e) => {
                error!("reaper: state lock failed: {e}");
                continue;
            }
        };

        for i in 0..MAX_SOCKETS {
            let slot = &mut slots[i];
            if slot.is_free() || pid_alive(slot.owner_pid) {
                continue;
            }
            info!(
                "reaper: sock {i} owner pid {} is gone, reclaiming",
                slot.owner_pid
            );
            let fd = slot.udp_fd;
            slot.in_use = 0;
            // Dropping the table entry closes the endpoint.
            inner.endpoints.lock().unwrap().remove(&fd);
        }
    }
}
