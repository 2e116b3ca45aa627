// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The transport daemon.
//
// One daemon process owns every UDP endpoint and all transport state for
// its IPC namespace. Four cooperating activities share the control
// region with the client libraries:
//
//   broker   — serves endpoint create/bind requests from clients
//   receiver — drains inbound datagrams, dispatches DATA and ACK,
//              emits ACKs and window updates
//   sender   — drives first transmissions and timeout retransmissions
//   reaper   — reclaims sockets whose owning process died
//
// Daemon::create builds the IPC namespace from scratch (stale objects
// are cleared first); DaemonHandle::shutdown stops the workers, closes
// the endpoints, and removes the namespace again.

mod broker;
mod receiver;
mod reaper;
mod sender;

use std::collections::HashMap;
use std::io;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{info, warn};

use crate::config::DaemonConfig;
use crate::region::{self, BrokerChannel, StateRegion};

/// Current wall-clock time in Unix milliseconds, the timestamp unit of
/// the shared region's per-sequence send times.
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// State shared by the four worker activities.
pub(crate) struct DaemonInner {
    pub(crate) cfg: DaemonConfig,
    pub(crate) state: StateRegion,
    pub(crate) broker: BrokerChannel,
    /// Daemon-owned UDP endpoints, keyed by the raw fd recorded in the
    /// socket slots. Removing an entry closes the endpoint.
    pub(crate) endpoints: Mutex<HashMap<i32, UdpSocket>>,
    pub(crate) shutdown: AtomicBool,
}

impl DaemonInner {
    pub(crate) fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Sleep for `total`, polling the shutdown flag. Returns false when
    /// shutdown was requested before the time elapsed.
    pub(crate) fn sleep_poll(&self, total: Duration) -> bool {
        let step = Duration::from_millis(25);
        let mut elapsed = Duration::ZERO;
        while elapsed < total {
            if self.shutting_down() {
                return false;
            }
            let d = step.min(total - elapsed);
            thread::sleep(d);
            elapsed += d;
        }
        !self.shutting_down()
    }

    /// Emit one datagram from the endpoint `udp_fd` to `dest`. Endpoints
    /// can disappear under us (reaper, shutdown); that and send failures
    /// are logged, not propagated — recovery is retransmission.
    pub(crate) fn send_datagram(&self, udp_fd: i32, buf: &[u8], dest: std::net::SocketAddrV4) {
        let endpoints = self.endpoints.lock().unwrap();
        if let Some(sock) = endpoints.get(&udp_fd) {
            if let Err(e) = sock.send_to(buf, dest) {
                warn!("endpoint fd {udp_fd}: send to {dest} failed: {e}");
            }
        }
    }
}

/// A created-but-not-yet-running daemon.
pub struct Daemon {
    inner: Arc<DaemonInner>,
}

impl Daemon {
    /// Create the IPC namespace (clearing any stale leftovers) and
    /// initialize every socket slot to free.
    pub fn create(cfg: DaemonConfig) -> io::Result<Self> {
        let state = StateRegion::create(&cfg.namespace)?;
        let broker = BrokerChannel::create(&cfg.namespace)?;
        info!(
            "daemon: namespace '{}' ready (timeout {:?}, drop probability {})",
            cfg.namespace, cfg.timeout, cfg.drop_prob
        );
        Ok(Self {
            inner: Arc::new(DaemonInner {
                cfg,
                state,
                broker,
                endpoints: Mutex::new(HashMap::new()),
                shutdown: AtomicBool::new(false),
            }),
        })
    }

    /// Spawn the four worker threads and return the running daemon's
    /// handle.
    pub fn spawn(self) -> io::Result<DaemonHandle> {
        let workers: [(&str, fn(&DaemonInner)); 4] = [
            ("ktp-broker", broker::run),
            ("ktp-receiver", receiver::run),
            ("ktp-sender", sender::run),
            ("ktp-reaper", reaper::run),
        ];

        let mut threads = Vec::with_capacity(workers.len());
        for (name, entry) in workers {
            let inner = Arc::clone(&self.inner);
            let spawned = thread::Builder::new()
                .name(name.to_string())
                .spawn(move || entry(&inner));
            match spawned {
                Ok(t) => threads.push(t),
                Err(e) => {
                    // Unwind whatever already started before reporting.
                    self.inner.shutdown.store(true, Ordering::Release);
                    for t in threads {
                        let _ = t.join();
                    }
                    return Err(e);
                }
            }
        }

        Ok(DaemonHandle {
            inner: self.inner,
            threads,
        })
    }
}

/// Handle to a running daemon. Dropping it (or calling [`shutdown`])
/// stops the workers, closes every endpoint, and removes the IPC
/// namespace.
///
/// [`shutdown`]: DaemonHandle::shutdown
pub struct DaemonHandle {
    inner: Arc<DaemonInner>,
    threads: Vec<JoinHandle<()>>,
}

impl DaemonHandle {
    /// Orderly teardown: stop workers, close endpoints, unlink the
    /// namespace.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
        self.inner.endpoints.lock().unwrap().clear();
        region::clear_storage(&self.inner.cfg.namespace);
        info!("daemon: namespace '{}' shut down", self.inner.cfg.namespace);
    }
}

impl Drop for DaemonHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
