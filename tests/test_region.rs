// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Control-region bootstrap tests: namespace lifecycle and the slot-table
// view the client library and daemon share.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use ktp::config::BUFFER_SLOTS;
use ktp::region::StateRegion;
use ktp::{ClientConfig, Daemon, DaemonConfig, KtpContext, KtpError, SOCK_KTP};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_ns(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("ktp_r_{prefix}_{}_{n}", std::process::id())
}

fn daemon_config(ns: &str) -> DaemonConfig {
    DaemonConfig {
        namespace: ns.to_string(),
        timeout: Duration::from_millis(300),
        drop_prob: 0.0,
    }
}

#[test]
fn attach_without_daemon_fails() {
    let ns = unique_ns("nodaemon");
    match KtpContext::attach(&ClientConfig::with_namespace(&ns)) {
        Err(KtpError::DaemonNotRunning(_)) => {}
        Ok(_) => panic!("attached to a namespace no daemon created"),
        Err(e) => panic!("expected DaemonNotRunning, got {e}"),
    }
}

#[test]
fn daemon_creates_and_clears_namespace() {
    let ns = unique_ns("lifecycle");
    let handle = Daemon::create(daemon_config(&ns))
        .expect("create")
        .spawn()
        .expect("spawn");

    // Clients can attach while the daemon lives...
    KtpContext::attach(&ClientConfig::with_namespace(&ns)).expect("attach");

    handle.shutdown();

    // ...and the namespace is gone afterwards.
    match KtpContext::attach(&ClientConfig::with_namespace(&ns)) {
        Err(KtpError::DaemonNotRunning(_)) => {}
        other => panic!("namespace survived shutdown: {:?}", other.is_ok()),
    }
}

#[test]
fn fresh_region_has_only_free_slots() {
    let ns = unique_ns("freshslots");
    let handle = Daemon::create(daemon_config(&ns))
        .expect("create")
        .spawn()
        .expect("spawn");

    let region = StateRegion::attach(&ns).expect("attach region");
    {
        let slots = region.lock().expect("lock");
        assert!(slots.iter().all(|s| s.is_free()));
    }

    handle.shutdown();
}

#[test]
fn open_socket_initializes_slot_state() {
    let ns = unique_ns("slotinit");
    let handle = Daemon::create(daemon_config(&ns))
        .expect("create")
        .spawn()
        .expect("spawn");
    let ctx = KtpContext::attach(&ClientConfig::with_namespace(&ns)).expect("attach");

    let fd = ctx.socket(libc::AF_INET, SOCK_KTP, 0).expect("socket");

    let region = StateRegion::attach(&ns).expect("attach region");
    {
        let slots = region.lock().expect("lock");
        let slot = &slots[fd as usize];
        assert!(!slot.is_free());
        assert_eq!(slot.owner_pid, std::process::id() as i32);
        assert!(slot.peer().is_none());
        assert_eq!(slot.swnd.start, 0);
        assert_eq!(slot.swnd.size, BUFFER_SLOTS as u8);
        assert_eq!(slot.rwnd.size, BUFFER_SLOTS as u8);
        assert_eq!(slot.send_free_slots, BUFFER_SLOTS as i32);
    }

    ctx.close(fd).expect("close");
    {
        let slots = region.lock().expect("lock");
        assert!(slots[fd as usize].is_free());
    }

    handle.shutdown();
}
