// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// End-to-end transport tests: each test runs its own daemon in-process
// under a unique IPC namespace with a short retransmission timeout, and
// drives two sockets bound to each other over loopback UDP.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use ktp::config::{BUFFER_SLOTS, MAX_SOCKETS};
use ktp::{ClientConfig, Daemon, DaemonConfig, DaemonHandle, KtpContext, KtpError, SOCK_KTP};

static COUNTER: AtomicUsize = AtomicUsize::new(0);
static PORT: AtomicUsize = AtomicUsize::new(41_000);

const LOCALHOST: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

fn unique_ns(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("ktp_t_{prefix}_{}_{n}", std::process::id())
}

fn start_daemon(ns: &str, timeout: Duration, drop_prob: f64) -> DaemonHandle {
    let cfg = DaemonConfig {
        namespace: ns.to_string(),
        timeout,
        drop_prob,
    };
    Daemon::create(cfg)
        .expect("create daemon")
        .spawn()
        .expect("spawn daemon")
}

/// Two sockets in this process bound to each other over loopback.
fn bound_pair(ctx: &KtpContext) -> (i32, SocketAddrV4, i32, SocketAddrV4) {
    let base = PORT.fetch_add(2, Ordering::Relaxed) as u16;
    let addr_a = SocketAddrV4::new(LOCALHOST, base);
    let addr_b = SocketAddrV4::new(LOCALHOST, base + 1);

    let a = ctx.socket(libc::AF_INET, SOCK_KTP, 0).expect("socket a");
    ctx.bind(addr_a, addr_b).expect("bind a");
    let b = ctx.socket(libc::AF_INET, SOCK_KTP, 0).expect("socket b");
    ctx.bind(addr_b, addr_a).expect("bind b");

    (a, addr_a, b, addr_b)
}

/// Poll recv until a message arrives or `limit` elapses.
fn recv_within(ctx: &KtpContext, fd: i32, limit: Duration) -> Option<Vec<u8>> {
    let deadline = Instant::now() + limit;
    let mut buf = [0u8; 600];
    loop {
        match ctx.recv_from(fd, &mut buf) {
            Ok((n, _src)) => return Some(buf[..n].to_vec()),
            Err(KtpError::NoMessage) => {
                if Instant::now() >= deadline {
                    return None;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => panic!("recv failed: {e}"),
        }
    }
}

/// Poll send until the buffer accepts the payload or `limit` elapses.
fn send_within(ctx: &KtpContext, fd: i32, payload: &[u8], dest: SocketAddrV4, limit: Duration) {
    let deadline = Instant::now() + limit;
    loop {
        match ctx.send_to(fd, payload, dest) {
            Ok(n) => {
                assert_eq!(n, payload.len());
                return;
            }
            Err(KtpError::NoSpace) => {
                assert!(Instant::now() < deadline, "send buffer never freed");
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => panic!("send failed: {e}"),
        }
    }
}

#[test]
fn single_message_delivery() {
    let ns = unique_ns("single");
    let daemon = start_daemon(&ns, Duration::from_millis(300), 0.0);
    let ctx = KtpContext::attach(&ClientConfig::with_namespace(&ns)).expect("attach");
    let (a, addr_a, b, addr_b) = bound_pair(&ctx);

    assert_eq!(ctx.send_to(a, b"hello", addr_b).expect("send"), 5);
    let got = recv_within(&ctx, b, Duration::from_secs(5)).expect("nothing delivered");
    assert_eq!(got, b"hello");

    // And the reverse direction over the same pair.
    assert_eq!(ctx.send_to(b, b"world", addr_a).expect("send back"), 5);
    let got = recv_within(&ctx, a, Duration::from_secs(5)).expect("nothing delivered back");
    assert_eq!(got, b"world");

    daemon.shutdown();
}

#[test]
fn in_order_delivery_under_loss() {
    let ns = unique_ns("loss");
    let daemon = start_daemon(&ns, Duration::from_millis(200), 0.25);
    let ctx = KtpContext::attach(&ClientConfig::with_namespace(&ns)).expect("attach");
    let (a, _addr_a, b, addr_b) = bound_pair(&ctx);

    let messages: Vec<Vec<u8>> = (0..30)
        .map(|i| format!("payload number {i:03}").into_bytes())
        .collect();

    // Thirty messages exceed the combined send+receive buffering, so the
    // producer and consumer sides are pumped together. In-flight messages
    // are capped below the buffer depth: a closed receive window whose
    // reopening window-update datagram gets drop-sampled would stall the
    // transfer for good, and this test is about loss on the data path.
    let max_in_flight = BUFFER_SLOTS - 2;
    let deadline = Instant::now() + Duration::from_secs(120);
    let mut outbound = messages.iter();
    let mut next = outbound.next();
    let mut sent = 0usize;
    let mut received: Vec<Vec<u8>> = Vec::with_capacity(messages.len());
    let mut buf = [0u8; 600];
    while received.len() < messages.len() {
        assert!(Instant::now() < deadline, "transfer stalled");
        if let Some(m) = next {
            if sent - received.len() < max_in_flight {
                match ctx.send_to(a, m, addr_b) {
                    Ok(_) => {
                        sent += 1;
                        next = outbound.next();
                    }
                    Err(KtpError::NoSpace) => {}
                    Err(e) => panic!("send failed: {e}"),
                }
            }
        }
        match ctx.recv_from(b, &mut buf) {
            Ok((n, _src)) => received.push(buf[..n].to_vec()),
            Err(KtpError::NoMessage) => std::thread::sleep(Duration::from_millis(5)),
            Err(e) => panic!("recv failed: {e}"),
        }
    }

    // Despite the 25% drop rate every payload arrives exactly once, in
    // send order.
    assert_eq!(received, messages);
    assert!(recv_within(&ctx, b, Duration::from_millis(600)).is_none(), "duplicate delivered");

    daemon.shutdown();
}

#[test]
fn window_saturation_and_flow_control() {
    let ns = unique_ns("window");
    let daemon = start_daemon(&ns, Duration::from_millis(300), 0.0);
    let ctx = KtpContext::attach(&ClientConfig::with_namespace(&ns)).expect("attach");
    let (a, _addr_a, b, addr_b) = bound_pair(&ctx);

    // B never drains: its receive buffer fills with the first
    // BUFFER_SLOTS payloads, its advertised window drops to zero, and A
    // buffers the next BUFFER_SLOTS without being able to transmit them.
    let total = 2 * BUFFER_SLOTS;
    let messages: Vec<Vec<u8>> = (0..total + 1)
        .map(|i| format!("window test {i:02}").into_bytes())
        .collect();
    for m in messages.iter().take(total) {
        send_within(&ctx, a, m, addr_b, Duration::from_secs(30));
    }

    // Both buffers are now committed; nothing can free a send slot until
    // B drains, so the next send must report exhaustion.
    match ctx.send_to(a, &messages[total], addr_b) {
        Err(KtpError::NoSpace) => {}
        other => panic!("expected NoSpace, got {other:?}"),
    }

    // Draining B reopens the window (via window-update ACKs) and lets
    // the buffered half flow; everything arrives in order.
    for (i, expect) in messages.iter().take(total).enumerate() {
        let got = recv_within(&ctx, b, Duration::from_secs(30))
            .unwrap_or_else(|| panic!("message {i} never delivered"));
        assert_eq!(&got, expect, "message {i} out of order");
    }

    // And the previously refused payload now goes through end to end.
    send_within(&ctx, a, &messages[total], addr_b, Duration::from_secs(30));
    let got = recv_within(&ctx, b, Duration::from_secs(30)).expect("final message lost");
    assert_eq!(got, messages[total]);

    daemon.shutdown();
}

#[test]
fn send_to_wrong_destination_is_refused() {
    let ns = unique_ns("notbound");
    let daemon = start_daemon(&ns, Duration::from_millis(300), 0.0);
    let ctx = KtpContext::attach(&ClientConfig::with_namespace(&ns)).expect("attach");
    let (a, _addr_a, _b, addr_b) = bound_pair(&ctx);

    let elsewhere = SocketAddrV4::new(LOCALHOST, addr_b.port() + 1000);
    match ctx.send_to(a, b"x", elsewhere) {
        Err(KtpError::NotBound) => {}
        other => panic!("expected NotBound, got {other:?}"),
    }

    // An unbound socket refuses every destination.
    let c = ctx.socket(libc::AF_INET, SOCK_KTP, 0).expect("socket c");
    match ctx.send_to(c, b"x", addr_b) {
        Err(KtpError::NotBound) => {}
        other => panic!("expected NotBound, got {other:?}"),
    }

    daemon.shutdown();
}

#[test]
fn recv_on_empty_socket_reports_no_message() {
    let ns = unique_ns("empty");
    let daemon = start_daemon(&ns, Duration::from_millis(300), 0.0);
    let ctx = KtpContext::attach(&ClientConfig::with_namespace(&ns)).expect("attach");
    let (_a, _addr_a, b, _addr_b) = bound_pair(&ctx);

    let mut buf = [0u8; 64];
    match ctx.recv_from(b, &mut buf) {
        Err(KtpError::NoMessage) => {}
        other => panic!("expected NoMessage, got {other:?}"),
    }

    daemon.shutdown();
}

#[test]
fn argument_validation() {
    let ns = unique_ns("args");
    let daemon = start_daemon(&ns, Duration::from_millis(300), 0.0);
    let ctx = KtpContext::attach(&ClientConfig::with_namespace(&ns)).expect("attach");

    // Wrong family / type.
    assert!(matches!(
        ctx.socket(libc::AF_INET6, SOCK_KTP, 0),
        Err(KtpError::InvalidArgument)
    ));
    assert!(matches!(
        ctx.socket(libc::AF_INET, libc::SOCK_DGRAM, 0),
        Err(KtpError::InvalidArgument)
    ));

    // Out-of-range and free descriptors.
    let mut buf = [0u8; 8];
    let dest = SocketAddrV4::new(LOCALHOST, 1);
    assert!(matches!(
        ctx.send_to(-1, b"x", dest),
        Err(KtpError::InvalidArgument)
    ));
    assert!(matches!(
        ctx.send_to(MAX_SOCKETS as i32, b"x", dest),
        Err(KtpError::InvalidArgument)
    ));
    assert!(matches!(
        ctx.recv_from(3, &mut buf),
        Err(KtpError::InvalidArgument)
    ));

    // Oversized payload.
    let (a, _addr_a, _b, addr_b) = bound_pair(&ctx);
    let oversized = vec![0u8; ktp::config::MAX_MSG_SIZE + 1];
    assert!(matches!(
        ctx.send_to(a, &oversized, addr_b),
        Err(KtpError::InvalidArgument)
    ));

    // Closed descriptors are invalid again.
    ctx.close(a).expect("close");
    assert!(matches!(
        ctx.send_to(a, b"x", addr_b),
        Err(KtpError::InvalidArgument)
    ));

    daemon.shutdown();
}

#[test]
fn socket_slots_are_finite_and_reusable() {
    let ns = unique_ns("slots");
    let daemon = start_daemon(&ns, Duration::from_millis(300), 0.0);
    let ctx = KtpContext::attach(&ClientConfig::with_namespace(&ns)).expect("attach");

    let fds: Vec<i32> = (0..MAX_SOCKETS)
        .map(|i| {
            ctx.socket(libc::AF_INET, SOCK_KTP, 0)
                .unwrap_or_else(|e| panic!("socket {i} failed: {e}"))
        })
        .collect();
    match ctx.socket(libc::AF_INET, SOCK_KTP, 0) {
        Err(KtpError::NoSpace) => {}
        other => panic!("expected NoSpace, got {other:?}"),
    }

    // Closing one slot makes it allocatable again.
    ctx.close(fds[3]).expect("close");
    ctx.socket(libc::AF_INET, SOCK_KTP, 0)
        .expect("slot not reusable after close");

    daemon.shutdown();
}

#[test]
fn reaper_reclaims_sockets_of_dead_owners() {
    let ns = unique_ns("reaper");
    let daemon = start_daemon(&ns, Duration::from_millis(300), 0.0);
    let ctx = KtpContext::attach(&ClientConfig::with_namespace(&ns)).expect("attach");

    let fd = ctx.socket(libc::AF_INET, SOCK_KTP, 0).expect("socket");

    // A pid that is certainly dead: a reaped child of ours.
    let mut child = std::process::Command::new("true").spawn().expect("spawn");
    let dead_pid = child.id() as i32;
    child.wait().expect("wait");

    // Pretend the socket belongs to the dead process.
    {
        let region = ktp::region::StateRegion::attach(&ns).expect("attach region");
        let mut slots = region.lock().expect("lock");
        slots[fd as usize].owner_pid = dead_pid;
    }

    // Within one reaper period the slot must be free again, which shows
    // as a full complement of allocatable sockets.
    std::thread::sleep(Duration::from_millis(1200));
    for i in 0..MAX_SOCKETS {
        ctx.socket(libc::AF_INET, SOCK_KTP, 0)
            .unwrap_or_else(|e| panic!("slot {i} not allocatable after reaping: {e}"));
    }

    daemon.shutdown();
}
