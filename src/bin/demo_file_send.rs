// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Demo: stream a file over a KTP socket.
//
// Usage:
//   demo_file_send <local-ip:port> <peer-ip:port> <file> [ns]
//
// Run against a live ktpd, paired with demo_file_recv on the peer
// address. Each chunk carries a one-byte tag: 'D' for data, 'E' for end
// of stream, so the receiver knows when the file is complete.

use std::net::SocketAddrV4;
use std::time::Duration;

use ktp::config::MAX_MSG_SIZE;
use ktp::{ClientConfig, KtpContext, KtpError, SOCK_KTP};

const TAG_DATA: u8 = b'D';
const TAG_END: u8 = b'E';

fn main() {
    env_logger::init();
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 3 {
        eprintln!("usage: demo_file_send <local-ip:port> <peer-ip:port> <file> [ns]");
        std::process::exit(1);
    }

    let local: SocketAddrV4 = args[0].parse().expect("bad local address");
    let peer: SocketAddrV4 = args[1].parse().expect("bad peer address");
    let data = std::fs::read(&args[2]).expect("cannot read input file");
    let cfg = match args.get(3) {
        Some(ns) => ClientConfig::with_namespace(ns),
        None => ClientConfig::default(),
    };

    let ctx = match KtpContext::attach(&cfg) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("demo_file_send: {e} (is ktpd running?)");
            std::process::exit(1);
        }
    };

    let fd = ctx.socket(libc::AF_INET, SOCK_KTP, 0).expect("socket");
    ctx.bind(local, peer).expect("bind");
    println!("sending {} bytes from {} to {}", data.len(), local, peer);

    let mut chunk = Vec::with_capacity(MAX_MSG_SIZE);
    let mut sent = 0usize;
    for piece in data.chunks(MAX_MSG_SIZE - 1) {
        chunk.clear();
        chunk.push(TAG_DATA);
        chunk.extend_from_slice(piece);
        send_blocking(&ctx, fd, &chunk, peer);
        sent += 1;
    }
    send_blocking(&ctx, fd, &[TAG_END], peer);

    println!("queued {sent} chunks + end marker; draining send buffer...");
    // The daemon retries until everything is acknowledged; give it a
    // moment before dropping the socket.
    std::thread::sleep(Duration::from_secs(2));
    ctx.close(fd).expect("close");
    println!("done");
}

/// The send buffer is finite and the call never blocks; spin politely on
/// NoSpace until the daemon frees slots.
fn send_blocking(ctx: &KtpContext, fd: i32, payload: &[u8], peer: SocketAddrV4) {
    loop {
        match ctx.send_to(fd, payload, peer) {
            Ok(_) => return,
            Err(KtpError::NoSpace) => std::thread::sleep(Duration::from_millis(20)),
            Err(e) => {
                eprintln!("demo_file_send: send failed: {e}");
                std::process::exit(1);
            }
        }
    }
}
