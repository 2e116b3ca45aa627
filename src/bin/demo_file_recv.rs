// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Demo: receive a file streamed by demo_file_send.
//
// Usage:
//   demo_file_recv <local-ip:port> <peer-ip:port> <output-file> [ns]

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
        eprintln!("usage: demo_file_recv <local-ip:port> <peer-ip:port> <output-file> [ns]");
        std::process::exit(1);
    }

    let local: SocketAddrV4 = args[0].parse().expect("bad local address");
    let peer: SocketAddrV4 = args[1].parse().expect("bad peer address");
    let out_path = &args[2];
    let cfg = match args.get(3) {
        Some(ns) => ClientConfig::with_namespace(ns),
        None => ClientConfig::default(),
    };

    let ctx = match KtpContext::attach(&cfg) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("demo_file_recv: {e} (is ktpd running?)");
            std::process::exit(1);
        }
    };

    let fd = ctx.socket(libc::AF_INET, SOCK_KTP, 0).expect("socket");
    ctx.bind(local, peer).expect("bind");
    println!("receiving on {local} from {peer} into {out_path}");

    let mut file = Vec::new();
    let mut buf = [0u8; MAX_MSG_SIZE];
    let mut chunks = 0usize;
    loop {
        match ctx.recv_from(fd, &mut buf) {
            Ok((n, _src)) => match buf[..n].split_first() {
                Some((&TAG_DATA, rest)) => {
                    file.extend_from_slice(rest);
                    chunks += 1;
                }
                Some((&TAG_END, _)) => break,
                _ => eprintln!("demo_file_recv: skipping chunk with unknown tag"),
            },
            Err(KtpError::NoMessage) => std::thread::sleep(Duration::from_millis(20)),
            Err(e) => {
                eprintln!("demo_file_recv: recv failed: {e}");
                std::process::exit(1);
            }
        }
    }

    std::fs::write(out_path, &file).expect("cannot write output file");
    ctx.close(fd).expect("close");
    println!("received {chunks} chunks, {} bytes", file.len());
}
