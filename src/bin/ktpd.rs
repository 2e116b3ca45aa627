// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The KTP transport daemon.
//
// Usage:
//   ktpd [--ns NAME] [--timeout SECONDS] [--drop PROBABILITY]
//
// Creates the IPC namespace, runs the broker/receiver/sender/reaper
// workers, and tears everything down again on SIGINT/SIGTERM.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ktp::{Daemon, DaemonConfig};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Release);
}

fn usage() -> ! {
    eprintln!("usage: ktpd [--ns NAME] [--timeout SECONDS] [--drop PROBABILITY]");
    std::process::exit(1);
}

fn parse_args() -> DaemonConfig {
    let mut cfg = DaemonConfig::default();
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut i = 0;
    while i < args.len() {
        let value = args.get(i + 1);
        match args[i].as_str() {
            "--ns" => match value {
                Some(v) => cfg.namespace = v.clone(),
                None => usage(),
            },
            "--timeout" => match value.and_then(|v| v.parse::<f64>().ok()) {
                Some(secs) if secs > 0.0 => cfg.timeout = Duration::from_secs_f64(secs),
                _ => usage(),
            },
            "--drop" => match value.and_then(|v| v.parse::<f64>().ok()) {
                Some(p) if (0.0..=1.0).contains(&p) => cfg.drop_prob = p,
                _ => usage(),
            },
            _ => usage(),
        }
        i += 2;
    }
    cfg
}

fn main() {
    env_logger::init();
    let cfg = parse_args();

    let handler = on_signal as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }

    let daemon = match Daemon::create(cfg) {
        Ok(daemon) => daemon,
        Err(e) => {
            eprintln!("ktpd: creating IPC namespace failed: {e}");
            std::process::exit(1);
        }
    };
    let handle = match daemon.spawn() {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("ktpd: starting workers failed: {e}");
            std::process::exit(1);
        }
    };

    log::info!("ktpd: running (interrupt to stop)");
    while !SHUTDOWN.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(100));
    }

    log::info!("ktpd: shutting down");
    handle.shutdown();
}
