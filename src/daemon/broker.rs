// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The socket broker: creates and binds UDP endpoints on client request.
//
// Clients cannot hold the endpoints themselves — the daemon's receiver
// and sender need them — so socket() and bind() are mailbox dialogues.
// One request is in flight at a time (the client holds the dialogue lock
// and parks on the reply semaphore), so the mailbox can be read and
// written here without further locking.

use std::collections::hash_map::Entry;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::os::fd::FromRawFd;
use std::time::Duration;

use log::{error, info};

use super::DaemonInner;
use crate::region::{OP_BIND, OP_CREATE};

/// How long one wait for a request blocks before re-checking shutdown.
const POLL: Duration = Duration::from_millis(200);

pub(crate) fn run(inner: &DaemonInner) {
    info!("broker: serving endpoint requests");
    while !inner.shutting_down() {
        match inner.broker.wait_request(POLL) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                error!("broker: wait for request failed: {e}");
                continue;
            }
        }

        let (op, fd, ip, port) = inner
            .broker
            .with_mailbox(|mb| (mb.op, mb.udp_fd, mb.ip, mb.port));

        let result = match op {
            OP_CREATE => create_endpoint(inner),
            OP_BIND => bind_endpoint(inner, fd, ip, port).map(|()| fd),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unknown mailbox operation {other}"),
            )),
        };

        inner.broker.with_mailbox(|mb| match &result {
            Ok(fd) => {
                mb.udp_fd = *fd;
                mb.err = 0;
            }
            Err(e) => {
                error!("broker: request failed: {e}");
                mb.udp_fd = -1;
                mb.err = e.raw_os_error().unwrap_or(libc::EINVAL);
            }
        });

        if let Err(e) = inner.broker.complete() {
            error!("broker: waking requester failed: {e}");
        }
    }
}

/// Create an unbound UDP endpoint and register it in the endpoint table.
///
/// The socket is created through `libc::socket` rather than
/// `UdpSocket::bind` because the local address arrives only with a later
/// bind request.
fn create_endpoint(inner: &DaemonInner) -> io::Result<i32> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // Ownership moves into the table; dropping the entry closes the fd.
    let sock = unsafe { UdpSocket::from_raw_fd(fd) };
    sock.set_nonblocking(true)?;

    match inner.endpoints.lock().unwrap().entry(fd) {
        Entry::Vacant(v) => {
            v.insert(sock);
        }
        Entry::Occupied(_) => {
            // A closed fd number can be recycled by the kernel only after
            // the table entry holding it is gone, so this cannot happen;
            // refuse rather than clobber if it somehow does.
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "endpoint fd already registered",
            ));
        }
    }
    info!("broker: created endpoint fd {fd}");
    Ok(fd)
}

/// Bind a previously created endpoint to a local address.
fn bind_endpoint(inner: &DaemonInner, fd: i32, ip: u32, port: u16) -> io::Result<()> {
    let endpoints = inner.endpoints.lock().unwrap();
    if !endpoints.contains_key(&fd) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no endpoint with fd {fd}"),
        ));
    }

    let addr = SocketAddrV4::new(Ipv4Addr::from(ip), port);
    let sin = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr { s_addr: ip.to_be() },
        sin_zero: [0; 8],
    };
    let rc = unsafe {
        libc::bind(
            fd,
            &sin as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    info!("broker: bound endpoint fd {fd} to {addr}");
    Ok(())
}
