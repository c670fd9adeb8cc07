// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! UNIX seqpacket socket plumbing shared by [`crate::host`] and
//! [`crate::client`].
//!
//! Seqpacket sockets preserve message boundaries, so every wire record is
//! exactly one datagram and no reassembly buffer is needed. Frame events
//! carry their file descriptor as a single-int `SCM_RIGHTS` control message
//! in the same `sendmsg` call; the kernel duplicates the descriptor into the
//! receiving process, leaving the sender's copy untouched.
//!
//! Paths beginning with `/` are filesystem socket paths; any other name is
//! bound in the abstract namespace (leading NUL byte).

use crate::Error;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Build a `sockaddr_un` for `path`, returning the address and its length.
fn socket_addr(path: &str) -> Result<(libc::sockaddr_un, libc::socklen_t), Error> {
    let bytes = path.as_bytes();
    if bytes.is_empty() {
        return Err(Error::BadArg);
    }

    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let sun_len = addr.sun_path.len();
    let base = mem::size_of::<libc::sa_family_t>();

    let len = if bytes[0] == b'/' {
        // Filesystem path, NUL terminated.
        if bytes.len() >= sun_len {
            return Err(Error::BadArg);
        }
        for (i, b) in bytes.iter().enumerate() {
            addr.sun_path[i] = *b as libc::c_char;
        }
        base + bytes.len() + 1
    } else {
        // Abstract namespace: sun_path[0] == 0, name follows, no terminator.
        if bytes.len() + 1 > sun_len {
            return Err(Error::BadArg);
        }
        for (i, b) in bytes.iter().enumerate() {
            addr.sun_path[i + 1] = *b as libc::c_char;
        }
        base + bytes.len() + 1
    };

    Ok((addr, len as libc::socklen_t))
}

fn seqpacket_socket() -> Result<OwnedFd, Error> {
    let fd = unsafe {
        libc::socket(
            libc::AF_UNIX,
            libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub(crate) fn set_nonblocking(fd: RawFd) -> Result<(), Error> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Create the host's listening socket: bind, `listen(SOMAXCONN)`,
/// non-blocking.
///
/// If the path is already bound, the previous owner may have exited without
/// unlinking. A probe `connect` distinguishes the two cases: refused means
/// stale (unlink and rebind), accepted means another host is live.
pub(crate) fn listen(path: &str) -> Result<OwnedFd, Error> {
    let (addr, len) = socket_addr(path)?;
    let sock = seqpacket_socket()?;

    let mut ret = unsafe {
        libc::bind(
            sock.as_raw_fd(),
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            len,
        )
    };
    if ret < 0 && io::Error::last_os_error().kind() == io::ErrorKind::AddrInUse {
        let probe = seqpacket_socket()?;
        let probe_ret = unsafe {
            libc::connect(
                probe.as_raw_fd(),
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                len,
            )
        };
        if probe_ret == 0 {
            // A live host already owns this path.
            return Err(Error::Io(io::Error::from(io::ErrorKind::AddrInUse)));
        }
        log::debug!("recovering stale socket at {}", path);
        if path.starts_with('/') {
            unsafe { libc::unlink(addr.sun_path.as_ptr()) };
        }
        ret = unsafe {
            libc::bind(
                sock.as_raw_fd(),
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                len,
            )
        };
    }
    if ret < 0 {
        return Err(Error::last_os_error());
    }

    if unsafe { libc::listen(sock.as_raw_fd(), libc::SOMAXCONN) } < 0 {
        return Err(Error::last_os_error());
    }
    set_nonblocking(sock.as_raw_fd())?;
    Ok(sock)
}

/// Connect to a host socket. The connect itself is blocking (a non-blocking
/// connect would only add a poll round-trip on a local socket); the
/// connected socket is switched to non-blocking for the receive path.
pub(crate) fn connect(path: &str) -> Result<OwnedFd, Error> {
    let (addr, len) = socket_addr(path)?;
    let sock = seqpacket_socket()?;
    let ret = unsafe {
        libc::connect(
            sock.as_raw_fd(),
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            len,
        )
    };
    if ret < 0 {
        return Err(Error::last_os_error());
    }
    set_nonblocking(sock.as_raw_fd())?;
    Ok(sock)
}

/// Accept one pending connection, or `None` when nothing is queued.
pub(crate) fn accept(listen: RawFd) -> Result<Option<OwnedFd>, Error> {
    let fd = unsafe { libc::accept(listen, std::ptr::null_mut(), std::ptr::null_mut()) };
    if fd < 0 {
        let err = io::Error::last_os_error();
        return match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(None),
            _ => Err(Error::Io(err)),
        };
    }
    let sock = unsafe { OwnedFd::from_raw_fd(fd) };
    set_nonblocking(sock.as_raw_fd())?;
    Ok(Some(sock))
}

/// Remove a filesystem socket path. Abstract addresses vanish with the
/// listening socket and need no cleanup.
pub(crate) fn unlink(path: &str) {
    if path.starts_with('/') {
        if let Ok(cpath) = std::ffi::CString::new(path) {
            unsafe { libc::unlink(cpath.as_ptr()) };
        }
    }
}

/// Send one record, attaching `fd` via a single-int `SCM_RIGHTS` control
/// message when present.
pub(crate) fn send_record(sock: RawFd, data: &[u8], fd: Option<RawFd>) -> io::Result<()> {
    let fd_size = mem::size_of::<libc::c_int>();
    let cmsg_space = unsafe { libc::CMSG_SPACE(fd_size as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    if let Some(fd) = fd {
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_space as _;
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(fd_size as u32) as _;
            std::ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut libc::c_int, fd);
        }
    }

    let n = unsafe { libc::sendmsg(sock, &msg, libc::MSG_NOSIGNAL) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Receive one record into `buf`, capturing an `SCM_RIGHTS` descriptor when
/// the message carries one.
///
/// A received fd of 0 means the peer process has closed stdin and the kernel
/// re-used slot 0 — a historical source of corruption. The descriptor is
/// closed and the call fails with `InvalidInput`, which callers surface as
/// [`Error::BadFd`]. Descriptors 1 and 2 are accepted but logged.
pub(crate) fn recv_record(sock: RawFd, buf: &mut [u8]) -> io::Result<(usize, Option<OwnedFd>)> {
    let fd_size = mem::size_of::<libc::c_int>();
    let cmsg_space = unsafe { libc::CMSG_SPACE(fd_size as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_space as _;

    let n = unsafe { libc::recvmsg(sock, &mut msg, libc::MSG_CMSG_CLOEXEC) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut received = None;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let fd: libc::c_int =
                    std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::c_int);
                received = Some(OwnedFd::from_raw_fd(fd));
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    if let Some(ref fd) = received {
        let raw = fd.as_raw_fd();
        if raw == 0 {
            // Dropping the OwnedFd closes our duplicate of slot 0.
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "received fd 0: peer closed stdin",
            ));
        }
        if raw <= 2 {
            log::warn!("received stdio-range fd {} via SCM_RIGHTS", raw);
        }
    }

    Ok((n as usize, received))
}

/// Poll a single socket for readability. Returns false on timeout.
pub(crate) fn poll_in(fd: RawFd, timeout_ms: i32) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(ret > 0);
    }
}

/// Poll a set of sockets for readability or error. Returns the ready count.
pub(crate) fn poll_many(fds: &[RawFd], timeout_ms: i32) -> io::Result<i32> {
    let mut pfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN | libc::POLLERR | libc::POLLHUP,
            revents: 0,
        })
        .collect();
    loop {
        let ret = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, timeout_ms) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(ret);
    }
}

/// Shut down both directions of a socket, waking any blocked peer I/O.
pub(crate) fn shutdown(fd: RawFd) {
    unsafe { libc::shutdown(fd, libc::SHUT_RDWR) };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_path(name: &str) -> String {
        format!(
            "/tmp/vsl_sock_{}_{}_{:?}",
            name,
            std::process::id(),
            std::thread::current().id()
        )
    }

    #[test]
    fn listen_creates_and_unlink_removes() {
        let path = test_path("listen");
        let sock = listen(&path).unwrap();
        assert!(std::path::Path::new(&path).exists());
        drop(sock);
        unlink(&path);
        assert!(!std::path::Path::new(&path).exists());
    }

    #[test]
    fn stale_socket_is_recovered() {
        let path = test_path("stale");
        let first = listen(&path).unwrap();
        // Simulate a crashed host: close the socket without unlinking.
        drop(first);
        assert!(std::path::Path::new(&path).exists());

        let second = listen(&path).expect("stale socket should be unlinked and rebound");
        drop(second);
        unlink(&path);
    }

    #[test]
    fn second_live_host_is_refused() {
        let path = test_path("live");
        let _first = listen(&path).unwrap();
        let second = listen(&path);
        assert!(matches!(second, Err(Error::Io(_))));
        unlink(&path);
    }

    #[test]
    fn abstract_namespace_listen() {
        let name = format!("vsl-abstract-{}", std::process::id());
        let sock = listen(&name).expect("abstract bind should work on Linux");
        // No filesystem entry for abstract sockets.
        assert!(!std::path::Path::new(&name).exists());
        drop(sock);
    }

    #[test]
    fn record_with_fd_round_trip() {
        let path = test_path("roundtrip");
        let listener = listen(&path).unwrap();
        let client = connect(&path).unwrap();
        let server = loop {
            if let Some(s) = accept(listener.as_raw_fd()).unwrap() {
                break s;
            }
        };

        // Pass one end of a pipe along with a payload.
        let mut pipefd = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(pipefd.as_mut_ptr()) }, 0);
        let read_end = unsafe { OwnedFd::from_raw_fd(pipefd[0]) };
        let write_end = unsafe { OwnedFd::from_raw_fd(pipefd[1]) };

        send_record(server.as_raw_fd(), b"frame", Some(read_end.as_raw_fd())).unwrap();

        assert!(poll_in(client.as_raw_fd(), 1000).unwrap());
        let mut buf = [0u8; 64];
        let (n, fd) = recv_record(client.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"frame");
        let received = fd.expect("fd should arrive in ancillary data");

        // The received descriptor is an independent duplicate.
        drop(read_end);
        let msg = b"through the pipe";
        let wrote = unsafe {
            libc::write(
                write_end.as_raw_fd(),
                msg.as_ptr() as *const libc::c_void,
                msg.len(),
            )
        };
        assert_eq!(wrote as usize, msg.len());
        let mut out = [0u8; 16];
        let got = unsafe {
            libc::read(
                received.as_raw_fd(),
                out.as_mut_ptr() as *mut libc::c_void,
                out.len(),
            )
        };
        assert_eq!(got as usize, msg.len());
        assert_eq!(&out[..], msg.as_slice());

        unlink(&path);
    }

    #[test]
    fn poll_in_times_out() {
        let path = test_path("polltimeout");
        let listener = listen(&path).unwrap();
        let client = connect(&path).unwrap();
        let start = std::time::Instant::now();
        assert!(!poll_in(client.as_raw_fd(), 50).unwrap());
        assert!(start.elapsed() >= std::time::Duration::from_millis(50));
        drop(listener);
        unlink(&path);
    }
}
