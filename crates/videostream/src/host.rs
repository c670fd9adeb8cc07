// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use crate::{
    frame::Frame,
    sock,
    wire::{ControlOp, ErrorKind, FrameControl, FrameEvent, CONTROL_SIZE},
    Error,
};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

/// Maximum simultaneous locks a single client may hold.
pub const MAX_CLIENT_LOCKS: usize = 20;

/// Initial live-frames table size; grows by doubling.
const INITIAL_FRAMES: usize = 40;

/// Bounded wait for the host mutex. Hitting it means a caller is deadlocked
/// or the lock holder is stuck; surface it instead of hanging.
const LOCK_TIMEOUT: Duration = Duration::from_millis(250);

/// The Host structure provides the frame sharing functionality.  Only a single
/// host can own frames while a host can have many Client subscribers to the
/// frames.
///
/// A host is created with a socket path which it will own exclusively and
/// allowing clients to connect in order to receive frames.
///
/// The host does not run its own thread: call [`Host::poll`] and
/// [`Host::process`] from the producer's loop to accept clients, service
/// lock/unlock requests, and expire stale frames.
///
/// # Examples
///
/// ```no_run
/// use videostream::host::Host;
///
/// let host = Host::new("/tmp/video.sock")?;
/// println!("Host listening on: {}", host.path());
/// # Ok::<(), videostream::Error>(())
/// ```
pub struct Host {
    state: Mutex<HostState>,
    path: String,
}

struct HostState {
    listener: OwnedFd,
    clients: Vec<Option<ClientSlot>>,
    frames: Vec<Option<Frame>>,
    serial: i64,
}

struct ClientSlot {
    sock: OwnedFd,
    /// Serials of frames this client holds locked; 0 marks a free entry.
    /// Serials are validated against the live table before use, so a stale
    /// entry can never resurrect a frame.
    locks: [i64; MAX_CLIENT_LOCKS],
}

impl ClientSlot {
    fn new(sock: OwnedFd) -> Self {
        ClientSlot {
            sock,
            locks: [0; MAX_CLIENT_LOCKS],
        }
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host").field("path", &self.path).finish()
    }
}

impl Host {
    /// Creates a new Host and creates a socket at the specified path on which
    /// it will listen for client connections.
    ///
    /// Paths beginning with `/` are filesystem sockets; other names bind the
    /// abstract namespace. A stale socket left by a crashed host is detected
    /// (probe connect refused) and recovered by unlink + rebind.
    pub fn new(path: &str) -> Result<Self, Error> {
        let listener = sock::listen(path)?;
        let mut frames = Vec::new();
        frames.resize_with(INITIAL_FRAMES, || None);
        log::debug!("host listening on {}", path);
        Ok(Host {
            state: Mutex::new(HostState {
                listener,
                clients: Vec::new(),
                frames,
                serial: 0,
            }),
            path: path.to_string(),
        })
    }

    /// The socket path this host is bound to.
    pub fn path(&self) -> &str {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, HostState>, Error> {
        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            match self.state.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::Poisoned(poisoned)) => return Ok(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout);
                    }
                    std::thread::sleep(Duration::from_micros(500));
                }
            }
        }
    }

    /// Posts a frame to all connected clients.
    ///
    /// Ownership of the frame transfers to the host, which retains it until
    /// it expires with no holders, is dropped via [`Host::drop_frame`], or
    /// the host shuts down. The frame must have backing memory: its
    /// descriptor rides along to every client.
    ///
    /// A send failure on one client disconnects that client only; the post
    /// still succeeds for the producer.
    ///
    /// # Arguments
    ///
    /// * `frame` - Frame to post (ownership transferred to host)
    /// * `expires` - Expiration deadline in nanoseconds on the monotonic
    ///   clock (0 = never expires)
    /// * `duration` - Frame duration in nanoseconds (-1 if unknown)
    /// * `pts` - Presentation timestamp in nanoseconds (-1 if unknown)
    /// * `dts` - Decode timestamp in nanoseconds (-1 if unknown)
    ///
    /// # Returns
    ///
    /// The serial assigned to the frame. Serials from one host are strictly
    /// increasing.
    pub fn post(
        &self,
        mut frame: Frame,
        expires: i64,
        duration: i64,
        pts: i64,
        dts: i64,
    ) -> Result<i64, Error> {
        let fd = frame.raw_handle().ok_or(Error::BadFd)?;
        let mut state = self.lock()?;

        // Reclaim anything already past its deadline before taking new work.
        state.expire_frames();

        let serial = state.serial + 1;
        state.serial = serial;
        {
            let info = frame.info_mut();
            info.serial = serial;
            info.timestamp = crate::timestamp();
            info.expires = expires;
            info.duration = duration;
            info.pts = pts;
            info.dts = dts;
            info.locked = 0;
        }

        let event = FrameEvent::broadcast(*frame.info());
        let record = event.encode();
        let mut failed = Vec::new();
        for (idx, slot) in state.clients.iter().enumerate() {
            if let Some(slot) = slot {
                if let Err(err) = sock::send_record(slot.sock.as_raw_fd(), &record, Some(fd)) {
                    log::warn!("broadcast to client {} failed: {}", idx, err);
                    failed.push(idx);
                }
            }
        }
        for idx in failed {
            state.disconnect_slot(idx);
        }

        state.insert_frame(frame);
        Ok(serial)
    }

    /// Drops a posted frame from the host.
    ///
    /// The frame stops being offered and its resources are reclaimed.  A
    /// frame still locked by clients survives until the last holder unlocks
    /// it (or disconnects); the drop then completes through the expiry pass.
    pub fn drop_frame(&self, serial: i64) -> Result<(), Error> {
        let mut state = self.lock()?;
        let idx = state.find_frame(serial).ok_or(Error::Expired)?;
        let locked = state.frames[idx]
            .as_ref()
            .map(|f| f.info().locked)
            .unwrap_or(0);
        if locked == 0 {
            state.frames[idx] = None;
        } else {
            // Deadline now in the past: the frame is retired the moment the
            // last lock goes away.
            if let Some(frame) = state.frames[idx].as_mut() {
                frame.info_mut().expires = crate::timestamp();
            }
        }
        Ok(())
    }

    /// Polls the host's socket connections for activity.
    ///
    /// Waits for socket activity (new connections or client messages) using
    /// poll(). Should be called in a loop before [`Host::process`]. The
    /// `wait` parameter controls timeout behavior:
    /// - `> 0`: Poll waits up to this duration in milliseconds
    /// - `= 0`: Returns immediately
    /// - `< 0`: Waits indefinitely
    ///
    /// The socket set is gathered under the host lock but the poll itself
    /// runs outside it, so a blocked poll never stalls posting threads.
    ///
    /// # Returns
    ///
    /// Returns the number of sockets with activity, 0 on timeout.
    pub fn poll(&self, wait: i64) -> Result<i32, Error> {
        let fds: Vec<RawFd> = {
            let state = self.lock()?;
            let mut fds = vec![state.listener.as_raw_fd()];
            fds.extend(
                state
                    .clients
                    .iter()
                    .flatten()
                    .map(|slot| slot.sock.as_raw_fd()),
            );
            fds
        };
        let timeout = if wait < 0 {
            -1
        } else {
            wait.min(i32::MAX as i64) as i32
        };
        Ok(sock::poll_many(&fds, timeout)?)
    }

    /// Processes host tasks: accepts pending clients, services client
    /// messages, and expires old frames.
    ///
    /// Should be called in a loop, typically after [`Host::poll`] indicates
    /// activity.
    pub fn process(&self) -> Result<(), Error> {
        let mut state = self.lock()?;

        match sock::accept(state.listener.as_raw_fd()) {
            Ok(Some(sock)) => {
                // Greet with a status record. Clients coming back from a
                // reconnect discard their first event, so the greeting keeps
                // real frames from being swallowed by that rule.
                let greeting = FrameEvent::keepalive().encode();
                if let Err(err) = sock::send_record(sock.as_raw_fd(), &greeting, None) {
                    log::warn!("greeting new client failed: {}", err);
                } else {
                    let idx = state.insert_client(ClientSlot::new(sock));
                    log::debug!("client connected in slot {}", idx);
                }
            }
            Ok(None) => {}
            Err(err) => log::warn!("accept failed: {}", err),
        }

        for idx in 0..state.clients.len() {
            if state.clients[idx].is_none() {
                continue;
            }
            if let Err(err) = state.service_slot(idx) {
                log::debug!("client {} disconnected: {}", idx, err);
                state.disconnect_slot(idx);
            }
        }

        state.expire_frames();
        Ok(())
    }

    /// Services a single client socket.
    ///
    /// Processes messages from a specific client socket. Does not accept new
    /// connections - use [`Host::process`] for that. Useful when you need to
    /// track errors for individual clients.
    ///
    /// # Errors
    ///
    /// [`Error::BadArg`] when `sock` is not a connected client of this host;
    /// otherwise the error that caused the client to be disconnected.
    pub fn service(&self, sock: RawFd) -> Result<(), Error> {
        let mut state = self.lock()?;
        let idx = state
            .clients
            .iter()
            .position(|slot| {
                slot.as_ref()
                    .is_some_and(|slot| slot.sock.as_raw_fd() == sock)
            })
            .ok_or(Error::BadArg)?;
        if let Err(err) = state.service_slot(idx) {
            state.disconnect_slot(idx);
            return Err(err);
        }
        Ok(())
    }

    /// Requests a copy of the sockets managed by the host.
    ///
    /// The first entry is always the listening socket, followed by client
    /// sockets. The set should be refreshed frequently as clients come and
    /// go.
    pub fn sockets(&self) -> Result<Vec<RawFd>, Error> {
        let state = self.lock()?;
        let mut fds = vec![state.listener.as_raw_fd()];
        fds.extend(
            state
                .clients
                .iter()
                .flatten()
                .map(|slot| slot.sock.as_raw_fd()),
        );
        Ok(fds)
    }

    /// Number of live frames currently retained by the host.
    pub fn frame_count(&self) -> Result<usize, Error> {
        let state = self.lock()?;
        Ok(state.frames.iter().flatten().count())
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            for idx in 0..state.clients.len() {
                if state.clients[idx].is_some() {
                    state.disconnect_slot(idx);
                }
            }
        }
        sock::unlink(&self.path);
    }
}

impl HostState {
    fn find_frame(&self, serial: i64) -> Option<usize> {
        if serial == 0 {
            return None;
        }
        self.frames
            .iter()
            .position(|f| f.as_ref().is_some_and(|f| f.info().serial == serial))
    }

    fn insert_frame(&mut self, frame: Frame) {
        if let Some(idx) = self.frames.iter().position(|f| f.is_none()) {
            self.frames[idx] = Some(frame);
            return;
        }
        // Table full: double it, zeroing the new tail.
        let len = self.frames.len().max(1);
        self.frames.resize_with(len * 2, || None);
        self.frames[len] = Some(frame);
    }

    fn insert_client(&mut self, slot: ClientSlot) -> usize {
        if let Some(idx) = self.clients.iter().position(|c| c.is_none()) {
            self.clients[idx] = Some(slot);
            return idx;
        }
        self.clients.push(Some(slot));
        self.clients.len() - 1
    }

    /// Release every frame whose deadline has passed and that nobody holds.
    fn expire_frames(&mut self) {
        let now = crate::timestamp();
        for entry in self.frames.iter_mut() {
            if let Some(frame) = entry {
                let info = frame.info();
                if info.expires > 0 && info.expires < now && info.locked == 0 {
                    log::debug!("expiring frame {}", info.serial);
                    *entry = None;
                }
            }
        }
    }

    /// Read and answer one control record from the client in `idx`.
    ///
    /// `Ok(())` covers both "handled one request" and "nothing pending";
    /// any error means the slot must be disconnected.
    fn service_slot(&mut self, idx: usize) -> Result<(), Error> {
        let sock_fd = match &self.clients[idx] {
            Some(slot) => slot.sock.as_raw_fd(),
            None => return Ok(()),
        };

        let mut buf = [0u8; CONTROL_SIZE];
        let (len, fd) = match sock::recv_record(sock_fd, &mut buf) {
            Ok(result) => result,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(err) if err.kind() == io::ErrorKind::ConnectionReset => {
                return Err(Error::Closed)
            }
            Err(err) => return Err(Error::Io(err)),
        };
        // Clients never send descriptors; drop any that arrives.
        drop(fd);
        if len == 0 {
            return Err(Error::Closed);
        }

        let response = match FrameControl::decode(&buf[..len]) {
            Ok(control) => self.handle_control(idx, control),
            Err(Error::InvalidControl) => FrameEvent::response(ErrorKind::InvalidControl, 0),
            Err(_) => return Err(Error::BadMessage),
        };

        sock::send_record(sock_fd, &response.encode(), None).map_err(Error::Io)
    }

    fn handle_control(&mut self, idx: usize, control: FrameControl) -> FrameEvent {
        let frame_idx = self.find_frame(control.serial);
        match control.op {
            ControlOp::TryLock => {
                let Some(frame_idx) = frame_idx else {
                    return FrameEvent::response(ErrorKind::Expired, 0);
                };
                let Some(slot) = self.clients[idx].as_mut() else {
                    return FrameEvent::response(ErrorKind::Expired, 0);
                };
                let Some(entry) = slot.locks.iter_mut().find(|s| **s == 0) else {
                    // Quota reached; counts stay untouched.
                    return FrameEvent::response(ErrorKind::TooManyLocks, 0);
                };
                *entry = control.serial;
                if let Some(frame) = self.frames[frame_idx].as_mut() {
                    frame.info_mut().locked += 1;
                }
                FrameEvent::response(ErrorKind::None, 1)
            }
            ControlOp::Unlock => {
                let held = self.clients[idx].as_mut().and_then(|slot| {
                    slot.locks.iter_mut().find(|s| **s == control.serial)
                });
                let Some(entry) = held else {
                    // Stray unlock: the client never held this serial.
                    return FrameEvent::response(ErrorKind::Expired, 0);
                };
                *entry = 0;
                if let Some(frame_idx) = frame_idx {
                    let mut expired = false;
                    if let Some(frame) = self.frames[frame_idx].as_mut() {
                        let info = frame.info_mut();
                        info.locked -= 1;
                        expired = info.locked == 0
                            && info.expires > 0
                            && info.expires < crate::timestamp();
                    }
                    // An unlock past the deadline expires the frame at once.
                    if expired {
                        self.frames[frame_idx] = None;
                    }
                }
                FrameEvent::response(ErrorKind::None, 0)
            }
        }
    }

    /// Drop a client: release its locks, then shut down and close the
    /// socket. The only place locks are released implicitly.
    fn disconnect_slot(&mut self, idx: usize) {
        let Some(slot) = self.clients[idx].take() else {
            return;
        };
        for serial in slot.locks.iter().filter(|s| **s != 0) {
            if let Some(frame_idx) = self.find_frame(*serial) {
                if let Some(frame) = self.frames[frame_idx].as_mut() {
                    frame.info_mut().locked -= 1;
                }
            }
        }
        sock::shutdown(slot.sock.as_raw_fd());
        // Frames whose last holder just vanished may be reclaimable.
        self.expire_frames();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    fn test_socket_path(name: &str) -> String {
        format!(
            "/tmp/vsl_test_{}_{}_{:?}.sock",
            name,
            std::process::id(),
            std::thread::current().id()
        )
    }

    fn backed_frame() -> Frame {
        let mut frame = Frame::new(64, 64, 0, "GREY").unwrap();
        frame.alloc(None).unwrap();
        frame
    }

    #[test]
    fn test_host() {
        let path = test_socket_path("host");
        let host = Host::new(&path).unwrap();
        assert_eq!(host.path(), path);

        let p = std::path::Path::new(&path);
        assert!(p.exists());
        // Rust doesn't provide an is_socket but we at least confirm some
        // things it is not.
        assert!(!p.is_file());
        assert!(!p.is_dir());
        assert!(!p.is_symlink());

        // The socket path is removed when the host shuts down.
        drop(host);
        assert!(!p.exists());
    }

    #[test]
    fn test_host_sockets() {
        let path = test_socket_path("sockets");
        let host = Host::new(&path).unwrap();

        let sockets = host.sockets().unwrap();
        assert!(
            !sockets.is_empty(),
            "Expected at least 1 socket (listening socket)"
        );
        assert!(sockets[0] >= 0, "Listening socket FD should be >= 0");
    }

    #[test]
    fn test_host_poll_timeout() {
        let path = test_socket_path("poll");
        let host = Host::new(&path).unwrap();

        // Poll with immediate timeout should return 0 (no activity)
        let result = host.poll(0).unwrap();
        assert_eq!(result, 0, "Poll with 0 timeout should return 0");
    }

    #[test]
    fn test_host_debug() {
        let path = test_socket_path("debug");
        let host = Host::new(&path).unwrap();
        let debug_str = format!("{:?}", host);

        assert!(debug_str.contains("Host"));
        assert!(debug_str.contains("debug"));
    }

    #[test]
    fn post_assigns_increasing_serials() {
        let path = test_socket_path("serials");
        let host = Host::new(&path).unwrap();

        let s1 = host.post(backed_frame(), 0, -1, -1, -1).unwrap();
        let s2 = host.post(backed_frame(), 0, -1, -1, -1).unwrap();
        let s3 = host.post(backed_frame(), 0, -1, -1, -1).unwrap();
        assert!(s1 < s2 && s2 < s3);
        assert_eq!(host.frame_count().unwrap(), 3);
    }

    #[test]
    fn post_without_backing_is_rejected() {
        let path = test_socket_path("nobacking");
        let host = Host::new(&path).unwrap();
        let frame = Frame::new(64, 64, 0, "GREY").unwrap();
        assert!(matches!(
            host.post(frame, 0, -1, -1, -1),
            Err(Error::BadFd)
        ));
    }

    #[test]
    fn drop_frame_removes_unlocked() {
        let path = test_socket_path("dropframe");
        let host = Host::new(&path).unwrap();

        let serial = host.post(backed_frame(), 0, -1, -1, -1).unwrap();
        assert_eq!(host.frame_count().unwrap(), 1);
        host.drop_frame(serial).unwrap();
        assert_eq!(host.frame_count().unwrap(), 0);

        // Dropping again reports the frame as gone.
        assert!(matches!(host.drop_frame(serial), Err(Error::Expired)));
    }

    #[test]
    fn expired_frames_are_reclaimed() {
        let path = test_socket_path("expiry");
        let host = Host::new(&path).unwrap();

        let expires = crate::timestamp() + 10_000_000; // 10ms
        host.post(backed_frame(), expires, -1, -1, -1).unwrap();
        assert_eq!(host.frame_count().unwrap(), 1);

        std::thread::sleep(Duration::from_millis(30));
        host.process().unwrap();
        assert_eq!(host.frame_count().unwrap(), 0);
    }

    #[test]
    fn frame_table_grows_by_doubling() {
        let path = test_socket_path("growth");
        let host = Host::new(&path).unwrap();

        // Overflow the initial table.
        for _ in 0..(INITIAL_FRAMES + 5) {
            host.post(backed_frame(), 0, -1, -1, -1).unwrap();
        }
        assert_eq!(host.frame_count().unwrap(), INITIAL_FRAMES + 5);
    }
}
