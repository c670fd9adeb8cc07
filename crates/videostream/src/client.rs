// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use crate::{
    frame::Frame,
    sock,
    wire::{ControlOp, ErrorKind, FrameControl, FrameEvent, EVENT_SIZE},
    Error,
};
use std::io;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Reconnect backoff stages in milliseconds. After the last stage the
/// client keeps retrying at the final interval.
const BACKOFF_MS: [u64; 6] = [0, 1, 5, 25, 100, 1000];

/// Default watchdog timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Reconnection behavior for client connections.
///
/// Controls whether a [`Client`] automatically reconnects when the connection
/// to the host is lost.
///
/// # Examples
///
/// ```no_run
/// use videostream::client::{Client, Reconnect};
///
/// // Client with automatic reconnection
/// let client = Client::new("/tmp/video.sock", Reconnect::Yes)?;
///
/// // Client without automatic reconnection
/// let client = Client::new("/tmp/video.sock", Reconnect::No)?;
/// # Ok::<(), videostream::Error>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reconnect {
    /// Do not automatically reconnect on disconnect
    #[default]
    No,
    /// Automatically reconnect when connection is lost
    Yes,
}

impl From<Reconnect> for bool {
    fn from(reconnect: Reconnect) -> bool {
        matches!(reconnect, Reconnect::Yes)
    }
}

impl From<bool> for Reconnect {
    fn from(value: bool) -> Self {
        if value {
            Reconnect::Yes
        } else {
            Reconnect::No
        }
    }
}

/// Client structure for connecting to a VideoStream host.
///
/// Provides functionality to subscribe to video frames published by a
/// [`crate::host::Host`].
///
/// The client is thread-safe; concurrent calls are serialized by an internal
/// lock. Frames returned by [`Client::get_frame`] keep a weak reference back
/// to the client so that locks taken with [`Frame::trylock`] are released
/// when the frame is dropped.
///
/// # Examples
///
/// ```no_run
/// use videostream::client::{Client, Reconnect};
///
/// let client = Client::new("/tmp/video.sock", Reconnect::Yes)?;
/// println!("Connected to: {}", client.path());
/// # Ok::<(), videostream::Error>(())
/// ```
pub struct Client {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    path: String,
    reconnect: bool,
    state: Mutex<State>,
    watchdog: Watchdog,
    /// Mirror of the current socket fd (-1 when none) so `disconnect` can
    /// wake a blocked call without taking the state lock it is holding.
    current_fd: AtomicI32,
}

struct State {
    sock: Option<OwnedFd>,
    /// Set while the connection is being re-established; the first event
    /// received afterwards is discarded because its descriptor may belong
    /// to a buffer from before the restart.
    reconnecting: bool,
    backoff_stage: usize,
    timeout: Duration,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("path", &self.shared.path)
            .finish()
    }
}

impl Client {
    /// Creates a new client and connects to the host at the specified socket
    /// path.
    ///
    /// With [`Reconnect::Yes`] a failed initial connection is tolerated: the
    /// client starts disconnected and [`Client::get_frame`] establishes the
    /// connection with backoff. With [`Reconnect::No`] the connection must
    /// succeed here.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the connection fails and reconnection is
    /// disabled.
    pub fn new(path: &str, reconnect: Reconnect) -> Result<Self, Error> {
        if path.is_empty() {
            return Err(Error::BadArg);
        }
        let reconnect: bool = reconnect.into();
        let sock = match sock::connect(path) {
            Ok(sock) => Some(sock),
            Err(err) if reconnect => {
                log::debug!("initial connect to {} failed ({}), deferring", path, err);
                None
            }
            Err(err) => return Err(err),
        };

        let fd = sock.as_ref().map(|s| s.as_raw_fd()).unwrap_or(-1);
        let shared = Arc::new(Shared {
            path: path.to_string(),
            reconnect,
            state: Mutex::new(State {
                sock,
                reconnecting: false,
                backoff_stage: 0,
                timeout: DEFAULT_TIMEOUT,
            }),
            watchdog: Watchdog::spawn(),
            current_fd: AtomicI32::new(fd),
        });
        Ok(Client { shared })
    }

    /// Returns the socket path this client is connected to.
    pub fn path(&self) -> &str {
        &self.shared.path
    }

    /// Sets the timeout for frame reception and control exchanges.
    ///
    /// Controls how long [`Client::get_frame`] will wait for a frame before
    /// timing out, and bounds the lock/unlock round-trip.
    ///
    /// # Arguments
    ///
    /// * `timeout` - Timeout in seconds (fractional values allowed)
    pub fn set_timeout(&self, timeout: f32) -> Result<(), Error> {
        if !timeout.is_finite() || timeout <= 0.0 {
            return Err(Error::BadArg);
        }
        let mut state = self.shared.lock_state();
        state.timeout = Duration::from_secs_f32(timeout);
        Ok(())
    }

    /// Disconnects from the host.
    ///
    /// Shuts the socket down, waking any call blocked in
    /// [`Client::get_frame`] (which then observes the close). If
    /// `Reconnect::Yes` was specified, the client will reconnect on the next
    /// frame request.
    pub fn disconnect(&self) {
        let fd = self.shared.current_fd.load(Ordering::Acquire);
        if fd >= 0 {
            sock::shutdown(fd);
        }
    }

    /// Waits for and receives the next frame from the host.
    ///
    /// The receive path is deliberately non-blocking-first: `recvmsg` is
    /// attempted before any poll, so frames already queued in the kernel are
    /// drained back-to-back with no wait in between. Only when the queue is
    /// empty does the call poll for new data, bounded by the configured
    /// timeout.
    ///
    /// # Arguments
    ///
    /// * `until` - Discard frames posted before this monotonic timestamp in
    ///   nanoseconds (0 accepts any frame). Pass [`crate::timestamp`] to skip
    ///   a backlog and wait for the next fresh frame.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] when nothing acceptable arrived in time,
    /// [`Error::Closed`] when the host went away and reconnection is
    /// disabled, [`Error::NotConnected`] when disconnected with reconnection
    /// disabled, [`Error::BadFd`] on a protocol violation in the fd transfer.
    pub fn get_frame(&self, until: i64) -> Result<Frame, Error> {
        self.shared.wait_frame(until)
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Frame {
    /// Waits for the next frame on `client`; equivalent to
    /// [`Client::get_frame`].
    pub fn wait(client: &Client, until: i64) -> Result<Self, Error> {
        client.get_frame(until)
    }
}

impl Shared {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn set_socket(&self, state: &mut State, sock: Option<OwnedFd>) {
        let fd = sock.as_ref().map(|s| s.as_raw_fd()).unwrap_or(-1);
        state.sock = sock;
        self.current_fd.store(fd, Ordering::Release);
    }

    /// Drop the connection and, when enabled, re-establish it after the
    /// current backoff stage. Marks the reconnect so the next received
    /// event is discarded.
    fn reconnect(&self, state: &mut State) -> Result<(), Error> {
        self.set_socket(state, None);
        if !self.reconnect {
            return Err(Error::Closed);
        }
        state.reconnecting = true;

        let stage = BACKOFF_MS[state.backoff_stage.min(BACKOFF_MS.len() - 1)];
        state.backoff_stage = (state.backoff_stage + 1).min(BACKOFF_MS.len() - 1);
        if stage > 0 {
            thread::sleep(Duration::from_millis(stage));
        }

        match sock::connect(&self.path) {
            Ok(sock) => {
                log::debug!("reconnected to {}", self.path);
                self.set_socket(state, Some(sock));
                state.backoff_stage = 0;
                Ok(())
            }
            Err(err) => {
                log::debug!("reconnect to {} failed: {}", self.path, err);
                Ok(()) // stay disconnected; the wait loop retries
            }
        }
    }

    fn wait_frame(self: &Arc<Self>, until: i64) -> Result<Frame, Error> {
        let mut state = self.lock_state();
        let deadline = Instant::now() + state.timeout;

        loop {
            let Some(fd) = state.sock.as_ref().map(|s| s.as_raw_fd()) else {
                if !self.reconnect {
                    return Err(Error::NotConnected);
                }
                if Instant::now() >= deadline {
                    return Err(Error::Timeout);
                }
                self.reconnect(&mut state)?;
                continue;
            };

            // Non-blocking receive first so a queued backlog drains without
            // ever touching poll. The watchdog is armed past the poll
            // deadline: the poll returns first unless the syscall is truly
            // stuck, in which case the watchdog shuts the socket down.
            self.watchdog.arm(fd, state.timeout.saturating_mul(2));
            let mut buf = [0u8; EVENT_SIZE];
            let (len, received) = match sock::recv_record(fd, &mut buf) {
                Ok((0, _)) => {
                    self.watchdog.disarm();
                    log::debug!("host closed connection");
                    self.reconnect(&mut state)?;
                    continue;
                }
                Ok(result) => {
                    self.watchdog.disarm();
                    result
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        self.watchdog.disarm();
                        return Err(Error::Timeout);
                    }
                    let ready = sock::poll_in(fd, remaining.as_millis() as i32);
                    self.watchdog.disarm();
                    match ready {
                        Ok(true) => continue,
                        Ok(false) => return Err(Error::Timeout),
                        Err(err) => return Err(Error::Io(err)),
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::InvalidInput => {
                    // The fd-0 stdin hazard from the transfer path.
                    self.watchdog.disarm();
                    return Err(Error::BadFd);
                }
                Err(err) => {
                    self.watchdog.disarm();
                    log::debug!("receive failed: {}", err);
                    self.reconnect(&mut state)?;
                    continue;
                }
            };

            // The first event after a reconnect may reference a buffer from
            // before the restart; drop it (and its descriptor) unseen.
            if state.reconnecting {
                state.reconnecting = false;
                discard_fd(received);
                continue;
            }

            let event = match FrameEvent::decode(&buf[..len]) {
                Ok(event) => event,
                Err(err) => {
                    log::warn!("malformed event record: {}", err);
                    discard_fd(received);
                    self.reconnect(&mut state)?;
                    continue;
                }
            };

            if event.error != ErrorKind::None {
                discard_fd(received);
                return Err(map_event_error(event.error, ControlOp::TryLock));
            }
            if !event.is_frame() {
                // Status/keepalive, or a late control response; no frame here.
                discard_fd(received);
                continue;
            }
            let now = crate::timestamp();
            if event.info.expires > 0 && event.info.expires < now {
                discard_fd(received);
                continue;
            }
            if until > 0 && event.info.timestamp < until {
                discard_fd(received);
                continue;
            }

            let Some(frame_fd) = received else {
                // A frame event must carry its descriptor.
                return Err(Error::BadFd);
            };
            return Ok(Frame::from_event(
                event.info,
                frame_fd,
                Arc::downgrade(self),
            ));
        }
    }

    /// Run one control round-trip, skipping interleaved broadcasts.
    ///
    /// A response that does not arrive within the timeout leaves the
    /// protocol state indeterminate, so the socket is closed.
    fn control(&self, op: ControlOp, serial: i64) -> Result<(), Error> {
        if serial == 0 {
            return Err(Error::BadArg);
        }
        let mut state = self.lock_state();
        let Some(fd) = state.sock.as_ref().map(|s| s.as_raw_fd()) else {
            return Err(Error::NotConnected);
        };

        self.watchdog.arm(fd, state.timeout.saturating_mul(2));
        let record = FrameControl::new(op, serial).encode();
        if let Err(err) = sock::send_record(fd, &record, None) {
            self.watchdog.disarm();
            self.set_socket(&mut state, None);
            return Err(Error::Io(err));
        }

        let deadline = Instant::now() + state.timeout;
        let result = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break Err(Error::Timeout);
            }
            match sock::poll_in(fd, remaining.as_millis() as i32) {
                Ok(true) => {}
                Ok(false) => break Err(Error::Timeout),
                Err(err) => break Err(Error::Io(err)),
            }

            let mut buf = [0u8; EVENT_SIZE];
            match sock::recv_record(fd, &mut buf) {
                Ok((0, _)) => break Err(Error::Closed),
                Ok((len, received)) => {
                    // Broadcasts interleave with the response on the same
                    // socket; skip them, closing their descriptors.
                    drop(received);
                    match FrameEvent::decode(&buf[..len]) {
                        Ok(event) if event.is_frame() => continue,
                        Ok(event) => {
                            break match event.error {
                                ErrorKind::None => Ok(()),
                                kind => Err(map_event_error(kind, op)),
                            };
                        }
                        Err(err) => break Err(err),
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => break Err(Error::Io(err)),
            }
        };
        self.watchdog.disarm();

        // Timeouts mid-exchange leave an unconsumed response in flight;
        // the connection cannot be trusted afterwards.
        if matches!(result, Err(Error::Timeout) | Err(Error::Closed)) {
            self.set_socket(&mut state, None);
        }
        result
    }

    pub(crate) fn trylock(&self, serial: i64) -> Result<(), Error> {
        self.control(ControlOp::TryLock, serial)
    }

    pub(crate) fn unlock(&self, serial: i64) -> Result<(), Error> {
        self.control(ControlOp::Unlock, serial)
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.watchdog.stop();
    }
}

/// Close the descriptor of a discarded event, but only when it is outside
/// the stdio range. The transfer path accepts fds 1 and 2 (with a warning);
/// closing those here would take the process's stdout or stderr slot with
/// them, so they are leaked instead.
fn discard_fd(received: Option<OwnedFd>) {
    if let Some(fd) = received {
        if fd.as_raw_fd() > 2 {
            drop(fd);
        } else {
            let _ = fd.into_raw_fd();
        }
    }
}

fn map_event_error(kind: ErrorKind, op: ControlOp) -> Error {
    match kind {
        ErrorKind::None => Error::BadMessage,
        // A lock on a frame that is gone "already exists no more": TryLock
        // callers see Exists, stray unlocks see Expired.
        ErrorKind::Expired => match op {
            ControlOp::TryLock => Error::Exists,
            ControlOp::Unlock => Error::Expired,
        },
        ErrorKind::TooManyLocks => Error::TooManyLocks,
        ErrorKind::InvalidControl => Error::InvalidControl,
        ErrorKind::BadMessage => Error::BadMessage,
    }
}

// ── Watchdog ────────────────────────────────────────────────────────────────

/// Deadline worker substituting for a POSIX timer: sleeps on a condvar until
/// the armed deadline and shuts the watched socket down when it fires,
/// waking whatever syscall is stuck on it.
struct Watchdog {
    inner: Arc<(Mutex<WatchState>, Condvar)>,
    thread: Option<thread::JoinHandle<()>>,
}

#[derive(Default)]
struct WatchState {
    deadline: Option<Instant>,
    target: RawFd,
    quit: bool,
}

impl Watchdog {
    fn spawn() -> Self {
        let inner = Arc::new((Mutex::new(WatchState::default()), Condvar::new()));
        let worker = Arc::clone(&inner);
        let thread = thread::Builder::new()
            .name("vsl-watchdog".to_string())
            .spawn(move || watchdog_loop(&worker))
            .ok();
        Watchdog { inner, thread }
    }

    /// Re-arm the deadline for `fd`. Called before every socket operation.
    fn arm(&self, fd: RawFd, timeout: Duration) {
        let (lock, cvar) = &*self.inner;
        if let Ok(mut state) = lock.lock() {
            state.deadline = Some(Instant::now() + timeout);
            state.target = fd;
            cvar.notify_one();
        }
    }

    fn disarm(&self) {
        let (lock, cvar) = &*self.inner;
        if let Ok(mut state) = lock.lock() {
            state.deadline = None;
            cvar.notify_one();
        }
    }

    fn stop(&mut self) {
        let (lock, cvar) = &*self.inner;
        if let Ok(mut state) = lock.lock() {
            state.quit = true;
            cvar.notify_one();
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn watchdog_loop(inner: &(Mutex<WatchState>, Condvar)) {
    let (lock, cvar) = inner;
    let Ok(mut state) = lock.lock() else {
        return;
    };
    loop {
        if state.quit {
            return;
        }
        match state.deadline {
            None => {
                state = match cvar.wait(state) {
                    Ok(guard) => guard,
                    Err(_) => return,
                };
            }
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    log::warn!("watchdog expired, shutting down socket {}", state.target);
                    sock::shutdown(state.target);
                    state.deadline = None;
                } else {
                    state = match cvar.wait_timeout(state, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(_) => return,
                    };
                }
            }
        }
    }
}
