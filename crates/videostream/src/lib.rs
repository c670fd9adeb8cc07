// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! VideoStream Library
//!
//! Zero-copy video frame management and distribution across processes and
//! containers on embedded Linux.
//!
//! The VideoStream Library enables efficient frame sharing through DMA buffers
//! or shared-memory with signaling over UNIX Domain Sockets, optimized for
//! edge AI and computer vision applications on resource-constrained embedded
//! devices like NXP i.MX8M Plus.
//!
//! # Architecture
//!
//! VideoStream uses a **Host/Client** pattern for inter-process communication:
//!
//! - **Host**: Publishes video frames to a UNIX seqpacket socket
//! - **Clients**: Subscribe to frames by connecting to the socket
//! - **Frames**: Zero-copy shared memory (DmaBuf or POSIX shm) with metadata
//!
//! Each published frame travels as a fixed-size event record plus the frame's
//! file descriptor in the message's ancillary data (`SCM_RIGHTS`), so clients
//! map the frame pages directly without copying. Frames have a short declared
//! lifetime; clients that need to hold one past its expiry lock it and later
//! unlock it.
//!
//! # Quick Start
//!
//! ## Publishing Frames (Host)
//!
//! ```no_run
//! use videostream::{host::Host, frame::Frame, timestamp, Error};
//!
//! fn publish_frames() -> Result<(), Error> {
//!     // Create host on UNIX socket
//!     let host = Host::new("/tmp/video.sock")?;
//!
//!     // Create and allocate a frame
//!     let mut frame = Frame::new(1920, 1080, 1920 * 2, "YUYV")?;
//!     frame.alloc(None)?; // DmaBuf or shared memory
//!
//!     // Broadcast with a 100ms lifetime
//!     let expires = timestamp() + 100_000_000;
//!     host.post(frame, expires, -1, -1, -1)?;
//!     Ok(())
//! }
//! # publish_frames().ok();
//! ```
//!
//! ## Subscribing to Frames (Client)
//!
//! ```no_run
//! use videostream::{client::{Client, Reconnect}, Error};
//!
//! fn subscribe_frames() -> Result<(), Error> {
//!     // Connect to host socket (auto-reconnect on disconnect)
//!     let client = Client::new("/tmp/video.sock", Reconnect::Yes)?;
//!
//!     // Wait for next frame (blocking)
//!     let frame = client.get_frame(0)?;
//!
//!     // Lock frame before accessing
//!     frame.trylock()?;
//!     println!("Frame: {}x{}", frame.width(), frame.height());
//!     frame.unlock()?;
//!
//!     Ok(())
//! }
//! # subscribe_frames().ok();
//! ```
//!
//! # Features
//!
//! - **Zero-copy sharing**: DmaBuf or POSIX shared memory for minimal overhead
//! - **Multi-subscriber**: One host can serve many clients simultaneously
//! - **Cross-process**: UNIX sockets enable containerized applications
//! - **Bounded holds**: per-client lock quotas keep producers in control of
//!   frame memory
//!
//! # Platform Support
//!
//! - **Primary**: NXP i.MX8M Plus (DmaBuf heap allocation)
//! - **Compatible**: Any Linux system (POSIX shared-memory fallback)
//! - **Kernel**: Linux 4.14+ (5.6+ recommended for DmaBuf heap)
//!
//! # Error Handling
//!
//! All fallible operations return [`Result<T, Error>`]. The [`Error`] enum
//! covers protocol, resource, and I/O failures; the library reports errors
//! rather than panicking.

use std::{error, fmt, io};

/// Error type for VideoStream library operations
#[non_exhaustive]
#[derive(Debug)]
pub enum Error {
    /// Invalid caller input (zero dimension, empty path, bad argument)
    BadArg,

    /// Frame buffer or table allocation failed
    NoMemory,

    /// Unrecognized fourcc for stride derivation, or no usable allocator
    Unsupported,

    /// Watchdog fired, lock acquisition timed out, or deadline passed
    Timeout,

    /// Peer closed the connection
    Closed,

    /// Client is not connected and reconnect is disabled
    NotConnected,

    /// Short read or malformed record; the peer is disconnected
    BadMessage,

    /// Received fd 0 (stdin hazard) or attach of an invalid fd
    BadFd,

    /// The targeted frame has already expired or was never known
    Expired,

    /// Lock requested on a frame that is already gone
    Exists,

    /// Per-client lock quota reached
    TooManyLocks,

    /// Unknown control operation received
    InvalidControl,

    /// I/O error from underlying system calls
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::BadArg => write!(f, "invalid argument"),
            Error::NoMemory => write!(f, "allocation failed"),
            Error::Unsupported => write!(f, "unsupported format or allocator"),
            Error::Timeout => write!(f, "operation timed out"),
            Error::Closed => write!(f, "connection closed by peer"),
            Error::NotConnected => write!(f, "client is not connected"),
            Error::BadMessage => write!(f, "malformed protocol record"),
            Error::BadFd => write!(f, "invalid file descriptor"),
            Error::Expired => write!(f, "frame expired"),
            Error::Exists => write!(f, "frame no longer exists"),
            Error::TooManyLocks => write!(f, "per-client lock quota reached"),
            Error::InvalidControl => write!(f, "unknown control operation"),
            Error::Io(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl Error {
    /// Capture `errno` from the last failed syscall.
    pub(crate) fn last_os_error() -> Self {
        Error::Io(io::Error::last_os_error())
    }
}

/// Frame management for video data.
///
/// Provides the [`Frame`](frame::Frame) type for creating, allocating, and
/// manipulating video frames. Frames can be free-standing or shared via Host/Client.
pub mod frame;

/// Client API for subscribing to video frames.
///
/// Provides the [`Client`](client::Client) type for connecting to a
/// [`Host`](host::Host) and receiving published frames.
pub mod client;

/// Host API for publishing video frames.
///
/// Provides the [`Host`](host::Host) type for managing a UNIX socket server
/// that publishes frames to connected clients.
pub mod host;

/// FOURCC pixel format codes.
///
/// Provides the [`FourCC`](fourcc::FourCC) type for portable handling of
/// four-character-code pixel formats (e.g., "YUYV", "NV12") along with the
/// stride and buffer-size tables for the supported formats.
pub mod fourcc;

/// Wire records exchanged between Host and Client.
pub mod wire;

/// Frame buffer allocation from DmaBuf heaps or POSIX shared memory.
pub mod alloc;

pub(crate) mod sock;

/// Returns the VideoStream Library version string.
///
/// The version follows semantic versioning (MAJOR.MINOR.PATCH).
///
/// # Example
///
/// ```
/// println!("VideoStream version: {}", videostream::version());
/// ```
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Returns the current monotonic timestamp in nanoseconds.
///
/// Uses `CLOCK_MONOTONIC` for consistent timing across the system.
/// Frame timestamps and expiry deadlines are expressed on this clock.
///
/// # Example
///
/// ```
/// let ts = videostream::timestamp();
/// assert!(ts > 0);
/// ```
pub fn timestamp() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_MONOTONIC cannot fail with a valid timespec pointer.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
        assert!(version().split('.').count() >= 3);
    }

    #[test]
    fn test_timestamp_monotonic() {
        let a = timestamp();
        let b = timestamp();
        assert!(a > 0, "timestamp should be positive");
        assert!(b >= a, "timestamp should be monotonic");
    }

    #[test]
    fn test_error_display_io() {
        let io_err = Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "test error",
        ));
        let display = format!("{}", io_err);
        assert!(
            display.contains("test error") || display.contains("I/O error"),
            "Display should contain error message"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no access");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_error_debug() {
        let err = Error::TooManyLocks;
        let debug_str = format!("{:?}", err);
        assert!(debug_str.contains("TooManyLocks"));
    }

    #[test]
    fn test_error_source() {
        use std::error::Error as StdError;

        // Protocol errors carry no source
        let err = Error::Expired;
        assert!(err.source().is_none());

        // Io error should have a source
        let io_err = Error::Io(std::io::Error::other("test"));
        assert!(io_err.source().is_some());
    }

    #[test]
    fn test_error_display_taxonomy() {
        // Every variant renders a non-empty, distinct message.
        let variants = [
            Error::BadArg,
            Error::NoMemory,
            Error::Unsupported,
            Error::Timeout,
            Error::Closed,
            Error::NotConnected,
            Error::BadMessage,
            Error::BadFd,
            Error::Expired,
            Error::Exists,
            Error::TooManyLocks,
            Error::InvalidControl,
        ];
        let mut seen = std::collections::HashSet::new();
        for v in &variants {
            let msg = format!("{}", v);
            assert!(!msg.is_empty());
            assert!(seen.insert(msg), "duplicate Display message for {:?}", v);
        }
    }
}
