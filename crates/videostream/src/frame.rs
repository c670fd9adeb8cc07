// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use crate::{
    alloc::{self, Backing, SyncMode},
    client,
    fourcc::FourCC,
    wire::FrameInfo,
    Error,
};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::raw::c_void;
use std::sync::{atomic::AtomicBool, atomic::Ordering, Weak};
use std::{ptr, slice};

/// Callback invoked on release for frames whose backing fd belongs to an
/// external allocator. When set, the callback is authoritative over the fd
/// lifetime: the release path hands the descriptor over instead of closing it.
pub type Cleanup = Box<dyn FnOnce(RawFd) + Send>;

/// The Frame structure handles the frame and underlying framebuffer.  A frame
/// can be an image or a single video frame, the distinction is not considered.
///
/// A frame can be created and used as a free-standing frame, which means it is
/// not published through a Host nor was it created from a receiving Client. A
/// free-standing frame can be mapped and filled before being posted through a
/// [`crate::host::Host`].
///
/// Dropping a frame releases everything it owns, in order: the memory mapping,
/// the client-side lock (if this frame arrived through a
/// [`crate::client::Client`] and is still locked), the backing allocation
/// (closing the fd and unlinking shared memory we created), and finally the
/// cleanup callback.
///
/// # Examples
///
/// ```no_run
/// use videostream::frame::Frame;
///
/// let mut frame = Frame::new(1920, 1080, 0, "YUYV")?;
/// frame.alloc(None)?;
/// println!("Frame: {}x{}", frame.width(), frame.height());
/// # Ok::<(), videostream::Error>(())
/// ```
pub struct Frame {
    info: FrameInfo,
    handle: Handle,
    mapping: Option<Mapping>,
    cleanup: Option<Cleanup>,
    userptr: *mut c_void,
    /// Station that delivered this frame, when client-owned. Used only to
    /// dispatch lock control on release, never to read state.
    client: Weak<client::Shared>,
    /// Client-side record of whether we hold a lock on the host.
    locked: AtomicBool,
}

enum Handle {
    None,
    External(OwnedFd),
    Allocated(alloc::Allocation),
}

struct Mapping {
    ptr: *mut u8,
    len: usize,
}

// The raw mapping pointer and userptr are what prevent an automatic Send;
// the mapping is owned exclusively by this frame and the userptr is opaque
// to the library.
unsafe impl Send for Frame {}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("serial", &self.info.serial)
            .field("width", &self.info.width)
            .field("height", &self.info.height)
            .field("fourcc", &FourCC::from(self.info.fourcc))
            .finish()
    }
}

impl Frame {
    /// Creates a free-standing frame with no backing memory.
    ///
    /// A stride of 0 is filled from the format table; formats without a
    /// single tabulated stride require an explicit one and fail with
    /// [`Error::Unsupported`] otherwise.
    pub fn new(width: i32, height: i32, stride: i32, fourcc_str: &str) -> Result<Self, Error> {
        let buf = fourcc_str.as_bytes();
        if buf.len() != 4 {
            return Err(Error::BadArg);
        }
        let fourcc = FourCC::from(buf);
        Self::with_fourcc(width, height, stride, fourcc)
    }

    /// [`Frame::new`] with an already-parsed [`FourCC`].
    pub fn with_fourcc(
        width: i32,
        height: i32,
        stride: i32,
        fourcc: FourCC,
    ) -> Result<Self, Error> {
        if width <= 0 || height <= 0 || u32::from(fourcc) == 0 {
            return Err(Error::BadArg);
        }
        if stride < 0 {
            return Err(Error::BadArg);
        }
        let stride = if stride == 0 {
            fourcc.bytes_per_line(width).ok_or(Error::Unsupported)?
        } else {
            stride
        };

        Ok(Frame {
            info: FrameInfo {
                fourcc: fourcc.into(),
                width,
                height,
                stride,
                ..FrameInfo::default()
            },
            handle: Handle::None,
            mapping: None,
            cleanup: None,
            userptr: ptr::null_mut(),
            client: Weak::new(),
            locked: AtomicBool::new(false),
        })
    }

    /// Materialize a frame from a received event record and its descriptor.
    pub(crate) fn from_event(info: FrameInfo, fd: OwnedFd, client: Weak<client::Shared>) -> Self {
        Frame {
            info,
            handle: Handle::External(fd),
            mapping: None,
            cleanup: None,
            userptr: ptr::null_mut(),
            client,
            locked: AtomicBool::new(false),
        }
    }

    /// Attaches an externally-allocated buffer to the frame.
    ///
    /// The descriptor is duplicated; the caller keeps its own copy. A `size`
    /// of 0 derives the extent from the frame's format geometry.
    ///
    /// # Errors
    ///
    /// [`Error::BadFd`] for fd ≤ 0 (fd 0 is the stdin hazard), and for the
    /// pathological case where the duplicate lands on a stdio descriptor,
    /// which means the process is running with stdio closed.
    pub fn attach(&mut self, fd: RawFd, size: usize, offset: isize) -> Result<(), Error> {
        if fd <= 0 {
            return Err(Error::BadFd);
        }
        let dup = unsafe { libc::dup(fd) };
        if dup < 0 {
            return Err(Error::last_os_error());
        }
        let dup = unsafe { OwnedFd::from_raw_fd(dup) };
        if dup.as_raw_fd() <= 2 {
            return Err(Error::BadFd);
        }

        let size = if size == 0 {
            self.default_size().ok_or(Error::Unsupported)?
        } else {
            size
        };

        self.unmap_and_teardown();
        self.handle = Handle::External(dup);
        self.info.size = size;
        self.info.offset = offset;
        self.info.paddr = 0;
        Ok(())
    }

    /// Allocates backing memory for the frame.
    ///
    /// With `path` naming anything outside `/dev`, a POSIX shared-memory
    /// object is created at that name. A `/dev/...` path selects that DmaBuf
    /// heap directly. Without a path the DmaBuf heaps are probed and shared
    /// memory is the fallback.
    pub fn alloc(&mut self, path: Option<&str>) -> Result<(), Error> {
        let size = self.default_size().ok_or(Error::Unsupported)?;
        let allocation = alloc::allocate(path, size)?;
        self.unmap_and_teardown();
        self.info.size = allocation.size;
        self.info.offset = 0;
        self.info.paddr = 0;
        self.handle = Handle::Allocated(allocation);
        Ok(())
    }

    fn default_size(&self) -> Option<usize> {
        FourCC::from(self.info.fourcc).buffer_size(self.info.stride, self.info.height)
    }

    /// Frees the allocated buffer but keeps the frame metadata, returning the
    /// frame to its free-standing state. The handle is gone afterwards.
    pub fn unalloc(&mut self) {
        self.unmap_and_teardown();
        self.info.size = 0;
        self.info.offset = 0;
        self.info.paddr = 0;
    }

    /// Maps the frame buffer and returns it as a shared slice.
    ///
    /// The mapping is created on first use and cached; DmaBuf-backed frames
    /// are bracketed with a sync-begin. Call [`Frame::munmap`] to drop the
    /// mapping early, otherwise it lives until the frame is released.
    pub fn mmap(&mut self) -> Result<&[u8], Error> {
        self.map()?;
        let m = self.mapping.as_ref().ok_or(Error::BadArg)?;
        Ok(unsafe { slice::from_raw_parts(m.ptr, m.len) })
    }

    /// Maps the frame buffer for writing.
    pub fn mmap_mut(&mut self) -> Result<&mut [u8], Error> {
        self.map()?;
        let m = self.mapping.as_ref().ok_or(Error::BadArg)?;
        Ok(unsafe { slice::from_raw_parts_mut(m.ptr, m.len) })
    }

    fn map(&mut self) -> Result<(), Error> {
        if self.mapping.is_some() {
            return Ok(());
        }
        let fd = self.raw_handle().ok_or(Error::BadFd)?;
        let len = self.info.size;
        if len == 0 {
            return Err(Error::BadArg);
        }
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                self.info.offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }
        if self.backing() == Backing::DmaHeap {
            if let Err(err) = alloc::dma_sync(fd, true, SyncMode::ReadWrite) {
                unsafe { libc::munmap(ptr, len) };
                return Err(err);
            }
        }
        self.mapping = Some(Mapping {
            ptr: ptr as *mut u8,
            len,
        });
        Ok(())
    }

    /// Unmaps the frame buffer, issuing the DmaBuf sync-end when needed.
    pub fn munmap(&mut self) {
        if let Some(m) = self.mapping.take() {
            if self.backing() == Backing::DmaHeap {
                if let Some(fd) = self.raw_handle() {
                    let _ = alloc::dma_sync(fd, false, SyncMode::ReadWrite);
                }
            }
            unsafe { libc::munmap(m.ptr as *mut c_void, m.len) };
        }
    }

    /// Bracket CPU access to the buffer. No-op for non-DmaBuf backings.
    pub fn sync(&self, start: bool, mode: SyncMode) -> Result<(), Error> {
        if self.backing() != Backing::DmaHeap {
            return Ok(());
        }
        let fd = self.raw_handle().ok_or(Error::BadFd)?;
        alloc::dma_sync(fd, start, mode)
    }

    /// Physical address of the buffer for hardware consumers, queried once
    /// and cached. `None` unless the frame is DmaBuf-backed on a kernel that
    /// implements the query.
    pub fn paddr(&mut self) -> Option<isize> {
        if self.info.paddr != 0 {
            return Some(self.info.paddr);
        }
        if self.backing() != Backing::DmaHeap {
            return None;
        }
        let phys = alloc::dma_phys(self.raw_handle()?)?;
        self.info.paddr = phys;
        Some(phys)
    }

    /// Requests a hold on this frame from the publishing host, preventing
    /// expiry until [`Frame::unlock`]. Only meaningful for frames received
    /// through a [`crate::client::Client`].
    ///
    /// # Errors
    ///
    /// [`Error::Exists`] when the frame already expired on the host,
    /// [`Error::TooManyLocks`] when this client's quota is reached, and
    /// [`Error::NotConnected`] for free-standing frames.
    pub fn trylock(&self) -> Result<(), Error> {
        let client = self.client.upgrade().ok_or(Error::NotConnected)?;
        client.trylock(self.info.serial)?;
        self.locked.store(true, Ordering::Release);
        Ok(())
    }

    /// Releases a hold previously taken with [`Frame::trylock`].
    pub fn unlock(&self) -> Result<(), Error> {
        let client = self.client.upgrade().ok_or(Error::NotConnected)?;
        self.locked.store(false, Ordering::Release);
        client.unlock(self.info.serial)
    }

    /// Registers a cleanup callback that takes over the descriptor on
    /// release instead of the frame closing it.
    pub fn set_cleanup(&mut self, cleanup: Cleanup) {
        self.cleanup = Some(cleanup);
    }

    /// Returns the user pointer associated with this frame, or `None` if
    /// none was set.
    pub fn userptr(&self) -> Option<*mut c_void> {
        if self.userptr.is_null() {
            None
        } else {
            Some(self.userptr)
        }
    }

    /// Associates a user pointer with this frame.
    ///
    /// # Safety
    ///
    /// The pointer is stored, never dereferenced by the library, and returned
    /// by [`Frame::userptr`]; the caller must keep it valid for as long as it
    /// may be retrieved.
    pub unsafe fn set_userptr(&mut self, userptr: *mut c_void) {
        self.userptr = userptr;
    }

    pub fn serial(&self) -> i64 {
        self.info.serial
    }

    pub fn timestamp(&self) -> i64 {
        self.info.timestamp
    }

    pub fn duration(&self) -> i64 {
        self.info.duration
    }

    pub fn pts(&self) -> i64 {
        self.info.pts
    }

    pub fn dts(&self) -> i64 {
        self.info.dts
    }

    pub fn expires(&self) -> i64 {
        self.info.expires
    }

    pub fn fourcc(&self) -> u32 {
        self.info.fourcc
    }

    pub fn width(&self) -> i32 {
        self.info.width
    }

    pub fn height(&self) -> i32 {
        self.info.height
    }

    /// Stride in bytes of one image row. May exceed width × bytes-per-pixel
    /// for alignment reasons.
    pub fn stride(&self) -> i32 {
        self.info.stride
    }

    pub fn size(&self) -> usize {
        self.info.size
    }

    pub fn offset(&self) -> isize {
        self.info.offset
    }

    /// The backing file descriptor, or -1 when the frame has none.
    pub fn handle(&self) -> RawFd {
        self.raw_handle().unwrap_or(-1)
    }

    /// Shared-memory object name when this frame allocated one.
    pub fn path(&self) -> Option<&str> {
        match &self.handle {
            Handle::Allocated(a) => a.name.as_ref().and_then(|n| n.to_str().ok()),
            _ => None,
        }
    }

    pub(crate) fn raw_handle(&self) -> Option<RawFd> {
        match &self.handle {
            Handle::None => None,
            Handle::External(fd) => Some(fd.as_raw_fd()),
            Handle::Allocated(a) => Some(a.fd.as_raw_fd()),
        }
    }

    pub(crate) fn backing(&self) -> Backing {
        match &self.handle {
            Handle::None | Handle::External(_) => Backing::External,
            Handle::Allocated(a) => a.kind,
        }
    }

    pub(crate) fn info(&self) -> &FrameInfo {
        &self.info
    }

    pub(crate) fn info_mut(&mut self) -> &mut FrameInfo {
        &mut self.info
    }

    /// Drop the mapping and the backing, honoring the cleanup contract.
    fn unmap_and_teardown(&mut self) {
        self.munmap();
        match std::mem::replace(&mut self.handle, Handle::None) {
            Handle::None => {}
            Handle::External(fd) => {
                if let Some(cleanup) = self.cleanup.take() {
                    // The callback owns the descriptor from here.
                    cleanup(fd.into_raw_fd());
                } else {
                    drop(fd);
                }
            }
            Handle::Allocated(allocation) => drop(allocation),
        }
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        // Release order: munmap, then the client-side unlock, then the
        // backing teardown and cleanup callback.
        self.munmap();
        if self.locked.load(Ordering::Acquire) {
            if let Some(client) = self.client.upgrade() {
                if let Err(err) = client.unlock(self.info.serial) {
                    log::debug!("unlock of serial {} on release: {}", self.info.serial, err);
                }
            }
        }
        self.unmap_and_teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::{
        fs::{self, File},
        io::Write,
        os::fd::AsRawFd,
    };

    #[test]
    fn frame() {
        let mut frame = Frame::new(640, 480, 0, "RGB3").unwrap();

        assert_eq!(frame.width(), 640);
        assert_eq!(frame.height(), 480);
        assert_eq!(frame.fourcc(), 0x33424752);
        assert_eq!(frame.path(), None);
        assert_eq!(frame.handle(), -1);

        frame.alloc(None).unwrap();

        assert_eq!(frame.size(), 640 * 480 * 3);
        assert!(frame.handle() > 2);

        let mut rng = rand::rng();
        let mut expect = vec![0u8; frame.size()];
        rng.fill(expect.as_mut_slice());

        frame.mmap_mut().unwrap().copy_from_slice(&expect);
        assert_eq!(frame.mmap().unwrap(), expect.as_slice());

        // A second frame attached to the same fd sees the same bytes.
        let mut frame2 = Frame::new(640, 480, 0, "RGB3").unwrap();
        frame2.attach(frame.handle(), frame.size(), 0).unwrap();
        assert_eq!(frame2.mmap().unwrap(), expect.as_slice());

        // Writes through either mapping are visible to both.
        frame2.mmap_mut().unwrap()[0] = expect[0].wrapping_add(1);
        assert_eq!(frame.mmap().unwrap()[0], expect[0].wrapping_add(1));
    }

    #[test]
    fn attach_file() {
        let path = format!("/tmp/vsl_frame_attach_{}.bin", std::process::id());
        let mut frame = Frame::new(640, 480, 0, "RGB3").unwrap();

        let mut rng = rand::rng();
        let mut expect = vec![0u8; (640 * 480 * 3) as usize];
        rng.fill(expect.as_mut_slice());

        let mut file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.write_all(&expect).unwrap();

        frame.attach(file.as_raw_fd(), expect.len(), 0).unwrap();

        assert_eq!(frame.mmap().unwrap(), expect.as_slice());

        drop(frame);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn bad_attach() {
        let mut frame = Frame::new(640, 480, 0, "RGB3").unwrap();

        assert!(matches!(frame.attach(-1, 1, 0), Err(Error::BadFd)));
        assert!(matches!(frame.attach(0, 1, 0), Err(Error::BadFd)));
        // A descriptor that is not open fails on dup.
        assert!(frame.attach(9000, 1, 0).is_err());
    }

    #[test]
    fn bad_fourcc() {
        assert!(matches!(
            Frame::new(640, 480, 0, "TOOLONG"),
            Err(Error::BadArg)
        ));
        // Unknown fourcc without an explicit stride cannot be sized.
        assert!(matches!(
            Frame::new(640, 480, 0, "ZZZZ"),
            Err(Error::Unsupported)
        ));
        // With an explicit stride it is accepted.
        assert!(Frame::new(640, 480, 1280, "ZZZZ").is_ok());
    }

    #[test]
    fn bad_geometry() {
        assert!(matches!(Frame::new(0, 480, 0, "RGB3"), Err(Error::BadArg)));
        assert!(matches!(Frame::new(640, 0, 0, "RGB3"), Err(Error::BadArg)));
        assert!(matches!(
            Frame::new(640, 480, -1, "RGB3"),
            Err(Error::BadArg)
        ));
    }

    #[test]
    fn test_frame_stride() {
        let mut frame = Frame::new(640, 480, 1920, "RGB3").unwrap();
        frame.alloc(None).unwrap();
        assert_eq!(frame.stride(), 1920);
        assert!(frame.stride() >= 640 * 3);
    }

    #[test]
    fn planar_alloc_includes_chroma() {
        let mut frame = Frame::new(640, 480, 0, "NV12").unwrap();
        frame.alloc(None).unwrap();
        assert_eq!(frame.size(), 640 * 480 * 3 / 2);
        assert_eq!(frame.mmap().unwrap().len(), 640 * 480 * 3 / 2);
    }

    #[test]
    fn test_frame_userptr() {
        let mut frame = Frame::new(640, 480, 0, "RGB3").unwrap();

        assert!(frame.userptr().is_none());

        let test_ptr = 0x12345678 as *mut c_void;
        unsafe {
            frame.set_userptr(test_ptr);
        }
        assert_eq!(frame.userptr().unwrap(), test_ptr);
    }

    #[test]
    fn test_frame_unalloc() {
        let mut frame = Frame::new(640, 480, 0, "RGB3").unwrap();
        frame.alloc(None).unwrap();
        assert!(frame.size() > 0);

        frame.unalloc();

        assert_eq!(frame.handle(), -1, "Handle should be -1 after unalloc");
        assert_eq!(frame.size(), 0);
    }

    #[test]
    fn cleanup_takes_over_fd() {
        use std::sync::mpsc;

        let file = File::open("/dev/null").unwrap();
        let (tx, rx) = mpsc::channel();

        let mut frame = Frame::new(16, 16, 0, "GREY").unwrap();
        frame.attach(file.as_raw_fd(), 256, 0).unwrap();
        let dup = frame.handle();
        frame.set_cleanup(Box::new(move |fd| {
            tx.send(fd).unwrap();
            unsafe { libc::close(fd) };
        }));
        drop(frame);

        // The callback received the duplicated descriptor rather than the
        // frame closing it behind our back.
        assert_eq!(rx.recv().unwrap(), dup);
    }

    #[test]
    fn shm_path_is_reported() {
        let name = format!("/vsl_frame_path_{}", std::process::id());
        let mut frame = Frame::new(64, 64, 0, "GREY").unwrap();
        frame.alloc(Some(&name)).unwrap();
        assert_eq!(frame.path(), Some(name.as_str()));
    }

    #[test]
    fn test_frame_debug() {
        let frame = Frame::new(1920, 1080, 0, "YUYV").unwrap();
        let debug_str = format!("{:?}", frame);

        assert!(debug_str.contains("Frame"));
        assert!(debug_str.contains("1920"));
        assert!(debug_str.contains("1080"));
    }
}
