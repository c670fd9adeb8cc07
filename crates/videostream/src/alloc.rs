// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Frame buffer allocation.
//!
//! Producers that do not attach an externally-allocated buffer get one from
//! here. The shim prefers a DmaBuf heap (physically contiguous, shareable
//! with hardware consumers) and falls back to POSIX shared memory, which is
//! available everywhere and shares through the same fd-passing path.
//!
//! Selection order for [`allocate`]:
//!
//! 1. Caller-provided name not beginning with `/dev` → `shm_open` at that
//!    name.
//! 2. Caller-provided `/dev/...` path, or a probe hit on
//!    `/dev/dma_heap/linux,cma` then `/dev/dma_heap/system` →
//!    `DMA_HEAP_IOCTL_ALLOC` on that device.
//! 3. Otherwise shm under an auto-generated per-thread name
//!    (`/VSL_<pid>_<tid>`).

use crate::Error;
use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Which facility owns a frame's backing memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// Attached by the caller (or received over a socket); not ours to create
    External,
    /// Allocated from a kernel DmaBuf heap
    DmaHeap,
    /// Allocated as a POSIX shared-memory object
    Shm,
}

/// CPU-access direction for DmaBuf sync bracketing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Read,
    Write,
    ReadWrite,
}

// From <linux/dma-heap.h>.
#[repr(C)]
struct DmaHeapAllocationData {
    len: u64,
    fd: u32,
    fd_flags: u32,
    heap_flags: u64,
}

// From <linux/dma-buf.h>.
#[repr(C)]
struct DmaBufSync {
    flags: u64,
}

// NXP vendor extension reporting the physical address of a contiguous buffer.
#[repr(C)]
struct DmaBufPhys {
    phys: u64,
}

// _IOWR('H', 0x0, struct dma_heap_allocation_data)
const DMA_HEAP_IOCTL_ALLOC: libc::c_ulong = 0xc018_4800;
// _IOW('b', 0, struct dma_buf_sync)
const DMA_BUF_IOCTL_SYNC: libc::c_ulong = 0x4008_6200;
// _IOR('b', 10, struct dma_buf_phys)
const DMA_BUF_IOCTL_PHYS: libc::c_ulong = 0x8008_620a;

const DMA_BUF_SYNC_READ: u64 = 1 << 0;
const DMA_BUF_SYNC_WRITE: u64 = 1 << 1;
const DMA_BUF_SYNC_START: u64 = 0;
const DMA_BUF_SYNC_END: u64 = 1 << 2;

const DMA_HEAP_CMA: &str = "/dev/dma_heap/linux,cma";
const DMA_HEAP_SYSTEM: &str = "/dev/dma_heap/system";

/// An owned backing buffer: the shareable fd plus what is needed to tear it
/// down. Dropping closes the fd and unlinks the shm name when we created one.
#[derive(Debug)]
pub(crate) struct Allocation {
    pub fd: OwnedFd,
    pub size: usize,
    pub kind: Backing,
    /// Shm object name, kept for unlink on release.
    pub name: Option<CString>,
}

impl Drop for Allocation {
    fn drop(&mut self) {
        if let Some(name) = self.name.take() {
            unsafe { libc::shm_unlink(name.as_ptr()) };
        }
        // OwnedFd closes the descriptor.
    }
}

pub(crate) fn allocate(path: Option<&str>, size: usize) -> Result<Allocation, Error> {
    if size == 0 {
        return Err(Error::BadArg);
    }

    match path {
        Some(p) if !p.starts_with("/dev") => shm_allocate(p, size),
        Some(p) => dma_heap_allocate(p, size),
        None => {
            for heap in [DMA_HEAP_CMA, DMA_HEAP_SYSTEM] {
                if std::path::Path::new(heap).exists() {
                    match dma_heap_allocate(heap, size) {
                        Ok(alloc) => return Ok(alloc),
                        Err(err) => {
                            log::warn!("dma heap {} allocation failed: {}", heap, err);
                        }
                    }
                }
            }
            let name = format!("/VSL_{}_{}", std::process::id(), gettid());
            shm_allocate(&name, size)
        }
    }
}

fn gettid() -> i64 {
    unsafe { libc::syscall(libc::SYS_gettid) as i64 }
}

fn shm_allocate(name: &str, size: usize) -> Result<Allocation, Error> {
    // POSIX shm names carry exactly one leading slash.
    let shm_name = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{}", name)
    };
    let cname = CString::new(shm_name).map_err(|_| Error::BadArg)?;

    // Clear any leftover object from a crashed owner so O_EXCL can assert
    // sole ownership of the new one.
    unsafe { libc::shm_unlink(cname.as_ptr()) };

    let fd = unsafe {
        libc::shm_open(
            cname.as_ptr(),
            libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
            0o600 as libc::mode_t,
        )
    };
    if fd < 0 {
        return Err(Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    if unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) } < 0 {
        let err = Error::last_os_error();
        unsafe { libc::shm_unlink(cname.as_ptr()) };
        return Err(err);
    }

    Ok(Allocation {
        fd,
        size,
        kind: Backing::Shm,
        name: Some(cname),
    })
}

fn dma_heap_allocate(heap_path: &str, size: usize) -> Result<Allocation, Error> {
    let cpath = CString::new(heap_path).map_err(|_| Error::BadArg)?;
    let heap = unsafe { libc::open(cpath.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if heap < 0 {
        return Err(Error::last_os_error());
    }
    let heap = unsafe { OwnedFd::from_raw_fd(heap) };

    let mut data = DmaHeapAllocationData {
        len: size as u64,
        fd: 0,
        fd_flags: (libc::O_RDWR | libc::O_CLOEXEC) as u32,
        heap_flags: 0,
    };
    let ret = unsafe { libc::ioctl(heap.as_raw_fd(), DMA_HEAP_IOCTL_ALLOC as _, &mut data) };
    if ret < 0 {
        return Err(Error::last_os_error());
    }
    if data.fd == 0 {
        // Slot 0 means stdin was closed out from under us; refuse to own it.
        unsafe { libc::close(data.fd as RawFd) };
        return Err(Error::BadFd);
    }

    Ok(Allocation {
        fd: unsafe { OwnedFd::from_raw_fd(data.fd as RawFd) },
        size,
        kind: Backing::DmaHeap,
        name: None,
    })
}

/// Bracket CPU access to a DmaBuf: `start = true` before touching the pages,
/// `start = false` once done. No-op errors are surfaced to the caller.
pub(crate) fn dma_sync(fd: RawFd, start: bool, mode: SyncMode) -> Result<(), Error> {
    let dir = match mode {
        SyncMode::Read => DMA_BUF_SYNC_READ,
        SyncMode::Write => DMA_BUF_SYNC_WRITE,
        SyncMode::ReadWrite => DMA_BUF_SYNC_READ | DMA_BUF_SYNC_WRITE,
    };
    let phase = if start {
        DMA_BUF_SYNC_START
    } else {
        DMA_BUF_SYNC_END
    };
    let sync = DmaBufSync { flags: dir | phase };
    let ret = unsafe { libc::ioctl(fd, DMA_BUF_IOCTL_SYNC as _, &sync) };
    if ret < 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Physical address of a DmaBuf, for hardware consumers downstream. Returns
/// `None` when the kernel does not implement the query (non-NXP kernels).
pub(crate) fn dma_phys(fd: RawFd) -> Option<isize> {
    let mut phys = DmaBufPhys { phys: 0 };
    let ret = unsafe { libc::ioctl(fd, DMA_BUF_IOCTL_PHYS as _, &mut phys) };
    if ret < 0 {
        return None;
    }
    Some(phys.phys as isize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shm_allocate_and_unlink() {
        let name = format!("/vsl_alloc_test_{}", std::process::id());
        let alloc = shm_allocate(&name, 4096).unwrap();
        assert_eq!(alloc.kind, Backing::Shm);
        assert_eq!(alloc.size, 4096);
        assert!(alloc.fd.as_raw_fd() > 2);

        let shm_path = format!("/dev/shm{}", name);
        assert!(std::path::Path::new(&shm_path).exists());
        drop(alloc);
        assert!(
            !std::path::Path::new(&shm_path).exists(),
            "drop should shm_unlink the object"
        );
    }

    #[test]
    fn shm_name_gets_leading_slash() {
        let bare = format!("vsl_alloc_noslash_{}", std::process::id());
        let alloc = shm_allocate(&bare, 1024).unwrap();
        let shm_path = format!("/dev/shm/{}", bare);
        assert!(std::path::Path::new(&shm_path).exists());
        drop(alloc);
    }

    #[test]
    fn allocate_zero_rejected() {
        assert!(matches!(allocate(None, 0), Err(Error::BadArg)));
    }

    #[test]
    fn allocate_falls_back_without_heaps() {
        // Wherever this runs, either a real heap or the shm fallback must
        // produce a mappable fd of the requested size.
        let alloc = allocate(None, 8192).unwrap();
        assert!(matches!(alloc.kind, Backing::DmaHeap | Backing::Shm));

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                alloc.size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                alloc.fd.as_raw_fd(),
                0,
            )
        };
        assert_ne!(ptr, libc::MAP_FAILED);
        unsafe { libc::munmap(ptr, alloc.size) };
    }

    #[test]
    fn explicit_shm_path_honored() {
        let name = format!("/vsl_alloc_explicit_{}", std::process::id());
        let alloc = allocate(Some(&name), 2048).unwrap();
        assert_eq!(alloc.kind, Backing::Shm);
        assert!(alloc.name.is_some());
        drop(alloc);
    }
}
