// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The DMA-visible memory region.
//!
//! Ring structures and payload buffers are always referred to by byte
//! offset from the region base, never by raw pointer: the slow path, the
//! applications and the NIC all map the same physical memory at different
//! addresses. Offsets are what travels over the bootstrap socket and into
//! the NIC registers.

use super::{Result, ShmError};
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU8};

/// A mapped, DMA-visible memory region addressed by byte offsets.
///
/// Deployment maps hugepages; tests use a process-private anonymous
/// mapping, which has identical semantics minus the physical contiguity.
pub struct DmaRegion {
    ptr: *mut u8,
    len: usize,
    /// Physical address of offset 0, as the NIC sees it. Zero for
    /// anonymous mappings.
    phys_base: u64,
}

// SAFETY: the region is plain shared memory; every cross-thread access
// goes through the atomic tag accessors or stays behind the ring
// ownership protocol.
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

impl DmaRegion {
    /// Map an anonymous region of `len` bytes, zero-filled.
    pub fn anonymous(len: usize) -> Result<Self> {
        Self::map(len, libc::MAP_SHARED | libc::MAP_ANONYMOUS, 0)
    }

    /// Map a hugepage-backed region of `len` bytes with physical base
    /// `phys_base` (as reported by the driver).
    pub fn hugepages(len: usize, phys_base: u64) -> Result<Self> {
        Self::map(
            len,
            libc::MAP_SHARED | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB,
            phys_base,
        )
    }

    fn map(len: usize, flags: libc::c_int, phys_base: u64) -> Result<Self> {
        if len == 0 {
            return Err(ShmError::InvalidSize(len));
        }
        // SAFETY: null hint lets the kernel pick the address; flags and
        // protection are valid; an anonymous mapping takes fd -1/offset 0.
        // MAP_FAILED is checked below.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(ShmError::Mmap(io::Error::last_os_error()));
        }
        Ok(Self {
            ptr: ptr.cast::<u8>(),
            len,
            phys_base,
        })
    }

    /// Region length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Physical address of a region offset (what gets programmed into NIC
    /// base registers).
    #[must_use]
    pub fn phys(&self, off: u64) -> u64 {
        debug_assert!(off <= self.len as u64);
        self.phys_base + off
    }

    /// Raw pointer to an offset. The caller owns the aliasing story: the
    /// ring protocol (or exclusive buffer ownership handed out by the
    /// packet-memory allocator) is what makes dereferencing sound.
    #[must_use]
    pub fn at(&self, off: u64) -> *mut u8 {
        debug_assert!(off <= self.len as u64);
        // SAFETY: offset is within the mapping (checked in debug; all
        // callers derive offsets from allocator/ring bounds).
        unsafe { self.ptr.add(off as usize) }
    }

    /// Copy bytes out of the region.
    pub fn read(&self, off: u64, buf: &mut [u8]) {
        assert!(off as usize + buf.len() <= self.len);
        // SAFETY: range checked above; source and destination cannot
        // overlap (destination is a Rust-owned buffer).
        unsafe {
            ptr::copy_nonoverlapping(self.at(off), buf.as_mut_ptr(), buf.len());
        }
    }

    /// Copy bytes into the region.
    pub fn write(&self, off: u64, buf: &[u8]) {
        assert!(off as usize + buf.len() <= self.len);
        // SAFETY: range checked above; regions cannot overlap.
        unsafe {
            ptr::copy_nonoverlapping(buf.as_ptr(), self.at(off), buf.len());
        }
    }

    /// Zero a byte range.
    pub fn zero(&self, off: u64, len: u64) {
        assert!(off + len <= self.len as u64);
        // SAFETY: range checked above.
        unsafe {
            ptr::write_bytes(self.at(off), 0, len as usize);
        }
    }

    /// Atomic view of one byte (ring tags).
    #[must_use]
    pub(crate) fn atomic_u8(&self, off: u64) -> &AtomicU8 {
        assert!(off < self.len as u64);
        // SAFETY: in range, u8 has no alignment requirement, and AtomicU8
        // is layout-compatible with u8.
        unsafe { &*self.at(off).cast::<AtomicU8>() }
    }

    /// Atomic view of one 32-bit word (ring tags, must be 4-aligned).
    #[must_use]
    pub(crate) fn atomic_u32(&self, off: u64) -> &AtomicU32 {
        assert!(off + 4 <= self.len as u64);
        assert_eq!(off % 4, 0);
        // SAFETY: in range and aligned; AtomicU32 is layout-compatible
        // with u32.
        unsafe { &*self.at(off).cast::<AtomicU32>() }
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are unmapped
        // exactly once.
        unsafe {
            libc::munmap(self.ptr.cast(), self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_anonymous_region_zeroed() {
        let r = DmaRegion::anonymous(4096).expect("mmap failed");
        let mut buf = [0xFFu8; 64];
        r.read(128, &mut buf);
        assert_eq!(buf, [0u8; 64]);
    }

    #[test]
    fn test_read_write_roundtrip() {
        let r = DmaRegion::anonymous(4096).expect("mmap failed");
        let data = [1u8, 2, 3, 4, 5];
        r.write(1000, &data);
        let mut out = [0u8; 5];
        r.read(1000, &mut out);
        assert_eq!(out, data);
    }

    #[test]
    fn test_phys_offsets() {
        let r = DmaRegion::anonymous(4096).expect("mmap failed");
        assert_eq!(r.phys(0), 0);
        assert_eq!(r.phys(256), 256);
    }

    #[test]
    fn test_zero_range() {
        let r = DmaRegion::anonymous(4096).expect("mmap failed");
        r.write(0, &[0xAA; 32]);
        r.zero(0, 16);
        let mut out = [0u8; 32];
        r.read(0, &mut out);
        assert_eq!(&out[..16], &[0u8; 16]);
        assert_eq!(&out[16..], &[0xAAu8; 16]);
    }

    #[test]
    fn test_atomic_tag_access() {
        let r = DmaRegion::anonymous(4096).expect("mmap failed");
        r.atomic_u32(64).store(7, Ordering::Release);
        assert_eq!(r.atomic_u32(64).load(Ordering::Acquire), 7);
        r.atomic_u8(63).store(3, Ordering::Release);
        assert_eq!(r.atomic_u8(63).load(Ordering::Acquire), 3);
    }

    #[test]
    fn test_rejects_empty() {
        assert!(DmaRegion::anonymous(0).is_err());
    }
}
