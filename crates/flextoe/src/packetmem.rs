// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! First-fit packet memory allocator.
//!
//! Carves ring buffers and payload buffers out of the DMA region. The
//! region splits into fixed-size zones (one hugepage each); every zone
//! keeps a free list of extents sorted by ascending base address, which
//! makes coalescing on free a pure neighbor check after the insertion
//! search.
//!
//! Extents live in a slab and are linked by index; the handle the caller
//! gets back is the slab index of its extent. No pointers, no intrusive
//! nodes.

use crate::params::PACKETMEM_MAX_ZONES;
use std::fmt;

/// Handle to one allocated extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PktmemHandle(u32);

const NIL: u32 = u32::MAX;

/// Allocator errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PktmemError {
    /// Region size is zero, not zone aligned, or needs too many zones.
    BadRegion { total: u64, zone_size: u64 },
    /// No zone has a fitting extent.
    OutOfMemory { length: u64 },
}

impl fmt::Display for PktmemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadRegion { total, zone_size } => {
                write!(f, "invalid packet memory region: {total} bytes, zone {zone_size}")
            }
            Self::OutOfMemory { length } => {
                write!(f, "packet memory exhausted allocating {length} bytes")
            }
        }
    }
}

impl std::error::Error for PktmemError {}

#[derive(Debug, Clone, Copy)]
struct Extent {
    base: u64,
    len: u64,
    zone: u32,
    next: u32,
}

/// Packet memory allocator over the DMA region.
pub struct PacketMem {
    slab: Vec<Extent>,
    free_slots: Vec<u32>,
    /// Head of the sorted free list per zone.
    zones: Vec<u32>,
    zone_size: u64,
}

impl PacketMem {
    /// Partition `total_bytes` of DMA memory into zones of `zone_size`
    /// bytes, each starting as one free extent.
    pub fn new(total_bytes: u64, zone_size: u64) -> Result<Self, PktmemError> {
        if zone_size == 0 || total_bytes == 0 || total_bytes % zone_size != 0 {
            return Err(PktmemError::BadRegion {
                total: total_bytes,
                zone_size,
            });
        }
        let zone_count = (total_bytes / zone_size) as usize;
        if zone_count > PACKETMEM_MAX_ZONES {
            return Err(PktmemError::BadRegion {
                total: total_bytes,
                zone_size,
            });
        }

        let mut pm = Self {
            slab: Vec::with_capacity(zone_count * 4),
            free_slots: Vec::new(),
            zones: vec![NIL; zone_count],
            zone_size,
        };
        for zone in 0..zone_count as u32 {
            let idx = pm.slab_alloc(Extent {
                base: 0,
                len: zone_size,
                zone,
                next: NIL,
            });
            pm.zones[zone as usize] = idx;
        }
        Ok(pm)
    }

    fn slab_alloc(&mut self, e: Extent) -> u32 {
        if let Some(idx) = self.free_slots.pop() {
            self.slab[idx as usize] = e;
            idx
        } else {
            self.slab.push(e);
            (self.slab.len() - 1) as u32
        }
    }

    fn slab_free(&mut self, idx: u32) {
        self.free_slots.push(idx);
    }

    /// Allocate `length` bytes. Returns the byte offset inside the DMA
    /// region and the handle to free it with.
    pub fn alloc(&mut self, length: u64) -> Result<(u64, PktmemHandle), PktmemError> {
        if length == 0 || length > self.zone_size {
            return Err(PktmemError::OutOfMemory { length });
        }
        for zone in 0..self.zones.len() as u32 {
            if let Some((off, handle)) = self.zone_alloc(zone, length) {
                return Ok((off, handle));
            }
        }
        Err(PktmemError::OutOfMemory { length })
    }

    fn zone_alloc(&mut self, zone: u32, length: u64) -> Option<(u64, PktmemHandle)> {
        // first fit over the address-sorted list
        let mut prev = NIL;
        let mut cur = self.zones[zone as usize];
        while cur != NIL && self.slab[cur as usize].len < length {
            prev = cur;
            cur = self.slab[cur as usize].next;
        }
        if cur == NIL {
            return None;
        }

        let picked = self.slab[cur as usize];
        let idx = if picked.len == length {
            // exact fit: unlink the node and hand it out whole
            if prev == NIL {
                self.zones[zone as usize] = picked.next;
            } else {
                self.slab[prev as usize].next = picked.next;
            }
            cur
        } else {
            // split: low part leaves the list, remainder shrinks in place
            self.slab[cur as usize].base += length;
            self.slab[cur as usize].len -= length;
            self.slab_alloc(Extent {
                base: picked.base,
                len: length,
                zone,
                next: NIL,
            })
        };
        self.slab[idx as usize].next = NIL;
        let off = u64::from(zone) * self.zone_size + self.slab[idx as usize].base;
        Some((off, PktmemHandle(idx)))
    }

    /// Return an extent to its zone's free list, merging with byte-adjacent
    /// neighbors.
    pub fn free(&mut self, handle: PktmemHandle) {
        let idx = handle.0;
        let e = self.slab[idx as usize];
        let zone = e.zone as usize;

        // find the insertion point, keeping the list sorted by base
        let mut prev = NIL;
        let mut cur = self.zones[zone];
        while cur != NIL && self.slab[cur as usize].base < e.base {
            prev = cur;
            cur = self.slab[cur as usize].next;
        }

        self.slab[idx as usize].next = cur;
        if prev == NIL {
            self.zones[zone] = idx;
        } else {
            self.slab[prev as usize].next = idx;
        }

        // merge with predecessor
        let mut merged = idx;
        if prev != NIL {
            let p = self.slab[prev as usize];
            if p.base + p.len == e.base {
                self.slab[prev as usize].len += e.len;
                self.slab[prev as usize].next = self.slab[idx as usize].next;
                self.slab_free(idx);
                merged = prev;
            }
        }

        // merge with successor
        let succ = self.slab[merged as usize].next;
        if succ != NIL {
            let m = self.slab[merged as usize];
            let s = self.slab[succ as usize];
            if m.base + m.len == s.base {
                self.slab[merged as usize].len += s.len;
                self.slab[merged as usize].next = s.next;
                self.slab_free(succ);
            }
        }
    }

    /// Total free bytes across all zones (diagnostics, tests).
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        let mut sum = 0;
        for &head in &self.zones {
            let mut cur = head;
            while cur != NIL {
                sum += self.slab[cur as usize].len;
                cur = self.slab[cur as usize].next;
            }
        }
        sum
    }

    /// Number of free extents in one zone (diagnostics, tests).
    #[must_use]
    pub fn zone_extents(&self, zone: u32) -> usize {
        let mut n = 0;
        let mut cur = self.zones[zone as usize];
        while cur != NIL {
            n += 1;
            cur = self.slab[cur as usize].next;
        }
        n
    }
}
