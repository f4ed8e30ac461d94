// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Hash-aware flow-id allocator.
//!
//! The fastpath looks connections up through a fixed CAM-style hash table
//! with a small per-group lookup cache addressed by `flow_id %
//! FLOW_CACHE_SLOTS`. Handing out ids that pile onto the same cache slot of
//! one group degrades lookup latency, so the allocator is not a bare free
//! list: it tracks per-(group, slot) occupancy and prefers ids that land in
//! an empty slot.
//!
//! When no free id maps to an empty slot the allocator still hands out the
//! free-list head and logs the overload; starving a connection of a flow id
//! would be worse than a slower lookup.

use crate::params::{FLOW_CACHE_SLOTS, NUM_FLOW_GROUPS, PL_FLOWST_NUM};
use log::warn;

const NIL: u32 = u32::MAX;

/// Flow-id allocator with per-group cache-slot occupancy tracking.
pub struct FlowIdAlloc {
    /// Free-list link per flow id; `NIL` for allocated ids and the tail.
    next: Vec<u32>,
    head: u32,
    free_count: usize,
    slot_status: Vec<u16>,
}

impl FlowIdAlloc {
    /// Seed the free list with ids `1..PL_FLOWST_NUM` (id 0 is reserved).
    #[must_use]
    pub fn new() -> Self {
        let mut next = vec![NIL; PL_FLOWST_NUM];
        for id in 1..PL_FLOWST_NUM - 1 {
            next[id] = (id + 1) as u32;
        }
        Self {
            next,
            head: 1,
            free_count: PL_FLOWST_NUM - 1,
            slot_status: vec![0; NUM_FLOW_GROUPS * FLOW_CACHE_SLOTS],
        }
    }

    #[inline]
    fn slot_of(flow_id: u32) -> usize {
        flow_id as usize % FLOW_CACHE_SLOTS
    }

    #[inline]
    fn status(&mut self, group: u16, slot: usize) -> &mut u16 {
        &mut self.slot_status[group as usize * FLOW_CACHE_SLOTS + slot]
    }

    /// Free ids remaining.
    #[must_use]
    pub fn available(&self) -> usize {
        self.free_count
    }

    /// Occupancy of one (group, slot) cache entry.
    #[must_use]
    pub fn slot_occupancy(&self, group: u16, slot: usize) -> u16 {
        self.slot_status[group as usize * FLOW_CACHE_SLOTS + slot]
    }

    fn unlink_head(&mut self) -> u32 {
        let id = self.head;
        self.head = self.next[id as usize];
        self.next[id as usize] = NIL;
        id
    }

    /// Allocate a flow id for `flow_group`, preferring one whose cache slot
    /// is still empty in that group. Returns `None` only when the id space
    /// is exhausted.
    pub fn alloc(&mut self, flow_group: u16) -> Option<u32> {
        debug_assert!((flow_group as usize) < NUM_FLOW_GROUPS);
        if self.head == NIL {
            return None;
        }

        // lowest-numbered empty cache slot for this group, if any
        let want = (0..FLOW_CACHE_SLOTS)
            .find(|&s| self.slot_status[flow_group as usize * FLOW_CACHE_SLOTS + s] == 0);

        let id = match want {
            None => {
                // every slot occupied; any id degrades equally
                warn!(
                    "[flowalloc] group {flow_group}: all cache slots occupied, \
                     taking free-list head"
                );
                self.unlink_head()
            }
            Some(slot) => {
                if Self::slot_of(self.head) == slot {
                    self.unlink_head()
                } else {
                    // scan for a free id mapping to the empty slot
                    let mut prev = self.head;
                    let mut cur = self.next[self.head as usize];
                    loop {
                        if cur == NIL {
                            // nothing maps there; fall back to the head
                            warn!(
                                "[flowalloc] group {flow_group}: no free id maps to \
                                 an empty cache slot, taking free-list head"
                            );
                            break self.unlink_head();
                        }
                        if Self::slot_of(cur) == slot {
                            self.next[prev as usize] = self.next[cur as usize];
                            self.next[cur as usize] = NIL;
                            break cur;
                        }
                        prev = cur;
                        cur = self.next[cur as usize];
                    }
                }
            }
        };

        *self.status(flow_group, Self::slot_of(id)) += 1;
        self.free_count -= 1;
        Some(id)
    }

    /// Return a flow id. LIFO reuse, occupancy decremented.
    ///
    /// # Panics
    ///
    /// Panics if the id is out of range, reserved, or its slot counter is
    /// already zero; both mean the caller double-freed and the shared flow
    /// table is no longer trustworthy.
    pub fn free(&mut self, flow_id: u32, flow_group: u16) {
        assert!(flow_id != 0 && (flow_id as usize) < PL_FLOWST_NUM, "bad flow id {flow_id}");
        let slot = Self::slot_of(flow_id);
        let st = self.status(flow_group, slot);
        assert!(*st > 0, "slot occupancy underflow (id {flow_id} group {flow_group})");
        *st -= 1;

        self.next[flow_id as usize] = self.head;
        self.head = flow_id;
        self.free_count += 1;
    }
}

impl Default for FlowIdAlloc {
    fn default() -> Self {
        Self::new()
    }
}

/// 4-tuple hash as the NIC's lookup engine computes it: CRC32-C over the
/// bit-reflected key bytes, result bit-reflected back. Used to spread new
/// connections over the flow groups the same way the hardware will hash
/// them.
#[must_use]
pub fn flow_hash(local_ip: u32, local_port: u16, remote_ip: u32, remote_port: u16) -> u32 {
    let mut key = [0u8; 12];
    key[..4].copy_from_slice(&local_ip.to_le_bytes());
    key[4..8].copy_from_slice(&remote_ip.to_le_bytes());
    key[8..10].copy_from_slice(&local_port.to_le_bytes());
    key[10..12].copy_from_slice(&remote_port.to_le_bytes());
    for b in &mut key {
        *b = b.reverse_bits();
    }
    crc32c(&key).reverse_bits()
}

/// Flow group for a 4-tuple.
#[must_use]
pub fn flow_group_of(local_ip: u32, local_port: u16, remote_ip: u32, remote_port: u16) -> u16 {
    (flow_hash(local_ip, local_port, remote_ip, remote_port) as usize % NUM_FLOW_GROUPS) as u16
}

fn crc32c(data: &[u8]) -> u32 {
    // Castagnoli polynomial, reflected form; table built on first use.
    static TABLE: std::sync::OnceLock<[u32; 256]> = std::sync::OnceLock::new();
    let table = TABLE.get_or_init(|| {
        let mut t = [0u32; 256];
        for (i, e) in t.iter_mut().enumerate() {
            let mut crc = i as u32;
            for _ in 0..8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0x82F6_3B78
                } else {
                    crc >> 1
                };
            }
            *e = crc;
        }
        t
    });

    let mut crc = !0u32;
    for &b in data {
        crc = (crc >> 8) ^ table[((crc ^ u32::from(b)) & 0xFF) as usize];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_zero_reserved() {
        let mut a = FlowIdAlloc::new();
        assert_eq!(a.available(), PL_FLOWST_NUM - 1);
        for _ in 0..PL_FLOWST_NUM - 1 {
            let id = a.alloc(0).expect("ids left");
            assert_ne!(id, 0);
        }
        assert_eq!(a.alloc(0), None);
    }

    #[test]
    fn test_no_double_allocation() {
        let mut a = FlowIdAlloc::new();
        let mut seen = vec![false; PL_FLOWST_NUM];
        for _ in 0..1000 {
            let id = a.alloc(1).unwrap() as usize;
            assert!(!seen[id], "id {id} allocated twice");
            seen[id] = true;
        }
    }

    #[test]
    fn test_occupied_slot_avoided() {
        // Two allocations for the same group land in different cache
        // slots while empty slots remain.
        let mut a = FlowIdAlloc::new();
        let id1 = a.alloc(2).unwrap();
        let id2 = a.alloc(2).unwrap();
        assert_ne!(
            id1 as usize % FLOW_CACHE_SLOTS,
            id2 as usize % FLOW_CACHE_SLOTS
        );
        assert_eq!(a.slot_occupancy(2, id1 as usize % FLOW_CACHE_SLOTS), 1);
        assert_eq!(a.slot_occupancy(2, id2 as usize % FLOW_CACHE_SLOTS), 1);
    }

    #[test]
    fn test_groups_independent() {
        // The same slot may be used once per group without fallback.
        let mut a = FlowIdAlloc::new();
        let id1 = a.alloc(0).unwrap();
        let id2 = a.alloc(1).unwrap();
        // Both prefer the lowest empty slot of their own group.
        assert_eq!(id1 as usize % FLOW_CACHE_SLOTS, 0);
        assert_eq!(id2 as usize % FLOW_CACHE_SLOTS, 0);
        assert_eq!(a.slot_occupancy(0, 0), 1);
        assert_eq!(a.slot_occupancy(1, 0), 1);
    }

    #[test]
    fn test_free_restores_initial_state() {
        let mut a = FlowIdAlloc::new();
        let mut ids = Vec::new();
        for _ in 0..64 {
            ids.push(a.alloc(3).unwrap());
        }
        for &id in &ids {
            a.free(id, 3);
        }
        assert_eq!(a.available(), PL_FLOWST_NUM - 1);
        for &id in &ids {
            assert_eq!(a.slot_occupancy(3, id as usize % FLOW_CACHE_SLOTS), 0);
        }
    }

    #[test]
    #[should_panic(expected = "slot occupancy underflow")]
    fn test_double_free_detected() {
        let mut a = FlowIdAlloc::new();
        let id = a.alloc(0).unwrap();
        a.free(id, 0);
        a.free(id, 0);
    }

    #[test]
    fn test_fallback_when_slots_exhausted() {
        // Allocate until every cache slot of group 0 is occupied, then one
        // more: the allocator must still produce an id (the documented
        // fallback) and its slot count goes above one.
        let mut a = FlowIdAlloc::new();
        for _ in 0..FLOW_CACHE_SLOTS {
            a.alloc(0).unwrap();
        }
        let extra = a.alloc(0).unwrap();
        assert!(a.slot_occupancy(0, extra as usize % FLOW_CACHE_SLOTS) >= 2);
    }

    #[test]
    fn test_flow_hash_stable_and_spread() {
        let h1 = flow_hash(0x0A000001, 80, 0x0A000002, 5555);
        let h2 = flow_hash(0x0A000001, 80, 0x0A000002, 5555);
        assert_eq!(h1, h2);
        assert_ne!(h1, flow_hash(0x0A000001, 80, 0x0A000002, 5556));

        // group mapping must cover all groups over enough tuples
        let mut hit = [false; NUM_FLOW_GROUPS];
        for port in 0..64u16 {
            hit[flow_group_of(0x0A000001, 1000 + port, 0x0A000002, 80) as usize] = true;
        }
        assert!(hit.iter().all(|&h| h));
    }

    #[test]
    fn test_crc32c_known_vector() {
        // RFC 3720 test vector: CRC32-C of 32 zero bytes.
        assert_eq!(crc32c(&[0u8; 32]), 0x8A91_36AA);
    }
}
