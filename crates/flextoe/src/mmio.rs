// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Typed access to the NIC-mapped register file (`fp_state`).
//!
//! The fastpath exposes its entire pipeline state as one BAR-mapped block:
//! the admin queue registers, one context block per doorbell, per-app
//! context directories, four per-flow register arrays, and a config block
//! the slow path signs once the shared memory is ready.
//!
//! Every access goes through volatile 32/64-bit helpers that byte-swap to
//! the firmware's big-endian layout; nothing in this file hands out an
//! ordinary reference into the region. Publishing writes (context directory
//! append, config signature) are preceded by a release fence so the NIC
//! never observes a directory entry before the registers it points at.
//!
//! # Host-visible layout
//!
//! ```text
//! 0x0000  spctx      admin ring bases/lengths/cursors          (64 B)
//! 0x0040  appctx[32] per-doorbell ring registers               (64 B each)
//! 0x0840  appst[8]   per-app context directory                 (128 B each)
//! 0x0C40  flows_tcp[16384]   TCP window/sequence state         (64 B each)
//! +       flows_conn[16384]  4-tuple + remote MAC              (32 B each)
//! +       flows_mem[16384]   buffer placement + doorbell       (32 B each)
//! +       flows_cc[16384]    congestion counters               (32 B each)
//! +       cfg        signature, MAC, phys base, mem size       (40 B)
//! ```

use crate::params::{PL_APPCTX_NUM, PL_APPST_NUM, PL_FLOWST_NUM};
use crate::shm::DmaRegion;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

const SPCTX_OFF: u64 = 0;
const SPCTX_SIZE: u64 = 64;

const APPCTX_OFF: u64 = SPCTX_OFF + SPCTX_SIZE;
const APPCTX_STRIDE: u64 = 64;

const APPST_OFF: u64 = APPCTX_OFF + APPCTX_STRIDE * PL_APPCTX_NUM as u64;
const APPST_STRIDE: u64 = 128;

const FLOWS_TCP_OFF: u64 = APPST_OFF + APPST_STRIDE * PL_APPST_NUM as u64;
const FLOWS_TCP_STRIDE: u64 = 64;

const FLOWS_CONN_OFF: u64 = FLOWS_TCP_OFF + FLOWS_TCP_STRIDE * PL_FLOWST_NUM as u64;
const FLOWS_CONN_STRIDE: u64 = 32;

const FLOWS_MEM_OFF: u64 = FLOWS_CONN_OFF + FLOWS_CONN_STRIDE * PL_FLOWST_NUM as u64;
const FLOWS_MEM_STRIDE: u64 = 32;

const FLOWS_CC_OFF: u64 = FLOWS_MEM_OFF + FLOWS_MEM_STRIDE * PL_FLOWST_NUM as u64;
const FLOWS_CC_STRIDE: u64 = 32;

const CFG_OFF: u64 = FLOWS_CC_OFF + FLOWS_CC_STRIDE * PL_FLOWST_NUM as u64;
const CFG_SIZE: u64 = 40;

/// Total size of the register file.
pub const FP_STATE_SIZE: usize = (CFG_OFF + CFG_SIZE) as usize;

/// Initial values of one flow's TCP register block.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowTcpInit {
    pub tx_len: u32,
    pub tx_remote_avail: u32,
    pub tx_next_seq: u32,
    pub flags: u16,
    pub rx_len: u32,
    pub rx_next_seq: u32,
}

/// Initial values of one flow's connection identifier block.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowConnInit {
    pub flow_group: u16,
    pub remote_mac: u64,
    pub flags: u16,
    pub local_ip: u32,
    pub remote_ip: u32,
    pub local_port: u16,
    pub remote_port: u16,
}

/// Initial values of one flow's buffer placement block.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowMemInit {
    pub opaque: u64,
    pub db_id: u16,
    pub rx_base: u64,
    pub tx_base: u64,
    pub rx_len: u32,
    pub tx_len: u32,
}

/// Congestion-control counters read back from the NIC.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnStats {
    pub rtt: u32,
    pub txp: u32,
    pub c_drops: u16,
    pub c_acks: u16,
    pub c_ackb: u32,
    pub c_ecnb: u32,
}

/// Handle to the mapped register file. Cloning shares the mapping.
#[derive(Clone)]
pub struct FpState {
    mem: Arc<DmaRegion>,
}

impl FpState {
    /// Wrap an existing mapping (the BAR region, in deployment).
    pub fn from_region(mem: Arc<DmaRegion>) -> crate::shm::Result<Self> {
        if mem.len() < FP_STATE_SIZE {
            return Err(crate::shm::ShmError::InvalidSize(mem.len()));
        }
        Ok(Self { mem })
    }

    /// Process-private register file for tests and simulation.
    pub fn anonymous() -> crate::shm::Result<Self> {
        Ok(Self {
            mem: Arc::new(DmaRegion::anonymous(FP_STATE_SIZE)?),
        })
    }

    #[inline]
    fn read32(&self, off: u64) -> u32 {
        debug_assert_eq!(off % 4, 0);
        // SAFETY: offset within the mapping (layout constants) and
        // 4-aligned; volatile because the NIC writes these concurrently.
        unsafe { u32::from_be(std::ptr::read_volatile(self.mem.at(off).cast::<u32>())) }
    }

    #[inline]
    fn write32(&self, off: u64, v: u32) {
        debug_assert_eq!(off % 4, 0);
        // SAFETY: see read32.
        unsafe { std::ptr::write_volatile(self.mem.at(off).cast::<u32>(), v.to_be()) }
    }

    #[inline]
    fn read64(&self, off: u64) -> u64 {
        debug_assert_eq!(off % 8, 0);
        // SAFETY: see read32; 8-aligned by the layout constants.
        unsafe { u64::from_be(std::ptr::read_volatile(self.mem.at(off).cast::<u64>())) }
    }

    #[inline]
    fn write64(&self, off: u64, v: u64) {
        debug_assert_eq!(off % 8, 0);
        // SAFETY: see read32.
        unsafe { std::ptr::write_volatile(self.mem.at(off).cast::<u64>(), v.to_be()) }
    }

    #[inline]
    fn read16(&self, off: u64) -> u16 {
        debug_assert_eq!(off % 2, 0);
        // SAFETY: see read32; 2-aligned.
        unsafe { u16::from_be(std::ptr::read_volatile(self.mem.at(off).cast::<u16>())) }
    }

    #[inline]
    fn write16(&self, off: u64, v: u16) {
        debug_assert_eq!(off % 2, 0);
        // SAFETY: see read32.
        unsafe { std::ptr::write_volatile(self.mem.at(off).cast::<u16>(), v.to_be()) }
    }

    // --- admin queue registers ---

    /// Program the admin queue block: packet buffer bases, descriptor ring
    /// bases and lengths, cursors reset to zero. Full fence afterwards so
    /// the NIC sees a consistent block before the ready signature.
    #[allow(clippy::too_many_arguments)]
    pub fn spctx_init(
        &self,
        rx_base: u64,
        rx_desc_base: u64,
        rx_len: u32,
        tx_base: u64,
        tx_desc_base: u64,
        tx_len: u32,
    ) {
        self.write64(SPCTX_OFF, rx_base);
        self.write64(SPCTX_OFF + 8, rx_desc_base);
        self.write64(SPCTX_OFF + 16, tx_base);
        self.write64(SPCTX_OFF + 24, tx_desc_base);
        self.write32(SPCTX_OFF + 32, rx_len);
        self.write32(SPCTX_OFF + 36, tx_len);
        self.write64(SPCTX_OFF + 40, 0); // last_ts
        self.write32(SPCTX_OFF + 48, 0); // rx_head
        self.write32(SPCTX_OFF + 52, 0); // rx_tail
        self.write32(SPCTX_OFF + 56, 0); // tx_head
        self.write32(SPCTX_OFF + 60, 0); // tx_tail
        fence(Ordering::SeqCst);
    }

    /// Publish the consumed admin RX head (doorbell to the NIC).
    pub fn spctx_write_rx_head(&self, head: u32) {
        self.write32(SPCTX_OFF + 48, head);
    }

    /// Publish the produced admin TX tail (doorbell to the NIC).
    pub fn spctx_write_tx_tail(&self, tail: u32) {
        self.write32(SPCTX_OFF + 60, tail);
    }

    #[cfg(test)]
    pub(crate) fn spctx_read_tx_tail(&self) -> u32 {
        self.read32(SPCTX_OFF + 60)
    }

    #[cfg(test)]
    pub(crate) fn spctx_read_rx_head(&self) -> u32 {
        self.read32(SPCTX_OFF + 48)
    }

    // --- per-doorbell context registers ---

    fn appctx_base(db: u32) -> u64 {
        assert!((db as usize) < PL_APPCTX_NUM, "doorbell id out of range");
        APPCTX_OFF + APPCTX_STRIDE * u64::from(db)
    }

    /// Program a context's ring registers. Bases are DMA-region offsets,
    /// lengths are entry counts.
    pub fn appctx_init(&self, db: u32, appst_id: u32, rx_off: u32, rx_len: u32, tx_off: u32, tx_len: u32) {
        let base = Self::appctx_base(db);
        self.write32(base + 40, appst_id);
        self.write32(base, rx_off); // rx.base_lo
        self.write32(base + 16, tx_off); // tx.base_lo
        fence(Ordering::Release);
        self.write32(base + 4, rx_len);
        self.write32(base + 8, 0); // rx.p_idx
        self.write32(base + 12, 0); // rx.c_idx
        self.write32(base + 20, tx_len);
        self.write32(base + 24, 0); // tx.p_idx
        self.write32(base + 28, 0); // tx.c_idx
    }

    /// Clear a context block after teardown.
    pub fn appctx_clear(&self, db: u32) {
        let base = Self::appctx_base(db);
        for word in 0..(APPCTX_STRIDE / 4) {
            self.write32(base + word * 4, 0);
        }
    }

    /// Application-side doorbell: consumed `arx` index.
    pub fn appctx_write_rx_cidx(&self, db: u32, c_idx: u32) {
        self.write32(Self::appctx_base(db) + 12, c_idx);
    }

    /// Application-side doorbell: produced `atx` index.
    pub fn appctx_write_tx_pidx(&self, db: u32, p_idx: u32) {
        self.write32(Self::appctx_base(db) + 24, p_idx);
    }

    #[cfg(test)]
    pub(crate) fn appctx_read_rx_cidx(&self, db: u32) -> u32 {
        self.read32(Self::appctx_base(db) + 12)
    }

    #[cfg(test)]
    pub(crate) fn appctx_read_tx_pidx(&self, db: u32) -> u32 {
        self.read32(Self::appctx_base(db) + 24)
    }

    #[cfg(test)]
    pub(crate) fn appctx_read(&self, db: u32) -> (u32, u32, u32, u32, u32) {
        let base = Self::appctx_base(db);
        (
            self.read32(base + 40),
            self.read32(base),
            self.read32(base + 4),
            self.read32(base + 16),
            self.read32(base + 20),
        )
    }

    // --- per-application context directory ---

    fn appst_base(app_id: u16) -> u64 {
        assert!((app_id as usize) < PL_APPST_NUM, "app id out of range");
        APPST_OFF + APPST_STRIDE * u64::from(app_id)
    }

    /// Number of contexts registered for an application.
    pub fn appst_ctx_num(&self, app_id: u16) -> u16 {
        self.read16(Self::appst_base(app_id))
    }

    /// Append a doorbell to an application's context directory. The entry
    /// is published before the count moves, with a fence in between, so
    /// the NIC never indexes an unwritten slot.
    pub fn appst_push_ctx(&self, app_id: u16, db: u16) {
        let base = Self::appst_base(app_id);
        let num = self.read16(base);
        assert!((num as usize) < PL_APPCTX_NUM, "context directory full");
        self.write16(base + 64 + u64::from(num) * 2, db);
        fence(Ordering::Release);
        self.write16(base, num + 1);
    }

    #[cfg(test)]
    pub(crate) fn appst_ctx_id(&self, app_id: u16, idx: u16) -> u16 {
        self.read16(Self::appst_base(app_id) + 64 + u64::from(idx) * 2)
    }

    // --- per-flow register arrays ---

    fn flow_base(array_off: u64, stride: u64, flow_id: u32) -> u64 {
        assert!((flow_id as usize) < PL_FLOWST_NUM, "flow id out of range");
        array_off + stride * u64::from(flow_id)
    }

    /// Initialize the TCP window/sequence block of a flow.
    pub fn flows_tcp_init(&self, flow_id: u32, init: &FlowTcpInit) {
        let b = Self::flow_base(FLOWS_TCP_OFF, FLOWS_TCP_STRIDE, flow_id);
        self.write32(b, init.tx_len);
        self.write32(b + 4, 0); // tx_avail
        self.write32(b + 8, init.tx_remote_avail);
        self.write32(b + 12, 0); // tx_sent
        self.write32(b + 16, init.tx_next_seq);
        self.write32(b + 20, 0); // tx_next_pos
        self.write32(b + 24, 0); // tx_next_ts
        self.write16(b + 28, 0); // dupack_cnt
        self.write16(b + 30, init.flags);
        self.write32(b + 32, init.rx_len);
        self.write32(b + 36, init.rx_len); // rx_avail
        self.write32(b + 40, init.rx_next_seq);
        self.write32(b + 44, 0); // rx_next_pos
        self.write32(b + 48, 0); // rx_ooo_len
        self.write32(b + 52, 0); // rx_ooo_start
    }

    /// Unacknowledged bytes in a flow's TX buffer.
    pub fn flows_tcp_tx_sent(&self, flow_id: u32) -> u32 {
        self.read32(Self::flow_base(FLOWS_TCP_OFF, FLOWS_TCP_STRIDE, flow_id) + 12)
    }

    /// Initialize the connection identifier block of a flow.
    pub fn flows_conn_init(&self, flow_id: u32, init: &FlowConnInit) {
        let b = Self::flow_base(FLOWS_CONN_OFF, FLOWS_CONN_STRIDE, flow_id);
        self.write32(b, u32::from(init.flow_group));
        self.write32(b + 4, (init.remote_mac & 0xFFFF_FFFF) as u32);
        self.write16(b + 8, init.flags);
        self.write16(b + 10, ((init.remote_mac >> 32) & 0xFFFF) as u16);
        self.write32(b + 12, init.local_ip);
        self.write32(b + 16, init.remote_ip);
        self.write16(b + 20, init.remote_port);
        self.write16(b + 22, init.local_port);
    }

    /// Initialize the buffer placement block of a flow.
    pub fn flows_mem_init(&self, flow_id: u32, init: &FlowMemInit) {
        let b = Self::flow_base(FLOWS_MEM_OFF, FLOWS_MEM_STRIDE, flow_id);
        self.write16(b, ((init.opaque >> 32) & 0xFFFF) as u16); // opaque_hi
        self.write16(b + 2, init.db_id);
        self.write32(b + 4, (init.opaque & 0xFFFF_FFFF) as u32); // opaque_lo
        self.write64(b + 8, init.rx_base);
        self.write64(b + 16, init.tx_base);
        self.write32(b + 24, init.rx_len);
        self.write32(b + 28, init.tx_len);
    }

    /// Rebind a flow to a different doorbell (connection move).
    pub fn flows_mem_write_db(&self, flow_id: u32, db_id: u16) {
        self.write16(Self::flow_base(FLOWS_MEM_OFF, FLOWS_MEM_STRIDE, flow_id) + 2, db_id);
    }

    #[cfg(test)]
    pub(crate) fn flows_mem_read_db(&self, flow_id: u32) -> u16 {
        self.read16(Self::flow_base(FLOWS_MEM_OFF, FLOWS_MEM_STRIDE, flow_id) + 2)
    }

    /// Initialize the congestion block of a flow.
    pub fn flows_cc_init(&self, flow_id: u32, rtt_init: u32) {
        let b = Self::flow_base(FLOWS_CC_OFF, FLOWS_CC_STRIDE, flow_id);
        self.write32(b, 0); // tx_avail
        self.write32(b + 4, 0); // tx_rate
        self.write32(b + 8, rtt_init);
        self.write32(b + 12, 0); // txp
        self.write32(b + 16, 0); // cnt_tx_drops
        self.write32(b + 20, 0); // cnt_rx_acks
        self.write32(b + 24, 0); // cnt_rx_ack_bytes
        self.write32(b + 28, 0); // cnt_rx_ecn_bytes
    }

    /// Program a flow's rate limiter (ME clock cycles, see
    /// `nicif::rate_to_cycles`).
    pub fn flows_cc_write_rate(&self, flow_id: u32, cycles: u32) {
        self.write32(Self::flow_base(FLOWS_CC_OFF, FLOWS_CC_STRIDE, flow_id) + 4, cycles);
    }

    #[cfg(test)]
    pub(crate) fn flows_cc_read_rate(&self, flow_id: u32) -> u32 {
        self.read32(Self::flow_base(FLOWS_CC_OFF, FLOWS_CC_STRIDE, flow_id) + 4)
    }

    /// Read a flow's congestion counters.
    pub fn flows_cc_stats(&self, flow_id: u32) -> ConnStats {
        let b = Self::flow_base(FLOWS_CC_OFF, FLOWS_CC_STRIDE, flow_id);
        ConnStats {
            rtt: self.read32(b + 8),
            txp: self.read32(b + 12),
            c_drops: self.read32(b + 16) as u16,
            c_acks: self.read32(b + 20) as u16,
            c_ackb: self.read32(b + 24),
            c_ecnb: self.read32(b + 28),
        }
    }

    // --- config block ---

    /// Publish readiness: physical base and size of the DMA region, then
    /// the signature. The fence keeps the signature last.
    pub fn cfg_publish(&self, local_mac: u64, phyaddr: u64, memsize: u64, poll_cycle_app: u64) {
        self.write64(CFG_OFF + 8, local_mac);
        self.write64(CFG_OFF + 16, phyaddr);
        self.write64(CFG_OFF + 24, memsize);
        self.write64(CFG_OFF + 32, poll_cycle_app);
        fence(Ordering::Release);
        self.write64(CFG_OFF, 1); // sig
    }

    /// Whether the slow path has signed the config block.
    pub fn cfg_ready(&self) -> bool {
        self.read64(CFG_OFF) == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_fits() {
        // The last flow of every array must stay inside the region.
        let fp = FpState::anonymous().expect("mapping failed");
        let last = (PL_FLOWST_NUM - 1) as u32;
        fp.flows_cc_init(last, 42);
        assert_eq!(fp.flows_cc_stats(last).rtt, 42);
    }

    #[test]
    fn test_values_stored_big_endian() {
        let fp = FpState::anonymous().expect("mapping failed");
        fp.spctx_write_tx_tail(0x0102_0304);
        // First byte in memory is the most significant one.
        let mut b = [0u8; 4];
        fp.mem.read(60, &mut b);
        assert_eq!(b, [1, 2, 3, 4]);
        assert_eq!(fp.spctx_read_tx_tail(), 0x0102_0304);
    }

    #[test]
    fn test_appctx_roundtrip() {
        let fp = FpState::anonymous().expect("mapping failed");
        fp.appctx_init(5, 2, 0x1000, 64, 0x2000, 32);
        let (appst_id, rx_off, rx_len, tx_off, tx_len) = fp.appctx_read(5);
        assert_eq!(appst_id, 2);
        assert_eq!(rx_off, 0x1000);
        assert_eq!(rx_len, 64);
        assert_eq!(tx_off, 0x2000);
        assert_eq!(tx_len, 32);

        fp.appctx_clear(5);
        assert_eq!(fp.appctx_read(5), (0, 0, 0, 0, 0));
    }

    #[test]
    fn test_appst_directory_append() {
        let fp = FpState::anonymous().expect("mapping failed");
        assert_eq!(fp.appst_ctx_num(3), 0);
        fp.appst_push_ctx(3, 17);
        fp.appst_push_ctx(3, 23);
        assert_eq!(fp.appst_ctx_num(3), 2);
        assert_eq!(fp.appst_ctx_id(3, 0), 17);
        assert_eq!(fp.appst_ctx_id(3, 1), 23);
    }

    #[test]
    fn test_flow_blocks_independent() {
        let fp = FpState::anonymous().expect("mapping failed");
        fp.flows_mem_init(
            7,
            &FlowMemInit {
                opaque: 0xAAAA_BBBB_CCCC,
                db_id: 9,
                rx_base: 0x10_0000,
                tx_base: 0x20_0000,
                rx_len: 4096,
                tx_len: 4096,
            },
        );
        fp.flows_mem_init(8, &FlowMemInit::default());
        assert_eq!(fp.flows_mem_read_db(7), 9);
        assert_eq!(fp.flows_mem_read_db(8), 0);

        fp.flows_mem_write_db(7, 11);
        assert_eq!(fp.flows_mem_read_db(7), 11);
    }

    #[test]
    fn test_cfg_signature_last() {
        let fp = FpState::anonymous().expect("mapping failed");
        assert!(!fp.cfg_ready());
        fp.cfg_publish(0x0A0B_0C0D_0E0F, 0xDEAD_0000, 1 << 30, 10_000);
        assert!(fp.cfg_ready());
    }
}
