// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Context polling and event translation.
//!
//! `poll` turns ring entries into [`Event`]s: the slow-path response ring
//! first, then the fastpath `arx` ring, then the housekeeping passes
//! (transmit-slot reclamation and bump flushing).
//!
//! Rings have no total order across each other, so a fastpath
//! `ConnUpdate` can arrive before the slow path confirms the connection it
//! belongs to. Those early bumps are absorbed into the descriptor
//! (`rxb_used`, `rx_closed`) and replayed as injected `ConnReceived` /
//! `ConnRxClosed` events right after the confirmation event, so the
//! application never observes data for a connection it was not yet told
//! about. Injection respects the caller's event budget: when the extras
//! do not fit, the confirmation stays in its slot until the next poll.

use super::{AppError, ConnHandle, Context, ListenerHandle};
use crate::proto::app::{SpAppIn, StatusKind, SP_ENTRY_SIZE};
use crate::proto::nic::{Arx, Atx, APP_DESC_SIZE, ARX_FL_RXDONE};
use crate::tcp::ConnStatus;
use log::{debug, warn};
use std::sync::atomic::{fence, Ordering};

/// Events delivered to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A `conn_open` finished; on success the connection is usable.
    ConnOpened { conn: ConnHandle, status: i32 },
    /// `len` received bytes are readable at DMA offset `off`.
    ConnReceived { conn: ConnHandle, off: u64, len: u32 },
    /// Transmit buffer space became available after being exhausted.
    ConnSendBuf { conn: ConnHandle },
    /// The peer closed its sending side.
    ConnRxClosed { conn: ConnHandle },
    /// A `conn_close` finished.
    ConnClosed { conn: ConnHandle, status: i32 },
    /// A `conn_move` finished.
    ConnMoved { conn: ConnHandle, status: i32 },
    /// A `listen_open` finished.
    ListenOpened { listener: ListenerHandle, status: i32 },
    /// A `listen_close` finished.
    ListenClosed { listener: ListenerHandle, status: i32 },
    /// A new connection is waiting in a listener's backlog.
    ListenNewConn {
        listener: ListenerHandle,
        remote_ip: u32,
        remote_port: u16,
    },
    /// A `listen_accept` finished; on success the connection is usable.
    ListenAccepted { conn: ConnHandle, status: i32 },
}

impl Context {
    /// Drain up to `max` events from both rings into `events`, then run
    /// the housekeeping passes. Returns the number of events appended.
    pub fn poll(&mut self, max: usize, events: &mut Vec<Event>) -> usize {
        self.note_poll_called();
        let before = events.len();
        let budget = before + max;

        let ran_out = self.sp_poll(budget, events);
        if !ran_out {
            self.fastpath_poll(budget, events);
        }

        self.txq_probe();
        self.conns_bump();

        let n = events.len() - before;
        if n > 0 {
            self.note_poll_events();
        }
        n
    }

    /// Slow-path response ring. Returns `true` when the event budget ran
    /// out with an entry still pending.
    fn sp_poll(&mut self, budget: usize, events: &mut Vec<Event>) -> bool {
        let mut entry = [0u8; SP_ENTRY_SIZE];
        while events.len() < budget {
            let Some(tag) = self.spout.peek(&mut entry) else {
                return false;
            };
            let ev = match SpAppIn::decode(tag as u8, &entry) {
                Ok(ev) => ev,
                Err(e) => {
                    warn!("[app::sp_poll] dropping malformed event: {e}");
                    self.spout.release();
                    continue;
                }
            };
            if !self.translate_sp(&ev, budget, events) {
                return true; // deferred, slot stays occupied
            }
            self.spout.release();
        }
        self.spout.has_entry()
    }

    /// Translate one slow-path event. Returns `false` when the injected
    /// extras would not fit and the entry must be retried later.
    fn translate_sp(&mut self, ev: &SpAppIn, budget: usize, events: &mut Vec<Event>) -> bool {
        match *ev {
            SpAppIn::ConnOpened {
                opaque,
                status,
                local_ip,
                local_port,
                ref bufs,
            } => {
                let h = opaque as ConnHandle;
                let Some(c) = self.conn_mut(h) else {
                    warn!("[app::sp_poll] open confirmation for dead descriptor {h}");
                    return true;
                };
                if status != 0 {
                    c.status = ConnStatus::Closed;
                    events.push(Event::ConnOpened { conn: h, status });
                    return true;
                }
                let extra = usize::from(c.rxb_used > 0) + usize::from(c.rx_closed);
                if events.len() + 1 + extra > budget {
                    return false;
                }

                c.status = ConnStatus::Open;
                c.local_ip = local_ip;
                c.local_port = local_port;
                c.seq_rx = bufs.seq_rx.wrapping_add(c.rxb_used);
                c.seq_tx = bufs.seq_tx;
                c.flow_id = bufs.flow_id;
                c.flow_group = bufs.flow_group;
                c.rxb_off = bufs.rx_off;
                c.rxb_len = bufs.rx_len;
                c.txb_off = bufs.tx_off;
                c.txb_len = bufs.tx_len;
                c.txb_avail = bufs.tx_len;

                events.push(Event::ConnOpened { conn: h, status });
                let (used, closed, off) = (c.rxb_used, c.rx_closed, c.rxb_off);
                if used > 0 {
                    // data beat the confirmation; replay it now
                    events.push(Event::ConnReceived {
                        conn: h,
                        off,
                        len: used,
                    });
                }
                if closed {
                    events.push(Event::ConnRxClosed { conn: h });
                }
                true
            }

            SpAppIn::AcceptedConn {
                opaque,
                status,
                local_ip,
                remote_ip,
                remote_port,
                ref bufs,
            } => {
                let h = opaque as ConnHandle;
                let Some(c) = self.conn_mut(h) else {
                    warn!("[app::sp_poll] accept confirmation for dead descriptor {h}");
                    return true;
                };
                if status != 0 {
                    c.status = ConnStatus::Closed;
                    events.push(Event::ListenAccepted { conn: h, status });
                    return true;
                }
                let extra = usize::from(c.rxb_used > 0) + usize::from(c.rx_closed);
                if events.len() + 1 + extra > budget {
                    return false;
                }

                c.status = ConnStatus::Open;
                c.local_ip = local_ip;
                c.remote_ip = remote_ip;
                c.remote_port = remote_port;
                c.seq_rx = bufs.seq_rx.wrapping_add(c.rxb_used);
                c.seq_tx = bufs.seq_tx;
                c.flow_id = bufs.flow_id;
                c.flow_group = bufs.flow_group;
                c.rxb_off = bufs.rx_off;
                c.rxb_len = bufs.rx_len;
                c.txb_off = bufs.tx_off;
                c.txb_len = bufs.tx_len;
                c.txb_avail = bufs.tx_len;

                events.push(Event::ListenAccepted { conn: h, status });
                let (used, closed, off) = (c.rxb_used, c.rx_closed, c.rxb_off);
                if used > 0 {
                    events.push(Event::ConnReceived {
                        conn: h,
                        off,
                        len: used,
                    });
                }
                if closed {
                    events.push(Event::ConnRxClosed { conn: h });
                }
                true
            }

            SpAppIn::ListenNewConn {
                opaque,
                remote_ip,
                remote_port,
            } => {
                events.push(Event::ListenNewConn {
                    listener: opaque as ListenerHandle,
                    remote_ip,
                    remote_port,
                });
                true
            }

            SpAppIn::Status {
                kind,
                opaque,
                status,
            } => {
                match kind {
                    StatusKind::ConnClose => {
                        let h = opaque as ConnHandle;
                        if let Some(c) = self.conn_mut(h) {
                            c.status = ConnStatus::Closed;
                        }
                        events.push(Event::ConnClosed { conn: h, status });
                    }
                    StatusKind::ConnMove => events.push(Event::ConnMoved {
                        conn: opaque as ConnHandle,
                        status,
                    }),
                    StatusKind::ListenOpen => events.push(Event::ListenOpened {
                        listener: opaque as ListenerHandle,
                        status,
                    }),
                    StatusKind::ListenClose => events.push(Event::ListenClosed {
                        listener: opaque as ListenerHandle,
                        status,
                    }),
                }
                true
            }
        }
    }

    /// Fastpath `arx` ring. Returns `true` when the budget ran out.
    fn fastpath_poll(&mut self, budget: usize, events: &mut Vec<Event>) -> bool {
        let mut entry = [0u8; APP_DESC_SIZE];
        let mut consumed = false;
        let mut ran_out = false;

        while events.len() < budget {
            let Some(tag) = self.rxq.peek(&mut entry) else {
                break;
            };
            let update = match Arx::decode(tag, &entry) {
                Ok(u) => u,
                Err(e) => {
                    warn!("[app::fastpath_poll] dropping malformed arx entry: {e}");
                    self.rxq.release();
                    consumed = true;
                    continue;
                }
            };
            if !self.translate_arx(&update, budget, events) {
                ran_out = true;
                break;
            }
            self.rxq.release();
            consumed = true;
        }

        if consumed {
            // entry consumption must be visible before the index moves
            fence(Ordering::Release);
            self.fp.appctx_write_rx_cidx(u32::from(self.db_id), self.rxq.pos());
        }
        ran_out
    }

    fn translate_arx(&mut self, update: &Arx, budget: usize, events: &mut Vec<Event>) -> bool {
        let Arx::ConnUpdate {
            opaque,
            rx_bump,
            tx_bump,
            flags,
        } = *update;
        let h = opaque as ConnHandle;
        let eos = flags & ARX_FL_RXDONE != 0;

        let Some(c) = self.conn_mut(h) else {
            debug!("[app::fastpath_poll] update for dead descriptor {h}");
            return true;
        };

        match c.status {
            ConnStatus::OpenRequested | ConnStatus::AcceptRequested => {
                // rings race: data can beat the confirmation. Buffer it;
                // the confirmation replays it as injected events.
                debug_assert_eq!(tx_bump, 0);
                c.rxb_pos += rx_bump;
                c.rxb_used += rx_bump;
                c.rx_closed |= eos;
                true
            }
            ConnStatus::CloseRequested | ConnStatus::Closed => {
                // bumps for dying connections are dropped
                true
            }
            ConnStatus::Open => {
                let wraps = c.rxb_pos + rx_bump > c.rxb_len;
                let mut needed = 0;
                if rx_bump > 0 {
                    needed += 1 + usize::from(wraps);
                }
                let tx_avail_ev = tx_bump > 0 && c.txb_avail == 0;
                needed += usize::from(tx_avail_ev) + usize::from(eos);
                if events.len() + needed > budget {
                    return false;
                }

                if rx_bump > 0 {
                    let first_off = c.rxb_off + u64::from(c.rxb_pos);
                    if wraps {
                        let first_len = c.rxb_len - c.rxb_pos;
                        events.push(Event::ConnReceived {
                            conn: h,
                            off: first_off,
                            len: first_len,
                        });
                        events.push(Event::ConnReceived {
                            conn: h,
                            off: c.rxb_off,
                            len: rx_bump - first_len,
                        });
                    } else {
                        events.push(Event::ConnReceived {
                            conn: h,
                            off: first_off,
                            len: rx_bump,
                        });
                    }
                    c.seq_rx = c.seq_rx.wrapping_add(rx_bump);
                    c.rxb_pos = (c.rxb_pos + rx_bump) % c.rxb_len;
                    c.rxb_used += rx_bump;
                }

                if tx_bump > 0 {
                    c.txb_avail += tx_bump;
                    if tx_avail_ev {
                        events.push(Event::ConnSendBuf { conn: h });
                    }
                }

                if eos {
                    c.rx_closed = true;
                    events.push(Event::ConnRxClosed { conn: h });
                }
                true
            }
        }
    }

    /// Reclaim `atx` slots the fastpath has consumed.
    fn txq_probe(&mut self) {
        let len = self.txq.len();
        if self.txq_avail > len / 2 {
            return;
        }
        while self.txq_avail < len - 1 && self.txq.free_at(self.txq_avail) {
            self.txq_avail += 1;
        }
    }

    /// Flush pending rx/tx bumps as `atx` updates, one entry per
    /// connection.
    fn conns_bump(&mut self) {
        let mut sent = false;
        while let Some(&h) = self.bump_queue.front() {
            if self.txq_avail == 0 {
                break;
            }
            let Some(c) = self.conn_mut(h) else {
                self.bump_queue.pop_front();
                continue;
            };
            if c.status != ConnStatus::Open {
                c.bump_pending = false;
                self.bump_queue.pop_front();
                continue;
            }

            let update = Atx::ConnUpdate {
                rx_bump: c.rxb_bump,
                tx_bump: c.txb_bump,
                flow_id: c.flow_id,
                flow_group: c.flow_group,
                bump_seq: c.bump_seq,
                flags: 0,
            };
            let mut entry = [0u8; APP_DESC_SIZE];
            let tag = update.encode(&mut entry);
            match self.txq.produce(tag, &entry) {
                Ok(_) => {
                    let c = self.conn_mut(h).expect("still live");
                    c.bump_seq = c.bump_seq.wrapping_add(1);
                    c.rxb_bump = 0;
                    c.txb_bump = 0;
                    c.bump_pending = false;
                    self.bump_queue.pop_front();
                    self.txq_avail -= 1;
                    sent = true;
                }
                Err(_) => {
                    // stale avail count; probe will catch up
                    self.txq_avail = 0;
                    break;
                }
            }
        }
        if sent {
            fence(Ordering::Release);
            self.fp.appctx_write_tx_pidx(u32::from(self.db_id), self.txq.pos());
        }
    }

    /// Pull received bytes out of the DMA region (copying convenience for
    /// tests and simple applications; zero-copy readers use the offsets
    /// from [`Event::ConnReceived`] directly).
    pub fn read_received(&self, off: u64, buf: &mut [u8]) -> Result<(), AppError> {
        if off + buf.len() as u64 > self.dma.len() as u64 {
            return Err(AppError::NoSpace);
        }
        self.dma.read(off, buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NicInfo;
    use crate::mmio::FpState;
    use crate::proto::app::{ConnBuffers, UxResponse};
    use crate::shm::{DmaRegion, EventFd, RingLayout, SlotRing};
    use std::sync::Arc;

    /// Context plus producer-side rings playing slow path and NIC.
    struct Fixture {
        ctx: Context,
        spout_prod: SlotRing,
        rxq_prod: SlotRing,
        atx_cons: SlotRing,
        fp: FpState,
    }

    const RX_OFF: u64 = 0x10000;
    const TX_OFF: u64 = 0x20000;
    const RX_LEN: u32 = 4096;
    const TX_LEN: u32 = 4096;

    fn fixture() -> Fixture {
        let dma = Arc::new(DmaRegion::anonymous(1 << 20).unwrap());
        let fp = FpState::anonymous().unwrap();
        let resp = UxResponse {
            app_out_off: 0,
            app_in_off: 4096,
            app_out_len: 4096,
            app_in_len: 4096,
            status: 0,
            db_id: 2,
            rxq_off: 8192,
            txq_off: 8192 + 1024,
        };
        let info = NicInfo {
            dma_mem_size: 1 << 20,
            mac_address: 1,
            poll_cycle_app: 1000,
            cores: 1,
        };
        let ctx = Context::from_parts(
            Arc::clone(&dma),
            fp.clone(),
            info,
            &resp,
            1024,
            1024,
            EventFd::new().unwrap(),
            EventFd::new().unwrap(),
        )
        .unwrap();
        let spout_prod =
            SlotRing::new(Arc::clone(&dma), 4096, 64, RingLayout::sp_app()).unwrap();
        let rxq_prod =
            SlotRing::new(Arc::clone(&dma), 8192, 32, RingLayout::app_desc()).unwrap();
        let atx_cons =
            SlotRing::new(Arc::clone(&dma), 8192 + 1024, 32, RingLayout::app_desc()).unwrap();
        Fixture {
            ctx,
            spout_prod,
            rxq_prod,
            atx_cons,
            fp,
        }
    }

    fn push_sp(f: &mut Fixture, ev: &SpAppIn) {
        let mut entry = [0u8; SP_ENTRY_SIZE];
        let tag = ev.encode(&mut entry);
        f.spout_prod.produce(u32::from(tag), &entry).unwrap();
    }

    fn push_arx(f: &mut Fixture, update: &Arx) {
        let mut entry = [0u8; APP_DESC_SIZE];
        let tag = update.encode(&mut entry);
        f.rxq_prod.produce(tag, &entry).unwrap();
    }

    fn opened_event(h: u32) -> SpAppIn {
        SpAppIn::ConnOpened {
            opaque: u64::from(h),
            status: 0,
            local_ip: 0x0A00_0001,
            local_port: 9000,
            bufs: ConnBuffers {
                rx_off: RX_OFF,
                tx_off: TX_OFF,
                rx_len: RX_LEN,
                tx_len: TX_LEN,
                seq_rx: 1000,
                seq_tx: 2000,
                flow_id: 5,
                flow_group: 1,
            },
        }
    }

    #[test]
    fn test_conn_opened_event() {
        let mut f = fixture();
        let h = f.ctx.conn_open(0x0A00_0002, 80).unwrap();
        push_sp(&mut f, &opened_event(h));

        let mut events = Vec::new();
        f.ctx.poll(8, &mut events);
        assert_eq!(events, vec![Event::ConnOpened { conn: h, status: 0 }]);

        let c = f.ctx.conn(h).unwrap();
        assert_eq!(c.status, ConnStatus::Open);
        assert_eq!(c.local_port, 9000);
        assert_eq!(c.seq_rx, 1000);
        assert_eq!(c.txb_avail, TX_LEN);
    }

    #[test]
    fn test_early_connupdate_buffered_and_replayed() {
        // A fastpath update beats the open confirmation: the bump is
        // absorbed, then replayed as injected events right after the
        // confirmation.
        let mut f = fixture();
        let h = f.ctx.conn_open(0x0A00_0002, 80).unwrap();

        push_arx(
            &mut f,
            &Arx::ConnUpdate {
                opaque: u64::from(h),
                rx_bump: 500,
                tx_bump: 0,
                flags: 0,
            },
        );

        let mut events = Vec::new();
        f.ctx.poll(8, &mut events);
        assert!(events.is_empty(), "no events before the confirmation");
        assert_eq!(f.ctx.conn(h).unwrap().rxb_used, 500);

        push_sp(&mut f, &opened_event(h));
        f.ctx.poll(8, &mut events);
        assert_eq!(
            events,
            vec![
                Event::ConnOpened { conn: h, status: 0 },
                Event::ConnReceived {
                    conn: h,
                    off: RX_OFF,
                    len: 500
                },
            ]
        );
        // the buffered bump advanced the sequence
        assert_eq!(f.ctx.conn(h).unwrap().seq_rx, 1500);
    }

    #[test]
    fn test_early_eos_injected_after_confirmation() {
        let mut f = fixture();
        let h = f.ctx.conn_open(0x0A00_0002, 80).unwrap();

        push_arx(
            &mut f,
            &Arx::ConnUpdate {
                opaque: u64::from(h),
                rx_bump: 100,
                tx_bump: 0,
                flags: ARX_FL_RXDONE,
            },
        );
        push_sp(&mut f, &opened_event(h));

        let mut events = Vec::new();
        f.ctx.poll(8, &mut events);
        assert_eq!(
            events,
            vec![
                Event::ConnOpened { conn: h, status: 0 },
                Event::ConnReceived {
                    conn: h,
                    off: RX_OFF,
                    len: 100
                },
                Event::ConnRxClosed { conn: h },
            ]
        );
    }

    #[test]
    fn test_injection_respects_budget() {
        // With buffered data, the confirmation needs two event slots; a
        // one-slot poll must defer it entirely and deliver both later.
        let mut f = fixture();
        let h = f.ctx.conn_open(0x0A00_0002, 80).unwrap();

        push_arx(
            &mut f,
            &Arx::ConnUpdate {
                opaque: u64::from(h),
                rx_bump: 500,
                tx_bump: 0,
                flags: 0,
            },
        );
        let mut events = Vec::new();
        f.ctx.poll(8, &mut events);
        push_sp(&mut f, &opened_event(h));

        f.ctx.poll(1, &mut events);
        assert!(events.is_empty(), "confirmation must be deferred whole");
        assert_eq!(f.ctx.conn(h).unwrap().status, ConnStatus::OpenRequested);

        f.ctx.poll(2, &mut events);
        assert_eq!(events.len(), 2);
        assert_eq!(f.ctx.conn(h).unwrap().status, ConnStatus::Open);
    }

    fn open_conn(f: &mut Fixture) -> u32 {
        let h = f.ctx.conn_open(0x0A00_0002, 80).unwrap();
        push_sp(f, &opened_event(h));
        let mut events = Vec::new();
        f.ctx.poll(8, &mut events);
        h
    }

    #[test]
    fn test_rx_wraparound_splits_event() {
        let mut f = fixture();
        let h = open_conn(&mut f);
        // push the write cursor near the end of the 4 KiB buffer
        f.ctx.conn_mut(h).unwrap().rxb_pos = RX_LEN - 100;

        push_arx(
            &mut f,
            &Arx::ConnUpdate {
                opaque: u64::from(h),
                rx_bump: 300,
                tx_bump: 0,
                flags: 0,
            },
        );
        let mut events = Vec::new();
        f.ctx.poll(8, &mut events);
        assert_eq!(
            events,
            vec![
                Event::ConnReceived {
                    conn: h,
                    off: RX_OFF + u64::from(RX_LEN - 100),
                    len: 100
                },
                Event::ConnReceived {
                    conn: h,
                    off: RX_OFF,
                    len: 200
                },
            ]
        );
        assert_eq!(f.ctx.conn(h).unwrap().rxb_pos, 200);
    }

    #[test]
    fn test_sendbuf_event_only_when_exhausted() {
        let mut f = fixture();
        let h = open_conn(&mut f);

        // drain the transmit window completely
        while f.ctx.conn_tx_alloc(h, 4096).is_ok() {}
        assert_eq!(f.ctx.conn_tx_available(h), 0);

        push_arx(
            &mut f,
            &Arx::ConnUpdate {
                opaque: u64::from(h),
                rx_bump: 0,
                tx_bump: 1024,
                flags: 0,
            },
        );
        let mut events = Vec::new();
        f.ctx.poll(8, &mut events);
        assert_eq!(events, vec![Event::ConnSendBuf { conn: h }]);
        assert_eq!(f.ctx.conn_tx_available(h), 1024);

        // more space with room already available: no event
        push_arx(
            &mut f,
            &Arx::ConnUpdate {
                opaque: u64::from(h),
                rx_bump: 0,
                tx_bump: 512,
                flags: 0,
            },
        );
        events.clear();
        f.ctx.poll(8, &mut events);
        assert!(events.is_empty());
        assert_eq!(f.ctx.conn_tx_available(h), 1536);
    }

    #[test]
    fn test_consumed_arx_updates_doorbell() {
        let mut f = fixture();
        let h = open_conn(&mut f);
        for _ in 0..3 {
            push_arx(
                &mut f,
                &Arx::ConnUpdate {
                    opaque: u64::from(h),
                    rx_bump: 10,
                    tx_bump: 0,
                    flags: 0,
                },
            );
        }
        let mut events = Vec::new();
        f.ctx.poll(8, &mut events);
        assert_eq!(events.len(), 3);
        assert_eq!(f.fp.appctx_read_rx_cidx(2), 3);
    }

    #[test]
    fn test_bump_flush_emits_atx() {
        let mut f = fixture();
        let h = open_conn(&mut f);
        f.ctx.conn_mut(h).unwrap().rxb_used = 128;

        f.ctx.conn_rx_done(h, 128).unwrap();
        let (_, granted) = f.ctx.conn_tx_alloc(h, 64).unwrap();
        f.ctx.conn_tx_send(h, granted).unwrap();

        let mut events = Vec::new();
        f.ctx.poll(8, &mut events);

        let mut entry = [0u8; APP_DESC_SIZE];
        let tag = f.atx_cons.peek(&mut entry).expect("atx update expected");
        match Atx::decode(tag, &entry).unwrap() {
            Atx::ConnUpdate {
                rx_bump,
                tx_bump,
                flow_id,
                bump_seq,
                ..
            } => {
                assert_eq!(rx_bump, 128);
                assert_eq!(tx_bump, 64);
                assert_eq!(flow_id, 5);
                assert_eq!(bump_seq, 0);
            }
        }
        f.atx_cons.release();
        assert_eq!(f.fp.appctx_read_tx_pidx(2), 1);

        // flushed state is clean; no second update without new bumps
        events.clear();
        f.ctx.poll(8, &mut events);
        assert!(f.atx_cons.peek(&mut entry).is_none());
    }

    #[test]
    fn test_bumps_dropped_for_closing_conn() {
        let mut f = fixture();
        let h = open_conn(&mut f);
        f.ctx.conn_mut(h).unwrap().rxb_used = 64;
        f.ctx.conn_rx_done(h, 64).unwrap();
        // close before the flush happens
        f.ctx.conn_close(h, false).unwrap();

        let mut events = Vec::new();
        f.ctx.poll(8, &mut events);
        let mut entry = [0u8; APP_DESC_SIZE];
        assert!(f.atx_cons.peek(&mut entry).is_none());
    }
}
