// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The application-side library.
//!
//! This is the other end of every ring the slow path and the fastpath
//! expose to applications: a [`Context`] owns one request/response ring
//! pair against the slow path and one `arx`/`atx` pair against the
//! fastpath, bound to one hardware doorbell. Connections and listeners
//! are descriptors in context-local slabs; the `opaque` travelling
//! through the slow path and the NIC is the descriptor's slab handle, so
//! completions and connection updates route straight back without a
//! lookup table.
//!
//! Everything here is poll-driven; the single place an application may
//! block is [`Context::wait`], gated by a grace-period state machine so a
//! busy context never pays for timestamps or syscalls.

mod events;
mod sp;

pub use events::Event;

use crate::engine::NicInfo;
use crate::mmio::FpState;
use crate::proto::app::{SpAppOut, UxResponse, APPOUT_CLOSE_RESET, APPOUT_LISTEN_REUSEPORT, SP_ENTRY_SIZE};
use crate::proto::nic::APP_DESC_SIZE;
use crate::shm::{DmaRegion, EventFd, RingLayout, ShmError, SlotRing};
use crate::tcp::ConnStatus;
use log::warn;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Handle to a connection descriptor.
pub type ConnHandle = u32;

/// Handle to a listener descriptor.
pub type ListenerHandle = u32;

/// Library errors.
#[derive(Debug)]
pub enum AppError {
    /// Bootstrap socket failure.
    Socket(io::Error),
    /// Malformed or unexpected bootstrap data.
    Protocol(&'static str),
    /// The slow path rejected the context request.
    Rejected(u32),
    /// Request ring full; poll and retry.
    RingFull,
    /// Handle does not name a live descriptor (or one in the wrong
    /// state).
    BadHandle,
    /// Not enough buffer space.
    NoSpace,
    /// Shared memory plumbing failed.
    Shm(ShmError),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket(e) => write!(f, "bootstrap socket: {e}"),
            Self::Protocol(what) => write!(f, "bootstrap protocol: {what}"),
            Self::Rejected(status) => write!(f, "context request rejected: status {status}"),
            Self::RingFull => write!(f, "request ring full"),
            Self::BadHandle => write!(f, "invalid descriptor handle"),
            Self::NoSpace => write!(f, "no buffer space"),
            Self::Shm(e) => write!(f, "shared memory: {e}"),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Socket(e) => Some(e),
            Self::Shm(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ShmError> for AppError {
    fn from(e: ShmError) -> Self {
        match e {
            ShmError::RingFull => Self::RingFull,
            other => Self::Shm(other),
        }
    }
}

/// Result type for library operations.
pub type Result<T> = std::result::Result<T, AppError>;

// grace-period state machine bits
const FLAG_POLL_CALLED: u8 = 1 << 0;
const FLAG_POLL_EVENTS: u8 = 1 << 1;
const FLAG_WANTWAIT: u8 = 1 << 2;
const FLAG_LASTWAIT: u8 = 1 << 3;

/// One connection descriptor.
pub(crate) struct AppConn {
    pub status: ConnStatus,
    pub remote_ip: u32,
    pub remote_port: u16,
    pub local_ip: u32,
    pub local_port: u16,
    pub flow_id: u32,
    pub flow_group: u16,
    pub seq_rx: u32,
    pub seq_tx: u32,

    pub rxb_off: u64,
    pub rxb_len: u32,
    /// Write cursor: where the next received byte lands.
    pub rxb_pos: u32,
    /// Received bytes the application has not consumed yet.
    pub rxb_used: u32,
    /// Consumed bytes not yet reported to the NIC.
    pub rxb_bump: u32,

    pub txb_off: u64,
    pub txb_len: u32,
    /// Allocation cursor.
    pub txb_pos: u32,
    /// Free transmit-buffer bytes.
    pub txb_avail: u32,
    /// Newly written bytes not yet reported to the NIC.
    pub txb_bump: u32,

    pub rx_closed: bool,
    pub bump_pending: bool,
    pub bump_seq: u16,
}

/// One listener descriptor.
pub(crate) struct AppListener {
    pub local_port: u16,
}

/// An application context: the mirror image of one slow-path
/// `app_context`.
pub struct Context {
    pub(crate) dma: Arc<DmaRegion>,
    pub(crate) fp: FpState,
    pub(crate) info: NicInfo,
    pub(crate) db_id: u16,

    /// Producer: requests to the slow path.
    pub(crate) spin: SlotRing,
    /// Consumer: events from the slow path.
    pub(crate) spout: SlotRing,
    /// Consumer: `arx` updates from the fastpath.
    pub(crate) rxq: SlotRing,
    /// Producer: `atx` updates to the fastpath.
    pub(crate) txq: SlotRing,
    pub(crate) txq_avail: u32,

    pub(crate) evfd: EventFd,
    pub(crate) sp_evfd: EventFd,

    pub(crate) conns: Vec<Option<AppConn>>,
    conn_free: Vec<u32>,
    pub(crate) listeners: Vec<Option<AppListener>>,
    listener_free: Vec<u32>,
    pub(crate) bump_queue: VecDeque<ConnHandle>,

    flags: u8,
    last_inev: Instant,
}

impl Context {
    /// Assemble a context from negotiated ring placements. [`sp::connect`]
    /// feeds this; tests and embedders may call it directly.
    pub fn from_parts(
        dma: Arc<DmaRegion>,
        fp: FpState,
        info: NicInfo,
        resp: &UxResponse,
        rxq_len: u32,
        txq_len: u32,
        evfd: EventFd,
        sp_evfd: EventFd,
    ) -> Result<Self> {
        let spin = SlotRing::new(
            Arc::clone(&dma),
            resp.app_out_off,
            resp.app_out_len / SP_ENTRY_SIZE as u32,
            RingLayout::sp_app(),
        )?;
        let spout = SlotRing::new(
            Arc::clone(&dma),
            resp.app_in_off,
            resp.app_in_len / SP_ENTRY_SIZE as u32,
            RingLayout::sp_app(),
        )?;
        let rxq = SlotRing::new(
            Arc::clone(&dma),
            resp.rxq_off,
            rxq_len / APP_DESC_SIZE as u32,
            RingLayout::app_desc(),
        )?;
        let txq = SlotRing::new(
            Arc::clone(&dma),
            resp.txq_off,
            txq_len / APP_DESC_SIZE as u32,
            RingLayout::app_desc(),
        )?;
        let txq_avail = txq.len() - 1;

        Ok(Self {
            dma,
            fp,
            info,
            db_id: resp.db_id,
            spin,
            spout,
            rxq,
            txq,
            txq_avail,
            evfd,
            sp_evfd,
            conns: Vec::new(),
            conn_free: Vec::new(),
            listeners: Vec::new(),
            listener_free: Vec::new(),
            bump_queue: VecDeque::new(),
            flags: 0,
            last_inev: Instant::now(),
        })
    }

    /// Bootstrap over the unix socket: welcome, context negotiation, ring
    /// attachment.
    pub fn connect(
        socket_path: &str,
        dma: Arc<DmaRegion>,
        fp: FpState,
        info: NicInfo,
        rxq_len: u32,
        txq_len: u32,
    ) -> Result<Self> {
        sp::connect(socket_path, dma, fp, info, rxq_len, txq_len)
    }

    // --- descriptor slabs ---

    pub(crate) fn conn(&self, h: ConnHandle) -> Option<&AppConn> {
        self.conns.get(h as usize).and_then(Option::as_ref)
    }

    pub(crate) fn conn_mut(&mut self, h: ConnHandle) -> Option<&mut AppConn> {
        self.conns.get_mut(h as usize).and_then(Option::as_mut)
    }

    fn conn_insert(&mut self, c: AppConn) -> ConnHandle {
        if let Some(h) = self.conn_free.pop() {
            self.conns[h as usize] = Some(c);
            h
        } else {
            self.conns.push(Some(c));
            (self.conns.len() - 1) as u32
        }
    }

    /// Drop a closed connection descriptor, recycling the handle.
    pub fn conn_release(&mut self, h: ConnHandle) -> Result<()> {
        match self.conn(h) {
            Some(c) if c.status == ConnStatus::Closed => {
                self.conns[h as usize] = None;
                self.conn_free.push(h);
                Ok(())
            }
            _ => Err(AppError::BadHandle),
        }
    }

    // --- requests ---

    fn post(&mut self, req: &SpAppOut) -> Result<()> {
        let mut entry = [0u8; SP_ENTRY_SIZE];
        let tag = req.encode(&mut entry);
        self.spin.produce(u32::from(tag), &entry)?;
        if let Err(e) = self.sp_evfd.signal() {
            warn!("[app::post] kicking the slow path failed: {e}");
        }
        Ok(())
    }

    /// Request a new connection. Completion arrives as
    /// [`Event::ConnOpened`] for the returned handle.
    pub fn conn_open(&mut self, remote_ip: u32, remote_port: u16) -> Result<ConnHandle> {
        let h = self.conn_insert(AppConn::new(ConnStatus::OpenRequested, remote_ip, remote_port));
        let req = SpAppOut::ConnOpen {
            opaque: u64::from(h),
            remote_ip,
            flags: 0,
            remote_port,
        };
        if let Err(e) = self.post(&req) {
            self.conns[h as usize] = None;
            self.conn_free.push(h);
            return Err(e);
        }
        Ok(h)
    }

    /// Request a close. Completion arrives as [`Event::ConnClosed`].
    pub fn conn_close(&mut self, h: ConnHandle, reset: bool) -> Result<()> {
        let c = self.conn(h).ok_or(AppError::BadHandle)?;
        if c.status != ConnStatus::Open {
            return Err(AppError::BadHandle);
        }
        let req = SpAppOut::ConnClose {
            opaque: u64::from(h),
            remote_ip: c.remote_ip,
            local_ip: c.local_ip,
            remote_port: c.remote_port,
            local_port: c.local_port,
            flags: if reset { APPOUT_CLOSE_RESET } else { 0 },
        };
        self.post(&req)?;
        self.conn_mut(h).expect("checked above").status = ConnStatus::CloseRequested;
        Ok(())
    }

    /// Move a connection's event delivery to another context of the same
    /// application. Completion arrives as [`Event::ConnMoved`].
    pub fn conn_move(&mut self, h: ConnHandle, dst_db: u16) -> Result<()> {
        let c = self.conn(h).ok_or(AppError::BadHandle)?;
        if c.status != ConnStatus::Open {
            return Err(AppError::BadHandle);
        }
        self.post(&SpAppOut::ConnMove {
            opaque: u64::from(h),
            remote_ip: c.remote_ip,
            local_ip: c.local_ip,
            remote_port: c.remote_port,
            local_port: c.local_port,
            db_id: dst_db,
        })
    }

    /// Open a listener. Completion arrives as [`Event::ListenOpened`].
    pub fn listen_open(
        &mut self,
        local_port: u16,
        backlog: u32,
        reuseport: bool,
    ) -> Result<ListenerHandle> {
        let l = AppListener { local_port };
        let h = if let Some(h) = self.listener_free.pop() {
            self.listeners[h as usize] = Some(l);
            h
        } else {
            self.listeners.push(Some(l));
            (self.listeners.len() - 1) as u32
        };
        let req = SpAppOut::ListenOpen {
            opaque: u64::from(h),
            backlog,
            local_port,
            flags: if reuseport { APPOUT_LISTEN_REUSEPORT } else { 0 },
        };
        if let Err(e) = self.post(&req) {
            self.listeners[h as usize] = None;
            self.listener_free.push(h);
            return Err(e);
        }
        Ok(h)
    }

    /// Accept one connection on a listener. Completion arrives as
    /// [`Event::ListenAccepted`] for the returned connection handle.
    pub fn listen_accept(&mut self, lh: ListenerHandle) -> Result<ConnHandle> {
        let port = self
            .listeners
            .get(lh as usize)
            .and_then(Option::as_ref)
            .map(|l| l.local_port)
            .ok_or(AppError::BadHandle)?;
        let h = self.conn_insert(AppConn::new(ConnStatus::AcceptRequested, 0, 0));
        let req = SpAppOut::AcceptConn {
            listen_opaque: u64::from(lh),
            conn_opaque: u64::from(h),
            local_port: port,
        };
        if let Err(e) = self.post(&req) {
            self.conns[h as usize] = None;
            self.conn_free.push(h);
            return Err(e);
        }
        Ok(h)
    }

    // --- buffer management ---

    /// Consume `len` received bytes, crediting the receive window. The
    /// credit reaches the NIC with the next bump flush.
    pub fn conn_rx_done(&mut self, h: ConnHandle, len: u32) -> Result<()> {
        let c = self
            .conns
            .get_mut(h as usize)
            .and_then(Option::as_mut)
            .ok_or(AppError::BadHandle)?;
        if len > c.rxb_used {
            return Err(AppError::NoSpace);
        }
        c.rxb_used -= len;
        c.rxb_bump += len;
        Self::queue_bump(&mut self.bump_queue, h, c);
        Ok(())
    }

    /// Reserve contiguous transmit-buffer space. Returns the DMA-region
    /// offset and the usable length (may be shorter than requested at the
    /// buffer wrap).
    pub fn conn_tx_alloc(&mut self, h: ConnHandle, len: u32) -> Result<(u64, u32)> {
        let c = self.conn_mut(h).ok_or(AppError::BadHandle)?;
        if c.status != ConnStatus::Open {
            return Err(AppError::BadHandle);
        }
        let until_wrap = c.txb_len - c.txb_pos;
        let granted = len.min(c.txb_avail).min(until_wrap);
        if granted == 0 {
            return Err(AppError::NoSpace);
        }
        let off = c.txb_off + u64::from(c.txb_pos);
        c.txb_pos = (c.txb_pos + granted) % c.txb_len;
        c.txb_avail -= granted;
        Ok((off, granted))
    }

    /// Publish `len` bytes written after [`Self::conn_tx_alloc`]. The
    /// bytes reach the NIC with the next bump flush.
    pub fn conn_tx_send(&mut self, h: ConnHandle, len: u32) -> Result<()> {
        let c = self
            .conns
            .get_mut(h as usize)
            .and_then(Option::as_mut)
            .ok_or(AppError::BadHandle)?;
        c.txb_bump += len;
        Self::queue_bump(&mut self.bump_queue, h, c);
        Ok(())
    }

    fn queue_bump(queue: &mut VecDeque<ConnHandle>, h: ConnHandle, c: &mut AppConn) {
        if !c.bump_pending && c.status == ConnStatus::Open {
            c.bump_pending = true;
            queue.push_back(h);
        }
    }

    /// Free receive-buffer bytes the application may still read.
    #[must_use]
    pub fn conn_rx_available(&self, h: ConnHandle) -> u32 {
        self.conn(h).map_or(0, |c| c.rxb_used)
    }

    /// Free transmit-buffer bytes.
    #[must_use]
    pub fn conn_tx_available(&self, h: ConnHandle) -> u32 {
        self.conn(h).map_or(0, |c| c.txb_avail)
    }

    /// The doorbell this context is bound to.
    #[must_use]
    pub fn db_id(&self) -> u16 {
        self.db_id
    }

    // --- wait gating ---

    /// The eventfd to poll for wakeups.
    #[must_use]
    pub fn waitfd(&self) -> &EventFd {
        &self.evfd
    }

    pub(crate) fn note_poll_called(&mut self) {
        self.flags |= FLAG_POLL_CALLED;
    }

    pub(crate) fn note_poll_events(&mut self) {
        self.flags |= FLAG_POLL_EVENTS;
    }

    /// Whether blocking is permitted right now. Requires two full poll
    /// rounds with no events, separated by the configured grace period;
    /// any event resets the machine.
    pub fn canwait(&mut self) -> bool {
        if self.info.poll_cycle_app == u64::MAX {
            return false;
        }
        if self.flags & FLAG_POLL_EVENTS != 0 {
            self.flags &= !(FLAG_POLL_EVENTS | FLAG_WANTWAIT | FLAG_LASTWAIT);
            return false;
        }

        if self.flags & FLAG_WANTWAIT != 0 {
            if self.last_inev.elapsed() >= Duration::from_micros(self.info.poll_cycle_app) {
                // grace period over; require one more clean poll round
                self.flags &= !(FLAG_POLL_CALLED | FLAG_WANTWAIT);
                self.flags |= FLAG_LASTWAIT;
            }
        } else if self.flags & FLAG_LASTWAIT != 0 {
            if self.flags & FLAG_POLL_CALLED != 0 {
                return true;
            }
        } else if self.flags & FLAG_POLL_CALLED != 0 {
            self.last_inev = Instant::now();
            self.flags |= FLAG_WANTWAIT;
        }
        false
    }

    /// Reset the wait gate after a wakeup.
    pub fn waitclear(&mut self) {
        if let Err(e) = self.evfd.drain() {
            warn!("[app::waitclear] draining eventfd failed: {e}");
        }
        self.flags &= !(FLAG_WANTWAIT | FLAG_LASTWAIT | FLAG_POLL_CALLED);
    }

    /// Block until the context is kicked, if the grace-period machine
    /// allows it. Returns `false` when blocking was not permitted.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<bool> {
        if !self.canwait() {
            return Ok(false);
        }
        self.evfd.wait(timeout)?;
        self.waitclear();
        Ok(true)
    }
}

impl AppConn {
    fn new(status: ConnStatus, remote_ip: u32, remote_port: u16) -> Self {
        Self {
            status,
            remote_ip,
            remote_port,
            local_ip: 0,
            local_port: 0,
            flow_id: 0,
            flow_group: 0,
            seq_rx: 0,
            seq_tx: 0,
            rxb_off: 0,
            rxb_len: 0,
            rxb_pos: 0,
            rxb_used: 0,
            rxb_bump: 0,
            txb_off: 0,
            txb_len: 0,
            txb_pos: 0,
            txb_avail: 0,
            txb_bump: 0,
            rx_closed: false,
            bump_pending: false,
            bump_seq: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_info(poll_cycle: u64) -> NicInfo {
        NicInfo {
            dma_mem_size: 1 << 20,
            mac_address: 1,
            poll_cycle_app: poll_cycle,
            cores: 1,
        }
    }

    fn test_context(poll_cycle: u64) -> Context {
        let dma = Arc::new(DmaRegion::anonymous(1 << 20).unwrap());
        let fp = FpState::anonymous().unwrap();
        let resp = UxResponse {
            app_out_off: 0,
            app_in_off: 4096,
            app_out_len: 4096,
            app_in_len: 4096,
            status: 0,
            db_id: 1,
            rxq_off: 8192,
            txq_off: 12288,
        };
        Context::from_parts(
            dma,
            fp,
            dummy_info(poll_cycle),
            &resp,
            4096,
            4096,
            EventFd::new().unwrap(),
            EventFd::new().unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_conn_open_posts_request() {
        let mut ctx = test_context(1000);
        let h = ctx.conn_open(0x0A00_0002, 80).unwrap();
        assert_eq!(ctx.conn(h).unwrap().status, ConnStatus::OpenRequested);

        // the request landed on the spin ring with our handle as opaque
        let mut peer = SlotRing::new(
            Arc::clone(&ctx.dma),
            0,
            4096 / SP_ENTRY_SIZE as u32,
            RingLayout::sp_app(),
        )
        .unwrap();
        let mut entry = [0u8; SP_ENTRY_SIZE];
        let tag = peer.peek(&mut entry).expect("request expected");
        match SpAppOut::decode(tag as u8, &entry).unwrap() {
            SpAppOut::ConnOpen { opaque, remote_ip, remote_port, .. } => {
                assert_eq!(opaque, u64::from(h));
                assert_eq!(remote_ip, 0x0A00_0002);
                assert_eq!(remote_port, 80);
            }
            other => panic!("unexpected request {other:?}"),
        }
        // and the slow path got kicked
        assert_eq!(ctx.sp_evfd.drain().unwrap(), 1);
    }

    #[test]
    fn test_close_requires_open_status() {
        let mut ctx = test_context(1000);
        let h = ctx.conn_open(0x0A00_0002, 80).unwrap();
        assert!(matches!(ctx.conn_close(h, false), Err(AppError::BadHandle)));
    }

    #[test]
    fn test_tx_alloc_window_accounting() {
        let mut ctx = test_context(1000);
        let h = ctx.conn_open(0x0A00_0002, 80).unwrap();
        {
            let c = ctx.conn_mut(h).unwrap();
            c.status = ConnStatus::Open;
            c.txb_off = 0x4000;
            c.txb_len = 1024;
            c.txb_avail = 1024;
        }

        let (off, len) = ctx.conn_tx_alloc(h, 1000).unwrap();
        assert_eq!(off, 0x4000);
        assert_eq!(len, 1000);
        assert_eq!(ctx.conn_tx_available(h), 24);

        // wrap: only 24 contiguous bytes remain
        let (off2, len2) = ctx.conn_tx_alloc(h, 100).unwrap();
        assert_eq!(off2, 0x4000 + 1000);
        assert_eq!(len2, 24);
        assert!(matches!(ctx.conn_tx_alloc(h, 1), Err(AppError::NoSpace)));
    }

    #[test]
    fn test_rx_done_bounds_checked() {
        let mut ctx = test_context(1000);
        let h = ctx.conn_open(0x0A00_0002, 80).unwrap();
        {
            let c = ctx.conn_mut(h).unwrap();
            c.status = ConnStatus::Open;
            c.rxb_used = 100;
        }
        assert!(matches!(ctx.conn_rx_done(h, 200), Err(AppError::NoSpace)));
        ctx.conn_rx_done(h, 60).unwrap();
        assert_eq!(ctx.conn_rx_available(h), 40);
        assert!(ctx.conn(h).unwrap().bump_pending);
    }

    #[test]
    fn test_canwait_grace_period() {
        let mut ctx = test_context(5_000); // 5 ms grace
        assert!(!ctx.canwait()); // no poll yet

        // first clean poll starts the grace period
        ctx.note_poll_called();
        assert!(!ctx.canwait());

        // grace period not yet over
        assert!(!ctx.canwait());

        std::thread::sleep(Duration::from_millis(10));
        assert!(!ctx.canwait()); // moves to last-wait, wants one more poll
        ctx.note_poll_called();
        assert!(ctx.canwait());

        // an event resets everything
        ctx.note_poll_events();
        assert!(!ctx.canwait());
    }

    #[test]
    fn test_canwait_disabled_by_config() {
        let mut ctx = test_context(u64::MAX);
        ctx.note_poll_called();
        std::thread::sleep(Duration::from_millis(1));
        assert!(!ctx.canwait());
    }

    #[test]
    fn test_conn_release_only_when_closed() {
        let mut ctx = test_context(1000);
        let h = ctx.conn_open(0x0A00_0002, 80).unwrap();
        assert!(ctx.conn_release(h).is_err());
        ctx.conn_mut(h).unwrap().status = ConnStatus::Closed;
        ctx.conn_release(h).unwrap();
        // handle is recycled
        let h2 = ctx.conn_open(0x0A00_0003, 81).unwrap();
        assert_eq!(h, h2);
    }
}
