// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The slow-path engine.
//!
//! One object owns every subsystem (allocators, timers, ARP, routing, the
//! NIC interface, the application interface and the connection tables)
//! and drives them from a single-threaded cooperative poll loop. Nothing
//! in the loop blocks; the bootstrap socket thread inside [`crate::appif`]
//! is the only other thread, and it talks to the loop exclusively through
//! channels.
//!
//! Per iteration: refresh the timestamp once, drain the admin RX ring,
//! feed ARP completions back into connection setup, give the application
//! contexts their request slots, then dispatch due timers.

use crate::appif::{AppIf, AppifError};
use crate::arp::ArpCache;
use crate::config::Config;
use crate::flowalloc::FlowIdAlloc;
use crate::mmio::FpState;
use crate::nicif::{NicError, NicIf};
use crate::packetmem::{PacketMem, PktmemError};
use crate::params::{PKTBUF_SIZE, ZONE_SIZE};
use crate::proto::app::UxResponse;
use crate::proto::ether::{EthHdr, ETH_TYPE_ARP, ETH_TYPE_IP};
use crate::routing::{RoutingError, RoutingTable};
use crate::shm::{DmaRegion, EventFd, ShmError};
use crate::tcp::TcpState;
use crate::timeouts::{Fired, TimeoutKind, TimeoutManager};
use log::{info, warn};
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// What the NIC driver reports about the card (mirrored into the shared
/// info block the applications map).
#[derive(Debug, Clone, Copy)]
pub struct NicInfo {
    /// Size of the DMA region in bytes.
    pub dma_mem_size: u64,
    /// Local MAC address, low 48 bits.
    pub mac_address: u64,
    /// Grace period (us) an application polls before blocking.
    pub poll_cycle_app: u64,
    /// Fastpath cores, reported in the bootstrap welcome.
    pub cores: u32,
}

/// Slow-path counters, printed once per second.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpStats {
    pub drops: u64,
    pub sp_rexmit: u64,
    pub ecn_marked: u64,
    pub acks: u64,
}

/// The borrow bundle handed down into request handling: everything a
/// subsystem may need except the connection tables and the application
/// interface themselves (those two call into each other and are passed
/// separately).
pub struct SpDeps<'a> {
    pub cfg: &'a Config,
    pub now: u32,
    pub nic: &'a mut NicIf,
    pub flows: &'a mut FlowIdAlloc,
    pub pm: &'a mut PacketMem,
    pub arp: &'a mut ArpCache,
    pub routing: &'a RoutingTable,
    pub tmgr: &'a mut TimeoutManager,
    pub stats: &'a mut SpStats,
}

/// Engine construction errors.
#[derive(Debug)]
pub enum EngineError {
    Config(String),
    Routing(RoutingError),
    Pktmem(PktmemError),
    Nic(NicError),
    Appif(AppifError),
    Shm(ShmError),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "configuration: {e}"),
            Self::Routing(e) => write!(f, "routing: {e}"),
            Self::Pktmem(e) => write!(f, "packet memory: {e}"),
            Self::Nic(e) => write!(f, "nic interface: {e}"),
            Self::Appif(e) => write!(f, "application interface: {e}"),
            Self::Shm(e) => write!(f, "shared memory: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<RoutingError> for EngineError {
    fn from(e: RoutingError) -> Self {
        Self::Routing(e)
    }
}
impl From<PktmemError> for EngineError {
    fn from(e: PktmemError) -> Self {
        Self::Pktmem(e)
    }
}
impl From<NicError> for EngineError {
    fn from(e: NicError) -> Self {
        Self::Nic(e)
    }
}
impl From<AppifError> for EngineError {
    fn from(e: AppifError) -> Self {
        Self::Appif(e)
    }
}
impl From<ShmError> for EngineError {
    fn from(e: ShmError) -> Self {
        Self::Shm(e)
    }
}

/// Split an `&mut Engine` into the borrow bundle plus the two parties
/// that consume it.
macro_rules! split_deps {
    ($engine:expr, $now:expr) => {{
        let Engine {
            cfg,
            nicif,
            flows,
            pm,
            arp,
            routing,
            tmgr,
            stats,
            tcp,
            appif,
            ..
        } = $engine;
        (
            SpDeps {
                cfg,
                now: $now,
                nic: nicif,
                flows,
                pm,
                arp,
                routing,
                tmgr,
                stats,
            },
            tcp,
            appif,
        )
    }};
}

/// The slow-path engine.
pub struct Engine {
    cfg: Config,
    dma: Arc<DmaRegion>,
    fp: FpState,
    info: NicInfo,

    pm: PacketMem,
    flows: FlowIdAlloc,
    tmgr: TimeoutManager,
    routing: RoutingTable,
    arp: ArpCache,
    nicif: NicIf,
    appif: AppIf,
    tcp: TcpState,

    stats: SpStats,
    sp_notify: EventFd,
    cur_ts: u32,
    last_print: u32,
    started: Instant,
    shutdown: Arc<AtomicBool>,
    due: Vec<Fired>,
}

impl Engine {
    /// Build every subsystem and publish readiness to the NIC.
    pub fn new(
        cfg: Config,
        dma: Arc<DmaRegion>,
        fp: FpState,
        info: NicInfo,
    ) -> Result<Self, EngineError> {
        cfg.validate().map_err(EngineError::Config)?;

        let zone_size = ZONE_SIZE.min(info.dma_mem_size);
        let mut pm = PacketMem::new(info.dma_mem_size, zone_size)?;
        let flows = FlowIdAlloc::new();
        let mut tmgr = TimeoutManager::new();
        let routing = RoutingTable::new(&cfg)?;
        let sp_notify = EventFd::new()?;

        let nicif = NicIf::new(
            Arc::clone(&dma),
            fp.clone(),
            &mut pm,
            cfg.nic_rx_len,
            cfg.nic_tx_len,
            &cfg.irq_fds_path,
        )?;
        let arp = ArpCache::new(
            &mut tmgr,
            0,
            cfg.ip,
            info.mac_address,
            cfg.arp_to,
            cfg.arp_to_max,
        );
        let tcp = TcpState::new(cfg.ip, info.mac_address, info.mac_address ^ 0x5DEE_CE66_A7E1);
        let appif = AppIf::new(&cfg.socket_path, &sp_notify, info.cores)?;

        // shared memory is laid out; let the firmware come up
        fp.cfg_publish(
            info.mac_address,
            dma.phys(0),
            info.dma_mem_size,
            info.poll_cycle_app,
        );

        if !cfg.quiet {
            info!(
                "[engine] ready: ip {:#010x}/{} mac {:#014x} dma {} MiB",
                cfg.ip,
                cfg.ip_prefix,
                info.mac_address,
                info.dma_mem_size >> 20
            );
        }

        Ok(Self {
            cfg,
            dma,
            fp,
            info,
            pm,
            flows,
            tmgr,
            routing,
            arp,
            nicif,
            appif,
            tcp,
            stats: SpStats::default(),
            sp_notify,
            cur_ts: 0,
            last_print: 0,
            started: Instant::now(),
            shutdown: Arc::new(AtomicBool::new(false)),
            due: Vec::with_capacity(64),
        })
    }

    /// Microsecond timestamp for this process (wrapping).
    fn now_us(&self) -> u32 {
        self.started.elapsed().as_micros() as u32
    }

    /// Flag that stops [`Self::run`] from another thread.
    #[must_use]
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// The shared DMA region.
    #[must_use]
    pub fn dma(&self) -> &Arc<DmaRegion> {
        &self.dma
    }

    /// The NIC register file handle.
    #[must_use]
    pub fn fp(&self) -> FpState {
        self.fp.clone()
    }

    /// Driver info this engine was built with.
    #[must_use]
    pub fn info(&self) -> NicInfo {
        self.info
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> SpStats {
        self.stats
    }

    /// The wakeup eventfd applications kick after posting requests.
    #[must_use]
    pub fn sp_notify(&self) -> &EventFd {
        &self.sp_notify
    }

    /// The application interface (context registry, doorbell pool).
    #[must_use]
    pub fn appif(&self) -> &AppIf {
        &self.appif
    }

    /// Connection tables.
    #[must_use]
    pub fn tcp(&self) -> &TcpState {
        &self.tcp
    }

    /// Admin queue placement, for the firmware side of the rings.
    #[must_use]
    pub fn nic_queues(&self) -> crate::nicif::AdminQueueInfo {
        self.nicif.queue_info()
    }

    /// One cooperative iteration. Returns the number of events handled.
    pub fn poll(&mut self) -> u32 {
        self.cur_ts = self.now_us();
        let mut n = 0;

        n += self.poll_nic();
        n += self.poll_arp_completions();

        let now = self.cur_ts;
        let dma = Arc::clone(&self.dma);
        {
            let (mut deps, tcp, appif) = split_deps!(&mut *self, now);
            n += appif.poll(&mut deps, tcp, &dma);
        }

        // requests are picked up by polling; the counter only needs
        // clearing so an idle iteration can block-free detect new kicks
        if let Err(e) = self.sp_notify.drain() {
            warn!("[engine::poll] draining notify fd failed: {e}");
        }

        self.poll_timeouts();
        n
    }

    /// Run until the shutdown flag flips.
    pub fn run(&mut self) {
        while !self.shutdown.load(Ordering::Acquire) {
            self.poll();

            if self.cur_ts.wrapping_sub(self.last_print) >= 1_000_000 {
                if !self.cfg.quiet {
                    let s = &self.stats;
                    info!(
                        "[engine] stats: drops={} sp_rexmit={} ecn={} acks={}",
                        s.drops, s.sp_rexmit, s.ecn_marked, s.acks
                    );
                }
                self.last_print = self.cur_ts;
            }
        }
        info!("[engine] shut down");
    }

    fn poll_nic(&mut self) -> u32 {
        let now = self.cur_ts;
        let mut pkt = [0u8; PKTBUF_SIZE];
        let mut n = 0;

        for _ in 0..NicIf::rx_batch() {
            let Some(rx) = self.nicif.rx_next(&mut pkt) else {
                break;
            };
            n += 1;
            let frame = &pkt[..rx.len as usize];
            match EthHdr::parse(frame) {
                Ok(eth) if eth.ethertype == ETH_TYPE_ARP => {
                    let Engine {
                        arp, nicif, tmgr, ..
                    } = self;
                    arp.handle_packet(nicif, tmgr, frame);
                }
                Ok(eth) if eth.ethertype == ETH_TYPE_IP => {
                    let (mut deps, tcp, appif) = split_deps!(&mut *self, now);
                    tcp.handle_packet(&mut deps, appif, frame);
                }
                Ok(eth) => {
                    self.stats.drops += 1;
                    warn!("[engine::poll_nic] unhandled ethertype {:#06x}", eth.ethertype);
                }
                Err(e) => {
                    self.stats.drops += 1;
                    warn!("[engine::poll_nic] runt frame: {e}");
                }
            }
        }
        n
    }

    fn poll_arp_completions(&mut self) -> u32 {
        let now = self.cur_ts;
        let mut n = 0;
        loop {
            let Some(comp) = self.arp.take_completion() else {
                break;
            };
            let (mut deps, tcp, appif) = split_deps!(&mut *self, now);
            tcp.arp_completed(&mut deps, appif, &comp);
            n += 1;
        }
        n
    }

    fn poll_timeouts(&mut self) {
        let now = self.cur_ts;
        let mut due = std::mem::take(&mut self.due);
        self.tmgr.poll(now, &mut due);

        for f in &due {
            match f.kind {
                TimeoutKind::ArpRequest => {
                    let Engine {
                        arp, nicif, tmgr, ..
                    } = self;
                    arp.handle_timeout(nicif, tmgr, now, f.opaque as u32);
                }
                TimeoutKind::ArpGratuitous => {
                    let Engine {
                        arp, nicif, tmgr, ..
                    } = self;
                    arp.handle_gratuitous(nicif, tmgr, now);
                }
                TimeoutKind::TcpHandshake | TimeoutKind::TcpRetransmit | TimeoutKind::TcpClosed => {
                    let (mut deps, tcp, appif) = split_deps!(&mut *self, now);
                    tcp.handle_timeout(&mut deps, appif, f.kind, f.opaque);
                }
            }
        }

        due.clear();
        self.due = due;
    }

    /// Register an application context directly, bypassing the bootstrap
    /// socket. Embedders and tests use this; the socket thread funnels
    /// into the same path.
    pub fn register_app_context(
        &mut self,
        app_id: u16,
        rxq_len: u32,
        txq_len: u32,
        evfd: RawFd,
    ) -> UxResponse {
        let now = self.cur_ts;
        let dma = Arc::clone(&self.dma);
        let (mut deps, _tcp, appif) = split_deps!(&mut *self, now);
        appif.register_context(&mut deps, &dma, app_id, rxq_len, txq_len, evfd)
    }
}

#[cfg(test)]
pub(crate) mod harness {
    //! Shared fixture for connection-level tests: a full subsystem set
    //! over anonymous mappings plus a scripted peer playing NIC and
    //! remote host.

    use super::*;
    use crate::proto::ether::{ArpPkt, TcpSeg, ARP_OPER_REPLY, ARP_PKT_LEN, TCP_PKT_LEN, TCP_SYN};
    use crate::proto::nic::{SpTx, SP_DESC_SIZE};
    use crate::shm::{RingLayout, SlotRing};
    use std::collections::VecDeque;

    pub const LOCAL_IP: u32 = 0x0A00_0001;
    pub const LOCAL_MAC: u64 = 0x0A0B_0C0D_0E0F;
    pub const REMOTE_MAC: u64 = 0x1111_2222_3333;

    pub struct TestBench {
        pub cfg: Config,
        pub tcp: TcpState,
        pub appif: AppIf,
        pub nic: NicIf,
        pub flows: FlowIdAlloc,
        pub pm: PacketMem,
        pub arp: ArpCache,
        pub routing: RoutingTable,
        pub tmgr: TimeoutManager,
        pub stats: SpStats,
        pub now: u32,
        pub dma: Arc<DmaRegion>,
        sptx: SlotRing,
        frames: VecDeque<Vec<u8>>,
        controls: Vec<SpTx>,
        _sp_notify: EventFd,
        _irq: tempfile::NamedTempFile,
    }

    impl TestBench {
        pub fn new() -> Self {
            let cfg = Config {
                ip: LOCAL_IP,
                ip_prefix: 24,
                nic_rx_len: 32,
                nic_tx_len: 32,
                tcp_rxbuf_len: 4096,
                tcp_txbuf_len: 4096,
                socket_path: String::new(),
                ..Config::default()
            };
            let dma = Arc::new(DmaRegion::anonymous(1 << 22).unwrap());
            let fp = FpState::anonymous().unwrap();
            let mut pm = PacketMem::new(1 << 22, 1 << 22).unwrap();
            let irq = tempfile::NamedTempFile::new().unwrap();
            let nic = NicIf::new(
                Arc::clone(&dma),
                fp,
                &mut pm,
                cfg.nic_rx_len,
                cfg.nic_tx_len,
                irq.path().to_str().unwrap(),
            )
            .unwrap();
            let info = nic.queue_info();
            let sptx = SlotRing::new(
                Arc::clone(&dma),
                info.tx_desc_off,
                info.tx_len,
                RingLayout::sp_desc(),
            )
            .unwrap();

            let mut tmgr = TimeoutManager::new();
            let arp = ArpCache::new(&mut tmgr, 0, LOCAL_IP, LOCAL_MAC, cfg.arp_to, cfg.arp_to_max);
            let routing = RoutingTable::new(&cfg).unwrap();
            let sp_notify = EventFd::new().unwrap();
            let appif = AppIf::new("", &sp_notify, 1).unwrap();
            let tcp = TcpState::new(LOCAL_IP, LOCAL_MAC, 0x1234_5678_9ABC_DEF0);

            Self {
                cfg,
                tcp,
                appif,
                nic,
                flows: FlowIdAlloc::new(),
                pm,
                arp,
                routing,
                tmgr,
                stats: SpStats::default(),
                now: 0,
                dma,
                sptx,
                frames: VecDeque::new(),
                controls: Vec::new(),
                _sp_notify: sp_notify,
                _irq: irq,
            }
        }

        /// Run `f` with a freshly split borrow bundle.
        pub fn with_deps<R>(
            &mut self,
            f: impl FnOnce(&mut TcpState, &mut SpDeps<'_>) -> R,
        ) -> R {
            let mut deps = SpDeps {
                cfg: &self.cfg,
                now: self.now,
                nic: &mut self.nic,
                flows: &mut self.flows,
                pm: &mut self.pm,
                arp: &mut self.arp,
                routing: &self.routing,
                tmgr: &mut self.tmgr,
                stats: &mut self.stats,
            };
            f(&mut self.tcp, &mut deps)
        }

        fn with_all<R>(
            &mut self,
            f: impl FnOnce(&mut TcpState, &mut AppIf, &mut SpDeps<'_>) -> R,
        ) -> R {
            let mut deps = SpDeps {
                cfg: &self.cfg,
                now: self.now,
                nic: &mut self.nic,
                flows: &mut self.flows,
                pm: &mut self.pm,
                arp: &mut self.arp,
                routing: &self.routing,
                tmgr: &mut self.tmgr,
                stats: &mut self.stats,
            };
            f(&mut self.tcp, &mut self.appif, &mut deps)
        }

        /// Drain the admin TX ring into the frame/control stashes.
        fn pump(&mut self) {
            loop {
                let mut entry = [0u8; SP_DESC_SIZE];
                let Some(tag) = self.sptx.peek(&mut entry) else {
                    break;
                };
                let idx = self.sptx.pos();
                self.sptx.release();
                match SpTx::decode(tag, &entry).expect("malformed sptx entry") {
                    SpTx::Packet { len, .. } => {
                        let info = self.nic.queue_info();
                        let mut frame = vec![0u8; len as usize];
                        self.dma.read(
                            info.tx_buf_off
                                + u64::from(idx) * crate::params::PKTBUF_SIZE as u64,
                            &mut frame,
                        );
                        self.frames.push_back(frame);
                    }
                    other => self.controls.push(other),
                }
            }
        }

        /// Next transmitted frame, oldest first.
        pub fn pop_frame(&mut self) -> Option<Vec<u8>> {
            self.pump();
            self.frames.pop_front()
        }

        /// Drain all frames, returning the last parseable TCP segment.
        pub fn last_tcp_frame(&mut self) -> Option<TcpSeg> {
            self.pump();
            let mut last = None;
            while let Some(f) = self.frames.pop_front() {
                if let Ok(seg) = TcpSeg::parse(&f) {
                    last = Some(seg);
                }
            }
            last
        }

        pub fn drain_frames(&mut self) {
            self.pump();
            self.frames.clear();
        }

        /// All control messages sent so far.
        pub fn control_messages(&mut self) -> Vec<SpTx> {
            self.pump();
            self.controls.clone()
        }

        /// Feed an ARP reply for `ip` into the slow path.
        pub fn arp_reply(&mut self, ip: u32, mac: u64) {
            let mut buf = [0u8; ARP_PKT_LEN];
            let len = ArpPkt {
                oper: ARP_OPER_REPLY,
                sha: mac,
                spa: ip,
                tha: LOCAL_MAC,
                tpa: LOCAL_IP,
            }
            .build(&mut buf, mac);
            let frame = buf[..len].to_vec();
            let TestBench {
                arp, nic, tmgr, ..
            } = self;
            arp.handle_packet(nic, tmgr, &frame);
        }

        /// Feed pending ARP completions into connection setup.
        pub fn drive_arp_completions(&mut self) {
            loop {
                let Some(comp) = self.arp.take_completion() else {
                    break;
                };
                self.with_all(|tcp, appif, deps| tcp.arp_completed(deps, appif, &comp));
            }
        }

        /// Open a connection and resolve its ARP so the SYN is the only
        /// frame left queued.
        pub fn open_conn(&mut self, opaque: u64, remote_ip: u32, remote_port: u16) -> u32 {
            let h = self
                .with_deps(|tcp, deps| tcp.open(deps, 0, 1, opaque, remote_ip, remote_port))
                .expect("open failed");
            if self.tcp.conn(h).expect("just opened").remote_mac == 0 {
                self.drain_frames(); // the ARP request
                self.arp_reply(remote_ip, REMOTE_MAC);
                self.drive_arp_completions();
            }
            h
        }

        /// Inject the remote's answer to a segment we sent.
        pub fn tcp_reply(&mut self, sent: &TcpSeg, flags: u8, seq: u32, ack: u32) {
            let seg = TcpSeg {
                src_mac: REMOTE_MAC,
                src_ip: sent.dest_ip,
                dest_ip: sent.src_ip,
                src_port: sent.dest_port,
                dest_port: sent.src_port,
                seq,
                ack,
                flags,
                window: 0xFFFF,
                payload_len: 0,
            };
            let mut frame = [0u8; TCP_PKT_LEN];
            let len = seg.build(&mut frame, REMOTE_MAC, LOCAL_MAC, 0);
            let frame = frame[..len].to_vec();
            self.with_all(|tcp, appif, deps| tcp.handle_packet(deps, appif, &frame));
        }

        /// Inject a bare SYN from a remote client.
        pub fn send_syn(&mut self, remote_ip: u32, remote_port: u16, local_port: u16, seq: u32) {
            let seg = TcpSeg {
                src_mac: REMOTE_MAC,
                src_ip: remote_ip,
                dest_ip: LOCAL_IP,
                src_port: remote_port,
                dest_port: local_port,
                seq,
                ack: 0,
                flags: TCP_SYN,
                window: 0xFFFF,
                payload_len: 0,
            };
            let mut frame = [0u8; TCP_PKT_LEN];
            let len = seg.build(&mut frame, REMOTE_MAC, LOCAL_MAC, 0);
            let frame = frame[..len].to_vec();
            self.with_all(|tcp, appif, deps| tcp.handle_packet(deps, appif, &frame));
        }

        /// Jump far forward and fire whatever connection timers come due
        /// for `h`.
        pub fn fire_conn_timer(&mut self, h: u32) {
            self.now = self.now.wrapping_add(200_000_000);
            let mut due = Vec::new();
            self.tmgr.poll(self.now, &mut due);
            for f in due {
                match f.kind {
                    TimeoutKind::TcpHandshake
                    | TimeoutKind::TcpRetransmit
                    | TimeoutKind::TcpClosed
                        if f.opaque == u64::from(h) =>
                    {
                        self.with_all(|tcp, appif, deps| {
                            tcp.handle_timeout(deps, appif, f.kind, f.opaque);
                        });
                    }
                    _ => {} // foreign timers are irrelevant to the test
                }
            }
        }
    }
}
