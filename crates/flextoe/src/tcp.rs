// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection management.
//!
//! The slow path owns connection setup and teardown; the fastpath owns the
//! stream. A connection here walks
//! `OpenRequested`/`AcceptRequested -> Open -> CloseRequested -> Closed`:
//! the handshake frames (SYN, SYN-ACK, final ACK) travel over the admin
//! packet path, and only a completed handshake installs the flow in the
//! NIC's hash table and registers. From `Open` on, the only slow-path
//! involvement is the periodic retransmission check and the close
//! sequence.
//!
//! Connections and listeners live in slabs; handles (slab indices) are
//! what ARP waiters, timers and the demux table carry. The application's
//! own identifier for a connection is the `opaque` it sent in the request,
//! echoed in every completion.

use crate::appif::{AppIf, ConnHandoff};
use crate::engine::SpDeps;
use crate::flowalloc::flow_group_of;
use crate::nicif::ConnectionParams;
use crate::packetmem::PktmemHandle;
use crate::proto::app::ConnBuffers;
use crate::proto::ether::{TcpSeg, TCP_ACK, TCP_PKT_LEN, TCP_RST, TCP_SYN};
use crate::timeouts::{TimeoutKind, TimerId};
use log::{debug, warn};
use std::collections::{HashMap, VecDeque};

/// Handle to a connection slab entry.
pub type ConnHandle = u32;

/// Handle to a listener slab entry.
pub type ListenerHandle = u32;

/// First port the ephemeral allocator hands out.
const EPHEMERAL_BASE: u16 = 8192;

/// Connection lifecycle, as visible to the slow path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    /// Active open sent or pending ARP; waiting for the SYN-ACK.
    OpenRequested,
    /// SYN-ACK sent for an accepted connection; waiting for the ACK.
    AcceptRequested,
    /// Handshake done, flow installed, fastpath active.
    Open,
    /// Close sent to the NIC; flow teardown timer running.
    CloseRequested,
    /// Fully torn down (transient; the slab entry goes away with it).
    Closed,
}

/// One connection.
pub struct Connection {
    pub app_id: u16,
    pub db_id: u16,
    pub opaque: u64,
    pub status: ConnStatus,
    pub local_ip: u32,
    pub remote_ip: u32,
    pub local_port: u16,
    pub remote_port: u16,
    pub remote_mac: u64,
    pub flow_id: u32,
    pub flow_group: u16,
    pub local_seq: u32,
    pub remote_seq: u32,
    rx_off: u64,
    rx_len: u32,
    tx_off: u64,
    tx_len: u32,
    rx_handle: PktmemHandle,
    tx_handle: PktmemHandle,
    timer: Option<TimerId>,
    attempts: u32,
}

struct PendingConn {
    remote_ip: u32,
    remote_port: u16,
    remote_seq: u32,
    remote_mac: u64,
}

struct Listener {
    app_id: u16,
    db_id: u16,
    opaque: u64,
    port: u16,
    backlog_max: u32,
    backlog: VecDeque<PendingConn>,
    /// Parked accept requests: (conn opaque, requesting context).
    accepts: VecDeque<(u64, u16)>,
    reuseport: bool,
}

#[derive(Default)]
struct PortListeners {
    handles: Vec<ListenerHandle>,
    next: usize,
}

/// Connection and listener tables.
pub struct TcpState {
    local_ip: u32,
    local_mac: u64,

    conns: Vec<Option<Connection>>,
    conn_free: Vec<u32>,
    listeners: Vec<Option<Listener>>,
    listener_free: Vec<u32>,

    /// (local ip, local port, remote ip, remote port) -> connection.
    demux: HashMap<(u32, u16, u32, u16), ConnHandle>,
    listen_ports: HashMap<u16, PortListeners>,
    /// Reference-counted local ports (connections and listeners).
    ports_in_use: HashMap<u16, u32>,
    ephemeral_next: u16,
    prng: u64,
}

impl TcpState {
    #[must_use]
    pub fn new(local_ip: u32, local_mac: u64, seed: u64) -> Self {
        Self {
            local_ip,
            local_mac,
            conns: Vec::new(),
            conn_free: Vec::new(),
            listeners: Vec::new(),
            listener_free: Vec::new(),
            demux: HashMap::new(),
            listen_ports: HashMap::new(),
            ports_in_use: HashMap::new(),
            ephemeral_next: EPHEMERAL_BASE,
            prng: seed | 1,
        }
    }

    fn isn(&mut self) -> u32 {
        // xorshift64; deterministic under a fixed seed
        let mut x = self.prng;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.prng = x;
        x as u32
    }

    // --- slabs ---

    pub(crate) fn conn(&self, h: ConnHandle) -> Option<&Connection> {
        self.conns.get(h as usize).and_then(Option::as_ref)
    }

    fn conn_mut(&mut self, h: ConnHandle) -> Option<&mut Connection> {
        self.conns.get_mut(h as usize).and_then(Option::as_mut)
    }

    fn conn_insert(&mut self, c: Connection) -> ConnHandle {
        if let Some(h) = self.conn_free.pop() {
            self.conns[h as usize] = Some(c);
            h
        } else {
            self.conns.push(Some(c));
            (self.conns.len() - 1) as u32
        }
    }

    fn conn_remove(&mut self, h: ConnHandle) -> Option<Connection> {
        let c = self.conns.get_mut(h as usize)?.take()?;
        self.conn_free.push(h);
        Some(c)
    }

    fn listener(&self, h: ListenerHandle) -> Option<&Listener> {
        self.listeners.get(h as usize).and_then(Option::as_ref)
    }

    fn listener_mut(&mut self, h: ListenerHandle) -> Option<&mut Listener> {
        self.listeners.get_mut(h as usize).and_then(Option::as_mut)
    }

    // --- ports ---

    fn port_acquire(&mut self, port: u16) {
        *self.ports_in_use.entry(port).or_insert(0) += 1;
    }

    fn port_release(&mut self, port: u16) {
        match self.ports_in_use.get_mut(&port) {
            Some(n) if *n > 1 => *n -= 1,
            Some(_) => {
                self.ports_in_use.remove(&port);
            }
            None => warn!("[tcp] releasing unused port {port}"),
        }
    }

    fn alloc_ephemeral_port(&mut self) -> Option<u16> {
        let span = u16::MAX - EPHEMERAL_BASE;
        for _ in 0..=span {
            let p = self.ephemeral_next;
            self.ephemeral_next = if p == u16::MAX {
                EPHEMERAL_BASE
            } else {
                p + 1
            };
            if !self.ports_in_use.contains_key(&p) {
                self.port_acquire(p);
                return Some(p);
            }
        }
        None
    }

    // --- lookup ---

    /// Find an application's connection by 4-tuple and opaque.
    #[must_use]
    pub fn find_conn(
        &self,
        app_id: u16,
        local_ip: u32,
        local_port: u16,
        remote_ip: u32,
        remote_port: u16,
        opaque: u64,
    ) -> Option<ConnHandle> {
        let &h = self
            .demux
            .get(&(local_ip, local_port, remote_ip, remote_port))?;
        let c = self.conn(h)?;
        (c.app_id == app_id && c.opaque == opaque).then_some(h)
    }

    /// All connections owned by one application (teardown path).
    #[must_use]
    pub fn conns_of_app(&self, app_id: u16) -> Vec<ConnHandle> {
        self.conns
            .iter()
            .enumerate()
            .filter_map(|(i, c)| {
                c.as_ref()
                    .filter(|c| c.app_id == app_id)
                    .map(|_| i as u32)
            })
            .collect()
    }

    /// Number of live connections (diagnostics, tests).
    #[must_use]
    pub fn conn_count(&self) -> usize {
        self.conns.iter().flatten().count()
    }

    fn handoff(&self, h: ConnHandle) -> ConnHandoff {
        let c = self.conn(h).expect("handoff for dead connection");
        ConnHandoff {
            opaque: c.opaque,
            local_ip: c.local_ip,
            local_port: c.local_port,
            remote_ip: c.remote_ip,
            remote_port: c.remote_port,
            bufs: ConnBuffers {
                rx_off: c.rx_off,
                tx_off: c.tx_off,
                rx_len: c.rx_len,
                tx_len: c.tx_len,
                seq_rx: c.remote_seq,
                seq_tx: c.local_seq,
                flow_id: c.flow_id,
                flow_group: c.flow_group,
            },
        }
    }

    // --- open path ---

    /// Active open. The reply (success or handshake failure) arrives
    /// asynchronously through `AppIf::conn_opened`; only setup errors are
    /// reported here.
    pub fn open(
        &mut self,
        deps: &mut SpDeps<'_>,
        app_id: u16,
        db_id: u16,
        opaque: u64,
        remote_ip: u32,
        remote_port: u16,
    ) -> Result<ConnHandle, i32> {
        let Some(local_port) = self.alloc_ephemeral_port() else {
            warn!("[tcp::open] out of ephemeral ports");
            return Err(-1);
        };

        let rx_len = deps.cfg.tcp_rxbuf_len;
        let tx_len = deps.cfg.tcp_txbuf_len;
        let bufs = deps
            .pm
            .alloc(u64::from(rx_len))
            .and_then(|rx| match deps.pm.alloc(u64::from(tx_len)) {
                Ok(tx) => Ok((rx, tx)),
                Err(e) => {
                    deps.pm.free(rx.1);
                    Err(e)
                }
            });
        let ((rx_off, rx_handle), (tx_off, tx_handle)) = match bufs {
            Ok(v) => v,
            Err(e) => {
                warn!("[tcp::open] buffer allocation failed: {e}");
                self.port_release(local_port);
                return Err(-1);
            }
        };

        let local_seq = self.isn();
        let flow_group = flow_group_of(self.local_ip, local_port, remote_ip, remote_port);
        let h = self.conn_insert(Connection {
            app_id,
            db_id,
            opaque,
            status: ConnStatus::OpenRequested,
            local_ip: self.local_ip,
            remote_ip,
            local_port,
            remote_port,
            remote_mac: 0,
            flow_id: 0,
            flow_group,
            local_seq,
            remote_seq: 0,
            rx_off,
            rx_len,
            tx_off,
            tx_len,
            rx_handle,
            tx_handle,
            timer: None,
            attempts: 0,
        });
        self.demux
            .insert((self.local_ip, local_port, remote_ip, remote_port), h);

        let next_hop = match deps.routing.resolve(remote_ip) {
            Ok(ip) => ip,
            Err(e) => {
                warn!("[tcp::open] routing failed: {e}");
                self.release_conn(deps, h);
                return Err(-1);
            }
        };

        match deps
            .arp
            .request(deps.nic, deps.tmgr, deps.now, next_hop, u64::from(h))
        {
            crate::arp::ArpResult::Ready(mac) => {
                self.conn_mut(h).expect("just inserted").remote_mac = mac;
                self.start_handshake(deps, h);
            }
            crate::arp::ArpResult::Pending => {
                debug!("[tcp::open] waiting on ARP for {next_hop:#010x}");
            }
        }
        Ok(h)
    }

    /// ARP answered (or gave up) for a connection opened earlier.
    pub fn arp_completed(
        &mut self,
        deps: &mut SpDeps<'_>,
        appif: &mut AppIf,
        comp: &crate::arp::ArpCompletion,
    ) {
        let h = comp.opaque as ConnHandle;
        let Some(c) = self.conn(h) else {
            debug!("[tcp::arp_completed] completion for dead connection {h}");
            return;
        };
        if c.status != ConnStatus::OpenRequested {
            return;
        }
        let db = c.db_id;
        if comp.status != 0 {
            warn!("[tcp::arp_completed] next-hop resolution failed, failing open");
            let handoff = self.handoff(h);
            appif.conn_opened(db, &handoff, -1);
            self.release_conn(deps, h);
            return;
        }
        self.conn_mut(h).expect("checked above").remote_mac = comp.mac;
        self.start_handshake(deps, h);
    }

    /// Send the opening frame (SYN or SYN-ACK) and arm the handshake
    /// timer.
    fn start_handshake(&mut self, deps: &mut SpDeps<'_>, h: ConnHandle) {
        let c = self.conn(h).expect("handshake on dead connection");
        let (flags, ack) = match c.status {
            ConnStatus::OpenRequested => (TCP_SYN, 0),
            ConnStatus::AcceptRequested => (TCP_SYN | TCP_ACK, c.remote_seq),
            _ => unreachable!("handshake from {:?}", c.status),
        };
        self.send_ctl(deps, h, flags, ack);

        let timer = deps.tmgr.create(TimeoutKind::TcpHandshake, u64::from(h));
        deps.tmgr.arm(timer, deps.now, deps.cfg.tcp_handshake_to);
        self.swap_timer(deps, h, Some(timer));
    }

    fn send_ctl(&mut self, deps: &mut SpDeps<'_>, h: ConnHandle, flags: u8, ack: u32) {
        let c = self.conn(h).expect("send on dead connection");
        let seg = TcpSeg {
            src_mac: self.local_mac,
            src_ip: c.local_ip,
            dest_ip: c.remote_ip,
            src_port: c.local_port,
            dest_port: c.remote_port,
            seq: c.local_seq,
            ack,
            flags,
            window: c.rx_len.min(0xFFFF) as u16,
            payload_len: 0,
        };
        let mut frame = [0u8; TCP_PKT_LEN];
        let len = seg.build(&mut frame, self.local_mac, c.remote_mac, deps.now);
        if let Err(e) = deps.nic.tx_frame(&frame[..len], true, 0) {
            // the handshake timer resends
            warn!("[tcp::send_ctl] transmit failed: {e}");
        }
    }

    fn swap_timer(&mut self, deps: &mut SpDeps<'_>, h: ConnHandle, timer: Option<TimerId>) {
        let c = self.conn_mut(h).expect("timer swap on dead connection");
        let old = std::mem::replace(&mut c.timer, timer);
        if let Some(t) = old {
            deps.tmgr.destroy(t);
        }
    }

    // --- listeners / passive open ---

    /// Open a listener on `port`.
    pub fn listen(
        &mut self,
        app_id: u16,
        db_id: u16,
        opaque: u64,
        port: u16,
        backlog: u32,
        reuseport: bool,
    ) -> Result<ListenerHandle, i32> {
        if port == 0 || backlog == 0 {
            return Err(-1);
        }
        if let Some(pl) = self.listen_ports.get(&port) {
            let all_share = pl
                .handles
                .iter()
                .all(|&h| self.listener(h).is_some_and(|l| l.reuseport));
            if !(reuseport && all_share) {
                warn!("[tcp::listen] port {port} already bound");
                return Err(-1);
            }
        }

        let l = Listener {
            app_id,
            db_id,
            opaque,
            port,
            backlog_max: backlog,
            backlog: VecDeque::new(),
            accepts: VecDeque::new(),
            reuseport,
        };
        let h = if let Some(h) = self.listener_free.pop() {
            self.listeners[h as usize] = Some(l);
            h
        } else {
            self.listeners.push(Some(l));
            (self.listeners.len() - 1) as u32
        };
        self.listen_ports.entry(port).or_default().handles.push(h);
        self.port_acquire(port);
        Ok(h)
    }

    /// Accept one connection on a listener: takes a backlog entry if one
    /// is waiting, otherwise parks until a SYN arrives.
    pub fn accept(
        &mut self,
        deps: &mut SpDeps<'_>,
        app_id: u16,
        db_id: u16,
        listen_opaque: u64,
        local_port: u16,
        conn_opaque: u64,
    ) -> Result<(), i32> {
        let lh = self
            .listen_ports
            .get(&local_port)
            .and_then(|pl| {
                pl.handles.iter().copied().find(|&h| {
                    self.listener(h)
                        .is_some_and(|l| l.app_id == app_id && l.opaque == listen_opaque)
                })
            })
            .ok_or(-1)?;

        let listener = self.listener_mut(lh).expect("found above");
        if let Some(pending) = listener.backlog.pop_front() {
            self.start_accept(deps, lh, db_id, conn_opaque, &pending)
        } else {
            listener.accepts.push_back((conn_opaque, db_id));
            Ok(())
        }
    }

    fn start_accept(
        &mut self,
        deps: &mut SpDeps<'_>,
        lh: ListenerHandle,
        db_id: u16,
        conn_opaque: u64,
        pending: &PendingConn,
    ) -> Result<(), i32> {
        let (app_id, port) = {
            let l = self.listener(lh).expect("accept on dead listener");
            (l.app_id, l.port)
        };

        let rx_len = deps.cfg.tcp_rxbuf_len;
        let tx_len = deps.cfg.tcp_txbuf_len;
        let (rx_off, rx_handle) = deps.pm.alloc(u64::from(rx_len)).map_err(|e| {
            warn!("[tcp::accept] rx buffer allocation failed: {e}");
            -1
        })?;
        let (tx_off, tx_handle) = match deps.pm.alloc(u64::from(tx_len)) {
            Ok(v) => v,
            Err(e) => {
                warn!("[tcp::accept] tx buffer allocation failed: {e}");
                deps.pm.free(rx_handle);
                return Err(-1);
            }
        };

        let local_seq = self.isn();
        let flow_group =
            flow_group_of(self.local_ip, port, pending.remote_ip, pending.remote_port);
        self.port_acquire(port);
        let h = self.conn_insert(Connection {
            app_id,
            db_id,
            opaque: conn_opaque,
            status: ConnStatus::AcceptRequested,
            local_ip: self.local_ip,
            remote_ip: pending.remote_ip,
            local_port: port,
            remote_port: pending.remote_port,
            remote_mac: pending.remote_mac,
            flow_id: 0,
            flow_group,
            local_seq,
            remote_seq: pending.remote_seq.wrapping_add(1),
            rx_off,
            rx_len,
            tx_off,
            tx_len,
            rx_handle,
            tx_handle,
            timer: None,
            attempts: 0,
        });
        self.demux.insert(
            (self.local_ip, port, pending.remote_ip, pending.remote_port),
            h,
        );
        self.start_handshake(deps, h);
        Ok(())
    }

    /// Drop every listener of an application (teardown).
    pub fn drop_listeners_of_app(&mut self, app_id: u16) {
        for h in 0..self.listeners.len() as u32 {
            let belongs = self
                .listener(h)
                .is_some_and(|l| l.app_id == app_id);
            if !belongs {
                continue;
            }
            let l = self.listeners[h as usize].take().expect("checked above");
            self.listener_free.push(h);
            self.port_release(l.port);
            if let Some(pl) = self.listen_ports.get_mut(&l.port) {
                pl.handles.retain(|&x| x != h);
                if pl.handles.is_empty() {
                    self.listen_ports.remove(&l.port);
                }
            }
        }
    }

    // --- packet path ---

    /// Handshake processing for a TCP segment punted to the slow path.
    pub fn handle_packet(&mut self, deps: &mut SpDeps<'_>, appif: &mut AppIf, frame: &[u8]) {
        let seg = match TcpSeg::parse(frame) {
            Ok(s) => s,
            Err(e) => {
                warn!("[tcp::handle_packet] bad segment: {e}");
                return;
            }
        };

        let key = (seg.dest_ip, seg.dest_port, seg.src_ip, seg.src_port);
        if let Some(&h) = self.demux.get(&key) {
            self.conn_segment(deps, appif, h, &seg);
            return;
        }

        // no connection; a SYN may be for a listener
        if seg.flags & TCP_SYN != 0 && seg.flags & TCP_ACK == 0 {
            self.listener_syn(deps, appif, &seg);
        } else {
            debug!(
                "[tcp::handle_packet] stray segment {}:{} -> port {}",
                seg.src_ip, seg.src_port, seg.dest_port
            );
        }
    }

    fn conn_segment(
        &mut self,
        deps: &mut SpDeps<'_>,
        appif: &mut AppIf,
        h: ConnHandle,
        seg: &TcpSeg,
    ) {
        let (status, local_seq, db) = {
            let c = self.conn(h).expect("demux points at dead connection");
            (c.status, c.local_seq, c.db_id)
        };
        match status {
            ConnStatus::OpenRequested
                if seg.flags & (TCP_SYN | TCP_ACK) == TCP_SYN | TCP_ACK =>
            {
                if seg.ack != local_seq.wrapping_add(1) {
                    debug!("[tcp::conn_segment] SYN-ACK with wrong ack, dropping");
                    return;
                }
                {
                    let c = self.conn_mut(h).expect("checked above");
                    c.local_seq = c.local_seq.wrapping_add(1);
                    c.remote_seq = seg.seq.wrapping_add(1);
                    c.remote_mac = seg.src_mac;
                }
                if !self.install_flow(deps, h) {
                    let handoff = self.handoff(h);
                    appif.conn_opened(db, &handoff, -1);
                    self.release_conn(deps, h);
                    return;
                }
                let ack = self.conn(h).expect("checked above").remote_seq;
                self.send_ctl(deps, h, TCP_ACK, ack);
                self.go_open(deps, h);
                let handoff = self.handoff(h);
                appif.conn_opened(db, &handoff, 0);
            }

            ConnStatus::AcceptRequested
                if seg.flags & TCP_ACK != 0 && seg.flags & TCP_SYN == 0 =>
            {
                if seg.ack != local_seq.wrapping_add(1) {
                    debug!("[tcp::conn_segment] handshake ACK with wrong ack, dropping");
                    return;
                }
                self.conn_mut(h).expect("checked above").local_seq =
                    local_seq.wrapping_add(1);
                if !self.install_flow(deps, h) {
                    let handoff = self.handoff(h);
                    appif.accept_conn(db, &handoff, -1);
                    self.release_conn(deps, h);
                    return;
                }
                self.go_open(deps, h);
                let handoff = self.handoff(h);
                appif.accept_conn(db, &handoff, 0);
            }

            ConnStatus::OpenRequested if seg.flags & TCP_RST != 0 => {
                debug!("[tcp::conn_segment] connection refused");
                let handoff = self.handoff(h);
                appif.conn_opened(db, &handoff, -1);
                self.release_conn(deps, h);
            }

            _ => {
                // duplicate handshake frames and anything the fastpath
                // owns once the flow is installed
                debug!("[tcp::conn_segment] segment ignored in {status:?}");
            }
        }
    }

    fn listener_syn(&mut self, deps: &mut SpDeps<'_>, appif: &mut AppIf, seg: &TcpSeg) {
        if seg.dest_ip != self.local_ip {
            return;
        }
        let Some(pl) = self.listen_ports.get_mut(&seg.dest_port) else {
            debug!("[tcp::listener_syn] SYN for closed port {}", seg.dest_port);
            return;
        };
        // round-robin across reuseport listeners
        let lh = pl.handles[pl.next % pl.handles.len()];
        pl.next = pl.next.wrapping_add(1);

        let pending = PendingConn {
            remote_ip: seg.src_ip,
            remote_port: seg.src_port,
            remote_seq: seg.seq,
            remote_mac: seg.src_mac,
        };

        let listener = self.listener_mut(lh).expect("port table points at it");
        if let Some((conn_opaque, db)) = listener.accepts.pop_front() {
            // an accept was already parked; complete it with this SYN
            if let Err(status) = self.start_accept(deps, lh, db, conn_opaque, &pending) {
                appif.accept_conn(db, &ConnHandoff {
                    opaque: conn_opaque,
                    ..ConnHandoff::default()
                }, status);
            }
            return;
        }

        if listener.backlog.len() as u32 >= listener.backlog_max {
            debug!("[tcp::listener_syn] backlog full on port {}", listener.port);
            deps.stats.drops += 1;
            return;
        }
        let (db, opaque) = (listener.db_id, listener.opaque);
        listener.backlog.push_back(pending);
        appif.listen_newconn(db, opaque, seg.src_ip, seg.src_port);
    }

    fn install_flow(&mut self, deps: &mut SpDeps<'_>, h: ConnHandle) -> bool {
        let params = {
            let c = self.conn(h).expect("install on dead connection");
            ConnectionParams {
                db_id: c.db_id,
                remote_mac: c.remote_mac,
                local_ip: c.local_ip,
                local_port: c.local_port,
                remote_ip: c.remote_ip,
                remote_port: c.remote_port,
                rx_off: c.rx_off,
                rx_len: c.rx_len,
                tx_off: c.tx_off,
                tx_len: c.tx_len,
                remote_seq: c.remote_seq,
                local_seq: c.local_seq,
                app_opaque: c.opaque,
                ecn: false,
                flow_group: c.flow_group,
                rtt_init: deps.cfg.tcp_rtt_init,
            }
        };
        match deps.nic.connection_add(deps.flows, &params) {
            Ok(flow_id) => {
                self.conn_mut(h).expect("checked above").flow_id = flow_id;
                true
            }
            Err(e) => {
                warn!("[tcp::install_flow] flow installation failed: {e}");
                false
            }
        }
    }

    fn go_open(&mut self, deps: &mut SpDeps<'_>, h: ConnHandle) {
        self.conn_mut(h).expect("open on dead connection").status = ConnStatus::Open;
        let timer = deps.tmgr.create(TimeoutKind::TcpRetransmit, u64::from(h));
        deps.tmgr.arm(timer, deps.now, deps.cfg.tcp_rexmit_to);
        self.swap_timer(deps, h, Some(timer));
    }

    // --- close path ---

    /// Close an open connection: detach it from the fastpath and start
    /// the teardown timer. The completion arrives via
    /// `AppIf::conn_closed`.
    pub fn close(&mut self, deps: &mut SpDeps<'_>, h: ConnHandle, reset: bool) -> Result<(), i32> {
        let c = self.conn(h).ok_or(-1)?;
        if c.status != ConnStatus::Open {
            warn!("[tcp::close] connection not open");
            return Err(-1);
        }
        let flow_id = c.flow_id;
        if let Err(e) = deps.nic.connection_disable(flow_id) {
            warn!("[tcp::close] disable failed, retry next iteration: {e}");
            return Err(-1);
        }
        if reset {
            let ack = self.conn(h).expect("checked above").remote_seq;
            self.send_ctl(deps, h, TCP_RST | TCP_ACK, ack);
        }
        self.conn_mut(h).expect("checked above").status = ConnStatus::CloseRequested;
        let timer = deps.tmgr.create(TimeoutKind::TcpClosed, u64::from(h));
        deps.tmgr.arm(timer, deps.now, deps.cfg.tcp_closed_to);
        self.swap_timer(deps, h, Some(timer));
        Ok(())
    }

    /// Rebind a connection's event delivery to another context.
    pub fn move_conn(
        &mut self,
        deps: &mut SpDeps<'_>,
        h: ConnHandle,
        app_id: u16,
        new_db: u16,
    ) -> Result<(), i32> {
        let c = self.conn_mut(h).ok_or(-1)?;
        if c.app_id != app_id || c.status != ConnStatus::Open {
            return Err(-1);
        }
        deps.nic.connection_move(new_db, c.flow_id);
        c.db_id = new_db;
        Ok(())
    }

    /// Free a connection's resources without emitting events (app
    /// teardown, failed setups).
    pub fn abort(&mut self, deps: &mut SpDeps<'_>, h: ConnHandle) {
        if self.conn(h).is_some() {
            self.release_conn(deps, h);
        }
    }

    /// Teardown helper: timers, flow state, buffers, demux, port.
    fn release_conn(&mut self, deps: &mut SpDeps<'_>, h: ConnHandle) {
        self.swap_timer(deps, h, None);
        let c = self.conn_remove(h).expect("release of dead connection");
        if c.flow_id != 0 {
            if let Err(e) = deps.nic.connection_clear(
                c.flow_id,
                c.local_ip,
                c.local_port,
                c.remote_ip,
                c.remote_port,
            ) {
                warn!("[tcp::release] hash-table delete failed: {e}");
            }
            deps.nic.connection_free(deps.flows, c.flow_id, c.flow_group);
        }
        deps.pm.free(c.rx_handle);
        deps.pm.free(c.tx_handle);
        self.demux
            .remove(&(c.local_ip, c.local_port, c.remote_ip, c.remote_port));
        self.port_release(c.local_port);
    }

    // --- timers ---

    /// Dispatch a fired connection timer.
    pub fn handle_timeout(
        &mut self,
        deps: &mut SpDeps<'_>,
        appif: &mut AppIf,
        kind: TimeoutKind,
        opaque: u64,
    ) {
        let h = opaque as ConnHandle;
        match kind {
            TimeoutKind::TcpHandshake => self.handshake_timeout(deps, appif, h),
            TimeoutKind::TcpRetransmit => self.retransmit_timeout(deps, h),
            TimeoutKind::TcpClosed => self.closed_timeout(deps, appif, h),
            other => warn!("[tcp::handle_timeout] unexpected timer {other:?}"),
        }
    }

    fn handshake_timeout(&mut self, deps: &mut SpDeps<'_>, appif: &mut AppIf, h: ConnHandle) {
        let Some(c) = self.conn_mut(h) else {
            return;
        };
        let status = c.status;
        c.attempts += 1;
        let attempts = c.attempts;
        let db = c.db_id;

        if attempts > deps.cfg.tcp_handshake_retries {
            warn!("[tcp::handshake_timeout] handshake gave up after {attempts} attempts");
            let handoff = self.handoff(h);
            match status {
                ConnStatus::OpenRequested => appif.conn_opened(db, &handoff, -1),
                ConnStatus::AcceptRequested => appif.accept_conn(db, &handoff, -1),
                _ => {}
            }
            self.release_conn(deps, h);
            return;
        }

        // resend with doubled interval
        let (flags, ack) = match status {
            ConnStatus::OpenRequested => (TCP_SYN, 0),
            ConnStatus::AcceptRequested => {
                let ack = self.conn(h).expect("checked above").remote_seq;
                (TCP_SYN | TCP_ACK, ack)
            }
            _ => return, // resolved while the timer was in flight
        };
        self.send_ctl(deps, h, flags, ack);
        let interval = deps
            .cfg
            .tcp_handshake_to
            .saturating_mul(1 << attempts.min(6));
        let timer = self.conn(h).expect("checked above").timer.expect("armed");
        deps.tmgr.arm(timer, deps.now, interval);
    }

    fn retransmit_timeout(&mut self, deps: &mut SpDeps<'_>, h: ConnHandle) {
        let Some(c) = self.conn(h) else {
            return;
        };
        if c.status != ConnStatus::Open {
            return;
        }
        let (flow_id, flow_group) = (c.flow_id, c.flow_group);
        if deps.nic.connection_tx_sent(flow_id) > 0 {
            match deps.nic.connection_retransmit(flow_id, flow_group) {
                Ok(()) => deps.stats.sp_rexmit += 1,
                Err(e) => debug!("[tcp::retransmit_timeout] hint not queued: {e}"),
            }
        }
        let timer = c.timer.expect("open connections keep a timer");
        deps.tmgr.arm(timer, deps.now, deps.cfg.tcp_rexmit_to);
    }

    fn closed_timeout(&mut self, deps: &mut SpDeps<'_>, appif: &mut AppIf, h: ConnHandle) {
        let Some(c) = self.conn_mut(h) else {
            return;
        };
        if c.status != ConnStatus::CloseRequested {
            return;
        }
        c.status = ConnStatus::Closed;
        let (db, opaque) = (c.db_id, c.opaque);
        self.release_conn(deps, h);
        appif.conn_closed(db, opaque, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::harness::TestBench;
    use crate::proto::ether::TCP_FIN;
    use crate::proto::nic::SpTx;

    const REMOTE_IP: u32 = 0x0A00_0002;

    #[test]
    fn test_open_resolves_arp_first() {
        let mut b = TestBench::new();
        let h = b
            .with_deps(|tcp, deps| tcp.open(deps, 0, 1, 0x99, REMOTE_IP, 80))
            .unwrap();

        // first frame out is the ARP request, not the SYN
        let frame = b.pop_frame().expect("arp request expected");
        let arp = crate::proto::ether::ArpPkt::parse(&frame).unwrap();
        assert_eq!(arp.tpa, REMOTE_IP);
        assert!(b.pop_frame().is_none());

        // reply lets the SYN out
        b.arp_reply(REMOTE_IP, 0x1111_2222_3333);
        b.drive_arp_completions();
        let frame = b.pop_frame().expect("syn expected");
        let seg = TcpSeg::parse(&frame).unwrap();
        assert_eq!(seg.flags, TCP_SYN);
        assert_eq!(seg.dest_port, 80);

        let c = b.tcp.conn(h).unwrap();
        assert_eq!(c.status, ConnStatus::OpenRequested);
        assert_eq!(c.remote_mac, 0x1111_2222_3333);
    }

    #[test]
    fn test_synack_installs_flow_and_opens() {
        let mut b = TestBench::new();
        let h = b.open_conn(0x42, REMOTE_IP, 80);
        let syn = b.last_tcp_frame().expect("syn sent");

        // remote answers
        b.tcp_reply(&syn, TCP_SYN | TCP_ACK, 5000, syn.seq.wrapping_add(1));

        let c = b.tcp.conn(h).unwrap();
        assert_eq!(c.status, ConnStatus::Open);
        assert_ne!(c.flow_id, 0);
        assert_eq!(c.remote_seq, 5001);

        // flow hash-table add went to the NIC
        assert!(b
            .control_messages()
            .iter()
            .any(|m| matches!(m, SpTx::FlowHtAdd { .. })));

        // final ACK left the box
        let ack = b.last_tcp_frame().expect("ack sent");
        assert_eq!(ack.flags, TCP_ACK);
        assert_eq!(ack.ack, 5001);
    }

    #[test]
    fn test_synack_with_wrong_ack_ignored() {
        let mut b = TestBench::new();
        let h = b.open_conn(0x42, REMOTE_IP, 80);
        let syn = b.last_tcp_frame().expect("syn sent");

        b.tcp_reply(&syn, TCP_SYN | TCP_ACK, 5000, syn.seq.wrapping_add(2));
        assert_eq!(b.tcp.conn(h).unwrap().status, ConnStatus::OpenRequested);
    }

    #[test]
    fn test_rst_fails_open() {
        let mut b = TestBench::new();
        let h = b.open_conn(0x42, REMOTE_IP, 80);
        let syn = b.last_tcp_frame().expect("syn sent");

        b.tcp_reply(&syn, TCP_RST, 0, syn.seq.wrapping_add(1));
        assert!(b.tcp.conn(h).is_none());
        assert_eq!(b.tcp.conn_count(), 0);
    }

    #[test]
    fn test_handshake_retries_then_fails() {
        let mut b = TestBench::new();
        let h = b.open_conn(0x42, REMOTE_IP, 80);
        let _ = b.last_tcp_frame();

        let retries = b.cfg.tcp_handshake_retries;
        for _ in 0..retries {
            b.fire_conn_timer(h);
            let seg = b.last_tcp_frame().expect("retransmitted syn");
            assert_eq!(seg.flags, TCP_SYN);
        }
        // one more firing exhausts the budget
        b.fire_conn_timer(h);
        assert!(b.tcp.conn(h).is_none());
    }

    #[test]
    fn test_listen_accept_backlog_order() {
        let mut b = TestBench::new();
        b.tcp.listen(0, 1, 0x10, 7777, 4, false).unwrap();

        // SYN arrives before any accept: lands in the backlog
        b.send_syn(REMOTE_IP, 1234, 7777, 999);
        // accept consumes it: SYN-ACK goes out
        b.with_deps(|tcp, deps| tcp.accept(deps, 0, 1, 0x10, 7777, 0x20))
            .unwrap();
        let synack = b.last_tcp_frame().expect("syn-ack");
        assert_eq!(synack.flags, TCP_SYN | TCP_ACK);
        assert_eq!(synack.ack, 1000);
        assert_eq!(synack.dest_port, 1234);

        // final ACK opens it
        b.tcp_reply(&synack, TCP_ACK, 1000, synack.seq.wrapping_add(1));
        let h = b
            .tcp
            .find_conn(0, b.tcp.local_ip, 7777, REMOTE_IP, 1234, 0x20)
            .expect("accepted connection");
        assert_eq!(b.tcp.conn(h).unwrap().status, ConnStatus::Open);
    }

    #[test]
    fn test_parked_accept_consumed_by_syn() {
        let mut b = TestBench::new();
        b.tcp.listen(0, 1, 0x10, 7777, 4, false).unwrap();
        b.with_deps(|tcp, deps| tcp.accept(deps, 0, 1, 0x10, 7777, 0x21))
            .unwrap();
        assert!(b.last_tcp_frame().is_none());

        b.send_syn(REMOTE_IP, 4321, 7777, 100);
        let synack = b.last_tcp_frame().expect("syn-ack for parked accept");
        assert_eq!(synack.flags, TCP_SYN | TCP_ACK);
        assert_eq!(synack.dest_port, 4321);
    }

    #[test]
    fn test_backlog_cap_drops_syn() {
        let mut b = TestBench::new();
        b.tcp.listen(0, 1, 0x10, 7777, 1, false).unwrap();
        b.send_syn(REMOTE_IP, 1000, 7777, 1);
        b.send_syn(REMOTE_IP, 1001, 7777, 2);
        assert_eq!(b.stats.drops, 1);
    }

    #[test]
    fn test_listen_port_conflict() {
        let mut b = TestBench::new();
        b.tcp.listen(0, 1, 1, 80, 8, false).unwrap();
        assert!(b.tcp.listen(0, 1, 2, 80, 8, false).is_err());
        assert!(b.tcp.listen(0, 1, 3, 80, 8, true).is_err());

        b.tcp.listen(0, 1, 4, 81, 8, true).unwrap();
        b.tcp.listen(1, 2, 5, 81, 8, true).unwrap();
    }

    #[test]
    fn test_close_then_teardown_frees_everything() {
        let mut b = TestBench::new();
        let h = b.open_conn(0x42, REMOTE_IP, 80);
        let syn = b.last_tcp_frame().unwrap();
        b.tcp_reply(&syn, TCP_SYN | TCP_ACK, 1, syn.seq.wrapping_add(1));
        assert_eq!(b.tcp.conn(h).unwrap().status, ConnStatus::Open);
        let flows_before = b.flows.available();

        b.with_deps(|tcp, deps| tcp.close(deps, h, false)).unwrap();
        assert_eq!(b.tcp.conn(h).unwrap().status, ConnStatus::CloseRequested);
        assert!(b
            .control_messages()
            .iter()
            .any(|m| matches!(m, SpTx::ConnClose { .. })));

        b.fire_conn_timer(h);
        assert!(b.tcp.conn(h).is_none());
        // flow id returned, hash-table delete sent
        assert_eq!(b.flows.available(), flows_before + 1);
        assert!(b
            .control_messages()
            .iter()
            .any(|m| matches!(m, SpTx::FlowHtDel { .. })));
    }

    #[test]
    fn test_close_requires_open() {
        let mut b = TestBench::new();
        let h = b.open_conn(0x42, REMOTE_IP, 80);
        assert!(b.with_deps(|tcp, deps| tcp.close(deps, h, false)).is_err());
    }

    #[test]
    fn test_fin_ignored_on_open_connection() {
        let mut b = TestBench::new();
        let h = b.open_conn(0x42, REMOTE_IP, 80);
        let syn = b.last_tcp_frame().unwrap();
        b.tcp_reply(&syn, TCP_SYN | TCP_ACK, 1, syn.seq.wrapping_add(1));

        // stream teardown belongs to the fastpath
        b.tcp_reply(&syn, TCP_FIN | TCP_ACK, 2, 0);
        assert_eq!(b.tcp.conn(h).unwrap().status, ConnStatus::Open);
    }

    #[test]
    fn test_ephemeral_ports_unique() {
        let mut b = TestBench::new();
        let h1 = b.open_conn(1, REMOTE_IP, 80);
        b.drain_frames();
        let h2 = b.open_conn(2, REMOTE_IP, 80);
        let p1 = b.tcp.conn(h1).unwrap().local_port;
        let p2 = b.tcp.conn(h2).unwrap().local_port;
        assert_ne!(p1, p2);
        assert!(p1 >= EPHEMERAL_BASE && p2 >= EPHEMERAL_BASE);
    }

    #[test]
    fn test_app_teardown_aborts_conns() {
        let mut b = TestBench::new();
        let _h1 = b.open_conn(1, REMOTE_IP, 80);
        let _h2 = b.open_conn(2, REMOTE_IP, 81);
        b.tcp.listen(0, 1, 3, 8080, 4, false).unwrap();
        assert_eq!(b.tcp.conn_count(), 2);

        let handles = b.tcp.conns_of_app(0);
        for h in handles {
            b.with_deps(|tcp, deps| {
                tcp.abort(deps, h);
                Ok::<(), i32>(())
            })
            .unwrap();
        }
        b.tcp.drop_listeners_of_app(0);
        assert_eq!(b.tcp.conn_count(), 0);
        assert!(b.tcp.listen_ports.is_empty());
        assert!(b.tcp.ports_in_use.is_empty());
    }
}
