// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Application interface: bootstrap socket and context registry.
//!
//! Applications attach in two steps. A unix stream socket carries the
//! bootstrap handshake (queue sizes in, ring placements and a doorbell id
//! out, eventfds in both directions as `SCM_RIGHTS`); after that all
//! communication runs over the per-context rings in shared memory.
//!
//! The socket work lives on a dedicated thread so it may block; the poll
//! loop must not. The two sides meet over a pair of channels: the socket
//! thread forwards completed registrations (`ux_to_poll`) and the poll
//! loop answers with ring placements (`poll_to_ux`), waking the socket
//! thread through a `mio::Waker`. Every touch of engine-owned state
//! (packet memory, the doorbell pool, NIC registers) happens on the poll
//! loop side.
//!
//! Request handling per context lives in [`ctx`].

mod ctx;

pub use ctx::{AppCtx, ConnHandoff};

use crate::engine::SpDeps;
use crate::params::{PL_APPCTX_NUM, PL_APPST_CTX_NUM, PL_APPST_NUM};
use crate::proto::app::{UxRequest, UxResponse, SP_ENTRY_SIZE, UX_REQUEST_SIZE};
use crate::proto::nic::APP_DESC_SIZE;
use crate::shm::{DmaRegion, EventFd, RingLayout, SlotRing};
use crate::tcp::TcpState;
use crossbeam::channel::{unbounded, Receiver, Sender};
use log::{debug, error, warn};
use mio::net::{UnixListener, UnixStream};
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Application interface errors.
#[derive(Debug)]
pub enum AppifError {
    /// Socket setup failed.
    Socket(io::Error),
    /// Registration resource failure (memory, doorbell, NIC slot).
    Resources(&'static str),
}

impl fmt::Display for AppifError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket(e) => write!(f, "bootstrap socket: {e}"),
            Self::Resources(what) => write!(f, "context registration failed: {what}"),
        }
    }
}

impl std::error::Error for AppifError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Socket(e) => Some(e),
            Self::Resources(_) => None,
        }
    }
}

/// Socket thread -> poll loop.
enum UxToPoll {
    NewContext {
        app_id: u16,
        rxq_len: u32,
        txq_len: u32,
        evfd: RawFd,
    },
    AppGone {
        app_id: u16,
    },
}

/// Poll loop -> socket thread.
struct PollToUx {
    app_id: u16,
    resp: UxResponse,
}

#[derive(Default)]
struct Application {
    contexts: Vec<u16>,
}

/// The application interface.
pub struct AppIf {
    /// Contexts indexed by doorbell id.
    ctxs: Vec<Option<AppCtx>>,
    apps: HashMap<u16, Application>,
    /// Doorbell free list; doorbell 0 belongs to the slow path.
    free_doorbells: Vec<u16>,

    ux_rx: Receiver<UxToPoll>,
    ux_reply: Sender<PollToUx>,
    waker: Option<Arc<Waker>>,
    ux_thread: Option<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl AppIf {
    /// Build the interface and, when `socket_path` is nonempty, start the
    /// bootstrap socket thread. `sp_notify` is the slow-path wakeup
    /// eventfd handed to every connecting application; `cores` goes out
    /// in the welcome message.
    pub fn new(
        socket_path: &str,
        sp_notify: &EventFd,
        cores: u32,
    ) -> Result<Self, AppifError> {
        let (ux_tx, ux_rx) = unbounded();
        let (reply_tx, reply_rx) = unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));

        // doorbells count down so pop() hands out 1, 2, ...
        let free_doorbells: Vec<u16> = (1..PL_APPCTX_NUM as u16).rev().collect();

        let mut appif = Self {
            ctxs: (0..PL_APPCTX_NUM).map(|_| None).collect(),
            apps: HashMap::new(),
            free_doorbells,
            ux_rx,
            ux_reply: reply_tx,
            waker: None,
            ux_thread: None,
            shutdown: Arc::clone(&shutdown),
        };

        if !socket_path.is_empty() {
            let listener = bind_unix(socket_path).map_err(AppifError::Socket)?;
            let poll = Poll::new().map_err(AppifError::Socket)?;
            let waker =
                Arc::new(Waker::new(poll.registry(), TOKEN_WAKER).map_err(AppifError::Socket)?);
            appif.waker = Some(Arc::clone(&waker));

            let sp_notify = sp_notify.try_clone().map_err(|_| {
                AppifError::Socket(io::Error::new(io::ErrorKind::Other, "dup sp notify fd"))
            })?;
            let thread_state = UxThread {
                poll,
                listener,
                conns: HashMap::new(),
                next_token: 2,
                app_ids: (0..PL_APPST_NUM as u16).rev().collect(),
                to_poll: ux_tx,
                replies: reply_rx,
                sp_notify,
                cores,
                shutdown,
            };
            appif.ux_thread = Some(
                thread::Builder::new()
                    .name("flextoe-ux".to_string())
                    .spawn(move || thread_state.run())
                    .map_err(AppifError::Socket)?,
            );
        }

        Ok(appif)
    }

    /// Poll-loop half: drain the registration channel, then give every
    /// ready context one request slot. Returns processed events.
    pub fn poll(&mut self, deps: &mut SpDeps<'_>, tcp: &mut TcpState, dma: &Arc<DmaRegion>) -> u32 {
        let mut n = 0;

        while let Ok(msg) = self.ux_rx.try_recv() {
            match msg {
                UxToPoll::NewContext {
                    app_id,
                    rxq_len,
                    txq_len,
                    evfd,
                } => {
                    let resp = self.register_context(deps, dma, app_id, rxq_len, txq_len, evfd);
                    if resp.status != 0 {
                        self.teardown_app(deps, tcp, app_id);
                    }
                    let _ = self.ux_reply.send(PollToUx { app_id, resp });
                    if let Some(w) = &self.waker {
                        if let Err(e) = w.wake() {
                            warn!("[appif::poll] waking socket thread failed: {e}");
                        }
                    }
                    n += 1;
                }
                UxToPoll::AppGone { app_id } => {
                    self.teardown_app(deps, tcp, app_id);
                    n += 1;
                }
            }
        }

        let ctx_dir: Vec<(u16, u16)> = self
            .ctxs
            .iter()
            .flatten()
            .map(|c| (c.db_id, c.app_id))
            .collect();
        for db in 0..self.ctxs.len() {
            if let Some(ctx) = self.ctxs[db].as_mut() {
                n += ctx.poll(deps, tcp, &ctx_dir);
            }
        }
        n
    }

    /// Register one context: carve the four rings out of packet memory,
    /// take a doorbell, program the NIC, and describe the result. On any
    /// failure a response with nonzero status is produced and everything
    /// allocated so far is returned.
    pub fn register_context(
        &mut self,
        deps: &mut SpDeps<'_>,
        dma: &Arc<DmaRegion>,
        app_id: u16,
        rxq_len: u32,
        txq_len: u32,
        evfd: RawFd,
    ) -> UxResponse {
        let fail = |status: u32| UxResponse {
            status,
            ..UxResponse::default()
        };
        // adopt the fd either way so it cannot leak
        let evfd = EventFd::from_raw(evfd);

        let rxq_entries = rxq_len / APP_DESC_SIZE as u32;
        let txq_entries = txq_len / APP_DESC_SIZE as u32;
        if rxq_entries == 0
            || txq_entries == 0
            || !rxq_entries.is_power_of_two()
            || !txq_entries.is_power_of_two()
            || rxq_len % APP_DESC_SIZE as u32 != 0
            || txq_len % APP_DESC_SIZE as u32 != 0
        {
            warn!("[appif::register] bad queue sizes from app {app_id}");
            return fail(1);
        }
        if self.apps.entry(app_id).or_default().contexts.len() >= PL_APPST_CTX_NUM {
            warn!("[appif::register] app {app_id} exceeded its context limit");
            return fail(1);
        }

        let spin_bytes = deps.cfg.app_spin_len;
        let spout_bytes = deps.cfg.app_spout_len;

        // ring carve-out; unwind in reverse on failure
        let mut allocated: Vec<crate::packetmem::PktmemHandle> = Vec::with_capacity(4);
        let mut carve = |pm: &mut crate::packetmem::PacketMem, bytes: u64| match pm.alloc(bytes) {
            Ok((off, h)) => {
                dma.zero(off, bytes);
                Some((off, h))
            }
            Err(e) => {
                warn!("[appif::register] packet memory exhausted: {e}");
                None
            }
        };

        let Some((spin_off, spin_h)) = carve(deps.pm, spin_bytes) else {
            return fail(1);
        };
        allocated.push(spin_h);
        let Some((spout_off, spout_h)) = carve(deps.pm, spout_bytes) else {
            release(deps, allocated);
            return fail(1);
        };
        allocated.push(spout_h);
        let Some((rxq_off, rxq_h)) = carve(deps.pm, u64::from(rxq_len)) else {
            release(deps, allocated);
            return fail(1);
        };
        allocated.push(rxq_h);
        let Some((txq_off, txq_h)) = carve(deps.pm, u64::from(txq_len)) else {
            release(deps, allocated);
            return fail(1);
        };
        allocated.push(txq_h);

        let Some(db) = self.free_doorbells.pop() else {
            warn!("[appif::register] no free doorbell for app {app_id}");
            release(deps, allocated);
            return fail(1);
        };

        if let Err(e) = deps.nic.appctx_add(
            app_id,
            db,
            rxq_off,
            rxq_entries,
            txq_off,
            txq_entries,
            evfd.as_raw_fd(),
        ) {
            error!("[appif::register] NIC context registration failed: {e}");
            self.free_doorbells.push(db);
            release(deps, allocated);
            return fail(1);
        }

        let spin = SlotRing::new(
            Arc::clone(dma),
            spin_off,
            (spin_bytes / SP_ENTRY_SIZE as u64) as u32,
            RingLayout::sp_app(),
        );
        let spout = SlotRing::new(
            Arc::clone(dma),
            spout_off,
            (spout_bytes / SP_ENTRY_SIZE as u64) as u32,
            RingLayout::sp_app(),
        );
        let (Ok(spin), Ok(spout)) = (spin, spout) else {
            let _ = deps.nic.appctx_clear(db);
            self.free_doorbells.push(db);
            release(deps, allocated);
            return fail(1);
        };

        let handles = [allocated[0], allocated[1], allocated[2], allocated[3]];
        self.ctxs[db as usize] = Some(AppCtx {
            app_id,
            db_id: db,
            spin,
            spout,
            evfd,
            ready: true,
            handles,
        });
        self.apps.entry(app_id).or_default().contexts.push(db);

        debug!("[appif::register] app {app_id} context ready on doorbell {db}");
        UxResponse {
            app_out_off: spin_off,
            app_in_off: spout_off,
            app_out_len: spin_bytes as u32,
            app_in_len: spout_bytes as u32,
            status: 0,
            db_id: db,
            rxq_off,
            txq_off,
        }
    }

    /// Tear one application down: abort its connections, deregister and
    /// free every context, return the doorbells.
    pub fn teardown_app(&mut self, deps: &mut SpDeps<'_>, tcp: &mut TcpState, app_id: u16) {
        for h in tcp.conns_of_app(app_id) {
            tcp.abort(deps, h);
        }
        tcp.drop_listeners_of_app(app_id);

        let Some(app) = self.apps.remove(&app_id) else {
            return;
        };
        for db in app.contexts {
            if let Some(ctx) = self.ctxs[db as usize].take() {
                if let Err(e) = deps.nic.appctx_clear(db) {
                    warn!("[appif::teardown] clearing context {db} failed: {e}");
                }
                for h in ctx.handles {
                    deps.pm.free(h);
                }
                self.free_doorbells.push(db);
            }
        }
        debug!("[appif::teardown] app {app_id} gone");
    }

    /// Live contexts (diagnostics, tests).
    #[must_use]
    pub fn context_count(&self) -> usize {
        self.ctxs.iter().filter(|c| c.is_some()).count()
    }

    /// Free doorbells (diagnostics, tests).
    #[must_use]
    pub fn doorbells_available(&self) -> usize {
        self.free_doorbells.len()
    }
}

impl Drop for AppIf {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(w) = &self.waker {
            let _ = w.wake();
        }
        if let Some(t) = self.ux_thread.take() {
            let _ = t.join();
        }
    }
}

fn release(deps: &mut SpDeps<'_>, handles: Vec<crate::packetmem::PktmemHandle>) {
    for h in handles {
        deps.pm.free(h);
    }
}

fn bind_unix(path: &str) -> io::Result<UnixListener> {
    let std_listener = if let Some(name) = path.strip_prefix('\0') {
        use std::os::linux::net::SocketAddrExt;
        let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
        std::os::unix::net::UnixListener::bind_addr(&addr)?
    } else {
        let _ = std::fs::remove_file(path);
        std::os::unix::net::UnixListener::bind(path)?
    };
    std_listener.set_nonblocking(true)?;
    Ok(UnixListener::from_std(std_listener))
}

const TOKEN_LISTENER: Token = Token(0);
const TOKEN_WAKER: Token = Token(1);

/// Per-stream state on the socket thread.
struct UxConn {
    stream: UnixStream,
    app_id: u16,
    req: [u8; UX_REQUEST_SIZE],
    req_rx: usize,
    evfd: Option<RawFd>,
    /// Registration forwarded, response not yet sent.
    awaiting: bool,
}

/// The socket thread: accept, handshake, relay. Never touches engine
/// state.
struct UxThread {
    poll: Poll,
    listener: UnixListener,
    conns: HashMap<Token, UxConn>,
    next_token: usize,
    app_ids: Vec<u16>,
    to_poll: Sender<UxToPoll>,
    replies: Receiver<PollToUx>,
    sp_notify: EventFd,
    cores: u32,
    shutdown: Arc<AtomicBool>,
}

impl UxThread {
    fn run(mut self) {
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut self.listener, TOKEN_LISTENER, Interest::READABLE)
        {
            error!("[appif::ux] registering listener failed: {e}");
            return;
        }

        let mut events = Events::with_capacity(32);
        while !self.shutdown.load(Ordering::Acquire) {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("[appif::ux] poll failed: {e}");
                return;
            }
            for ev in &events {
                match ev.token() {
                    TOKEN_LISTENER => self.accept(),
                    TOKEN_WAKER => self.drain_replies(),
                    tok => {
                        if ev.is_error() || ev.is_read_closed() {
                            self.conn_error(tok);
                        } else if ev.is_readable() {
                            self.receive(tok);
                        }
                    }
                }
            }
        }
    }

    fn accept(&mut self) {
        loop {
            let (mut stream, _) = match self.listener.accept() {
                Ok(s) => s,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!("[appif::ux] accept failed: {e}");
                    return;
                }
            };

            let Some(app_id) = self.app_ids.pop() else {
                warn!("[appif::ux] application limit reached, rejecting");
                continue; // drop the stream
            };

            // welcome: core count plus the slow-path notify fd
            let payload = self.cores.to_le_bytes();
            if let Err(e) =
                send_with_fd(stream.as_raw_fd(), &payload, Some(self.sp_notify.as_raw_fd()))
            {
                warn!("[appif::ux] welcome send failed: {e}");
                self.app_ids.push(app_id);
                continue;
            }

            let tok = Token(self.next_token);
            self.next_token += 1;
            if let Err(e) = self.poll.registry().register(
                &mut stream,
                tok,
                Interest::READABLE,
            ) {
                warn!("[appif::ux] stream registration failed: {e}");
                self.app_ids.push(app_id);
                continue;
            }
            self.conns.insert(
                tok,
                UxConn {
                    stream,
                    app_id,
                    req: [0; UX_REQUEST_SIZE],
                    req_rx: 0,
                    evfd: None,
                    awaiting: false,
                },
            );
        }
    }

    fn receive(&mut self, tok: Token) {
        let Some(conn) = self.conns.get_mut(&tok) else {
            return;
        };
        if conn.awaiting {
            // request already forwarded; data here is a protocol error
            self.conn_error(tok);
            return;
        }

        let off = conn.req_rx;
        let mut fd = None;
        let n = match recv_with_fd(conn.stream.as_raw_fd(), &mut conn.req[off..], &mut fd) {
            Ok(0) => {
                self.conn_error(tok);
                return;
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!("[appif::ux] recv failed: {e}");
                self.conn_error(tok);
                return;
            }
        };
        if fd.is_some() {
            conn.evfd = fd;
        }
        conn.req_rx += n;
        if conn.req_rx < UX_REQUEST_SIZE {
            return;
        }
        conn.req_rx = 0;

        let req = UxRequest::decode(&conn.req).expect("fixed-size request");
        let Some(evfd) = conn.evfd.take() else {
            warn!("[appif::ux] request without context eventfd");
            self.conn_error(tok);
            return;
        };
        conn.awaiting = true;
        let app_id = conn.app_id;
        let _ = self.to_poll.send(UxToPoll::NewContext {
            app_id,
            rxq_len: req.rxq_len,
            txq_len: req.txq_len,
            evfd,
        });
    }

    fn drain_replies(&mut self) {
        while let Ok(PollToUx { app_id, resp }) = self.replies.try_recv() {
            let Some((&tok, _)) = self
                .conns
                .iter()
                .find(|(_, c)| c.app_id == app_id && c.awaiting)
            else {
                debug!("[appif::ux] reply for vanished app {app_id}");
                continue;
            };
            let failed = resp.status != 0;
            let conn = self.conns.get_mut(&tok).expect("token just found");
            conn.awaiting = false;
            let bytes = resp.encode();
            if let Err(e) = send_with_fd(conn.stream.as_raw_fd(), &bytes, None) {
                warn!("[appif::ux] response send failed: {e}");
                self.conn_error(tok);
                continue;
            }
            if failed {
                self.conn_error(tok);
            }
        }
    }

    fn conn_error(&mut self, tok: Token) {
        let Some(mut conn) = self.conns.remove(&tok) else {
            return;
        };
        let _ = self.poll.registry().deregister(&mut conn.stream);
        if let Some(fd) = conn.evfd.take() {
            // SAFETY: the fd was received over SCM_RIGHTS and never
            // handed to the poll loop; this is its only owner.
            unsafe {
                libc::close(fd);
            }
        }
        self.app_ids.push(conn.app_id);
        let _ = self.to_poll.send(UxToPoll::AppGone {
            app_id: conn.app_id,
        });
    }
}

/// `sendmsg` with an optional fd as `SCM_RIGHTS` ancillary data.
pub(crate) fn send_with_fd(sock: RawFd, payload: &[u8], fd: Option<RawFd>) -> io::Result<()> {
    // SAFETY: all pointers handed to sendmsg reference live stack
    // buffers; control length is computed with the CMSG macros.
    unsafe {
        let mut iov = libc::iovec {
            iov_base: payload.as_ptr() as *mut libc::c_void,
            iov_len: payload.len(),
        };
        let mut cbuf = [0u8; 32]; // CMSG_SPACE(4) fits with room to spare
        let mut msg: libc::msghdr = std::mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;

        if let Some(fd) = fd {
            msg.msg_control = cbuf.as_mut_ptr().cast();
            msg.msg_controllen = libc::CMSG_SPACE(4) as usize;
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(4) as usize;
            std::ptr::copy_nonoverlapping(
                std::ptr::addr_of!(fd).cast::<u8>(),
                libc::CMSG_DATA(cmsg),
                4,
            );
        }

        let n = libc::sendmsg(sock, &msg, 0);
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        if n as usize != payload.len() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "short send"));
        }
        Ok(())
    }
}

/// `recvmsg` that also captures one passed fd, if any.
pub(crate) fn recv_with_fd(
    sock: RawFd,
    buf: &mut [u8],
    fd_out: &mut Option<RawFd>,
) -> io::Result<usize> {
    // SAFETY: as in send_with_fd; the control buffer is sized for one fd.
    unsafe {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        };
        let mut cbuf = [0u8; 32];
        let mut msg: libc::msghdr = std::mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cbuf.as_mut_ptr().cast();
        msg.msg_controllen = cbuf.len();

        let n = libc::recvmsg(sock, &mut msg, 0);
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if !cmsg.is_null()
            && (*cmsg).cmsg_level == libc::SOL_SOCKET
            && (*cmsg).cmsg_type == libc::SCM_RIGHTS
        {
            let mut fd: RawFd = -1;
            std::ptr::copy_nonoverlapping(
                libc::CMSG_DATA(cmsg),
                std::ptr::addr_of_mut!(fd).cast::<u8>(),
                4,
            );
            *fd_out = Some(fd);
        }
        Ok(n as usize)
    }
}
