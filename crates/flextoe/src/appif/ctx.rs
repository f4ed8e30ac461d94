// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-context request/response queues.
//!
//! Each application context owns one `sp_appout` request ring and one
//! `sp_appin` response ring in the shared region. The slow path drains at
//! most one request per context per poll iteration and only consumes a
//! request while a response slot is free, so a context never has more than
//! one unanswered request in flight.
//!
//! Error paths answer synchronously; successful opens, accepts and closes
//! answer later through the completion hooks the connection layer fires.
//! A completion that finds the response slot still occupied is dropped
//! with a warning (the one-in-flight credit makes that impossible for
//! request responses; asynchronous events can still race a slow reader).

use crate::engine::SpDeps;
use crate::packetmem::PktmemHandle;
use crate::proto::app::{
    ConnBuffers, SpAppIn, SpAppOut, StatusKind, APPOUT_CLOSE_RESET, APPOUT_LISTEN_REUSEPORT,
    SP_ENTRY_SIZE,
};
use crate::shm::{EventFd, SlotRing};
use crate::tcp::TcpState;
use log::{debug, warn};

/// One application context on the slow-path side.
pub struct AppCtx {
    pub app_id: u16,
    pub db_id: u16,
    /// Consumer side of the app -> slow path request ring.
    pub(super) spin: SlotRing,
    /// Producer side of the slow path -> app response ring.
    pub(super) spout: SlotRing,
    /// Context doorbell eventfd (also bound to the MSI-X vector).
    pub(super) evfd: EventFd,
    pub(super) ready: bool,
    /// Packet-memory handles for teardown: spin, spout, rxq, txq.
    pub(super) handles: [PktmemHandle; 4],
}

/// Everything `ConnOpened`/`AcceptedConn` hand over to the application.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnHandoff {
    pub opaque: u64,
    pub local_ip: u32,
    pub local_port: u16,
    pub remote_ip: u32,
    pub remote_port: u16,
    pub bufs: ConnBuffers,
}

impl AppCtx {
    /// Write one event into the response ring and kick the context.
    /// Returns `false` (and warns) when the slot is still occupied.
    pub(super) fn push_event(&mut self, ev: &SpAppIn, what: &str) -> bool {
        let mut entry = [0u8; SP_ENTRY_SIZE];
        let tag = ev.encode(&mut entry);
        if self.spout.produce(u32::from(tag), &entry).is_err() {
            warn!("[appif::{what}] no space in response queue for context {}", self.db_id);
            return false;
        }
        if let Err(e) = self.evfd.signal() {
            warn!("[appif::{what}] kicking context {} failed: {e}", self.db_id);
        }
        true
    }

    /// Drain at most one request. `ctx_dir` lists live (doorbell, app)
    /// pairs for move-target validation. Returns 1 when a request was
    /// consumed.
    pub(super) fn poll(
        &mut self,
        deps: &mut SpDeps<'_>,
        tcp: &mut TcpState,
        ctx_dir: &[(u16, u16)],
    ) -> u32 {
        if !self.ready {
            return 0;
        }
        // a response slot must be free before a request is consumed
        if !self.spout.can_produce() {
            return 0;
        }

        let mut entry = [0u8; SP_ENTRY_SIZE];
        let Some(tag) = self.spin.peek(&mut entry) else {
            return 0;
        };

        match SpAppOut::decode(tag as u8, &entry) {
            Ok(req) => self.dispatch(deps, tcp, ctx_dir, &req),
            Err(e) => warn!(
                "[appif::ctx_poll] unsupported request on context {}: {e}",
                self.db_id
            ),
        }

        self.spin.release();
        1
    }

    fn dispatch(
        &mut self,
        deps: &mut SpDeps<'_>,
        tcp: &mut TcpState,
        ctx_dir: &[(u16, u16)],
        req: &SpAppOut,
    ) {
        match *req {
            SpAppOut::ConnOpen {
                opaque,
                remote_ip,
                remote_port,
                flags: _,
            } => {
                // success answers from the conn-opened hook once the
                // handshake is done
                if let Err(status) =
                    tcp.open(deps, self.app_id, self.db_id, opaque, remote_ip, remote_port)
                {
                    debug!("[appif::ctx_poll] conn open failed for context {}", self.db_id);
                    self.push_event(
                        &SpAppIn::ConnOpened {
                            opaque,
                            status,
                            local_ip: 0,
                            local_port: 0,
                            bufs: ConnBuffers::default(),
                        },
                        "conn_open",
                    );
                }
            }

            SpAppOut::ConnClose {
                opaque,
                remote_ip,
                local_ip,
                remote_port,
                local_port,
                flags,
            } => {
                let reset = flags & APPOUT_CLOSE_RESET != 0;
                let found = tcp
                    .find_conn(self.app_id, local_ip, local_port, remote_ip, remote_port, opaque)
                    .ok_or(-1)
                    .and_then(|h| tcp.close(deps, h, reset));
                if found.is_err() {
                    warn!("[appif::ctx_poll] conn close failed for context {}", self.db_id);
                    self.push_event(
                        &SpAppIn::Status {
                            kind: StatusKind::ConnClose,
                            opaque,
                            status: -1,
                        },
                        "conn_close",
                    );
                }
            }

            SpAppOut::ConnMove {
                opaque,
                remote_ip,
                local_ip,
                remote_port,
                local_port,
                db_id,
            } => {
                let status = if ctx_dir.contains(&(db_id, self.app_id)) {
                    tcp.find_conn(self.app_id, local_ip, local_port, remote_ip, remote_port, opaque)
                        .ok_or(-1)
                        .and_then(|h| tcp.move_conn(deps, h, self.app_id, db_id))
                        .map_or(-1, |()| 0)
                } else {
                    warn!("[appif::ctx_poll] move target context {db_id} not found");
                    -1
                };
                self.push_event(
                    &SpAppIn::Status {
                        kind: StatusKind::ConnMove,
                        opaque,
                        status,
                    },
                    "conn_move",
                );
            }

            SpAppOut::ListenOpen {
                opaque,
                backlog,
                local_port,
                flags,
            } => {
                let reuseport = flags & APPOUT_LISTEN_REUSEPORT != 0;
                let status = tcp
                    .listen(self.app_id, self.db_id, opaque, local_port, backlog, reuseport)
                    .map_or(-1, |_| 0);
                self.push_event(
                    &SpAppIn::Status {
                        kind: StatusKind::ListenOpen,
                        opaque,
                        status,
                    },
                    "listen_open",
                );
            }

            SpAppOut::ListenClose { opaque, .. } => {
                // not implemented; answer so the request is not lost
                warn!("[appif::ctx_poll] listen close not supported (context {})", self.db_id);
                self.push_event(
                    &SpAppIn::Status {
                        kind: StatusKind::ListenClose,
                        opaque,
                        status: -1,
                    },
                    "listen_close",
                );
            }

            SpAppOut::AcceptConn {
                listen_opaque,
                conn_opaque,
                local_port,
            } => {
                if tcp
                    .accept(deps, self.app_id, self.db_id, listen_opaque, local_port, conn_opaque)
                    .is_err()
                {
                    warn!("[appif::ctx_poll] accept failed for context {}", self.db_id);
                    self.push_event(
                        &SpAppIn::AcceptedConn {
                            opaque: conn_opaque,
                            status: -1,
                            local_ip: 0,
                            remote_ip: 0,
                            remote_port: 0,
                            bufs: ConnBuffers::default(),
                        },
                        "accept_conn",
                    );
                }
            }
        }
    }
}

impl super::AppIf {
    fn ctx_for_event(&mut self, db: u16, what: &str) -> Option<&mut AppCtx> {
        match self.ctxs[db as usize].as_mut() {
            Some(ctx) => Some(ctx),
            None => {
                warn!("[appif::{what}] event for dead context {db}");
                None
            }
        }
    }

    /// Connection-open completion: deliver the buffer handoff (or the
    /// failure status) to the requesting context.
    pub fn conn_opened(&mut self, db: u16, h: &ConnHandoff, status: i32) {
        if let Some(ctx) = self.ctx_for_event(db, "conn_opened") {
            ctx.push_event(
                &SpAppIn::ConnOpened {
                    opaque: h.opaque,
                    status,
                    local_ip: h.local_ip,
                    local_port: h.local_port,
                    bufs: h.bufs,
                },
                "conn_opened",
            );
        }
    }

    /// Accept completion, analogous to [`Self::conn_opened`].
    pub fn accept_conn(&mut self, db: u16, h: &ConnHandoff, status: i32) {
        if let Some(ctx) = self.ctx_for_event(db, "accept_conn") {
            ctx.push_event(
                &SpAppIn::AcceptedConn {
                    opaque: h.opaque,
                    status,
                    local_ip: h.local_ip,
                    remote_ip: h.remote_ip,
                    remote_port: h.remote_port,
                    bufs: h.bufs,
                },
                "accept_conn",
            );
        }
    }

    /// Close completion.
    pub fn conn_closed(&mut self, db: u16, opaque: u64, status: i32) {
        if let Some(ctx) = self.ctx_for_event(db, "conn_closed") {
            ctx.push_event(
                &SpAppIn::Status {
                    kind: StatusKind::ConnClose,
                    opaque,
                    status,
                },
                "conn_closed",
            );
        }
    }

    /// A SYN entered a listener's backlog.
    pub fn listen_newconn(&mut self, db: u16, opaque: u64, remote_ip: u32, remote_port: u16) {
        if let Some(ctx) = self.ctx_for_event(db, "listen_newconn") {
            ctx.push_event(
                &SpAppIn::ListenNewConn {
                    opaque,
                    remote_ip,
                    remote_port,
                },
                "listen_newconn",
            );
        }
    }
}
