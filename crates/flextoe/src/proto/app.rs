// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Application bootstrap ring records (`sp_appout` / `sp_appin`) and the
//! unix-socket negotiation messages.
//!
//! Both ring directions use 64-byte slots with the u8 tag in the *last*
//! byte: the producer fills 63 payload bytes first and publishes the tag
//! with release ordering, so a consumer that observes a nonzero tag is
//! guaranteed a complete payload. Payload fields are little-endian.

use super::{
    get_u16_le, get_u32_le, get_u64_le, put_u16_le, put_u32_le, put_u64_le, ProtoError, Result,
};

/// Slot size of both context rings.
pub const SP_ENTRY_SIZE: usize = 64;

/// Close request carries a RST instead of an orderly FIN.
pub const APPOUT_CLOSE_RESET: u32 = 1 << 0;

/// Listener should allow port sharing across contexts.
pub const APPOUT_LISTEN_REUSEPORT: u8 = 1 << 0;

mod tag_out {
    pub const CONN_OPEN: u8 = 1;
    pub const CONN_CLOSE: u8 = 2;
    pub const CONN_MOVE: u8 = 3;
    pub const LISTEN_OPEN: u8 = 4;
    pub const LISTEN_CLOSE: u8 = 5;
    pub const ACCEPT_CONN: u8 = 6;
}

mod tag_in {
    pub const STATUS_CONN_CLOSE: u8 = 1;
    pub const STATUS_CONN_MOVE: u8 = 2;
    pub const STATUS_LISTEN_OPEN: u8 = 3;
    pub const STATUS_LISTEN_CLOSE: u8 = 4;
    pub const CONN_OPENED: u8 = 5;
    pub const LISTEN_NEWCONN: u8 = 6;
    pub const ACCEPTED_CONN: u8 = 7;
}

/// Requests on the app -> slow path ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpAppOut {
    ConnOpen {
        opaque: u64,
        remote_ip: u32,
        flags: u32,
        remote_port: u16,
    },
    ConnClose {
        opaque: u64,
        remote_ip: u32,
        local_ip: u32,
        remote_port: u16,
        local_port: u16,
        flags: u32,
    },
    ConnMove {
        opaque: u64,
        remote_ip: u32,
        local_ip: u32,
        remote_port: u16,
        local_port: u16,
        db_id: u16,
    },
    ListenOpen {
        opaque: u64,
        backlog: u32,
        local_port: u16,
        flags: u8,
    },
    ListenClose {
        opaque: u64,
        local_port: u16,
    },
    AcceptConn {
        listen_opaque: u64,
        conn_opaque: u64,
        local_port: u16,
    },
}

impl SpAppOut {
    /// Encode into a zeroed 64-byte slot, returning the tag to publish.
    pub fn encode(&self, buf: &mut [u8]) -> u8 {
        debug_assert_eq!(buf.len(), SP_ENTRY_SIZE);
        match *self {
            Self::ConnOpen {
                opaque,
                remote_ip,
                flags,
                remote_port,
            } => {
                put_u64_le(buf, 0, opaque);
                put_u32_le(buf, 8, remote_ip);
                put_u32_le(buf, 12, flags);
                put_u16_le(buf, 16, remote_port);
                tag_out::CONN_OPEN
            }
            Self::ConnClose {
                opaque,
                remote_ip,
                local_ip,
                remote_port,
                local_port,
                flags,
            } => {
                put_u64_le(buf, 0, opaque);
                put_u32_le(buf, 8, remote_ip);
                put_u32_le(buf, 12, local_ip);
                put_u16_le(buf, 16, remote_port);
                put_u16_le(buf, 18, local_port);
                put_u32_le(buf, 20, flags);
                tag_out::CONN_CLOSE
            }
            Self::ConnMove {
                opaque,
                remote_ip,
                local_ip,
                remote_port,
                local_port,
                db_id,
            } => {
                put_u64_le(buf, 0, opaque);
                put_u32_le(buf, 8, remote_ip);
                put_u32_le(buf, 12, local_ip);
                put_u16_le(buf, 16, remote_port);
                put_u16_le(buf, 18, local_port);
                put_u16_le(buf, 20, db_id);
                tag_out::CONN_MOVE
            }
            Self::ListenOpen {
                opaque,
                backlog,
                local_port,
                flags,
            } => {
                put_u64_le(buf, 0, opaque);
                put_u32_le(buf, 8, backlog);
                put_u16_le(buf, 12, local_port);
                buf[14] = flags;
                tag_out::LISTEN_OPEN
            }
            Self::ListenClose { opaque, local_port } => {
                put_u64_le(buf, 0, opaque);
                put_u16_le(buf, 8, local_port);
                tag_out::LISTEN_CLOSE
            }
            Self::AcceptConn {
                listen_opaque,
                conn_opaque,
                local_port,
            } => {
                put_u64_le(buf, 0, listen_opaque);
                put_u64_le(buf, 8, conn_opaque);
                put_u16_le(buf, 16, local_port);
                tag_out::ACCEPT_CONN
            }
        }
    }

    /// Decode from tag + slot bytes.
    pub fn decode(tag: u8, buf: &[u8]) -> Result<Self> {
        if buf.len() < SP_ENTRY_SIZE {
            return Err(ProtoError::Truncated {
                need: SP_ENTRY_SIZE,
                got: buf.len(),
            });
        }
        match tag {
            tag_out::CONN_OPEN => Ok(Self::ConnOpen {
                opaque: get_u64_le(buf, 0),
                remote_ip: get_u32_le(buf, 8),
                flags: get_u32_le(buf, 12),
                remote_port: get_u16_le(buf, 16),
            }),
            tag_out::CONN_CLOSE => Ok(Self::ConnClose {
                opaque: get_u64_le(buf, 0),
                remote_ip: get_u32_le(buf, 8),
                local_ip: get_u32_le(buf, 12),
                remote_port: get_u16_le(buf, 16),
                local_port: get_u16_le(buf, 18),
                flags: get_u32_le(buf, 20),
            }),
            tag_out::CONN_MOVE => Ok(Self::ConnMove {
                opaque: get_u64_le(buf, 0),
                remote_ip: get_u32_le(buf, 8),
                local_ip: get_u32_le(buf, 12),
                remote_port: get_u16_le(buf, 16),
                local_port: get_u16_le(buf, 18),
                db_id: get_u16_le(buf, 20),
            }),
            tag_out::LISTEN_OPEN => Ok(Self::ListenOpen {
                opaque: get_u64_le(buf, 0),
                backlog: get_u32_le(buf, 8),
                local_port: get_u16_le(buf, 12),
                flags: buf[14],
            }),
            tag_out::LISTEN_CLOSE => Ok(Self::ListenClose {
                opaque: get_u64_le(buf, 0),
                local_port: get_u16_le(buf, 8),
            }),
            tag_out::ACCEPT_CONN => Ok(Self::AcceptConn {
                listen_opaque: get_u64_le(buf, 0),
                conn_opaque: get_u64_le(buf, 8),
                local_port: get_u16_le(buf, 16),
            }),
            t => Err(ProtoError::BadTag(u32::from(t))),
        }
    }
}

/// Buffer handoff carried by both `ConnOpened` and `AcceptedConn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnBuffers {
    pub rx_off: u64,
    pub tx_off: u64,
    pub rx_len: u32,
    pub tx_len: u32,
    pub seq_rx: u32,
    pub seq_tx: u32,
    pub flow_id: u32,
    pub flow_group: u16,
}

/// Events on the slow path -> app ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpAppIn {
    /// Completion status for close / move / listen open / listen close.
    Status {
        kind: StatusKind,
        opaque: u64,
        status: i32,
    },
    ConnOpened {
        opaque: u64,
        status: i32,
        local_ip: u32,
        local_port: u16,
        bufs: ConnBuffers,
    },
    ListenNewConn {
        opaque: u64,
        remote_ip: u32,
        remote_port: u16,
    },
    AcceptedConn {
        opaque: u64,
        status: i32,
        local_ip: u32,
        remote_ip: u32,
        remote_port: u16,
        bufs: ConnBuffers,
    },
}

/// Which request a `Status` event answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    ConnClose,
    ConnMove,
    ListenOpen,
    ListenClose,
}

impl SpAppIn {
    fn encode_bufs(buf: &mut [u8], b: &ConnBuffers) {
        put_u64_le(buf, 8, b.rx_off);
        put_u64_le(buf, 16, b.tx_off);
        put_u32_le(buf, 24, b.rx_len);
        put_u32_le(buf, 28, b.tx_len);
        put_u32_le(buf, 36, b.seq_rx);
        put_u32_le(buf, 40, b.seq_tx);
        put_u32_le(buf, 44, b.flow_id);
    }

    fn decode_bufs(buf: &[u8], flow_group: u16) -> ConnBuffers {
        ConnBuffers {
            rx_off: get_u64_le(buf, 8),
            tx_off: get_u64_le(buf, 16),
            rx_len: get_u32_le(buf, 24),
            tx_len: get_u32_le(buf, 28),
            seq_rx: get_u32_le(buf, 36),
            seq_tx: get_u32_le(buf, 40),
            flow_id: get_u32_le(buf, 44),
            flow_group,
        }
    }

    /// Encode into a zeroed 64-byte slot, returning the tag to publish.
    pub fn encode(&self, buf: &mut [u8]) -> u8 {
        debug_assert_eq!(buf.len(), SP_ENTRY_SIZE);
        match *self {
            Self::Status {
                kind,
                opaque,
                status,
            } => {
                put_u64_le(buf, 0, opaque);
                put_u32_le(buf, 8, status as u32);
                match kind {
                    StatusKind::ConnClose => tag_in::STATUS_CONN_CLOSE,
                    StatusKind::ConnMove => tag_in::STATUS_CONN_MOVE,
                    StatusKind::ListenOpen => tag_in::STATUS_LISTEN_OPEN,
                    StatusKind::ListenClose => tag_in::STATUS_LISTEN_CLOSE,
                }
            }
            Self::ConnOpened {
                opaque,
                status,
                local_ip,
                local_port,
                ref bufs,
            } => {
                put_u64_le(buf, 0, opaque);
                Self::encode_bufs(buf, bufs);
                put_u32_le(buf, 32, status as u32);
                put_u32_le(buf, 48, local_ip);
                put_u16_le(buf, 52, local_port);
                put_u16_le(buf, 54, bufs.flow_group);
                tag_in::CONN_OPENED
            }
            Self::ListenNewConn {
                opaque,
                remote_ip,
                remote_port,
            } => {
                put_u64_le(buf, 0, opaque);
                put_u32_le(buf, 8, remote_ip);
                put_u16_le(buf, 12, remote_port);
                tag_in::LISTEN_NEWCONN
            }
            Self::AcceptedConn {
                opaque,
                status,
                local_ip,
                remote_ip,
                remote_port,
                ref bufs,
            } => {
                put_u64_le(buf, 0, opaque);
                Self::encode_bufs(buf, bufs);
                put_u32_le(buf, 32, status as u32);
                put_u32_le(buf, 48, local_ip);
                put_u32_le(buf, 52, remote_ip);
                put_u16_le(buf, 56, remote_port);
                put_u16_le(buf, 58, bufs.flow_group);
                tag_in::ACCEPTED_CONN
            }
        }
    }

    /// Decode from tag + slot bytes.
    pub fn decode(tag: u8, buf: &[u8]) -> Result<Self> {
        if buf.len() < SP_ENTRY_SIZE {
            return Err(ProtoError::Truncated {
                need: SP_ENTRY_SIZE,
                got: buf.len(),
            });
        }
        let status_of = |kind| Self::Status {
            kind,
            opaque: get_u64_le(buf, 0),
            status: get_u32_le(buf, 8) as i32,
        };
        match tag {
            tag_in::STATUS_CONN_CLOSE => Ok(status_of(StatusKind::ConnClose)),
            tag_in::STATUS_CONN_MOVE => Ok(status_of(StatusKind::ConnMove)),
            tag_in::STATUS_LISTEN_OPEN => Ok(status_of(StatusKind::ListenOpen)),
            tag_in::STATUS_LISTEN_CLOSE => Ok(status_of(StatusKind::ListenClose)),
            tag_in::CONN_OPENED => Ok(Self::ConnOpened {
                opaque: get_u64_le(buf, 0),
                status: get_u32_le(buf, 32) as i32,
                local_ip: get_u32_le(buf, 48),
                local_port: get_u16_le(buf, 52),
                bufs: Self::decode_bufs(buf, get_u16_le(buf, 54)),
            }),
            tag_in::LISTEN_NEWCONN => Ok(Self::ListenNewConn {
                opaque: get_u64_le(buf, 0),
                remote_ip: get_u32_le(buf, 8),
                remote_port: get_u16_le(buf, 12),
            }),
            tag_in::ACCEPTED_CONN => Ok(Self::AcceptedConn {
                opaque: get_u64_le(buf, 0),
                status: get_u32_le(buf, 32) as i32,
                local_ip: get_u32_le(buf, 48),
                remote_ip: get_u32_le(buf, 52),
                remote_port: get_u16_le(buf, 56),
                bufs: Self::decode_bufs(buf, get_u16_le(buf, 58)),
            }),
            t => Err(ProtoError::BadTag(u32::from(t))),
        }
    }
}

/// Unix-socket context request: `{rxq_len, txq_len}` in bytes, followed on
/// the wire by the context eventfd as ancillary data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UxRequest {
    pub rxq_len: u32,
    pub txq_len: u32,
}

/// Serialized size of [`UxRequest`].
pub const UX_REQUEST_SIZE: usize = 8;

impl UxRequest {
    pub fn encode(&self) -> [u8; UX_REQUEST_SIZE] {
        let mut b = [0u8; UX_REQUEST_SIZE];
        put_u32_le(&mut b, 0, self.rxq_len);
        put_u32_le(&mut b, 4, self.txq_len);
        b
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < UX_REQUEST_SIZE {
            return Err(ProtoError::Truncated {
                need: UX_REQUEST_SIZE,
                got: buf.len(),
            });
        }
        Ok(Self {
            rxq_len: get_u32_le(buf, 0),
            txq_len: get_u32_le(buf, 4),
        })
    }
}

/// Unix-socket context response: ring placements inside the shared DMA
/// region, the assigned doorbell and a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UxResponse {
    pub app_out_off: u64,
    pub app_in_off: u64,
    pub app_out_len: u32,
    pub app_in_len: u32,
    pub status: u32,
    pub db_id: u16,
    pub rxq_off: u64,
    pub txq_off: u64,
}

/// Serialized size of [`UxResponse`].
pub const UX_RESPONSE_SIZE: usize = 46;

impl UxResponse {
    pub fn encode(&self) -> [u8; UX_RESPONSE_SIZE] {
        let mut b = [0u8; UX_RESPONSE_SIZE];
        put_u64_le(&mut b, 0, self.app_out_off);
        put_u64_le(&mut b, 8, self.app_in_off);
        put_u32_le(&mut b, 16, self.app_out_len);
        put_u32_le(&mut b, 20, self.app_in_len);
        put_u32_le(&mut b, 24, self.status);
        put_u16_le(&mut b, 28, self.db_id);
        put_u64_le(&mut b, 30, self.rxq_off);
        put_u64_le(&mut b, 38, self.txq_off);
        b
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < UX_RESPONSE_SIZE {
            return Err(ProtoError::Truncated {
                need: UX_RESPONSE_SIZE,
                got: buf.len(),
            });
        }
        Ok(Self {
            app_out_off: get_u64_le(buf, 0),
            app_in_off: get_u64_le(buf, 8),
            app_out_len: get_u32_le(buf, 16),
            app_in_len: get_u32_le(buf, 20),
            status: get_u32_le(buf, 24),
            db_id: get_u16_le(buf, 28),
            rxq_off: get_u64_le(buf, 30),
            txq_off: get_u64_le(buf, 38),
        })
    }
}
