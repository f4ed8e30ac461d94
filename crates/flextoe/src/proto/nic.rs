// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! NIC descriptor ring records.
//!
//! Two queue pairs exist against the firmware:
//!
//! - the slow-path admin pair (`sprx` NIC->host, `sptx` host->NIC), 64-byte
//!   slots with the u32 tag in the *first* word;
//! - the per-context fastpath pair (`arx` NIC->app, `atx` app->NIC), 32-byte
//!   slots with the u32 tag in the *last* word.
//!
//! All fields, tags included, are big-endian on the wire; the ring layer
//! byte-swaps the tag, the codecs here byte-swap the payload.

use super::{
    get_u16_be, get_u32_be, get_u64_be, put_u16_be, put_u32_be, put_u64_be, ProtoError, Result,
};

/// Slot size of the admin rings.
pub const SP_DESC_SIZE: usize = 64;

/// Slot size of the per-context fastpath rings.
pub const APP_DESC_SIZE: usize = 32;

/// `arx` ConnUpdate flag: the receive stream has hit end-of-stream.
pub const ARX_FL_RXDONE: u32 = 0x2;

mod tag_sprx {
    pub const PACKET: u32 = 1;
}

mod tag_sptx {
    pub const PACKET: u32 = 1;
    pub const PACKET_NOTS: u32 = 2;
    pub const CONN_RETX: u32 = 3;
    pub const CONN_SETRATE: u32 = 4;
    pub const FLOWHT_ADD: u32 = 5;
    pub const FLOWHT_DEL: u32 = 6;
    pub const CONN_CLOSE: u32 = 7;
    pub const DEBUG_RESET: u32 = 8;
}

mod tag_arx {
    pub const CONNUPDATE: u32 = 1;
}

mod tag_atx {
    pub const CONNUPDATE: u32 = 1;
}

/// Entries the NIC hands to the slow path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpRx {
    /// A packet was punted to the slow path; the payload sits in the
    /// matching admin packet buffer.
    Packet {
        len: u32,
        flow_group: u16,
        flow_hash: u64,
    },
}

impl SpRx {
    pub fn encode(&self, buf: &mut [u8]) -> u32 {
        debug_assert_eq!(buf.len(), SP_DESC_SIZE);
        match *self {
            Self::Packet {
                len,
                flow_group,
                flow_hash,
            } => {
                put_u32_be(buf, 4, len);
                put_u32_be(buf, 8, u32::from(flow_group));
                put_u64_be(buf, 12, flow_hash);
                tag_sprx::PACKET
            }
        }
    }

    pub fn decode(tag: u32, buf: &[u8]) -> Result<Self> {
        if buf.len() < SP_DESC_SIZE {
            return Err(ProtoError::Truncated {
                need: SP_DESC_SIZE,
                got: buf.len(),
            });
        }
        match tag {
            tag_sprx::PACKET => Ok(Self::Packet {
                len: get_u32_be(buf, 4),
                flow_group: get_u32_be(buf, 8) as u16,
                flow_hash: get_u64_be(buf, 12),
            }),
            t => Err(ProtoError::BadTag(t)),
        }
    }
}

/// Entries the slow path hands to the NIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpTx {
    /// Transmit the matching admin packet buffer.
    Packet {
        len: u32,
        ts_offset: u32,
        /// Skip timestamp rewriting for this frame.
        no_ts: bool,
    },
    /// Trigger a retransmission for a flow.
    ConnRetran { flow_id: u32, flow_group: u16 },
    /// Program the rate limiter of a flow.
    ConnSetRate { flow_id: u32, tx_rate: u32 },
    /// Install a flow in the fastpath hash table.
    FlowHtAdd {
        flow_id: u32,
        local_ip: u32,
        remote_ip: u32,
        local_port: u16,
        remote_port: u16,
    },
    /// Remove a flow from the fastpath hash table.
    FlowHtDel {
        flow_id: u32,
        local_ip: u32,
        remote_ip: u32,
        local_port: u16,
        remote_port: u16,
    },
    /// Detach a flow from the fastpath (stops RX and TX processing).
    ConnClose { flow_id: u32 },
    /// Reset firmware debug counters.
    DebugReset,
}

impl SpTx {
    fn encode_flowht(
        buf: &mut [u8],
        flow_id: u32,
        local_ip: u32,
        remote_ip: u32,
        local_port: u16,
        remote_port: u16,
    ) {
        put_u32_be(buf, 4, remote_ip);
        put_u32_be(buf, 8, local_ip);
        put_u16_be(buf, 12, remote_port);
        put_u16_be(buf, 14, local_port);
        put_u32_be(buf, 16, flow_id);
    }

    fn decode_flowht(buf: &[u8]) -> (u32, u32, u32, u16, u16) {
        (
            get_u32_be(buf, 16),
            get_u32_be(buf, 8),
            get_u32_be(buf, 4),
            get_u16_be(buf, 14),
            get_u16_be(buf, 12),
        )
    }

    pub fn encode(&self, buf: &mut [u8]) -> u32 {
        debug_assert_eq!(buf.len(), SP_DESC_SIZE);
        match *self {
            Self::Packet {
                len,
                ts_offset,
                no_ts,
            } => {
                put_u32_be(buf, 4, len);
                put_u32_be(buf, 8, ts_offset);
                if no_ts {
                    tag_sptx::PACKET_NOTS
                } else {
                    tag_sptx::PACKET
                }
            }
            Self::ConnRetran {
                flow_id,
                flow_group,
            } => {
                put_u32_be(buf, 4, flow_id);
                put_u32_be(buf, 8, u32::from(flow_group));
                tag_sptx::CONN_RETX
            }
            Self::ConnSetRate { flow_id, tx_rate } => {
                put_u32_be(buf, 4, flow_id);
                put_u32_be(buf, 8, tx_rate);
                tag_sptx::CONN_SETRATE
            }
            Self::FlowHtAdd {
                flow_id,
                local_ip,
                remote_ip,
                local_port,
                remote_port,
            } => {
                Self::encode_flowht(buf, flow_id, local_ip, remote_ip, local_port, remote_port);
                tag_sptx::FLOWHT_ADD
            }
            Self::FlowHtDel {
                flow_id,
                local_ip,
                remote_ip,
                local_port,
                remote_port,
            } => {
                Self::encode_flowht(buf, flow_id, local_ip, remote_ip, local_port, remote_port);
                tag_sptx::FLOWHT_DEL
            }
            Self::ConnClose { flow_id } => {
                put_u32_be(buf, 4, flow_id);
                tag_sptx::CONN_CLOSE
            }
            Self::DebugReset => tag_sptx::DEBUG_RESET,
        }
    }

    pub fn decode(tag: u32, buf: &[u8]) -> Result<Self> {
        if buf.len() < SP_DESC_SIZE {
            return Err(ProtoError::Truncated {
                need: SP_DESC_SIZE,
                got: buf.len(),
            });
        }
        match tag {
            tag_sptx::PACKET | tag_sptx::PACKET_NOTS => Ok(Self::Packet {
                len: get_u32_be(buf, 4),
                ts_offset: get_u32_be(buf, 8),
                no_ts: tag == tag_sptx::PACKET_NOTS,
            }),
            tag_sptx::CONN_RETX => Ok(Self::ConnRetran {
                flow_id: get_u32_be(buf, 4),
                flow_group: get_u32_be(buf, 8) as u16,
            }),
            tag_sptx::CONN_SETRATE => Ok(Self::ConnSetRate {
                flow_id: get_u32_be(buf, 4),
                tx_rate: get_u32_be(buf, 8),
            }),
            tag_sptx::FLOWHT_ADD | tag_sptx::FLOWHT_DEL => {
                let (flow_id, local_ip, remote_ip, local_port, remote_port) =
                    Self::decode_flowht(buf);
                if tag == tag_sptx::FLOWHT_ADD {
                    Ok(Self::FlowHtAdd {
                        flow_id,
                        local_ip,
                        remote_ip,
                        local_port,
                        remote_port,
                    })
                } else {
                    Ok(Self::FlowHtDel {
                        flow_id,
                        local_ip,
                        remote_ip,
                        local_port,
                        remote_port,
                    })
                }
            }
            tag_sptx::CONN_CLOSE => Ok(Self::ConnClose {
                flow_id: get_u32_be(buf, 4),
            }),
            tag_sptx::DEBUG_RESET => Ok(Self::DebugReset),
            t => Err(ProtoError::BadTag(t)),
        }
    }
}

/// Fastpath -> application entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arx {
    ConnUpdate {
        opaque: u64,
        rx_bump: u32,
        tx_bump: u32,
        flags: u32,
    },
}

impl Arx {
    pub fn encode(&self, buf: &mut [u8]) -> u32 {
        debug_assert_eq!(buf.len(), APP_DESC_SIZE);
        match *self {
            Self::ConnUpdate {
                opaque,
                rx_bump,
                tx_bump,
                flags,
            } => {
                put_u64_be(buf, 0, opaque);
                put_u32_be(buf, 8, rx_bump);
                put_u32_be(buf, 12, tx_bump);
                put_u32_be(buf, 16, flags);
                tag_arx::CONNUPDATE
            }
        }
    }

    pub fn decode(tag: u32, buf: &[u8]) -> Result<Self> {
        if buf.len() < APP_DESC_SIZE {
            return Err(ProtoError::Truncated {
                need: APP_DESC_SIZE,
                got: buf.len(),
            });
        }
        match tag {
            tag_arx::CONNUPDATE => Ok(Self::ConnUpdate {
                opaque: get_u64_be(buf, 0),
                rx_bump: get_u32_be(buf, 8),
                tx_bump: get_u32_be(buf, 12),
                flags: get_u32_be(buf, 16),
            }),
            t => Err(ProtoError::BadTag(t)),
        }
    }
}

/// Application -> fastpath entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Atx {
    ConnUpdate {
        rx_bump: u32,
        tx_bump: u32,
        flow_id: u32,
        flow_group: u16,
        bump_seq: u16,
        flags: u8,
    },
}

impl Atx {
    pub fn encode(&self, buf: &mut [u8]) -> u32 {
        debug_assert_eq!(buf.len(), APP_DESC_SIZE);
        match *self {
            Self::ConnUpdate {
                rx_bump,
                tx_bump,
                flow_id,
                flow_group,
                bump_seq,
                flags,
            } => {
                put_u32_be(buf, 0, rx_bump);
                put_u32_be(buf, 4, tx_bump);
                put_u32_be(buf, 8, flow_id);
                put_u32_be(buf, 12, u32::from(flow_group));
                put_u16_be(buf, 16, bump_seq);
                buf[18] = flags;
                tag_atx::CONNUPDATE
            }
        }
    }

    pub fn decode(tag: u32, buf: &[u8]) -> Result<Self> {
        if buf.len() < APP_DESC_SIZE {
            return Err(ProtoError::Truncated {
                need: APP_DESC_SIZE,
                got: buf.len(),
            });
        }
        match tag {
            tag_atx::CONNUPDATE => Ok(Self::ConnUpdate {
                rx_bump: get_u32_be(buf, 0),
                tx_bump: get_u32_be(buf, 4),
                flow_id: get_u32_be(buf, 8),
                flow_group: get_u32_be(buf, 12) as u16,
                bump_seq: get_u16_be(buf, 16),
                flags: buf[18],
            }),
            t => Err(ProtoError::BadTag(t)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sprx_packet_roundtrip() {
        let ev = SpRx::Packet {
            len: 1514,
            flow_group: 3,
            flow_hash: 0xABCD_EF01_2345_6789,
        };
        let mut buf = [0u8; SP_DESC_SIZE];
        let tag = ev.encode(&mut buf);
        assert_eq!(SpRx::decode(tag, &buf).unwrap(), ev);
    }

    #[test]
    fn test_sptx_flowht_roundtrip() {
        let ev = SpTx::FlowHtAdd {
            flow_id: 1234,
            local_ip: 0x0A00_0001,
            remote_ip: 0x0A00_0002,
            local_port: 4242,
            remote_port: 80,
        };
        let mut buf = [0u8; SP_DESC_SIZE];
        let tag = ev.encode(&mut buf);
        assert_eq!(SpTx::decode(tag, &buf).unwrap(), ev);

        // Same layout, different tag.
        let del = SpTx::FlowHtDel {
            flow_id: 1234,
            local_ip: 0x0A00_0001,
            remote_ip: 0x0A00_0002,
            local_port: 4242,
            remote_port: 80,
        };
        let mut buf = [0u8; SP_DESC_SIZE];
        let tag = del.encode(&mut buf);
        assert_ne!(
            tag,
            SpTx::FlowHtAdd {
                flow_id: 0,
                local_ip: 0,
                remote_ip: 0,
                local_port: 0,
                remote_port: 0
            }
            .encode(&mut [0u8; SP_DESC_SIZE])
        );
        assert_eq!(SpTx::decode(tag, &buf).unwrap(), del);
    }

    #[test]
    fn test_sptx_packet_ts_variants() {
        let mut buf = [0u8; SP_DESC_SIZE];
        let with_ts = SpTx::Packet {
            len: 60,
            ts_offset: 40,
            no_ts: false,
        };
        let t1 = with_ts.encode(&mut buf);
        assert_eq!(SpTx::decode(t1, &buf).unwrap(), with_ts);

        let mut buf = [0u8; SP_DESC_SIZE];
        let no_ts = SpTx::Packet {
            len: 60,
            ts_offset: 0,
            no_ts: true,
        };
        let t2 = no_ts.encode(&mut buf);
        assert_ne!(t1, t2);
        assert_eq!(SpTx::decode(t2, &buf).unwrap(), no_ts);
    }

    #[test]
    fn test_arx_fields_are_big_endian() {
        let ev = Arx::ConnUpdate {
            opaque: 0x1122_3344_5566_7788,
            rx_bump: 0x0100,
            tx_bump: 0,
            flags: ARX_FL_RXDONE,
        };
        let mut buf = [0u8; APP_DESC_SIZE];
        let tag = ev.encode(&mut buf);
        // opaque serialized MSB first
        assert_eq!(buf[0], 0x11);
        assert_eq!(buf[7], 0x88);
        assert_eq!(Arx::decode(tag, &buf).unwrap(), ev);
    }

    #[test]
    fn test_atx_roundtrip() {
        let ev = Atx::ConnUpdate {
            rx_bump: 100,
            tx_bump: 200,
            flow_id: 77,
            flow_group: 1,
            bump_seq: 0xBEEF,
            flags: 0,
        };
        let mut buf = [0u8; APP_DESC_SIZE];
        let tag = ev.encode(&mut buf);
        assert_eq!(Atx::decode(tag, &buf).unwrap(), ev);
    }

    #[test]
    fn test_unknown_tags_rejected() {
        let buf64 = [0u8; SP_DESC_SIZE];
        let buf32 = [0u8; APP_DESC_SIZE];
        assert!(SpRx::decode(99, &buf64).is_err());
        assert!(SpTx::decode(99, &buf64).is_err());
        assert!(Arx::decode(99, &buf32).is_err());
        assert!(Atx::decode(99, &buf32).is_err());
    }
}
