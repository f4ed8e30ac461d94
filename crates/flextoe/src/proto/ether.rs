// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Frame formats for the slow-path packet path.
//!
//! Only what the slow path itself sends and receives: ARP request/reply and
//! the TCP handshake/teardown segments. Steady-state data segments never
//! reach this code, the fastpath owns them.
//!
//! Addresses and ports are host byte order in memory; conversion to network
//! order happens at the frame boundary. MACs travel as the low 48 bits of a
//! `u64`, first wire byte in the least significant position (the same
//! packing the NIC register file uses).

use super::{ProtoError, Result};

pub const ETH_ALEN: usize = 6;
pub const ETH_HDR_LEN: usize = 14;
pub const ARP_PKT_LEN: usize = ETH_HDR_LEN + 28;
pub const IP4_HDR_LEN: usize = 20;
pub const TCP_HDR_LEN: usize = 20;
/// NOP + NOP + 10-byte timestamp option, the only option layout the
/// fastpath parses.
pub const TCP_OPT_TS_LEN: usize = 12;
/// Full length of a handshake segment (no payload).
pub const TCP_PKT_LEN: usize = ETH_HDR_LEN + IP4_HDR_LEN + TCP_HDR_LEN + TCP_OPT_TS_LEN;

pub const ETH_TYPE_IP: u16 = 0x0800;
pub const ETH_TYPE_ARP: u16 = 0x0806;
pub const IP_PROTO_TCP: u8 = 6;
pub const ARP_OPER_REQUEST: u16 = 1;
pub const ARP_OPER_REPLY: u16 = 2;
const ARP_HTYPE_ETHERNET: u16 = 1;
const ARP_PTYPE_IPV4: u16 = 0x0800;

pub const TCP_FIN: u8 = 0x01;
pub const TCP_SYN: u8 = 0x02;
pub const TCP_RST: u8 = 0x04;
pub const TCP_ACK: u8 = 0x10;

/// Broadcast MAC.
pub const MAC_BCAST: u64 = 0xFFFF_FFFF_FFFF;

#[inline]
fn put_mac(buf: &mut [u8], off: usize, mac: u64) {
    let b = mac.to_le_bytes();
    buf[off..off + ETH_ALEN].copy_from_slice(&b[..ETH_ALEN]);
}

#[inline]
fn get_mac(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b[..ETH_ALEN].copy_from_slice(&buf[off..off + ETH_ALEN]);
    u64::from_le_bytes(b)
}

#[inline]
fn put_u16_n(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_be_bytes());
}

#[inline]
fn get_u16_n(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

#[inline]
fn put_u32_n(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_be_bytes());
}

#[inline]
fn get_u32_n(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// Ethernet header fields of a received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthHdr {
    pub dest: u64,
    pub src: u64,
    pub ethertype: u16,
}

impl EthHdr {
    pub fn parse(frame: &[u8]) -> Result<Self> {
        if frame.len() < ETH_HDR_LEN {
            return Err(ProtoError::Truncated {
                need: ETH_HDR_LEN,
                got: frame.len(),
            });
        }
        Ok(Self {
            dest: get_mac(frame, 0),
            src: get_mac(frame, 6),
            ethertype: get_u16_n(frame, 12),
        })
    }

    fn write(&self, frame: &mut [u8]) {
        put_mac(frame, 0, self.dest);
        put_mac(frame, 6, self.src);
        put_u16_n(frame, 12, self.ethertype);
    }
}

/// A parsed ARP packet (Ethernet/IPv4 only).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpPkt {
    pub oper: u16,
    pub sha: u64,
    pub spa: u32,
    pub tha: u64,
    pub tpa: u32,
}

impl ArpPkt {
    /// Parse an ARP frame (Ethernet header included). Rejects non-Ethernet
    /// hardware types and non-IPv4 protocol types.
    pub fn parse(frame: &[u8]) -> Result<Self> {
        if frame.len() < ARP_PKT_LEN {
            return Err(ProtoError::Truncated {
                need: ARP_PKT_LEN,
                got: frame.len(),
            });
        }
        let a = &frame[ETH_HDR_LEN..];
        if get_u16_n(a, 0) != ARP_HTYPE_ETHERNET || get_u16_n(a, 2) != ARP_PTYPE_IPV4 {
            return Err(ProtoError::BadField("arp htype/ptype"));
        }
        if a[4] as usize != ETH_ALEN || a[5] != 4 {
            return Err(ProtoError::BadField("arp hlen/plen"));
        }
        Ok(Self {
            oper: get_u16_n(a, 6),
            sha: get_mac(a, 8),
            spa: get_u32_n(a, 14),
            tha: get_mac(a, 18),
            tpa: get_u32_n(a, 24),
        })
    }

    /// Build the full frame into `buf`, returning the frame length.
    pub fn build(&self, buf: &mut [u8], src_mac: u64) -> usize {
        debug_assert!(buf.len() >= ARP_PKT_LEN);
        EthHdr {
            dest: self.tha,
            src: src_mac,
            ethertype: ETH_TYPE_ARP,
        }
        .write(buf);
        let a = &mut buf[ETH_HDR_LEN..];
        put_u16_n(a, 0, ARP_HTYPE_ETHERNET);
        put_u16_n(a, 2, ARP_PTYPE_IPV4);
        a[4] = ETH_ALEN as u8;
        a[5] = 4;
        put_u16_n(a, 6, self.oper);
        put_mac(a, 8, self.sha);
        put_u32_n(a, 14, self.spa);
        put_mac(a, 18, self.tha);
        put_u32_n(a, 24, self.tpa);
        ARP_PKT_LEN
    }
}

/// The handshake-relevant fields of a TCP segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpSeg {
    pub src_mac: u64,
    pub src_ip: u32,
    pub dest_ip: u32,
    pub src_port: u16,
    pub dest_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    /// Bytes of payload after the TCP header (handshake frames carry none).
    pub payload_len: u16,
}

/// Internet checksum over `data`, starting from `init`.
fn csum_fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

fn csum_add(data: &[u8]) -> u32 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for c in &mut chunks {
        sum += u32::from(u16::from_be_bytes([c[0], c[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    sum
}

impl TcpSeg {
    /// Parse eth+ip+tcp headers of a frame punted to the slow path.
    pub fn parse(frame: &[u8]) -> Result<Self> {
        let eth = EthHdr::parse(frame)?;
        if eth.ethertype != ETH_TYPE_IP {
            return Err(ProtoError::BadField("ethertype"));
        }
        if frame.len() < ETH_HDR_LEN + IP4_HDR_LEN + TCP_HDR_LEN {
            return Err(ProtoError::Truncated {
                need: ETH_HDR_LEN + IP4_HDR_LEN + TCP_HDR_LEN,
                got: frame.len(),
            });
        }
        let ip = &frame[ETH_HDR_LEN..];
        let ihl = usize::from(ip[0] & 0x0F) * 4;
        if ip[0] >> 4 != 4 || ihl < IP4_HDR_LEN {
            return Err(ProtoError::BadField("ip version/ihl"));
        }
        if ip[9] != IP_PROTO_TCP {
            return Err(ProtoError::BadField("ip proto"));
        }
        let tot_len = usize::from(get_u16_n(ip, 2));
        if tot_len < ihl + TCP_HDR_LEN || frame.len() < ETH_HDR_LEN + tot_len {
            return Err(ProtoError::Truncated {
                need: ETH_HDR_LEN + tot_len,
                got: frame.len(),
            });
        }
        let tcp = &ip[ihl..];
        let doff = usize::from(tcp[12] >> 4) * 4;
        if doff < TCP_HDR_LEN || tot_len < ihl + doff {
            return Err(ProtoError::BadField("tcp doff"));
        }
        Ok(Self {
            src_mac: eth.src,
            src_ip: get_u32_n(ip, 12),
            dest_ip: get_u32_n(ip, 16),
            src_port: get_u16_n(tcp, 0),
            dest_port: get_u16_n(tcp, 2),
            seq: get_u32_n(tcp, 4),
            ack: get_u32_n(tcp, 8),
            flags: tcp[13],
            window: get_u16_n(tcp, 14),
            payload_len: (tot_len - ihl - doff) as u16,
        })
    }

    /// Build a payload-free segment (handshake / teardown) with the padded
    /// timestamp option. Returns the frame length.
    pub fn build(&self, buf: &mut [u8], src_mac: u64, dest_mac: u64, ts_val: u32) -> usize {
        debug_assert!(buf.len() >= TCP_PKT_LEN);
        buf[..TCP_PKT_LEN].fill(0);
        EthHdr {
            dest: dest_mac,
            src: src_mac,
            ethertype: ETH_TYPE_IP,
        }
        .write(buf);

        let tot_len = (IP4_HDR_LEN + TCP_HDR_LEN + TCP_OPT_TS_LEN) as u16;
        {
            let ip = &mut buf[ETH_HDR_LEN..];
            ip[0] = 0x45;
            put_u16_n(ip, 2, tot_len);
            ip[8] = 64; // TTL
            ip[9] = IP_PROTO_TCP;
            put_u32_n(ip, 12, self.src_ip);
            put_u32_n(ip, 16, self.dest_ip);
            let ipsum = csum_fold(csum_add(&ip[..IP4_HDR_LEN]));
            put_u16_n(ip, 10, ipsum);
        }
        {
            let tcp = &mut buf[ETH_HDR_LEN + IP4_HDR_LEN..];
            put_u16_n(tcp, 0, self.src_port);
            put_u16_n(tcp, 2, self.dest_port);
            put_u32_n(tcp, 4, self.seq);
            put_u32_n(tcp, 8, self.ack);
            tcp[12] = (((TCP_HDR_LEN + TCP_OPT_TS_LEN) / 4) as u8) << 4;
            tcp[13] = self.flags;
            put_u16_n(tcp, 14, self.window);
            // NOP NOP + compact timestamp option (kind 6), the only option
            // layout the fastpath parser understands
            tcp[20] = 1;
            tcp[21] = 1;
            tcp[22] = 6;
            tcp[23] = 10;
            put_u32_n(tcp, 24, ts_val);
        }

        // TCP checksum over pseudo header + segment
        let mut sum = 0u32;
        let mut pseudo = [0u8; 12];
        put_u32_n(&mut pseudo, 0, self.src_ip);
        put_u32_n(&mut pseudo, 4, self.dest_ip);
        pseudo[9] = IP_PROTO_TCP;
        put_u16_n(&mut pseudo, 10, (TCP_HDR_LEN + TCP_OPT_TS_LEN) as u16);
        sum += csum_add(&pseudo);
        sum += csum_add(&buf[ETH_HDR_LEN + IP4_HDR_LEN..TCP_PKT_LEN]);
        let tsum = csum_fold(sum);
        put_u16_n(&mut buf[ETH_HDR_LEN + IP4_HDR_LEN..], 16, tsum);

        TCP_PKT_LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arp_roundtrip() {
        let req = ArpPkt {
            oper: ARP_OPER_REQUEST,
            sha: 0x0000_0A0B_0C0D_0E0F,
            spa: 0x0A00_0001,
            tha: MAC_BCAST,
            tpa: 0x0A00_0002,
        };
        let mut buf = [0u8; ARP_PKT_LEN];
        let len = req.build(&mut buf, req.sha);
        assert_eq!(len, ARP_PKT_LEN);

        let eth = EthHdr::parse(&buf).unwrap();
        assert_eq!(eth.ethertype, ETH_TYPE_ARP);
        assert_eq!(eth.dest, MAC_BCAST);

        let parsed = ArpPkt::parse(&buf).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn test_arp_rejects_bad_ptype() {
        let req = ArpPkt {
            oper: ARP_OPER_REQUEST,
            sha: 1,
            spa: 2,
            tha: 3,
            tpa: 4,
        };
        let mut buf = [0u8; ARP_PKT_LEN];
        req.build(&mut buf, 1);
        buf[ETH_HDR_LEN + 2] = 0x86; // not IPv4
        assert!(ArpPkt::parse(&buf).is_err());
    }

    #[test]
    fn test_tcp_build_parse_roundtrip() {
        let seg = TcpSeg {
            src_mac: 0,
            src_ip: 0x0A00_0001,
            dest_ip: 0x0A00_0002,
            src_port: 9999,
            dest_port: 80,
            seq: 0x1000_0000,
            ack: 0x2000_0000,
            flags: TCP_SYN | TCP_ACK,
            window: 0xFFFF,
            payload_len: 0,
        };
        let mut buf = [0u8; TCP_PKT_LEN];
        let len = seg.build(&mut buf, 0xAABB_CCDD_EEFF, 0x1122_3344_5566, 42);
        assert_eq!(len, TCP_PKT_LEN);

        let parsed = TcpSeg::parse(&buf).unwrap();
        assert_eq!(parsed.src_ip, seg.src_ip);
        assert_eq!(parsed.dest_ip, seg.dest_ip);
        assert_eq!(parsed.src_port, seg.src_port);
        assert_eq!(parsed.dest_port, seg.dest_port);
        assert_eq!(parsed.seq, seg.seq);
        assert_eq!(parsed.ack, seg.ack);
        assert_eq!(parsed.flags, seg.flags);
        assert_eq!(parsed.payload_len, 0);
        assert_eq!(parsed.src_mac, 0xAABB_CCDD_EEFF);
    }

    #[test]
    fn test_tcp_checksum_valid() {
        let seg = TcpSeg {
            src_mac: 0,
            src_ip: 0xC0A8_0001,
            dest_ip: 0xC0A8_0002,
            src_port: 1,
            dest_port: 2,
            seq: 3,
            ack: 4,
            flags: TCP_SYN,
            window: 1024,
            payload_len: 0,
        };
        let mut buf = [0u8; TCP_PKT_LEN];
        seg.build(&mut buf, 5, 6, 7);

        // IP header sums to zero when folded over itself.
        assert_eq!(csum_fold(csum_add(&buf[ETH_HDR_LEN..ETH_HDR_LEN + IP4_HDR_LEN])), 0);

        // TCP checksum including pseudo header folds to zero as well.
        let mut pseudo = [0u8; 12];
        put_u32_n(&mut pseudo, 0, seg.src_ip);
        put_u32_n(&mut pseudo, 4, seg.dest_ip);
        pseudo[9] = IP_PROTO_TCP;
        put_u16_n(&mut pseudo, 10, (TCP_HDR_LEN + TCP_OPT_TS_LEN) as u16);
        let sum = csum_add(&pseudo) + csum_add(&buf[ETH_HDR_LEN + IP4_HDR_LEN..TCP_PKT_LEN]);
        assert_eq!(csum_fold(sum), 0);
    }

    #[test]
    fn test_tcp_parse_rejects_short() {
        let buf = [0u8; ETH_HDR_LEN + 4];
        assert!(TcpSeg::parse(&buf).is_err());
    }
}
