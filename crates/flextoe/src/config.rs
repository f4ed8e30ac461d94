// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Slow-path configuration.
//!
//! A plain struct with sane defaults; how it gets populated (CLI, file,
//! environment) is the embedding binary's business. All sizes are bytes,
//! all timeouts microseconds, all addresses host byte order.

use crate::params;

/// One static route: `dest/prefix via next_hop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigRoute {
    /// Destination network address.
    pub ip: u32,
    /// Prefix length in bits (0..=32).
    pub ip_prefix: u8,
    /// Next hop address, must be reachable through the local subnet.
    pub next_hop_ip: u32,
}

/// Runtime configuration for the slow-path engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Local IP address.
    pub ip: u32,
    /// Local subnet prefix length.
    pub ip_prefix: u8,
    /// Static routes, looked up in order after the local subnet.
    pub routes: Vec<ConfigRoute>,

    /// Admin RX descriptor ring length (entries).
    pub nic_rx_len: u32,
    /// Admin TX descriptor ring length (entries).
    pub nic_tx_len: u32,

    /// Bytes reserved per context for the app -> slow path request ring.
    pub app_spin_len: u64,
    /// Bytes reserved per context for the slow path -> app response ring.
    pub app_spout_len: u64,

    /// Per-connection receive buffer size.
    pub tcp_rxbuf_len: u32,
    /// Per-connection transmit buffer size.
    pub tcp_txbuf_len: u32,
    /// Initial RTT estimate handed to the NIC congestion state [us].
    pub tcp_rtt_init: u32,
    /// TCP handshake (re)transmission timeout [us].
    pub tcp_handshake_to: u32,
    /// Number of handshake attempts before giving up.
    pub tcp_handshake_retries: u32,
    /// Retransmission-check period for open connections [us].
    pub tcp_rexmit_to: u32,
    /// Linger time between a close request and flow-state teardown [us].
    pub tcp_closed_to: u32,

    /// Initial ARP retry timeout [us].
    pub arp_to: u32,
    /// ARP retry timeout cap; a request that reaches it fails [us].
    pub arp_to_max: u32,

    /// Abstract-namespace path of the application bootstrap socket.
    pub socket_path: String,
    /// sysfs file used to bind MSI-X vectors to eventfds.
    pub irq_fds_path: String,

    /// Suppress the periodic stats line.
    pub quiet: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ip: 0,
            ip_prefix: 24,
            routes: Vec::new(),
            nic_rx_len: 512,
            nic_tx_len: 512,
            app_spin_len: 64 * 64,
            app_spout_len: 64 * 64,
            tcp_rxbuf_len: 1 << 15,
            tcp_txbuf_len: 1 << 15,
            tcp_rtt_init: 50,
            tcp_handshake_to: 10_000,
            tcp_handshake_retries: 10,
            tcp_rexmit_to: 2_000,
            tcp_closed_to: 1_000,
            arp_to: 500,
            arp_to_max: 10_000_000,
            socket_path: "\0flextoe_sp".to_string(),
            irq_fds_path: "/sys/bus/pci/devices/0000:00:00.0/irq_fds".to_string(),
            quiet: false,
        }
    }
}

impl Config {
    /// Validate the tunables the ring and allocator code depends on.
    pub fn validate(&self) -> Result<(), String> {
        if self.ip_prefix > 32 {
            return Err(format!("invalid prefix length {}", self.ip_prefix));
        }
        if self.nic_rx_len == 0 || self.nic_tx_len == 0 {
            return Err("admin ring lengths must be nonzero".to_string());
        }
        if self.app_spin_len % crate::proto::app::SP_ENTRY_SIZE as u64 != 0
            || self.app_spout_len % crate::proto::app::SP_ENTRY_SIZE as u64 != 0
        {
            return Err("context ring sizes must be entry multiples".to_string());
        }
        if self.arp_to == 0 || self.arp_to > self.arp_to_max {
            return Err("invalid arp timeout configuration".to_string());
        }
        let _ = params::PL_APPCTX_NUM;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_prefix() {
        let cfg = Config {
            ip_prefix: 33,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_unaligned_ring() {
        let cfg = Config {
            app_spin_len: 100,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }
}
