// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! ARP resolution with a timed retry cache.
//!
//! Flow setup needs the next hop's MAC before the connection registers can
//! be filled. A lookup either hits a resolved entry (immediate answer),
//! joins the waiter list of a pending entry, or creates a new pending
//! entry, transmits a request and arms a retry timer. Retries double the
//! interval up to the configured cap; hitting the cap fails every waiter.
//!
//! Waiters are connection handles; when an entry resolves (or dies) each
//! waiter becomes an [`ArpCompletion`] on an internal queue that the
//! connection layer drains within the same poll iteration, so "address
//! resolved" and "connection setup resumes" stay decoupled.
//!
//! The local address is re-announced with a gratuitous request every five
//! seconds, which keeps switch tables warm across idle periods.

use crate::nicif::NicIf;
use crate::proto::ether::{ArpPkt, ARP_OPER_REPLY, ARP_OPER_REQUEST, ARP_PKT_LEN, MAC_BCAST};
use crate::timeouts::{TimeoutKind, TimeoutManager, TimerId};
use log::{debug, warn};
use std::collections::hash_map::Entry as MapEntry;
use std::collections::{HashMap, VecDeque};

const GRATUITOUS_ARP_US: u32 = 5 * 1_000_000;

/// Outcome of a resolution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpResult {
    /// Address known; here is the MAC.
    Ready(u64),
    /// Request in flight; the waiter will get a completion.
    Pending,
}

/// A finished wait: `status` 0 with the MAC, or negative after the retry
/// budget ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpCompletion {
    pub opaque: u64,
    pub status: i32,
    pub mac: u64,
}

#[derive(Debug)]
enum EntryState {
    Resolved { mac: u64 },
    Pending { waiters: Vec<u64>, interval: u32 },
}

#[derive(Debug)]
struct ArpEntry {
    state: EntryState,
    timer: TimerId,
}

/// The ARP cache.
pub struct ArpCache {
    entries: HashMap<u32, ArpEntry>,
    completions: VecDeque<ArpCompletion>,
    local_ip: u32,
    local_mac: u64,
    arp_to: u32,
    arp_to_max: u32,
    grat_timer: TimerId,
}

impl ArpCache {
    /// Create the cache with the local address pre-resolved (loopback
    /// lookups must not hit the wire) and the gratuitous announcement
    /// armed.
    pub fn new(
        tmgr: &mut TimeoutManager,
        now: u32,
        local_ip: u32,
        local_mac: u64,
        arp_to: u32,
        arp_to_max: u32,
    ) -> Self {
        let mut entries = HashMap::new();
        let self_timer = tmgr.create(TimeoutKind::ArpRequest, u64::from(local_ip));
        entries.insert(
            local_ip,
            ArpEntry {
                state: EntryState::Resolved { mac: local_mac },
                timer: self_timer,
            },
        );
        let grat_timer = tmgr.create(TimeoutKind::ArpGratuitous, 0);
        tmgr.arm(grat_timer, now, GRATUITOUS_ARP_US);
        Self {
            entries,
            completions: VecDeque::new(),
            local_ip,
            local_mac,
            arp_to,
            arp_to_max,
            grat_timer,
        }
    }

    /// Resolve `ip`, registering `waiter` for a completion if the answer
    /// is not yet known. A transmit failure is not fatal here: the retry
    /// timer re-sends.
    pub fn request(
        &mut self,
        nic: &mut NicIf,
        tmgr: &mut TimeoutManager,
        now: u32,
        ip: u32,
        waiter: u64,
    ) -> ArpResult {
        match self.entries.entry(ip) {
            MapEntry::Occupied(mut e) => match &mut e.get_mut().state {
                EntryState::Resolved { mac } => ArpResult::Ready(*mac),
                EntryState::Pending { waiters, .. } => {
                    waiters.push(waiter);
                    ArpResult::Pending
                }
            },
            MapEntry::Vacant(slot) => {
                let timer = tmgr.create(TimeoutKind::ArpRequest, u64::from(ip));
                tmgr.arm(timer, now, self.arp_to);
                slot.insert(ArpEntry {
                    state: EntryState::Pending {
                        waiters: vec![waiter],
                        interval: self.arp_to,
                    },
                    timer,
                });
                if let Err(e) = Self::request_tx(nic, self.local_ip, self.local_mac, ip) {
                    warn!("[arp::request] sending request for {ip:#010x} failed: {e}");
                }
                debug!("[arp::request] request sent for {ip:#010x}");
                ArpResult::Pending
            }
        }
    }

    /// Handle an incoming ARP frame: answer requests for the local
    /// address, fold replies into the cache and complete waiters.
    pub fn handle_packet(&mut self, nic: &mut NicIf, tmgr: &mut TimeoutManager, frame: &[u8]) {
        let pkt = match ArpPkt::parse(frame) {
            Ok(p) => p,
            Err(e) => {
                warn!("[arp::handle_packet] invalid packet: {e}");
                return;
            }
        };

        match pkt.oper {
            ARP_OPER_REQUEST => {
                if pkt.tpa != self.local_ip {
                    return;
                }
                let reply = ArpPkt {
                    oper: ARP_OPER_REPLY,
                    sha: self.local_mac,
                    spa: self.local_ip,
                    tha: pkt.sha,
                    tpa: pkt.spa,
                };
                let mut buf = [0u8; ARP_PKT_LEN];
                let len = reply.build(&mut buf, self.local_mac);
                if let Err(e) = nic.tx_frame(&buf[..len], true, 0) {
                    warn!("[arp::handle_packet] sending reply failed: {e}");
                }
            }
            ARP_OPER_REPLY => {
                let Some(entry) = self.entries.get_mut(&pkt.spa) else {
                    debug!("[arp::handle_packet] unsolicited reply from {:#010x}", pkt.spa);
                    return;
                };
                if let EntryState::Pending { waiters, .. } = &mut entry.state {
                    tmgr.disarm(entry.timer);
                    for w in waiters.drain(..) {
                        self.completions.push_back(ArpCompletion {
                            opaque: w,
                            status: 0,
                            mac: pkt.sha,
                        });
                    }
                }
                entry.state = EntryState::Resolved { mac: pkt.sha };
                debug!("[arp::handle_packet] resolved {:#010x}", pkt.spa);
            }
            op => warn!("[arp::handle_packet] unknown operation {op}"),
        }
    }

    /// Retry timer fired for `ip`: re-send with a doubled interval, or
    /// fail every waiter once the cap is reached.
    pub fn handle_timeout(&mut self, nic: &mut NicIf, tmgr: &mut TimeoutManager, now: u32, ip: u32) {
        let Some(entry) = self.entries.get_mut(&ip) else {
            warn!("[arp::handle_timeout] timeout for unknown entry {ip:#010x}");
            return;
        };
        let EntryState::Pending { waiters, interval } = &mut entry.state else {
            // a resolved entry always has its timer disarmed first
            panic!("arp timeout fired on resolved entry {ip:#010x}");
        };

        if *interval * 2 >= self.arp_to_max {
            debug!("[arp::handle_timeout] request for {ip:#010x} timed out");
            for w in waiters.drain(..) {
                self.completions.push_back(ArpCompletion {
                    opaque: w,
                    status: -1,
                    mac: 0,
                });
            }
            let entry = self.entries.remove(&ip).expect("entry checked above");
            tmgr.destroy(entry.timer);
            return;
        }

        *interval *= 2;
        let next = *interval;
        let timer = entry.timer;
        if let Err(e) = Self::request_tx(nic, self.local_ip, self.local_mac, ip) {
            warn!("[arp::handle_timeout] re-sending request failed: {e}");
        }
        tmgr.arm(timer, now, next);
    }

    /// Gratuitous announcement timer: re-announce and re-arm.
    pub fn handle_gratuitous(&mut self, nic: &mut NicIf, tmgr: &mut TimeoutManager, now: u32) {
        if let Err(e) = Self::request_tx(nic, self.local_ip, self.local_mac, self.local_ip) {
            warn!("[arp::handle_gratuitous] announcement failed: {e}");
        }
        tmgr.arm(self.grat_timer, now, GRATUITOUS_ARP_US);
    }

    /// Next finished wait, if any.
    pub fn take_completion(&mut self) -> Option<ArpCompletion> {
        self.completions.pop_front()
    }

    fn request_tx(nic: &mut NicIf, local_ip: u32, local_mac: u64, ip: u32) -> crate::nicif::Result<()> {
        let req = ArpPkt {
            oper: ARP_OPER_REQUEST,
            sha: local_mac,
            spa: local_ip,
            tha: MAC_BCAST,
            tpa: ip,
        };
        let mut buf = [0u8; ARP_PKT_LEN];
        let len = req.build(&mut buf, local_mac);
        nic.tx_frame(&buf[..len], true, 0)
    }
}
