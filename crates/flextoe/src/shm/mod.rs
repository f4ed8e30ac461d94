// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared memory plumbing: the DMA region both the NIC and every
//! application process address by byte offset, the single-producer /
//! single-consumer slot rings laid out inside it, and the eventfd wrapper
//! used for doorbells and wakeups.
//!
//! # Architecture
//!
//! ```text
//! +--------------+        DMA region (offset addressed)        +-----------+
//! | slow path    |  sprx/sptx   admin rings + packet buffers   | NIC       |
//! |              | <-----------------------------------------> | fastpath  |
//! |              |  sp_appout/sp_appin   per-context rings     +-----------+
//! | application  | <------------------------------------------------+
//! |              |  arx/atx   per-context fastpath rings             |
//! +--------------+ <-------------------------------------------------+
//! ```
//!
//! Each ring slot cycles `invalid -> (producer fills payload, publishes tag
//! with Release) -> consumer observes tag with Acquire -> consumer resets
//! tag to invalid with Release`. Cursors exist only so each side knows
//! where to look next and what to write into the peer's doorbell register;
//! the tag alone carries the ownership handoff.

mod dma;
mod eventfd;
mod ring;

pub use dma::DmaRegion;
pub use eventfd::EventFd;
pub use ring::{RingLayout, SlotRing, TagKind};

use std::fmt;
use std::io;

/// Errors of the shared-memory layer.
#[derive(Debug)]
pub enum ShmError {
    /// Mapping the region failed.
    Mmap(io::Error),
    /// eventfd creation or signaling failed.
    EventFd(io::Error),
    /// Requested region size is zero or not page aligned.
    InvalidSize(usize),
    /// Ring placement outside the region, or zero-length ring.
    InvalidRing { off: u64, len_bytes: u64 },
    /// The next slot still holds an unconsumed entry.
    RingFull,
}

impl fmt::Display for ShmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mmap(e) => write!(f, "memory mapping failed: {e}"),
            Self::EventFd(e) => write!(f, "eventfd operation failed: {e}"),
            Self::InvalidSize(sz) => write!(f, "invalid region size: {sz}"),
            Self::InvalidRing { off, len_bytes } => {
                write!(f, "invalid ring placement: off={off:#x} len={len_bytes}")
            }
            Self::RingFull => write!(f, "descriptor ring full"),
        }
    }
}

impl std::error::Error for ShmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Mmap(e) | Self::EventFd(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type for shared-memory operations.
pub type Result<T> = std::result::Result<T, ShmError>;
