// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bootstrap socket client.
//!
//! The application side of the handshake in [`crate::appif`]: connect,
//! take the welcome (core count plus the slow-path notify eventfd), send
//! the queue-size request with a fresh context eventfd attached, and read
//! back the ring placements. Blocking I/O is fine here; this runs once at
//! context creation.

use super::{AppError, Context, Result};
use crate::appif::{recv_with_fd, send_with_fd};
use crate::engine::NicInfo;
use crate::mmio::FpState;
use crate::proto::app::{UxRequest, UxResponse, UX_RESPONSE_SIZE};
use crate::shm::{DmaRegion, EventFd};
use std::io::Read;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;

fn connect_stream(path: &str) -> std::io::Result<UnixStream> {
    if let Some(name) = path.strip_prefix('\0') {
        use std::os::linux::net::SocketAddrExt;
        let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
        UnixStream::connect_addr(&addr)
    } else {
        UnixStream::connect(path)
    }
}

pub(super) fn connect(
    socket_path: &str,
    dma: Arc<DmaRegion>,
    fp: FpState,
    info: NicInfo,
    rxq_len: u32,
    txq_len: u32,
) -> Result<Context> {
    let mut stream = connect_stream(socket_path).map_err(AppError::Socket)?;

    // welcome: u32 core count, slow-path notify fd as ancillary data
    let mut welcome = [0u8; 4];
    let mut fd = None;
    let n = recv_with_fd(stream.as_raw_fd(), &mut welcome, &mut fd).map_err(AppError::Socket)?;
    if n != welcome.len() {
        return Err(AppError::Protocol("short welcome message"));
    }
    let Some(sp_fd) = fd else {
        return Err(AppError::Protocol("welcome without notify fd"));
    };
    let sp_evfd = EventFd::from_raw(sp_fd);

    // context request with our eventfd attached
    let evfd = EventFd::new()?;
    let req = UxRequest { rxq_len, txq_len }.encode();
    send_with_fd(stream.as_raw_fd(), &req, Some(evfd.as_raw_fd())).map_err(AppError::Socket)?;

    // response, possibly in pieces
    let mut resp_buf = [0u8; UX_RESPONSE_SIZE];
    let mut off = 0;
    while off < resp_buf.len() {
        let n = stream.read(&mut resp_buf[off..]).map_err(AppError::Socket)?;
        if n == 0 {
            return Err(AppError::Protocol("connection closed during handshake"));
        }
        off += n;
    }
    let resp = UxResponse::decode(&resp_buf)
        .map_err(|_| AppError::Protocol("malformed context response"))?;
    if resp.status != 0 {
        return Err(AppError::Rejected(resp.status));
    }

    Context::from_parts(dma, fp, info, &resp, rxq_len, txq_len, evfd, sp_evfd)
}
