// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! TCP socket lifecycle, COTP/S7 negotiation, and request/response framing.

use std::{
    sync::atomic::{AtomicU16, Ordering},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    cfg::config::Config,
    client::common::io_with_timeout,
    error::S7Error,
    protocol::frame::{
        ItemResult, ReadItem, WriteItem, build_cotp_connection_request,
        build_read_var_request, build_setup_communication_request, build_write_var_request,
        is_cotp_connection_confirm, parse_read_var_response, parse_setup_communication_response,
        parse_write_var_response, peek_tpkt_length, rack_slot_tsap,
    },
};

/// Negotiated session parameters, stable once `Connection::connect`
/// completes successfully.
#[derive(Debug, Clone, Copy)]
pub struct SessionInfo {
    pub pdu_size_negotiated: u16,
    pub max_amq_caller: u16,
    pub max_amq_callee: u16,
}

/// One TCP connection to a PLC, with COTP/S7 negotiation and PDU framing.
///
/// Request/response matching is not pipelined: only one request is
/// outstanding at a time per connection, so both halves can be driven from
/// the same caller without a dedicated reader task.
#[derive(Debug)]
pub struct Connection {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    next_pdu_ref: AtomicU16,
    session: SessionInfo,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl Connection {
    /// Opens the TCP socket, performs the COTP connection request, and
    /// negotiates PDU parameters via Setup Communication.
    pub async fn connect(cfg: &Config, cancel: &CancellationToken) -> Result<Self> {
        if cancel.is_cancelled() {
            return Err(S7Error::Cancelled.into());
        }

        let stream = io_with_timeout(
            "tcp connect",
            TcpStream::connect(cfg.endpoint),
            cfg.connect_timeout,
            cancel,
        )
        .await?;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        let (rack, slot) = cfg.rack_slot();
        let dst_tsap = rack_slot_tsap(rack, slot);
        let src_tsap = [0x01, 0x00];
        let cr = build_cotp_connection_request(src_tsap, dst_tsap);
        io_with_timeout(
            "cotp cr send",
            writer.write_all(&cr),
            cfg.connect_timeout,
            cancel,
        )
        .await?;

        let cc = read_one_frame(&mut reader, cfg.connect_timeout, cancel).await?;
        if !is_cotp_connection_confirm(&cc) {
            return Err(S7Error::SetupRejected("COTP connection not confirmed".into()).into());
        }

        let mut conn = Connection {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            next_pdu_ref: AtomicU16::new(1),
            session: SessionInfo {
                pdu_size_negotiated: cfg.proposed_pdu_length,
                max_amq_caller: 1,
                max_amq_callee: 1,
            },
            read_timeout: cfg.read_timeout,
            write_timeout: cfg.write_timeout,
        };
        conn.negotiate(cfg.proposed_pdu_length, cancel).await?;
        Ok(conn)
    }

    async fn negotiate(&mut self, proposed_pdu_length: u16, cancel: &CancellationToken) -> Result<()> {
        let pdu_ref = self.alloc_pdu_ref();
        let req = build_setup_communication_request(pdu_ref, 1, 1, proposed_pdu_length);
        self.send_raw(&req, self.write_timeout, cancel).await?;
        let resp = self.recv_frame(self.read_timeout, cancel).await?;
        let result = parse_setup_communication_response(&resp)?;
        debug!(
            pdu_length = result.pdu_length,
            max_amq_caller = result.max_amq_caller,
            max_amq_callee = result.max_amq_callee,
            "setup communication negotiated"
        );
        self.session = SessionInfo {
            pdu_size_negotiated: result.pdu_length,
            max_amq_caller: result.max_amq_caller,
            max_amq_callee: result.max_amq_callee,
        };
        Ok(())
    }

    pub fn session_info(&self) -> SessionInfo {
        self.session
    }

    fn alloc_pdu_ref(&self) -> u16 {
        // Wrap-around is permitted by the protocol; an unexpected echoed
        // reference is logged and dropped by the caller.
        let prev = self.next_pdu_ref.fetch_add(1, Ordering::Relaxed);
        if prev == 0 { 1 } else { prev }
    }

    async fn send_raw(&self, bytes: &[u8], timeout: Duration, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(S7Error::Cancelled.into());
        }
        let mut writer = self.writer.lock().await;
        io_with_timeout("frame send", writer.write_all(bytes), timeout, cancel).await
    }

    async fn recv_frame(&self, timeout: Duration, cancel: &CancellationToken) -> Result<Vec<u8>> {
        let mut reader = self.reader.lock().await;
        read_one_frame(&mut reader, timeout, cancel).await
    }

    /// Sends a ReadVar request and returns each item's return code and
    /// payload, in request order.
    pub async fn read_var(
        &self,
        items: &[ReadItem],
        cancel: &CancellationToken,
    ) -> Result<Vec<ItemResult>> {
        if cancel.is_cancelled() {
            return Err(S7Error::Cancelled.into());
        }
        let pdu_ref = self.alloc_pdu_ref();
        let req = build_read_var_request(pdu_ref, items)?;
        self.send_raw(&req, self.write_timeout, cancel).await?;
        let resp = self.recv_frame(self.read_timeout, cancel).await?;
        let results = parse_read_var_response(&resp, items.len());
        if results.is_empty() && !items.is_empty() {
            return Err(S7Error::MalformedFrame("empty ReadVar response".into()).into());
        }
        Ok(results)
    }

    /// Sends a WriteVar request and returns each item's return code, in
    /// request order.
    pub async fn write_var(
        &self,
        items: &[WriteItem],
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        if cancel.is_cancelled() {
            return Err(S7Error::Cancelled.into());
        }
        let pdu_ref = self.alloc_pdu_ref();
        let req = build_write_var_request(pdu_ref, items)?;
        self.send_raw(&req, self.write_timeout, cancel).await?;
        let resp = self.recv_frame(self.read_timeout, cancel).await?;
        let codes = parse_write_var_response(&resp, items.len());
        if codes.len() != items.len() {
            return Err(S7Error::MalformedFrame(format!(
                "WriteVar response carried {} codes, expected {}",
                codes.len(),
                items.len()
            ))
            .into());
        }
        Ok(codes)
    }

    /// Shuts down both halves of the socket. Idempotent.
    pub async fn disconnect(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

/// Reads exactly one TPKT-framed S7 PDU, transparently re-assembling
/// split/coalesced TCP segments.
async fn read_one_frame(
    reader: &mut OwnedReadHalf,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; 4];
    io_with_timeout("tpkt header read", reader.read_exact(&mut buf), timeout, cancel).await?;
    let total_len = peek_tpkt_length(&buf)
        .ok_or_else(|| anyhow!("unreachable: just read a 4-byte TPKT header"))? as usize;
    if total_len < 4 {
        return Err(S7Error::MalformedFrame(format!("TPKT length {total_len} < 4")).into());
    }
    buf.resize(total_len, 0);
    io_with_timeout(
        "frame body read",
        reader.read_exact(&mut buf[4..]),
        timeout,
        cancel,
    )
    .await
    .context("reading remainder of TPKT frame")?;
    Ok(buf)
}
