// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Error taxonomy for the S7 tag client.
//!
//! `S7Error` gives callers a stable type to match on for the handful of
//! kinds that matter operationally (retryable vs. fatal, per-tag vs.
//! connection-fatal). Internal plumbing otherwise composes errors with
//! `anyhow::Error`, the same split the rest of the crate follows.

use thiserror::Error;

/// One item's return code from a ReadVar/WriteVar response. `0xFF` is
/// success; everything else is surfaced as `ItemError`.
pub const ITEM_OK: u8 = 0xFF;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum S7Error {
    #[error("malformed address: {0}")]
    MalformedAddress(String),

    #[error("bad type: {0}")]
    BadType(String),

    #[error("type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: String, got: String },

    #[error("too many items: {0} exceeds the 255-item protocol cap")]
    TooManyItems(usize),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("PDU too short: got {got} bytes, need at least {need}")]
    PduTooShort { got: usize, need: usize },

    #[error("item error: PLC returned return code 0x{0:02x}")]
    ItemError(u8),

    #[error("transport closed")]
    TransportClosed,

    #[error("operation timed out")]
    TimedOut,

    #[error("setup communication rejected: {0}")]
    SetupRejected(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("watchdog write failed: {0}")]
    WatchdogFailed(String),

    #[error("unknown tag: {0}")]
    UnknownTag(String),

    #[error("bad tag name: {0}")]
    BadName(String),
}

impl S7Error {
    /// Whether the error kind is one the connection/scheduler should
    /// retry (possibly with backoff) rather than surface as a
    /// programmer error.
    pub fn is_retryable(&self) -> bool {
        match self {
            S7Error::TransportClosed | S7Error::TimedOut => true,
            S7Error::SetupRejected(_) => true,
            S7Error::ItemError(_) => true, // depends; caller inspects code
            _ => false,
        }
    }

    /// Whether this error kind must fault the whole connection (vs. being
    /// recorded against a single tag).
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            S7Error::MalformedFrame(_)
                | S7Error::PduTooShort { .. }
                | S7Error::TransportClosed
                | S7Error::TimedOut
                | S7Error::SetupRejected(_)
        )
    }
}

/// Human-readable meaning for the well-known PLC item return codes.
/// Unknown codes get a generic message.
pub fn item_error_message(code: u8) -> &'static str {
    match code {
        ITEM_OK => "OK",
        0x0A => "object does not exist",
        0x05 => "address out of range",
        0x07 => "write data size mismatch",
        0x03 => "access denied",
        _ => "unspecified PLC item error",
    }
}
