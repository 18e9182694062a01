// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Watchdog: a periodic DBW write used by the PLC side to detect that the
//! client is still alive. Failures are counted against connection health
//! but, unlike a read/write batch failure, never themselves trigger a
//! reconnect — that decision belongs to the connection state machine.

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    cfg::config::WatchdogConfig,
    client::connection::Connection,
    error::S7Error,
    protocol::{frame::WriteItem, location::Location, value::DataType},
};

/// Tracks consecutive watchdog write failures.
#[derive(Debug, Default)]
pub struct WatchdogHealth {
    consecutive_failures: u32,
}

impl WatchdogHealth {
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    fn record_ok(&mut self) {
        self.consecutive_failures = 0;
    }

    fn record_failure(&mut self) {
        self.consecutive_failures += 1;
    }
}

/// Validates that a configured watchdog address is a word-aligned DB
/// address, matching the 16-bit value the watchdog writes.
pub fn validate_address(address: &str) -> Result<Location, S7Error> {
    let loc = Location::parse(address)?;
    if !loc.area.is_data_block() || loc.width_bits != 16 || loc.bit_offset != 0 {
        return Err(S7Error::WatchdogFailed(format!(
            "watchdog address {address} must be a 16-bit Data Block word address"
        )));
    }
    Ok(loc)
}

/// Executes one watchdog write against `conn`, recording the outcome in
/// `health`. Returns the error (if any) so the caller can log/publish it
/// without this module depending on `events`.
pub async fn tick(
    conn: &Connection,
    cfg: &WatchdogConfig,
    location: Location,
    health: &mut WatchdogHealth,
    cancel: &CancellationToken,
) -> Result<(), S7Error> {
    let item = WriteItem {
        location,
        data_type: DataType::Word,
        data: cfg.value.to_be_bytes().to_vec(),
    };
    let result = conn.write_var(std::slice::from_ref(&item), cancel).await;
    match result {
        Ok(codes) if codes.first() == Some(&crate::error::ITEM_OK) => {
            health.record_ok();
            Ok(())
        },
        Ok(codes) => {
            health.record_failure();
            let code = codes.first().copied().unwrap_or(0);
            warn!(code, "watchdog write rejected by PLC");
            Err(S7Error::ItemError(code))
        },
        Err(e) => {
            health.record_failure();
            let err = S7Error::WatchdogFailed(e.to_string());
            warn!(error = %err, "watchdog write failed");
            Err(err)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_address_accepts_word() {
        assert!(validate_address("DB1.DBW0").is_ok());
    }

    #[test]
    fn validate_address_rejects_bit() {
        assert!(validate_address("DB1.DBX0.0").is_err());
    }

    #[test]
    fn validate_address_rejects_byte() {
        assert!(validate_address("DB1.DBB0").is_err());
    }

    #[test]
    fn validate_address_rejects_non_data_block_area() {
        assert!(validate_address("MW0").is_err());
    }

    #[test]
    fn health_resets_on_success() {
        let mut health = WatchdogHealth::default();
        health.record_failure();
        health.record_failure();
        assert_eq!(health.consecutive_failures(), 2);
        health.record_ok();
        assert_eq!(health.consecutive_failures(), 0);
    }
}
