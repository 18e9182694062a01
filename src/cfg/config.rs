// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, net::SocketAddr, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::{cfg::enums::CpuFamily, protocol::area::Area, protocol::location::Location};

/// Default ISO-on-TCP port.
pub const DEFAULT_PORT: u16 = 102;

/// Default proposed PDU length sent during Setup Communication.
pub const DEFAULT_PDU_LENGTH: u16 = 960;

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// TCP endpoint of the PLC (ISO-on-TCP, conventionally port 102).
    #[serde(rename = "Endpoint")]
    pub endpoint: SocketAddr,

    /// CPU family, used only to pick a default rack/slot when unset.
    #[serde(rename = "CpuFamily")]
    pub cpu_family: CpuFamily,

    /// COTP rack number, 0..7.
    #[serde(rename = "Rack", default)]
    pub rack: Option<u8>,

    /// COTP slot number, 1..31 (0 is reserved and rejected).
    #[serde(rename = "Slot", default)]
    pub slot: Option<u8>,

    /// Poll scheduler tick interval.
    #[serde(rename = "PollInterval", with = "serde_millis")]
    pub poll_interval: Duration,

    /// Timeout for the initial TCP connect.
    #[serde(rename = "ConnectTimeout", with = "serde_millis")]
    pub connect_timeout: Duration,

    /// Timeout applied to each ReadVar round trip.
    #[serde(rename = "ReadTimeout", with = "serde_millis")]
    pub read_timeout: Duration,

    /// Timeout applied to each WriteVar round trip.
    #[serde(rename = "WriteTimeout", with = "serde_millis")]
    pub write_timeout: Duration,

    /// Proposed PDU length offered during Setup Communication.
    #[serde(rename = "ProposedPduLength", default = "default_pdu_length")]
    pub proposed_pdu_length: u16,

    /// Optional liveness watchdog.
    #[serde(rename = "Watchdog", default)]
    pub watchdog: Option<WatchdogConfig>,

    /// Backoff policy for reconnection attempts.
    #[serde(rename = "Backoff", default)]
    pub backoff: BackoffConfig,
}

fn default_pdu_length() -> u16 {
    DEFAULT_PDU_LENGTH
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct WatchdogConfig {
    /// Textual DB-word address the watchdog value is written to, e.g.
    /// `DB1.DBW100`.
    #[serde(rename = "Address")]
    pub address: String,

    /// Value written on every tick.
    #[serde(rename = "Value")]
    pub value: u16,

    /// Tick interval.
    #[serde(rename = "Interval", with = "serde_millis")]
    pub interval: Duration,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct BackoffConfig {
    #[serde(rename = "InitialDelay", with = "serde_millis", default = "default_initial_delay")]
    pub initial_delay: Duration,
    #[serde(rename = "MaxDelay", with = "serde_millis", default = "default_max_delay")]
    pub max_delay: Duration,
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
        }
    }
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and fills in CPU-family-derived defaults.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        let (default_rack, default_slot) = self.cpu_family.default_rack_slot();
        let rack = self.rack.unwrap_or(default_rack);
        let slot = self.slot.unwrap_or(default_slot);

        ensure!(rack <= 7, "rack must be in 0..=7, got {rack}");
        ensure!(slot >= 1 && slot <= 31, "slot must be in 1..=31, got {slot}");
        self.rack = Some(rack);
        self.slot = Some(slot);

        ensure!(
            self.proposed_pdu_length > 0,
            "proposed_pdu_length must be > 0"
        );

        if let Some(wd) = &self.watchdog {
            let loc = Location::parse(&wd.address)
                .with_context(|| format!("invalid watchdog address {:?}", wd.address))?;
            ensure!(
                matches!(loc.area, Area::DataBlock),
                "watchdog address must be a DB word address, got {:?}",
                wd.address
            );
            ensure!(
                loc.bit_offset == 0 && loc.width_bits == 16,
                "watchdog address must address exactly one word (DBW), got {:?}",
                wd.address
            );
        }

        Ok(())
    }

    /// Rack/slot as resolved by `validate_and_normalize` (panics if called
    /// before normalization — callers always normalize on load).
    pub fn rack_slot(&self) -> (u8, u8) {
        (
            self.rack.unwrap_or(self.cpu_family.default_rack_slot().0),
            self.slot.unwrap_or(self.cpu_family.default_rack_slot().1),
        )
    }
}

/// Serde helper representing a `Duration` as milliseconds, the unit the
/// rest of the configuration schema uses for every timing field.
mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}
