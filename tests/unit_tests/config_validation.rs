// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use s7_tags_rs::cfg::{
    config::{BackoffConfig, Config, WatchdogConfig},
    enums::CpuFamily,
};

fn base_config() -> Config {
    Config {
        endpoint: "127.0.0.1:102".parse().unwrap(),
        cpu_family: CpuFamily::S71200,
        rack: None,
        slot: None,
        poll_interval: Duration::from_millis(500),
        connect_timeout: Duration::from_secs(3),
        read_timeout: Duration::from_secs(1),
        write_timeout: Duration::from_secs(1),
        proposed_pdu_length: 480,
        watchdog: None,
        backoff: BackoffConfig::default(),
    }
}

#[test]
fn missing_rack_slot_defaults_from_cpu_family() {
    let mut cfg = base_config();
    cfg.validate_and_normalize().unwrap();
    assert_eq!(cfg.rack_slot(), (0, 1));
}

#[test]
fn s300_defaults_to_slot_two() {
    let mut cfg = base_config();
    cfg.cpu_family = CpuFamily::S7300;
    cfg.validate_and_normalize().unwrap();
    assert_eq!(cfg.rack_slot(), (0, 2));
}

#[test]
fn rack_out_of_range_is_rejected() {
    let mut cfg = base_config();
    cfg.rack = Some(8);
    assert!(cfg.validate_and_normalize().is_err());
}

#[test]
fn slot_zero_is_rejected() {
    let mut cfg = base_config();
    cfg.slot = Some(0);
    assert!(cfg.validate_and_normalize().is_err());
}

#[test]
fn zero_pdu_length_is_rejected() {
    let mut cfg = base_config();
    cfg.proposed_pdu_length = 0;
    assert!(cfg.validate_and_normalize().is_err());
}

#[test]
fn watchdog_address_must_be_a_data_block_word() {
    let mut cfg = base_config();
    cfg.watchdog = Some(WatchdogConfig {
        address: "I0.0".to_string(),
        value: 1,
        interval: Duration::from_secs(1),
    });
    assert!(cfg.validate_and_normalize().is_err());
}

#[test]
fn watchdog_address_rejects_sub_word_width() {
    let mut cfg = base_config();
    cfg.watchdog = Some(WatchdogConfig {
        address: "DB1.DBX0.0".to_string(),
        value: 1,
        interval: Duration::from_secs(1),
    });
    assert!(cfg.validate_and_normalize().is_err());
}

#[test]
fn watchdog_address_accepts_db_word() {
    let mut cfg = base_config();
    cfg.watchdog = Some(WatchdogConfig {
        address: "DB1.DBW100".to_string(),
        value: 1,
        interval: Duration::from_secs(1),
    });
    assert!(cfg.validate_and_normalize().is_ok());
}
