// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use s7_tags_rs::{events::EventSurface, state_machine::conn_states::run_connect};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::common::{spawn_handshake_only_plc, test_config};

/// The first connection attempt is refused (nothing is listening yet);
/// `run_connect`'s backoff loop must retry and succeed once a listener
/// appears, without the caller doing anything beyond awaiting it once.
#[tokio::test]
async fn run_connect_retries_past_a_transient_refusal() {
    let port = 18765;
    let addr: std::net::SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
    let cfg = test_config(addr);
    let cancel = CancellationToken::new();
    let events = EventSurface::new();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        let listener = TcpListener::bind(addr).await.unwrap();
        spawn_handshake_only_plc(listener);
    });

    let result = run_connect(&cfg, &cancel, &events).await;
    assert!(result.is_ok(), "expected run_connect to recover: {result:?}");
}
