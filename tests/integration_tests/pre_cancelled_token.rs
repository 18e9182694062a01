// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use s7_tags_rs::client::connection::Connection;
use tokio_util::sync::CancellationToken;

use super::common::test_config;

/// A pre-cancelled token must short-circuit `Connection::connect` before
/// any socket is opened, even against an address nothing is listening on.
#[tokio::test]
async fn connect_rejects_a_pre_cancelled_token_without_touching_the_network() {
    let cfg = test_config("127.0.0.1:1".parse().unwrap());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = Connection::connect(&cfg, &cancel).await;
    assert!(result.is_err());
}
