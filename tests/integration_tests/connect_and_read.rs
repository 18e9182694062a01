// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use s7_tags_rs::{
    client::connection::Connection,
    error::ITEM_OK,
    protocol::{frame::ReadItem, location::Location, value::DataType},
};
use tokio_util::sync::CancellationToken;

use super::common::{bind_loopback, spawn_fake_plc, test_config};

#[tokio::test]
async fn connect_negotiates_and_reads_a_word_tag() {
    let (listener, addr) = bind_loopback().await;
    spawn_fake_plc(listener, vec![0x01, 0x02]);

    let cfg = test_config(addr);
    let cancel = CancellationToken::new();

    let conn = Connection::connect(&cfg, &cancel).await.unwrap();
    assert_eq!(conn.session_info().pdu_size_negotiated, 480);

    let items = vec![ReadItem {
        location: Location::parse("DB1.DBW0").unwrap(),
        data_type: DataType::Word,
    }];
    let results = conn.read_var(&items, &cancel).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].return_code, ITEM_OK);
    assert_eq!(results[0].payload, vec![0x01, 0x02]);
}
