// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use s7_tags_rs::{
    protocol::{area::Area, location::Location, value::DataType},
    registry::Registry,
};

fn word_at(db: u16, byte: u32) -> Location {
    Location::byte(Area::DataBlock, db, byte, 16)
}

#[test]
fn concurrent_registration_of_the_same_name_converges_to_one_tag() {
    let registry = Arc::new(Registry::new());
    let mut handles = Vec::new();
    for i in 0..16 {
        let registry = registry.clone();
        handles.push(std::thread::spawn(move || {
            registry
                .add_or_update("shared", word_at(1, i), DataType::Word)
                .unwrap();
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(registry.len(), 1);
    assert!(registry.get("shared").is_some());
}

#[test]
fn distinct_names_produce_distinct_tags() {
    let registry = Registry::new();
    registry.add_or_update("a", word_at(1, 0), DataType::Word).unwrap();
    registry.add_or_update("b", word_at(1, 2), DataType::Word).unwrap();
    assert_eq!(registry.len(), 2);
}

#[test]
fn removed_tag_can_be_re_registered_under_the_same_name() {
    let registry = Registry::new();
    registry.add_or_update("t", word_at(1, 0), DataType::Word).unwrap();
    assert!(registry.remove("t").unwrap());
    assert!(registry.get("t").is_none());
    registry.add_or_update("t", word_at(2, 4), DataType::Word).unwrap();
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.get("t").unwrap().location, word_at(2, 4));
}
