// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Event surface: per-tag change notifications, aggregate snapshots,
//! connection-status transitions, and error reporting.
//!
//! All streams are built on `tokio::sync::broadcast` so a slow or absent
//! subscriber never blocks the poll scheduler; a lagging receiver simply
//! observes a `Lagged` gap and resumes from the next published value.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::{error::S7Error, protocol::value::Value};

const CHANNEL_CAPACITY: usize = 256;

/// One tag's value changed on the most recent poll tick.
#[derive(Debug, Clone)]
pub struct TagChange {
    pub name: Arc<str>,
    pub value: Value,
}

/// A full snapshot of every poll-enabled tag's last known value, published
/// once per tick regardless of whether any individual tag changed.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub values: HashMap<Arc<str>, Value>,
}

/// Connection lifecycle transitions, mirrored from the connection state
/// machine for subscribers that only care about up/down status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Negotiating,
    Connected,
    Faulted,
}

/// A single tag's read or write failed.
#[derive(Debug, Clone)]
pub struct TagError {
    pub name: Arc<str>,
    pub error: S7Error,
}

/// The result of `subscribe_changes`: every tag's last known value as of
/// subscription time, then a live receiver for changes from that point
/// on — so a subscriber never has to wait for the next tick to learn
/// where a tag currently stands.
pub struct ChangeSubscription {
    pub initial: Vec<TagChange>,
    pub rx: broadcast::Receiver<TagChange>,
}

/// The shared publish side of every event stream. Cloning is cheap
/// (each field is an `Arc`-backed sender or `Arc`-backed cache); every
/// clone publishes to the same set of subscribers and shares the same
/// last-value cache.
#[derive(Debug, Clone)]
pub struct EventSurface {
    changes: broadcast::Sender<TagChange>,
    snapshots: broadcast::Sender<Snapshot>,
    status: broadcast::Sender<ConnectionStatus>,
    errors: broadcast::Sender<TagError>,
    last_values: Arc<DashMap<Arc<str>, Value>>,
    last_snapshot: Arc<RwLock<Option<Snapshot>>>,
}

impl Default for EventSurface {
    fn default() -> Self {
        EventSurface {
            changes: broadcast::channel(CHANNEL_CAPACITY).0,
            snapshots: broadcast::channel(CHANNEL_CAPACITY).0,
            status: broadcast::channel(CHANNEL_CAPACITY).0,
            errors: broadcast::channel(CHANNEL_CAPACITY).0,
            last_values: Arc::new(DashMap::new()),
            last_snapshot: Arc::new(RwLock::new(None)),
        }
    }
}

impl EventSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every tag's last known value as of now, plus a receiver for
    /// changes published after this call.
    pub fn subscribe_changes(&self) -> ChangeSubscription {
        let initial = self
            .last_values
            .iter()
            .map(|e| TagChange { name: e.key().clone(), value: e.value().clone() })
            .collect();
        ChangeSubscription { initial, rx: self.changes.subscribe() }
    }

    /// The last published snapshot (`None` if no tick has completed yet),
    /// plus a receiver for snapshots published after this call.
    pub fn subscribe_snapshots(&self) -> (Option<Snapshot>, broadcast::Receiver<Snapshot>) {
        let last = self.last_snapshot.read().expect("last_snapshot lock poisoned").clone();
        (last, self.snapshots.subscribe())
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<TagError> {
        self.errors.subscribe()
    }

    /// Publishes a change, caching it as the tag's latest value for the
    /// next `subscribe_changes` call. A send with no subscribers is not
    /// an error; the event is simply dropped.
    pub fn publish_change(&self, name: Arc<str>, value: Value) {
        self.last_values.insert(name.clone(), value.clone());
        let _ = self.changes.send(TagChange { name, value });
    }

    pub fn publish_snapshot(&self, values: HashMap<Arc<str>, Value>) {
        let snapshot = Snapshot { values };
        *self.last_snapshot.write().expect("last_snapshot lock poisoned") = Some(snapshot.clone());
        let _ = self.snapshots.send(snapshot);
    }

    pub fn publish_status(&self, status: ConnectionStatus) {
        let _ = self.status.send(status);
    }

    pub fn publish_error(&self, name: Arc<str>, error: S7Error) {
        let _ = self.errors.send(TagError { name, error });
    }
}
