// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! An async client for Siemens S7 PLCs: textual tag addresses, a
//! concurrent tag registry, batched ReadVar/WriteVar polling, automatic
//! reconnection with backoff, an optional watchdog, and a broadcast
//! event surface.

/// Configuration and logging.
pub mod cfg;
/// TCP socket lifecycle, COTP/S7 negotiation, and request/response framing.
pub mod client;
/// Error taxonomy.
pub mod error;
/// Per-tag change notifications, snapshots, status, and error streams.
pub mod events;
/// Batching planner turning a tag snapshot into ReadVar/WriteVar PDUs.
pub mod planner;
/// Wire protocol: addresses, the data codec, and the frame codec.
pub mod protocol;
/// Concurrent tag registry.
pub mod registry;
/// Poll scheduler driving periodic reads/writes and the watchdog.
pub mod scheduler;
/// Connection lifecycle state machine.
pub mod state_machine;
/// Watchdog liveness writes.
pub mod watchdog;

use std::sync::Arc;

use anyhow::Result;
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    cfg::config::Config,
    error::S7Error,
    events::{ChangeSubscription, ConnectionStatus, EventSurface, TagError},
    protocol::{location::Location, value::DataType, value::Value},
    registry::{Registry, TagHandle},
    scheduler::Scheduler,
    state_machine::conn_states::run_connect,
};

/// The public entry point: owns the tag registry, drives a background
/// supervisor task that holds the connection alive (reconnecting with
/// backoff on fault), and exposes tag CRUD, writes, forced reads, and
/// the event surface.
pub struct Client {
    registry: Arc<Registry>,
    events: EventSurface,
    cancel: CancellationToken,
    current_scheduler: Arc<RwLock<Option<Arc<Scheduler>>>>,
    supervisor: JoinHandle<()>,
}

impl Client {
    /// Starts the background supervisor and returns immediately; the
    /// first connection attempt happens asynchronously. Callers that
    /// need to know when the link comes up should subscribe to
    /// `subscribe_status`. Fails without spawning anything if `cfg`
    /// doesn't pass `Config::validate_and_normalize` — `load_from_file`
    /// already normalizes, but a caller building a `Config` by hand
    /// would otherwise reach the supervisor loop unvalidated.
    pub fn start(mut cfg: Config) -> Result<Self> {
        cfg.validate_and_normalize()?;

        let registry = Arc::new(Registry::new());
        let events = EventSurface::new();
        let cancel = CancellationToken::new();
        let current_scheduler: Arc<RwLock<Option<Arc<Scheduler>>>> = Arc::new(RwLock::new(None));

        let supervisor = tokio::spawn(supervisor_loop(
            cfg,
            registry.clone(),
            events.clone(),
            cancel.clone(),
            current_scheduler.clone(),
        ));

        Ok(Client {
            registry,
            events,
            cancel,
            current_scheduler,
            supervisor,
        })
    }

    /// Registers a tag, or updates its location/type if the name already
    /// exists.
    pub fn add_or_update_tag(
        &self,
        name: &str,
        location: Location,
        data_type: DataType,
    ) -> Result<TagHandle, S7Error> {
        self.registry.add_or_update(name, location, data_type)
    }

    pub fn remove_tag(&self, name: &str) -> Result<bool, S7Error> {
        self.registry.remove(name)
    }

    pub fn set_poll(&self, name: &str, enabled: bool) -> Result<(), S7Error> {
        self.registry.set_poll(name, enabled)
    }

    /// Queues a value to be written on the next scheduler tick.
    pub fn write(&self, name: &str, value: Value) -> Result<(), S7Error> {
        self.registry.write(name, value)
    }

    /// Forces an immediate single-tag read using whatever connection is
    /// currently live. Fails with `TransportClosed` if no connection is
    /// up yet.
    pub async fn read_now(&self, name: &str) -> Result<Value, S7Error> {
        let scheduler = self.current_scheduler.read().await.clone();
        let scheduler = scheduler.ok_or(S7Error::TransportClosed)?;
        scheduler.read_now(name, &self.cancel).await
    }

    /// Every tag's last known value as of now, plus a live receiver for
    /// changes from this point on.
    pub fn subscribe_changes(&self) -> ChangeSubscription {
        self.events.subscribe_changes()
    }

    /// The last published snapshot (if any), plus a live receiver for
    /// snapshots from this point on.
    pub fn subscribe_snapshots(&self) -> (Option<events::Snapshot>, tokio::sync::broadcast::Receiver<events::Snapshot>) {
        self.events.subscribe_snapshots()
    }

    pub fn subscribe_status(&self) -> tokio::sync::broadcast::Receiver<ConnectionStatus> {
        self.events.subscribe_status()
    }

    pub fn subscribe_errors(&self) -> tokio::sync::broadcast::Receiver<TagError> {
        self.events.subscribe_errors()
    }

    /// Stops the supervisor task and waits for it to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.supervisor.await;
    }
}

/// Repeatedly connects (with backoff handled inside `run_connect`),
/// builds a fresh `Scheduler` around the new connection, and runs it
/// until it reports a fault or the token is cancelled — at which point
/// it reconnects, unless cancelled.
async fn supervisor_loop(
    cfg: Config,
    registry: Arc<Registry>,
    events: EventSurface,
    cancel: CancellationToken,
    current_scheduler: Arc<RwLock<Option<Arc<Scheduler>>>>,
) {
    events.publish_status(ConnectionStatus::Disconnected);
    while !cancel.is_cancelled() {
        let connection = match run_connect(&cfg, &cancel, &events).await {
            Ok(conn) => conn,
            Err(e) => {
                if cancel.is_cancelled() {
                    break;
                }
                warn!(error = %e, "giving up on connection attempt");
                continue;
            },
        };
        info!("connected");

        let scheduler = Arc::new(Scheduler::new(Arc::new(connection), registry.clone(), events.clone(), &cfg));
        *current_scheduler.write().await = Some(scheduler.clone());

        match scheduler.run(&cancel).await {
            Ok(()) => {
                // Cancelled cleanly.
                break;
            },
            Err(fault) => {
                warn!(error = %fault.0, "connection faulted, reconnecting");
                events.publish_status(ConnectionStatus::Faulted);
            },
        }

        *current_scheduler.write().await = None;
    }
    events.publish_status(ConnectionStatus::Disconnected);
}
