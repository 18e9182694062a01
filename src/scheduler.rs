// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Poll scheduler: the periodic tick loop that drains pending writes,
//! executes read batches planned by `planner`, decodes and compares
//! values against the registry, and publishes changes on the event
//! surface. Also drives the optional watchdog on the same cadence.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    cfg::config::{Config, WatchdogConfig},
    client::connection::Connection,
    error::S7Error,
    events::{ConnectionStatus, EventSurface},
    planner::{plan_reads, plan_writes, stitch_split_reads},
    protocol::{
        frame::{ReadItem, WriteItem},
        primitive,
        value::Value,
    },
    registry::Registry,
    watchdog::{self, WatchdogHealth},
};

/// The factor applied to `poll_interval` to derive the per-tick deadline
/// passed down to each batch's I/O timeout.
const TICK_DEADLINE_FACTOR: u32 = 2;

/// Signals the tick loop ended because the connection itself is no
/// longer usable; the caller is expected to reconnect and start a fresh
/// `Scheduler` around the new `Connection`.
#[derive(Debug)]
pub struct ConnectionFaulted(pub anyhow::Error);

pub struct Scheduler {
    connection: Arc<Connection>,
    registry: Arc<Registry>,
    events: EventSurface,
    poll_interval: Duration,
    watchdog_cfg: Option<WatchdogConfig>,
}

impl Scheduler {
    pub fn new(
        connection: Arc<Connection>,
        registry: Arc<Registry>,
        events: EventSurface,
        cfg: &Config,
    ) -> Self {
        Scheduler {
            connection,
            registry,
            events,
            poll_interval: cfg.poll_interval,
            watchdog_cfg: cfg.watchdog.clone(),
        }
    }

    /// Runs ticks until `cancel` fires or the connection faults.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), ConnectionFaulted> {
        let mut interval = tokio::time::interval(self.poll_interval);
        let mut watchdog_health = WatchdogHealth::default();
        let watchdog_location = match &self.watchdog_cfg {
            Some(wd) => match watchdog::validate_address(&wd.address) {
                Ok(loc) => Some(loc),
                Err(e) => {
                    error!(error = %e, "watchdog address invalid, disabling watchdog");
                    None
                },
            },
            None => None,
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = interval.tick() => {},
            }

            let deadline = self.poll_interval * TICK_DEADLINE_FACTOR;
            if let Err(fault) = self.run_one_tick(cancel, deadline).await {
                return Err(fault);
            }

            if let (Some(wd), Some(loc)) = (&self.watchdog_cfg, watchdog_location) {
                let _ = watchdog::tick(&self.connection, wd, loc, &mut watchdog_health, cancel).await;
            }
        }
    }

    async fn run_one_tick(
        &self,
        cancel: &CancellationToken,
        deadline: Duration,
    ) -> Result<(), ConnectionFaulted> {
        self.drain_writes(cancel, deadline).await?;
        self.poll_reads(cancel, deadline).await?;
        Ok(())
    }

    async fn drain_writes(
        &self,
        cancel: &CancellationToken,
        deadline: Duration,
    ) -> Result<(), ConnectionFaulted> {
        let pending = self.registry.drain_pending_writes();
        if pending.is_empty() {
            return Ok(());
        }
        let mut encoded = Vec::with_capacity(pending.len());
        for tag in &pending {
            match tag.pending_write.as_ref() {
                Some(v) => match primitive::encode(&tag.data_type, v) {
                    Ok(bytes) => encoded.push((tag.clone(), bytes)),
                    Err(e) => {
                        self.registry.apply_read_error(&tag.name, e.clone());
                        self.events.publish_error(tag.name.clone(), e);
                    },
                },
                None => {},
            }
        }
        let session = self.connection.session_info();
        let batches = plan_writes(&encoded, session.pdu_size_negotiated);
        for batch in batches {
            let items: Vec<WriteItem> = batch
                .items
                .iter()
                .map(|p| WriteItem {
                    location: p.tag.location,
                    data_type: p.tag.data_type.clone(),
                    data: p.encoded.clone(),
                })
                .collect();
            let result = tokio::time::timeout(deadline, self.connection.write_var(&items, cancel)).await;
            let codes = match result {
                Ok(Ok(codes)) => codes,
                Ok(Err(e)) => {
                    if let Some(s7) = e.downcast_ref::<S7Error>()
                        && s7.is_connection_fatal()
                    {
                        return Err(ConnectionFaulted(e));
                    }
                    warn!(error = %e, "write batch failed");
                    for p in &batch.items {
                        self.registry.clear_pending_write(&p.name);
                    }
                    continue;
                },
                Err(_) => {
                    warn!("write batch deadline exceeded");
                    for p in &batch.items {
                        self.registry.clear_pending_write(&p.name);
                    }
                    continue;
                },
            };
            for (planned, code) in batch.items.iter().zip(codes.iter()) {
                self.registry.clear_pending_write(&planned.name);
                if *code != crate::error::ITEM_OK {
                    let err = S7Error::ItemError(*code);
                    self.registry.apply_read_error(&planned.name, err.clone());
                    self.events.publish_error(planned.name.clone(), err);
                }
            }
        }
        Ok(())
    }

    async fn poll_reads(
        &self,
        cancel: &CancellationToken,
        deadline: Duration,
    ) -> Result<(), ConnectionFaulted> {
        let tags = self.registry.snapshot_poll_enabled();
        if tags.is_empty() {
            return Ok(());
        }
        let session = self.connection.session_info();
        let batches = plan_reads(&tags, session.pdu_size_negotiated);
        let mut snapshot = HashMap::new();
        // Split tags land across possibly several batches; their legs are
        // buffered here by name until every `split_index` has arrived.
        let mut split_parts: HashMap<Arc<str>, Vec<Option<Vec<u8>>>> = HashMap::new();

        for batch in batches {
            let items: Vec<ReadItem> = batch
                .items
                .iter()
                .map(|p| ReadItem { location: p.location, data_type: p.item_data_type() })
                .collect();
            let result = tokio::time::timeout(deadline, self.connection.read_var(&items, cancel)).await;
            let results = match result {
                Ok(Ok(r)) => r,
                Ok(Err(e)) => {
                    if let Some(s7) = e.downcast_ref::<S7Error>()
                        && s7.is_connection_fatal()
                    {
                        return Err(ConnectionFaulted(e));
                    }
                    warn!(error = %e, "read batch failed");
                    continue;
                },
                Err(_) => {
                    warn!("read batch deadline exceeded");
                    continue;
                },
            };

            for (planned, item) in batch.items.iter().zip(results.iter()) {
                if item.return_code != crate::error::ITEM_OK {
                    let err = S7Error::ItemError(item.return_code);
                    self.registry.apply_read_error(&planned.name, err.clone());
                    self.events.publish_error(planned.name.clone(), err);
                    continue;
                }
                if planned.split_total <= 1 {
                    match primitive::decode(&planned.tag.data_type, &item.payload) {
                        Ok(value) => {
                            let changed = self.registry.apply_read_ok(
                                &planned.name,
                                item.payload.clone(),
                                value.clone(),
                            );
                            if changed {
                                self.events.publish_change(planned.name.clone(), value.clone());
                            }
                            snapshot.insert(planned.name.clone(), value);
                        },
                        Err(e) => {
                            self.registry.apply_read_error(&planned.name, e.clone());
                            self.events.publish_error(planned.name.clone(), e);
                        },
                    }
                } else {
                    let parts = split_parts
                        .entry(planned.name.clone())
                        .or_insert_with(|| vec![None; planned.split_total as usize]);
                    parts[planned.split_index as usize] = Some(item.payload.clone());
                }
            }
        }

        for (name, parts) in split_parts {
            if parts.iter().any(Option::is_none) {
                let err = S7Error::MalformedFrame(format!("incomplete split read for tag {name}"));
                self.registry.apply_read_error(&name, err.clone());
                self.events.publish_error(name.clone(), err);
                continue;
            }
            let Some(tag) = self.registry.get(&name) else { continue };
            let stitched = stitch_split_reads(parts.into_iter().flatten().collect());
            match primitive::decode(&tag.data_type, &stitched) {
                Ok(value) => {
                    let changed = self.registry.apply_read_ok(&name, stitched.clone(), value.clone());
                    if changed {
                        self.events.publish_change(name.clone(), value.clone());
                    }
                    snapshot.insert(name.clone(), value);
                },
                Err(e) => {
                    self.registry.apply_read_error(&name, e.clone());
                    self.events.publish_error(name.clone(), e);
                },
            }
        }

        debug!(tags = snapshot.len(), "poll tick complete");
        self.events.publish_snapshot(snapshot);
        Ok(())
    }

    /// Forces an immediate single-tag read, bypassing the tick cadence.
    /// Uses the same batching machinery with a one-item batch.
    pub async fn read_now(&self, name: &str, cancel: &CancellationToken) -> Result<Value, S7Error> {
        let tag = self
            .registry
            .get(name)
            .ok_or_else(|| S7Error::UnknownTag(name.to_string()))?;
        let item = ReadItem {
            location: tag.location,
            data_type: tag.data_type.clone(),
        };
        let results = self
            .connection
            .read_var(std::slice::from_ref(&item), cancel)
            .await
            .map_err(|e| S7Error::MalformedFrame(e.to_string()))?;
        let result = results
            .first()
            .ok_or_else(|| S7Error::MalformedFrame("empty ReadVar response".into()))?;
        if result.return_code != crate::error::ITEM_OK {
            return Err(S7Error::ItemError(result.return_code));
        }
        let value = primitive::decode(&tag.data_type, &result.payload)?;
        let changed = self.registry.apply_read_ok(name, result.payload.clone(), value.clone());
        if changed {
            self.events.publish_change(Arc::from(name), value.clone());
        }
        Ok(value)
    }

    pub fn publish_status(&self, status: ConnectionStatus) {
        self.events.publish_status(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_deadline_factor_is_positive() {
        assert!(TICK_DEADLINE_FACTOR > 0);
    }
}
