// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Tag Registry: a concurrent map keyed by tag name.
//!
//! The registry is the only shared mutable structure in the crate; it is
//! guarded only for the short upsert/remove/snapshot critical sections
//! `dashmap::DashMap` already serializes internally.

use std::sync::Arc;

use dashmap::DashMap;

use crate::{
    error::S7Error,
    protocol::{location::Location, value::DataType, value::Value},
};

/// A registered tag. Created on registration, mutated only by the poll
/// scheduler and the public `write`/`set_poll` operations, destroyed on
/// removal or registry shutdown.
#[derive(Debug, Clone)]
pub struct Tag {
    pub name: Arc<str>,
    pub location: Location,
    pub data_type: DataType,
    pub poll_enabled: bool,
    pub last_raw: Option<Vec<u8>>,
    pub last_value: Option<Value>,
    pub pending_write: Option<Value>,
    pub last_error: Option<S7Error>,
}

impl Tag {
    fn new(name: Arc<str>, location: Location, data_type: DataType) -> Self {
        Tag {
            name,
            location,
            data_type,
            poll_enabled: true,
            last_raw: None,
            last_value: None,
            pending_write: None,
            last_error: None,
        }
    }
}

/// A cheap, cloneable reference to a registered tag's name, returned by
/// `add_or_update` for callers that want to avoid repeating string
/// lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TagHandle {
    pub name: Arc<str>,
}

/// Concurrent tag registry, owned by a single `Connection`/scheduler pair.
#[derive(Debug, Default)]
pub struct Registry {
    tags: DashMap<Arc<str>, Tag>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            tags: DashMap::new(),
        }
    }

    /// Upserts a tag's location/type. Registering an existing name updates
    /// that tag in place rather than creating a second entry.
    pub fn add_or_update(
        &self,
        name: &str,
        location: Location,
        data_type: DataType,
    ) -> Result<TagHandle, S7Error> {
        if name.is_empty() {
            return Err(S7Error::BadName(name.to_string()));
        }
        let name: Arc<str> = Arc::from(name);
        match self.tags.get_mut(&name) {
            Some(mut existing) => {
                existing.location = location;
                existing.data_type = data_type;
            },
            None => {
                self.tags.insert(name.clone(), Tag::new(name.clone(), location, data_type));
            },
        }
        Ok(TagHandle { name })
    }

    /// Removes a tag if present; fails with `BadName` for an empty name.
    pub fn remove(&self, name: &str) -> Result<bool, S7Error> {
        if name.is_empty() {
            return Err(S7Error::BadName(name.to_string()));
        }
        Ok(self.tags.remove(name).is_some())
    }

    pub fn get(&self, name: &str) -> Option<Tag> {
        self.tags.get(name).map(|r| r.clone())
    }

    pub fn set_poll(&self, name: &str, enabled: bool) -> Result<(), S7Error> {
        self.tags
            .get_mut(name)
            .map(|mut t| t.poll_enabled = enabled)
            .ok_or_else(|| S7Error::UnknownTag(name.to_string()))
    }

    /// Queues a value for the next scheduler tick's write batch.
    pub fn write(&self, name: &str, value: Value) -> Result<(), S7Error> {
        let mut entry = self
            .tags
            .get_mut(name)
            .ok_or_else(|| S7Error::UnknownTag(name.to_string()))?;
        value.check_type(&entry.data_type)?;
        entry.pending_write = Some(value);
        Ok(())
    }

    /// Snapshots every poll-enabled tag. Taken atomically with respect to
    /// concurrent add/remove so a batch being built never observes a
    /// half-finished mutation; adds/removes that race a snapshot simply
    /// land before or after it, never mid-tag.
    pub fn snapshot_poll_enabled(&self) -> Vec<Tag> {
        self.tags
            .iter()
            .filter(|t| t.poll_enabled)
            .map(|t| t.clone())
            .collect()
    }

    /// Drains every tag with a pending write, clearing `pending_write` on
    /// each. Writes are not reordered relative to each other.
    pub fn drain_pending_writes(&self) -> Vec<Tag> {
        let mut drained = Vec::new();
        for mut entry in self.tags.iter_mut() {
            if entry.pending_write.is_some() {
                let mut tag = entry.clone();
                tag.pending_write = entry.pending_write.take();
                drained.push(tag);
            }
        }
        drained
    }

    /// Applies a successful read: updates `last_raw`/`last_value`, clears
    /// `last_error`. Returns `true` if the decoded value changed.
    pub fn apply_read_ok(&self, name: &str, raw: Vec<u8>, value: Value) -> bool {
        let Some(mut tag) = self.tags.get_mut(name) else {
            return false;
        };
        let changed = tag.last_value.as_ref() != Some(&value);
        tag.last_raw = Some(raw);
        tag.last_value = Some(value);
        tag.last_error = None;
        changed
    }

    /// Records a per-tag read error without touching `last_value`.
    pub fn apply_read_error(&self, name: &str, error: S7Error) {
        if let Some(mut tag) = self.tags.get_mut(name) {
            tag.last_error = Some(error);
        }
    }

    /// Clears a tag's pending write after a successful or failed attempt.
    pub fn clear_pending_write(&self, name: &str) {
        if let Some(mut tag) = self.tags.get_mut(name) {
            tag.pending_write = None;
        }
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::area::Area;

    fn loc() -> Location {
        Location::byte(Area::DataBlock, 1, 0, 16)
    }

    #[test]
    fn add_or_update_is_idempotent_by_name() {
        let reg = Registry::new();
        reg.add_or_update("T", loc(), DataType::Word).unwrap();
        let loc2 = Location::byte(Area::DataBlock, 1, 2, 16);
        reg.add_or_update("T", loc2, DataType::Word).unwrap();
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("T").unwrap().location, loc2);
    }

    #[test]
    fn remove_rejects_empty_name() {
        let reg = Registry::new();
        assert!(reg.remove("").is_err());
    }

    #[test]
    fn write_rejects_unknown_tag() {
        let reg = Registry::new();
        assert!(matches!(
            reg.write("nope", Value::U16(1)),
            Err(S7Error::UnknownTag(_))
        ));
    }

    #[test]
    fn write_rejects_type_mismatch() {
        let reg = Registry::new();
        reg.add_or_update("T", loc(), DataType::Word).unwrap();
        assert!(matches!(
            reg.write("T", Value::Bool(true)),
            Err(S7Error::TypeMismatch { .. })
        ));
    }
}
