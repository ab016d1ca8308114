//! Device inventories
//!
//! A device's entities grouped by `(domain, functional key)`. Built once per
//! device roster and cached by the broker until the roster changes.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use flux_core::EntityId;
use tracing::warn;

use crate::classifier::{classify, FunctionalKey};

/// A device id in the hub's device registry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// An entity discovered on a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRef {
    pub id: EntityId,
    pub domain: String,
    pub owning_device: Option<DeviceId>,
}

impl EntityRef {
    pub fn new(id: EntityId, owning_device: Option<DeviceId>) -> Self {
        Self {
            domain: id.domain().to_string(),
            id,
            owning_device,
        }
    }
}

/// A device's entities keyed by `(domain, functional key)`
#[derive(Debug, Clone, Default)]
pub struct DeviceInventory {
    entries: BTreeMap<(String, FunctionalKey), EntityRef>,
    keys: HashMap<EntityId, FunctionalKey>,
}

impl DeviceInventory {
    /// Classify and group a device's entities
    ///
    /// A numeric entity classified as a bare `zone_N` is a run-time setting
    /// and is re-keyed to `zone_N_duration`. When two entities land on the
    /// same `(domain, key)` the later one wins.
    pub fn build<'a>(
        device: Option<&DeviceId>,
        entity_ids: impl IntoIterator<Item = &'a EntityId>,
    ) -> Self {
        let mut inventory = Self::default();

        for id in entity_ids {
            let mut key = classify(&id.to_string());
            if matches!(id.domain(), "number" | "input_number") && key.is_zone() {
                key = FunctionalKey::new(format!("{key}_duration"));
            }

            let slot = (id.domain().to_string(), key.clone());
            let entity = EntityRef::new(id.clone(), device.cloned());
            if let Some(previous) = inventory.entries.insert(slot, entity) {
                warn!(
                    device = %device.map(DeviceId::as_str).unwrap_or("-"),
                    key = %key,
                    kept = %id,
                    dropped = %previous.id,
                    "Two entities classify to the same function, keeping the last"
                );
                inventory.keys.remove(&previous.id);
            }
            inventory.keys.insert(id.clone(), key);
        }

        inventory
    }

    /// Entity with this exact domain and key
    pub fn get(&self, domain: &str, key: &FunctionalKey) -> Option<&EntityRef> {
        self.entries.get(&(domain.to_string(), key.clone()))
    }

    /// Functional key of an entity in this inventory
    pub fn key_of(&self, id: &EntityId) -> Option<&FunctionalKey> {
        self.keys.get(id)
    }

    /// Entities with this key, in any domain
    pub fn with_key<'a>(&'a self, key: &'a FunctionalKey) -> impl Iterator<Item = &'a EntityRef> {
        self.entries
            .iter()
            .filter(move |((_, k), _)| k == key)
            .map(|(_, entity)| entity)
    }

    /// All entries in `(domain, key)` order
    pub fn iter(&self) -> impl Iterator<Item = (&FunctionalKey, &EntityRef)> {
        self.entries.iter().map(|((_, key), entity)| (key, entity))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
