//! Function matcher
//!
//! Pairs the controller's inventory against one remote's inventory by
//! functional key. Building a map is a pure read of two inventories.

use std::collections::{BTreeSet, HashMap, HashSet};

use flux_core::{is_readonly_domain, EntityId};
use tracing::debug;

use crate::classifier::{keys, FunctionalKey};
use crate::inventory::{DeviceId, DeviceInventory, EntityRef};

/// Keys pushed controller → remote but never accepted back
pub const ONE_WAY_KEYS: &[&str] = &[
    keys::ZONE_COUNT,
    keys::USE_12H,
    keys::PUMP_MASTER_VALVE,
    keys::SYNC_NEEDED,
];

/// Whether changes to this key only ever flow controller → remote
pub fn is_one_way(key: &FunctionalKey) -> bool {
    ONE_WAY_KEYS.contains(&key.as_str())
}

/// Whether two domains may hold the same function on different devices
pub fn domains_compatible(a: &str, b: &str) -> bool {
    a == b
        || matches!(
            (a, b),
            ("switch", "valve") | ("valve", "switch") | ("text", "sensor") | ("sensor", "text")
        )
}

/// Read-only controller domains whose values a remote can display as text
fn is_status_source(domain: &str) -> bool {
    matches!(domain, "sensor" | "binary_sensor")
}

/// Paired entities between the controller and one remote device
#[derive(Debug, Clone, Default)]
pub struct EntityMap {
    pub device: Option<DeviceId>,
    pub remote_to_controller: HashMap<EntityId, EntityId>,
    pub controller_to_remote: HashMap<EntityId, EntityId>,
    /// Controller id → remote id, written controller → remote only
    pub status_only: HashMap<EntityId, EntityId>,
    pub watched_remote_ids: HashSet<EntityId>,
    pub watched_controller_ids: HashSet<EntityId>,
    /// The remote's boot flag, if it has one
    pub sync_needed_remote: Option<EntityId>,
    keys: HashMap<EntityId, FunctionalKey>,
}

impl EntityMap {
    /// Pair two inventories, leaving out the given special zones
    pub fn build(
        device: &DeviceId,
        controller: &DeviceInventory,
        remote: &DeviceInventory,
        special_zones: &BTreeSet<u32>,
    ) -> Self {
        let mut map = Self {
            device: Some(device.clone()),
            ..Default::default()
        };
        let excluded = |key: &FunctionalKey| {
            (key.is_zone() || key.is_zone_duration() || key.is_zone_enable())
                && key.zone_index().is_some_and(|n| special_zones.contains(&n))
        };

        let mut claimed: HashSet<&EntityId> = HashSet::new();
        let mut pending: Vec<(&FunctionalKey, &EntityRef)> = Vec::new();
        let mut unmatched: Vec<String> = Vec::new();

        // Exact domain + key first, so cross-domain pairs never steal them.
        // A read-only twin is left unclaimed for a writable sibling.
        for (key, ctrl) in controller.iter() {
            if excluded(key) {
                continue;
            }
            match remote.get(&ctrl.domain, key) {
                Some(rem) if !claimed.contains(&rem.id) && !is_readonly_domain(&rem.domain) => {
                    claimed.insert(&rem.id);
                    map.place(key, ctrl, rem, &mut unmatched);
                }
                _ => pending.push((key, ctrl)),
            }
        }

        for (key, ctrl) in pending {
            let candidate = remote.with_key(key).find(|rem| {
                !claimed.contains(&rem.id)
                    && !is_readonly_domain(&rem.domain)
                    && (is_status_source(&ctrl.domain) && rem.domain == "text"
                        || is_one_way(key)
                        || domains_compatible(&ctrl.domain, &rem.domain))
            });
            match candidate {
                Some(rem) => {
                    claimed.insert(&rem.id);
                    map.place(key, ctrl, rem, &mut unmatched);
                }
                None => unmatched.push(ctrl.id.to_string()),
            }
        }

        if let Some(flag) = remote
            .with_key(&FunctionalKey::new(keys::SYNC_NEEDED))
            .find(|rem| !is_readonly_domain(&rem.domain))
        {
            map.sync_needed_remote = Some(flag.id.clone());
            map.watched_remote_ids.insert(flag.id.clone());
            map.keys
                .insert(flag.id.clone(), FunctionalKey::new(keys::SYNC_NEEDED));
        }

        let remote_unmatched: Vec<String> = remote
            .iter()
            .filter(|&(key, rem)| !claimed.contains(&rem.id) && !excluded(key))
            .filter(|&(_, rem)| Some(&rem.id) != map.sync_needed_remote.as_ref())
            .map(|(_, rem)| rem.id.to_string())
            .collect();

        debug!(
            device = %device,
            paired = map.controller_to_remote.len(),
            status_only = map.status_only.len(),
            controller_unmatched = ?unmatched,
            remote_unmatched = ?remote_unmatched,
            "Built entity map"
        );

        map
    }

    fn place(
        &mut self,
        key: &FunctionalKey,
        ctrl: &EntityRef,
        rem: &EntityRef,
        unmatched: &mut Vec<String>,
    ) {
        let remote_writable = !is_readonly_domain(&rem.domain);
        let controller_writable = !is_readonly_domain(&ctrl.domain);

        if !remote_writable {
            unmatched.push(ctrl.id.to_string());
            return;
        }

        if is_one_way(key) || !controller_writable {
            self.status_only.insert(ctrl.id.clone(), rem.id.clone());
        } else {
            self.controller_to_remote
                .insert(ctrl.id.clone(), rem.id.clone());
            self.remote_to_controller
                .insert(rem.id.clone(), ctrl.id.clone());
        }

        self.watched_controller_ids.insert(ctrl.id.clone());
        self.watched_remote_ids.insert(rem.id.clone());
        self.keys.insert(ctrl.id.clone(), key.clone());
        self.keys.insert(rem.id.clone(), key.clone());
    }

    /// Functional key of a paired entity
    pub fn key_of(&self, id: &EntityId) -> Option<&FunctionalKey> {
        self.keys.get(id)
    }

    /// Remote target for a controller entity, bidirectional or status-only
    pub fn remote_for(&self, controller_id: &EntityId) -> Option<&EntityId> {
        self.controller_to_remote
            .get(controller_id)
            .or_else(|| self.status_only.get(controller_id))
    }

    /// Every `(controller, remote)` pair this map writes, in a stable order
    pub fn push_pairs(&self) -> Vec<(&EntityId, &EntityId)> {
        let mut pairs: Vec<_> = self
            .controller_to_remote
            .iter()
            .chain(self.status_only.iter())
            .collect();
        pairs.sort();
        pairs
    }

    pub fn is_empty(&self) -> bool {
        self.controller_to_remote.is_empty() && self.status_only.is_empty()
    }
}
