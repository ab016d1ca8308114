//! The broker object and its lifecycle
//!
//! All caches, guards and per-device flags live here. The dispatcher,
//! resync coordinator and poller are `impl Broker` blocks in their own
//! modules.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use dashmap::DashMap;
use flux_config::BrokerTimings;
use flux_core::{is_active_state, EntityId, State};
use flux_hub::{Hub, HubResult, StreamSignal};
use regex::Regex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::classifier::{keys, FunctionalKey};
use crate::collab::Collaborators;
use crate::debounce::Debouncer;
use crate::expiring::ExpiringMap;
use crate::inventory::{DeviceId, DeviceInventory};
use crate::matcher::EntityMap;
use crate::mirror::MirrorExecutor;
use crate::roster::Roster;

/// Per-device mirroring state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectState {
    /// Remote → controller writes are blocked
    pub pending: bool,
    /// A resync is in progress
    pub sync_running: bool,
}

impl Default for ReconnectState {
    fn default() -> Self {
        Self {
            pending: true,
            sync_running: false,
        }
    }
}

/// Zone modes that take a zone out of normal mirroring
fn special_mode_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)pump|master|relay").expect("valid regex"))
}

/// Whether a zone-mode value marks the zone as a pump or master valve
pub fn is_special_mode(mode: &str) -> bool {
    special_mode_pattern().is_match(mode)
}

pub(crate) struct BrokerInner {
    pub(crate) hub: Arc<dyn Hub>,
    pub(crate) collab: Collaborators,
    pub(crate) timings: BrokerTimings,
    roster: RwLock<Arc<Roster>>,

    controller_inventory: RwLock<Option<Arc<DeviceInventory>>>,
    remote_inventories: DashMap<DeviceId, Arc<DeviceInventory>>,
    maps: DashMap<DeviceId, Arc<EntityMap>>,

    pub(crate) zone_modes: DashMap<u32, String>,
    pub(crate) zone_states: DashMap<u32, bool>,
    pub(crate) reconnect: DashMap<DeviceId, ReconnectState>,
    pub(crate) pre_announced: ExpiringMap<EntityId, String>,
    pub(crate) use_12h: Arc<AtomicBool>,
    pub(crate) mirror: MirrorExecutor,
    pub(crate) debouncer: Debouncer,

    /// Bumped on every stream loss; resyncs from an older epoch never clear `pending`
    pub(crate) epoch: AtomicU64,
    pub(crate) connected: AtomicBool,

    pub(crate) tracker: TaskTracker,
    pub(crate) cancel: CancellationToken,
    pub(crate) resync_cancel: Mutex<CancellationToken>,
    pub(crate) poller: Mutex<Option<CancellationToken>>,
}

/// Entity state broker
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Broker {
    pub(crate) inner: Arc<BrokerInner>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let roster = self.roster();
        f.debug_struct("Broker")
            .field("controller", roster.controller())
            .field("remotes", &roster.remote_count())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl Broker {
    pub fn new(
        hub: Arc<dyn Hub>,
        roster: Roster,
        collab: Collaborators,
        timings: BrokerTimings,
        use_12h: bool,
    ) -> Self {
        let guard = Arc::new(ExpiringMap::new(timings.mirror_guard_ttl()));
        let use_12h = Arc::new(AtomicBool::new(use_12h));
        let cancel = CancellationToken::new();

        let reconnect = DashMap::new();
        for device in roster.remote_ids() {
            reconnect.insert(device.clone(), ReconnectState::default());
        }

        let inner = BrokerInner {
            mirror: MirrorExecutor::new(hub.clone(), guard, use_12h.clone()),
            hub,
            collab,
            timings,
            roster: RwLock::new(Arc::new(roster)),
            controller_inventory: RwLock::new(None),
            remote_inventories: DashMap::new(),
            maps: DashMap::new(),
            zone_modes: DashMap::new(),
            zone_states: DashMap::new(),
            reconnect,
            pre_announced: ExpiringMap::new(timings.pre_announce_ttl()),
            use_12h,
            debouncer: Debouncer::new(timings.timeline_debounce()),
            epoch: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            tracker: TaskTracker::new(),
            resync_cancel: Mutex::new(cancel.child_token()),
            cancel,
            poller: Mutex::new(None),
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Prime zone modes, zone states and the clock format from the hub
    pub async fn build(&self) -> HubResult<()> {
        let states = self.inner.hub.get_states().await?;
        let inventory = self.controller_inventory();

        let mut primed = 0;
        for state in &states {
            if let Some(key) = inventory.key_of(&state.entity_id) {
                if self.observe_controller_state(&state.entity_id, key, state) {
                    primed += 1;
                }
            }
        }

        info!(
            controller = %self.roster().controller(),
            remotes = self.roster().remote_count(),
            primed,
            special_zones = ?self.special_zones(),
            use_12h = self.use_12h(),
            "Broker built"
        );
        Ok(())
    }

    fn observe_controller_state(&self, id: &EntityId, key: &FunctionalKey, state: &State) -> bool {
        if state.is_unavailable() || state.is_unknown() {
            return false;
        }
        let domain = id.domain();
        if key.is_zone_mode() {
            if let Some(n) = key.zone_index() {
                self.inner.zone_modes.insert(n, state.state.clone());
                return true;
            }
        } else if key.is_zone() && matches!(domain, "switch" | "valve") {
            if let Some(n) = key.zone_index() {
                self.inner.zone_states.insert(n, is_active_state(&state.state));
                return true;
            }
        } else if key == keys::USE_12H {
            self.inner
                .use_12h
                .store(is_active_state(&state.state), Ordering::Relaxed);
            return true;
        }
        false
    }

    /// Current roster
    pub fn roster(&self) -> Arc<Roster> {
        match self.inner.roster.read() {
            Ok(roster) => roster.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the roster
    ///
    /// Every cache is dropped. New remotes start pending; remotes that are
    /// still present keep their state.
    pub fn set_roster(&self, roster: Roster) {
        self.inner
            .reconnect
            .retain(|device, _| roster.remote(device).is_some());
        for device in roster.remote_ids() {
            self.inner.reconnect.entry(device.clone()).or_default();
        }
        if let Ok(mut current) = self.inner.roster.write() {
            *current = Arc::new(roster);
        }
        self.invalidate(None);
    }

    /// Drop cached inventories and maps
    ///
    /// `None` or the controller drops everything; a remote drops only its own.
    pub fn invalidate(&self, device: Option<&DeviceId>) {
        let roster = self.roster();
        match device {
            Some(device) if device != roster.controller() => {
                self.inner.remote_inventories.remove(device);
                self.inner.maps.remove(device);
                debug!(device = %device, "Invalidated device cache");
            }
            _ => {
                if let Ok(mut inventory) = self.inner.controller_inventory.write() {
                    *inventory = None;
                }
                self.inner.remote_inventories.clear();
                self.inner.maps.clear();
                debug!("Invalidated all device caches");
            }
        }
    }

    /// Drop cached maps but keep inventories
    pub(crate) fn invalidate_maps(&self) {
        self.inner.maps.clear();
    }

    /// The controller's inventory, built on first use
    pub fn controller_inventory(&self) -> Arc<DeviceInventory> {
        if let Some(inventory) = self
            .inner
            .controller_inventory
            .read()
            .ok()
            .and_then(|guard| guard.clone())
        {
            return inventory;
        }

        let roster = self.roster();
        let inventory = Arc::new(DeviceInventory::build(
            Some(roster.controller()),
            roster.controller_entities(),
        ));
        if let Ok(mut slot) = self.inner.controller_inventory.write() {
            *slot = Some(inventory.clone());
        }
        inventory
    }

    /// A remote's inventory, built on first use
    pub fn remote_inventory(&self, device: &DeviceId) -> Option<Arc<DeviceInventory>> {
        if let Some(inventory) = self.inner.remote_inventories.get(device) {
            return Some(inventory.clone());
        }
        let roster = self.roster();
        let remote = roster.remote(device)?;
        let inventory = Arc::new(DeviceInventory::build(Some(device), &remote.entities));
        self.inner
            .remote_inventories
            .insert(device.clone(), inventory.clone());
        Some(inventory)
    }

    /// The entity map for one remote, built on first use
    pub fn entity_map(&self, device: &DeviceId) -> Option<Arc<EntityMap>> {
        if let Some(map) = self.inner.maps.get(device) {
            return Some(map.clone());
        }
        let remote = self.remote_inventory(device)?;
        let controller = self.controller_inventory();
        let map = Arc::new(EntityMap::build(
            device,
            &controller,
            &remote,
            &self.special_zones(),
        ));
        self.inner.maps.insert(device.clone(), map.clone());
        Some(map)
    }

    /// Zones currently configured as pump or master valve
    pub fn special_zones(&self) -> BTreeSet<u32> {
        self.inner
            .zone_modes
            .iter()
            .filter(|entry| is_special_mode(entry.value()))
            .map(|entry| *entry.key())
            .collect()
    }

    /// Whether a controller zone is currently running
    pub fn zone_running(&self, zone: u32) -> bool {
        self.inner
            .zone_states
            .get(&zone)
            .map(|running| *running)
            .unwrap_or(false)
    }

    pub fn use_12h(&self) -> bool {
        self.inner.use_12h.load(Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Relaxed)
    }

    /// Reconnect state of a remote
    pub fn reconnect_state(&self, device: &DeviceId) -> Option<ReconnectState> {
        self.inner.reconnect.get(device).map(|state| *state)
    }

    /// Whether remote → controller writes from this device are blocked
    ///
    /// Unknown devices count as pending.
    pub fn is_pending(&self, device: &DeviceId) -> bool {
        self.reconnect_state(device)
            .map(|state| state.pending)
            .unwrap_or(true)
    }

    /// Note the real source of a zone toggle that is about to happen
    pub fn pre_announce(&self, entity_id: &EntityId, source: &str) {
        // Announcements for toggles that never happened would pile up
        self.inner.pre_announced.purge_expired();
        self.inner
            .pre_announced
            .insert(entity_id.clone(), source.to_string());
    }

    /// Consume the stream until it closes or the broker shuts down
    pub async fn run(&self, mut signals: mpsc::Receiver<StreamSignal>) {
        // Nothing is streaming until the first Connected
        self.start_poller();

        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                signal = signals.recv() => match signal {
                    Some(signal) => self.handle_signal(signal),
                    None => {
                        info!("Event stream closed");
                        break;
                    }
                },
            }
        }

        self.stop_poller();
    }

    /// Handle one stream signal
    pub fn handle_signal(&self, signal: StreamSignal) {
        match signal {
            StreamSignal::StateChanged(change) => {
                self.dispatch(&change);
            }
            StreamSignal::Connected => self.on_connected(),
            StreamSignal::Disconnected => self.on_disconnected(),
        }
    }

    fn on_connected(&self) {
        self.inner.connected.store(true, Ordering::Relaxed);
        self.stop_poller();
        self.suppress_all();
        info!("Event stream connected, remotes wait for a resync");

        let broker = self.clone();
        self.inner.tracker.spawn(async move {
            broker.resync_flagged_remotes().await;
        });
    }

    fn on_disconnected(&self) {
        self.inner.connected.store(false, Ordering::Relaxed);
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);

        // Stop resyncs for the lost connection
        if let Ok(mut token) = self.inner.resync_cancel.lock() {
            token.cancel();
            *token = self.inner.cancel.child_token();
        }
        self.suppress_all();
        for mut state in self.inner.reconnect.iter_mut() {
            state.sync_running = false;
        }

        warn!("Event stream lost, remote mirroring suspended");
        self.start_poller();
    }

    fn suppress_all(&self) {
        for mut state in self.inner.reconnect.iter_mut() {
            state.pending = true;
        }
    }

    /// Controller values keyed by entity id, from a fresh state read
    pub(crate) async fn read_states(&self) -> HubResult<HashMap<EntityId, String>> {
        Ok(self
            .inner
            .hub
            .get_states()
            .await?
            .into_iter()
            .map(|state| (state.entity_id, state.state))
            .collect())
    }

    /// Wait for every spawned write, resync and timer to finish
    ///
    /// The poller never finishes on its own; stop it first.
    pub async fn drain(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tracker.reopen();
    }

    /// Stop everything and wait for in-flight work
    pub async fn shutdown(&self) {
        info!("Broker shutting down");
        self.inner.cancel.cancel();
        self.inner.debouncer.cancel();
        self.stop_poller();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("Broker stopped");
    }
}
