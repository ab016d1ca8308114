//! Flux entity state broker
//!
//! Keeps an irrigation controller's entities mirrored with any number of
//! remote keypads on the same hub. Entities are paired by what they do
//! rather than by name: the [`classifier`] reduces each id to a
//! [`FunctionalKey`], [`DeviceInventory`] groups a device's entities by key,
//! and [`EntityMap`] pairs the controller with one remote.
//!
//! The [`Broker`] consumes the hub's state-change stream, writes the
//! counterpart of every change through the [`MirrorExecutor`], guards its
//! own writes against echo, and holds each remote back until a full resync
//! has pushed the controller's state to it.

pub mod classifier;
pub mod collab;
pub mod debounce;
pub mod expiring;
pub mod inventory;
pub mod matcher;
pub mod mirror;
pub mod roster;
pub mod time_format;

mod broker;
mod dispatch;
mod poller;
mod resync;

pub use broker::{is_special_mode, Broker, ReconnectState};
pub use classifier::{classify, FunctionalKey};
pub use collab::{Collaborators, DurationUpdater, MoistureHooks, RunLog, TimelineRecalculator};
pub use dispatch::{is_schedule_defining, Dispatch, DEFAULT_RUN_SOURCE, REMOTE_RUN_SOURCE};
pub use expiring::ExpiringMap;
pub use inventory::{DeviceId, DeviceInventory, EntityRef};
pub use matcher::{EntityMap, ONE_WAY_KEYS};
pub use mirror::{MirrorError, MirrorExecutor};
pub use resync::ResyncReport;
pub use roster::{Owner, RemoteRoster, Roster};
