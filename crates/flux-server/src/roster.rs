//! Roster resolution at startup

use std::time::Duration;

use anyhow::{Context, Result};
use flux_broker::{DeviceId, Roster};
use flux_config::{BrokerConfig, RemoteDeviceConfig};
use flux_core::EntityId;
use flux_hub::WsClient;
use tracing::{info, warn};

/// Device id used when the controller roster is listed explicitly
const EXPLICIT_CONTROLLER_ID: &str = "controller";

const CONTROLLER_LOOKUP_ATTEMPTS: u32 = 4;
const CONTROLLER_LOOKUP_STEP: Duration = Duration::from_secs(10);

/// Build the roster from the options, asking the hub's registry for any
/// device whose entities were not listed
pub async fn resolve(config: &BrokerConfig, ws: &WsClient) -> Result<Roster> {
    let controller = if config.controller_entities.is_empty() {
        ws.device_entities_with_retry(
            &config.irrigation_device_id,
            CONTROLLER_LOOKUP_ATTEMPTS,
            CONTROLLER_LOOKUP_STEP,
        )
        .await
        .with_context(|| {
            format!(
                "resolving entities of controller device '{}'",
                config.irrigation_device_id
            )
        })?
    } else {
        BrokerConfig::parse_entity_ids("controller_entities", &config.controller_entities)?
    };

    let mut remotes = Vec::with_capacity(config.remote_devices.len());
    for remote in &config.remote_devices {
        let entities = if remote.entities.is_empty() {
            match ws.device_entities(&remote.device_id).await {
                Ok(entities) => entities,
                Err(e) => {
                    warn!(device = %remote.label(), error = %e, "Failed to resolve remote entities");
                    Vec::new()
                }
            }
        } else {
            BrokerConfig::parse_entity_ids("remote_devices.entities", &remote.entities)?
        };
        remotes.push((remote, entities));
    }

    let probes = BrokerConfig::parse_entity_ids("probe_sensor_entities", &config.probe_sensor_entities)?;
    Ok(assemble(config, controller, remotes, probes))
}

fn assemble(
    config: &BrokerConfig,
    controller: Vec<EntityId>,
    remotes: Vec<(&RemoteDeviceConfig, Vec<EntityId>)>,
    probes: Vec<EntityId>,
) -> Roster {
    let controller_id = if config.irrigation_device_id.is_empty() {
        EXPLICIT_CONTROLLER_ID
    } else {
        config.irrigation_device_id.as_str()
    };
    info!(device = %controller_id, entities = controller.len(), "Controller roster");

    let mut roster = Roster::new(DeviceId::new(controller_id), controller);
    for (remote, entities) in remotes {
        if entities.is_empty() {
            warn!(device = %remote.label(), "Remote has no entities; it will not be mirrored");
        } else {
            info!(device = %remote.label(), entities = entities.len(), "Remote roster");
        }
        roster = roster.with_remote(
            DeviceId::new(remote.device_id.clone()),
            remote.label().to_string(),
            entities,
        );
    }
    roster.with_probe_sensors(probes)
}
