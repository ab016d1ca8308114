//! Broker behaviour against a recording hub
//!
//! Time is paused in every test: settle delays, guard TTLs and the debounce
//! window are stepped through by the runtime.

mod common;

use std::time::Duration;

use common::*;
use flux_broker::{DeviceId, Dispatch};
use flux_hub::StreamSignal;
use serde_json::json;

fn front() -> DeviceId {
    DeviceId::new(FRONT)
}

fn back() -> DeviceId {
    DeviceId::new(BACK)
}

// ============================================================================
// Loop safety
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_remote_change_does_not_echo_back() {
    let fx = fixture().await;
    fx.ready(FRONT).await;
    fx.ready(BACK).await;

    // Front keypad opens zone 1
    let outcome = fx
        .broker
        .dispatch(&change("valve.front_zone_1", "closed", "open"));
    assert_eq!(outcome, Dispatch::Mirrored { writes: 2 });
    fx.broker.drain().await;

    let calls = fx.hub.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(fx.hub.calls_for("switch.irrigator_zone_1")[0].service, "turn_on");
    assert_eq!(fx.hub.calls_for("valve.back_zone_1")[0].service, "open_valve");

    // Echoes of both writes come back on the stream
    assert_eq!(
        fx.broker
            .dispatch(&change("switch.irrigator_zone_1", "off", "on")),
        Dispatch::Guarded
    );
    assert_eq!(
        fx.broker.dispatch(&change("valve.back_zone_1", "closed", "open")),
        Dispatch::Guarded
    );
    fx.broker.drain().await;

    assert_eq!(fx.hub.calls().len(), 2);
    assert!(fx.hub.calls_for("valve.front_zone_1").is_empty());

    // The zone still ran, and the log knows a keypad started it
    assert_eq!(
        fx.recorder.zone_events(),
        vec![(
            "switch.irrigator_zone_1".to_string(),
            "on".to_string(),
            "remote".to_string()
        )]
    );
}

#[tokio::test(start_paused = true)]
async fn test_guard_expires_after_ttl() {
    let fx = fixture().await;
    fx.ready(FRONT).await;
    fx.ready(BACK).await;

    fx.broker
        .dispatch(&change("valve.front_zone_1", "closed", "open"));
    fx.broker.drain().await;
    fx.hub.clear_calls();

    tokio::time::advance(Duration::from_secs(2)).await;

    let outcome = fx
        .broker
        .dispatch(&change("switch.irrigator_zone_1", "on", "off"));
    assert_eq!(outcome, Dispatch::Mirrored { writes: 2 });
}

#[tokio::test(start_paused = true)]
async fn test_failed_write_does_not_guard() {
    let fx = fixture().await;
    fx.ready(FRONT).await;
    fx.hub.fail_on("switch.irrigator_zone_2");

    fx.broker
        .dispatch(&change("switch.front_zone_2", "off", "on"));
    fx.broker.drain().await;
    assert_eq!(fx.hub.calls_for("switch.irrigator_zone_2").len(), 1);

    let outcome = fx
        .broker
        .dispatch(&change("switch.irrigator_zone_2", "off", "on"));
    assert_eq!(outcome, Dispatch::Mirrored { writes: 1 });
}

// ============================================================================
// Suppression
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_pending_device_never_writes_controller() {
    let fx = fixture().await;

    for i in 0..20 {
        let (old, new) = if i % 2 == 0 { ("off", "on") } else { ("on", "off") };
        for event in [
            change("valve.front_zone_1", old, new),
            change("switch.back_schedule_monday", old, new),
            change("number.front_zone_1_duration", &i.to_string(), &(i + 1).to_string()),
            change("text.back_start_time_1", "06:00", &format!("07:{i:02}")),
        ] {
            assert!(matches!(
                fx.broker.dispatch(&event),
                Dispatch::Suppressed { .. }
            ));
        }
    }
    fx.broker.drain().await;

    assert!(fx.hub.calls().is_empty());
    assert!(fx.recorder.durations.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_controller_changes_skip_pending_remotes() {
    let fx = fixture().await;
    fx.ready(FRONT).await;

    let outcome = fx
        .broker
        .dispatch(&change("switch.irrigator_zone_2", "off", "on"));
    assert_eq!(outcome, Dispatch::Mirrored { writes: 1 });
    fx.broker.drain().await;

    assert_eq!(fx.hub.calls_for("switch.front_zone_2").len(), 1);
    assert!(fx.hub.calls_for("switch.back_zone_2").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_one_way_keys_not_accepted_from_remote() {
    let fx = fixture().await;
    fx.ready(FRONT).await;

    assert_eq!(
        fx.broker
            .dispatch(&change("number.front_zone_count", "3", "7")),
        Dispatch::OneWay
    );
    assert_eq!(
        fx.broker
            .dispatch(&change("switch.front_use_12_hour_format", "off", "on")),
        Dispatch::OneWay
    );
    fx.broker.drain().await;
    assert!(fx.hub.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_bookkeeping_values_never_written() {
    let fx = fixture().await;
    fx.ready(FRONT).await;

    assert_eq!(
        fx.broker
            .dispatch(&change("switch.irrigator_zone_1", "off", "unavailable")),
        Dispatch::Bookkeeping
    );
    assert_eq!(
        fx.broker
            .dispatch(&change("text.front_start_time_1", "06:00", "unknown")),
        Dispatch::Bookkeeping
    );
    fx.broker.drain().await;

    assert!(fx.hub.calls().is_empty());
    assert!(fx.recorder.zone_events().is_empty());
}

// ============================================================================
// Format conversion and durations
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_start_time_converted_to_12_hour() {
    let fx = fixture().await;
    fx.ready(FRONT).await;
    fx.ready(BACK).await;

    // Controller switches to a 12-hour clock; keypads are told
    let outcome = fx
        .broker
        .dispatch(&change("switch.irrigator_use_12h", "off", "on"));
    assert_eq!(outcome, Dispatch::Mirrored { writes: 2 });
    assert!(fx.broker.use_12h());
    fx.broker.drain().await;
    fx.hub.clear_calls();

    fx.broker
        .dispatch(&change("text.front_start_time_1", "06:00", "17:00"));
    fx.broker.drain().await;

    let calls = fx.hub.calls_for("text.irrigator_start_time_1");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].service_data["value"], json!("5:00 PM"));
    assert_eq!(
        fx.hub.calls_for("text.back_start_time_1")[0].service_data["value"],
        json!("5:00 PM")
    );
}

#[tokio::test(start_paused = true)]
async fn test_controller_duration_passes_through() {
    let fx = fixture().await;
    fx.ready(FRONT).await;
    fx.ready(BACK).await;

    let outcome = fx.broker.dispatch(&change(
        "number.irrigator_zone_1_run_duration",
        "10.0",
        "15.0",
    ));
    assert_eq!(outcome, Dispatch::Mirrored { writes: 2 });
    fx.broker.drain().await;

    for target in ["number.front_zone_1_duration", "number.back_zone_1_duration"] {
        let calls = fx.hub.calls_for(target);
        assert_eq!(calls.len(), 1, "{target}");
        assert_eq!(calls[0].service, "set_value");
        assert_eq!(calls[0].service_data["value"], json!(15.0));
    }
    assert!(fx.recorder.durations.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_remote_duration_goes_to_updater() {
    let fx = fixture().await;
    fx.ready(FRONT).await;

    let outcome = fx
        .broker
        .dispatch(&change("number.front_zone_1_duration", "10", "20"));
    assert_eq!(
        outcome,
        Dispatch::Duration {
            controller: id("number.irrigator_zone_1_run_duration")
        }
    );
    fx.broker.drain().await;
    assert!(fx.hub.calls().is_empty());

    // Zone 1 starts; the next edit is recorded as made while running
    fx.broker
        .dispatch(&change("switch.irrigator_zone_1", "off", "on"));
    fx.broker
        .dispatch(&change("number.front_zone_1_duration", "20", "25"));
    fx.broker.drain().await;

    let durations = fx.recorder.durations.lock().unwrap().clone();
    assert_eq!(
        durations,
        vec![
            (id("number.irrigator_zone_1_run_duration"), 20.0, false),
            (id("number.irrigator_zone_1_run_duration"), 25.0, true),
        ]
    );
}

// ============================================================================
// Resync
// ============================================================================

const FRONT_TARGETS: &[&str] = &[
    "valve.front_zone_1",
    "switch.front_zone_2",
    "switch.front_zone_3",
    "number.front_zone_1_duration",
    "number.front_zone_2_duration",
    "text.front_start_time_1",
    "switch.front_schedule_monday",
    "text.front_status",
    "number.front_zone_count",
    "switch.front_use_12_hour_format",
];

#[tokio::test(start_paused = true)]
async fn test_sync_needed_pushes_every_entity_once() {
    let fx = fixture().await;

    let outcome = fx
        .broker
        .dispatch(&change("switch.front_sync_needed", "off", "on"));
    assert_eq!(
        outcome,
        Dispatch::Resync {
            device: front(),
            started: true
        }
    );

    // Same boot seen through an entity coming back
    let outcome = fx
        .broker
        .dispatch(&change("switch.front_zone_2", "unavailable", "off"));
    assert_eq!(
        outcome,
        Dispatch::Resync {
            device: front(),
            started: false
        }
    );

    fx.broker.drain().await;

    for target in FRONT_TARGETS {
        assert_eq!(fx.hub.calls_for(target).len(), 1, "{target}");
    }
    let flag = fx.hub.calls_for("switch.front_sync_needed");
    assert_eq!(flag.len(), 1);
    assert_eq!(flag[0].service, "turn_off");
    assert_eq!(fx.hub.calls().len(), FRONT_TARGETS.len() + 1);

    assert_eq!(fx.hub.state("text.front_status").as_deref(), Some("Idle"));
    assert_eq!(fx.hub.state("number.front_zone_count").as_deref(), Some("3"));
    assert!(!fx.broker.is_pending(&front()));
    assert!(fx.broker.is_pending(&back()));
}

#[tokio::test(start_paused = true)]
async fn test_resync_completes_when_sync_flag_write_fails() {
    let fx = fixture().await;
    fx.hub.fail_on("switch.front_sync_needed");

    assert!(fx.broker.trigger_resync(&front()));
    fx.broker.drain().await;

    assert!(!fx.broker.is_pending(&front()));
    assert_eq!(fx.hub.state("text.front_status").as_deref(), Some("Idle"));
    assert_eq!(fx.hub.state("number.front_zone_count").as_deref(), Some("3"));
}

#[tokio::test(start_paused = true)]
async fn test_second_pass_rewrites_drift_only() {
    let fx = fixture().await;
    assert!(fx.broker.trigger_resync(&front()));

    // Past the first pass, inside the settle window
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(fx.hub.calls_for("valve.front_zone_1").len(), 1);
    assert!(fx.broker.is_pending(&front()));
    fx.hub.set_state("valve.front_zone_1", "open");

    fx.broker.drain().await;

    let valve = fx.hub.calls_for("valve.front_zone_1");
    assert_eq!(valve.len(), 2);
    assert_eq!(valve[1].service, "close_valve");
    for target in FRONT_TARGETS.iter().skip(1) {
        assert_eq!(fx.hub.calls_for(target).len(), 1, "{target}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_resync_uses_base_duration() {
    let fx = fixture().await;
    fx.recorder
        .base
        .lock()
        .unwrap()
        .insert(id("number.irrigator_zone_2_run_duration"), 35.0);

    fx.broker.trigger_resync(&front());
    fx.broker.drain().await;

    let calls = fx.hub.calls_for("number.front_zone_2_duration");
    assert_eq!(calls[0].service_data["value"], json!(35.0));
    assert_eq!(
        fx.hub.calls_for("number.front_zone_1_duration")[0].service_data["value"],
        json!(10.0)
    );
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_suppresses_until_device_resyncs() {
    let fx = fixture().await;
    fx.ready(FRONT).await;

    fx.broker.handle_signal(StreamSignal::Disconnected);
    assert!(fx.broker.is_pending(&front()));
    assert!(fx.broker.is_polling());
    assert!(matches!(
        fx.broker
            .dispatch(&change("switch.front_zone_2", "off", "on")),
        Dispatch::Suppressed { .. }
    ));

    // The keypad rebooted while the stream was down
    fx.hub.set_state("switch.front_sync_needed", "on");
    fx.broker.handle_signal(StreamSignal::Connected);
    assert!(!fx.broker.is_polling());
    assert!(fx.broker.is_connected());

    fx.broker.drain().await;
    assert!(!fx.broker.is_pending(&front()));
    assert!(fx.broker.is_pending(&back()));
    assert_eq!(fx.hub.state("switch.front_sync_needed").as_deref(), Some("off"));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_abandons_running_resync() {
    let fx = fixture().await;
    fx.broker.trigger_resync(&front());
    tokio::time::sleep(Duration::from_secs(1)).await;

    fx.broker.handle_signal(StreamSignal::Disconnected);
    fx.broker.handle_signal(StreamSignal::Connected);
    fx.broker.drain().await;

    assert!(fx.hub.calls().is_empty());
    assert!(fx.broker.is_pending(&front()));
    assert!(!fx.broker.reconnect_state(&front()).unwrap().sync_running);
}

// ============================================================================
// Hooks
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_schedule_burst_recalculates_once() {
    let fx = fixture().await;

    let edits = [
        change("text.irrigator_start_time_1", "06:00", "07:00"),
        change("number.irrigator_zone_1_run_duration", "10.0", "12.0"),
        change("switch.irrigator_schedule_monday", "on", "off"),
        change("switch.irrigator_enable_zone_1", "on", "off"),
        change("number.irrigator_zone_2_run_duration", "20.0", "22.0"),
    ];
    for edit in &edits {
        fx.broker.dispatch(edit);
        tokio::time::advance(Duration::from_millis(500)).await;
    }
    fx.broker.drain().await;
    assert_eq!(fx.recorder.recalculations(), 1);

    fx.broker
        .dispatch(&change("switch.irrigator_schedule_monday", "off", "on"));
    fx.broker.drain().await;
    assert_eq!(fx.recorder.recalculations(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_zone_runs_not_recalculating_timeline() {
    let fx = fixture().await;
    fx.broker
        .dispatch(&change("switch.irrigator_zone_1", "off", "on"));
    fx.broker.drain().await;
    assert_eq!(fx.recorder.recalculations(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_pump_zone_becomes_special() {
    let fx = fixture().await;
    fx.ready(FRONT).await;

    let map = fx.broker.entity_map(&front()).unwrap();
    assert!(map
        .controller_to_remote
        .contains_key(&id("switch.irrigator_zone_3")));

    let outcome = fx.broker.dispatch(&change(
        "select.irrigator_zone_3_mode",
        "Normal",
        "Pump Start Relay",
    ));
    assert_eq!(outcome, Dispatch::Unrelated);
    assert_eq!(fx.broker.special_zones().into_iter().collect::<Vec<_>>(), vec![3]);
    fx.broker.drain().await;
    fx.hub.clear_calls();

    let map = fx.broker.entity_map(&front()).unwrap();
    assert!(!map
        .controller_to_remote
        .contains_key(&id("switch.irrigator_zone_3")));
    assert!(map
        .controller_to_remote
        .contains_key(&id("switch.irrigator_zone_2")));

    // Keypads count only real zones
    fx.broker
        .dispatch(&change("sensor.irrigator_detected_zones", "3", "4"));
    fx.broker.drain().await;
    let calls = fx.hub.calls_for("number.front_zone_count");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].service_data["value"], json!(3.0));
}

#[tokio::test(start_paused = true)]
async fn test_special_zone_change_updates_keypad_zone_count() {
    let fx = fixture().await;
    fx.ready(FRONT).await;
    assert_eq!(fx.hub.state("number.front_zone_count").as_deref(), Some("3"));

    fx.broker.dispatch(&change(
        "select.irrigator_zone_3_mode",
        "Normal",
        "Pump Start Relay",
    ));
    fx.broker.drain().await;

    let calls = fx.hub.calls_for("number.front_zone_count");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].service_data["value"], json!(2.0));
    assert_eq!(fx.hub.state("number.front_zone_count").as_deref(), Some("2"));
    // Pending keypads wait for their resync
    assert!(fx.hub.calls_for("number.back_zone_count").is_empty());

    // A mode change that keeps the special set as-is pushes nothing
    fx.hub.clear_calls();
    fx.broker.dispatch(&change(
        "select.irrigator_zone_3_mode",
        "Pump Start Relay",
        "Master Valve",
    ));
    fx.broker.drain().await;
    assert!(fx.hub.calls_for("number.front_zone_count").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_pre_announced_source_consumed_once() {
    let fx = fixture().await;
    fx.broker
        .pre_announce(&id("switch.irrigator_zone_1"), "api");

    fx.broker
        .dispatch(&change("switch.irrigator_zone_1", "off", "on"));
    fx.broker
        .dispatch(&change("switch.irrigator_zone_1", "on", "off"));
    fx.broker.drain().await;

    assert_eq!(
        fx.recorder.zone_events(),
        vec![
            (
                "switch.irrigator_zone_1".to_string(),
                "on".to_string(),
                "api".to_string()
            ),
            (
                "switch.irrigator_zone_1".to_string(),
                "off".to_string(),
                "schedule".to_string()
            ),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_stale_pre_announcement_ignored() {
    let fx = fixture().await;
    fx.broker
        .pre_announce(&id("switch.irrigator_zone_2"), "api");
    tokio::time::advance(Duration::from_secs(16)).await;

    fx.broker
        .dispatch(&change("switch.irrigator_zone_2", "off", "on"));
    fx.broker.drain().await;
    assert_eq!(fx.recorder.zone_events()[0].2, "schedule");
}

#[tokio::test(start_paused = true)]
async fn test_probe_transition_reapplies_durations() {
    let fx = fixture().await;
    *fx.recorder.probe_transition.lock().unwrap() = true;

    let outcome = fx
        .broker
        .dispatch(&change("sensor.probe_1_moisture", "30", "12"));
    assert_eq!(outcome, Dispatch::Unrelated);
    fx.broker.drain().await;

    assert_eq!(fx.recorder.probe_checks.lock().unwrap().len(), 1);
    assert_eq!(*fx.recorder.reapplied.lock().unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_polling_reports_zone_runs() {
    let fx = fixture().await;
    fx.broker.handle_signal(StreamSignal::Disconnected);
    fx.hub.set_state("switch.irrigator_zone_2", "on");

    tokio::time::sleep(Duration::from_millis(100)).await;
    fx.broker
        .pre_announce(&id("switch.irrigator_zone_2"), "api");
    fx.hub.set_state("switch.irrigator_zone_2", "off");
    tokio::time::sleep(Duration::from_secs(10)).await;

    fx.broker.handle_signal(StreamSignal::Connected);
    fx.broker.drain().await;

    assert_eq!(
        fx.recorder.zone_events(),
        vec![
            (
                "switch.irrigator_zone_2".to_string(),
                "on".to_string(),
                "schedule".to_string()
            ),
            (
                "switch.irrigator_zone_2".to_string(),
                "off".to_string(),
                "api".to_string()
            ),
        ]
    );
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_unrelated_entities_dropped() {
    let fx = fixture().await;
    assert_eq!(
        fx.broker.dispatch(&change("light.kitchen", "off", "on")),
        Dispatch::Unrelated
    );
    assert_eq!(
        fx.broker
            .dispatch(&change("switch.irrigator_zone_1", "off", "off")),
        Dispatch::Unchanged
    );
}

#[tokio::test(start_paused = true)]
async fn test_roster_change_keeps_known_devices() {
    let fx = fixture().await;
    fx.ready(FRONT).await;

    let roster = flux_broker::Roster::new(DeviceId::new(CONTROLLER), controller_entities())
        .with_remote(front(), "Front keypad", remote_entities(FRONT));
    fx.broker.set_roster(roster);

    assert!(!fx.broker.is_pending(&front()));
    assert!(fx.broker.reconnect_state(&back()).is_none());
    assert!(fx.broker.entity_map(&back()).is_none());
    assert_eq!(
        fx.broker
            .dispatch(&change("switch.back_zone_2", "off", "on")),
        Dispatch::Unrelated
    );
}

#[tokio::test(start_paused = true)]
async fn test_run_consumes_stream_until_closed() {
    let fx = fixture().await;
    let (tx, rx) = tokio::sync::mpsc::channel(16);

    let broker = fx.broker.clone();
    let runner = tokio::spawn(async move { broker.run(rx).await });

    tx.send(StreamSignal::Connected).await.unwrap();
    tx.send(StreamSignal::StateChanged(change(
        "switch.front_sync_needed",
        "off",
        "on",
    )))
    .await
    .unwrap();
    drop(tx);
    runner.await.unwrap();

    fx.broker.drain().await;
    assert!(!fx.broker.is_pending(&front()));
    assert!(!fx.broker.is_polling());
    fx.broker.shutdown().await;
}
