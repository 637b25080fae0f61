use std::{
    fs,
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{NaiveDate, NaiveDateTime};
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::time::sleep;

use heating_common::{CfgErrorKind, Device, ResetEventValue};
use heating_controller::{
    controller::SETPOINT_COMMAND, Configuration, Controller, ControllerOptions, DeviceTransport,
};

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<(String, f32)>>,
}

impl RecordingTransport {
    fn sent(&self) -> Vec<(String, f32)> {
        self.sent.lock().unwrap().clone()
    }

    fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

impl DeviceTransport for RecordingTransport {
    fn send_setpoint(&self, device: &Device, setpoint: f32) -> anyhow::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((device.name.clone(), setpoint));
        Ok(())
    }
}

fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 1, day)
        .unwrap()
        .and_hms_opt(hour, minute, 0)
        .unwrap()
}

struct Harness {
    _dir: TempDir,
    controller: Controller,
    transport: Arc<RecordingTransport>,
}

impl Harness {
    /// Controller over the realistic fixture, first tick after one second.
    fn start(time: NaiveDateTime) -> Self {
        let dir = TempDir::new().unwrap();
        fs::copy(
            Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/realistic_configuration.yaml"),
            dir.path().join("configuration.yaml"),
        )
        .unwrap();
        let configuration = Configuration::open(dir.path(), "").unwrap();

        let transport = Arc::new(RecordingTransport::default());
        let controller = Controller::start_with(
            configuration,
            transport.clone(),
            ControllerOptions {
                init_delay: Some(Duration::from_secs(1)),
                tick_interval: Some(Duration::from_secs(5)),
                ..ControllerOptions::default()
            },
        );
        controller.set_test_time(Some(time));
        Self {
            _dir: dir,
            controller,
            transport,
        }
    }

    /// Reports every pending setpoint as applied by its device.
    fn confirm_all(&self) {
        for name in self.controller.device_names() {
            if let Some(value) = self
                .controller
                .repeater()
                .pending_payload(&name, SETPOINT_COMMAND)
            {
                self.controller.on_device_setpoint(&name, value);
            }
        }
    }
}

#[tokio::test(start_paused = true)]
async fn scheduled_setpoints_follow_the_day() {
    let harness = Harness::start(at(20, 0, 0));
    sleep(Duration::from_secs(2)).await;

    assert_eq!(
        harness.transport.sent(),
        [
            ("Kitchen".to_string(), 15.0),
            ("LivingRoom".to_string(), 15.0),
            ("Office".to_string(), 15.0),
            ("Parents".to_string(), 14.0),
            ("Shower".to_string(), 18.5),
        ]
    );
    harness.confirm_all();
    assert_eq!(harness.controller.repeater().pending_count(), 0);

    // Only the shower changes at 00:20.
    harness.transport.clear();
    harness.controller.set_test_time(Some(at(20, 0, 20)));
    sleep(Duration::from_secs(1)).await;
    assert_eq!(harness.transport.sent(), [("Shower".to_string(), 14.0)]);

    harness.controller.stop().await;
}

#[tokio::test(start_paused = true)]
async fn switching_to_a_child_schedule() {
    let harness = Harness::start(at(20, 8, 0));
    sleep(Duration::from_secs(2)).await;
    harness.confirm_all();
    harness.transport.clear();

    harness
        .controller
        .set_active_schedule("teleworking")
        .await
        .unwrap();
    sleep(Duration::from_secs(1)).await;

    assert_eq!(
        harness.transport.sent(),
        [
            ("LivingRoom".to_string(), 17.0),
            ("Office".to_string(), 17.0),
        ]
    );
    harness.controller.stop().await;
}

#[tokio::test(start_paused = true)]
async fn manual_override_lasts_until_the_setpoint_changes() {
    let harness = Harness::start(at(20, 8, 0));
    sleep(Duration::from_secs(2)).await;
    harness.confirm_all();
    harness.transport.clear();

    assert!(harness.controller.on_device_setpoint("LivingRoom", 20.0));

    // 14:20 changes the scheduled value: the override ends.
    harness.controller.set_test_time(Some(at(20, 14, 20)));
    sleep(Duration::from_secs(1)).await;
    let sent = harness.transport.sent();
    assert!(sent.contains(&("LivingRoom".to_string(), 17.0)));
    assert!(!harness
        .controller
        .device("LivingRoom")
        .unwrap()
        .is_in_manual_mode());
    harness.controller.stop().await;
}

#[tokio::test(start_paused = true)]
async fn hours_policy_keeps_the_override_across_timeslots() {
    let harness = Harness::start(at(20, 8, 0));
    sleep(Duration::from_secs(2)).await;
    harness.confirm_all();

    harness
        .controller
        .set_manual_mode_reset_event(ResetEventValue::Hours(2))
        .await
        .unwrap();
    harness.transport.clear();
    assert!(harness.controller.on_device_setpoint("Kitchen", 21.0));

    harness.controller.set_test_time(Some(at(20, 9, 0)));
    sleep(Duration::from_secs(6)).await;
    assert!(harness.transport.sent().is_empty());

    harness.controller.set_test_time(Some(at(20, 10, 1)));
    sleep(Duration::from_secs(6)).await;
    assert_eq!(harness.transport.sent(), [("Kitchen".to_string(), 16.0)]);
    harness.controller.stop().await;
}

#[tokio::test(start_paused = true)]
async fn device_rename_moves_every_reference() {
    let harness = Harness::start(at(20, 0, 0));
    sleep(Duration::from_secs(2)).await;
    assert_eq!(
        harness
            .controller
            .repeater()
            .pending_payload("LivingRoom", SETPOINT_COMMAND),
        Some(15.0)
    );
    harness.transport.clear();

    harness
        .controller
        .change_device_name("LivingRoom", "Lounge")
        .await
        .unwrap();

    let repeater = harness.controller.repeater();
    assert_eq!(repeater.pending_payload("LivingRoom", SETPOINT_COMMAND), None);
    assert_eq!(repeater.pending_payload("Lounge", SETPOINT_COMMAND), Some(15.0));
    assert!(harness.controller.device("LivingRoom").is_none());
    assert_eq!(harness.controller.device("Lounge").unwrap().name, "Lounge");

    {
        let configuration = harness.controller.configuration().await;
        let scheduler = configuration.scheduler();
        assert!(!scheduler.references_device("LivingRoom"));
        assert!(scheduler.references_device("Lounge"));
        let normal = scheduler.schedule("Normal").unwrap();
        assert!(normal.schedule_items[0].devices.contains(&"Lounge".to_string()));
    }

    // The renamed device keeps its setpoint; nothing is resent.
    sleep(Duration::from_secs(6)).await;
    assert!(harness.transport.sent().is_empty());
    assert_eq!(
        harness.controller.get_setpoints(None).setpoints["Lounge"].setpoint,
        15.0
    );
    harness.controller.stop().await;
}

#[tokio::test(start_paused = true)]
async fn deleting_a_device_drops_its_pending_commands() {
    let harness = Harness::start(at(20, 0, 0));
    sleep(Duration::from_secs(2)).await;

    let err = harness.controller.delete_device("Office").await.unwrap_err();
    assert_eq!(err.kind, CfgErrorKind::ReferencedNode);

    harness
        .controller
        .add_device("Garage", "climate.garage", "mqtt", serde_json::Value::Null)
        .await
        .unwrap();
    harness.controller.set_device_setpoint("Garage", 12.0).unwrap();
    assert_eq!(
        harness
            .controller
            .repeater()
            .pending_payload("Garage", SETPOINT_COMMAND),
        Some(12.0)
    );

    harness.controller.delete_device("Garage").await.unwrap();
    assert_eq!(
        harness
            .controller
            .repeater()
            .pending_payload("Garage", SETPOINT_COMMAND),
        None
    );
    assert!(harness.controller.device("Garage").is_none());
    harness.controller.stop().await;
}

#[tokio::test(start_paused = true)]
async fn rejected_mutation_leaves_scheduling_untouched() {
    let harness = Harness::start(at(20, 0, 0));
    sleep(Duration::from_secs(2)).await;
    harness.confirm_all();
    harness.transport.clear();

    let err = harness
        .controller
        .change_schedule_properties("Normal", "Normal", Some("teleworking"))
        .await
        .unwrap_err();
    assert_eq!(err.kind, CfgErrorKind::CircularRef);

    let err = harness
        .controller
        .set_active_schedule("Unknown")
        .await
        .unwrap_err();
    assert_eq!(err.kind, CfgErrorKind::BadReference);

    sleep(Duration::from_secs(6)).await;
    assert!(harness.transport.sent().is_empty());
    assert_eq!(
        harness.controller.get_setpoints(None).active_schedule.as_deref(),
        Some("Normal")
    );
    harness.controller.stop().await;
}
