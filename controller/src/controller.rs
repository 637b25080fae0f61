use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::anyhow;
use chrono::NaiveDateTime;
use serde_json::Value;
use tracing::{debug, info, warn};

use heating_common::{
    CfgError, CfgResult, Device, DeviceEntry, DeviceMap, DeviceSetpoint, ManualModeReset,
    ResetEventValue, Resolution, Schedule, SchedulerConfig, SetpointNotification,
    TemperatureSet,
};

use crate::{
    configuration::Configuration,
    lock,
    repeater::{CommandRepeater, RepeatAction, CHECK_INTERVAL},
    scheduler::{Scheduler, SchedulerOptions, SetpointSink},
};

pub const SETPOINT_COMMAND: &str = "setpoint";

/// Delivers commands to physical devices.
pub trait DeviceTransport: Send + Sync + 'static {
    fn send_setpoint(&self, device: &Device, setpoint: f32) -> anyhow::Result<()>;
}

/// Transport that only logs what would be sent.
pub struct LoggingTransport;

impl DeviceTransport for LoggingTransport {
    fn send_setpoint(&self, device: &Device, setpoint: f32) -> anyhow::Result<()> {
        info!(
            device = %device.name,
            entity = %device.entity,
            client = %device.client_name,
            setpoint,
            "sending setpoint"
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Overrides the configured scheduler start delay.
    pub init_delay: Option<Duration>,
    pub tick_interval: Option<Duration>,
    pub repeat_check_interval: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            init_delay: None,
            tick_interval: None,
            repeat_check_interval: CHECK_INTERVAL,
        }
    }
}

/// Sends scheduled setpoints and keeps them in the repeater until the device
/// confirms them.
struct SetpointDispatcher {
    devices: Arc<Mutex<DeviceMap>>,
    repeater: Arc<CommandRepeater<f32>>,
    transport: Arc<dyn DeviceTransport>,
}

impl SetpointDispatcher {
    fn send_setpoint(&self, name: &str, value: f32, force: bool) {
        let Some(device) = lock(&self.devices).get(name).cloned() else {
            warn!(device = name, "setpoint for unknown device dropped");
            return;
        };

        if !force {
            let expected = self
                .repeater
                .pending_payload(name, SETPOINT_COMMAND)
                .unwrap_or(device.setpoint);
            if expected == value {
                debug!(device = name, value, "setpoint already requested");
                return;
            }
        }

        let action: RepeatAction<f32> = Arc::new({
            let devices = self.devices.clone();
            let transport = self.transport.clone();
            move |subject, setpoint| {
                let device = lock(&devices)
                    .get(subject)
                    .cloned()
                    .ok_or_else(|| anyhow!("unknown device {subject}"))?;
                transport.send_setpoint(&device, *setpoint)
            }
        });
        self.repeater.add(name, SETPOINT_COMMAND, value, action);

        if let Err(err) = self.transport.send_setpoint(&device, value) {
            warn!(device = name, value, "failed to send setpoint: {err:#}");
        }
    }
}

impl SetpointSink for SetpointDispatcher {
    fn apply_devices_setpoints(&self, setpoints: SetpointNotification) {
        for (name, setpoint) in setpoints {
            match setpoint {
                DeviceSetpoint::Scheduled(value) => self.send_setpoint(&name, value, false),
                DeviceSetpoint::Manual => debug!(device = %name, "device in manual mode"),
                DeviceSetpoint::NoSetpoint => {}
            }
        }
    }
}

/// Wires the configuration store, the scheduler and the command repeater to
/// a device transport.
pub struct Controller {
    configuration: tokio::sync::Mutex<Configuration>,
    devices: Arc<Mutex<DeviceMap>>,
    scheduler: Scheduler,
    repeater: Arc<CommandRepeater<f32>>,
    dispatcher: Arc<SetpointDispatcher>,
}

fn device_from_entry(entry: &DeviceEntry) -> Device {
    Device::new(
        entry.name.clone(),
        entry.entity(),
        entry.client_name(),
        entry.params(),
    )
}

impl Controller {
    pub fn start(configuration: Configuration, transport: Arc<dyn DeviceTransport>) -> Self {
        Self::start_with(configuration, transport, ControllerOptions::default())
    }

    pub fn start_with(
        configuration: Configuration,
        transport: Arc<dyn DeviceTransport>,
        options: ControllerOptions,
    ) -> Self {
        let devices: DeviceMap = configuration
            .devices()
            .iter()
            .map(|entry| (entry.name.clone(), device_from_entry(entry)))
            .collect();
        let devices = Arc::new(Mutex::new(devices));

        let repeater = Arc::new(CommandRepeater::start_with_interval(
            Duration::from_secs(configuration.repeat_delay_sec()),
            options.repeat_check_interval,
        ));
        let dispatcher = Arc::new(SetpointDispatcher {
            devices: devices.clone(),
            repeater: repeater.clone(),
            transport,
        });
        let scheduler = Scheduler::start(
            configuration.scheduler(),
            dispatcher.clone(),
            devices.clone(),
            SchedulerOptions {
                init_delay: options
                    .init_delay
                    .unwrap_or_else(|| Duration::from_secs(configuration.init_delay_sec())),
                policy: configuration.manual_mode_reset(),
                tick_interval: options.tick_interval,
                timezone: configuration.timezone(),
            },
        );

        Self {
            configuration: tokio::sync::Mutex::new(configuration),
            devices,
            scheduler,
            repeater,
            dispatcher,
        }
    }

    pub async fn stop(&self) {
        self.scheduler.stop().await;
        self.repeater.stop().await;
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn repeater(&self) -> &CommandRepeater<f32> {
        &self.repeater
    }

    pub async fn configuration(&self) -> tokio::sync::MutexGuard<'_, Configuration> {
        self.configuration.lock().await
    }

    pub fn device(&self, name: &str) -> Option<Device> {
        lock(&self.devices).get(name).cloned()
    }

    pub fn device_names(&self) -> Vec<String> {
        lock(&self.devices).keys().cloned().collect()
    }

    pub fn set_test_time(&self, time: Option<NaiveDateTime>) {
        self.scheduler.set_test_time(time);
    }

    pub fn get_setpoints(&self, at: Option<NaiveDateTime>) -> Resolution {
        self.scheduler.get_setpoints(at)
    }

    /// A device reported its live setpoint. The pending command is dropped
    /// once confirmed, or when the user took over the device.
    pub fn on_device_setpoint(&self, name: &str, value: f32) -> bool {
        let entered_manual = self.scheduler.on_device_setpoint(name, value);
        let confirmed = self.repeater.pending_payload(name, SETPOINT_COMMAND) == Some(value);
        if confirmed || entered_manual {
            self.repeater.remove(name, SETPOINT_COMMAND);
        }
        entered_manual
    }

    pub fn on_device_current_temperature(&self, name: &str, temperature: f32) {
        let now = self.scheduler.now();
        if let Some(device) = lock(&self.devices).get_mut(name) {
            device.current_temperature = temperature;
            device.last_update = Some(now);
        }
    }

    /// A device that becomes reachable gets its scheduled setpoint again.
    pub fn on_device_state(&self, name: &str, available: bool) {
        let resend = {
            let mut devices = lock(&self.devices);
            let Some(device) = devices.get_mut(name) else {
                return;
            };
            let came_back = available && !device.available;
            device.available = available;
            if !available {
                info!(device = name, "device unavailable");
            }
            came_back.then_some(device.scheduled_setpoint).flatten()
        };
        if let Some(setpoint) = resend {
            info!(device = name, setpoint, "device available, sending scheduled setpoint");
            self.dispatcher.send_setpoint(name, setpoint, true);
        }
    }

    pub fn on_devices_connect(&self, names: &[String]) {
        for name in names {
            if let Some(device) = lock(&self.devices).get_mut(name) {
                device.available = true;
            }
        }
        self.scheduler.on_devices_connect(names);
    }

    /// Sends a setpoint requested by a user.
    pub fn set_device_setpoint(&self, name: &str, value: f32) -> CfgResult<()> {
        if !lock(&self.devices).contains_key(name) {
            return Err(CfgError::bad_reference("/devices", name));
        }
        self.dispatcher.send_setpoint(name, value, false);
        Ok(())
    }

    /// Runs a store mutation and hands the committed snapshot to the scheduler.
    async fn update<T>(
        &self,
        change: impl FnOnce(&mut Configuration) -> CfgResult<T>,
    ) -> CfgResult<(T, SchedulerConfig)> {
        let mut configuration = self.configuration.lock().await;
        let result = change(&mut *configuration)?;
        Ok((result, configuration.scheduler()))
    }

    pub async fn add_device(&self, name: &str, entity: &str, client: &str, params: Value) -> CfgResult<()> {
        let (device, snapshot) = self
            .update(|configuration| {
                configuration.add_device(name, entity, client, params)?;
                Ok(configuration.device(name).map(device_from_entry))
            })
            .await?;
        if let Some(device) = device {
            lock(&self.devices).insert(name.to_string(), device);
        }
        self.scheduler.set_scheduler(snapshot);
        Ok(())
    }

    pub async fn change_device_entity(&self, name: &str, entity: &str, params: Value) -> CfgResult<()> {
        let (_, snapshot) = self
            .update(|configuration| configuration.change_device_entity(name, entity, params.clone()))
            .await?;
        if let Some(device) = lock(&self.devices).get_mut(name) {
            device.entity = entity.to_string();
            device.params = params;
        }
        self.scheduler.set_scheduler(snapshot);
        Ok(())
    }

    pub async fn delete_device(&self, name: &str) -> CfgResult<()> {
        let (_, snapshot) = self
            .update(|configuration| configuration.delete_device(name))
            .await?;
        lock(&self.devices).remove(name);
        self.repeater.remove_all_for(name);
        self.scheduler.set_scheduler(snapshot);
        Ok(())
    }

    /// Renames a device in the store, the device map, the repeater and the
    /// scheduler without resending its setpoint.
    pub async fn change_device_name(&self, old: &str, new: &str) -> CfgResult<()> {
        let (_, snapshot) = self
            .update(|configuration| configuration.change_device_name(old, new))
            .await?;
        let devices = {
            let mut devices = lock(&self.devices);
            if let Some(mut device) = devices.remove(old) {
                device.name = new.to_string();
                devices.insert(new.to_string(), device);
            }
            devices.clone()
        };
        self.repeater.rename_subject(old, new);
        self.scheduler.on_devices(devices, snapshot);
        Ok(())
    }

    pub async fn set_devices_order(&self, names: &[String]) -> CfgResult<()> {
        self.update(|configuration| configuration.set_devices_order(names))
            .await?;
        Ok(())
    }

    pub async fn set_schedule(&self, schedule: Schedule) -> CfgResult<()> {
        let alias = schedule.alias.clone();
        let (stored, _) = self
            .update(|configuration| {
                configuration.set_schedule(schedule)?;
                Ok(configuration.schedule(&alias).cloned())
            })
            .await?;
        if let Some(stored) = stored {
            self.scheduler.set_schedule(stored);
        }
        Ok(())
    }

    pub async fn set_schedules_order(&self, aliases: &[String]) -> CfgResult<()> {
        let (_, snapshot) = self
            .update(|configuration| configuration.set_schedules_order(aliases))
            .await?;
        self.scheduler.set_scheduler(snapshot);
        Ok(())
    }

    pub async fn set_active_schedule(&self, alias: &str) -> CfgResult<()> {
        let (_, snapshot) = self
            .update(|configuration| configuration.set_active_schedule(alias))
            .await?;
        self.scheduler.on_active_schedule_changed(snapshot);
        Ok(())
    }

    pub async fn set_temperature_sets(&self, sets: Vec<TemperatureSet>, scope: Option<&str>) -> CfgResult<()> {
        let (_, snapshot) = self
            .update(|configuration| configuration.set_temperature_sets(sets, scope))
            .await?;
        self.scheduler.set_scheduler(snapshot);
        Ok(())
    }

    pub async fn change_schedule_name(&self, old: &str, new: &str) -> CfgResult<()> {
        let (_, snapshot) = self
            .update(|configuration| configuration.change_schedule_name(old, new))
            .await?;
        self.scheduler.set_scheduler(snapshot);
        Ok(())
    }

    pub async fn change_schedule_properties(&self, name: &str, new_name: &str, parent: Option<&str>) -> CfgResult<()> {
        let (_, snapshot) = self
            .update(|configuration| configuration.change_schedule_properties(name, new_name, parent))
            .await?;
        self.scheduler.set_scheduler(snapshot);
        Ok(())
    }

    pub async fn delete_schedule(&self, name: &str) -> CfgResult<()> {
        let (was_active, snapshot) = self
            .update(|configuration| {
                let was_active = configuration.scheduler().active_schedule() == Some(name);
                configuration.delete_schedule(name)?;
                Ok(was_active)
            })
            .await?;
        if was_active {
            self.scheduler.on_active_schedule_changed(snapshot);
        } else {
            self.scheduler.set_scheduler(snapshot);
        }
        Ok(())
    }

    pub async fn change_temperature_set_name(&self, old: &str, new: &str, scope: Option<&str>) -> CfgResult<()> {
        let (_, snapshot) = self
            .update(|configuration| configuration.change_temperature_set_name(old, new, scope))
            .await?;
        self.scheduler.set_scheduler(snapshot);
        Ok(())
    }

    pub async fn set_manual_mode_reset_event(&self, value: ResetEventValue) -> CfgResult<ManualModeReset> {
        let (policy, snapshot) = self
            .update(|configuration| configuration.set_manual_mode_reset_event(value))
            .await?;
        self.scheduler.set_manual_mode_reset_event(policy);
        self.scheduler.set_scheduler(snapshot);
        Ok(policy)
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use heating_common::ConfigurationRoot;
    use pretty_assertions::assert_eq;

    use super::*;

    const DOCUMENT: &str = r#"
settings: {}
protocols: {}
remote_control: []
devices:
  - Kitchen:
      entity: climate.kitchen
      protocol: {name: mqtt, params: {}}
scheduler:
  active_schedule: Home
  settings:
    manual_mode_reset_event: 2
  temperature_sets:
    - alias: Day
      devices:
        - {device_name: Kitchen, setpoint: 18.0}
  schedules:
    - alias: Home
      schedule_items:
        - devices: [Kitchen]
          timeslots_sets:
            - dates: ["1", "2", "3", "4", "5", "6", "7"]
              timeslots:
                - {start_time: "00:00:00", temperature_set: Day}
"#;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(String, f32)>>,
    }

    impl RecordingTransport {
        fn sent(&self) -> Vec<(String, f32)> {
            lock(&self.sent).clone()
        }
    }

    impl DeviceTransport for RecordingTransport {
        fn send_setpoint(&self, device: &Device, setpoint: f32) -> anyhow::Result<()> {
            lock(&self.sent).push((device.name.clone(), setpoint));
            Ok(())
        }
    }

    fn start() -> (Controller, Arc<RecordingTransport>) {
        start_document(DOCUMENT)
    }

    fn start_document(document: &str) -> (Controller, Arc<RecordingTransport>) {
        let root: ConfigurationRoot = serde_saphyr::from_str(document).unwrap();
        let configuration = Configuration::from_root(root).unwrap();
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
        controller.set_test_time(Some(
            NaiveDate::from_ymd_opt(2025, 1, 20)
                .unwrap()
                .and_hms_opt(8, 0, 0)
                .unwrap(),
        ));
        (controller, transport)
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_setpoint_is_sent_and_repeated_until_confirmed() {
        let (controller, transport) = start();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(transport.sent(), [("Kitchen".to_string(), 18.0)]);
        assert_eq!(controller.repeater().pending_payload("Kitchen", SETPOINT_COMMAND), Some(18.0));

        tokio::time::sleep(Duration::from_secs(135)).await;
        assert_eq!(transport.sent().len(), 2);

        assert!(!controller.on_device_setpoint("Kitchen", 18.0));
        assert_eq!(controller.repeater().pending_count(), 0);
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(transport.sent().len(), 2);
        controller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn low_scheduled_setpoint_is_sent_unchanged() {
        let (controller, transport) = start_document(&DOCUMENT.replace("setpoint: 18.0", "setpoint: 5.0"));
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(transport.sent(), [("Kitchen".to_string(), 5.0)]);
        assert_eq!(controller.repeater().pending_payload("Kitchen", SETPOINT_COMMAND), Some(5.0));

        assert!(!controller.on_device_setpoint("Kitchen", 5.0));
        assert!(!controller.device("Kitchen").unwrap().is_in_manual_mode());
        assert_eq!(controller.repeater().pending_count(), 0);
        controller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn manual_change_clears_the_pending_command() {
        let (controller, _) = start();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(controller.on_device_setpoint("Kitchen", 21.0));
        assert!(controller.device("Kitchen").unwrap().is_in_manual_mode());
        assert_eq!(controller.repeater().pending_count(), 0);
        controller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconnecting_device_gets_its_setpoint_again() {
        let (controller, transport) = start();
        tokio::time::sleep(Duration::from_secs(2)).await;
        controller.on_device_setpoint("Kitchen", 18.0);

        controller.on_device_state("Kitchen", true);
        assert_eq!(transport.sent().len(), 2);
        // Already available: nothing to resend.
        controller.on_device_state("Kitchen", true);
        assert_eq!(transport.sent().len(), 2);
        controller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn identical_user_setpoint_is_not_resent() {
        let (controller, transport) = start();
        tokio::time::sleep(Duration::from_secs(2)).await;

        controller.set_device_setpoint("Kitchen", 18.0).unwrap();
        assert_eq!(transport.sent().len(), 1);
        controller.set_device_setpoint("Kitchen", 19.5).unwrap();
        assert_eq!(transport.sent().last(), Some(&("Kitchen".to_string(), 19.5)));
        assert!(controller.set_device_setpoint("Garage", 19.5).is_err());
        controller.stop().await;
    }
}
