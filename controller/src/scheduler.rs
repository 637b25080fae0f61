use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{Local, NaiveDateTime, Timelike, Utc};
use chrono_tz::Tz;
use tokio::{
    sync::{watch, Notify},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, error, info, warn};

use heating_common::{
    engine::{reset_manual_mode, track_device_setpoint},
    DeviceMap, ManualModeReset, Resolution, Schedule, SchedulerConfig, SetpointMap,
    SetpointNotification, SetpointTracker,
};

use crate::lock;

/// Receives the setpoints to apply. Called from the scheduler task; it must
/// not block nor call back into the scheduler synchronously.
pub trait SetpointSink: Send + Sync + 'static {
    fn apply_devices_setpoints(&self, setpoints: SetpointNotification);
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub init_delay: Duration,
    pub policy: ManualModeReset,
    /// Fixed tick period. Ticks follow minute boundaries when unset.
    pub tick_interval: Option<Duration>,
    pub timezone: Option<Tz>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            init_delay: Duration::from_secs(heating_common::config::DEFAULT_INIT_DELAY_SEC),
            policy: ManualModeReset::default(),
            tick_interval: None,
            timezone: None,
        }
    }
}

struct SchedulerState {
    config: SchedulerConfig,
    tracker: SetpointTracker,
    test_time: Option<NaiveDateTime>,
    timezone: Option<Tz>,
}

impl SchedulerState {
    fn now(&self) -> NaiveDateTime {
        if let Some(time) = self.test_time {
            return time;
        }
        match self.timezone {
            Some(tz) => Utc::now().with_timezone(&tz).naive_local(),
            None => Local::now().naive_local(),
        }
    }
}

struct Shared {
    state: Mutex<SchedulerState>,
    devices: Arc<Mutex<DeviceMap>>,
    sink: Arc<dyn SetpointSink>,
    changed: Notify,
}

impl Shared {
    fn now(&self) -> NaiveDateTime {
        lock(&self.state).now()
    }

    /// Resolves the snapshot outside the lock, then runs change detection.
    fn tick(&self) -> bool {
        let (config, now) = {
            let state = lock(&self.state);
            (state.config.clone(), state.now())
        };

        let resolution = config.get_setpoints(now);
        if !resolution.complete {
            warn!(
                schedule = ?resolution.active_schedule,
                "setpoints only partially resolved"
            );
        }

        let notification = {
            let mut state = lock(&self.state);
            let mut devices = lock(&self.devices);
            state.tracker.tick(resolution.setpoints, &mut devices, now)
        };

        match notification {
            Some(setpoints) => {
                debug!(devices = setpoints.len(), "applying devices setpoints");
                self.sink.apply_devices_setpoints(setpoints);
                true
            }
            None => false,
        }
    }

    fn wake(&self) {
        self.changed.notify_one();
    }
}

/// Background service turning the active schedule into device setpoints.
pub struct Scheduler {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawns the tick task. The first tick happens after `init_delay`, to
    /// give devices time to report their state.
    pub fn start(
        config: SchedulerConfig,
        sink: Arc<dyn SetpointSink>,
        devices: Arc<Mutex<DeviceMap>>,
        options: SchedulerOptions,
    ) -> Self {
        info!(
            init_delay_sec = options.init_delay.as_secs(),
            policy = %options.policy,
            "starting scheduler"
        );
        let shared = Arc::new(Shared {
            state: Mutex::new(SchedulerState {
                config,
                tracker: SetpointTracker::new(options.policy),
                test_time: None,
                timezone: options.timezone,
            }),
            devices,
            sink,
            changed: Notify::new(),
        });
        let (shutdown, mut stopped) = watch::channel(false);

        let task = tokio::spawn({
            let shared = shared.clone();
            async move {
                lock(&shared.state).tracker.clear();
                tokio::select! {
                    biased;
                    _ = stopped.changed() => return,
                    _ = sleep(options.init_delay) => {}
                }

                loop {
                    shared.tick();
                    let wait = options
                        .tick_interval
                        .unwrap_or_else(|| until_next_minute(shared.now()));
                    tokio::select! {
                        biased;
                        _ = stopped.changed() => break,
                        _ = shared.changed.notified() => debug!("schedule changed"),
                        _ = sleep(wait) => {}
                    }
                }
                info!("scheduler stopped");
            }
        });

        Self {
            shared,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    /// Stops the tick task; no tick runs once this returns.
    pub async fn stop(&self) {
        info!("stopping scheduler");
        let _ = self.shutdown.send(true);
        let task = lock(&self.task).take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                error!("scheduler task failed: {err}");
            }
        }
    }

    pub fn now(&self) -> NaiveDateTime {
        self.shared.now()
    }

    /// Runs one tick immediately. Returns whether setpoints were delivered.
    pub fn tick(&self) -> bool {
        self.shared.tick()
    }

    /// Replaces the snapshot. A different active schedule releases manual
    /// devices like `on_active_schedule_changed`.
    pub fn set_scheduler(&self, config: SchedulerConfig) {
        let switched = lock(&self.shared.state).config.active_schedule() != config.active_schedule();
        if switched {
            self.on_active_schedule_changed(config);
        } else {
            lock(&self.shared.state).config = config;
            self.shared.wake();
        }
    }

    /// Stores one edited schedule. Devices in manual mode go back to their
    /// schedule when the active one is edited.
    pub fn set_schedule(&self, schedule: Schedule) {
        let is_active = {
            let mut state = lock(&self.shared.state);
            let config = &mut state.config;
            let is_active = config.active_schedule() == Some(schedule.alias.as_str());
            match config.schedule_mut(&schedule.alias) {
                Some(existing) => *existing = schedule,
                None => config.schedules.push(schedule),
            }
            is_active
        };
        if is_active {
            reset_manual_mode(&mut lock(&self.shared.devices));
        }
        self.shared.wake();
    }

    pub fn on_active_schedule_changed(&self, config: SchedulerConfig) {
        info!(schedule = ?config.active_schedule(), "active schedule changed");
        lock(&self.shared.state).config = config;
        reset_manual_mode(&mut lock(&self.shared.devices));
        self.shared.wake();
    }

    /// Replaces the device map and the snapshot. The current setpoints are
    /// adopted as already delivered.
    pub fn on_devices(&self, devices: DeviceMap, config: SchedulerConfig) {
        let now = self.shared.now();
        let resolution = config.get_setpoints(now);

        let mut state = lock(&self.shared.state);
        let mut current = lock(&self.shared.devices);
        *current = devices;
        for (name, device) in current.iter_mut() {
            device.scheduled_setpoint = resolution.setpoints.get(name).map(|resolved| resolved.setpoint);
        }
        state.config = config;
        state.tracker.replace_silently(resolution.setpoints);
    }

    /// Delivers the device's scheduled setpoint again on the next tick.
    pub fn refresh_setpoint(&self, device: &str) {
        if lock(&self.shared.state).tracker.evict(device) {
            debug!(device, "setpoint refresh requested");
            self.shared.wake();
        }
    }

    pub fn set_test_time(&self, time: Option<NaiveDateTime>) {
        lock(&self.shared.state).test_time = time;
        self.shared.wake();
    }

    pub fn set_manual_mode_reset_event(&self, policy: ManualModeReset) {
        lock(&self.shared.state).tracker.set_policy(policy);
    }

    pub fn manual_mode_reset(&self) -> ManualModeReset {
        lock(&self.shared.state).tracker.policy()
    }

    /// Records the setpoint a device reports. Returns true when the device
    /// entered manual mode.
    pub fn on_device_setpoint(&self, device: &str, value: f32) -> bool {
        let now = self.shared.now();
        lock(&self.shared.devices)
            .get_mut(device)
            .is_some_and(|device| track_device_setpoint(device, value, now))
    }

    /// Re-delivers the known setpoints of devices that just became reachable.
    pub fn on_devices_connect(&self, names: &[String]) {
        let known = lock(&self.shared.state)
            .tracker
            .known_setpoints(names.iter().map(String::as_str));
        if known.is_empty() {
            return;
        }
        debug!(devices = known.len(), "delivering setpoints to connected devices");
        self.shared.sink.apply_devices_setpoints(known);
    }

    /// Resolves the snapshot at `at`, or now.
    pub fn get_setpoints(&self, at: Option<NaiveDateTime>) -> Resolution {
        let (config, now) = {
            let state = lock(&self.shared.state);
            (state.config.clone(), state.now())
        };
        config.get_setpoints(at.unwrap_or(now))
    }

    /// Setpoints delivered by the last tick.
    pub fn current_setpoints(&self) -> SetpointMap {
        lock(&self.shared.state).tracker.current().clone()
    }
}

fn until_next_minute(now: NaiveDateTime) -> Duration {
    let elapsed = Duration::new(u64::from(now.second()), now.nanosecond() % 1_000_000_000);
    Duration::from_secs(60)
        .saturating_sub(elapsed)
        .max(Duration::from_millis(1))
}
