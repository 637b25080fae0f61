use std::collections::{BTreeMap, BTreeSet};

use chrono::{Duration, NaiveDateTime};
use tracing::{debug, info};

use crate::{
    schedule::{diff_setpoints, ResolvedSetpoint, SetpointMap},
    types::{Device, DeviceMap, DeviceSetpoint, ManualModeReset},
};

/// Payload of a setpoints notification: every known device, scheduled or not.
pub type SetpointNotification = BTreeMap<String, DeviceSetpoint>;

/// Records a setpoint reported by a device. A report that disagrees with the
/// scheduled value puts the device in manual mode; a new manual value restarts
/// the manual period.
pub fn track_device_setpoint(device: &mut Device, value: f32, now: NaiveDateTime) -> bool {
    let changed = device.setpoint != value;
    device.setpoint = value;

    match device.scheduled_setpoint {
        Some(scheduled) if scheduled != value && (changed || !device.is_in_manual_mode()) => {
            info!(device = %device.name, scheduled, value, "entering manual setpoint mode");
            device.enter_manual_mode(now);
            true
        }
        _ => false,
    }
}

/// Whether a device in manual mode goes back to its schedule on this tick.
pub fn should_leave_manual(
    policy: ManualModeReset,
    device: &Device,
    previous: Option<&ResolvedSetpoint>,
    next: Option<&ResolvedSetpoint>,
    now: NaiveDateTime,
) -> bool {
    // Nothing to override, or the device already sits on its scheduled value.
    match next {
        None => return true,
        Some(next) if next.setpoint == device.setpoint => return true,
        Some(_) => {}
    }

    match policy {
        ManualModeReset::AfterHours(hours) => device
            .manual_since
            .map_or(true, |since| now - since >= Duration::hours(hours.into())),
        ManualModeReset::TimeslotChange => match (previous, next) {
            (Some(previous), Some(next)) => previous.timeslot_start != next.timeslot_start,
            (previous, next) => previous.is_some() != next.is_some(),
        },
        ManualModeReset::SetpointChange => match (previous, next) {
            (Some(previous), Some(next)) => previous.setpoint != next.setpoint,
            (None, Some(_)) => true,
            _ => false,
        },
    }
}

/// Change detection between ticks, with the manual-mode exit rules applied.
#[derive(Debug, Clone, Default)]
pub struct SetpointTracker {
    policy: ManualModeReset,
    current: SetpointMap,
}

impl SetpointTracker {
    pub fn new(policy: ManualModeReset) -> Self {
        Self {
            policy,
            current: SetpointMap::new(),
        }
    }

    pub fn policy(&self) -> ManualModeReset {
        self.policy
    }

    pub fn set_policy(&mut self, policy: ManualModeReset) {
        self.policy = policy;
    }

    pub fn current(&self) -> &SetpointMap {
        &self.current
    }

    pub fn current_setpoint(&self, device: &str) -> Option<f32> {
        self.current.get(device).map(|resolved| resolved.setpoint)
    }

    /// Adopts `setpoints` as already delivered, so the next tick reports no change.
    pub fn replace_silently(&mut self, setpoints: SetpointMap) {
        self.current = setpoints;
    }

    /// Forgets a device so the next tick delivers its setpoint again.
    pub fn evict(&mut self, device: &str) -> bool {
        self.current.remove(device).is_some()
    }

    pub fn clear(&mut self) {
        self.current.clear();
    }

    /// Compares `next` with the last delivered setpoints. Returns the full
    /// notification when something changed for at least one device.
    pub fn tick(
        &mut self,
        next: SetpointMap,
        devices: &mut DeviceMap,
        now: NaiveDateTime,
    ) -> Option<SetpointNotification> {
        let mut changes = diff_setpoints(&self.current, &next);
        let mut released = false;
        let mut manual = BTreeSet::new();

        for (name, device) in devices.iter_mut() {
            if !device.is_in_manual_mode() {
                continue;
            }
            if should_leave_manual(
                self.policy,
                device,
                self.current.get(name),
                next.get(name),
                now,
            ) {
                info!(device = %name, "leaving manual setpoint mode");
                device.exit_manual_mode();
                released = true;
            } else {
                changes.remove(name);
                manual.insert(name.clone());
            }
        }

        // Refreshed even when nothing is sent.
        self.current = next;
        for (name, device) in devices.iter_mut() {
            device.scheduled_setpoint = self.current_setpoint(name);
        }

        if changes.is_empty() && !released {
            return None;
        }
        debug!(?changes, "setpoints changed");

        let mut notification: SetpointNotification = self
            .current
            .iter()
            .map(|(name, resolved)| (name.clone(), DeviceSetpoint::Scheduled(resolved.setpoint)))
            .collect();
        for (name, device) in devices.iter() {
            let setpoint = if manual.contains(name) {
                DeviceSetpoint::Manual
            } else {
                device
                    .scheduled_setpoint
                    .map_or(DeviceSetpoint::NoSetpoint, DeviceSetpoint::Scheduled)
            };
            notification.insert(name.clone(), setpoint);
        }

        Some(notification)
    }

    /// Setpoints already delivered for `names`, used when devices become reachable.
    pub fn known_setpoints<'a>(
        &self,
        names: impl IntoIterator<Item = &'a str>,
    ) -> SetpointNotification {
        names
            .into_iter()
            .filter_map(|name| {
                self.current_setpoint(name)
                    .map(|setpoint| (name.to_string(), DeviceSetpoint::Scheduled(setpoint)))
            })
            .collect()
    }
}

/// Puts every device back on its schedule; returns the released names.
pub fn reset_manual_mode(devices: &mut DeviceMap) -> Vec<String> {
    devices
        .values_mut()
        .filter(|device| device.is_in_manual_mode())
        .map(|device| {
            info!(device = %device.name, "leaving manual setpoint mode");
            device.exit_manual_mode();
            device.name.clone()
        })
        .collect()
}
