//! Referential integrity checks over a configuration document. Every check is
//! fail-fast: the first problem found is returned.

use std::collections::HashSet;

use serde_json::Value;

use crate::{
    config::{ConfigurationRoot, DeviceEntry},
    error::{CfgError, CfgResult},
    schedule::{Schedule, ScheduleItem, SchedulerConfig, StartTime, TemperatureSet, WEEKDAYS},
    types::{ManualModeReset, ResetEventValue},
};

pub const RESET_EVENT_PATH: &str = "/scheduler.settings.manual_mode_reset_event";

/// Fills defaults and rewrites legacy encodings in place. Returns true when
/// the document changed and should be persisted.
pub fn normalize(root: &mut ConfigurationRoot) -> bool {
    let mut changed = false;

    let settings = root.settings.get_or_insert_with(|| {
        changed = true;
        Default::default()
    });
    changed |= settings.apply_defaults();

    if let Some(scheduler) = root.scheduler.as_mut() {
        changed |= normalize_scheduler(scheduler);
    }
    changed
}

pub fn normalize_scheduler(scheduler: &mut SchedulerConfig) -> bool {
    let mut changed = false;

    let settings = &mut scheduler.settings;
    if settings.manual_mode_reset_event.is_none() {
        settings.manual_mode_reset_event = Some(ManualModeReset::default().into());
        changed = true;
    }

    for schedule in &mut scheduler.schedules {
        for timeslot in schedule.timeslots_mut() {
            changed |= timeslot.start_time.normalize();
        }
    }
    changed
}

pub fn validate(root: &ConfigurationRoot) -> CfgResult<()> {
    let missing: Vec<&str> = [
        ("settings", root.settings.is_none()),
        ("protocols", root.protocols.is_none()),
        ("remote_control", root.remote_control.is_none()),
        ("scheduler", root.scheduler.is_none()),
    ]
    .into_iter()
    .filter_map(|(node, absent)| absent.then_some(node))
    .collect();
    if !missing.is_empty() {
        return Err(CfgError::missing_nodes("/", None, &missing));
    }

    validate_devices(root.devices())?;
    validate_remote_control(root.remote_control.as_ref())?;
    if let Some(scheduler) = &root.scheduler {
        validate_scheduler(scheduler, root.devices())?;
    }
    Ok(())
}

pub fn validate_devices(devices: &[DeviceEntry]) -> CfgResult<()> {
    let mut names = HashSet::new();
    for device in devices {
        if device.name.is_empty() {
            return Err(CfgError::bad_value("/devices", None, Value::from("")));
        }
        if !names.insert(device.name.as_str()) {
            return Err(CfgError::duplicate_key("/devices", None, &device.name));
        }

        let missing: Vec<&str> = [
            ("entity", device.config.entity.is_none()),
            ("protocol", device.config.protocol.is_none()),
        ]
        .into_iter()
        .filter_map(|(node, absent)| absent.then_some(node))
        .collect();
        if !missing.is_empty() {
            return Err(CfgError::missing_nodes(
                format!("/devices/{}", device.name),
                None,
                &missing,
            ));
        }
    }
    Ok(())
}

fn missing_keys<'a>(value: &Value, keys: &[&'a str]) -> Vec<&'a str> {
    keys.iter()
        .copied()
        .filter(|key| value.get(key).map_or(true, Value::is_null))
        .collect()
}

pub fn validate_remote_control(remote_control: Option<&Value>) -> CfgResult<()> {
    let Some(Value::Array(items)) = remote_control else {
        return Err(CfgError::expected_list("/remote_control"));
    };

    for item in items {
        let missing = missing_keys(item, &["name", "protocol"]);
        if !missing.is_empty() {
            return Err(CfgError::missing_nodes("/remote_control", None, &missing));
        }
        let missing = missing_keys(&item["protocol"], &["name", "params"]);
        if !missing.is_empty() {
            return Err(CfgError::missing_nodes(
                "/remote_control/protocol",
                None,
                &missing,
            ));
        }
    }
    Ok(())
}

pub fn validate_reset_event(value: &ResetEventValue) -> CfgResult<ManualModeReset> {
    value
        .policy()
        .ok_or_else(|| CfgError::bad_value(RESET_EVENT_PATH, None, value.to_json()))
}

fn schedule_path(alias: &str) -> String {
    format!("/scheduler/schedules['{alias}']")
}

fn temperature_sets_path(schedule: Option<&Schedule>) -> String {
    match schedule {
        None => "/scheduler/temperature_sets".to_string(),
        Some(schedule) => format!("{}/temperature_sets", schedule_path(&schedule.alias)),
    }
}

/// Checks the `scheduler` block against the declared devices.
pub fn validate_scheduler(scheduler: &SchedulerConfig, devices: &[DeviceEntry]) -> CfgResult<()> {
    let device_names: HashSet<&str> = devices.iter().map(|device| device.name.as_str()).collect();

    if let Some(value) = &scheduler.settings.manual_mode_reset_event {
        validate_reset_event(value)?;
    }

    if let Some(active) = scheduler.active_schedule() {
        if scheduler.schedule(active).is_none() {
            return Err(CfgError::bad_reference("/scheduler/active_schedule", active));
        }
    }

    validate_temperature_sets(scheduler, None, &device_names)?;

    let mut aliases = HashSet::new();
    for schedule in &scheduler.schedules {
        let node_path = "/scheduler/schedules";
        if schedule.alias.is_empty() {
            return Err(CfgError::bad_value(node_path, None, Value::from("")));
        }
        if !aliases.insert(schedule.alias.as_str()) {
            return Err(CfgError::duplicate_key(
                node_path,
                Some(&schedule.alias),
                &schedule.alias,
            ));
        }

        validate_temperature_sets(scheduler, Some(schedule), &device_names)?;

        if schedule.schedule_items.is_empty() {
            return Err(CfgError::empty_list(
                node_path,
                Some(&schedule.alias),
                "schedule_items",
            ));
        }

        if let Some(parent) = &schedule.parent_schedule {
            if scheduler.schedule(parent).is_none() {
                return Err(CfgError::bad_reference_at(
                    schedule_path(&schedule.alias),
                    Some("parent_schedule"),
                    parent,
                ));
            }
        }

        let mut scheduled_devices = HashSet::new();
        for (idx, item) in schedule.schedule_items.iter().enumerate() {
            for device in &item.devices {
                if !scheduled_devices.insert(device.as_str()) {
                    return Err(CfgError::duplicate_key(
                        format!("{}/schedule_items/devices", schedule_path(&schedule.alias)),
                        None,
                        device,
                    ));
                }
            }
            validate_schedule_item(scheduler, schedule, idx, item, &device_names)?;
        }
    }

    detect_schedule_cycles(scheduler)?;
    detect_temperature_set_cycles(scheduler)
}

fn validate_temperature_sets(
    scheduler: &SchedulerConfig,
    schedule: Option<&Schedule>,
    device_names: &HashSet<&str>,
) -> CfgResult<()> {
    let node_path = temperature_sets_path(schedule);
    let sets = match schedule {
        None => scheduler.global_temperature_sets(),
        Some(schedule) => schedule.local_temperature_sets(),
    };

    let mut aliases = HashSet::new();
    for set in sets {
        if set.alias.is_empty() {
            return Err(CfgError::bad_value(&node_path, None, Value::from("")));
        }
        if !aliases.insert(set.alias.as_str()) {
            return Err(CfgError::duplicate_key(&node_path, None, &set.alias));
        }

        let set_path = format!("{node_path}['{}']", set.alias);
        if let Some(parent) = &set.parent {
            if scheduler.find_temperature_set(parent, schedule).is_none() {
                return Err(CfgError::bad_reference(format!("{set_path}/parent"), parent));
            }
        }

        for (idx, entry) in set.devices.iter().enumerate() {
            let entry_path = format!("{set_path}/devices['{idx}']");
            if !device_names.contains(entry.device_name.as_str()) {
                return Err(CfgError::bad_reference(
                    format!("{entry_path}/device_name"),
                    &entry.device_name,
                ));
            }
            if !entry.setpoint.is_finite() {
                return Err(CfgError::bad_value(
                    format!("{entry_path}/setpoint"),
                    None,
                    Value::from(entry.setpoint.to_string()),
                ));
            }
        }
    }
    Ok(())
}

fn validate_schedule_item(
    scheduler: &SchedulerConfig,
    schedule: &Schedule,
    idx: usize,
    item: &ScheduleItem,
    device_names: &HashSet<&str>,
) -> CfgResult<()> {
    let items_path = format!("{}/schedule_items", schedule_path(&schedule.alias));
    let idx_key = idx.to_string();

    if item.devices.is_empty() {
        return Err(CfgError::empty_list(&items_path, Some(&idx_key), "devices"));
    }
    if item.timeslots_sets.is_empty() {
        return Err(CfgError::empty_list(
            &items_path,
            Some(&idx_key),
            "timeslots_sets",
        ));
    }

    let item_path = format!("{items_path}['{idx}']");
    for device in &item.devices {
        if !device_names.contains(device.as_str()) {
            return Err(CfgError::bad_reference(format!("{item_path}/devices"), device));
        }
    }

    let sets_path = format!("{item_path}/timeslots_sets");
    let mut weekdays = HashSet::new();
    for (set_idx, set) in item.timeslots_sets.iter().enumerate() {
        if set.dates.is_empty() {
            return Err(CfgError::missing_nodes(
                &sets_path,
                Some(&set_idx.to_string()),
                &["dates"],
            ));
        }
        let standard = set.timeslots.is_some();
        if standard == set.is_alternating() {
            return Err(CfgError::missing_nodes(
                &sets_path,
                None,
                &["timeslots[_A|_B]"],
            ));
        }

        let set_path = format!("{sets_path}['{set_idx}']");
        for (date_idx, date) in set.dates.iter().enumerate() {
            if !WEEKDAYS.contains(&date.as_str()) {
                return Err(CfgError::bad_value(
                    format!("{set_path}/dates"),
                    Some(&date_idx.to_string()),
                    Value::from(date.clone()),
                ));
            }
            if !weekdays.insert(date.as_str()) {
                return Err(CfgError::duplicate_key(format!("{set_path}/dates"), None, date));
            }
        }

        for timeslots in set.sequences() {
            for (slot_idx, timeslot) in timeslots.iter().enumerate() {
                let slot_path = format!("{set_path}/timeslots['{slot_idx}']");
                if let StartTime::Invalid(raw) = &timeslot.start_time {
                    return Err(CfgError::bad_value(
                        format!("{slot_path}/start_time"),
                        None,
                        Value::from(raw.clone()),
                    ));
                }
                if scheduler
                    .find_temperature_set(&timeslot.temperature_set, Some(schedule))
                    .is_none()
                {
                    return Err(CfgError::bad_reference(
                        format!("{slot_path}/temperature_set"),
                        &timeslot.temperature_set,
                    ));
                }
            }
        }
    }
    Ok(())
}

fn detect_schedule_cycles(scheduler: &SchedulerConfig) -> CfgResult<()> {
    for schedule in &scheduler.schedules {
        let mut visited = vec![schedule.alias.clone()];
        let mut current = schedule;

        while let Some(parent) = current.parent_schedule.as_deref() {
            let Some(next) = scheduler.schedule(parent) else {
                break;
            };
            if visited.iter().any(|alias| *alias == next.alias) {
                return Err(CfgError::circular_ref(schedule_path(&schedule.alias), &visited));
            }
            visited.push(next.alias.clone());
            current = next;
        }
    }
    Ok(())
}

fn detect_temperature_set_cycles(scheduler: &SchedulerConfig) -> CfgResult<()> {
    let scopes = std::iter::once(None).chain(scheduler.schedules.iter().map(Some));

    for scope in scopes {
        let sets = match scope {
            None => scheduler.global_temperature_sets(),
            Some(schedule) => schedule.local_temperature_sets(),
        };
        for set in sets {
            check_temperature_set_chain(scheduler, scope, set)?;
        }
    }
    Ok(())
}

fn check_temperature_set_chain(
    scheduler: &SchedulerConfig,
    scope: Option<&Schedule>,
    set: &TemperatureSet,
) -> CfgResult<()> {
    let mut visited = vec![set.alias.clone()];
    let mut current = set;

    while let Some(parent) = current.parent.as_deref() {
        let Some(next) = scheduler.find_temperature_set(parent, scope) else {
            break;
        };
        if visited.iter().any(|alias| *alias == next.alias) {
            return Err(CfgError::circular_ref(
                format!("{}['{}']", temperature_sets_path(scope), set.alias),
                &visited,
            ));
        }
        visited.push(next.alias.clone());
        current = next;
    }
    Ok(())
}
