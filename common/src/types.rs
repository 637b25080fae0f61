use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Runtime view of a heating device. Owned by the orchestrator; the scheduler
/// only touches `scheduled_setpoint` and `manual_since`.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub name: String,
    pub entity: String,
    pub client_name: String,
    pub params: Value,
    pub current_temperature: f32,
    pub setpoint: f32,
    pub scheduled_setpoint: Option<f32>,
    /// Set while the device is in manual mode.
    pub manual_since: Option<NaiveDateTime>,
    pub available: bool,
    pub last_update: Option<NaiveDateTime>,
}

pub type DeviceMap = BTreeMap<String, Device>;

impl Device {
    pub fn new(
        name: impl Into<String>,
        entity: impl Into<String>,
        client_name: impl Into<String>,
        params: Value,
    ) -> Self {
        Self {
            name: name.into(),
            entity: entity.into(),
            client_name: client_name.into(),
            params,
            current_temperature: 0.0,
            setpoint: 0.0,
            scheduled_setpoint: None,
            manual_since: None,
            available: false,
            last_update: None,
        }
    }

    pub fn has_scheduled_setpoint(&self) -> bool {
        self.scheduled_setpoint.is_some()
    }

    pub fn is_in_manual_mode(&self) -> bool {
        self.manual_since.is_some()
    }

    pub fn enter_manual_mode(&mut self, now: NaiveDateTime) {
        self.manual_since = Some(now);
    }

    pub fn exit_manual_mode(&mut self) {
        self.manual_since = None;
    }
}

/// What the scheduler wants a device to do.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceSetpoint {
    NoSetpoint,
    Scheduled(f32),
    Manual,
}

impl DeviceSetpoint {
    pub fn value(self) -> Option<f32> {
        match self {
            Self::Scheduled(value) => Some(value),
            Self::NoSetpoint | Self::Manual => None,
        }
    }

    pub fn is_manual(self) -> bool {
        matches!(self, Self::Manual)
    }
}

/// When a device in manual mode goes back to its schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ManualModeReset {
    TimeslotChange,
    #[default]
    SetpointChange,
    AfterHours(u32),
}

impl ManualModeReset {
    pub const MIN_HOURS: i64 = 1;
    pub const MAX_HOURS: i64 = 24;

    fn from_hours(hours: i64) -> Option<Self> {
        (Self::MIN_HOURS..=Self::MAX_HOURS)
            .contains(&hours)
            .then(|| Self::AfterHours(hours as u32))
    }
}

impl fmt::Display for ManualModeReset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimeslotChange => f.write_str("timeslot_change"),
            Self::SetpointChange => f.write_str("setpoint_change"),
            Self::AfterHours(hours) => write!(f, "{hours}"),
        }
    }
}

impl FromStr for ManualModeReset {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "timeslot_change" => Ok(Self::TimeslotChange),
            "setpoint_change" => Ok(Self::SetpointChange),
            other => other
                .parse::<i64>()
                .ok()
                .and_then(Self::from_hours)
                .ok_or_else(|| value.to_string()),
        }
    }
}

/// `manual_mode_reset_event` as written in the document: a policy name or a
/// number of hours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResetEventValue {
    Hours(i64),
    Name(String),
}

impl ResetEventValue {
    pub fn policy(&self) -> Option<ManualModeReset> {
        match self {
            Self::Hours(hours) => ManualModeReset::from_hours(*hours),
            Self::Name(name) => name.parse().ok(),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Hours(hours) => Value::from(*hours),
            Self::Name(name) => Value::from(name.clone()),
        }
    }
}

impl From<ManualModeReset> for ResetEventValue {
    fn from(policy: ManualModeReset) -> Self {
        match policy {
            ManualModeReset::AfterHours(hours) => Self::Hours(hours.into()),
            other => Self::Name(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_event_accepts_names_and_hour_ranges() {
        assert_eq!(
            ResetEventValue::Name("timeslot_change".into()).policy(),
            Some(ManualModeReset::TimeslotChange)
        );
        assert_eq!(
            ResetEventValue::Name("6".into()).policy(),
            Some(ManualModeReset::AfterHours(6))
        );
        assert_eq!(
            ResetEventValue::Hours(24).policy(),
            Some(ManualModeReset::AfterHours(24))
        );
        assert_eq!(ResetEventValue::Hours(25).policy(), None);
        assert_eq!(ResetEventValue::Hours(0).policy(), None);
        assert_eq!(ResetEventValue::Name("test_value".into()).policy(), None);
    }

    #[test]
    fn manual_mode_flags_follow_timestamp() {
        let mut device = Device::new("Kitchen", "climate.kitchen", "mqtt", Value::Null);
        assert!(!device.is_in_manual_mode());

        let now = chrono::NaiveDate::from_ymd_opt(2025, 1, 20)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        device.enter_manual_mode(now);
        assert!(device.is_in_manual_mode());

        device.exit_manual_mode();
        assert!(!device.is_in_manual_mode());
    }
}
