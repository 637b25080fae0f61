use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{CfgError, CfgResult},
    schedule::SchedulerConfig,
};

pub const FORMAT_VERSION: u32 = 7;
pub const DEFAULT_REPEAT_DELAY_SEC: u64 = 120;
pub const DEFAULT_INIT_DELAY_SEC: u64 = 20;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MessageRepeaterSettings {
    #[serde(default)]
    pub repeat_delay_sec: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SchedulerStartupSettings {
    #[serde(default)]
    pub init_delay_sec: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub message_repeater: MessageRepeaterSettings,
    #[serde(default)]
    pub scheduler: SchedulerStartupSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_discovery: Option<Value>,
}

impl Settings {
    pub fn repeat_delay_sec(&self) -> u64 {
        self.message_repeater
            .repeat_delay_sec
            .filter(|delay| *delay > 0)
            .unwrap_or(DEFAULT_REPEAT_DELAY_SEC)
    }

    pub fn init_delay_sec(&self) -> u64 {
        self.scheduler
            .init_delay_sec
            .filter(|delay| *delay > 0)
            .unwrap_or(DEFAULT_INIT_DELAY_SEC)
    }

    /// Writes back the default of every absent or zero delay.
    pub fn apply_defaults(&mut self) -> bool {
        let mut changed = false;
        if self.message_repeater.repeat_delay_sec.unwrap_or(0) == 0 {
            self.message_repeater.repeat_delay_sec = Some(DEFAULT_REPEAT_DELAY_SEC);
            changed = true;
        }
        if self.scheduler.init_delay_sec.unwrap_or(0) == 0 {
            self.scheduler.init_delay_sec = Some(DEFAULT_INIT_DELAY_SEC);
            changed = true;
        }
        changed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub entity: Option<String>,
    #[serde(default)]
    pub protocol: Option<ProtocolRef>,
}

/// One entry of `devices`, persisted as a single-key map `Name: {entity, protocol}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, DeviceConfig>",
    into = "BTreeMap<String, DeviceConfig>"
)]
pub struct DeviceEntry {
    pub name: String,
    pub config: DeviceConfig,
}

impl DeviceEntry {
    pub fn new(name: impl Into<String>, entity: impl Into<String>, client: &str, params: Value) -> Self {
        Self {
            name: name.into(),
            config: DeviceConfig {
                entity: Some(entity.into()),
                protocol: Some(ProtocolRef {
                    name: client.to_string(),
                    params,
                }),
            },
        }
    }

    pub fn entity(&self) -> &str {
        self.config.entity.as_deref().unwrap_or_default()
    }

    pub fn client_name(&self) -> &str {
        self.config
            .protocol
            .as_ref()
            .map(|protocol| protocol.name.as_str())
            .unwrap_or_default()
    }

    pub fn params(&self) -> Value {
        self.config
            .protocol
            .as_ref()
            .map(|protocol| protocol.params.clone())
            .unwrap_or(Value::Null)
    }
}

impl TryFrom<BTreeMap<String, DeviceConfig>> for DeviceEntry {
    type Error = String;

    fn try_from(map: BTreeMap<String, DeviceConfig>) -> Result<Self, Self::Error> {
        if map.len() != 1 {
            return Err(format!(
                "a device entry must hold exactly one device, found {}",
                map.len()
            ));
        }
        let (name, config) = map
            .into_iter()
            .next()
            .ok_or_else(|| "empty device entry".to_string())?;
        Ok(Self { name, config })
    }
}

impl From<DeviceEntry> for BTreeMap<String, DeviceConfig> {
    fn from(entry: DeviceEntry) -> Self {
        BTreeMap::from([(entry.name, entry.config)])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteControlProtocol {
    pub name: String,
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteControlConfig {
    pub name: String,
    pub protocol: RemoteControlProtocol,
}

/// Whole persisted document. Shape checks that serde cannot express (mandatory
/// nodes, list shapes, references) belong to the validator.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConfigurationRoot {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub settings: Option<Settings>,
    #[serde(default)]
    pub protocols: Option<Value>,
    #[serde(default)]
    pub remote_control: Option<Value>,
    #[serde(default)]
    pub devices: Option<Vec<DeviceEntry>>,
    #[serde(default)]
    pub scheduler: Option<SchedulerConfig>,
}

impl ConfigurationRoot {
    pub fn settings(&self) -> Settings {
        self.settings.clone().unwrap_or_default()
    }

    pub fn devices(&self) -> &[DeviceEntry] {
        self.devices.as_deref().unwrap_or_default()
    }

    pub fn devices_mut(&mut self) -> &mut Vec<DeviceEntry> {
        self.devices.get_or_insert_with(Vec::new)
    }

    pub fn device(&self, name: &str) -> Option<&DeviceEntry> {
        self.devices().iter().find(|device| device.name == name)
    }

    pub fn device_mut(&mut self, name: &str) -> Option<&mut DeviceEntry> {
        self.devices_mut()
            .iter_mut()
            .find(|device| device.name == name)
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        self.scheduler.clone().unwrap_or_default()
    }

    pub fn scheduler_mut(&mut self) -> &mut SchedulerConfig {
        self.scheduler.get_or_insert_with(SchedulerConfig::default)
    }

    pub fn remote_controls(&self) -> CfgResult<Vec<RemoteControlConfig>> {
        match &self.remote_control {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|err| CfgError::exception("/remote_control", err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn device_entry_is_a_single_key_map() {
        let entry: DeviceEntry = serde_json::from_value(json!({
            "Kitchen": {"entity": "climate.kitchen", "protocol": {"name": "mqtt", "params": {"topic": "k"}}}
        }))
        .unwrap();

        assert_eq!(entry.name, "Kitchen");
        assert_eq!(entry.entity(), "climate.kitchen");
        assert_eq!(entry.client_name(), "mqtt");
        assert_eq!(entry.params(), json!({"topic": "k"}));
        assert_eq!(
            serde_json::to_value(&entry).unwrap(),
            json!({"Kitchen": {"entity": "climate.kitchen", "protocol": {"name": "mqtt", "params": {"topic": "k"}}}})
        );

        let two: Result<DeviceEntry, _> = serde_json::from_value(json!({"A": {}, "B": {}}));
        assert!(two.is_err());
    }

    #[test]
    fn zero_delays_fall_back_to_defaults() {
        let mut settings = Settings::default();
        settings.message_repeater.repeat_delay_sec = Some(0);
        assert_eq!(settings.repeat_delay_sec(), DEFAULT_REPEAT_DELAY_SEC);

        assert!(settings.apply_defaults());
        assert_eq!(settings.message_repeater.repeat_delay_sec, Some(120));
        assert_eq!(settings.scheduler.init_delay_sec, Some(20));
        assert!(!settings.apply_defaults());
    }
}
