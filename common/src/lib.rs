pub mod config;
pub mod engine;
pub mod error;
pub mod schedule;
pub mod types;
pub mod validate;

pub use config::{ConfigurationRoot, DeviceEntry, Settings, FORMAT_VERSION};
pub use engine::{SetpointNotification, SetpointTracker};
pub use error::{CfgError, CfgErrorKind, CfgResult};
pub use schedule::{
    Resolution, ResolvedSetpoint, Schedule, ScheduleItem, SchedulerConfig, SetpointChange,
    SetpointMap, TemperatureSet, Timeslot, TimeslotsSet,
};
pub use types::{Device, DeviceMap, DeviceSetpoint, ManualModeReset, ResetEventValue};
