//! File-backed configuration store. Every mutation is applied to a copy,
//! validated as a whole, then swapped in and persisted.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::SystemTime,
};

use chrono_tz::Tz;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use heating_common::{
    config::{RemoteControlConfig, Settings},
    schedule::Schedule,
    validate::{normalize, validate, validate_reset_event},
    CfgError, CfgResult, ConfigurationRoot, DeviceEntry, ManualModeReset, ResetEventValue,
    SchedulerConfig, TemperatureSet, FORMAT_VERSION,
};

const CONFIGURATION_FILE: &str = "configuration.yaml";
const DEFAULT_CONFIGURATION_FILE: &str = "default_configuration.yaml";
const TIMEZONE_PATH: &str = "/scheduler/settings/timezone";

#[derive(Deserialize)]
struct VersionHeader {
    #[serde(default)]
    version: u32,
}

pub struct Configuration {
    config_path: PathBuf,
    default_path: PathBuf,
    root: ConfigurationRoot,
    auto_save: bool,
}

impl Configuration {
    /// Loads `<dir>/<prefix>configuration.yaml`, falling back to the default
    /// template next to it.
    pub fn open(dir: impl AsRef<Path>, prefix: &str) -> CfgResult<Self> {
        Self::open_with(dir, prefix, true)
    }

    pub fn open_with(dir: impl AsRef<Path>, prefix: &str, auto_save: bool) -> CfgResult<Self> {
        let dir = dir.as_ref();
        let mut configuration = Self {
            config_path: dir.join(format!("{prefix}{CONFIGURATION_FILE}")),
            default_path: dir.join(format!("{prefix}{DEFAULT_CONFIGURATION_FILE}")),
            root: ConfigurationRoot::default(),
            auto_save,
        };
        configuration.load()?;
        Ok(configuration)
    }

    /// Builds a store around an in-memory document without touching disk.
    pub fn from_root(mut root: ConfigurationRoot) -> CfgResult<Self> {
        normalize(&mut root);
        check(&root)?;
        Ok(Self {
            config_path: PathBuf::from(CONFIGURATION_FILE),
            default_path: PathBuf::from(DEFAULT_CONFIGURATION_FILE),
            root,
            auto_save: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    pub fn load(&mut self) -> CfgResult<()> {
        let (path, from_template) = self.select_file();
        info!(path = %path.display(), "loading configuration");

        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(CfgError::missing_file(path.display()))
            }
            Err(err) => return Err(CfgError::exception("/", err)),
        };
        let mut root: ConfigurationRoot =
            serde_saphyr::from_str(&raw).map_err(CfgError::bad_file_content)?;

        let normalized = normalize(&mut root);
        check(&root)?;

        let migrated = root.version != FORMAT_VERSION;
        if migrated {
            info!(from = root.version, to = FORMAT_VERSION, "migrating configuration format");
        }
        self.root = root;
        if from_template || normalized || migrated {
            self.persist()?;
        }
        Ok(())
    }

    /// The current file is used when it is newer than the template and not
    /// of an older format.
    fn select_file(&self) -> (PathBuf, bool) {
        let Some(current) = modified(&self.config_path) else {
            return (self.default_path.clone(), true);
        };
        let Some(template) = modified(&self.default_path) else {
            return (self.config_path.clone(), false);
        };

        if current > template && file_version(&self.config_path) >= file_version(&self.default_path) {
            (self.config_path.clone(), false)
        } else {
            debug!("default configuration is newer than the current one");
            (self.default_path.clone(), true)
        }
    }

    /// Writes the document next to the current file, then renames it over.
    pub fn save(&mut self) -> CfgResult<()> {
        self.root.version = FORMAT_VERSION;
        let payload =
            serde_saphyr::to_string(&self.root).map_err(|err| CfgError::exception("/", err))?;

        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent).map_err(|err| CfgError::exception("/", err))?;
        }
        let tmp = self.config_path.with_extension("yaml.tmp");
        fs::write(&tmp, payload).map_err(|err| CfgError::exception("/", err))?;
        fs::rename(&tmp, &self.config_path).map_err(|err| CfgError::exception("/", err))?;
        debug!(path = %self.config_path.display(), "configuration saved");
        Ok(())
    }

    fn persist(&mut self) -> CfgResult<()> {
        if self.auto_save {
            self.save()
        } else {
            Ok(())
        }
    }

    pub fn root(&self) -> &ConfigurationRoot {
        &self.root
    }

    pub fn settings(&self) -> Settings {
        self.root.settings()
    }

    pub fn repeat_delay_sec(&self) -> u64 {
        self.settings().repeat_delay_sec()
    }

    pub fn init_delay_sec(&self) -> u64 {
        self.settings().init_delay_sec()
    }

    pub fn manual_mode_reset(&self) -> ManualModeReset {
        self.root
            .scheduler
            .as_ref()
            .map(|scheduler| scheduler.settings.manual_mode_reset())
            .unwrap_or_default()
    }

    pub fn timezone(&self) -> Option<Tz> {
        self.root
            .scheduler
            .as_ref()?
            .settings
            .timezone
            .as_deref()?
            .parse()
            .ok()
    }

    pub fn devices(&self) -> &[DeviceEntry] {
        self.root.devices()
    }

    pub fn device(&self, name: &str) -> Option<&DeviceEntry> {
        self.root.device(name)
    }

    /// Deep copy handed to the scheduler.
    pub fn scheduler(&self) -> SchedulerConfig {
        self.root.scheduler()
    }

    pub fn schedule(&self, alias: &str) -> Option<&Schedule> {
        self.root.scheduler.as_ref()?.schedule(alias)
    }

    pub fn temperature_sets(&self, scope: Option<&str>) -> Option<&[TemperatureSet]> {
        self.root.scheduler.as_ref()?.temperature_sets(scope)
    }

    pub fn remote_controls(&self) -> CfgResult<Vec<RemoteControlConfig>> {
        self.root.remote_controls()
    }

    /// Applies `change` to a copy of the document. The copy replaces the
    /// current document only when it validates and has been persisted.
    fn mutate<F>(&mut self, change: F) -> CfgResult<()>
    where
        F: FnOnce(&mut ConfigurationRoot) -> CfgResult<()>,
    {
        let mut candidate = self.root.clone();
        change(&mut candidate)?;
        normalize(&mut candidate);
        check(&candidate)?;

        let previous = std::mem::replace(&mut self.root, candidate);
        if let Err(err) = self.persist() {
            warn!("configuration change rolled back: {err:#}");
            self.root = previous;
            return Err(err);
        }
        Ok(())
    }

    pub fn add_device(&mut self, name: &str, entity: &str, client: &str, params: Value) -> CfgResult<()> {
        self.mutate(|root| {
            if name.is_empty() {
                return Err(CfgError::bad_value("/devices", None, json!(name)));
            }
            if root.device(name).is_some() {
                return Err(CfgError::duplicate_key("/devices", None, name));
            }
            root.devices_mut().push(DeviceEntry::new(name, entity, client, params));
            Ok(())
        })?;
        info!(device = name, "device added");
        Ok(())
    }

    pub fn change_device_entity(&mut self, name: &str, entity: &str, params: Value) -> CfgResult<()> {
        self.mutate(|root| {
            let device = root
                .device_mut(name)
                .ok_or_else(|| CfgError::bad_reference("/devices", name))?;
            let client = device.client_name().to_string();
            *device = DeviceEntry::new(name, entity, &client, params);
            Ok(())
        })
    }

    pub fn delete_device(&mut self, name: &str) -> CfgResult<()> {
        self.mutate(|root| {
            if root.device(name).is_none() {
                return Err(CfgError::bad_reference("/devices", name));
            }
            if root.scheduler().references_device(name) {
                return Err(CfgError::referenced_node(format!("/devices/{name}"), None));
            }
            root.devices_mut().retain(|device| device.name != name);
            Ok(())
        })?;
        info!(device = name, "device deleted");
        Ok(())
    }

    /// Renames a device and every reference the scheduler holds to it.
    pub fn change_device_name(&mut self, old: &str, new: &str) -> CfgResult<()> {
        self.mutate(|root| {
            if new.is_empty() {
                return Err(CfgError::bad_value("/devices", Some(old), json!(new)));
            }
            if root.device(new).is_some() {
                return Err(CfgError::duplicate_key("/devices", Some(old), new));
            }
            let device = root
                .device_mut(old)
                .ok_or_else(|| CfgError::bad_reference("/devices", old))?;
            device.name = new.to_string();
            if let Some(scheduler) = root.scheduler.as_mut() {
                scheduler.rename_device(old, new);
            }
            Ok(())
        })?;
        info!(old, new, "device renamed");
        Ok(())
    }

    pub fn set_devices_order(&mut self, names: &[String]) -> CfgResult<()> {
        self.mutate(|root| {
            let devices = root.devices_mut();
            let ordered = reorder(devices, names, "/devices", |device| &device.name)?;
            *devices = ordered;
            Ok(())
        })
    }

    /// Inserts the schedule, or replaces the one with the same alias.
    pub fn set_schedule(&mut self, schedule: Schedule) -> CfgResult<()> {
        let alias = schedule.alias.clone();
        self.mutate(|root| {
            if schedule.alias.is_empty() {
                return Err(CfgError::bad_value("/scheduler/schedules", None, json!("")));
            }
            let scheduler = root.scheduler_mut();
            match scheduler.schedule_mut(&schedule.alias) {
                Some(existing) => *existing = schedule,
                None => scheduler.schedules.push(schedule),
            }
            Ok(())
        })?;
        debug!(schedule = %alias, "schedule stored");
        Ok(())
    }

    pub fn set_schedules_order(&mut self, aliases: &[String]) -> CfgResult<()> {
        self.mutate(|root| {
            let schedules = &mut root.scheduler_mut().schedules;
            let ordered = reorder(schedules, aliases, "/scheduler/schedules", |schedule| {
                &schedule.alias
            })?;
            *schedules = ordered;
            Ok(())
        })
    }

    /// An empty alias deactivates scheduling.
    pub fn set_active_schedule(&mut self, alias: &str) -> CfgResult<()> {
        self.mutate(|root| {
            root.scheduler_mut().active_schedule =
                (!alias.is_empty()).then(|| alias.to_string());
            Ok(())
        })?;
        info!(schedule = alias, "active schedule changed");
        Ok(())
    }

    /// Replaces the global sets (`scope` is `None`) or those local to a schedule.
    pub fn set_temperature_sets(&mut self, sets: Vec<TemperatureSet>, scope: Option<&str>) -> CfgResult<()> {
        self.mutate(|root| {
            let scheduler = root.scheduler_mut();
            match scope {
                None => scheduler.temperature_sets = Some(sets),
                Some(alias) => {
                    scheduler
                        .schedule_mut(alias)
                        .ok_or_else(|| CfgError::bad_reference("/scheduler/schedules", alias))?
                        .temperature_sets = Some(sets);
                }
            }
            Ok(())
        })
    }

    pub fn change_schedule_name(&mut self, old: &str, new: &str) -> CfgResult<()> {
        self.mutate(|root| rename_schedule(root, old, new))?;
        info!(old, new, "schedule renamed");
        Ok(())
    }

    /// Renames a schedule and changes its parent in one step. An empty parent
    /// removes the inheritance.
    pub fn change_schedule_properties(&mut self, name: &str, new_name: &str, parent: Option<&str>) -> CfgResult<()> {
        self.mutate(|root| {
            if name != new_name {
                rename_schedule(root, name, new_name)?;
            }
            let schedule = root
                .scheduler_mut()
                .schedule_mut(new_name)
                .ok_or_else(|| CfgError::bad_reference("/scheduler/schedules", name))?;
            schedule.parent_schedule = parent.filter(|parent| !parent.is_empty()).map(str::to_string);
            Ok(())
        })
    }

    pub fn delete_schedule(&mut self, name: &str) -> CfgResult<()> {
        self.mutate(|root| {
            let scheduler = root.scheduler_mut();
            if scheduler.schedule(name).is_none() {
                return Err(CfgError::bad_reference("/scheduler/schedules", name));
            }
            if scheduler
                .schedules
                .iter()
                .any(|schedule| schedule.parent_schedule.as_deref() == Some(name))
            {
                return Err(CfgError::referenced_node("/scheduler/schedules", Some(name)));
            }
            scheduler.schedules.retain(|schedule| schedule.alias != name);
            if scheduler.active_schedule.as_deref() == Some(name) {
                scheduler.active_schedule = None;
            }
            Ok(())
        })?;
        info!(schedule = name, "schedule deleted");
        Ok(())
    }

    pub fn change_temperature_set_name(&mut self, old: &str, new: &str, scope: Option<&str>) -> CfgResult<()> {
        let path = match scope {
            None => "/scheduler/temperature_sets".to_string(),
            Some(alias) => format!("/scheduler/schedules['{alias}']/temperature_sets"),
        };
        self.mutate(|root| {
            let scheduler = root.scheduler_mut();
            if new.is_empty() {
                return Err(CfgError::bad_value(path.as_str(), Some(old), json!(new)));
            }
            if scheduler.temperature_set(new, scope).is_some() {
                return Err(CfgError::duplicate_key(path.as_str(), Some(old), new));
            }
            if scheduler.temperature_set(old, scope).is_none() {
                return Err(CfgError::bad_reference(path.as_str(), old));
            }
            match scope {
                None => scheduler.rename_global_temperature_set(old, new),
                Some(alias) => scheduler.rename_local_temperature_set(alias, old, new),
            }
            Ok(())
        })
    }

    pub fn set_manual_mode_reset_event(&mut self, value: ResetEventValue) -> CfgResult<ManualModeReset> {
        let policy = validate_reset_event(&value)?;
        self.mutate(|root| {
            root.scheduler_mut().settings.manual_mode_reset_event = Some(value);
            Ok(())
        })?;
        info!(%policy, "manual mode reset event changed");
        Ok(policy)
    }
}

/// Full validation plus the checks that need the runtime environment.
fn check(root: &ConfigurationRoot) -> CfgResult<()> {
    validate(root)?;
    if let Some(timezone) = root
        .scheduler
        .as_ref()
        .and_then(|scheduler| scheduler.settings.timezone.as_deref())
    {
        if timezone.parse::<Tz>().is_err() {
            return Err(CfgError::bad_value(TIMEZONE_PATH, None, json!(timezone)));
        }
    }
    Ok(())
}

fn rename_schedule(root: &mut ConfigurationRoot, old: &str, new: &str) -> CfgResult<()> {
    let scheduler = root.scheduler_mut();
    if new.is_empty() {
        return Err(CfgError::bad_value("/scheduler/schedules", Some(old), json!(new)));
    }
    if scheduler.schedule(new).is_some() {
        return Err(CfgError::duplicate_key("/scheduler/schedules", Some(old), new));
    }
    if scheduler.schedule(old).is_none() {
        return Err(CfgError::bad_reference("/scheduler/schedules", old));
    }
    scheduler.rename_schedule(old, new);
    Ok(())
}

/// Orders `items` after `names`, which must list every item exactly once.
fn reorder<T: Clone>(
    items: &[T],
    names: &[String],
    path: &str,
    name_of: impl Fn(&T) -> &String,
) -> CfgResult<Vec<T>> {
    let mut ordered = Vec::with_capacity(items.len());
    for name in names {
        let item = items
            .iter()
            .find(|item| name_of(item) == name)
            .ok_or_else(|| CfgError::bad_reference(path, name))?;
        if ordered.iter().any(|placed: &T| name_of(placed) == name) {
            return Err(CfgError::duplicate_key(path, None, name));
        }
        ordered.push(item.clone());
    }
    if let Some(missing) = items
        .iter()
        .find(|item| !names.iter().any(|name| name == name_of(item)))
    {
        return Err(CfgError::missing_value(path, name_of(missing)));
    }
    Ok(ordered)
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

fn file_version(path: &Path) -> u32 {
    fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_saphyr::from_str::<VersionHeader>(&raw).ok())
        .map_or(0, |header| header.version)
}
