use std::collections::{BTreeMap, HashMap};

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::types::{ManualModeReset, ResetEventValue};

/// Weekday keys used by `dates`, Monday first.
pub const WEEKDAYS: [&str; 7] = ["1", "2", "3", "4", "5", "6", "7"];

pub fn weekday_key(weekday: Weekday) -> &'static str {
    WEEKDAYS[weekday.num_days_from_monday() as usize]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeekParity {
    A,
    B,
}

impl WeekParity {
    /// Even ISO weeks are "A" weeks.
    pub fn of(date: NaiveDate) -> Self {
        if date.iso_week().week() % 2 == 0 {
            Self::A
        } else {
            Self::B
        }
    }
}

/// Start of a timeslot. Documents written by older tools may carry the time
/// as a raw number of seconds (an unquoted `16:30:30` read as sexagesimal) or
/// in a non canonical text form; both are kept as `Legacy` until normalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawStartTime", into = "RawStartTime")]
pub enum StartTime {
    Canonical(NaiveTime),
    Legacy(NaiveTime),
    Invalid(String),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawStartTime {
    Seconds(i64),
    Text(String),
}

impl From<RawStartTime> for StartTime {
    fn from(raw: RawStartTime) -> Self {
        match raw {
            RawStartTime::Seconds(seconds) => (1..=86_400)
                .contains(&seconds)
                .then(|| NaiveTime::from_num_seconds_from_midnight_opt(seconds as u32, 0))
                .flatten()
                .map(Self::Legacy)
                .unwrap_or_else(|| Self::Invalid(seconds.to_string())),
            RawStartTime::Text(text) => match parse_time(&text) {
                Some(time) if format_time(time) == text => Self::Canonical(time),
                Some(time) => Self::Legacy(time),
                None => Self::Invalid(text),
            },
        }
    }
}

impl From<StartTime> for RawStartTime {
    fn from(start: StartTime) -> Self {
        match start {
            StartTime::Canonical(time) | StartTime::Legacy(time) => Self::Text(format_time(time)),
            StartTime::Invalid(raw) => Self::Text(raw),
        }
    }
}

impl From<NaiveTime> for StartTime {
    fn from(time: NaiveTime) -> Self {
        Self::Canonical(time)
    }
}

impl StartTime {
    pub fn time(&self) -> Option<NaiveTime> {
        match self {
            Self::Canonical(time) | Self::Legacy(time) => Some(*time),
            Self::Invalid(_) => None,
        }
    }

    /// Returns true when the stored form changed.
    pub fn normalize(&mut self) -> bool {
        if let Self::Legacy(time) = *self {
            *self = Self::Canonical(time);
            return true;
        }
        false
    }
}

fn parse_time(text: &str) -> Option<NaiveTime> {
    ["%H:%M:%S", "%H:%M:%S%.f", "%H:%M"]
        .iter()
        .find_map(|format| NaiveTime::parse_from_str(text.trim(), format).ok())
}

pub fn format_time(time: NaiveTime) -> String {
    if time.nanosecond() == 0 {
        time.format("%H:%M:%S").to_string()
    } else {
        time.format("%H:%M:%S%.6f").to_string()
    }
}

/// Weekdays are written either as strings or as bare integers.
fn weekday_keys<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawKey {
        Number(i64),
        Text(String),
    }

    let keys = Vec::<RawKey>::deserialize(deserializer)?;
    Ok(keys
        .into_iter()
        .map(|key| match key {
            RawKey::Number(day) => day.to_string(),
            RawKey::Text(day) => day,
        })
        .collect())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timeslot {
    pub start_time: StartTime,
    pub temperature_set: String,
}

impl Timeslot {
    pub fn new(start: NaiveTime, temperature_set: impl Into<String>) -> Self {
        Self {
            start_time: start.into(),
            temperature_set: temperature_set.into(),
        }
    }
}

/// Last timeslot starting at or before `time`; the last of the day otherwise,
/// since it runs past midnight.
pub fn active_timeslot(timeslots: &[Timeslot], time: NaiveTime) -> Option<(&Timeslot, NaiveTime)> {
    let valid = timeslots
        .iter()
        .filter_map(|slot| slot.start_time.time().map(|start| (slot, start)));
    let last = valid.clone().last();
    valid.filter(|(_, start)| *start <= time).last().or(last)
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TimeslotsSet {
    #[serde(default, deserialize_with = "weekday_keys")]
    pub dates: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeslots: Option<Vec<Timeslot>>,
    #[serde(
        default,
        rename = "timeslots_A",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeslots_a: Option<Vec<Timeslot>>,
    #[serde(
        default,
        rename = "timeslots_B",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeslots_b: Option<Vec<Timeslot>>,
}

impl TimeslotsSet {
    pub fn standard(dates: &[&str], timeslots: Vec<Timeslot>) -> Self {
        Self {
            dates: dates.iter().map(|day| day.to_string()).collect(),
            timeslots: Some(timeslots),
            ..Self::default()
        }
    }

    pub fn alternating(dates: &[&str], week_a: Vec<Timeslot>, week_b: Vec<Timeslot>) -> Self {
        Self {
            dates: dates.iter().map(|day| day.to_string()).collect(),
            timeslots: None,
            timeslots_a: Some(week_a),
            timeslots_b: Some(week_b),
        }
    }

    pub fn is_alternating(&self) -> bool {
        self.timeslots_a.is_some() && self.timeslots_b.is_some()
    }

    pub fn applies_to(&self, weekday: Weekday) -> bool {
        let key = weekday_key(weekday);
        self.dates.iter().any(|day| day == key)
    }

    pub fn timeslots_for(&self, date: NaiveDate) -> Option<&[Timeslot]> {
        match (&self.timeslots_a, &self.timeslots_b) {
            (Some(week_a), Some(week_b)) => Some(match WeekParity::of(date) {
                WeekParity::A => week_a.as_slice(),
                WeekParity::B => week_b.as_slice(),
            }),
            _ => self.timeslots.as_deref(),
        }
    }

    pub fn sequences(&self) -> impl Iterator<Item = &Vec<Timeslot>> {
        [&self.timeslots, &self.timeslots_a, &self.timeslots_b]
            .into_iter()
            .flatten()
    }

    pub fn timeslots_mut(&mut self) -> impl Iterator<Item = &mut Timeslot> {
        [
            &mut self.timeslots,
            &mut self.timeslots_a,
            &mut self.timeslots_b,
        ]
        .into_iter()
        .flatten()
        .flat_map(|sequence| sequence.iter_mut())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScheduleItem {
    #[serde(default)]
    pub devices: Vec<String>,
    #[serde(default)]
    pub timeslots_sets: Vec<TimeslotsSet>,
}

impl ScheduleItem {
    pub fn timeslots_set_for(&self, weekday: Weekday) -> Option<&TimeslotsSet> {
        self.timeslots_sets
            .iter()
            .find(|set| set.applies_to(weekday))
    }

    pub fn active_timeslot(&self, at: NaiveDateTime) -> Option<(&Timeslot, NaiveTime)> {
        let timeslots = self
            .timeslots_set_for(at.weekday())?
            .timeslots_for(at.date())?;
        active_timeslot(timeslots, at.time())
    }

    pub fn timeslots_mut(&mut self) -> impl Iterator<Item = &mut Timeslot> {
        self.timeslots_sets
            .iter_mut()
            .flat_map(TimeslotsSet::timeslots_mut)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceTemperature {
    pub device_name: String,
    pub setpoint: f32,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TemperatureSet {
    #[serde(default)]
    pub alias: String,
    #[serde(default, alias = "inherits", skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default)]
    pub devices: Vec<DeviceTemperature>,
}

impl TemperatureSet {
    pub fn new(alias: impl Into<String>, devices: &[(&str, f32)]) -> Self {
        Self {
            alias: alias.into(),
            parent: None,
            devices: devices
                .iter()
                .map(|(name, setpoint)| DeviceTemperature {
                    device_name: name.to_string(),
                    setpoint: *setpoint,
                })
                .collect(),
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn setpoint_of(&self, device: &str) -> Option<f32> {
        self.devices
            .iter()
            .find(|entry| entry.device_name == device)
            .map(|entry| entry.setpoint)
    }

    pub fn references_device(&self, device: &str) -> bool {
        self.setpoint_of(device).is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default)]
    pub alias: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_schedule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_sets: Option<Vec<TemperatureSet>>,
    #[serde(default)]
    pub schedule_items: Vec<ScheduleItem>,
}

impl Schedule {
    pub fn local_temperature_sets(&self) -> &[TemperatureSet] {
        self.temperature_sets.as_deref().unwrap_or_default()
    }

    pub fn local_temperature_set(&self, alias: &str) -> Option<&TemperatureSet> {
        self.local_temperature_sets()
            .iter()
            .find(|set| set.alias == alias)
    }

    pub fn references_device(&self, device: &str) -> bool {
        self.schedule_items
            .iter()
            .any(|item| item.devices.iter().any(|name| name == device))
            || self
                .local_temperature_sets()
                .iter()
                .any(|set| set.references_device(device))
    }

    pub fn timeslots_mut(&mut self) -> impl Iterator<Item = &mut Timeslot> {
        self.schedule_items
            .iter_mut()
            .flat_map(ScheduleItem::timeslots_mut)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SchedulerSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_mode_reset_event: Option<ResetEventValue>,
    /// IANA zone used to compute the local time; host zone when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl SchedulerSettings {
    pub fn manual_mode_reset(&self) -> ManualModeReset {
        self.manual_mode_reset_event
            .as_ref()
            .and_then(ResetEventValue::policy)
            .unwrap_or_default()
    }
}

/// The `scheduler` block of the configuration, also the snapshot handed to the
/// scheduler service.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub active_schedule: Option<String>,
    #[serde(default)]
    pub settings: SchedulerSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_sets: Option<Vec<TemperatureSet>>,
    #[serde(default)]
    pub schedules: Vec<Schedule>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedSetpoint {
    pub setpoint: f32,
    pub timeslot_start: NaiveTime,
}

pub type SetpointMap = BTreeMap<String, ResolvedSetpoint>;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Resolution {
    /// False when a schedule level could not be fully resolved.
    pub complete: bool,
    pub active_schedule: Option<String>,
    pub setpoints: SetpointMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetpointChange {
    Added,
    Removed,
    Setpoint,
    Timeslot,
}

impl SchedulerConfig {
    pub fn active_schedule(&self) -> Option<&str> {
        self.active_schedule
            .as_deref()
            .filter(|alias| !alias.is_empty())
    }

    pub fn schedule(&self, alias: &str) -> Option<&Schedule> {
        self.schedules.iter().find(|schedule| schedule.alias == alias)
    }

    pub fn schedule_mut(&mut self, alias: &str) -> Option<&mut Schedule> {
        self.schedules
            .iter_mut()
            .find(|schedule| schedule.alias == alias)
    }

    pub fn global_temperature_sets(&self) -> &[TemperatureSet] {
        self.temperature_sets.as_deref().unwrap_or_default()
    }

    /// Global sets when `scope` is `None`, the schedule's local sets otherwise.
    pub fn temperature_sets(&self, scope: Option<&str>) -> Option<&[TemperatureSet]> {
        match scope {
            None => self.temperature_sets.as_deref(),
            Some(alias) => self.schedule(alias)?.temperature_sets.as_deref(),
        }
    }

    pub fn temperature_set(&self, alias: &str, scope: Option<&str>) -> Option<&TemperatureSet> {
        self.temperature_sets(scope)?
            .iter()
            .find(|set| set.alias == alias)
    }

    /// Local sets of `schedule` shadow global ones.
    pub fn find_temperature_set<'a>(
        &'a self,
        alias: &str,
        schedule: Option<&'a Schedule>,
    ) -> Option<&'a TemperatureSet> {
        schedule
            .and_then(|schedule| schedule.local_temperature_set(alias))
            .or_else(|| {
                self.global_temperature_sets()
                    .iter()
                    .find(|set| set.alias == alias)
            })
    }

    pub fn index(&self) -> ScheduleIndex<'_> {
        ScheduleIndex::new(self)
    }

    /// Setpoint of every scheduled device at `at`. Child schedules win over
    /// their parents for devices they declare.
    pub fn get_setpoints(&self, at: NaiveDateTime) -> Resolution {
        let Some(active) = self.active_schedule() else {
            return Resolution {
                complete: true,
                active_schedule: None,
                setpoints: SetpointMap::new(),
            };
        };

        let index = self.index();
        let (chain, mut complete) = index.chain(active);
        let mut setpoints = SetpointMap::new();

        for schedule in chain {
            for (item_idx, item) in schedule.schedule_items.iter().enumerate() {
                let Some((timeslot, start)) = item.active_timeslot(at) else {
                    error!(
                        schedule = %schedule.alias,
                        item = item_idx,
                        "no time slot declared for {at} (missing weekday ?)"
                    );
                    complete = false;
                    continue;
                };
                debug!(
                    schedule = %schedule.alias,
                    item = item_idx,
                    temperature_set = %timeslot.temperature_set,
                    "active time slot starts at {start}"
                );

                for device in &item.devices {
                    if setpoints.contains_key(device) {
                        continue;
                    }
                    if let Some(setpoint) =
                        index.setpoint(schedule, &timeslot.temperature_set, device)
                    {
                        setpoints.insert(
                            device.clone(),
                            ResolvedSetpoint {
                                setpoint,
                                timeslot_start: start,
                            },
                        );
                    }
                }
            }
        }

        Resolution {
            complete,
            active_schedule: Some(active.to_string()),
            setpoints,
        }
    }
}

/// Reference rewriting used by rename operations.
impl SchedulerConfig {
    pub fn references_device(&self, device: &str) -> bool {
        self.global_temperature_sets()
            .iter()
            .any(|set| set.references_device(device))
            || self
                .schedules
                .iter()
                .any(|schedule| schedule.references_device(device))
    }

    pub fn rename_device(&mut self, old: &str, new: &str) {
        let sets = self.temperature_sets.iter_mut().flatten().chain(
            self.schedules
                .iter_mut()
                .flat_map(|schedule| schedule.temperature_sets.iter_mut().flatten()),
        );
        for set in sets {
            for entry in &mut set.devices {
                if entry.device_name == old {
                    entry.device_name = new.to_string();
                }
            }
        }

        for schedule in &mut self.schedules {
            for item in &mut schedule.schedule_items {
                for device in &mut item.devices {
                    if device == old {
                        *device = new.to_string();
                    }
                }
            }
        }
    }

    pub fn rename_schedule(&mut self, old: &str, new: &str) {
        if self.active_schedule.as_deref() == Some(old) {
            self.active_schedule = Some(new.to_string());
        }
        for schedule in &mut self.schedules {
            if schedule.alias == old {
                schedule.alias = new.to_string();
            }
            if schedule.parent_schedule.as_deref() == Some(old) {
                schedule.parent_schedule = Some(new.to_string());
            }
        }
    }

    /// Renames a global set. Schedules shadowing `old` with a local set of
    /// the same name keep their references.
    pub fn rename_global_temperature_set(&mut self, old: &str, new: &str) {
        for set in self.temperature_sets.iter_mut().flatten() {
            if set.alias == old {
                set.alias = new.to_string();
            }
            rename_parent(set, old, new);
        }

        for schedule in &mut self.schedules {
            if schedule.local_temperature_set(old).is_some() {
                continue;
            }
            for set in schedule.temperature_sets.iter_mut().flatten() {
                rename_parent(set, old, new);
            }
            rename_timeslot_references(schedule, old, new);
        }
    }

    pub fn rename_local_temperature_set(&mut self, schedule: &str, old: &str, new: &str) {
        let Some(schedule) = self.schedule_mut(schedule) else {
            return;
        };
        for set in schedule.temperature_sets.iter_mut().flatten() {
            if set.alias == old {
                set.alias = new.to_string();
            }
            rename_parent(set, old, new);
        }
        rename_timeslot_references(schedule, old, new);
    }
}

fn rename_parent(set: &mut TemperatureSet, old: &str, new: &str) {
    if set.parent.as_deref() == Some(old) {
        set.parent = Some(new.to_string());
    }
}

fn rename_timeslot_references(schedule: &mut Schedule, old: &str, new: &str) {
    for timeslot in schedule.timeslots_mut() {
        if timeslot.temperature_set == old {
            timeslot.temperature_set = new.to_string();
        }
    }
}

/// Alias lookup tables over a scheduler block.
pub struct ScheduleIndex<'a> {
    schedules: HashMap<&'a str, &'a Schedule>,
    global_sets: HashMap<&'a str, &'a TemperatureSet>,
    local_sets: HashMap<&'a str, HashMap<&'a str, &'a TemperatureSet>>,
}

impl<'a> ScheduleIndex<'a> {
    pub fn new(config: &'a SchedulerConfig) -> Self {
        let schedules = config
            .schedules
            .iter()
            .map(|schedule| (schedule.alias.as_str(), schedule))
            .collect();
        let global_sets = config
            .global_temperature_sets()
            .iter()
            .map(|set| (set.alias.as_str(), set))
            .collect();
        let local_sets = config
            .schedules
            .iter()
            .map(|schedule| {
                let sets = schedule
                    .local_temperature_sets()
                    .iter()
                    .map(|set| (set.alias.as_str(), set))
                    .collect();
                (schedule.alias.as_str(), sets)
            })
            .collect();

        Self {
            schedules,
            global_sets,
            local_sets,
        }
    }

    pub fn schedule(&self, alias: &str) -> Option<&'a Schedule> {
        self.schedules.get(alias).copied()
    }

    pub fn temperature_set(&self, schedule: &str, alias: &str) -> Option<&'a TemperatureSet> {
        self.local_sets
            .get(schedule)
            .and_then(|sets| sets.get(alias))
            .or_else(|| self.global_sets.get(alias))
            .copied()
    }

    /// `alias` followed by its parents. The flag is false when the chain is
    /// broken by an unknown alias or a cycle.
    pub fn chain(&self, alias: &str) -> (Vec<&'a Schedule>, bool) {
        let mut chain: Vec<&'a Schedule> = Vec::new();
        let mut next = Some(alias);

        while let Some(alias) = next {
            if chain.iter().any(|schedule| schedule.alias == alias) {
                error!(schedule = %alias, "circular schedule inheritance");
                return (chain, false);
            }
            let Some(schedule) = self.schedule(alias) else {
                error!(schedule = %alias, "unknown schedule");
                return (chain, false);
            };
            chain.push(schedule);
            next = schedule.parent_schedule.as_deref();
        }

        (chain, true)
    }

    /// Walks `set_alias` and its parents until one declares `device`.
    pub fn setpoint(&self, schedule: &Schedule, set_alias: &str, device: &str) -> Option<f32> {
        let mut visited: Vec<&str> = Vec::new();
        let mut alias = set_alias;

        loop {
            if visited.contains(&alias) {
                error!(temperature_set = %alias, "circular temperature set inheritance");
                return None;
            }
            visited.push(alias);

            let set = self.temperature_set(&schedule.alias, alias)?;
            if let Some(setpoint) = set.setpoint_of(device) {
                return Some(setpoint);
            }
            alias = set.parent.as_deref()?;
        }
    }
}

pub fn diff_setpoints(
    previous: &SetpointMap,
    next: &SetpointMap,
) -> BTreeMap<String, SetpointChange> {
    let mut changes = BTreeMap::new();

    for (device, before) in previous {
        match next.get(device) {
            None => {
                changes.insert(device.clone(), SetpointChange::Removed);
            }
            Some(after) if after.setpoint != before.setpoint => {
                changes.insert(device.clone(), SetpointChange::Setpoint);
            }
            Some(after) if after.timeslot_start != before.timeslot_start => {
                changes.insert(device.clone(), SetpointChange::Timeslot);
            }
            Some(_) => {}
        }
    }
    for device in next.keys() {
        if !previous.contains_key(device) {
            changes.insert(device.clone(), SetpointChange::Added);
        }
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn time(hour: u32, minute: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(hour, minute, 0).unwrap()
    }

    fn at(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(year, month, day)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn all_week(timeslots: Vec<Timeslot>) -> TimeslotsSet {
        TimeslotsSet::standard(&WEEKDAYS, timeslots)
    }

    fn scheduler() -> SchedulerConfig {
        SchedulerConfig {
            active_schedule: Some("Child".into()),
            settings: SchedulerSettings::default(),
            temperature_sets: Some(vec![
                TemperatureSet::new("Comfort", &[("Living", 20.0), ("Office", 19.0)]),
                TemperatureSet::new("Eco", &[("Living", 16.0)]).with_parent("Comfort"),
            ]),
            schedules: vec![
                Schedule {
                    alias: "Parent".into(),
                    schedule_items: vec![ScheduleItem {
                        devices: vec!["Living".into(), "Office".into()],
                        timeslots_sets: vec![all_week(vec![
                            Timeslot::new(time(0, 0), "Eco"),
                            Timeslot::new(time(7, 0), "Comfort"),
                        ])],
                    }],
                    ..Schedule::default()
                },
                Schedule {
                    alias: "Child".into(),
                    parent_schedule: Some("Parent".into()),
                    temperature_sets: Some(vec![TemperatureSet::new(
                        "Away",
                        &[("Office", 12.0)],
                    )
                    .with_parent("Comfort")]),
                    schedule_items: vec![ScheduleItem {
                        devices: vec!["Office".into()],
                        timeslots_sets: vec![all_week(vec![Timeslot::new(time(0, 0), "Away")])],
                    }],
                },
            ],
        }
    }

    #[test]
    fn numeric_start_time_is_read_as_seconds() {
        let start: StartTime = RawStartTime::Seconds(59_430).into();
        assert_eq!(start, StartTime::Legacy(NaiveTime::from_hms_opt(16, 30, 30).unwrap()));

        let mut normalized = start.clone();
        assert!(normalized.normalize());
        assert!(!normalized.normalize());
        assert_eq!(format_time(normalized.time().unwrap()), "16:30:30");

        assert!(matches!(
            StartTime::from(RawStartTime::Seconds(0)),
            StartTime::Invalid(_)
        ));
        assert!(matches!(
            StartTime::from(RawStartTime::Seconds(86_400)),
            StartTime::Invalid(_)
        ));
        assert!(matches!(
            StartTime::from(RawStartTime::Text("25:00".into())),
            StartTime::Invalid(_)
        ));
        assert!(matches!(
            StartTime::from(RawStartTime::Text("07:00".into())),
            StartTime::Legacy(_)
        ));
        assert!(matches!(
            StartTime::from(RawStartTime::Text("07:00:00".into())),
            StartTime::Canonical(_)
        ));
    }

    #[test]
    fn last_timeslot_wraps_past_midnight() {
        let timeslots = vec![
            Timeslot::new(time(6, 0), "Day"),
            Timeslot::new(time(22, 0), "Night"),
        ];

        let (slot, start) = active_timeslot(&timeslots, time(3, 0)).unwrap();
        assert_eq!(slot.temperature_set, "Night");
        assert_eq!(start, time(22, 0));

        let (slot, _) = active_timeslot(&timeslots, time(6, 0)).unwrap();
        assert_eq!(slot.temperature_set, "Day");
    }

    #[test]
    fn week_parity_follows_iso_week_number() {
        assert_eq!(
            WeekParity::of(NaiveDate::from_ymd_opt(2025, 1, 20).unwrap()),
            WeekParity::A
        );
        assert_eq!(
            WeekParity::of(NaiveDate::from_ymd_opt(2025, 1, 27).unwrap()),
            WeekParity::B
        );
    }

    #[test]
    fn child_schedule_wins_over_parent() {
        let resolution = scheduler().get_setpoints(at(2025, 1, 20, 8, 0));

        assert!(resolution.complete);
        assert_eq!(resolution.active_schedule.as_deref(), Some("Child"));
        assert_eq!(resolution.setpoints["Office"].setpoint, 12.0);
        assert_eq!(resolution.setpoints["Living"].setpoint, 20.0);
        assert_eq!(resolution.setpoints["Living"].timeslot_start, time(7, 0));
    }

    #[test]
    fn temperature_set_falls_back_to_parent_set() {
        let mut config = scheduler();
        config.active_schedule = Some("Parent".into());

        let resolution = config.get_setpoints(at(2025, 1, 20, 1, 0));
        assert_eq!(resolution.setpoints["Living"].setpoint, 16.0);
        // "Eco" has no entry for Office and inherits it from "Comfort".
        assert_eq!(resolution.setpoints["Office"].setpoint, 19.0);
    }

    #[test]
    fn resolution_is_idempotent() {
        let config = scheduler();
        let now = at(2025, 3, 4, 12, 34);
        assert_eq!(config.get_setpoints(now), config.get_setpoints(now));
    }

    #[test]
    fn no_active_schedule_yields_empty_success() {
        let mut config = scheduler();
        config.active_schedule = Some(String::new());

        let resolution = config.get_setpoints(at(2025, 1, 20, 8, 0));
        assert!(resolution.complete);
        assert!(resolution.active_schedule.is_none());
        assert!(resolution.setpoints.is_empty());
    }

    #[test]
    fn missing_weekday_falls_back_to_parent_level() {
        let mut config = scheduler();
        config.schedules[1].schedule_items[0].timeslots_sets[0].dates =
            vec!["1".into(), "2".into(), "3".into(), "4".into(), "5".into()];

        // 2025-01-25 is a Saturday.
        let resolution = config.get_setpoints(at(2025, 1, 25, 8, 0));
        assert!(!resolution.complete);
        assert_eq!(resolution.setpoints["Office"].setpoint, 19.0);
    }

    #[test]
    fn diff_reports_every_kind_of_change() {
        let entry = |setpoint, hour| ResolvedSetpoint {
            setpoint,
            timeslot_start: time(hour, 0),
        };
        let previous = SetpointMap::from([
            ("Gone".to_string(), entry(18.0, 0)),
            ("Warmer".to_string(), entry(18.0, 0)),
            ("NewSlot".to_string(), entry(18.0, 0)),
            ("Same".to_string(), entry(18.0, 0)),
        ]);
        let next = SetpointMap::from([
            ("Warmer".to_string(), entry(19.0, 0)),
            ("NewSlot".to_string(), entry(18.0, 7)),
            ("Same".to_string(), entry(18.0, 0)),
            ("Fresh".to_string(), entry(15.0, 0)),
        ]);

        let changes = diff_setpoints(&previous, &next);
        assert_eq!(
            changes,
            BTreeMap::from([
                ("Fresh".to_string(), SetpointChange::Added),
                ("Gone".to_string(), SetpointChange::Removed),
                ("NewSlot".to_string(), SetpointChange::Timeslot),
                ("Warmer".to_string(), SetpointChange::Setpoint),
            ])
        );
    }

    #[test]
    fn global_set_rename_skips_shadowing_schedules() {
        let mut config = scheduler();
        config.schedules[1].temperature_sets = Some(vec![
            TemperatureSet::new("Comfort", &[("Office", 21.0)]),
            TemperatureSet::new("Away", &[("Office", 12.0)]).with_parent("Comfort"),
        ]);
        config.schedules[1].schedule_items[0].timeslots_sets[0].timeslots =
            Some(vec![Timeslot::new(time(0, 0), "Comfort")]);

        config.rename_global_temperature_set("Comfort", "Warm");

        assert_eq!(config.global_temperature_sets()[0].alias, "Warm");
        assert_eq!(config.global_temperature_sets()[1].parent.as_deref(), Some("Warm"));
        let parent_slots = config.schedules[0].schedule_items[0].timeslots_sets[0]
            .timeslots
            .as_ref()
            .unwrap();
        assert_eq!(parent_slots[1].temperature_set, "Warm");
        // "Child" declares its own "Comfort": its timeslots are left alone.
        let child_slots = config.schedules[1].schedule_items[0].timeslots_sets[0]
            .timeslots
            .as_ref()
            .unwrap();
        assert_eq!(child_slots[0].temperature_set, "Comfort");
        assert_eq!(
            config.schedules[1].local_temperature_sets()[1].parent.as_deref(),
            Some("Comfort")
        );
    }

    #[test]
    fn device_and_schedule_renames_reach_every_reference() {
        let mut config = scheduler();
        config.rename_device("Office", "Study");
        config.rename_schedule("Parent", "Base");

        assert!(!config.references_device("Office"));
        assert!(config.references_device("Study"));
        assert_eq!(config.schedules[1].parent_schedule.as_deref(), Some("Base"));
        assert_eq!(
            config.get_setpoints(at(2025, 1, 20, 8, 0)).setpoints["Study"].setpoint,
            12.0
        );
    }

    #[test]
    fn weekdays_accept_bare_numbers() {
        let set: TimeslotsSet = serde_json::from_value(serde_json::json!({
            "dates": [1, "2"],
            "timeslots": [{"start_time": "00:00:00", "temperature_set": "Eco"}]
        }))
        .unwrap();
        assert_eq!(set.dates, vec!["1".to_string(), "2".to_string()]);
    }
}
