//! Pump history records and the reconstructed timeline events
//!
//! [`DomainRecord`] is what the decoders produce from device bytes: one log
//! entry with its device-assigned index and wall-clock time. [`TimelineEvent`]
//! is what the simulator emits once every cross-reference has been resolved.

use crate::config::BgUnits;
use crate::dose::Recommendation;
use chrono::{DateTime, Duration, NaiveDateTime, NaiveTime, Timelike, Utc};
use serde::Serialize;
use std::fmt;

/// mg/dL per mmol/L
pub const MGDL_PER_MMOLL: f64 = 18.01559;

/// History log kinds, identified by the record type byte used on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum RecordKind {
    Basal = 0x01,
    Bolus = 0x02,
    Wizard = 0x03,
    Alarm = 0x04,
    SuspendResume = 0x05,
    Prime = 0x06,
    Cbg = 0x07,
    Smbg = 0x08,
}

impl RecordKind {
    pub const ALL: [RecordKind; 8] = [
        RecordKind::Basal,
        RecordKind::Bolus,
        RecordKind::Wizard,
        RecordKind::Alarm,
        RecordKind::SuspendResume,
        RecordKind::Prime,
        RecordKind::Cbg,
        RecordKind::Smbg,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.to_u8() == value)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.name() == name)
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            RecordKind::Basal => "basal",
            RecordKind::Bolus => "bolus",
            RecordKind::Wizard => "wizard",
            RecordKind::Alarm => "alarm",
            RecordKind::SuspendResume => "suspend-resume",
            RecordKind::Prime => "prime",
            RecordKind::Cbg => "cbg",
            RecordKind::Smbg => "smbg",
        }
    }

    /// Size of one record in bytes, including its 4-byte date
    pub fn record_size(self) -> usize {
        match self {
            RecordKind::Basal => 10,
            RecordKind::Bolus => 18,
            RecordKind::Wizard => 20,
            RecordKind::Alarm
            | RecordKind::SuspendResume
            | RecordKind::Prime
            | RecordKind::Cbg
            | RecordKind::Smbg => 8,
        }
    }

    /// Processing order among records sharing a timestamp and index
    pub fn rank(self) -> u8 {
        match self {
            RecordKind::Basal => 0,
            RecordKind::SuspendResume => 1,
            RecordKind::Alarm => 2,
            RecordKind::Prime => 3,
            RecordKind::Bolus => 4,
            RecordKind::Wizard => 5,
            RecordKind::Cbg => 6,
            RecordKind::Smbg => 7,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryType {
    Scheduled,
    Temp,
    Suspend,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BasalRecord {
    pub rate: f64,
    pub delivery_type: DeliveryType,
    /// Programmed duration of a temp basal
    pub expected_duration_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BolusRecord {
    pub normal: f64,
    pub expected_normal: Option<f64>,
    pub extended: Option<f64>,
    pub expected_extended: Option<f64>,
    pub duration_ms: Option<i64>,
    pub expected_duration_ms: Option<i64>,
    /// Links the bolus to the wizard record that requested it
    pub sync_counter: u8,
    pub wizard_triggered: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WizardRecord {
    pub carb_input: Option<f64>,
    pub bg_input: Option<f64>,
    pub carb_ratio: f64,
    pub insulin_sensitivity: f64,
    pub bg_target: f64,
    pub bg_delta: f64,
    pub insulin_on_board: f64,
    pub iob_enabled: bool,
    pub correction_added: bool,
    pub sync_counter: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmType {
    Occlusion,
    AutoOff,
    NoInsulin,
    NoPower,
    LowInsulin,
    LowPower,
    CallService,
    Other(u16),
}

impl AlarmType {
    pub fn from_code(code: u16) -> Self {
        match code {
            1 => AlarmType::Occlusion,
            2 => AlarmType::AutoOff,
            3 => AlarmType::NoInsulin,
            4 => AlarmType::NoPower,
            5 => AlarmType::LowInsulin,
            6 => AlarmType::LowPower,
            7 => AlarmType::CallService,
            other => AlarmType::Other(other),
        }
    }

    /// Alarms after which the pump stops delivering insulin
    pub fn stops_delivery(self) -> bool {
        matches!(
            self,
            AlarmType::Occlusion | AlarmType::AutoOff | AlarmType::NoInsulin | AlarmType::NoPower
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlarmRecord {
    pub alarm_type: AlarmType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PumpStatus {
    Suspended,
    Resumed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusReason {
    Manual,
    Automatic,
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusRecord {
    pub status: PumpStatus,
    pub reason: StatusReason,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimeTarget {
    Tubing,
    Cannula,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrimeRecord {
    pub volume: f64,
    pub target: PrimeTarget,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CbgRecord {
    /// mg/dL
    pub value: f64,
    pub trend: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SmbgSubType {
    /// Received from a paired meter
    Linked,
    /// Typed in on the pump
    Manual,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SmbgRecord {
    pub value: f64,
    pub units: BgUnits,
    pub sub_type: SmbgSubType,
}

impl SmbgRecord {
    pub fn value_mgdl(&self) -> f64 {
        to_mgdl(self.value, self.units)
    }
}

pub fn to_mgdl(value: f64, units: BgUnits) -> f64 {
    match units {
        BgUnits::MgDl => value,
        BgUnits::MmolL => value * MGDL_PER_MMOLL,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordPayload {
    Basal(BasalRecord),
    Bolus(BolusRecord),
    Wizard(WizardRecord),
    Alarm(AlarmRecord),
    SuspendResume(StatusRecord),
    Prime(PrimeRecord),
    Cbg(CbgRecord),
    Smbg(SmbgRecord),
}

/// One decoded history log entry
#[derive(Debug, Clone, PartialEq)]
pub struct DomainRecord {
    /// Device log sequence number, strictly increasing within a kind
    pub device_index: u32,
    pub device_time: NaiveDateTime,
    pub payload: RecordPayload,
}

impl DomainRecord {
    pub fn kind(&self) -> RecordKind {
        match self.payload {
            RecordPayload::Basal(_) => RecordKind::Basal,
            RecordPayload::Bolus(_) => RecordKind::Bolus,
            RecordPayload::Wizard(_) => RecordKind::Wizard,
            RecordPayload::Alarm(_) => RecordKind::Alarm,
            RecordPayload::SuspendResume(_) => RecordKind::SuspendResume,
            RecordPayload::Prime(_) => RecordKind::Prime,
            RecordPayload::Cbg(_) => RecordKind::Cbg,
            RecordPayload::Smbg(_) => RecordKind::Smbg,
        }
    }
}

/// One segment of the active basal schedule
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BasalSegment {
    /// Minutes after midnight
    pub start_minutes: u32,
    pub rate: f64,
}

/// Active basal schedule as read from the pump settings
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct BasalSchedule {
    pub segments: Vec<BasalSegment>,
}

impl BasalSchedule {
    /// Time from `at` until the next segment boundary, wrapping past midnight
    pub fn time_to_next_boundary(&self, at: NaiveTime) -> Option<Duration> {
        if self.segments.is_empty() {
            return None;
        }
        let minute = at.hour() * 60 + at.minute();
        let seconds_in = at.second() as i64;
        let next = self
            .segments
            .iter()
            .map(|s| s.start_minutes)
            .filter(|&start| start > minute)
            .min()
            .map(|start| (start - minute) as i64)
            .unwrap_or_else(|| {
                // The first boundary of the next day
                let first = self.segments.iter().map(|s| s.start_minutes).min().unwrap_or(0);
                (24 * 60 - minute + first) as i64
            });
        Some(Duration::minutes(next) - Duration::seconds(seconds_in))
    }
}

/// Pump settings fetched during the config info phase
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigInfo {
    pub serial: u32,
    /// Pump clock at the time of readout
    pub clock: NaiveDateTime,
    pub schedule: BasalSchedule,
}

/// Uncertainty tags attached to emitted events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "code")]
pub enum Annotation {
    #[serde(rename = "basal/unknown-duration")]
    UnknownDuration,
    #[serde(rename = "basal/flat-rate")]
    FlatRate,
    #[serde(rename = "basal/suspended-from-alarm")]
    SuspendedFromAlarm,
    #[serde(rename = "final-basal/fabricated-from-schedule")]
    FabricatedFromSchedule,
    #[serde(rename = "status/fabricated-from-alarm")]
    FabricatedFromAlarm,
    #[serde(rename = "status/incomplete-tuple")]
    IncompleteTuple,
    #[serde(rename = "out-of-sequence")]
    OutOfSequence,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BasalEvent {
    pub rate: f64,
    pub delivery_type: DeliveryType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_duration_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BolusEvent {
    pub normal: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_normal: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extended: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_extended: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_duration_ms: Option<i64>,
}

impl BolusEvent {
    /// Strips the device linking fields from a bolus record
    pub fn from_record(record: &BolusRecord) -> Self {
        Self {
            normal: record.normal,
            expected_normal: record.expected_normal,
            extended: record.extended,
            expected_extended: record.expected_extended,
            duration_ms: record.duration_ms,
            expected_duration_ms: record.expected_duration_ms,
        }
    }

    /// Zero volume and nothing programmed: the bolus never started
    pub fn never_started(&self) -> bool {
        self.normal == 0.0
            && self.extended.unwrap_or(0.0) == 0.0
            && self.expected_normal.is_none()
            && self.expected_extended.is_none()
            && self.expected_duration_ms.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WizardEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub carb_input: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bg_input: Option<f64>,
    pub units: BgUnits,
    pub insulin_on_board: f64,
    pub insulin_carb_ratio: f64,
    pub insulin_sensitivity: f64,
    pub bg_target: f64,
    pub recommended: Recommendation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bolus: Option<BolusEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub struct StatusReasons {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspended: Option<StatusReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resumed: Option<StatusReason>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub status: PumpStatus,
    pub reason: StatusReasons,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlarmEvent {
    #[serde(rename = "alarmType")]
    pub alarm_type: AlarmType,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrimeEvent {
    pub volume: f64,
    #[serde(rename = "primeTarget")]
    pub target: PrimeTarget,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CbgEvent {
    pub value: f64,
    pub units: BgUnits,
    pub trend: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SmbgEvent {
    pub value: f64,
    pub units: BgUnits,
    pub sub_type: SmbgSubType,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EventKind {
    Basal(BasalEvent),
    Bolus(BolusEvent),
    Wizard(WizardEvent),
    Alarm(AlarmEvent),
    Status(StatusEvent),
    Prime(PrimeEvent),
    Cbg(CbgEvent),
    Smbg(SmbgEvent),
}

/// A finalized entry of the reconstructed timeline
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEvent {
    pub time: DateTime<Utc>,
    pub device_time: NaiveDateTime,
    /// Absent on events fabricated by the simulator
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_index: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<Annotation>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl TimelineEvent {
    pub fn has_annotation(&self, annotation: Annotation) -> bool {
        self.annotations.contains(&annotation)
    }
}
