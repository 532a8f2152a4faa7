//! Event reconstruction
//!
//! The simulator folds the merged, time-sorted stream of history records into
//! the final timeline. Most records cannot be emitted as-is: a basal's duration
//! is only known once the next basal arrives, a wizard has to find the bolus it
//! requested, and a delivery-stopping alarm may explain a zero-rate basal that
//! was logged without any suspend record. [`SimulatorState`] holds these open
//! cross-references until a later record (or [`Simulator::finalize`]) closes them.
//!
//! Anything the pump does not tell us directly is marked with an [`Annotation`]
//! rather than dropped. Two conditions are fatal: a timestamp that goes
//! backwards, and a wizard whose bolus never shows up.

use crate::config::{BgUnits, ImportConfig};
use crate::dose::recommend;
use crate::records::{
    AlarmEvent, AlarmType, Annotation, BasalEvent, BasalRecord, BasalSchedule, BolusEvent,
    BolusRecord, CbgEvent, DeliveryType, DomainRecord, EventKind, PrimeEvent, PumpStatus,
    RecordKind, RecordPayload, SmbgEvent, SmbgRecord, SmbgSubType, StatusEvent, StatusReason,
    StatusReasons, StatusRecord, TimelineEvent, WizardEvent, WizardRecord, to_mgdl,
};
use crate::types::{PumpError, Result};
use chrono::{Duration, NaiveDateTime};
use log::{debug, error, info, warn};
use std::collections::HashMap;

/// Longest duration a single basal may claim
pub const FLAT_RATE_CAP_MS: i64 = 5 * 24 * 60 * 60 * 1000;

/// How far back a delivery-stopping alarm can explain a zero-rate basal
pub const ALARM_LOOKBACK_MINUTES: i64 = 120;

/// Window in which a manual SMBG duplicates a meter reading
pub const SMBG_DEDUP_MINUTES: i64 = 15;

/// A wizard and its bolus are logged in the same device minute
pub const WIZARD_LINK_SECONDS: i64 = 60;

/// A resume this close to a span's end belongs to that span
const RESUME_MERGE_SECONDS: i64 = 60;

/// Options that shape the reconstructed timeline
#[derive(Debug, Clone, Default)]
pub struct SimulatorOptions {
    pub utc_offset_minutes: i32,
    pub wizard_bg_as_smbg: bool,
    pub bg_units: BgUnits,
}

impl From<&ImportConfig> for SimulatorOptions {
    fn from(config: &ImportConfig) -> Self {
        Self {
            utc_offset_minutes: config.utc_offset_minutes,
            wizard_bg_as_smbg: config.wizard_bg_as_smbg,
            bg_units: config.device.bg_units,
        }
    }
}

/// What is known about the pump at readout time
#[derive(Debug, Clone, Default)]
pub struct FinalizeContext {
    /// Pump clock when the settings were read. The pump is suspended for
    /// readout, so this stands in for "now".
    pub settings_time: Option<NaiveDateTime>,
    pub schedule: Option<BasalSchedule>,
}

struct OpenBasal {
    event: usize,
    start: NaiveDateTime,
    rate: f64,
}

/// Delivering basal logged inside a suspension, held as suspended until the span ends
struct HeldBasal {
    event: usize,
    start: NaiveDateTime,
    delivery_type: DeliveryType,
}

/// A suspend span waiting for its end
struct OpenStatus {
    start: NaiveDateTime,
    device_index: Option<u32>,
    reasons: StatusReasons,
    annotations: Vec<Annotation>,
    held_basals: Vec<HeldBasal>,
}

impl OpenStatus {
    /// Span inferred from an alarm rather than logged by the pump
    fn fabricated(start: NaiveDateTime) -> Self {
        Self {
            start,
            device_index: None,
            reasons: StatusReasons {
                suspended: Some(StatusReason::Automatic),
                resumed: None,
            },
            annotations: vec![Annotation::FabricatedFromAlarm],
            held_basals: Vec::new(),
        }
    }
}

struct ClosedStatus {
    event: usize,
    end: NaiveDateTime,
}

#[derive(Clone, Copy)]
struct PendingAlarm {
    time: NaiveDateTime,
    device_index: u32,
    alarm_type: AlarmType,
}

struct LinkedBolus {
    event: usize,
    time: NaiveDateTime,
    wizard_triggered: bool,
}

struct PendingWizard {
    device_time: NaiveDateTime,
    device_index: u32,
    wizard: WizardRecord,
}

/// Cross-references still open while records are folded in
#[derive(Default)]
pub struct SimulatorState {
    events: Vec<TimelineEvent>,
    open_basal: Option<OpenBasal>,
    open_status: Option<OpenStatus>,
    last_closed_status: Option<ClosedStatus>,
    last_status_index: Option<u32>,
    last_suspend_time: Option<NaiveDateTime>,
    pending_alarm: Option<PendingAlarm>,
    boluses: HashMap<u8, LinkedBolus>,
    pending_wizards: Vec<PendingWizard>,
    last_linked_smbg: Option<(NaiveDateTime, f64)>,
    last_time: Option<NaiveDateTime>,
}

/// Device indices are per log, so kinds sharing a timestamp are ordered by rank
fn order_key(record: &DomainRecord) -> (NaiveDateTime, u8, u32) {
    (record.device_time, record.kind().rank(), record.device_index)
}

fn within_link_window(a: NaiveDateTime, b: NaiveDateTime) -> bool {
    (a - b).num_seconds().abs() < WIZARD_LINK_SECONDS
}

/// Merge records of all kinds into processing order
///
/// The device clock only resolves minutes, so a record sharing its minute with
/// the previous record of the same kind is pushed one second later.
pub fn prepare_records(mut records: Vec<DomainRecord>) -> Vec<DomainRecord> {
    records.sort_by_key(order_key);

    let mut last_by_kind: HashMap<RecordKind, NaiveDateTime> = HashMap::new();
    for record in records.iter_mut() {
        let kind = record.kind();
        if let Some(&last) = last_by_kind.get(&kind) {
            if record.device_time <= last {
                record.device_time = last + Duration::seconds(1);
                debug!(
                    "Bumped {} record {} to {}",
                    kind, record.device_index, record.device_time
                );
            }
        }
        last_by_kind.insert(kind, record.device_time);
    }

    records.sort_by_key(order_key);
    records
}

/// Run the whole reconstruction over decoded records
pub fn build_timeline(
    records: Vec<DomainRecord>,
    options: SimulatorOptions,
    context: &FinalizeContext,
) -> Result<Vec<TimelineEvent>> {
    let mut simulator = Simulator::new(options);
    for record in prepare_records(records) {
        simulator.process(&record)?;
    }
    simulator.finalize(context)
}

/// Folds one import run's records into timeline events
pub struct Simulator {
    options: SimulatorOptions,
    state: SimulatorState,
}

impl Simulator {
    pub fn new(options: SimulatorOptions) -> Self {
        Self {
            options,
            state: SimulatorState::default(),
        }
    }

    /// Feed the next record. Records must arrive in time order.
    pub fn process(&mut self, record: &DomainRecord) -> Result<()> {
        if let Some(last) = self.state.last_time {
            if record.device_time < last {
                error!(
                    "{} record {} at {} arrived after {}",
                    record.kind(),
                    record.device_index,
                    record.device_time,
                    last
                );
                return Err(PumpError::OutOfOrder {
                    previous: last.to_string(),
                    current: record.device_time.to_string(),
                });
            }
        }
        self.state.last_time = Some(record.device_time);

        match &record.payload {
            RecordPayload::Basal(basal) => self.handle_basal(record, basal),
            RecordPayload::Bolus(bolus) => self.handle_bolus(record, bolus),
            RecordPayload::Wizard(wizard) => self.handle_wizard(record, wizard),
            RecordPayload::Alarm(alarm) => self.handle_alarm(record, alarm.alarm_type),
            RecordPayload::SuspendResume(status) => match status.status {
                PumpStatus::Suspended => self.handle_suspend(record, status),
                PumpStatus::Resumed => self.handle_resume(record, status),
            },
            RecordPayload::Prime(prime) => {
                let kind = EventKind::Prime(PrimeEvent {
                    volume: prime.volume,
                    target: prime.target,
                });
                self.push(record.device_time, Some(record.device_index), kind, Vec::new());
            }
            RecordPayload::Cbg(cbg) => {
                let kind = EventKind::Cbg(CbgEvent {
                    value: cbg.value,
                    units: BgUnits::MgDl,
                    trend: cbg.trend,
                });
                self.push(record.device_time, Some(record.device_index), kind, Vec::new());
            }
            RecordPayload::Smbg(smbg) => self.handle_smbg(record, smbg),
        }
        Ok(())
    }

    fn push(
        &mut self,
        device_time: NaiveDateTime,
        device_index: Option<u32>,
        kind: EventKind,
        annotations: Vec<Annotation>,
    ) -> usize {
        let offset = Duration::minutes(self.options.utc_offset_minutes as i64);
        self.state.events.push(TimelineEvent {
            time: (device_time - offset).and_utc(),
            device_time,
            device_index,
            annotations,
            kind,
        });
        self.state.events.len() - 1
    }

    fn basal_event(&mut self, event: usize) -> Option<&mut BasalEvent> {
        match &mut self.state.events.get_mut(event)?.kind {
            EventKind::Basal(basal) => Some(basal),
            _ => None,
        }
    }

    fn set_basal_duration(&mut self, event: usize, duration_ms: i64) {
        let capped = duration_ms > FLAT_RATE_CAP_MS;
        if let Some(basal) = self.basal_event(event) {
            basal.duration_ms = Some(duration_ms.min(FLAT_RATE_CAP_MS));
        }
        if capped {
            warn!("Basal run of {} ms capped at {} ms", duration_ms, FLAT_RATE_CAP_MS);
            self.annotate(event, Annotation::FlatRate);
        }
    }

    fn mark_basal_suspended(&mut self, event: usize) {
        if let Some(basal) = self.basal_event(event) {
            basal.delivery_type = DeliveryType::Suspend;
        }
    }

    fn annotate(&mut self, event: usize, annotation: Annotation) {
        if let Some(event) = self.state.events.get_mut(event) {
            if !event.annotations.contains(&annotation) {
                event.annotations.push(annotation);
            }
        }
    }

    fn close_basal(&mut self, end: NaiveDateTime) {
        if let Some(open) = self.state.open_basal.take() {
            let duration = (end - open.start).num_milliseconds();
            self.set_basal_duration(open.event, duration);
        }
    }

    fn emit_alarm(&mut self, alarm: PendingAlarm) {
        let kind = EventKind::Alarm(AlarmEvent {
            alarm_type: alarm.alarm_type,
        });
        self.push(alarm.time, Some(alarm.device_index), kind, Vec::new());
    }

    /// Emit a held alarm that is too old to explain anything logged after `now`
    fn expire_stale_alarm(&mut self, now: NaiveDateTime) {
        if let Some(alarm) = self.state.pending_alarm {
            if now - alarm.time > Duration::minutes(ALARM_LOOKBACK_MINUTES) {
                debug!("Alarm at {} explains no suspension, emitting as is", alarm.time);
                self.state.pending_alarm = None;
                self.emit_alarm(alarm);
            }
        }
    }

    fn push_span(&mut self, span: OpenStatus, duration_ms: i64) -> usize {
        let kind = EventKind::Status(StatusEvent {
            status: PumpStatus::Suspended,
            reason: span.reasons,
            duration_ms: Some(duration_ms),
        });
        self.push(span.start, span.device_index, kind, span.annotations)
    }

    fn close_span(&mut self, span: OpenStatus, end: NaiveDateTime) {
        let duration = (end - span.start).num_milliseconds();
        let event = self.push_span(span, duration);
        self.state.last_closed_status = Some(ClosedStatus { event, end });
    }

    /// Annotation for a status record logged out of index order
    fn status_sequence(&mut self, device_index: u32) -> Vec<Annotation> {
        let previous = self.state.last_status_index;
        self.state.last_status_index = Some(previous.map_or(device_index, |p| p.max(device_index)));
        match previous {
            Some(previous) if device_index < previous => {
                warn!(
                    "Status record {} logged after record {}",
                    device_index, previous
                );
                vec![Annotation::OutOfSequence]
            }
            _ => Vec::new(),
        }
    }

    fn handle_basal(&mut self, record: &DomainRecord, basal: &BasalRecord) {
        let time = record.device_time;
        self.close_basal(time);
        self.expire_stale_alarm(time);

        let mut delivery_type = basal.delivery_type;
        let mut annotations = Vec::new();
        let mut held = false;

        if basal.rate == 0.0 {
            if self.state.open_status.is_some() {
                delivery_type = DeliveryType::Suspend;
            } else if let Some(alarm) = self.state.pending_alarm.take() {
                info!(
                    "Zero basal at {} follows {:?} alarm at {}, fabricating suspension",
                    time, alarm.alarm_type, alarm.time
                );
                delivery_type = DeliveryType::Suspend;
                annotations.push(Annotation::SuspendedFromAlarm);
                self.emit_alarm(alarm);
                self.state.open_status = Some(OpenStatus::fabricated(alarm.time));
            }
        } else if let Some(span) = self.state.open_status.take() {
            if span.annotations.contains(&Annotation::FabricatedFromAlarm) {
                self.close_span(span, time);
            } else {
                debug!("Basal change at {} while suspended since {}", time, span.start);
                delivery_type = DeliveryType::Suspend;
                held = true;
                self.state.open_status = Some(span);
            }
        }

        let kind = EventKind::Basal(BasalEvent {
            rate: basal.rate,
            delivery_type,
            duration_ms: None,
            expected_duration_ms: basal.expected_duration_ms,
        });
        let event = self.push(time, Some(record.device_index), kind, annotations);
        if let (true, Some(span)) = (held, self.state.open_status.as_mut()) {
            span.held_basals.push(HeldBasal {
                event,
                start: time,
                delivery_type: basal.delivery_type,
            });
        }
        self.state.open_basal = Some(OpenBasal {
            event,
            start: time,
            rate: basal.rate,
        });
    }

    fn handle_suspend(&mut self, record: &DomainRecord, status: &StatusRecord) {
        let time = record.device_time;
        let annotations = self.status_sequence(record.device_index);

        if let Some(previous) = self.state.open_status.take() {
            if let Some(mut previous) = self.close_at_delivery(previous) {
                warn!("Suspend at {} while suspended since {}", time, previous.start);
                previous.annotations.push(Annotation::IncompleteTuple);
                self.close_span(previous, time);
            }
        }
        if let Some(alarm) = self.state.pending_alarm.take() {
            self.emit_alarm(alarm);
        }

        self.state.open_status = Some(OpenStatus {
            start: time,
            device_index: Some(record.device_index),
            reasons: StatusReasons {
                suspended: Some(status.reason),
                resumed: None,
            },
            annotations,
            held_basals: Vec::new(),
        });
        self.state.last_suspend_time = Some(time);

        let zero_basal = self
            .state
            .open_basal
            .as_ref()
            .filter(|basal| basal.rate == 0.0)
            .map(|basal| basal.event);
        if let Some(event) = zero_basal {
            self.mark_basal_suspended(event);
        }
    }

    fn handle_resume(&mut self, record: &DomainRecord, status: &StatusRecord) {
        let time = record.device_time;
        let annotations = self.status_sequence(record.device_index);

        if let Some(mut span) = self.state.open_status.take() {
            span.reasons.resumed = Some(status.reason);
            span.annotations.extend(annotations);
            let held = std::mem::take(&mut span.held_basals);
            self.close_span(span, time);
            // Delivery restarting in the resume's minute is not part of the suspension
            self.restore_held(held, |start| (time - start).num_seconds() < RESUME_MERGE_SECONDS);
            return;
        }

        // A rate change may already have closed this span at the same minute
        if let Some(closed) = self.state.last_closed_status.take() {
            if (time - closed.end).num_seconds().abs() < RESUME_MERGE_SECONDS {
                if let Some(TimelineEvent {
                    kind: EventKind::Status(event),
                    ..
                }) = self.state.events.get_mut(closed.event)
                {
                    if event.reason.resumed.is_none() {
                        event.reason.resumed = Some(status.reason);
                        return;
                    }
                }
            }
        }

        warn!("Resume at {} without a matching suspend", time);
        let mut annotations = annotations;
        annotations.push(Annotation::IncompleteTuple);
        let reasons = StatusReasons {
            suspended: None,
            resumed: Some(status.reason),
        };
        let (start, kind) = match status.duration_ms {
            Some(duration) => (
                time - Duration::milliseconds(duration),
                EventKind::Status(StatusEvent {
                    status: PumpStatus::Suspended,
                    reason: reasons,
                    duration_ms: Some(duration),
                }),
            ),
            None => (
                time,
                EventKind::Status(StatusEvent {
                    status: PumpStatus::Resumed,
                    reason: reasons,
                    duration_ms: None,
                }),
            ),
        };
        self.push(start, Some(record.device_index), kind, annotations);
    }

    /// Give held basals accepted by `restore` back their logged delivery type
    fn restore_held(&mut self, held: Vec<HeldBasal>, restore: impl Fn(NaiveDateTime) -> bool) {
        for basal in held.into_iter().filter(|basal| restore(basal.start)) {
            if let Some(event) = self.basal_event(basal.event) {
                event.delivery_type = basal.delivery_type;
            }
        }
    }

    /// End a logged suspension that never saw its resume at its first delivering basal.
    /// Returns the span unchanged when no basal delivered during it.
    fn close_at_delivery(&mut self, mut span: OpenStatus) -> Option<OpenStatus> {
        let Some(end) = span.held_basals.first().map(|basal| basal.start) else {
            return Some(span);
        };
        info!("Suspension since {} has no resume, ending it at {}", span.start, end);
        let held = std::mem::take(&mut span.held_basals);
        self.close_span(span, end);
        self.restore_held(held, |_| true);
        None
    }

    fn handle_alarm(&mut self, record: &DomainRecord, alarm_type: AlarmType) {
        let alarm = PendingAlarm {
            time: record.device_time,
            device_index: record.device_index,
            alarm_type,
        };
        if !alarm_type.stops_delivery() || self.state.open_status.is_some() {
            self.emit_alarm(alarm);
            return;
        }

        // A zero-rate basal logged just before the alarm was the pump stopping
        let lookback = Duration::minutes(ALARM_LOOKBACK_MINUTES);
        let fusable = self.state.open_basal.as_ref().and_then(|basal| {
            let unflagged = basal.rate == 0.0
                && matches!(
                    self.state.events.get(basal.event).map(|e| &e.kind),
                    Some(EventKind::Basal(b)) if b.delivery_type != DeliveryType::Suspend
                );
            (unflagged && alarm.time - basal.start <= lookback).then_some((basal.event, basal.start))
        });
        if let Some((event, start)) = fusable {
            info!(
                "{:?} alarm at {} explains zero basal since {}, fabricating suspension",
                alarm_type, alarm.time, start
            );
            self.mark_basal_suspended(event);
            self.annotate(event, Annotation::SuspendedFromAlarm);
            self.emit_alarm(alarm);
            self.state.open_status = Some(OpenStatus::fabricated(start));
            return;
        }

        if let Some(previous) = self.state.pending_alarm.replace(alarm) {
            self.emit_alarm(previous);
        }
    }

    fn handle_bolus(&mut self, record: &DomainRecord, bolus: &BolusRecord) {
        let kind = EventKind::Bolus(BolusEvent::from_record(bolus));
        let event = self.push(record.device_time, Some(record.device_index), kind, Vec::new());
        self.state.boluses.insert(
            bolus.sync_counter,
            LinkedBolus {
                event,
                time: record.device_time,
                wizard_triggered: bolus.wizard_triggered,
            },
        );

        let waiting = self.state.pending_wizards.iter().position(|pending| {
            pending.wizard.sync_counter == bolus.sync_counter
                && within_link_window(pending.device_time, record.device_time)
        });
        if let Some(position) = waiting {
            let pending = self.state.pending_wizards.remove(position);
            self.attach_wizard(pending);
        }
    }

    fn handle_wizard(&mut self, record: &DomainRecord, wizard: &WizardRecord) {
        self.attach_wizard(PendingWizard {
            device_time: record.device_time,
            device_index: record.device_index,
            wizard: wizard.clone(),
        });
    }

    /// Replace the wizard's bolus with one wizard event that embeds it
    fn attach_wizard(&mut self, pending: PendingWizard) {
        let sync_counter = pending.wizard.sync_counter;
        let linked = match self.state.boluses.remove(&sync_counter) {
            Some(linked) if within_link_window(linked.time, pending.device_time) => linked,
            earlier => {
                if let Some(earlier) = earlier {
                    debug!(
                        "Bolus at {} reused sync counter {}, not linking it",
                        earlier.time, sync_counter
                    );
                }
                debug!("Wizard {} waiting for bolus with sync counter {}", pending.device_index, sync_counter);
                self.state.pending_wizards.push(pending);
                return;
            }
        };
        if !linked.wizard_triggered {
            warn!(
                "Dropping stale wizard record {}: bolus with sync counter {} was not wizard-initiated",
                pending.device_index, sync_counter
            );
            return;
        }
        let bolus = match self.state.events.get(linked.event).map(|e| &e.kind) {
            Some(EventKind::Bolus(bolus)) => bolus.clone(),
            _ => return,
        };

        let wizard = &pending.wizard;
        let kind = EventKind::Wizard(WizardEvent {
            carb_input: wizard.carb_input,
            bg_input: wizard.bg_input,
            units: self.options.bg_units,
            insulin_on_board: wizard.insulin_on_board,
            insulin_carb_ratio: wizard.carb_ratio,
            insulin_sensitivity: wizard.insulin_sensitivity,
            bg_target: wizard.bg_target,
            recommended: recommend(wizard),
            bolus: Some(bolus),
        });
        let offset = Duration::minutes(self.options.utc_offset_minutes as i64);
        self.state.events[linked.event] = TimelineEvent {
            time: (pending.device_time - offset).and_utc(),
            device_time: pending.device_time,
            device_index: Some(pending.device_index),
            annotations: Vec::new(),
            kind,
        };

        if let (true, Some(bg)) = (self.options.wizard_bg_as_smbg, wizard.bg_input) {
            let mgdl = to_mgdl(bg, self.options.bg_units).round();
            if self.duplicates_linked_smbg(pending.device_time, mgdl) {
                debug!("Wizard {} BG duplicates meter reading", pending.device_index);
                return;
            }
            let kind = EventKind::Smbg(SmbgEvent {
                value: bg,
                units: self.options.bg_units,
                sub_type: SmbgSubType::Manual,
            });
            self.push(pending.device_time, None, kind, Vec::new());
        }
    }

    /// Whether a manual reading repeats the last meter reading
    fn duplicates_linked_smbg(&self, time: NaiveDateTime, mgdl: f64) -> bool {
        self.state
            .last_linked_smbg
            .is_some_and(|(linked_at, linked_mgdl)| {
                time - linked_at <= Duration::minutes(SMBG_DEDUP_MINUTES) && linked_mgdl == mgdl
            })
    }

    fn handle_smbg(&mut self, record: &DomainRecord, smbg: &SmbgRecord) {
        let time = record.device_time;
        let mgdl = smbg.value_mgdl().round();

        match smbg.sub_type {
            SmbgSubType::Linked => self.state.last_linked_smbg = Some((time, mgdl)),
            SmbgSubType::Manual => {
                if self.duplicates_linked_smbg(time, mgdl) {
                    debug!("Dropping manual reading {} duplicating meter reading", record.device_index);
                    return;
                }
            }
        }

        let kind = EventKind::Smbg(SmbgEvent {
            value: smbg.value,
            units: smbg.units,
            sub_type: smbg.sub_type,
        });
        self.push(time, Some(record.device_index), kind, Vec::new());
    }

    fn finalize_basal(&mut self, context: &FinalizeContext) {
        let Some(open) = self.state.open_basal.take() else {
            return;
        };
        let end = [context.settings_time, self.state.last_suspend_time]
            .into_iter()
            .flatten()
            .max();
        if let Some(end) = end.filter(|end| *end > open.start) {
            self.set_basal_duration(open.event, (end - open.start).num_milliseconds());
            return;
        }

        let scheduled = matches!(
            self.state.events.get(open.event).map(|e| &e.kind),
            Some(EventKind::Basal(b)) if b.delivery_type == DeliveryType::Scheduled
        );
        let boundary = context
            .schedule
            .as_ref()
            .filter(|_| scheduled)
            .and_then(|schedule| schedule.time_to_next_boundary(open.start.time()));
        match boundary {
            Some(duration) => {
                self.set_basal_duration(open.event, duration.num_milliseconds());
                self.annotate(open.event, Annotation::FabricatedFromSchedule);
            }
            None => {
                warn!("Final basal at {} has no known end", open.start);
                self.annotate(open.event, Annotation::UnknownDuration);
            }
        }
    }

    /// Close everything still open and return the finished timeline
    pub fn finalize(mut self, context: &FinalizeContext) -> Result<Vec<TimelineEvent>> {
        if let Some(pending) = self.state.pending_wizards.first() {
            error!(
                "Wizard record {} has no bolus with sync counter {}",
                pending.device_index, pending.wizard.sync_counter
            );
            return Err(PumpError::SyncCounterMismatch(pending.wizard.sync_counter));
        }

        self.finalize_basal(context);

        if let Some(alarm) = self.state.pending_alarm.take() {
            self.emit_alarm(alarm);
            let mut span = OpenStatus::fabricated(alarm.time);
            span.annotations.push(Annotation::IncompleteTuple);
            self.push_span(span, 0);
        }
        if let Some(span) = self.state.open_status.take() {
            if let Some(mut span) = self.close_at_delivery(span) {
                warn!("Suspension since {} never resumed", span.start);
                span.annotations.push(Annotation::IncompleteTuple);
                self.push_span(span, 0);
            }
        }

        let mut events: Vec<TimelineEvent> = self
            .state
            .events
            .into_iter()
            .filter_map(|mut event| {
                let keep = match &mut event.kind {
                    EventKind::Bolus(bolus) => !bolus.never_started(),
                    EventKind::Wizard(wizard) => {
                        if wizard.bolus.as_ref().is_some_and(|b| b.never_started()) {
                            wizard.bolus = None;
                        }
                        true
                    }
                    _ => true,
                };
                if !keep {
                    debug!("Dropping bolus {:?} that never started", event.device_index);
                }
                keep.then_some(event)
            })
            .collect();
        events.sort_by_key(|event| event.time);

        info!("Timeline holds {} events", events.len());
        Ok(events)
    }
}
