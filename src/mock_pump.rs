//! Scripted in-memory pump for tests
//!
//! Implements [`Transport`] by playing the device side of the link protocol:
//! discovery slots, addressed connect, the counter choreography, history pages
//! and config info. Faults (lost writes, echoes, device errors, corrupt answers,
//! index gaps) are injected through the handle, which can be cloned before the
//! pump is boxed into a session.

use crate::config::DeviceGeneration;
use crate::frame::{build_frame, calculate_crc, escape, FrameCodec, RawFrame, BOM, EOM};
use crate::link::{next_counter, Transport, BROADCAST_ADDRESS, COUNTER_MODULUS, ECHO_MARKER};
use crate::records::RecordKind;
use crate::types::{FrameType, Result};
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Serialises history records in the device byte layout
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecordBuilder {
    generation: DeviceGeneration,
}

impl RecordBuilder {
    pub fn new(generation: DeviceGeneration) -> Self {
        Self { generation }
    }

    pub fn date(&self, at: NaiveDateTime) -> [u8; 4] {
        let years = (at.year() - self.generation.epoch_year()) as u8;
        [
            ((at.month() as u8) << 4) | (years & 0x0F),
            at.day() as u8,
            at.hour() as u8,
            at.minute() as u8,
        ]
    }

    fn units(&self, value: f64) -> [u8; 2] {
        ((value * self.generation.bolus_scale()).round() as u16).to_le_bytes()
    }

    fn rate(&self, value: f64) -> [u8; 4] {
        ((value * self.generation.basal_scale()).round() as u32).to_le_bytes()
    }

    fn record(&self, at: NaiveDateTime, body: &[u8]) -> Vec<u8> {
        let mut bytes = self.date(at).to_vec();
        bytes.extend_from_slice(body);
        bytes
    }

    pub fn basal(&self, at: NaiveDateTime, rate: f64, delivery_type: u8, quarters: u8) -> Vec<u8> {
        let mut body = self.rate(rate).to_vec();
        body.extend_from_slice(&[delivery_type, quarters]);
        self.record(at, &body)
    }

    pub fn bolus(
        &self,
        at: NaiveDateTime,
        delivered: f64,
        programmed: f64,
        sync_counter: u8,
        wizard_triggered: bool,
    ) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&self.units(delivered));
        body.extend_from_slice(&self.units(programmed));
        body.extend_from_slice(&[0; 8]);
        body.push(sync_counter);
        body.push(wizard_triggered as u8);
        self.record(at, &body)
    }

    pub fn extended_bolus(
        &self,
        at: NaiveDateTime,
        normal: f64,
        extended: f64,
        programmed_extended: f64,
        duration_min: u16,
        programmed_duration_min: u16,
    ) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&self.units(normal));
        body.extend_from_slice(&self.units(normal));
        body.extend_from_slice(&self.units(extended));
        body.extend_from_slice(&self.units(programmed_extended));
        body.extend_from_slice(&duration_min.to_le_bytes());
        body.extend_from_slice(&programmed_duration_min.to_le_bytes());
        body.push(0);
        body.push(0x02);
        self.record(at, &body)
    }

    /// Wizard record with the correction-added flag set; IOB is enabled when `iob > 0`
    #[allow(clippy::too_many_arguments)]
    pub fn wizard(
        &self,
        at: NaiveDateTime,
        carbs: Option<u16>,
        bg: Option<u16>,
        carb_ratio: f64,
        isf: u16,
        target: u16,
        delta: u16,
        iob: f64,
        sync_counter: u8,
    ) -> Vec<u8> {
        let mut field = bg.unwrap_or(0) & 0x03FF;
        if bg.is_some() {
            field |= 1 << 10;
        }
        if carbs.is_some() {
            field |= 1 << 11;
        }
        if iob > 0.0 {
            field |= 1 << 12;
        }
        field |= 1 << 13;

        let mut body = Vec::new();
        body.extend_from_slice(&carbs.unwrap_or(0).to_le_bytes());
        body.extend_from_slice(&field.to_le_bytes());
        body.extend_from_slice(&((carb_ratio * 10.0).round() as u16).to_le_bytes());
        body.extend_from_slice(&isf.to_le_bytes());
        body.extend_from_slice(&target.to_le_bytes());
        body.extend_from_slice(&delta.to_le_bytes());
        body.extend_from_slice(&self.units(iob));
        body.push(sync_counter);
        body.push(0);
        self.record(at, &body)
    }

    pub fn alarm(&self, at: NaiveDateTime, code: u16) -> Vec<u8> {
        let mut body = code.to_le_bytes().to_vec();
        body.extend_from_slice(&[0, 0]);
        self.record(at, &body)
    }

    pub fn status(&self, at: NaiveDateTime, suspended: bool, reason: u8, duration_min: u16) -> Vec<u8> {
        let mut body = vec![if suspended { 0 } else { 1 }, reason];
        body.extend_from_slice(&duration_min.to_le_bytes());
        self.record(at, &body)
    }

    pub fn prime(&self, at: NaiveDateTime, volume: f64, target: u8) -> Vec<u8> {
        let mut body = self.units(volume).to_vec();
        body.extend_from_slice(&[target, 0]);
        self.record(at, &body)
    }

    pub fn cbg(&self, at: NaiveDateTime, value: u16, trend: u8) -> Vec<u8> {
        let field = (value & 0x03FF) | ((trend as u16) << 12);
        let mut body = field.to_le_bytes().to_vec();
        body.extend_from_slice(&[0, 0]);
        self.record(at, &body)
    }

    pub fn smbg(&self, at: NaiveDateTime, field: u16) -> Vec<u8> {
        let mut body = field.to_le_bytes().to_vec();
        body.extend_from_slice(&[0, 0]);
        self.record(at, &body)
    }

    /// Config info answer: `(start slot in half hours, rate)` per schedule segment
    pub fn config_info(&self, serial: u32, clock: NaiveDateTime, schedule: &[(u8, f64)]) -> Vec<u8> {
        let mut payload = vec![0x31];
        payload.extend_from_slice(&serial.to_le_bytes());
        payload.extend_from_slice(&self.date(clock));
        payload.push(clock.second() as u8);
        payload.push(schedule.len() as u8);
        for &(slot, rate) in schedule {
            payload.push(slot);
            payload.extend_from_slice(&self.rate(rate));
        }
        payload
    }
}

/// Static behaviour of the scripted pump
#[derive(Debug, Clone)]
pub(crate) struct PumpScript {
    pub address: u8,
    /// Discovery slot the pump answers in
    pub discovery_slot: u8,
    /// Number of connect requests to ignore before accepting
    pub ignore_connects: u32,
    pub packed: bool,
    pub per_page: u8,
    pub serial: u32,
    pub generation: DeviceGeneration,
    pub clock: NaiveDateTime,
    pub schedule: Vec<(u8, f64)>,
    /// Record bytes per kind; position in the log is the device index
    pub logs: HashMap<RecordKind, Vec<Vec<u8>>>,
}

impl Default for PumpScript {
    fn default() -> Self {
        Self {
            address: 0x42,
            discovery_slot: 0,
            ignore_connects: 0,
            packed: false,
            per_page: 4,
            serial: 123456,
            generation: DeviceGeneration::Classic,
            clock: NaiveDate::from_ymd_opt(2015, 6, 20)
                .unwrap()
                .and_hms_opt(10, 15, 0)
                .unwrap(),
            schedule: vec![(0, 0.8), (12, 1.1), (44, 0.9)],
            logs: HashMap::new(),
        }
    }
}

impl PumpScript {
    pub fn with_log(mut self, kind: RecordKind, records: Vec<Vec<u8>>) -> Self {
        self.logs.insert(kind, records);
        self
    }

    pub fn builder(&self) -> RecordBuilder {
        RecordBuilder::new(self.generation)
    }
}

#[derive(Default)]
struct Faults {
    drop_writes: u32,
    echo_commands: u32,
    fail_code: Option<u8>,
    corrupt_answers: u32,
    /// (kind, index) -> remaining requests answered with index + 1
    gaps: HashMap<(RecordKind, u32), u32>,
}

struct PumpInner {
    script: PumpScript,
    codec: FrameCodec,
    outbox: VecDeque<Vec<u8>>,
    connected: bool,
    send_counter: u8,
    receive_counter: u8,
    pending: Option<Vec<u8>>,
    faults: Faults,
    discovery_probes: u32,
    connects_seen: u32,
    requests: Vec<Vec<u8>>,
}

/// Cloneable handle to the scripted pump
#[derive(Clone)]
pub(crate) struct MockPump {
    inner: Arc<Mutex<PumpInner>>,
}

impl MockPump {
    pub fn new(script: PumpScript) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PumpInner {
                script,
                codec: FrameCodec::new(),
                outbox: VecDeque::new(),
                connected: false,
                send_counter: 0,
                receive_counter: 0,
                pending: None,
                faults: Faults::default(),
                discovery_probes: 0,
                connects_seen: 0,
                requests: Vec::new(),
            })),
        }
    }

    pub fn address(&self) -> u8 {
        self.inner.lock().unwrap().script.address
    }

    pub fn discovery_probes(&self) -> u32 {
        self.inner.lock().unwrap().discovery_probes
    }

    pub fn connects_seen(&self) -> u32 {
        self.inner.lock().unwrap().connects_seen
    }

    /// Request payloads accepted so far, in order
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.inner.lock().unwrap().requests.clone()
    }

    pub fn requests_with_opcode(&self, opcode: u8) -> usize {
        self.requests()
            .iter()
            .filter(|request| request.first() == Some(&opcode))
            .count()
    }

    pub fn drop_next_writes(&self, count: u32) {
        self.inner.lock().unwrap().faults.drop_writes = count;
    }

    pub fn echo_next_commands(&self, count: u32) {
        self.inner.lock().unwrap().faults.echo_commands = count;
    }

    pub fn fail_next_request(&self, code: u8) {
        self.inner.lock().unwrap().faults.fail_code = Some(code);
    }

    pub fn corrupt_next_answers(&self, count: u32) {
        self.inner.lock().unwrap().faults.corrupt_answers = count;
    }

    /// Move the pump's receive counter out of step with the host
    pub fn skew_receive_counter(&self, counter: u8) {
        self.inner.lock().unwrap().receive_counter = counter % COUNTER_MODULUS;
    }

    /// Answer the next `times` requests for `index` with the record at `index + 1`
    pub fn inject_gap(&self, kind: RecordKind, index: u32, times: u32) {
        self.inner
            .lock()
            .unwrap()
            .faults
            .gaps
            .insert((kind, index), times);
    }

    fn pop_outbox(&self) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().outbox.pop_front()
    }
}

impl PumpInner {
    /// Queue a frame, delivered in two reads like a real serial port
    fn respond(&mut self, frame: Vec<u8>) {
        let mid = frame.len() / 2;
        self.outbox.push_back(frame[..mid].to_vec());
        self.outbox.push_back(frame[mid..].to_vec());
    }

    fn respond_control(&mut self, control: u8, payload: &[u8]) {
        let frame = build_frame(self.script.address, control, payload);
        self.respond(frame);
    }

    fn respond_corrupt(&mut self, control: u8, payload: &[u8]) {
        let mut content = vec![self.script.address, control];
        content.extend_from_slice(payload);
        let crc = calculate_crc(&content) ^ 0x5A5A;
        content.extend_from_slice(&crc.to_le_bytes());
        let mut frame = vec![BOM];
        frame.extend(escape(&content));
        frame.push(EOM);
        self.respond(frame);
    }

    fn handle(&mut self, frame: RawFrame) {
        if !frame.valid {
            return;
        }
        let Ok(frame_type) = frame.frame_type() else {
            return;
        };
        let address = self.script.address;

        match frame_type {
            FrameType::Discovery if frame.address == BROADCAST_ADDRESS => {
                self.discovery_probes += 1;
                if frame.payload.first() == Some(&self.script.discovery_slot) {
                    let mut answer = vec![address];
                    answer.extend_from_slice(&self.script.serial.to_le_bytes());
                    self.respond_control(FrameType::Discovery.to_u8(), &answer);
                }
            }
            FrameType::Connect if frame.address == address => {
                self.connects_seen += 1;
                if self.script.ignore_connects > 0 {
                    self.script.ignore_connects -= 1;
                    return;
                }
                self.connected = true;
                self.send_counter = 0;
                self.receive_counter = 0;
                self.pending = None;
                self.respond_control(FrameType::ConnectAck.to_u8(), &[]);
            }
            FrameType::Disconnect if frame.address == address => {
                self.connected = false;
                self.pending = None;
                self.respond_control(FrameType::ConnectAck.to_u8(), &[]);
            }
            FrameType::Information { send, .. } if self.connected => {
                if self.faults.echo_commands > 0 {
                    self.faults.echo_commands -= 1;
                    self.respond_control(FrameType::Unnumbered.to_u8(), &[ECHO_MARKER]);
                    return;
                }
                if let Some(code) = self.faults.fail_code.take() {
                    self.respond_control(FrameType::Unnumbered.to_u8(), &[0xFF, 0xEE, code]);
                    return;
                }
                if send == self.receive_counter {
                    self.receive_counter = next_counter(self.receive_counter);
                    self.requests.push(frame.payload.clone());
                    self.pending = Some(self.answer(&frame.payload));
                }
                let ack = FrameType::ReceiveReady {
                    receive: self.receive_counter,
                };
                self.respond_control(ack.to_u8(), &[]);
            }
            FrameType::ReceiveReady { receive } if self.connected => {
                let Some(answer) = self.pending.clone() else {
                    return;
                };
                if receive == self.send_counter {
                    let control = FrameType::Information {
                        send: self.send_counter,
                        receive: self.receive_counter,
                    }
                    .to_u8();
                    if self.faults.corrupt_answers > 0 {
                        self.faults.corrupt_answers -= 1;
                        self.respond_corrupt(control, &answer);
                    } else {
                        self.respond_control(control, &answer);
                    }
                } else if receive == next_counter(self.send_counter) {
                    self.send_counter = receive;
                    self.pending = None;
                }
            }
            _ => {}
        }
    }

    fn log(&self, kind: RecordKind) -> &[Vec<u8>] {
        self.script
            .logs
            .get(&kind)
            .map(|records| records.as_slice())
            .unwrap_or(&[])
    }

    fn answer(&mut self, request: &[u8]) -> Vec<u8> {
        let kind = request.get(1).copied().and_then(RecordKind::from_u8);
        match (request.first(), kind) {
            (Some(0x24), Some(kind)) => {
                let count = self.log(kind).len() as u16;
                let per_page = if self.script.packed { self.script.per_page } else { 1 };
                let [lo, hi] = count.to_le_bytes();
                vec![0x25, kind.to_u8(), lo, hi, per_page]
            }
            (Some(0x20), Some(kind)) if request.len() >= 4 => {
                let mut index = u16::from_le_bytes([request[2], request[3]]) as u32;
                if let Some(remaining) = self.faults.gaps.get_mut(&(kind, index)) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        index += 1;
                    }
                }
                let bytes = self
                    .log(kind)
                    .get(index as usize)
                    .cloned()
                    .unwrap_or_else(|| vec![0xFF; kind.record_size()]);
                let [lo, hi] = (index as u16).to_le_bytes();
                let mut answer = vec![0x21, kind.to_u8(), lo, hi];
                answer.extend(bytes);
                answer
            }
            (Some(0x22), Some(kind)) if request.len() >= 4 => {
                let page = u16::from_le_bytes([request[2], request[3]]) as usize;
                let per_page = self.script.per_page as usize;
                let mut answer = vec![0x23, kind.to_u8(), per_page as u8];
                for slot in 0..per_page {
                    match self.log(kind).get(page * per_page + slot) {
                        Some(bytes) => {
                            answer.extend_from_slice(&[kind.to_u8(), 0x00]);
                            answer.extend_from_slice(bytes);
                        }
                        None => {
                            answer.extend_from_slice(&[0xFF, 0xFF]);
                            answer.extend(vec![0xFF; kind.record_size()]);
                        }
                    }
                }
                answer
            }
            (Some(0x30), _) => {
                let builder = self.script.builder();
                builder.config_info(self.script.serial, self.script.clock, &self.script.schedule)
            }
            _ => vec![0xFF, 0xEE, 0x01],
        }
    }
}

#[async_trait::async_trait]
impl Transport for MockPump {
    async fn open(&mut self) -> Result<()> {
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.faults.drop_writes > 0 {
            inner.faults.drop_writes -= 1;
            return Ok(());
        }
        inner.codec.receive_bytes(data);
        while let Ok(Some(frame)) = inner.codec.next_frame() {
            inner.handle(frame);
        }
        Ok(())
    }

    async fn read(&mut self) -> Result<Vec<u8>> {
        match self.pop_outbox() {
            Some(chunk) => Ok(chunk),
            None => std::future::pending().await,
        }
    }

    async fn flush(&mut self) -> Result<()> {
        self.inner.lock().unwrap().outbox.clear();
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
