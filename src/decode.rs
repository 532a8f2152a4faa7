//! History record decoding
//!
//! Turns the fixed byte layout of each pump log entry into a typed
//! [`DomainRecord`]. Insulin amounts are stored as fixed-point integers whose
//! scale depends on the hardware generation, and glucose values share their
//! 16-bit field with status flags.
//!
//! All decoders are pure. Unknown sub-codes fall back to a documented variant;
//! a date that cannot exist is an error because ordering depends on it.

use crate::config::{BgUnits, DeviceGeneration, DeviceProfile};
use crate::records::{
    AlarmRecord, AlarmType, BasalRecord, BasalSchedule, BasalSegment, BolusRecord, CbgRecord,
    ConfigInfo, DeliveryType, DomainRecord, PrimeRecord, PrimeTarget, PumpStatus, RecordKind,
    RecordPayload, SmbgRecord, SmbgSubType, StatusReason, StatusRecord, WizardRecord,
};
use crate::types::{hex_dump, PumpError, Result};
use chrono::{NaiveDate, NaiveDateTime};
use log::warn;

const DATE_LEN: usize = 4;
const GLUCOSE_MASK: u16 = 0x03FF;

const WIZARD_BG_PRESENT: u16 = 1 << 10;
const WIZARD_CARB_PRESENT: u16 = 1 << 11;
const WIZARD_IOB_ENABLED: u16 = 1 << 12;
const WIZARD_CORRECTION_ADDED: u16 = 1 << 13;

const SMBG_LINKED: u16 = 1 << 14;
const SMBG_MMOL: u16 = 1 << 15;

const BOLUS_WIZARD_TRIGGERED: u8 = 0x01;
const BOLUS_EXTENDED: u8 = 0x02;

/// Opcode of a config info answer
pub const CONFIG_INFO_ANSWER: u8 = 0x31;

const MS_PER_MINUTE: i64 = 60_000;

fn u16_at(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn minutes_ms(minutes: u16) -> Option<i64> {
    if minutes == 0 {
        None
    } else {
        Some(minutes as i64 * MS_PER_MINUTE)
    }
}

/// Decode a 4-byte device date: `[month << 4 | year offset, day, hour, minute]`
pub fn decode_date(bytes: &[u8], generation: DeviceGeneration) -> Result<NaiveDateTime> {
    if bytes.len() < DATE_LEN {
        return Err(PumpError::InvalidDate(format!(
            "need {} bytes, got {}",
            DATE_LEN,
            bytes.len()
        )));
    }
    let month = (bytes[0] >> 4) as u32;
    let year = generation.epoch_year() + (bytes[0] & 0x0F) as i32;
    let (day, hour, minute) = (bytes[1] as u32, bytes[2] as u32, bytes[3] as u32);

    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|date| date.and_hms_opt(hour, minute, 0))
        .ok_or_else(|| PumpError::InvalidDate(format!("[{}]", hex_dump(&bytes[..DATE_LEN]))))
}

/// Slots the pump never wrote read back as all 0xFF or all zero
pub fn is_blank(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b == 0xFF) || bytes.iter().all(|&b| b == 0x00)
}

/// Decoder for one pump model's history records
#[derive(Debug, Clone, Copy)]
pub struct RecordDecoder {
    generation: DeviceGeneration,
    bg_units: BgUnits,
}

impl RecordDecoder {
    pub fn new(generation: DeviceGeneration, bg_units: BgUnits) -> Self {
        Self {
            generation,
            bg_units,
        }
    }

    pub fn for_profile(profile: &DeviceProfile) -> Self {
        Self::new(profile.generation, profile.bg_units)
    }

    fn units(&self, raw: u16) -> f64 {
        raw as f64 / self.generation.bolus_scale()
    }

    fn basal_rate(&self, raw: u32) -> f64 {
        raw as f64 / self.generation.basal_scale()
    }

    /// Wizard glucose values are kept x10 when the pump displays mmol/L
    fn wizard_glucose(&self, raw: u16) -> f64 {
        match self.bg_units {
            BgUnits::MgDl => raw as f64,
            BgUnits::MmolL => raw as f64 / 10.0,
        }
    }

    /// Decode one record of the given kind
    pub fn decode(&self, kind: RecordKind, device_index: u32, bytes: &[u8]) -> Result<DomainRecord> {
        if bytes.len() != kind.record_size() {
            return Err(PumpError::Decode(format!(
                "{} record {} has {} bytes, expected {}",
                kind,
                device_index,
                bytes.len(),
                kind.record_size()
            )));
        }

        let device_time = decode_date(bytes, self.generation)?;
        let body = &bytes[DATE_LEN..];
        let payload = match kind {
            RecordKind::Basal => self.decode_basal(body),
            RecordKind::Bolus => self.decode_bolus(body),
            RecordKind::Wizard => self.decode_wizard(body),
            RecordKind::Alarm => Self::decode_alarm(body),
            RecordKind::SuspendResume => Self::decode_status(body),
            RecordKind::Prime => self.decode_prime(body),
            RecordKind::Cbg => Self::decode_cbg(body),
            RecordKind::Smbg => Self::decode_smbg(body),
        };

        Ok(DomainRecord {
            device_index,
            device_time,
            payload,
        })
    }

    fn decode_basal(&self, body: &[u8]) -> RecordPayload {
        let delivery_type = match body[4] {
            0 => DeliveryType::Scheduled,
            1 => DeliveryType::Temp,
            2 => DeliveryType::Suspend,
            other => {
                warn!("Unknown basal delivery type {}, treating as scheduled", other);
                DeliveryType::Scheduled
            }
        };
        let expected_duration_ms = match body[5] {
            0 => None,
            quarters => Some(quarters as i64 * 15 * MS_PER_MINUTE),
        };
        RecordPayload::Basal(BasalRecord {
            rate: self.basal_rate(u32_at(body, 0)),
            delivery_type,
            expected_duration_ms,
        })
    }

    fn decode_bolus(&self, body: &[u8]) -> RecordPayload {
        let delivered_normal = u16_at(body, 0);
        let programmed_normal = u16_at(body, 2);
        let delivered_extended = u16_at(body, 4);
        let programmed_extended = u16_at(body, 6);
        let delivered_duration = u16_at(body, 8);
        let programmed_duration = u16_at(body, 10);
        let sync_counter = body[12];
        let flags = body[13];
        let has_extended = flags & BOLUS_EXTENDED != 0;

        let (extended, expected_extended, duration_ms, expected_duration_ms) = if has_extended {
            (
                Some(self.units(delivered_extended)),
                (programmed_extended != delivered_extended).then(|| self.units(programmed_extended)),
                Some(delivered_duration as i64 * MS_PER_MINUTE),
                (programmed_duration != delivered_duration)
                    .then(|| programmed_duration as i64 * MS_PER_MINUTE),
            )
        } else {
            (None, None, None, None)
        };

        RecordPayload::Bolus(BolusRecord {
            normal: self.units(delivered_normal),
            expected_normal: (programmed_normal != delivered_normal)
                .then(|| self.units(programmed_normal)),
            extended,
            expected_extended,
            duration_ms,
            expected_duration_ms,
            sync_counter,
            wizard_triggered: flags & BOLUS_WIZARD_TRIGGERED != 0,
        })
    }

    fn decode_wizard(&self, body: &[u8]) -> RecordPayload {
        let carbs = u16_at(body, 0);
        let bg_field = u16_at(body, 2);
        RecordPayload::Wizard(WizardRecord {
            carb_input: (bg_field & WIZARD_CARB_PRESENT != 0).then_some(carbs as f64),
            bg_input: (bg_field & WIZARD_BG_PRESENT != 0)
                .then(|| self.wizard_glucose(bg_field & GLUCOSE_MASK)),
            carb_ratio: u16_at(body, 4) as f64 / 10.0,
            insulin_sensitivity: self.wizard_glucose(u16_at(body, 6)),
            bg_target: self.wizard_glucose(u16_at(body, 8)),
            bg_delta: self.wizard_glucose(u16_at(body, 10)),
            insulin_on_board: self.units(u16_at(body, 12)),
            iob_enabled: bg_field & WIZARD_IOB_ENABLED != 0,
            correction_added: bg_field & WIZARD_CORRECTION_ADDED != 0,
            sync_counter: body[14],
        })
    }

    fn decode_alarm(body: &[u8]) -> RecordPayload {
        let alarm_type = AlarmType::from_code(u16_at(body, 0));
        if let AlarmType::Other(code) = alarm_type {
            warn!("Unknown alarm code {}", code);
        }
        RecordPayload::Alarm(AlarmRecord { alarm_type })
    }

    fn decode_status(body: &[u8]) -> RecordPayload {
        let status = if body[0] == 0 {
            PumpStatus::Suspended
        } else {
            PumpStatus::Resumed
        };
        let reason = match body[1] {
            0 => StatusReason::Manual,
            1 => StatusReason::Automatic,
            _ => StatusReason::Unknown,
        };
        RecordPayload::SuspendResume(StatusRecord {
            status,
            reason,
            duration_ms: minutes_ms(u16_at(body, 2)),
        })
    }

    fn decode_prime(&self, body: &[u8]) -> RecordPayload {
        let target = if body[2] == 0 {
            PrimeTarget::Tubing
        } else {
            PrimeTarget::Cannula
        };
        RecordPayload::Prime(PrimeRecord {
            volume: self.units(u16_at(body, 0)),
            target,
        })
    }

    fn decode_cbg(body: &[u8]) -> RecordPayload {
        let field = u16_at(body, 0);
        RecordPayload::Cbg(CbgRecord {
            value: (field & GLUCOSE_MASK) as f64,
            trend: (field >> 12) as u8,
        })
    }

    fn decode_smbg(body: &[u8]) -> RecordPayload {
        let field = u16_at(body, 0);
        let raw = (field & GLUCOSE_MASK) as f64;
        let (value, units) = if field & SMBG_MMOL != 0 {
            (raw / 10.0, BgUnits::MmolL)
        } else {
            (raw, BgUnits::MgDl)
        };
        let sub_type = if field & SMBG_LINKED != 0 {
            SmbgSubType::Linked
        } else {
            SmbgSubType::Manual
        };
        RecordPayload::Smbg(SmbgRecord {
            value,
            units,
            sub_type,
        })
    }

    /// Decode the config info answer: serial, pump clock and active basal schedule
    pub fn decode_config_info(&self, payload: &[u8]) -> Result<ConfigInfo> {
        const HEADER_LEN: usize = 11;
        const SEGMENT_LEN: usize = 5;

        if payload.first() != Some(&CONFIG_INFO_ANSWER) || payload.len() < HEADER_LEN {
            return Err(PumpError::Decode(format!(
                "config info answer malformed: [{}]",
                hex_dump(payload)
            )));
        }
        let serial = u32_at(payload, 1);
        let clock = decode_date(&payload[5..9], self.generation)?;
        let seconds = payload[9] as i64;
        let clock = clock + chrono::Duration::seconds(seconds.min(59));

        let count = payload[10] as usize;
        let segments_bytes = &payload[HEADER_LEN..];
        if segments_bytes.len() < count * SEGMENT_LEN {
            return Err(PumpError::Decode(format!(
                "basal schedule truncated: {} segments announced, {} bytes present",
                count,
                segments_bytes.len()
            )));
        }
        let segments = segments_bytes
            .chunks_exact(SEGMENT_LEN)
            .take(count)
            .map(|chunk| BasalSegment {
                start_minutes: chunk[0] as u32 * 30,
                rate: self.basal_rate(u32_at(chunk, 1)),
            })
            .collect();

        Ok(ConfigInfo {
            serial,
            clock,
            schedule: BasalSchedule { segments },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_pump::RecordBuilder;
    use chrono::Timelike;

    fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2015, 6, day)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn classic() -> RecordDecoder {
        RecordDecoder::new(DeviceGeneration::Classic, BgUnits::MgDl)
    }

    #[test]
    fn test_decode_date() {
        // June 2015 on a classic pump: month 6, year offset 15
        let date = decode_date(&[0x6F, 14, 9, 45], DeviceGeneration::Classic).unwrap();
        assert_eq!(date, at(14, 9, 45));

        let modern = decode_date(&[0x6F, 14, 9, 45], DeviceGeneration::Modern).unwrap();
        assert_eq!(modern.date().format("%Y").to_string(), "2023");
    }

    #[test]
    fn test_malformed_date_is_error() {
        assert!(matches!(
            decode_date(&[0x0F, 14, 9, 45], DeviceGeneration::Classic),
            Err(PumpError::InvalidDate(_))
        ));
        assert!(decode_date(&[0x2F, 30, 9, 45], DeviceGeneration::Classic).is_err());
        assert!(decode_date(&[0x6F, 14, 24, 0], DeviceGeneration::Classic).is_err());
        assert!(decode_date(&[0x6F, 14], DeviceGeneration::Classic).is_err());
    }

    #[test]
    fn test_blank_detection() {
        assert!(is_blank(&[0xFF; 8]));
        assert!(is_blank(&[0x00; 8]));
        assert!(!is_blank(&[0x6F, 1, 2, 3, 0, 0, 0, 0]));
    }

    #[test]
    fn test_decode_basal_scales_by_generation() {
        let builder = RecordBuilder::new(DeviceGeneration::Modern);
        let bytes = builder.basal(at(1, 8, 0), 1.2345, 1, 4);
        let decoder = RecordDecoder::new(DeviceGeneration::Modern, BgUnits::MgDl);
        let record = decoder.decode(RecordKind::Basal, 7, &bytes).unwrap();

        assert_eq!(record.device_index, 7);
        assert_eq!(record.device_time, at(1, 8, 0));
        match record.payload {
            RecordPayload::Basal(basal) => {
                assert!((basal.rate - 1.2345).abs() < 1e-9);
                assert_eq!(basal.delivery_type, DeliveryType::Temp);
                assert_eq!(basal.expected_duration_ms, Some(3_600_000));
            }
            other => panic!("expected basal, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_delivery_type_falls_back() {
        let builder = RecordBuilder::new(DeviceGeneration::Classic);
        let bytes = builder.basal(at(1, 8, 0), 0.5, 9, 0);
        match classic().decode(RecordKind::Basal, 0, &bytes).unwrap().payload {
            RecordPayload::Basal(basal) => assert_eq!(basal.delivery_type, DeliveryType::Scheduled),
            other => panic!("expected basal, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_interrupted_bolus() {
        let builder = RecordBuilder::new(DeviceGeneration::Classic);
        let bytes = builder.bolus(at(2, 12, 30), 1.5, 3.0, 9, true);
        match classic().decode(RecordKind::Bolus, 0, &bytes).unwrap().payload {
            RecordPayload::Bolus(bolus) => {
                assert!((bolus.normal - 1.5).abs() < 1e-9);
                assert_eq!(bolus.expected_normal, Some(3.0));
                assert_eq!(bolus.extended, None);
                assert_eq!(bolus.sync_counter, 9);
                assert!(bolus.wizard_triggered);
            }
            other => panic!("expected bolus, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_extended_bolus() {
        let builder = RecordBuilder::new(DeviceGeneration::Classic);
        let bytes = builder.extended_bolus(at(2, 12, 30), 1.0, 2.0, 2.0, 120, 120);
        match classic().decode(RecordKind::Bolus, 0, &bytes).unwrap().payload {
            RecordPayload::Bolus(bolus) => {
                assert_eq!(bolus.extended, Some(2.0));
                assert_eq!(bolus.expected_extended, None);
                assert_eq!(bolus.duration_ms, Some(7_200_000));
                assert_eq!(bolus.expected_normal, None);
            }
            other => panic!("expected bolus, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_wizard_flags_share_bg_field() {
        let builder = RecordBuilder::new(DeviceGeneration::Classic);
        let bytes = builder.wizard(at(3, 7, 0), Some(40), Some(250), 10.0, 50, 120, 15, 0.0, 4);
        match classic().decode(RecordKind::Wizard, 0, &bytes).unwrap().payload {
            RecordPayload::Wizard(wizard) => {
                assert_eq!(wizard.carb_input, Some(40.0));
                assert_eq!(wizard.bg_input, Some(250.0));
                assert_eq!(wizard.carb_ratio, 10.0);
                assert_eq!(wizard.bg_target, 120.0);
                assert!(wizard.correction_added);
                assert!(!wizard.iob_enabled);
                assert_eq!(wizard.sync_counter, 4);
            }
            other => panic!("expected wizard, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_alarm_fallback() {
        let builder = RecordBuilder::new(DeviceGeneration::Classic);
        let bytes = builder.alarm(at(3, 7, 0), 0x0123);
        match classic().decode(RecordKind::Alarm, 0, &bytes).unwrap().payload {
            RecordPayload::Alarm(alarm) => assert_eq!(alarm.alarm_type, AlarmType::Other(0x0123)),
            other => panic!("expected alarm, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_smbg_mmol_linked() {
        let builder = RecordBuilder::new(DeviceGeneration::Classic);
        let bytes = builder.smbg(at(3, 7, 0), 0x8000 | 0x4000 | 72);
        match classic().decode(RecordKind::Smbg, 0, &bytes).unwrap().payload {
            RecordPayload::Smbg(smbg) => {
                assert!((smbg.value - 7.2).abs() < 1e-9);
                assert_eq!(smbg.units, BgUnits::MmolL);
                assert_eq!(smbg.sub_type, SmbgSubType::Linked);
                assert!((smbg.value_mgdl() - 129.712).abs() < 0.01);
            }
            other => panic!("expected smbg, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_cbg_masks_trend() {
        let builder = RecordBuilder::new(DeviceGeneration::Classic);
        let bytes = builder.cbg(at(3, 7, 5), 143, 3);
        match classic().decode(RecordKind::Cbg, 0, &bytes).unwrap().payload {
            RecordPayload::Cbg(cbg) => {
                assert_eq!(cbg.value, 143.0);
                assert_eq!(cbg.trend, 3);
            }
            other => panic!("expected cbg, got {:?}", other),
        }
    }

    #[test]
    fn test_wrong_length_rejected() {
        assert!(matches!(
            classic().decode(RecordKind::Alarm, 0, &[0x6F, 1, 2, 3]),
            Err(PumpError::Decode(_))
        ));
    }

    #[test]
    fn test_decode_config_info() {
        let builder = RecordBuilder::new(DeviceGeneration::Classic);
        let payload = builder.config_info(
            123456,
            at(20, 10, 15),
            &[(0, 0.8), (12, 1.1), (44, 0.9)],
        );
        let info = classic().decode_config_info(&payload).unwrap();
        assert_eq!(info.serial, 123456);
        assert_eq!(info.clock.hour(), 10);
        assert_eq!(info.schedule.segments.len(), 3);
        assert_eq!(info.schedule.segments[1].start_minutes, 360);
        assert!((info.schedule.segments[2].rate - 0.9).abs() < 1e-9);
    }
}
