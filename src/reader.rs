//! Paginated history retrieval
//!
//! The reader asks the pump how many records a log holds, walks its pages over
//! the link session and hands back decoded records ordered by device index.
//! Assembled pages are verified before decoding: duplicates are dropped and any
//! hole in the index sequence means data was lost in transit. Such failures get
//! one reconnect-and-retry cycle; the second failure ends the import.

use crate::config::DeviceProfile;
use crate::decode::{is_blank, RecordDecoder};
use crate::link::LinkSession;
use crate::progress::{CancelToken, ProgressRange};
use crate::records::{ConfigInfo, DomainRecord, RecordKind};
use crate::types::{hex_dump, PumpError, Result};
use log::{debug, info, warn};
use std::ops::Range;

const READ_RECORD: u8 = 0x20;
const READ_RECORD_ANSWER: u8 = 0x21;
const READ_PACKED_PAGE: u8 = 0x22;
const READ_PACKED_PAGE_ANSWER: u8 = 0x23;
const LOG_SIZE: u8 = 0x24;
const LOG_SIZE_ANSWER: u8 = 0x25;
const CONFIG_INFO: u8 = 0x30;

/// Slot header the pump writes for an unused packed slot
const EMPTY_SLOT: [u8; 2] = [0xFF, 0xFF];
const SLOT_HEADER_LEN: usize = 2;

/// Number of records a history log holds and how they are paged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSize {
    pub count: u16,
    pub per_page: u8,
}

impl LogSize {
    pub fn page_count(&self) -> u16 {
        let per_page = self.per_page.max(1) as u32;
        ((self.count as u32 + per_page - 1) / per_page) as u16
    }
}

/// Raw record bytes as they came off the wire
struct RawRecord {
    index: u32,
    bytes: Vec<u8>,
}

/// Reads history logs and settings from a connected pump
pub struct RecordReader<'a> {
    session: &'a mut LinkSession,
    decoder: RecordDecoder,
    packed: bool,
    cancel: CancelToken,
}

impl<'a> RecordReader<'a> {
    pub fn new(session: &'a mut LinkSession, profile: &DeviceProfile, cancel: CancelToken) -> Self {
        Self {
            session,
            decoder: RecordDecoder::for_profile(profile),
            packed: profile.packed_records,
            cancel,
        }
    }

    /// Send a single-frame query, reconnecting once if the link lost sync
    async fn query(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        match self.session.request(payload).await {
            Err(e) if e.requires_reconnect() => {
                warn!("Query [{}] failed ({}), reconnecting once", hex_dump(payload), e);
                self.session.reconnect().await?;
                self.session.request(payload).await
            }
            other => other,
        }
    }

    /// Ask the pump how many records of `kind` it holds
    pub async fn log_size(&mut self, kind: RecordKind) -> Result<LogSize> {
        let answer = self.query(&[LOG_SIZE, kind.to_u8()]).await?;
        if answer.len() < 5 || answer[0] != LOG_SIZE_ANSWER || answer[1] != kind.to_u8() {
            return Err(PumpError::UnexpectedResponse(format!(
                "log size answer for {}: [{}]",
                kind,
                hex_dump(&answer)
            )));
        }
        let size = LogSize {
            count: u16::from_le_bytes([answer[2], answer[3]]),
            per_page: answer[4].max(1),
        };
        info!(
            "{} log holds {} records in {} pages",
            kind,
            size.count,
            size.page_count()
        );
        Ok(size)
    }

    /// Read serial number, pump clock and the active basal schedule
    pub async fn read_config_info(&mut self) -> Result<ConfigInfo> {
        let answer = self.query(&[CONFIG_INFO]).await?;
        let info = self.decoder.decode_config_info(&answer)?;
        info!(
            "Pump serial {}, clock {}, {} basal segments",
            info.serial,
            info.clock,
            info.schedule.segments.len()
        );
        Ok(info)
    }

    /// Read the whole log of one kind
    pub async fn read_all(&mut self, kind: RecordKind, progress: &ProgressRange) -> Result<Vec<DomainRecord>> {
        let pages = self.log_size(kind).await?.page_count();
        if pages == 0 {
            progress.complete();
            return Ok(Vec::new());
        }
        self.read_records(kind, 0..pages, progress).await
    }

    /// Read `pages` of one log, verified and decoded, ordered by device index
    pub async fn read_records(
        &mut self,
        kind: RecordKind,
        pages: Range<u16>,
        progress: &ProgressRange,
    ) -> Result<Vec<DomainRecord>> {
        match self.try_read_records(kind, pages.clone(), progress).await {
            Err(e) if e.requires_reconnect() => {
                warn!("Reading {} log failed ({}), reconnecting and retrying once", kind, e);
                self.session.reconnect().await?;
                self.try_read_records(kind, pages, progress).await
            }
            other => other,
        }
    }

    async fn try_read_records(
        &mut self,
        kind: RecordKind,
        pages: Range<u16>,
        progress: &ProgressRange,
    ) -> Result<Vec<DomainRecord>> {
        let total = pages.len().max(1) as f64;
        let mut raw = Vec::new();
        // Packed slots carry no index of their own
        let mut next_synthetic: Option<u32> = None;

        for (done, page) in pages.enumerate() {
            if self.cancel.is_cancelled() {
                info!("Import cancelled while reading {} log", kind);
                return Err(PumpError::Cancelled);
            }
            if self.packed {
                let (records, slots) = self.fetch_packed_page(kind, page).await?;
                let index = next_synthetic.get_or_insert(page as u32 * slots.max(1) as u32);
                for bytes in records {
                    raw.push(RawRecord { index: *index, bytes });
                    *index += 1;
                }
            } else if let Some(record) = self.fetch_record(kind, page).await? {
                raw.push(record);
            }
            progress.report((done + 1) as f64 * 100.0 / total);
        }

        let verified = verify(kind, raw)?;
        debug!("{} log: {} records verified", kind, verified.len());
        verified
            .iter()
            .map(|record| self.decoder.decode(kind, record.index, &record.bytes))
            .collect()
    }

    async fn fetch_record(&mut self, kind: RecordKind, index: u16) -> Result<Option<RawRecord>> {
        let [lo, hi] = index.to_le_bytes();
        let answer = self
            .session
            .request(&[READ_RECORD, kind.to_u8(), lo, hi])
            .await?;
        if answer.len() < 4 || answer[0] != READ_RECORD_ANSWER || answer[1] != kind.to_u8() {
            return Err(PumpError::UnexpectedResponse(format!(
                "record answer for {} {}: [{}]",
                kind,
                index,
                hex_dump(&answer)
            )));
        }
        let bytes = &answer[4..];
        if bytes.len() != kind.record_size() {
            return Err(PumpError::DataMissing {
                kind: kind.name().to_string(),
                detail: format!("record {} truncated to {} bytes", index, bytes.len()),
            });
        }
        if is_blank(bytes) {
            debug!("{} record {} is blank", kind, index);
            return Ok(None);
        }
        Ok(Some(RawRecord {
            index: u16::from_le_bytes([answer[2], answer[3]]) as u32,
            bytes: bytes.to_vec(),
        }))
    }

    /// Returns the non-empty record slots of one packed page and the page's slot count
    async fn fetch_packed_page(&mut self, kind: RecordKind, page: u16) -> Result<(Vec<Vec<u8>>, u8)> {
        let [lo, hi] = page.to_le_bytes();
        let answer = self
            .session
            .request(&[READ_PACKED_PAGE, kind.to_u8(), lo, hi])
            .await?;
        if answer.len() < 3 || answer[0] != READ_PACKED_PAGE_ANSWER || answer[1] != kind.to_u8() {
            return Err(PumpError::UnexpectedResponse(format!(
                "packed page answer for {} page {}: [{}]",
                kind,
                page,
                hex_dump(&answer)
            )));
        }
        let slots = answer[2];
        let stride = kind.record_size() + SLOT_HEADER_LEN;
        let body = &answer[3..];
        if body.len() < slots as usize * stride {
            return Err(PumpError::DataMissing {
                kind: kind.name().to_string(),
                detail: format!(
                    "page {} announced {} slots but carries {} bytes",
                    page,
                    slots,
                    body.len()
                ),
            });
        }

        let records = body
            .chunks_exact(stride)
            .take(slots as usize)
            .filter(|slot| slot[..SLOT_HEADER_LEN] != EMPTY_SLOT)
            .map(|slot| &slot[SLOT_HEADER_LEN..])
            .filter(|bytes| !is_blank(bytes))
            .map(|bytes| bytes.to_vec())
            .collect();
        Ok((records, slots))
    }
}

/// Sort by index, drop duplicates and reject any hole in the sequence
fn verify(kind: RecordKind, mut raw: Vec<RawRecord>) -> Result<Vec<RawRecord>> {
    raw.sort_by_key(|record| record.index);

    let mut verified: Vec<RawRecord> = Vec::with_capacity(raw.len());
    for record in raw {
        if let Some(previous) = verified.last() {
            if previous.index == record.index {
                warn!("Dropping duplicate {} record {}", kind, record.index);
                continue;
            }
            if record.index != previous.index + 1 {
                return Err(PumpError::DataMissing {
                    kind: kind.name().to_string(),
                    detail: format!("index {} follows {}", record.index, previous.index),
                });
            }
        }
        verified.push(record);
    }
    Ok(verified)
}
