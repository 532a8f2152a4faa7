//! Whole-import orchestration
//!
//! One run walks the pump through every phase in order and aborts on the first
//! terminal error, closing the link on a best-effort basis. The timeline is
//! handed to the [`Uploader`] in a single call, so a failed run never leaves a
//! partial upload behind.

use crate::config::{ImportConfig, LinkConfig};
use crate::link::{LinkSession, Transport};
use crate::progress::{CancelToken, ProgressReporter};
use crate::reader::RecordReader;
use crate::records::{ConfigInfo, RecordKind, TimelineEvent};
use crate::simulator::{build_timeline, FinalizeContext, SimulatorOptions};
use crate::types::{PumpError, Result};
use log::{debug, error, info};
use serde::Serialize;
use std::fmt;

/// Sink for the finished timeline, typically an HTTP client
#[async_trait::async_trait]
pub trait Uploader: Send {
    async fn upload(&mut self, session: &UploadSession, events: &[TimelineEvent]) -> Result<()>;
}

/// Metadata sent along with the timeline
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub device_tags: Vec<String>,
    pub device_manufacturers: Vec<String>,
    pub device_model: String,
    pub device_serial_number: String,
    pub device_id: String,
    pub timezone: String,
    pub time_processing: String,
}

impl UploadSession {
    pub fn new(config: &ImportConfig, info: &ConfigInfo) -> Self {
        let device = &config.device;
        let mut device_tags = vec!["insulin-pump".to_string()];
        if device.has_cgm {
            device_tags.push("cgm".to_string());
        }
        Self {
            device_tags,
            device_manufacturers: vec![device.manufacturer.clone()],
            device_model: device.model.clone(),
            device_serial_number: info.serial.to_string(),
            device_id: format!("{}{}-{}", device.manufacturer, device.model, info.serial),
            timezone: config.timezone.clone(),
            time_processing: config.time_processing.clone(),
        }
    }
}

/// Import phases, each owning a slice of the overall progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Setup,
    Connect,
    GetConfigInfo,
    FetchData,
    ProcessData,
    UploadData,
    Disconnect,
    Cleanup,
}

impl Phase {
    pub fn range(self) -> (u8, u8) {
        match self {
            Phase::Setup => (0, 5),
            Phase::Connect => (5, 10),
            Phase::GetConfigInfo => (10, 15),
            Phase::FetchData => (15, 70),
            Phase::ProcessData => (70, 80),
            Phase::UploadData => (80, 95),
            Phase::Disconnect => (95, 98),
            Phase::Cleanup => (98, 100),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Setup => write!(f, "setup"),
            Phase::Connect => write!(f, "connect"),
            Phase::GetConfigInfo => write!(f, "getConfigInfo"),
            Phase::FetchData => write!(f, "fetchData"),
            Phase::ProcessData => write!(f, "processData"),
            Phase::UploadData => write!(f, "uploadData"),
            Phase::Disconnect => write!(f, "disconnect"),
            Phase::Cleanup => write!(f, "cleanup"),
        }
    }
}

/// Outcome of a successful run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSummary {
    pub serial: u32,
    pub records: usize,
    pub events: usize,
}

/// Runs one import from connect to upload
pub struct ImportPipeline {
    config: ImportConfig,
    link_config: LinkConfig,
    cancel: CancelToken,
}

impl ImportPipeline {
    pub fn new(config: ImportConfig, link_config: LinkConfig) -> Self {
        Self {
            config,
            link_config,
            cancel: CancelToken::new(),
        }
    }

    /// Token that stops the run at the next page boundary
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Record kinds this device logs
    fn kinds(&self) -> Vec<RecordKind> {
        RecordKind::ALL
            .iter()
            .copied()
            .filter(|kind| *kind != RecordKind::Cbg || self.config.device.has_cgm)
            .collect()
    }

    fn enter(&self, phase: Phase) -> Result<()> {
        if self.cancel.is_cancelled() {
            info!("Import cancelled before {}", phase);
            return Err(PumpError::Cancelled);
        }
        info!("Phase {}", phase);
        Ok(())
    }

    pub async fn run(
        &self,
        transport: Box<dyn Transport>,
        uploader: &mut dyn Uploader,
        progress: &ProgressReporter,
    ) -> Result<ImportSummary> {
        let mut session = LinkSession::new(transport, self.link_config.clone());
        let result = self.run_phases(&mut session, uploader, progress).await;
        if let Err(e) = &result {
            error!("Import failed: {}", e);
            if let Err(close_error) = session.close().await {
                debug!("Ignoring close failure after error: {}", close_error);
            }
        }
        result
    }

    async fn run_phases(
        &self,
        session: &mut LinkSession,
        uploader: &mut dyn Uploader,
        progress: &ProgressReporter,
    ) -> Result<ImportSummary> {
        let phase_range = |phase: Phase| {
            let (start, end) = phase.range();
            progress.range(start, end)
        };

        self.enter(Phase::Setup)?;
        phase_range(Phase::Setup).complete();

        self.enter(Phase::Connect)?;
        session.open().await?;
        phase_range(Phase::Connect).complete();

        let (info, records) = {
            let mut reader = RecordReader::new(session, &self.config.device, self.cancel.clone());

            self.enter(Phase::GetConfigInfo)?;
            let info = reader.read_config_info().await?;
            phase_range(Phase::GetConfigInfo).complete();

            self.enter(Phase::FetchData)?;
            let fetch = phase_range(Phase::FetchData);
            let kinds = self.kinds();
            let share = 100.0 / kinds.len() as f64;
            let mut records = Vec::new();
            for (i, kind) in kinds.into_iter().enumerate() {
                let sub = fetch.sub(i as f64 * share, (i + 1) as f64 * share);
                let mut kind_records = reader.read_all(kind, &sub).await?;
                info!("Read {} {} records", kind_records.len(), kind);
                records.append(&mut kind_records);
            }
            fetch.complete();
            (info, records)
        };
        let record_count = records.len();

        self.enter(Phase::ProcessData)?;
        let context = FinalizeContext {
            settings_time: Some(info.clock),
            schedule: Some(info.schedule.clone()),
        };
        let events = build_timeline(records, SimulatorOptions::from(&self.config), &context)?;
        phase_range(Phase::ProcessData).complete();

        self.enter(Phase::UploadData)?;
        let upload_session = UploadSession::new(&self.config, &info);
        uploader.upload(&upload_session, &events).await?;
        phase_range(Phase::UploadData).complete();

        self.enter(Phase::Disconnect)?;
        session.disconnect().await?;
        phase_range(Phase::Disconnect).complete();

        info!("Phase {}", Phase::Cleanup);
        session.close().await?;
        phase_range(Phase::Cleanup).complete();

        Ok(ImportSummary {
            serial: info.serial,
            records: record_count,
            events: events.len(),
        })
    }
}
