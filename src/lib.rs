//! Insulin pump history download
//!
//! This library talks to insulin pumps over their serial link protocol, reads the
//! device history logs and rebuilds them into an ordered, gap-free timeline of
//! clinical events ready for upload.
//!
//! # Modules
//!
//! - `frame`: link-layer framing (delimiters, byte-stuffing, CRC)
//! - `link`: link session state machine with counters and bounded retries
//! - `reader`: paginated history retrieval with gap and duplicate checks
//! - `decode`: per-record byte layout decoders
//! - `dose`: bolus wizard arithmetic matching the pump
//! - `simulator`: folds records into the final event timeline
//! - `pipeline`: whole-import phases, progress and upload hand-off
//! - `types`: error type and frame control bytes

pub mod capture;
pub mod config;
pub mod decode;
pub mod dose;
pub mod frame;
pub mod link;
pub mod pipeline;
pub mod progress;
pub mod reader;
pub mod records;
pub mod simulator;
pub mod types;

#[cfg(test)]
pub(crate) mod mock_pump;

pub use capture::parse_capture;
pub use config::{BgUnits, DeviceGeneration, DeviceProfile, ImportConfig, LinkConfig};
pub use decode::{decode_date, RecordDecoder};
pub use dose::{recommend, round_and_not_negative, round_to, Recommendation, RoundMode};
pub use frame::{build_frame, FrameCodec, RawFrame};
pub use link::{LinkSession, LinkState, LinkStatus, Transport};
pub use pipeline::{ImportPipeline, ImportSummary, Phase, UploadSession, Uploader};
pub use progress::{CancelToken, ProgressRange, ProgressReporter};
pub use reader::{LogSize, RecordReader};
pub use records::{Annotation, DomainRecord, EventKind, RecordKind, RecordPayload, TimelineEvent};
pub use simulator::{build_timeline, FinalizeContext, Simulator, SimulatorOptions};
pub use types::{FrameType, PumpError, Result};
