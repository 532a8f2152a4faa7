//! Common types, enums, and error definitions for the pump link protocol

use std::fmt;
use thiserror::Error;

/// Result type alias for pump operations
pub type Result<T> = std::result::Result<T, PumpError>;

/// Error types for pump communication and history reconstruction
#[derive(Error, Debug)]
pub enum PumpError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("No response from device after {attempts} attempts")]
    Timeout { attempts: u32 },

    #[error("Frame checksum mismatch")]
    ChecksumMismatch,

    #[error("Device reported error code 0x{0:02X}")]
    DeviceReported(u8),

    #[error("No device answered discovery on any of {slots} slots")]
    DiscoveryFailed { slots: u8 },

    #[error("Device did not accept connection after {attempts} attempts")]
    ConnectFailed { attempts: u32 },

    #[error("Link counter out of sequence: expected {expected}, got {got}")]
    CounterDesync { expected: u8, got: u8 },

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Link is not connected")]
    NotConnected,

    #[error("History data missing for {kind}: {detail}")]
    DataMissing { kind: String, detail: String },

    #[error("Decoding error: {0}")]
    Decode(String),

    #[error("Invalid device date: {0}")]
    InvalidDate(String),

    #[error("No bolus matches wizard sync counter {0}")]
    SyncCounterMismatch(u8),

    #[error("Out of order timestamp: {current} arrived after {previous}")]
    OutOfOrder { previous: String, current: String },

    #[error("Import cancelled")]
    Cancelled,

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PumpError {
    /// Message shown to the person running the import when this error ends it
    pub fn user_message(&self) -> String {
        match self {
            PumpError::Transport(_)
            | PumpError::Timeout { .. }
            | PumpError::ChecksumMismatch
            | PumpError::CounterDesync { .. }
            | PumpError::UnexpectedResponse(_)
            | PumpError::NotConnected => {
                "Lost communication with the pump. Align the pump with the reader, make sure the pump is suspended, and retry.".to_string()
            }
            PumpError::DiscoveryFailed { .. } | PumpError::ConnectFailed { .. } => {
                "Could not find the pump. Align the pump with the reader, suspend it, and retry.".to_string()
            }
            PumpError::DeviceReported(code) => format!(
                "The pump refused the request (error 0x{:02X}). Suspend the pump and retry.",
                code
            ),
            PumpError::DataMissing { .. } | PumpError::InvalidDate(_) | PumpError::Decode(_) => {
                "Some data went missing during the download - please retry.".to_string()
            }
            PumpError::SyncCounterMismatch(_) | PumpError::OutOfOrder { .. } => {
                "The pump history could not be processed. Please contact support.".to_string()
            }
            PumpError::Cancelled => "The import was cancelled.".to_string(),
            PumpError::Upload(_) => "The upload failed. Please retry.".to_string(),
            PumpError::Io(_) | PumpError::Json(_) => format!("{}", self),
        }
    }

    /// Errors the history reader recovers from with one reconnect-and-retry cycle
    pub fn requires_reconnect(&self) -> bool {
        matches!(
            self,
            PumpError::Timeout { .. }
                | PumpError::ChecksumMismatch
                | PumpError::CounterDesync { .. }
                | PumpError::UnexpectedResponse(_)
                | PumpError::DataMissing { .. }
                | PumpError::InvalidDate(_)
        )
    }
}

/// Link-layer frame types, identified by the control byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Numbered information frame carrying send/receive counters
    Information { send: u8, receive: u8 },
    /// Receive-ready acknowledgement carrying the receive counter
    ReceiveReady { receive: u8 },
    Connect,
    ConnectAck,
    Disconnect,
    Discovery,
    /// Unnumbered information, used by the device for diagnostic echoes
    Unnumbered,
}

pub const CONTROL_CONNECT: u8 = 0x93;
pub const CONTROL_CONNECT_ACK: u8 = 0x73;
pub const CONTROL_DISCONNECT: u8 = 0x53;
pub const CONTROL_DISCOVERY: u8 = 0xBF;
pub const CONTROL_UNNUMBERED: u8 = 0x13;

const POLL_BIT: u8 = 0x10;
const COUNTER_MASK: u8 = 0x07;

impl FrameType {
    /// Convert a control byte to a FrameType
    pub fn from_u8(control: u8) -> Result<Self> {
        match control {
            CONTROL_CONNECT => Ok(FrameType::Connect),
            CONTROL_CONNECT_ACK => Ok(FrameType::ConnectAck),
            CONTROL_DISCONNECT => Ok(FrameType::Disconnect),
            CONTROL_DISCOVERY => Ok(FrameType::Discovery),
            CONTROL_UNNUMBERED => Ok(FrameType::Unnumbered),
            c if c & 0x01 == 0 => Ok(FrameType::Information {
                send: (c >> 1) & COUNTER_MASK,
                receive: (c >> 5) & COUNTER_MASK,
            }),
            c if c & 0x0F == 0x01 => Ok(FrameType::ReceiveReady {
                receive: (c >> 5) & COUNTER_MASK,
            }),
            c => Err(PumpError::UnexpectedResponse(format!(
                "unknown control byte 0x{:02X}",
                c
            ))),
        }
    }

    /// Convert FrameType to a control byte
    pub fn to_u8(self) -> u8 {
        match self {
            FrameType::Information { send, receive } => {
                ((receive & COUNTER_MASK) << 5) | POLL_BIT | ((send & COUNTER_MASK) << 1)
            }
            FrameType::ReceiveReady { receive } => ((receive & COUNTER_MASK) << 5) | POLL_BIT | 0x01,
            FrameType::Connect => CONTROL_CONNECT,
            FrameType::ConnectAck => CONTROL_CONNECT_ACK,
            FrameType::Disconnect => CONTROL_DISCONNECT,
            FrameType::Discovery => CONTROL_DISCOVERY,
            FrameType::Unnumbered => CONTROL_UNNUMBERED,
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameType::Information { send, receive } => write!(f, "I(ns={}, nr={})", send, receive),
            FrameType::ReceiveReady { receive } => write!(f, "RR(nr={})", receive),
            FrameType::Connect => write!(f, "SNRM"),
            FrameType::ConnectAck => write!(f, "UA"),
            FrameType::Disconnect => write!(f, "DISC"),
            FrameType::Discovery => write!(f, "XID"),
            FrameType::Unnumbered => write!(f, "UI"),
        }
    }
}

/// Helper function to format bytes as hex for debugging
pub fn hex_dump(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
