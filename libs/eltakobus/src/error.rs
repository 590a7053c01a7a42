//! Eltako Bus Error Types
//!
//! `ParseError` describes why a byte window is not a telegram (or not the
//! requested kind of telegram). It never escapes the codec as a fatal
//! condition: the frame reassembly resynchronizes on it and typed exchanges
//! surface it only when a reply could not be classified at all.
//!
//! `BusError` covers everything above the codec.

use thiserror::Error;

/// Result type for eltakobus operations
pub type Result<T> = std::result::Result<T, BusError>;

/// Structural mismatch between a byte window and a telegram kind
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Input is not exactly one telegram long
    #[error("Invalid message length: expected 14, got {0}")]
    InvalidLength(usize),

    /// The A5 5A sync bytes are missing
    #[error("No preamble found")]
    NoPreamble,

    /// Trailing checksum does not match the body
    #[error("Checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    /// Header sequence is not legal for the kind
    #[error("Unexpected header 0x{0:02X}")]
    UnexpectedHeader(u8),

    /// ORG byte belongs to another kind
    #[error("Wrong ORG: expected 0x{expected:02X}, got 0x{actual:02X}")]
    WrongOrg { expected: u8, actual: u8 },

    /// Bytes that must be zero are not
    #[error("Reserved data bytes are not zero")]
    ReservedNotZero,

    /// 4BS learn bit disagrees with the requested kind
    #[error("LRN bit does not match")]
    LearnBitMismatch,

    /// Teach-in telegram that is not a plain variation 2 telegram
    #[error("Not a plain variation 2 teach-in telegram")]
    NotVariation2,

    /// Fixed fields of a control telegram do not match
    #[error("This is not an {0}")]
    Mismatch(&'static str),

    /// Memory response for another row than the one requested
    #[error("Requested memory row {requested}, got row {returned}")]
    RowMismatch { requested: u8, returned: u8 },
}

/// Bus level errors
#[derive(Debug, Error, Clone)]
pub enum BusError {
    /// A reply could neither be parsed as the expected kind nor as a timeout
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// The bus did not answer in time, or a device answered with a timeout telegram
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A memory write sequence got an unexpected acknowledgment
    #[error("Write error: {0}")]
    Write(String),

    /// The coordinator restarted its discovery scan while we tried to lock
    #[error(
        "Coordinator is in a non-terminating scan mode: saw discovery of {observed} after {largest}"
    )]
    BadCoordinatorScanMode { largest: u8, observed: u8 },

    /// Device logic could not interpret a telegram
    #[error("Unrecognized update: {0}")]
    UnrecognizedUpdate(String),

    /// A second exchange was started while one is pending
    #[error("exchange is not reentrant, please serialize your access to the bus")]
    Busy,

    /// Echo probing gave no usable answer
    #[error("Echo calibration failed: {0}")]
    EchoCalibration(String),

    /// Serial line could not be opened, or went away
    #[error("Connection error: {0}")]
    Connection(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(String),

    /// Cache persistence errors
    #[error("Cache storage error: {0}")]
    Storage(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for BusError {
    fn from(err: std::io::Error) -> Self {
        BusError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::Storage(format!("JSON error: {}", err))
    }
}

impl From<figment::Error> for BusError {
    fn from(err: figment::Error) -> Self {
        BusError::Config(err.to_string())
    }
}

impl From<tokio_serial::Error> for BusError {
    fn from(err: tokio_serial::Error) -> Self {
        BusError::Connection(err.to_string())
    }
}

// Helper methods for creating errors
impl BusError {
    pub fn timeout(msg: impl Into<String>) -> Self {
        BusError::Timeout(msg.into())
    }

    pub fn write(msg: impl Into<String>) -> Self {
        BusError::Write(msg.into())
    }

    pub fn unrecognized_update(msg: impl Into<String>) -> Self {
        BusError::UnrecognizedUpdate(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        BusError::Connection(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        BusError::Storage(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        BusError::Config(msg.into())
    }

    /// Check whether the bus (or a device on it) gave no meaningful answer
    pub fn is_timeout(&self) -> bool {
        matches!(self, BusError::Timeout(_))
    }
}
