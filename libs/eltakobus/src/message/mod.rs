//! Telegram Codec
//!
//! Framing, checksum and per-kind parse/serialize for the fixed-length ESP2
//! wire format used on the Eltako RS485 bus.
//!
//! ```text
//! [A5][5A][header][ORG][data × 8][address][checksum]
//!  preamble  \________ body (11 bytes) ________/  sum(body) mod 256
//! ```
//!
//! `Esp2Message` only guarantees length, preamble and checksum. Each telegram
//! kind implements [`Message`] and adds its own structural checks on top.
//! [`prettify`] tries every known kind in a fixed order and is meant for
//! display; logic that needs a particular kind parses that kind explicitly.

mod eltako;
mod esp2;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

pub use eltako::{
    EltakoBusLock, EltakoBusUnlock, EltakoDiscoveryReply, EltakoDiscoveryRequest, EltakoMemoryRequest,
    EltakoMemoryResponse, EltakoMemoryWrite, EltakoMessage, EltakoPoll, EltakoPollForced,
    EltakoTimeout, EltakoWrapped4bs, EltakoWrappedRps, EltakoWriteSelect, ORG_BUS_LOCK,
    ORG_DISCOVERY, ORG_MEMORY_READ, ORG_MEMORY_WRITE, ORG_POLL, ORG_POLL_FORCED, ORG_TIMEOUT,
    ORG_WRITE_SELECT,
};
pub use esp2::{Regular4bsMessage, RpsMessage, TeachIn4bsMessage2, ORG_4BS, ORG_RPS};

/// Total length of one telegram on the wire
pub const TELEGRAM_LEN: usize = 14;
/// Length of the checksummed body
pub const BODY_LEN: usize = 11;
/// Sync bytes preceding every telegram
pub const PREAMBLE: [u8; 2] = [0xA5, 0x5A];

/// Lower five bits of every header byte
const HEADER_MARKER: u8 = 0x0B;

/// Header sequence (`h_seq`) roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HeaderSequence {
    /// Receive radio telegram (incoming event)
    Rrt = 0,
    /// Transmit radio telegram (outgoing event)
    Trt = 3,
    /// Receive message telegram (control reply)
    Rmt = 4,
    /// Transmit control telegram (control request)
    Tct = 5,
}

impl HeaderSequence {
    /// Full header byte for this role
    pub const fn header(self) -> u8 {
        ((self as u8) << 5) | HEADER_MARKER
    }

    /// Decode a header byte; `None` for any other value
    pub fn from_header(header: u8) -> Option<Self> {
        [Self::Rrt, Self::Trt, Self::Rmt, Self::Tct]
            .into_iter()
            .find(|role| role.header() == header)
    }
}

/// Checksum over a telegram body
pub fn checksum(body: &[u8]) -> u8 {
    body.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Spaced uppercase hex, as used in logs and telegram descriptions
pub fn hex_string(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// A framed telegram with nothing known beyond length, preamble and checksum
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Esp2Message {
    body: [u8; BODY_LEN],
}

impl Esp2Message {
    pub const fn new(body: [u8; BODY_LEN]) -> Self {
        Self { body }
    }

    pub fn body(&self) -> &[u8; BODY_LEN] {
        &self.body
    }

    pub fn header(&self) -> u8 {
        self.body[0]
    }

    /// ORG byte; its meaning depends on the header sequence
    pub fn org(&self) -> u8 {
        self.body[1]
    }

    pub fn header_sequence(&self) -> Option<HeaderSequence> {
        HeaderSequence::from_header(self.header())
    }

    /// Wire representation including preamble and checksum
    pub fn serialize(&self) -> [u8; TELEGRAM_LEN] {
        let mut frame = [0u8; TELEGRAM_LEN];
        frame[..2].copy_from_slice(&PREAMBLE);
        frame[2..TELEGRAM_LEN - 1].copy_from_slice(&self.body);
        frame[TELEGRAM_LEN - 1] = checksum(&self.body);
        frame
    }

    /// Parse exactly one telegram
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() != TELEGRAM_LEN {
            return Err(ParseError::InvalidLength(data.len()));
        }
        if data[..2] != PREAMBLE {
            return Err(ParseError::NoPreamble);
        }

        let mut body = [0u8; BODY_LEN];
        body.copy_from_slice(&data[2..TELEGRAM_LEN - 1]);

        let expected = checksum(&body);
        let actual = data[TELEGRAM_LEN - 1];
        if expected != actual {
            return Err(ParseError::ChecksumMismatch { expected, actual });
        }

        Ok(Self { body })
    }
}

impl fmt::Debug for Esp2Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Esp2Message({})", hex_string(&self.body))
    }
}

impl fmt::Display for Esp2Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<ESP2Message {}>", hex_string(&self.body))
    }
}

/// A telegram kind with its own structural constraints
///
/// `to_esp2` is the exact inverse of `from_esp2`: serializing a parsed
/// telegram reproduces the bytes it was parsed from.
pub trait Message: Sized {
    /// Human readable kind name used in errors and logs
    const NAME: &'static str;

    /// Interpret a framed telegram as this kind
    fn from_esp2(message: &Esp2Message) -> Result<Self, ParseError>;

    /// Build the framed telegram for this value
    fn to_esp2(&self) -> Esp2Message;

    /// Parse raw wire bytes as this kind
    fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Self::from_esp2(&Esp2Message::parse(data)?)
    }

    /// Wire bytes for this value
    fn serialize(&self) -> [u8; TELEGRAM_LEN] {
        self.to_esp2().serialize()
    }
}

impl Message for Esp2Message {
    const NAME: &'static str = "ESP2Message";

    fn from_esp2(message: &Esp2Message) -> Result<Self, ParseError> {
        Ok(*message)
    }

    fn to_esp2(&self) -> Esp2Message {
        *self
    }
}

/// Result of [`prettify`]: the first kind that structurally matched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Telegram {
    BusLock(EltakoBusLock),
    BusUnlock(EltakoBusUnlock),
    DiscoveryRequest(EltakoDiscoveryRequest),
    DiscoveryReply(EltakoDiscoveryReply),
    MemoryRequest(EltakoMemoryRequest),
    MemoryResponse(EltakoMemoryResponse),
    Timeout(EltakoTimeout),
    Poll(EltakoPoll),
    PollForced(EltakoPollForced),
    WriteSelect(EltakoWriteSelect),
    MemoryWrite(EltakoMemoryWrite),
    WrappedRps(EltakoWrappedRps),
    Wrapped4bs(EltakoWrapped4bs),
    Rps(RpsMessage),
    Regular4bs(Regular4bsMessage),
    TeachIn4bs(TeachIn4bsMessage2),
    Eltako(EltakoMessage),
    Raw(Esp2Message),
}

/// Interpret a telegram as the first matching known kind
///
/// Priority: lock, unlock, discovery request, discovery reply, memory
/// request, memory response, timeout, poll, forced poll, write select,
/// memory write, wrapped RPS, wrapped 4BS, RPS, regular 4BS, teach-in 4BS,
/// generic control envelope. Anything else is returned raw.
///
/// Only use this for display. Later additions to the list can change which
/// kind a telegram is reported as.
pub fn prettify(message: &Esp2Message) -> Telegram {
    macro_rules! try_kind {
        ($kind:ty, $variant:ident) => {
            if let Ok(parsed) = <$kind>::from_esp2(message) {
                return Telegram::$variant(parsed);
            }
        };
    }

    try_kind!(EltakoBusLock, BusLock);
    try_kind!(EltakoBusUnlock, BusUnlock);
    try_kind!(EltakoDiscoveryRequest, DiscoveryRequest);
    try_kind!(EltakoDiscoveryReply, DiscoveryReply);
    try_kind!(EltakoMemoryRequest, MemoryRequest);
    try_kind!(EltakoMemoryResponse, MemoryResponse);
    try_kind!(EltakoTimeout, Timeout);
    try_kind!(EltakoPoll, Poll);
    try_kind!(EltakoPollForced, PollForced);
    try_kind!(EltakoWriteSelect, WriteSelect);
    try_kind!(EltakoMemoryWrite, MemoryWrite);
    try_kind!(EltakoWrappedRps, WrappedRps);
    try_kind!(EltakoWrapped4bs, Wrapped4bs);
    try_kind!(RpsMessage, Rps);
    try_kind!(Regular4bsMessage, Regular4bs);
    try_kind!(TeachIn4bsMessage2, TeachIn4bs);
    try_kind!(EltakoMessage, Eltako);

    Telegram::Raw(*message)
}

impl Telegram {
    pub fn to_esp2(&self) -> Esp2Message {
        match self {
            Telegram::BusLock(m) => m.to_esp2(),
            Telegram::BusUnlock(m) => m.to_esp2(),
            Telegram::DiscoveryRequest(m) => m.to_esp2(),
            Telegram::DiscoveryReply(m) => m.to_esp2(),
            Telegram::MemoryRequest(m) => m.to_esp2(),
            Telegram::MemoryResponse(m) => m.to_esp2(),
            Telegram::Timeout(m) => m.to_esp2(),
            Telegram::Poll(m) => m.to_esp2(),
            Telegram::PollForced(m) => m.to_esp2(),
            Telegram::WriteSelect(m) => m.to_esp2(),
            Telegram::MemoryWrite(m) => m.to_esp2(),
            Telegram::WrappedRps(m) => m.to_esp2(),
            Telegram::Wrapped4bs(m) => m.to_esp2(),
            Telegram::Rps(m) => m.to_esp2(),
            Telegram::Regular4bs(m) => m.to_esp2(),
            Telegram::TeachIn4bs(m) => m.to_esp2(),
            Telegram::Eltako(m) => m.to_esp2(),
            Telegram::Raw(m) => *m,
        }
    }

    /// ORG byte of the underlying telegram
    pub fn org(&self) -> u8 {
        self.to_esp2().org()
    }
}

impl fmt::Display for Telegram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Telegram::BusLock(m) => fmt::Display::fmt(m, f),
            Telegram::BusUnlock(m) => fmt::Display::fmt(m, f),
            Telegram::DiscoveryRequest(m) => fmt::Display::fmt(m, f),
            Telegram::DiscoveryReply(m) => fmt::Display::fmt(m, f),
            Telegram::MemoryRequest(m) => fmt::Display::fmt(m, f),
            Telegram::MemoryResponse(m) => fmt::Display::fmt(m, f),
            Telegram::Timeout(m) => fmt::Display::fmt(m, f),
            Telegram::Poll(m) => fmt::Display::fmt(m, f),
            Telegram::PollForced(m) => fmt::Display::fmt(m, f),
            Telegram::WriteSelect(m) => fmt::Display::fmt(m, f),
            Telegram::MemoryWrite(m) => fmt::Display::fmt(m, f),
            Telegram::WrappedRps(m) => fmt::Display::fmt(m, f),
            Telegram::Wrapped4bs(m) => fmt::Display::fmt(m, f),
            Telegram::Rps(m) => fmt::Display::fmt(m, f),
            Telegram::Regular4bs(m) => fmt::Display::fmt(m, f),
            Telegram::TeachIn4bs(m) => fmt::Display::fmt(m, f),
            Telegram::Eltako(m) => fmt::Display::fmt(m, f),
            Telegram::Raw(m) => fmt::Display::fmt(m, f),
        }
    }
}
