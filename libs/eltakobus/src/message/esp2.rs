//! Event telegrams: RPS (switch) and 4BS (four data bytes)

use std::fmt;

use super::{hex_string, Esp2Message, HeaderSequence, Message, BODY_LEN};
use crate::error::ParseError;

pub const ORG_RPS: u8 = 0x05;
pub const ORG_4BS: u8 = 0x07;

/// LRN bit in the last 4BS data byte; cleared for teach-in telegrams
const LRN_BIT: u8 = 0x08;

/// Event telegrams travel as RRT (incoming) or TRT (outgoing)
fn event_direction(message: &Esp2Message) -> Result<bool, ParseError> {
    match message.header_sequence() {
        Some(HeaderSequence::Trt) => Ok(true),
        Some(HeaderSequence::Rrt) => Ok(false),
        _ => Err(ParseError::UnexpectedHeader(message.header())),
    }
}

fn event_header(outgoing: bool) -> u8 {
    if outgoing {
        HeaderSequence::Trt.header()
    } else {
        HeaderSequence::Rrt.header()
    }
}

fn check_org(message: &Esp2Message, expected: u8) -> Result<(), ParseError> {
    if message.org() == expected {
        Ok(())
    } else {
        Err(ParseError::WrongOrg {
            expected,
            actual: message.org(),
        })
    }
}

fn sender(body: &[u8; BODY_LEN]) -> [u8; 4] {
    [body[6], body[7], body[8], body[9]]
}

/// Single data byte switch telegram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpsMessage {
    pub address: [u8; 4],
    pub status: u8,
    pub data: u8,
    pub outgoing: bool,
}

impl RpsMessage {
    /// Rocker type: 2 for T2 (bit 5 set), 1 for T1
    pub fn t21(&self) -> u8 {
        if self.status & 0x20 != 0 {
            2
        } else {
            1
        }
    }

    /// `true` for N messages (bit 4 set), `false` for U messages
    pub fn nu(&self) -> bool {
        self.status & 0x10 != 0
    }

    pub fn repetition_count(&self) -> u8 {
        self.status & 0x0F
    }
}

impl Message for RpsMessage {
    const NAME: &'static str = "RPSMessage";

    fn from_esp2(message: &Esp2Message) -> Result<Self, ParseError> {
        let outgoing = event_direction(message)?;
        check_org(message, ORG_RPS)?;

        let body = message.body();
        if body[3..6].iter().any(|b| *b != 0) {
            return Err(ParseError::ReservedNotZero);
        }

        Ok(Self {
            address: sender(body),
            status: body[10],
            data: body[2],
            outgoing,
        })
    }

    fn to_esp2(&self) -> Esp2Message {
        let a = self.address;
        Esp2Message::new([
            event_header(self.outgoing),
            ORG_RPS,
            self.data,
            0,
            0,
            0,
            a[0],
            a[1],
            a[2],
            a[3],
            self.status,
        ])
    }
}

impl fmt::Display for RpsMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<RPSMessage from {}, db0 = {:02X}, status = 0x{:02x} (T{}, {}, {} repetitions)>",
            hex_string(&self.address),
            self.data,
            self.status,
            self.t21(),
            if self.nu() { "N" } else { "U" },
            self.repetition_count()
        )
    }
}

/// Shared 4BS layout; `teach_in` selects which LRN bit value is accepted
fn parse_4bs(
    message: &Esp2Message,
    teach_in: bool,
) -> Result<([u8; 4], u8, [u8; 4], bool), ParseError> {
    let outgoing = event_direction(message)?;
    check_org(message, ORG_4BS)?;

    let body = message.body();
    let data = [body[2], body[3], body[4], body[5]];
    if (data[3] & LRN_BIT == 0) != teach_in {
        return Err(ParseError::LearnBitMismatch);
    }

    Ok((sender(body), body[10], data, outgoing))
}

fn build_4bs(outgoing: bool, data: [u8; 4], address: [u8; 4], status: u8) -> Esp2Message {
    Esp2Message::new([
        event_header(outgoing),
        ORG_4BS,
        data[0],
        data[1],
        data[2],
        data[3],
        address[0],
        address[1],
        address[2],
        address[3],
        status,
    ])
}

/// 4BS data telegram (LRN bit set)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Regular4bsMessage {
    pub address: [u8; 4],
    pub status: u8,
    pub data: [u8; 4],
    pub outgoing: bool,
}

impl Message for Regular4bsMessage {
    const NAME: &'static str = "Regular4BSMessage";

    fn from_esp2(message: &Esp2Message) -> Result<Self, ParseError> {
        let (address, status, data, outgoing) = parse_4bs(message, false)?;
        Ok(Self {
            address,
            status,
            data,
            outgoing,
        })
    }

    fn to_esp2(&self) -> Esp2Message {
        build_4bs(self.outgoing, self.data, self.address, self.status)
    }
}

impl fmt::Display for Regular4bsMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Regular4BSMessage from {}, data {}, status = 0x{:02x}>",
            hex_string(&self.address),
            hex_string(&self.data),
            self.status
        )
    }
}

/// Variation 2 4BS teach-in telegram (LRN type 1, unidirectional)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeachIn4bsMessage2 {
    pub address: [u8; 4],
    pub status: u8,
    pub data: [u8; 4],
    pub outgoing: bool,
}

impl TeachIn4bsMessage2 {
    /// EEP as (RORG, FUNC, TYPE)
    pub fn profile(&self) -> (u8, u8, u8) {
        let d = self.data;
        (0xA5, d[0] >> 2, ((d[0] & 0x03) << 5) | (d[1] >> 3))
    }

    /// 11-bit manufacturer id
    pub fn manufacturer(&self) -> u16 {
        (u16::from(self.data[1] & 0x07) << 8) | u16::from(self.data[2])
    }
}

impl Message for TeachIn4bsMessage2 {
    const NAME: &'static str = "TeachIn4BSMessage2";

    fn from_esp2(message: &Esp2Message) -> Result<Self, ParseError> {
        let (address, status, data, outgoing) = parse_4bs(message, true)?;
        // low three bits are unspecified, Eltako devices send 0x7 there
        if data[3] & 0xF8 != 0x80 {
            return Err(ParseError::NotVariation2);
        }
        Ok(Self {
            address,
            status,
            data,
            outgoing,
        })
    }

    fn to_esp2(&self) -> Esp2Message {
        build_4bs(self.outgoing, self.data, self.address, self.status)
    }
}

impl fmt::Display for TeachIn4bsMessage2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (rorg, func, kind) = self.profile();
        write!(
            f,
            "<TeachIn4BSMessage2 from {}, profile {:02x}-{:02x}-{:02x}, manufacturer {}>",
            hex_string(&self.address),
            rorg,
            func,
            kind,
            self.manufacturer()
        )
    }
}
