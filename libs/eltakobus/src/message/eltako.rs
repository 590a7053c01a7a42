//! Eltako control telegrams
//!
//! The bus uses the RMT/TCT header sequences of ESP2 for its own proprietary
//! request/reply envelopes; the ORG byte selects the command. Every RMT/TCT
//! telegram is interpreted as an [`EltakoMessage`] because no other use of
//! those header sequences is known.

use std::fmt;

use super::{hex_string, Esp2Message, HeaderSequence, Message};
use crate::error::ParseError;

pub const ORG_DISCOVERY: u8 = 0xF0;
pub const ORG_MEMORY_READ: u8 = 0xF1;
pub const ORG_WRITE_SELECT: u8 = 0xF2;
pub const ORG_MEMORY_WRITE: u8 = 0xF4;
pub const ORG_TIMEOUT: u8 = 0xF8;
pub const ORG_POLL: u8 = 0xFC;
pub const ORG_POLL_FORCED: u8 = 0xFE;
pub const ORG_BUS_LOCK: u8 = 0xFF;

const ZERO_PAYLOAD: [u8; 8] = [0; 8];

/// Generic control envelope: `[header, ORG, payload × 8, address]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EltakoMessage {
    pub org: u8,
    pub address: u8,
    pub payload: [u8; 8],
    pub is_request: bool,
}

impl EltakoMessage {
    /// Request with an all-zero payload
    pub fn request(org: u8, address: u8) -> Self {
        Self {
            org,
            address,
            payload: ZERO_PAYLOAD,
            is_request: true,
        }
    }

    pub fn with_payload(org: u8, address: u8, payload: [u8; 8], is_request: bool) -> Self {
        Self {
            org,
            address,
            payload,
            is_request,
        }
    }

    /// Envelope check shared by every control sub-kind
    fn expect(
        message: &Esp2Message,
        org: u8,
        is_request: bool,
        kind: &'static str,
    ) -> Result<Self, ParseError> {
        let envelope = Self::from_esp2(message)?;
        if envelope.org != org || envelope.is_request != is_request {
            return Err(ParseError::Mismatch(kind));
        }
        Ok(envelope)
    }
}

impl Message for EltakoMessage {
    const NAME: &'static str = "EltakoMessage";

    fn from_esp2(message: &Esp2Message) -> Result<Self, ParseError> {
        let is_request = match message.header_sequence() {
            Some(HeaderSequence::Tct) => true,
            Some(HeaderSequence::Rmt) => false,
            _ => return Err(ParseError::UnexpectedHeader(message.header())),
        };

        let body = message.body();
        let mut payload = [0u8; 8];
        payload.copy_from_slice(&body[2..10]);

        Ok(Self {
            org: body[1],
            address: body[10],
            payload,
            is_request,
        })
    }

    fn to_esp2(&self) -> Esp2Message {
        let header = if self.is_request {
            HeaderSequence::Tct.header()
        } else {
            HeaderSequence::Rmt.header()
        };
        let p = self.payload;
        Esp2Message::new([
            header,
            self.org,
            p[0],
            p[1],
            p[2],
            p[3],
            p[4],
            p[5],
            p[6],
            p[7],
            self.address,
        ])
    }
}

impl fmt::Display for EltakoMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<EltakoMessage {} ORG {:02x} ADDR {:02x}, {}>",
            if self.is_request { "Request" } else { "Response" },
            self.org,
            self.address,
            hex_string(&self.payload)
        )
    }
}

/// Control telegrams without any variable field
macro_rules! static_message {
    ($(#[$meta:meta])* $name:ident, $label:literal, $org:expr, $is_request:expr, $address:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name;

        impl Message for $name {
            const NAME: &'static str = $label;

            fn from_esp2(message: &Esp2Message) -> Result<Self, ParseError> {
                let envelope = EltakoMessage::expect(message, $org, $is_request, Self::NAME)?;
                if envelope.address != $address || envelope.payload != ZERO_PAYLOAD {
                    return Err(ParseError::Mismatch(Self::NAME));
                }
                Ok($name)
            }

            fn to_esp2(&self) -> Esp2Message {
                EltakoMessage::with_payload($org, $address, ZERO_PAYLOAD, $is_request).to_esp2()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "<{}>", Self::NAME)
            }
        }
    };
}

static_message!(
    /// Lock the bus: the coordinator stops polling and passive senders go quiet
    EltakoBusLock,
    "EltakoBusLock",
    ORG_BUS_LOCK,
    true,
    0xFF
);

static_message!(
    /// Reverse the effect of [`EltakoBusLock`]
    EltakoBusUnlock,
    "EltakoBusUnlock",
    ORG_BUS_LOCK,
    true,
    0x00
);

static_message!(
    /// Explicit "nothing to say" reply of a device
    EltakoTimeout,
    "EltakoTimeout",
    ORG_TIMEOUT,
    false,
    0x00
);

/// Requests with a zero payload and a varying device address
macro_rules! address_only_message {
    ($(#[$meta:meta])* $name:ident, $label:literal, $org:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            pub address: u8,
        }

        impl Message for $name {
            const NAME: &'static str = $label;

            fn from_esp2(message: &Esp2Message) -> Result<Self, ParseError> {
                let envelope = EltakoMessage::expect(message, $org, true, Self::NAME)?;
                if envelope.payload != ZERO_PAYLOAD {
                    return Err(ParseError::Mismatch(Self::NAME));
                }
                Ok(Self {
                    address: envelope.address,
                })
            }

            fn to_esp2(&self) -> Esp2Message {
                EltakoMessage::request($org, self.address).to_esp2()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "<{} to {}>", Self::NAME, self.address)
            }
        }
    };
}

address_only_message!(
    /// Ask a device to send its queued messages
    EltakoPoll,
    "EltakoPoll",
    ORG_POLL
);

address_only_message!(
    /// Ask a device to send its status even when nothing is queued
    EltakoPollForced,
    "EltakoPollForced",
    ORG_POLL_FORCED
);

address_only_message!(
    /// Solicit a discovery reply from the device at `address`
    ///
    /// A device in address learning mode takes up any discovery request,
    /// answers it and keeps the address.
    EltakoDiscoveryRequest,
    "EltakoDiscoveryRequest",
    ORG_DISCOVERY
);

address_only_message!(
    /// Select a device for the memory writes that follow
    EltakoWriteSelect,
    "EltakoWriteSelect",
    ORG_WRITE_SELECT
);

/// Device summary: bus address, address slots used, memory size and model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EltakoDiscoveryReply {
    pub reported_address: u8,
    pub reported_size: u8,
    pub memory_size: u8,
    pub model: [u8; 4],
    /// Reply came from the bus coordinator (FAM)
    pub is_fam: bool,
}

impl Message for EltakoDiscoveryReply {
    const NAME: &'static str = "EltakoDiscoveryReply";

    fn from_esp2(message: &Esp2Message) -> Result<Self, ParseError> {
        let envelope = EltakoMessage::expect(message, ORG_DISCOVERY, false, Self::NAME)?;
        if envelope.address != 0 {
            return Err(ParseError::Mismatch(Self::NAME));
        }

        let p = envelope.payload;
        let is_fam = match p[3] {
            0x00 => true,
            0x08 => false,
            _ => return Err(ParseError::Mismatch(Self::NAME)),
        };

        Ok(Self {
            reported_address: p[0],
            reported_size: p[1],
            memory_size: p[2],
            model: [p[4], p[5], p[6], p[7]],
            is_fam,
        })
    }

    fn to_esp2(&self) -> Esp2Message {
        let m = self.model;
        let payload = [
            self.reported_address,
            self.reported_size,
            self.memory_size,
            if self.is_fam { 0x00 } else { 0x08 },
            m[0],
            m[1],
            m[2],
            m[3],
        ];
        EltakoMessage::with_payload(ORG_DISCOVERY, 0, payload, false).to_esp2()
    }
}

impl fmt::Display for EltakoDiscoveryReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<EltakoDiscoveryReply address {} size {}, model {}{}>",
            self.reported_address,
            self.reported_size,
            hex_string(&self.model),
            if self.is_fam { " (FAM)" } else { "" }
        )
    }
}

/// Read one 8-byte memory row of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EltakoMemoryRequest {
    pub address: u8,
    pub row: u8,
}

impl Message for EltakoMemoryRequest {
    const NAME: &'static str = "EltakoMemoryRequest";

    fn from_esp2(message: &Esp2Message) -> Result<Self, ParseError> {
        let envelope = EltakoMessage::expect(message, ORG_MEMORY_READ, true, Self::NAME)?;
        if envelope.payload[..7].iter().any(|b| *b != 0) {
            return Err(ParseError::Mismatch(Self::NAME));
        }
        Ok(Self {
            address: envelope.address,
            row: envelope.payload[7],
        })
    }

    fn to_esp2(&self) -> Esp2Message {
        let mut payload = ZERO_PAYLOAD;
        payload[7] = self.row;
        EltakoMessage::with_payload(ORG_MEMORY_READ, self.address, payload, true).to_esp2()
    }
}

impl fmt::Display for EltakoMemoryRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<EltakoMemoryRequest address {} row {}>",
            self.address, self.row
        )
    }
}

/// One memory row as returned by a device; the row sits in the address slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EltakoMemoryResponse {
    pub row: u8,
    pub value: [u8; 8],
}

impl Message for EltakoMemoryResponse {
    const NAME: &'static str = "EltakoMemoryResponse";

    fn from_esp2(message: &Esp2Message) -> Result<Self, ParseError> {
        let envelope = EltakoMessage::expect(message, ORG_MEMORY_READ, false, Self::NAME)?;
        Ok(Self {
            row: envelope.address,
            value: envelope.payload,
        })
    }

    fn to_esp2(&self) -> Esp2Message {
        EltakoMessage::with_payload(ORG_MEMORY_READ, self.row, self.value, false).to_esp2()
    }
}

impl fmt::Display for EltakoMemoryResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<EltakoMemoryResponse row {} value {}>",
            self.row,
            hex_string(&self.value)
        )
    }
}

/// Write one memory row of the selected device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EltakoMemoryWrite {
    pub row: u8,
    pub value: [u8; 8],
}

impl Message for EltakoMemoryWrite {
    const NAME: &'static str = "EltakoMemoryWrite";

    fn from_esp2(message: &Esp2Message) -> Result<Self, ParseError> {
        let envelope = EltakoMessage::expect(message, ORG_MEMORY_WRITE, true, Self::NAME)?;
        Ok(Self {
            row: envelope.address,
            value: envelope.payload,
        })
    }

    fn to_esp2(&self) -> Esp2Message {
        EltakoMessage::with_payload(ORG_MEMORY_WRITE, self.row, self.value, true).to_esp2()
    }
}

impl fmt::Display for EltakoMemoryWrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<EltakoMemoryWrite row {} value {}>",
            self.row,
            hex_string(&self.value)
        )
    }
}

/// RPS event relayed in a poll reply
///
/// Laid out like an RPS telegram but sent as a control reply: data byte
/// first, sender in the last four payload bytes, status in the address slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EltakoWrappedRps {
    pub address: [u8; 4],
    pub status: u8,
    pub data: u8,
}

impl Message for EltakoWrappedRps {
    const NAME: &'static str = "EltakoWrappedRPS";

    fn from_esp2(message: &Esp2Message) -> Result<Self, ParseError> {
        let envelope = EltakoMessage::expect(message, super::ORG_RPS, false, Self::NAME)?;
        let p = envelope.payload;
        if p[1..4].iter().any(|b| *b != 0) {
            return Err(ParseError::ReservedNotZero);
        }
        Ok(Self {
            address: [p[4], p[5], p[6], p[7]],
            status: envelope.address,
            data: p[0],
        })
    }

    fn to_esp2(&self) -> Esp2Message {
        let a = self.address;
        let payload = [self.data, 0, 0, 0, a[0], a[1], a[2], a[3]];
        EltakoMessage::with_payload(super::ORG_RPS, self.status, payload, false).to_esp2()
    }
}

impl fmt::Display for EltakoWrappedRps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<EltakoWrappedRPS from {}, status {:02x}, data {:02X}>",
            hex_string(&self.address),
            self.status,
            self.data
        )
    }
}

/// 4BS event relayed in a poll reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EltakoWrapped4bs {
    pub address: [u8; 4],
    pub status: u8,
    pub data: [u8; 4],
}

impl Message for EltakoWrapped4bs {
    const NAME: &'static str = "EltakoWrapped4BS";

    fn from_esp2(message: &Esp2Message) -> Result<Self, ParseError> {
        let envelope = EltakoMessage::expect(message, super::ORG_4BS, false, Self::NAME)?;
        let p = envelope.payload;
        Ok(Self {
            address: [p[4], p[5], p[6], p[7]],
            status: envelope.address,
            data: [p[0], p[1], p[2], p[3]],
        })
    }

    fn to_esp2(&self) -> Esp2Message {
        let (a, d) = (self.address, self.data);
        let payload = [d[0], d[1], d[2], d[3], a[0], a[1], a[2], a[3]];
        EltakoMessage::with_payload(super::ORG_4BS, self.status, payload, false).to_esp2()
    }
}

impl fmt::Display for EltakoWrapped4bs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<EltakoWrapped4BS from {}, status {:02x}, data {}>",
            hex_string(&self.address),
            self.status,
            hex_string(&self.data)
        )
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    // ========================================================================
    // Envelope
    // ========================================================================

    #[test]
    fn test_envelope_headers() {
        assert_eq!(EltakoMessage::request(0xF0, 1).to_esp2().header(), 0xAB);
        let reply = EltakoMessage::with_payload(0xF0, 1, ZERO_PAYLOAD, false);
        assert_eq!(reply.to_esp2().header(), 0x8B);
    }

    #[test]
    fn test_envelope_rejects_event_header() {
        let message = Esp2Message::new([0x0B, 0xF0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(
            EltakoMessage::from_esp2(&message),
            Err(ParseError::UnexpectedHeader(0x0B))
        );
    }

    // ========================================================================
    // Static and address-only kinds
    // ========================================================================

    #[test]
    fn test_bus_lock_bytes() {
        let frame = EltakoBusLock.serialize();
        assert_eq!(
            frame,
            [0xA5, 0x5A, 0xAB, 0xFF, 0, 0, 0, 0, 0, 0, 0, 0, 0xFF, 0xA9]
        );
        assert_eq!(EltakoBusLock::parse(&frame), Ok(EltakoBusLock));
        assert_eq!(
            EltakoBusUnlock::parse(&frame),
            Err(ParseError::Mismatch("EltakoBusUnlock"))
        );
    }

    #[test]
    fn test_timeout_is_reply() {
        let message = EltakoTimeout.to_esp2();
        assert_eq!(message.header(), 0x8B);
        assert_eq!(message.org(), ORG_TIMEOUT);
        assert_eq!(EltakoTimeout::from_esp2(&message), Ok(EltakoTimeout));

        let request = EltakoMessage::request(ORG_TIMEOUT, 0).to_esp2();
        assert!(EltakoTimeout::from_esp2(&request).is_err());
    }

    #[test]
    fn test_address_only_rejects_payload() {
        let message = EltakoMessage::with_payload(ORG_POLL, 4, [0, 0, 0, 0, 0, 0, 0, 1], true);
        assert_eq!(
            EltakoPoll::from_esp2(&message.to_esp2()),
            Err(ParseError::Mismatch("EltakoPoll"))
        );
        let poll = EltakoPoll::from_esp2(&EltakoMessage::request(ORG_POLL, 4).to_esp2()).unwrap();
        assert_eq!(poll.address, 4);
    }

    // ========================================================================
    // Discovery and memory
    // ========================================================================

    #[test]
    fn test_discovery_reply_fields() {
        let reply = EltakoDiscoveryReply {
            reported_address: 5,
            reported_size: 1,
            memory_size: 0x7F,
            model: [0x04, 0x01, 0x00, 0x00],
            is_fam: false,
        };
        let message = reply.to_esp2();
        assert_eq!(
            message.body(),
            &[0x8B, 0xF0, 5, 1, 0x7F, 0x08, 0x04, 0x01, 0x00, 0x00, 0x00]
        );
        assert_eq!(EltakoDiscoveryReply::from_esp2(&message).unwrap(), reply);
        assert_eq!(
            reply.to_string(),
            "<EltakoDiscoveryReply address 5 size 1, model 04 01 00 00>"
        );
    }

    #[test]
    fn test_discovery_reply_fixed_byte() {
        let message =
            EltakoMessage::with_payload(ORG_DISCOVERY, 0, [1, 1, 0x7F, 0x04, 0, 0, 0, 0], false);
        assert!(EltakoDiscoveryReply::from_esp2(&message.to_esp2()).is_err());
    }

    #[test]
    fn test_memory_request_and_response() {
        let request = EltakoMemoryRequest { address: 7, row: 12 };
        let message = request.to_esp2();
        assert_eq!(message.body()[9], 12);
        assert_eq!(message.body()[10], 7);
        assert_eq!(EltakoMemoryRequest::from_esp2(&message).unwrap(), request);

        let response = EltakoMemoryResponse {
            row: 12,
            value: [1, 2, 3, 4, 5, 6, 7, 8],
        };
        let parsed = EltakoMemoryResponse::from_esp2(&response.to_esp2()).unwrap();
        assert_eq!(parsed, response);
        assert!(EltakoMemoryResponse::from_esp2(&message).is_err());
    }

    #[test]
    fn test_discovery_reply_is_not_memory_response() {
        let reply = EltakoDiscoveryReply {
            reported_address: 5,
            reported_size: 1,
            memory_size: 0x7F,
            model: [0x04, 0x01, 0x00, 0x00],
            is_fam: false,
        };
        assert_eq!(
            EltakoMemoryResponse::from_esp2(&reply.to_esp2()),
            Err(ParseError::Mismatch("EltakoMemoryResponse"))
        );
    }

    // ========================================================================
    // Wrapped events
    // ========================================================================

    #[test]
    fn test_wrapped_rps_layout() {
        let wrapped = EltakoWrappedRps {
            address: [0x00, 0x00, 0x10, 0x01],
            status: 0x30,
            data: 0x70,
        };
        let message = wrapped.to_esp2();
        assert_eq!(
            message.body(),
            &[0x8B, 0x05, 0x70, 0, 0, 0, 0x00, 0x00, 0x10, 0x01, 0x30]
        );
        assert_eq!(EltakoWrappedRps::from_esp2(&message).unwrap(), wrapped);
    }

    #[test]
    fn test_wrapped_4bs_layout() {
        let wrapped = EltakoWrapped4bs {
            address: [0xFF, 0xAA, 0x00, 0x01],
            status: 0x00,
            data: [0x01, 0x02, 0x03, 0x08],
        };
        let message = wrapped.to_esp2();
        assert_eq!(message.org(), 0x07);
        assert_eq!(EltakoWrapped4bs::from_esp2(&message).unwrap(), wrapped);
        assert!(EltakoWrappedRps::from_esp2(&message).is_err());
    }
}
