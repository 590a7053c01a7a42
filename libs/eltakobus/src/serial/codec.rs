//! Frame reassembly over a byte stream

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::error::BusError;
use crate::message::{Esp2Message, TELEGRAM_LEN};

/// Splits a byte stream into telegrams
///
/// Whenever a full telegram worth of bytes is buffered, a parse is attempted
/// at offset 0. A failed parse drops exactly one byte, so the decoder
/// resynchronizes after any corruption or misalignment.
#[derive(Debug, Default)]
pub struct TelegramCodec {
    skipped: u64,
}

impl TelegramCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes dropped while resynchronizing
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

impl Decoder for TelegramCodec {
    type Item = Esp2Message;
    type Error = BusError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while src.len() >= TELEGRAM_LEN {
            match Esp2Message::parse(&src[..TELEGRAM_LEN]) {
                Ok(message) => {
                    src.advance(TELEGRAM_LEN);
                    return Ok(Some(message));
                },
                Err(err) => {
                    trace!(byte = src[0], error = %err, "Dropping byte to resynchronize");
                    src.advance(1);
                    self.skipped += 1;
                },
            }
        }

        src.reserve(TELEGRAM_LEN - src.len());
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None => {
                if !src.is_empty() {
                    trace!(remaining = src.len(), "Discarding partial telegram at end of stream");
                    self.skipped += src.len() as u64;
                    src.clear();
                }
                Ok(None)
            },
        }
    }
}

impl Encoder<Esp2Message> for TelegramCodec {
    type Error = BusError;

    fn encode(&mut self, item: Esp2Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item.serialize());
        Ok(())
    }
}
