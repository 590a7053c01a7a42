//! Bus Interface Contract
//!
//! Every transport and decorator implements [`BusInterface`]: one raw
//! request/reply primitive plus the bulk memory read built on it. Typed
//! exchanges live in [`BusExt`], which every bus gets for free.
//!
//! Unsolicited traffic (events, coordinator polling seen on the line) is
//! drained through [`ReceivedQueue`], kept separate so decorators can forward
//! it untouched.

use std::any::TypeId;
use std::fmt;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{BusError, ParseError, Result};
use crate::message::{
    prettify, EltakoMemoryRequest, EltakoMemoryResponse, EltakoMessage, EltakoMemoryWrite,
    EltakoTimeout, EltakoWriteSelect, Esp2Message, Message, Telegram, ORG_MEMORY_WRITE,
    ORG_WRITE_SELECT,
};

/// Highest row read when the memory size of a device is not known
pub const DEFAULT_MEMORY_SIZE: u8 = 255;

/// Which inbound telegram a pending exchange waits for
///
/// A telegram resolves the exchange when the expected kind parses from it or
/// when it is a timeout indication.
#[derive(Clone, Copy)]
pub struct Expect {
    name: &'static str,
    accepts: fn(&Esp2Message) -> bool,
    expiry_is_reply: bool,
}

fn accepts_any(_: &Esp2Message) -> bool {
    true
}

fn accepts_kind<M: Message>(message: &Esp2Message) -> bool {
    M::from_esp2(message).is_ok()
}

impl Expect {
    /// First telegram after the request, whatever it is
    pub const ANY: Expect = Expect {
        name: "any telegram",
        accepts: accepts_any,
        expiry_is_reply: false,
    };

    pub fn kind<M: Message + 'static>() -> Self {
        Self {
            name: M::NAME,
            accepts: accepts_kind::<M>,
            expiry_is_reply: TypeId::of::<M>() == TypeId::of::<EltakoTimeout>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn accepts(&self, message: &Esp2Message) -> bool {
        (self.accepts)(message)
    }

    /// Whether `message` ends the pending exchange
    pub fn resolves(&self, message: &Esp2Message) -> bool {
        self.accepts(message) || EltakoTimeout::from_esp2(message).is_ok()
    }

    /// Waiting for a timeout indication, so silence is the answer
    pub fn expiry_is_reply(&self) -> bool {
        self.expiry_is_reply
    }
}

impl fmt::Debug for Expect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Expect").field("name", &self.name).finish()
    }
}

/// Outcome of interpreting a reply as kind `M`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyClass<M> {
    Reply(M),
    /// The device answered, but only to say it has nothing to say
    TimeoutIndication,
    /// Neither `M` nor a timeout indication; carries why `M` did not parse
    Unrecognized(ParseError),
}

/// Interpret `reply` as `M`, falling back to recognizing a timeout indication
pub fn classify<M: Message>(reply: &Esp2Message) -> ReplyClass<M> {
    match M::from_esp2(reply) {
        Ok(parsed) => ReplyClass::Reply(parsed),
        Err(err) => {
            if EltakoTimeout::from_esp2(reply).is_ok() {
                ReplyClass::TimeoutIndication
            } else {
                ReplyClass::Unrecognized(err)
            }
        },
    }
}

/// Request/reply access to the bus
#[async_trait]
pub trait BusInterface: Send + Sync {
    /// Send `request` and return the first inbound telegram `expect` resolves on
    ///
    /// Fails with [`BusError::Timeout`] when nothing resolving arrives in
    /// time, unless `expect` waits for a timeout indication, in which case
    /// one is synthesized.
    async fn base_exchange(&self, request: &Esp2Message, expect: Expect) -> Result<Esp2Message>;

    /// Send without caring about the reply
    async fn send(&self, request: &Esp2Message) -> Result<()> {
        self.base_exchange(request, Expect::ANY).await.map(|_| ())
    }

    /// Read rows `0..=memory_size` of the device at `address`
    async fn read_mem(&self, address: u8, memory_size: Option<u8>) -> Result<Vec<[u8; 8]>> {
        let last_row = memory_size.unwrap_or(DEFAULT_MEMORY_SIZE);
        let mut rows = Vec::with_capacity(usize::from(last_row) + 1);

        for row in 0..=last_row {
            let response: EltakoMemoryResponse =
                self.exchange(&EltakoMemoryRequest { address, row }).await?;
            if response.row != row {
                return Err(ParseError::RowMismatch {
                    requested: row,
                    returned: response.row,
                }
                .into());
            }
            rows.push(response.value);
        }

        debug!(address, rows = rows.len(), "Read device memory");
        Ok(rows)
    }
}

/// Typed exchanges on top of [`BusInterface::base_exchange`]
#[async_trait]
pub trait BusExt: BusInterface {
    /// Send `request` and parse the reply as `M`
    ///
    /// A timeout indication instead of `M` is reported as
    /// [`BusError::Timeout`], anything else as [`BusError::Parse`].
    async fn exchange<M, R>(&self, request: &R) -> Result<M>
    where
        M: Message + Send + 'static,
        R: Message + Sync,
    {
        let reply = self
            .base_exchange(&request.to_esp2(), Expect::kind::<M>())
            .await?;

        match classify::<M>(&reply) {
            ReplyClass::Reply(parsed) => Ok(parsed),
            ReplyClass::TimeoutIndication => Err(BusError::timeout(format!(
                "device answered {} with a timeout telegram",
                R::NAME
            ))),
            ReplyClass::Unrecognized(err) => Err(err.into()),
        }
    }

    /// Send `request` and return the prettified first reply
    async fn exchange_any<R>(&self, request: &R) -> Result<Telegram>
    where
        R: Message + Sync,
    {
        let reply = self.base_exchange(&request.to_esp2(), Expect::ANY).await?;
        Ok(prettify(&reply))
    }

    /// Write one memory row: select the device, then write the row
    ///
    /// Each step must be acknowledged with its own ORG; anything else aborts
    /// the write without retry.
    async fn write_mem_line(&self, address: u8, row: u8, value: [u8; 8]) -> Result<()> {
        let selected: EltakoMessage = self.exchange(&EltakoWriteSelect { address }).await?;
        if selected.org != ORG_WRITE_SELECT {
            return Err(BusError::write(format!(
                "Device selection failed; expected 0x{ORG_WRITE_SELECT:02X}, got {selected}"
            )));
        }

        let written: EltakoMessage = self.exchange(&EltakoMemoryWrite { row, value }).await?;
        if written.org != ORG_MEMORY_WRITE {
            return Err(BusError::write(format!(
                "Write failed; expected 0x{ORG_MEMORY_WRITE:02X}, got {written}"
            )));
        }

        debug!(address, row, "Wrote memory row");
        Ok(())
    }
}

impl<B: BusInterface + ?Sized> BusExt for B {}

/// Stream of telegrams that did not answer any exchange
///
/// Telegrams come out in bus arrival order.
#[async_trait]
pub trait ReceivedQueue: Send + Sync {
    /// Next buffered telegram, without waiting
    fn try_recv(&self) -> Option<Esp2Message>;

    /// Wait for the next telegram; `None` once the line is gone
    async fn recv(&self) -> Option<Esp2Message>;
}

#[async_trait]
impl<B: BusInterface + ?Sized> BusInterface for std::sync::Arc<B> {
    async fn base_exchange(&self, request: &Esp2Message, expect: Expect) -> Result<Esp2Message> {
        (**self).base_exchange(request, expect).await
    }

    async fn send(&self, request: &Esp2Message) -> Result<()> {
        (**self).send(request).await
    }

    async fn read_mem(&self, address: u8, memory_size: Option<u8>) -> Result<Vec<[u8; 8]>> {
        (**self).read_mem(address, memory_size).await
    }
}

#[async_trait]
impl<Q: ReceivedQueue + ?Sized> ReceivedQueue for std::sync::Arc<Q> {
    fn try_recv(&self) -> Option<Esp2Message> {
        (**self).try_recv()
    }

    async fn recv(&self) -> Option<Esp2Message> {
        (**self).recv().await
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::message::{
        EltakoBusLock, EltakoDiscoveryReply, EltakoDiscoveryRequest, RpsMessage, ORG_MEMORY_READ,
    };
    use crate::mock::{MockBus, MockReply};

    fn memory_responder(address: u8) -> MockBus {
        MockBus::new(move |request, _| match EltakoMemoryRequest::from_esp2(request) {
            Ok(req) if req.address == address => MockReply::reply(&EltakoMemoryResponse {
                row: req.row,
                value: [req.row; 8],
            }),
            _ => MockReply::Silence,
        })
    }

    // ========================================================================
    // Classification
    // ========================================================================

    #[test]
    fn test_classify_reply() {
        let reply = EltakoMemoryResponse {
            row: 3,
            value: [9; 8],
        };
        assert_eq!(
            classify::<EltakoMemoryResponse>(&reply.to_esp2()),
            ReplyClass::Reply(reply)
        );
    }

    #[test]
    fn test_classify_timeout_indication() {
        assert_eq!(
            classify::<EltakoMemoryResponse>(&EltakoTimeout.to_esp2()),
            ReplyClass::TimeoutIndication
        );
        // the timeout indication itself is a regular reply when asked for
        assert_eq!(
            classify::<EltakoTimeout>(&EltakoTimeout.to_esp2()),
            ReplyClass::Reply(EltakoTimeout)
        );
    }

    #[test]
    fn test_classify_unrecognized_keeps_cause() {
        let reply = EltakoDiscoveryReply {
            reported_address: 5,
            reported_size: 1,
            memory_size: 0x7F,
            model: [0x04, 0x01, 0x00, 0x00],
            is_fam: false,
        };
        assert_eq!(
            classify::<EltakoMemoryResponse>(&reply.to_esp2()),
            ReplyClass::Unrecognized(ParseError::Mismatch("EltakoMemoryResponse"))
        );
    }

    #[test]
    fn test_expect_resolution() {
        let expect = Expect::kind::<EltakoDiscoveryReply>();
        assert_eq!(expect.name(), "EltakoDiscoveryReply");
        assert!(!expect.expiry_is_reply());
        assert!(expect.resolves(&EltakoTimeout.to_esp2()));
        assert!(!expect.resolves(&EltakoDiscoveryRequest { address: 1 }.to_esp2()));

        let rps = RpsMessage {
            address: [0, 0, 0, 1],
            status: 0x30,
            data: 0x70,
            outgoing: false,
        };
        assert!(Expect::ANY.resolves(&rps.to_esp2()));
        assert!(Expect::kind::<EltakoTimeout>().expiry_is_reply());
    }

    // ========================================================================
    // Typed exchanges
    // ========================================================================

    #[tokio::test]
    async fn test_exchange_typed_reply() {
        let bus = memory_responder(4);
        let response: EltakoMemoryResponse = bus
            .exchange(&EltakoMemoryRequest { address: 4, row: 2 })
            .await
            .unwrap();
        assert_eq!(response.value, [2; 8]);
    }

    #[tokio::test]
    async fn test_exchange_timeout_indication_is_timeout() {
        let bus = MockBus::new(|_, _| MockReply::reply(&EltakoTimeout));
        let result: Result<EltakoMemoryResponse> = bus
            .exchange(&EltakoMemoryRequest { address: 4, row: 2 })
            .await;
        assert!(matches!(result, Err(BusError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_exchange_unrecognized_is_parse_error() {
        let bus = MockBus::new(|_, _| {
            MockReply::reply(&EltakoDiscoveryReply {
                reported_address: 5,
                reported_size: 1,
                memory_size: 0x7F,
                model: [0x04, 0x01, 0x00, 0x00],
                is_fam: false,
            })
        })
        .passthrough();

        let result: Result<EltakoMemoryResponse> = bus
            .exchange(&EltakoMemoryRequest { address: 4, row: 2 })
            .await;
        assert!(matches!(
            result,
            Err(BusError::Parse(ParseError::Mismatch("EltakoMemoryResponse")))
        ));
    }

    #[tokio::test]
    async fn test_exchange_any_prettifies() {
        let bus = MockBus::new(|_, _| MockReply::reply(&EltakoTimeout));
        let reply = bus.exchange_any(&EltakoBusLock).await.unwrap();
        assert_eq!(reply, Telegram::Timeout(EltakoTimeout));
    }

    // ========================================================================
    // Memory access
    // ========================================================================

    #[tokio::test]
    async fn test_read_mem_reads_inclusive_range() {
        let bus = memory_responder(9);
        let rows = bus.read_mem(9, Some(3)).await.unwrap();
        assert_eq!(rows, vec![[0; 8], [1; 8], [2; 8], [3; 8]]);
        assert_eq!(bus.sent().len(), 4);
    }

    #[tokio::test]
    async fn test_read_mem_default_size() {
        let bus = memory_responder(9);
        let rows = bus.read_mem(9, None).await.unwrap();
        assert_eq!(rows.len(), 256);
        assert_eq!(rows[255], [255; 8]);
    }

    #[tokio::test]
    async fn test_read_mem_rejects_wrong_row() {
        let bus = MockBus::new(|_, _| {
            MockReply::reply(&EltakoMemoryResponse {
                row: 7,
                value: [0; 8],
            })
        });
        let result = bus.read_mem(1, Some(2)).await;
        assert!(matches!(
            result,
            Err(BusError::Parse(ParseError::RowMismatch {
                requested: 0,
                returned: 7
            }))
        ));
    }

    #[tokio::test]
    async fn test_write_mem_line_sequence() {
        let bus = MockBus::new(|request, _| {
            let envelope = EltakoMessage::from_esp2(request).unwrap();
            MockReply::reply(&EltakoMessage::with_payload(
                envelope.org,
                0,
                [0; 8],
                false,
            ))
        });

        bus.write_mem_line(5, 12, [1, 2, 3, 4, 5, 6, 7, 8])
            .await
            .unwrap();

        let sent = bus.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(
            EltakoWriteSelect::from_esp2(&sent[0]).unwrap(),
            EltakoWriteSelect { address: 5 }
        );
        assert_eq!(
            EltakoMemoryWrite::from_esp2(&sent[1]).unwrap(),
            EltakoMemoryWrite {
                row: 12,
                value: [1, 2, 3, 4, 5, 6, 7, 8]
            }
        );
    }

    #[tokio::test]
    async fn test_write_mem_line_rejects_wrong_ack() {
        let bus = MockBus::new(|_, _| {
            MockReply::reply(&EltakoMessage::with_payload(
                ORG_MEMORY_READ,
                0,
                [0; 8],
                false,
            ))
        });

        let result = bus.write_mem_line(5, 0, [0; 8]).await;
        assert!(matches!(result, Err(BusError::Write(_))));
        assert_eq!(bus.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_write_mem_line_timeout_telegram_is_write_error() {
        let bus = MockBus::new(|_, _| MockReply::reply(&EltakoTimeout));
        let result = bus.write_mem_line(5, 0, [0; 8]).await;
        assert!(matches!(result, Err(BusError::Write(_))));
    }
}
