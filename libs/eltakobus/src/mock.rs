//! Mock Bus for Testing
//!
//! A scripted [`BusInterface`] for exercising locking, caching and device
//! logic without a serial line. A responder closure decides what the "bus"
//! answers to each request and may queue unsolicited telegrams on the side.
//!
//! By default the mock filters replies the way the serial transport does: a
//! reply the pending exchange does not resolve on goes to the unsolicited
//! queue and the exchange times out. [`MockBus::passthrough`] hands every
//! reply to the caller as-is instead.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::bus::{BusInterface, Expect, ReceivedQueue};
use crate::error::{BusError, Result};
use crate::message::{hex_string, EltakoTimeout, Esp2Message, Message};

/// What the scripted bus answers to one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    Telegram(Esp2Message),
    /// Nobody answers; the exchange runs into its timeout
    Silence,
}

impl MockReply {
    pub fn reply<M: Message>(message: &M) -> Self {
        MockReply::Telegram(message.to_esp2())
    }
}

/// Side channel handed to the responder for queueing unsolicited telegrams
#[derive(Debug, Default)]
pub struct MockLine {
    queued: Vec<Esp2Message>,
}

impl MockLine {
    /// Telegram that shows up on the line before the reply
    pub fn unsolicited<M: Message>(&mut self, message: &M) {
        self.queued.push(message.to_esp2());
    }
}

type Responder = Box<dyn FnMut(&Esp2Message, &mut MockLine) -> MockReply + Send>;

struct MockState {
    responder: Responder,
    sent: Vec<Esp2Message>,
    received: VecDeque<Esp2Message>,
}

/// Scripted bus
pub struct MockBus {
    state: Mutex<MockState>,
    notify: Notify,
    timeout: Duration,
    passthrough: bool,
}

impl MockBus {
    pub fn new<F>(responder: F) -> Self
    where
        F: FnMut(&Esp2Message, &mut MockLine) -> MockReply + Send + 'static,
    {
        Self {
            state: Mutex::new(MockState {
                responder: Box::new(responder),
                sent: Vec::new(),
                received: VecDeque::new(),
            }),
            notify: Notify::new(),
            timeout: Duration::from_secs(1),
            passthrough: false,
        }
    }

    /// A bus on which nobody ever answers
    pub fn silent() -> Self {
        Self::new(|_, _| MockReply::Silence)
    }

    /// Time an unanswered exchange waits before failing
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Return every reply to the caller without transport-style filtering
    pub fn passthrough(mut self) -> Self {
        self.passthrough = true;
        self
    }

    /// Everything sent so far, oldest first
    pub fn sent(&self) -> Vec<Esp2Message> {
        self.state.lock().sent.clone()
    }

    pub fn push_unsolicited<M: Message>(&self, message: &M) {
        self.state.lock().received.push_back(message.to_esp2());
        self.notify.notify_one();
    }

    /// Record `request` and ask the responder about it
    fn respond(&self, request: &Esp2Message) -> MockReply {
        let mut line = MockLine::default();
        let mut state = self.state.lock();
        state.sent.push(*request);
        let reply = (state.responder)(request, &mut line);
        let queued = !line.queued.is_empty();
        state.received.extend(line.queued);
        drop(state);

        if queued {
            self.notify.notify_one();
        }
        debug!(hex_data = %hex_string(request.body()), direction = "send", "[Mock Bus] Telegram");
        reply
    }

    fn enqueue(&self, message: Esp2Message) {
        self.state.lock().received.push_back(message);
        self.notify.notify_one();
    }
}

#[async_trait]
impl BusInterface for MockBus {
    async fn base_exchange(&self, request: &Esp2Message, expect: Expect) -> Result<Esp2Message> {
        match self.respond(request) {
            MockReply::Telegram(reply) if self.passthrough || expect.resolves(&reply) => Ok(reply),
            MockReply::Telegram(reply) => {
                self.enqueue(reply);
                self.expire(expect).await
            },
            MockReply::Silence => self.expire(expect).await,
        }
    }

    async fn send(&self, request: &Esp2Message) -> Result<()> {
        if let MockReply::Telegram(reply) = self.respond(request) {
            self.enqueue(reply);
        }
        Ok(())
    }
}

impl MockBus {
    async fn expire(&self, expect: Expect) -> Result<Esp2Message> {
        tokio::time::sleep(self.timeout).await;
        if expect.expiry_is_reply() {
            Ok(EltakoTimeout.to_esp2())
        } else {
            Err(BusError::timeout(format!(
                "no {} within {:?}",
                expect.name(),
                self.timeout
            )))
        }
    }
}

#[async_trait]
impl ReceivedQueue for MockBus {
    fn try_recv(&self) -> Option<Esp2Message> {
        self.state.lock().received.pop_front()
    }

    async fn recv(&self) -> Option<Esp2Message> {
        loop {
            if let Some(message) = self.try_recv() {
                return Some(message);
            }
            self.notify.notified().await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::message::{EltakoDiscoveryRequest, EltakoPoll};

    #[tokio::test(start_paused = true)]
    async fn test_silence_times_out() {
        let bus = MockBus::silent();
        let result = bus
            .base_exchange(&EltakoPoll { address: 1 }.to_esp2(), Expect::ANY)
            .await;
        assert!(matches!(result, Err(BusError::Timeout(_))));
        assert_eq!(bus.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_is_timeout_reply_when_expected() {
        let bus = MockBus::silent();
        let reply = bus
            .base_exchange(
                &EltakoPoll { address: 1 }.to_esp2(),
                Expect::kind::<EltakoTimeout>(),
            )
            .await
            .unwrap();
        assert_eq!(reply, EltakoTimeout.to_esp2());
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_matching_reply_is_queued() {
        let bus = MockBus::new(|_, _| MockReply::reply(&EltakoDiscoveryRequest { address: 3 }));
        let result = bus
            .base_exchange(
                &EltakoPoll { address: 1 }.to_esp2(),
                Expect::kind::<EltakoTimeout>(),
            )
            .await;

        // silence after the unrelated telegram counts as the timeout reply
        assert_eq!(result.unwrap(), EltakoTimeout.to_esp2());
        assert_eq!(
            bus.try_recv(),
            Some(EltakoDiscoveryRequest { address: 3 }.to_esp2())
        );
        assert_eq!(bus.try_recv(), None);
    }

    #[tokio::test]
    async fn test_unsolicited_from_responder() {
        let bus = MockBus::new(|_, line| {
            line.unsolicited(&EltakoDiscoveryRequest { address: 7 });
            MockReply::reply(&EltakoTimeout)
        });
        bus.send(&EltakoPoll { address: 1 }.to_esp2()).await.unwrap();

        assert_eq!(
            bus.recv().await,
            Some(EltakoDiscoveryRequest { address: 7 }.to_esp2())
        );
        assert_eq!(bus.recv().await, Some(EltakoTimeout.to_esp2()));
    }
}
