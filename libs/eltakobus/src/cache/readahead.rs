//! Whole-memory readahead

use async_trait::async_trait;
use tracing::trace;

use crate::bus::{BusInterface, Expect, ReceivedQueue};
use crate::error::{BusError, Result};
use crate::message::{EltakoMemoryRequest, EltakoMemoryResponse, Esp2Message, Message};

/// Answers single-row memory reads by reading the device's whole memory
///
/// Only useful on top of a [`BusCache`](super::BusCache): the full read is
/// stored there, and every further row of that device is served from it.
pub struct Readahead<B> {
    inner: B,
}

impl<B> Readahead<B> {
    pub fn new(inner: B) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    pub fn into_inner(self) -> B {
        self.inner
    }
}

#[async_trait]
impl<B: BusInterface> BusInterface for Readahead<B> {
    async fn base_exchange(&self, request: &Esp2Message, expect: Expect) -> Result<Esp2Message> {
        let Ok(read) = EltakoMemoryRequest::from_esp2(request) else {
            return self.inner.base_exchange(request, expect).await;
        };

        let rows = self.inner.read_mem(read.address, None).await?;
        let value = rows.get(usize::from(read.row)).copied().ok_or_else(|| {
            BusError::timeout(format!(
                "device {} has no memory row {}",
                read.address, read.row
            ))
        })?;
        trace!(address = read.address, row = read.row, "Memory row served by readahead");

        Ok(EltakoMemoryResponse {
            row: read.row,
            value,
        }
        .to_esp2())
    }

    async fn send(&self, request: &Esp2Message) -> Result<()> {
        self.inner.send(request).await
    }

    async fn read_mem(&self, address: u8, memory_size: Option<u8>) -> Result<Vec<[u8; 8]>> {
        self.inner.read_mem(address, memory_size).await
    }
}

#[async_trait]
impl<B: ReceivedQueue> ReceivedQueue for Readahead<B> {
    fn try_recv(&self) -> Option<Esp2Message> {
        self.inner.try_recv()
    }

    async fn recv(&self) -> Option<Esp2Message> {
        self.inner.recv().await
    }
}
