//! Response Cache
//!
//! [`BusCache`] wraps any bus and memoizes discovery and memory reads, but
//! only once a coordinator has confirmed a bus lock: before that, traffic is
//! too volatile to remember. Storage is pluggable through [`CacheStorage`].
//!
//! Once locked, lock and unlock requests are answered from the remembered
//! coordinator reply (the coordinator answers both the same way), and a
//! write selection drops everything cached about the selected device's
//! memory before it is forwarded. [`BusCache::release`] is the way to really
//! unlock the bus again.

mod readahead;
mod storage;

pub use readahead::Readahead;
pub use storage::{CacheKey, CacheStorage, CacheValue, FileStorage, MemoryStorage};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::bus::{BusInterface, Expect, ReceivedQueue};
use crate::config::LockConfig;
use crate::error::{BusError, Result};
use crate::locking::{unlock_bus, UnlockStatus};
use crate::message::{
    EltakoBusLock, EltakoBusUnlock, EltakoDiscoveryReply, EltakoDiscoveryRequest,
    EltakoMemoryRequest, EltakoTimeout, EltakoWriteSelect, Esp2Message, Message,
};

/// How the cache treats one request
#[derive(Debug, PartialEq, Eq)]
enum Intercept {
    LockOrUnlock,
    WriteSelect(u8),
    Cacheable(CacheKey),
    Forward,
}

impl Intercept {
    fn of(request: &Esp2Message) -> Self {
        if EltakoBusLock::from_esp2(request).is_ok() || EltakoBusUnlock::from_esp2(request).is_ok()
        {
            Intercept::LockOrUnlock
        } else if let Ok(select) = EltakoWriteSelect::from_esp2(request) {
            Intercept::WriteSelect(select.address)
        } else if let Ok(discover) = EltakoDiscoveryRequest::from_esp2(request) {
            Intercept::Cacheable(CacheKey::Discover {
                address: discover.address,
            })
        } else if let Ok(read) = EltakoMemoryRequest::from_esp2(request) {
            Intercept::Cacheable(CacheKey::Read {
                address: read.address,
                row: read.row,
            })
        } else {
            Intercept::Forward
        }
    }
}

struct CacheState<S> {
    storage: S,
    locked: bool,
}

/// Caching decorator over a bus
pub struct BusCache<B, S = MemoryStorage> {
    inner: B,
    state: Mutex<CacheState<S>>,
}

impl<B> BusCache<B, MemoryStorage> {
    pub fn new(inner: B) -> Self {
        Self::with_storage(inner, MemoryStorage::new())
    }
}

impl<B, S: CacheStorage> BusCache<B, S> {
    pub fn with_storage(inner: B, storage: S) -> Self {
        Self {
            inner,
            state: Mutex::new(CacheState {
                storage,
                locked: false,
            }),
        }
    }

    /// Whether a coordinator-confirmed lock has been seen
    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.state.lock().storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    pub fn into_inner(self) -> B {
        self.inner
    }

    fn cached(&self, key: &CacheKey) -> Option<CacheValue> {
        self.state.lock().storage.get(key)
    }

    fn store(&self, key: CacheKey, value: CacheValue) -> Result<()> {
        self.state.lock().storage.insert(key, value)
    }

    fn evict_memory_of(&self, address: u8) -> Result<()> {
        let removed = self
            .state
            .lock()
            .storage
            .remove_where(&|key| key.is_memory_of(address))?;
        if removed > 0 {
            debug!(address, removed, "Evicted cached memory before write");
        }
        Ok(())
    }

    /// Activate caching if `reply` confirms a lock by the coordinator
    fn observe_lock_reply(&self, reply: &Esp2Message) -> Result<()> {
        let confirmed = EltakoDiscoveryReply::from_esp2(reply).is_ok_and(|reply| reply.is_fam);
        if !confirmed {
            return Ok(());
        }

        let mut state = self.state.lock();
        state
            .storage
            .insert(CacheKey::CoordinatorReply, CacheValue::Reply(*reply))?;
        state.locked = true;
        info!("Bus lock confirmed by FAM, response cache active");
        Ok(())
    }
}

impl<B: BusInterface, S: CacheStorage> BusCache<B, S> {
    /// Unlock the bus for real and leave the locked phase
    ///
    /// Unlock requests exchanged through the cache while locked are answered
    /// from memory and never reach the line; this one always does. Cached
    /// entries are kept for the next lock.
    pub async fn release(&self, config: &LockConfig) -> Result<UnlockStatus> {
        self.state.lock().locked = false;
        unlock_bus(&self.inner, config).await
    }
}

#[async_trait]
impl<B, S> BusInterface for BusCache<B, S>
where
    B: BusInterface,
    S: CacheStorage,
{
    async fn base_exchange(&self, request: &Esp2Message, expect: Expect) -> Result<Esp2Message> {
        let intercept = Intercept::of(request);

        if let Intercept::WriteSelect(address) = intercept {
            self.evict_memory_of(address)?;
        }

        if !self.is_locked() {
            let reply = self.inner.base_exchange(request, expect).await?;
            if let Intercept::LockOrUnlock = intercept {
                if EltakoBusLock::from_esp2(request).is_ok() {
                    self.observe_lock_reply(&reply)?;
                }
            }
            return Ok(reply);
        }

        let key = match intercept {
            Intercept::LockOrUnlock => {
                if let Some(CacheValue::Reply(reply)) = self.cached(&CacheKey::CoordinatorReply) {
                    trace!("Answering lock request from cache");
                    return Ok(reply);
                }
                return self.inner.base_exchange(request, expect).await;
            },
            Intercept::Cacheable(key) => key,
            Intercept::WriteSelect(_) | Intercept::Forward => {
                return self.inner.base_exchange(request, expect).await;
            },
        };

        if let Some(CacheValue::Reply(reply)) = self.cached(&key) {
            trace!(?key, "Cache hit");
            return Ok(reply);
        }

        let reply = match self.inner.base_exchange(request, expect).await {
            Ok(reply) => reply,
            Err(BusError::Timeout(_)) => EltakoTimeout.to_esp2(),
            Err(err) => return Err(err),
        };
        self.store(key, CacheValue::Reply(reply))?;
        Ok(reply)
    }

    async fn send(&self, request: &Esp2Message) -> Result<()> {
        if let Intercept::WriteSelect(address) = Intercept::of(request) {
            self.evict_memory_of(address)?;
        }
        self.inner.send(request).await
    }

    async fn read_mem(&self, address: u8, memory_size: Option<u8>) -> Result<Vec<[u8; 8]>> {
        if !self.is_locked() {
            return self.inner.read_mem(address, memory_size).await;
        }

        let key = CacheKey::Memory { address };
        if let Some(CacheValue::Memory(rows)) = self.cached(&key) {
            trace!(address, "Memory served from cache");
            return Ok(leading_rows(rows, memory_size));
        }

        // the entry always holds the whole memory, whatever the caller asked for
        let rows = self.inner.read_mem(address, None).await?;
        self.store(key, CacheValue::Memory(rows.clone()))?;
        Ok(leading_rows(rows, memory_size))
    }
}

/// Rows `0..=memory_size` of a whole-memory read
fn leading_rows(mut rows: Vec<[u8; 8]>, memory_size: Option<u8>) -> Vec<[u8; 8]> {
    if let Some(last_row) = memory_size {
        rows.truncate(usize::from(last_row) + 1);
    }
    rows
}

#[async_trait]
impl<B, S> ReceivedQueue for BusCache<B, S>
where
    B: ReceivedQueue,
    S: CacheStorage,
{
    fn try_recv(&self) -> Option<Esp2Message> {
        self.inner.try_recv()
    }

    async fn recv(&self) -> Option<Esp2Message> {
        self.inner.recv().await
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::bus::BusExt;
    use crate::message::EltakoMemoryResponse;
    use crate::mock::{MockBus, MockReply};

    fn fam_reply() -> EltakoDiscoveryReply {
        EltakoDiscoveryReply {
            reported_address: 0,
            reported_size: 1,
            memory_size: 0xFF,
            model: [0x07, 0xFF, 0x00, 0x00],
            is_fam: true,
        }
    }

    /// FAM acknowledges locks and unlocks, device 5 answers memory reads with its row number
    fn bus_with_fam() -> MockBus {
        MockBus::new(|request, _| {
            if Intercept::of(request) == Intercept::LockOrUnlock {
                return MockReply::reply(&fam_reply());
            }
            match EltakoMemoryRequest::from_esp2(request) {
                Ok(read) if read.address == 5 => MockReply::reply(&EltakoMemoryResponse {
                    row: read.row,
                    value: [read.row; 8],
                }),
                _ => MockReply::Silence,
            }
        })
    }

    async fn locked_cache() -> BusCache<MockBus> {
        let cache = BusCache::new(bus_with_fam());
        let reply: EltakoDiscoveryReply = cache.exchange(&EltakoBusLock).await.unwrap();
        assert!(reply.is_fam);
        assert!(cache.is_locked());
        cache
    }

    // ========================================================================
    // Activation
    // ========================================================================

    #[tokio::test]
    async fn test_unlocked_passes_through() {
        let cache = BusCache::new(bus_with_fam());
        for _ in 0..2 {
            let _: EltakoMemoryResponse = cache
                .exchange(&EltakoMemoryRequest { address: 5, row: 1 })
                .await
                .unwrap();
        }
        assert_eq!(cache.inner().sent().len(), 2);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_non_fam_reply_does_not_activate() {
        let bus = MockBus::new(|_, _| {
            MockReply::reply(&EltakoDiscoveryReply {
                is_fam: false,
                ..fam_reply()
            })
        });
        let cache = BusCache::new(bus);
        let _: EltakoDiscoveryReply = cache.exchange(&EltakoBusLock).await.unwrap();
        assert!(!cache.is_locked());
    }

    #[tokio::test]
    async fn test_repeated_lock_and_unlock_served_from_cache() {
        let cache = locked_cache().await;

        let again: EltakoDiscoveryReply = cache.exchange(&EltakoBusLock).await.unwrap();
        let unlock: EltakoDiscoveryReply = cache.exchange(&EltakoBusUnlock).await.unwrap();
        assert_eq!(again, fam_reply());
        assert_eq!(unlock, fam_reply());
        assert_eq!(cache.inner().sent().len(), 1);
    }

    // ========================================================================
    // Memoization
    // ========================================================================

    #[tokio::test]
    async fn test_identical_reads_hit_bus_once() {
        let cache = locked_cache().await;
        let request = EltakoMemoryRequest { address: 5, row: 3 };

        let first: EltakoMemoryResponse = cache.exchange(&request).await.unwrap();
        let second: EltakoMemoryResponse = cache.exchange(&request).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.value, [3; 8]);
        assert_eq!(cache.inner().sent().len(), 2);
    }

    #[tokio::test]
    async fn test_write_select_evicts_device_memory() {
        let cache = locked_cache().await;
        let request = EltakoMemoryRequest { address: 5, row: 3 };
        let _: EltakoMemoryResponse = cache.exchange(&request).await.unwrap();
        let _ = cache.read_mem(5, Some(1)).await.unwrap();
        let sent_before = cache.inner().sent().len();

        cache
            .send(&EltakoWriteSelect { address: 5 }.to_esp2())
            .await
            .unwrap();
        assert!(cache.cached(&CacheKey::Memory { address: 5 }).is_none());

        let _: EltakoMemoryResponse = cache.exchange(&request).await.unwrap();
        // write select plus a fresh read
        assert_eq!(cache.inner().sent().len(), sent_before + 2);
    }

    #[tokio::test]
    async fn test_write_select_keeps_other_devices() {
        let cache = locked_cache().await;
        cache
            .store(
                CacheKey::Read { address: 6, row: 0 },
                CacheValue::Reply(EltakoTimeout.to_esp2()),
            )
            .unwrap();

        cache
            .send(&EltakoWriteSelect { address: 5 }.to_esp2())
            .await
            .unwrap();
        assert!(cache.cached(&CacheKey::Read { address: 6, row: 0 }).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_recorded_as_value() {
        let cache = locked_cache().await;
        let request = EltakoMemoryRequest { address: 9, row: 0 };

        for _ in 0..2 {
            let result: Result<EltakoMemoryResponse> = cache.exchange(&request).await;
            assert!(matches!(result, Err(BusError::Timeout(_))));
        }
        assert_eq!(cache.inner().sent().len(), 2);
        assert_eq!(
            cache.cached(&CacheKey::Read { address: 9, row: 0 }),
            Some(CacheValue::Reply(EltakoTimeout.to_esp2()))
        );
    }

    #[tokio::test]
    async fn test_read_mem_cached_while_locked() {
        let cache = locked_cache().await;

        let first = cache.read_mem(5, Some(3)).await.unwrap();
        let second = cache.read_mem(5, Some(3)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, vec![[0; 8], [1; 8], [2; 8], [3; 8]]);
        // lock + the whole memory, once
        assert_eq!(cache.inner().sent().len(), 257);
    }

    #[tokio::test]
    async fn test_short_read_does_not_truncate_later_full_read() {
        let cache = locked_cache().await;

        let short = cache.read_mem(5, Some(1)).await.unwrap();
        assert_eq!(short.len(), 2);

        let full = cache.read_mem(5, None).await.unwrap();
        assert_eq!(full.len(), 256);
        assert_eq!(full[255], [255; 8]);
        assert_eq!(cache.inner().sent().len(), 257);
    }

    #[tokio::test]
    async fn test_read_mem_unlocked_honours_size() {
        let cache = BusCache::new(bus_with_fam());
        let rows = cache.read_mem(5, Some(1)).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(cache.inner().sent().len(), 2);
        assert!(cache.is_empty());
    }

    // ========================================================================
    // Release
    // ========================================================================

    #[tokio::test]
    async fn test_release_sends_unlock_and_deactivates() {
        let cache = locked_cache().await;

        let status = cache.release(&LockConfig::default()).await.unwrap();
        assert_eq!(status, UnlockStatus::Unlocked);
        assert!(!cache.is_locked());

        let sent = cache.inner().sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(EltakoBusUnlock::from_esp2(&sent[1]), Ok(EltakoBusUnlock));

        // traffic passes through again until the next confirmed lock
        let _: EltakoMemoryResponse = cache
            .exchange(&EltakoMemoryRequest { address: 5, row: 0 })
            .await
            .unwrap();
        assert_eq!(cache.inner().sent().len(), 3);
    }
}
