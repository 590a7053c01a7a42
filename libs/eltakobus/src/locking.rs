//! Locking Protocol
//!
//! Locking the bus makes the coordinator (FAM) stop polling and the passive
//! senders go quiet, so memory can be read and written without interference.
//!
//! While a lock is being established nothing else should drain the
//! unsolicited queue: the discovery requests on it tell whether the
//! coordinator is still making progress through its scan.

use std::fmt;

use tracing::{debug, info};

use crate::bus::{BusExt, BusInterface, ReceivedQueue};
use crate::config::LockConfig;
use crate::error::{BusError, Result};
use crate::message::{
    EltakoBusLock, EltakoBusUnlock, EltakoDiscoveryReply, EltakoDiscoveryRequest, Esp2Message, Message,
};

/// Outcome of [`lock_bus`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    /// A coordinator acknowledged the lock
    Locked,
    /// Nobody acknowledged; most likely there is no coordinator on the bus
    ProbablyLocked,
}

impl LockStatus {
    pub fn is_confirmed(self) -> bool {
        self == LockStatus::Locked
    }
}

impl fmt::Display for LockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockStatus::Locked => write!(f, "Bus was successfully locked as acknowledged by a FAM"),
            LockStatus::ProbablyLocked => write!(
                f,
                "No response to lock requests, assuming that no FAM is present on the bus"
            ),
        }
    }
}

/// Outcome of [`unlock_bus`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockStatus {
    Unlocked,
    /// No acknowledgment; no coordinator, or the bus was not locked
    ProbablyUnlocked,
}

impl UnlockStatus {
    pub fn is_confirmed(self) -> bool {
        self == UnlockStatus::Unlocked
    }
}

impl fmt::Display for UnlockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnlockStatus::Unlocked => {
                write!(f, "Bus was successfully unlocked as acknowledged by a FAM")
            },
            UnlockStatus::ProbablyUnlocked => write!(
                f,
                "No response to unlock, assuming that no FAM is present on the bus or the bus was not locked before"
            ),
        }
    }
}

/// Highest discovery request address the coordinator has scanned so far
#[derive(Debug, Default)]
struct ScanProgress {
    largest: Option<u8>,
}

impl ScanProgress {
    /// Track a telegram seen on the line; fails if the scan went backwards
    fn observe(&mut self, message: &Esp2Message) -> Result<()> {
        let Ok(request) = EltakoDiscoveryRequest::from_esp2(message) else {
            return Ok(());
        };

        if let Some(largest) = self.largest {
            if request.address < largest {
                return Err(BusError::BadCoordinatorScanMode {
                    largest,
                    observed: request.address,
                });
            }
        }
        self.largest = Some(request.address);
        Ok(())
    }
}

/// Lock the bus
///
/// Each attempt drains the unsolicited queue, then sends a lock request. As
/// long as the coordinator keeps scanning to higher addresses, unanswered
/// requests do not use up attempts.
pub async fn lock_bus<B>(bus: &B, config: &LockConfig) -> Result<LockStatus>
where
    B: BusInterface + ReceivedQueue + ?Sized,
{
    let mut progress = ScanProgress::default();

    for attempt in 1..=config.attempts {
        loop {
            let largest_before = progress.largest;

            while let Some(message) = bus.try_recv() {
                progress.observe(&message)?;
            }

            match bus.exchange::<EltakoDiscoveryReply, _>(&EltakoBusLock).await {
                Ok(reply) if reply.is_fam => {
                    info!(attempt, "Bus locked");
                    return Ok(LockStatus::Locked);
                },
                Ok(reply) => {
                    debug!(attempt, %reply, "Lock answered by a device that is not the FAM");
                },
                Err(BusError::Timeout(_)) => {
                    // give the coordinator time to make progress
                    tokio::time::sleep(config.backoff()).await;
                },
                Err(BusError::Parse(err)) => {
                    debug!(attempt, error = %err, "Unexpected answer to lock request");
                },
                Err(err) => return Err(err),
            }

            if progress.largest == largest_before {
                break;
            }
            debug!(largest = ?progress.largest, "Coordinator still scanning, retrying lock");
        }
    }

    info!(attempts = config.attempts, "No FAM answered the lock request");
    Ok(LockStatus::ProbablyLocked)
}

/// Unlock the bus
pub async fn unlock_bus<B>(bus: &B, config: &LockConfig) -> Result<UnlockStatus>
where
    B: BusInterface + ?Sized,
{
    for attempt in 1..=config.unlock_attempts {
        match bus.exchange::<EltakoDiscoveryReply, _>(&EltakoBusUnlock).await {
            Ok(reply) if reply.is_fam => {
                info!(attempt, "Bus unlocked");
                return Ok(UnlockStatus::Unlocked);
            },
            Ok(reply) => {
                debug!(attempt, %reply, "Unlock answered by a device that is not the FAM");
            },
            Err(BusError::Timeout(_)) | Err(BusError::Parse(_)) => {},
            Err(err) => return Err(err),
        }
        tokio::time::sleep(config.unlock_backoff()).await;
    }

    info!(attempts = config.unlock_attempts, "No FAM answered the unlock request");
    Ok(UnlockStatus::ProbablyUnlocked)
}
