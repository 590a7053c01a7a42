//! Eltako Bus Library
//!
//! Driver core for the Eltako RS485 bus, a wired variant of the EnOcean
//! Serial Protocol 2 used by the Series 14 DIN rail devices.
//!
//! # Architecture
//!
//! - **Telegram Codec** (`message`): 14-byte framing and per-kind parse/serialize
//! - **Bus Interface** (`bus`): request/reply contract, typed exchanges, bulk memory read
//! - **Serial Transport** (`serial`): frame reassembly, echo suppression, exchange correlation
//! - **Locking Protocol** (`locking`): bus lock/unlock against the FAM coordinator
//! - **Response Cache** (`cache`): lock-gated memoization with pluggable storage
//!
//! The library logs through `tracing` and never installs a subscriber.

pub mod bus;
pub mod cache;
pub mod config;
pub mod error;
pub mod locking;
pub mod message;
pub mod mock;
pub mod serial;

// Re-export core types
pub use bus::{classify, BusExt, BusInterface, Expect, ReceivedQueue, ReplyClass};
pub use cache::{BusCache, CacheStorage, FileStorage, MemoryStorage, Readahead};
pub use config::{BusConfig, EchoMode, LockConfig, SerialConfig};
pub use error::{BusError, ParseError, Result};
pub use locking::{lock_bus, unlock_bus, LockStatus, UnlockStatus};
pub use message::{prettify, Esp2Message, Message, Telegram};
pub use serial::SerialBus;
