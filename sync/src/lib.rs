//! # Tidemark Sync
//!
//! Async reconciliation rounds on top of `tidemark-engine`.
//!
//! A [`ReconciliationDriver`] owns one local replica's side of the exchange
//! with its peers. Each round scans the local changes above a (peer, table)
//! watermark, resolves them with the engine, applies the local writes, sends
//! the rest through a [`Transport`] and commits the watermark together with
//! the last writes. The receiving side of a transport is a [`Replica`].
//!
//! Storage ([`Storage`]), transport ([`Transport`]) and scheduling
//! ([`Scheduler`]) are collaborators behind traits. In-memory and SQLite
//! storages and an in-process transport ship with the crate.

pub mod config;
pub mod driver;
pub mod error;
pub mod replica;
pub mod scheduler;
pub mod storage;
pub mod transport;
pub mod watermark;

pub use config::{Config, ConfigError};
pub use driver::{DriverOptions, ReconciliationDriver, RoundPhase, RoundReport};
pub use error::{Result, SyncError};
pub use replica::Replica;
pub use scheduler::{Job, Scheduler, TokioScheduler};
pub use storage::{
    ApplyBatch, ApplyOutcome, ChangeBatch, MemoryStorage, SqliteStorage, Storage,
    WatermarkAdvance, WriteOp,
};
pub use transport::{LoopbackTransport, Receipt, SendAck, SendBatch, Transport};
pub use watermark::{PairFence, WatermarkTracker};
