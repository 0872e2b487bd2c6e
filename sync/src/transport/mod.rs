//! Transport collaborators.
//!
//! A [`Transport`] reaches one or more peers: it fetches the peer's copies of
//! a set of keys and delivers rows the peer should adopt. Authorization is
//! the transport's business and happens before any exchange.

mod loopback;

pub use loopback::LoopbackTransport;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tidemark_engine::{ChangeRow, Origin, RecordKey, SyncStrategy, TableName};

/// Rows sent to a peer in one exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendBatch {
    pub table: TableName,
    /// Kind of replica the rows come from
    pub origin: Origin,
    /// Strategy the receiver resolves the rows with
    pub strategy: SyncStrategy,
    pub rows: Vec<ChangeRow>,
}

/// The peer's bookkeeping for one received row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub key: RecordKey,
    pub cloud_gid: String,
    pub version: u64,
}

/// Confirmation that a [`SendBatch`] was applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendAck {
    pub receipts: Vec<Receipt>,
}

/// How a driver talks to its peers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Kind of replica at the other end for `peer`.
    fn peer_origin(&self, peer: &str) -> Origin;

    /// The peer's rows for `keys`. Keys the peer does not have are absent.
    async fn fetch_remote_log_info(
        &self,
        peer: &str,
        table: &str,
        keys: &[RecordKey],
    ) -> Result<HashMap<RecordKey, ChangeRow>>;

    /// Deliver rows and wait for the peer to apply them.
    async fn send(&self, peer: &str, batch: SendBatch) -> Result<SendAck>;
}
