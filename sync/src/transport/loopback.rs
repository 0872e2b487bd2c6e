//! In-process transport to a [`Replica`].

use super::{SendAck, SendBatch, Transport};
use crate::error::{Result, SyncError};
use crate::replica::Replica;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tidemark_engine::{ChangeRow, Origin, PeerId, RecordKey};

/// Connects a driver to a replica living in the same process.
pub struct LoopbackTransport {
    peer: PeerId,
    replica: Arc<Replica>,
    /// Peers this transport may talk to; `None` allows only `peer`
    authorized: Option<HashSet<PeerId>>,
    /// Simulated one-way delay
    latency: Option<Duration>,
}

impl LoopbackTransport {
    pub fn new(peer: impl Into<PeerId>, replica: Arc<Replica>) -> Self {
        Self {
            peer: peer.into(),
            replica,
            authorized: None,
            latency: None,
        }
    }

    /// Restrict the exchange to an explicit set of peer names.
    #[must_use]
    pub fn with_authorized(mut self, peers: impl IntoIterator<Item = PeerId>) -> Self {
        self.authorized = Some(peers.into_iter().collect());
        self
    }

    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn authorize(&self, peer: &str) -> Result<()> {
        let allowed = match &self.authorized {
            Some(peers) => peers.contains(peer),
            None => peer == self.peer,
        };
        if !allowed {
            tracing::warn!(peer = %peer, "Rejected exchange with unauthorized peer");
            return Err(SyncError::Unauthorized(peer.to_string()));
        }
        Ok(())
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn peer_origin(&self, _peer: &str) -> Origin {
        self.replica.origin()
    }

    async fn fetch_remote_log_info(
        &self,
        peer: &str,
        table: &str,
        keys: &[RecordKey],
    ) -> Result<HashMap<RecordKey, ChangeRow>> {
        self.authorize(peer)?;
        self.delay().await;
        self.replica.fetch_log_info(table, keys).await
    }

    async fn send(&self, peer: &str, batch: SendBatch) -> Result<SendAck> {
        self.authorize(peer)?;
        self.delay().await;
        self.replica.receive(batch).await
    }
}
