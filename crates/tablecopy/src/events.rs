//! Cross-node signals.
//!
//! Cluster transport is a collaborator; the core only publishes and receives
//! the two messages below. The in-process bus covers single-node runs and
//! tests; a clustered deployment plugs in its own transport.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Tells every node to start (or resume) working its assigned items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartCopyEvent {
    pub source_node_id: i32,
    pub migration_id: String,
    pub resume: bool,
}

/// Signals that one node finished its assigned items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyCompletedEvent {
    pub source_node_id: i32,
    pub migration_id: String,
    pub result: bool,
}

/// Publish side of the cluster signal transport.
#[async_trait]
pub trait ClusterEventBus: Send + Sync {
    async fn publish_start(&self, event: StartCopyEvent) -> Result<()>;
    async fn publish_complete(&self, event: CopyCompletedEvent) -> Result<()>;
}

/// In-process event bus.
pub struct LocalEventBus {
    start_tx: broadcast::Sender<StartCopyEvent>,
    complete_tx: broadcast::Sender<CopyCompletedEvent>,
}

impl LocalEventBus {
    pub fn new() -> Self {
        let (start_tx, _) = broadcast::channel(16);
        let (complete_tx, _) = broadcast::channel(16);
        Self {
            start_tx,
            complete_tx,
        }
    }

    pub fn subscribe_start(&self) -> broadcast::Receiver<StartCopyEvent> {
        self.start_tx.subscribe()
    }

    pub fn subscribe_complete(&self) -> broadcast::Receiver<CopyCompletedEvent> {
        self.complete_tx.subscribe()
    }
}

impl Default for LocalEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterEventBus for LocalEventBus {
    async fn publish_start(&self, event: StartCopyEvent) -> Result<()> {
        // No subscribers is fine; a single-node run drives itself.
        let _ = self.start_tx.send(event);
        Ok(())
    }

    async fn publish_complete(&self, event: CopyCompletedEvent) -> Result<()> {
        let _ = self.complete_tx.send(event);
        Ok(())
    }
}
