//! Change notifications published after every committed mutation

use crate::error::NetcfgResult;
use crate::resource::{Resource, ResourceType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeOperation::Create => f.write_str("create"),
            ChangeOperation::Update => f.write_str("update"),
            ChangeOperation::Delete => f.write_str("delete"),
        }
    }
}

/// One committed mutation, as seen by other control-plane instances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub operation: ChangeOperation,
    pub resource: Resource,
    /// Instance id of the publisher
    pub origin: String,
    pub request_id: Uuid,
}

impl ChangeEvent {
    pub fn resource_type(&self) -> ResourceType {
        self.resource.resource_type
    }
}

#[async_trait]
pub trait NotificationBus: Send + Sync {
    /// Best effort; the pipeline turns a failure into a warning
    async fn publish(&self, event: ChangeEvent) -> NetcfgResult<()>;

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;
}

/// In-process bus over a tokio broadcast channel
///
/// Several control planes sharing one `BroadcastBus` behave like replicas
/// attached to the same message bus.
#[derive(Clone)]
pub struct BroadcastBus {
    sender: broadcast::Sender<ChangeEvent>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl NotificationBus for BroadcastBus {
    async fn publish(&self, event: ChangeEvent) -> NetcfgResult<()> {
        // No subscribers is not an error: nobody is listening yet
        match self.sender.send(event) {
            Ok(receivers) => debug!("change event delivered to {} receivers", receivers),
            Err(_) => debug!("change event dropped, no receivers"),
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(origin: &str) -> ChangeEvent {
        ChangeEvent {
            operation: ChangeOperation::Create,
            resource: Resource::new(ResourceType::Tag, vec!["label=web"]).with_uuid(Uuid::new_v4()),
            origin: origin.to_string(),
            request_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = BroadcastBus::new(4);
        assert!(bus.publish(event("a")).await.is_ok());
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_event() {
        let bus = BroadcastBus::new(4);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        bus.publish(event("a")).await.unwrap();

        assert_eq!(first.recv().await.unwrap().origin, "a");
        let received = second.recv().await.unwrap();
        assert_eq!(received.resource_type(), ResourceType::Tag);
        assert_eq!(received.operation, ChangeOperation::Create);
    }
}
