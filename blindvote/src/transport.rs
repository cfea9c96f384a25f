use crate::*;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// A lazy sequence of events from one subscription.
///
/// Dropping the stream cancels the subscription.
pub type EventStream = BoxStream<'static, Event>;

/// The publish/subscribe relay network.
///
/// Confidentiality of direct messages (signature requests and responses) is the
/// implementation's job.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connect to the given relay endpoints
    async fn connect(&self, endpoints: &[String]) -> Result<(), Error>;

    async fn disconnect(&self) -> Result<(), Error>;

    /// Open a subscription. Stored events that match are delivered first, then
    /// live events in arrival order.
    async fn subscribe(&self, filter: Filter) -> Result<EventStream, Error>;

    /// Publish an event, addressed to `recipient` if given
    async fn publish(&self, recipient: Option<&str>, draft: EventDraft) -> Result<Event, Error>;

    /// Our own public identity on the relay network
    fn public_key(&self) -> String;

    /// Liveness of each endpoint
    fn relay_status(&self) -> Vec<RelayStatus>;
}

/// Disconnect then connect again, for recovering from connection errors
pub async fn reconnect<T: Transport + ?Sized>(transport: &T, endpoints: &[String]) -> Result<(), Error> {
    if let Err(e) = transport.disconnect().await {
        debug!("ignoring error while disconnecting: {}", e);
    }
    transport.connect(endpoints).await
}
