pub mod http;
pub mod sim;

use crate::channel::AckRequest;
use crate::domain::{AckId, EventBatch, HecError};
use crate::pool::Endpoint;
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

pub use http::{ClientStats, HttpTransport, HttpTransportFactory};
pub use sim::{
    DuplicateAckEndpoints, FailingEndpoints, LossyEndpoints, SimulatedEndpoints, SimulatedFactory,
};

/// One HEC request channel's view of the wire.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HecTransport: Send + Sync {
    /// POSTs the batch payload and returns the server-issued ack id.
    async fn post_events(&self, batch: &EventBatch) -> Result<AckId, HecError>;

    /// Asks which of the requested ack ids have been indexed.
    async fn poll_acks(&self, request: &AckRequest) -> Result<Vec<AckId>, HecError>;

    async fn check_health(&self) -> Result<(), HecError>;

    /// Releases connection resources. Called once when the channel closes.
    fn close(&self) {}
}

/// Builds one transport per channel.
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        endpoint: &Endpoint,
        channel_uuid: Uuid,
    ) -> Result<Arc<dyn HecTransport>, HecError>;
}
