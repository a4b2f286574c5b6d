//! Inbound ports: the dispatcher API and the capability interfaces it serves.

use std::sync::Arc;

use async_trait::async_trait;
use shared_types::{
    CapabilityInfo, CapabilityRequest, CapabilityResponse, DonId, MessageBody, PeerId,
    TriggerRegistrationRequest, TriggerResponse,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::errors::{CapabilityError, DispatcherError};

/// Consumer of validated messages for one receiver key.
///
/// The dispatcher calls `receive` sequentially, in arrival order, from a
/// single task per key.
#[async_trait]
pub trait Receiver: Send + Sync {
    async fn receive(&self, body: MessageBody);
}

/// Routes messages between the local node and its peers.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Stamp, sign and send `body` to `peer`.
    async fn send(&self, peer: PeerId, body: MessageBody) -> Result<(), DispatcherError>;

    /// Register a receiver for a whole capability (empty method).
    fn set_receiver(
        &self,
        capability_id: &str,
        don_id: DonId,
        receiver: Arc<dyn Receiver>,
    ) -> Result<(), DispatcherError> {
        self.set_receiver_for_method(capability_id, don_id, "", receiver)
    }

    fn set_receiver_for_method(
        &self,
        capability_id: &str,
        don_id: DonId,
        method: &str,
        receiver: Arc<dyn Receiver>,
    ) -> Result<(), DispatcherError>;

    fn remove_receiver(&self, capability_id: &str, don_id: DonId) {
        self.remove_receiver_for_method(capability_id, don_id, "");
    }

    /// Remove a receiver. Messages still queued for it are discarded.
    fn remove_receiver_for_method(&self, capability_id: &str, don_id: DonId, method: &str);
}

/// A capability that emits events to registered workflows.
#[async_trait]
pub trait TriggerCapability: Send + Sync {
    async fn info(&self) -> Result<CapabilityInfo, CapabilityError>;

    /// Register a workflow. Events arrive on the returned stream until the
    /// registration is removed or `cancel` fires.
    async fn register_trigger(
        &self,
        request: TriggerRegistrationRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<TriggerResponse>, CapabilityError>;

    async fn unregister_trigger(
        &self,
        request: TriggerRegistrationRequest,
    ) -> Result<(), CapabilityError>;
}

/// A capability invoked with a request and returning a response.
#[async_trait]
pub trait ExecutableCapability: Send + Sync {
    async fn info(&self) -> Result<CapabilityInfo, CapabilityError>;

    async fn execute(
        &self,
        request: CapabilityRequest,
    ) -> Result<CapabilityResponse, CapabilityError>;
}
