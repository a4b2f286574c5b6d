//! # Combined Client
//!
//! One local handle for a remote capability that exposes several methods,
//! some trigger-based and some executable. Calls are routed by the
//! request's `method` to the sub-client registered for it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use shared_types::{
    CapabilityInfo, CapabilityRequest, CapabilityResponse, TriggerRegistrationRequest,
    TriggerResponse,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::errors::CapabilityError;
use crate::ports::inbound::{ExecutableCapability, TriggerCapability};

/// Routes capability calls to per-method sub-clients.
pub struct CombinedClient {
    info: CapabilityInfo,
    trigger_subscribers: RwLock<HashMap<String, Arc<dyn TriggerCapability>>>,
    executable_clients: RwLock<HashMap<String, Arc<dyn ExecutableCapability>>>,
}

impl CombinedClient {
    pub fn new(info: CapabilityInfo) -> Self {
        Self {
            info,
            trigger_subscribers: RwLock::new(HashMap::new()),
            executable_clients: RwLock::new(HashMap::new()),
        }
    }

    /// Route trigger calls for `method` to `subscriber`, replacing any
    /// previous one.
    pub fn set_trigger_subscriber(
        &self,
        method: impl Into<String>,
        subscriber: Arc<dyn TriggerCapability>,
    ) {
        self.trigger_subscribers
            .write()
            .insert(method.into(), subscriber);
    }

    pub fn set_executable_client(
        &self,
        method: impl Into<String>,
        client: Arc<dyn ExecutableCapability>,
    ) {
        self.executable_clients
            .write()
            .insert(method.into(), client);
    }

    pub fn register_to_workflow(&self) -> Result<(), CapabilityError> {
        Err(CapabilityError::Unsupported("RegisterToWorkflow"))
    }

    pub fn unregister_from_workflow(&self) -> Result<(), CapabilityError> {
        Err(CapabilityError::Unsupported("UnregisterFromWorkflow"))
    }

    fn trigger_for(&self, method: &str) -> Result<Arc<dyn TriggerCapability>, CapabilityError> {
        self.trigger_subscribers
            .read()
            .get(method)
            .cloned()
            .ok_or_else(|| CapabilityError::MethodNotDefined(method.to_string()))
    }

    fn executable_for(
        &self,
        method: &str,
    ) -> Result<Arc<dyn ExecutableCapability>, CapabilityError> {
        self.executable_clients
            .read()
            .get(method)
            .cloned()
            .ok_or_else(|| CapabilityError::MethodNotDefined(method.to_string()))
    }
}

#[async_trait]
impl TriggerCapability for CombinedClient {
    async fn info(&self) -> Result<CapabilityInfo, CapabilityError> {
        Ok(self.info.clone())
    }

    async fn register_trigger(
        &self,
        request: TriggerRegistrationRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<TriggerResponse>, CapabilityError> {
        let subscriber = self.trigger_for(&request.method)?;
        subscriber.register_trigger(request, cancel).await
    }

    async fn unregister_trigger(
        &self,
        request: TriggerRegistrationRequest,
    ) -> Result<(), CapabilityError> {
        let subscriber = self.trigger_for(&request.method)?;
        subscriber.unregister_trigger(request).await
    }
}

#[async_trait]
impl ExecutableCapability for CombinedClient {
    async fn info(&self) -> Result<CapabilityInfo, CapabilityError> {
        Ok(self.info.clone())
    }

    async fn execute(
        &self,
        request: CapabilityRequest,
    ) -> Result<CapabilityResponse, CapabilityError> {
        let client = self.executable_for(&request.method)?;
        client.execute(request).await
    }
}
