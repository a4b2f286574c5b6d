//! Workflow-side shim that presents a remote executable as a local
//! [`ExecutableCapability`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use parking_lot::Mutex;
use shared_types::{
    sanitize_log_string, CapabilityInfo, CapabilityRequest, CapabilityResponse, Don, DonId,
    MessageBody, Method, PeerId, RemoteExecutableConfig,
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{message_id, outcome_of, Outcome};
use crate::errors::{CapabilityError, ConfigError};
use crate::ports::inbound::{Dispatcher, ExecutableCapability, Receiver};

struct ClientConfig {
    remote: RemoteExecutableConfig,
    capability_info: CapabilityInfo,
    local_don_id: DonId,
    capability_don: Don,
    capability_don_members: HashSet<PeerId>,
}

struct PendingRequest {
    /// Latest outcome per capability DON member.
    responses: HashMap<PeerId, Outcome>,
    done: Option<oneshot::Sender<Outcome>>,
}

/// Client side of a remote executable.
///
/// Cloning shares the same client.
#[derive(Clone)]
pub struct ExecutableClient {
    inner: Arc<Inner>,
}

struct Inner {
    capability_id: String,
    method: String,
    dispatcher: Arc<dyn Dispatcher>,
    config: ArcSwapOption<ClientConfig>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    shutdown: CancellationToken,
}

/// Drops the pending entry however `execute` returns.
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<String, PendingRequest>>,
    message_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(self.message_id);
    }
}

impl ExecutableClient {
    pub fn new(
        capability_id: impl Into<String>,
        method: impl Into<String>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                capability_id: capability_id.into(),
                method: method.into(),
                dispatcher,
                config: ArcSwapOption::empty(),
                pending: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Install a new configuration. `None` means all defaults.
    pub fn set_config(
        &self,
        config: Option<RemoteExecutableConfig>,
        capability_info: CapabilityInfo,
        local_don_id: DonId,
        capability_don: Don,
    ) -> Result<(), ConfigError> {
        if config.is_none() {
            info!("set_config called without remote config, using defaults");
        }
        let remote = RemoteExecutableConfig::or_default(config);
        if capability_info.id.is_empty() || capability_info.id != self.inner.capability_id {
            return Err(ConfigError::CapabilityMismatch {
                provided: capability_info.id,
                expected: self.inner.capability_id.clone(),
            });
        }
        if local_don_id == 0 {
            return Err(ConfigError::ZeroLocalDon);
        }
        if capability_don.id == 0 || capability_don.members.is_empty() {
            return Err(ConfigError::EmptyRemoteDon);
        }

        self.inner.config.store(Some(Arc::new(ClientConfig {
            remote,
            capability_info,
            capability_don_members: capability_don.member_set(),
            capability_don,
            local_don_id,
        })));
        Ok(())
    }

    /// Fail every waiting request with [`CapabilityError::Closed`].
    pub fn close(&self) {
        self.inner.shutdown.cancel();
        info!(capability_id = %self.inner.capability_id, "executable client closed");
    }

    /// Requests still waiting for a response quorum.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.lock().len()
    }
}

#[async_trait]
impl ExecutableCapability for ExecutableClient {
    async fn info(&self) -> Result<CapabilityInfo, CapabilityError> {
        match self.inner.config.load_full() {
            Some(cfg) => Ok(cfg.capability_info.clone()),
            None => Err(ConfigError::NotSet.into()),
        }
    }

    /// Send `request` to every capability DON member and wait for `F+1`
    /// identical responses.
    async fn execute(
        &self,
        request: CapabilityRequest,
    ) -> Result<CapabilityResponse, CapabilityError> {
        let Some(cfg) = self.inner.config.load_full() else {
            return Err(ConfigError::NotSet.into());
        };
        if self.inner.shutdown.is_cancelled() {
            return Err(CapabilityError::Closed);
        }
        let message_id = message_id(&request)?;
        let payload = request.encode()?;

        let (done, outcome) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock();
            if pending.contains_key(&message_id) {
                return Err(CapabilityError::DuplicateRequest(message_id));
            }
            pending.insert(
                message_id.clone(),
                PendingRequest {
                    responses: HashMap::new(),
                    done: Some(done),
                },
            );
        }
        let _guard = PendingGuard {
            pending: &self.inner.pending,
            message_id: &message_id,
        };

        debug!(
            capability_id = %cfg.capability_info.id,
            message_id = %message_id,
            members = cfg.capability_don.members.len(),
            "sending execute request"
        );
        for peer in &cfg.capability_don.members {
            let body = MessageBody::new(
                cfg.capability_info.id.clone(),
                cfg.capability_don.id,
                self.inner.method.clone(),
                cfg.local_don_id,
                Method::Execute,
                payload.clone(),
            )
            .with_message_id(message_id.clone());
            if let Err(err) = self.inner.dispatcher.send(*peer, body).await {
                warn!(peer = %peer, error = %err, "failed to send execute request");
            }
        }

        let outcome = tokio::select! {
            _ = self.inner.shutdown.cancelled() => return Err(CapabilityError::Closed),
            result = tokio::time::timeout(cfg.remote.request_timeout, outcome) => match result {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => return Err(CapabilityError::Closed),
                Err(_) => {
                    warn!(message_id = %message_id, "request expired before response quorum");
                    return Err(CapabilityError::RequestExpired);
                }
            },
        };
        match outcome {
            Ok(raw) => Ok(CapabilityResponse::decode(&raw)?),
            Err((code, message)) => Err(CapabilityError::Remote { code, message }),
        }
    }
}

#[async_trait]
impl Receiver for ExecutableClient {
    async fn receive(&self, body: MessageBody) {
        self.inner.receive(&body);
    }
}

impl Inner {
    fn receive(&self, body: &MessageBody) {
        let Some(cfg) = self.config.load_full() else {
            error!("config not set, dropping message");
            return;
        };
        let sender = body.sender;
        if !cfg.capability_don_members.contains(&sender) {
            error!(
                capability_id = %cfg.capability_info.id,
                sender = %sender,
                "received response from unexpected node"
            );
            return;
        }
        if body.method != Method::Execute {
            error!(
                method = %body.method,
                sender = %sender,
                "received response with unknown method"
            );
            return;
        }

        let outcome = outcome_of(body);
        let mut pending = self.pending.lock();
        let Some(request) = pending.get_mut(&body.message_id) else {
            debug!(
                message_id = %sanitize_log_string(&body.message_id),
                sender = %sender,
                "response for unknown or finished request"
            );
            return;
        };
        request.responses.insert(sender, outcome.clone());
        let agreeing = request
            .responses
            .values()
            .filter(|other| **other == outcome)
            .count();
        if agreeing < cfg.capability_don.honest_agreement() {
            return;
        }
        if let Some(done) = request.done.take() {
            debug!(
                message_id = %sanitize_log_string(&body.message_id),
                agreeing,
                "response quorum reached"
            );
            let _ = done.send(outcome);
        }
    }
}
