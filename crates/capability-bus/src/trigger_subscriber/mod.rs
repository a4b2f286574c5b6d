//! # Trigger Subscriber
//!
//! Runs on a workflow DON and presents a remote trigger as a local
//! [`TriggerCapability`]. Registrations are re-announced to every member of
//! the capability DON on each `registration_refresh` tick; events are
//! delivered once `min_responses_to_aggregate` members sent a fresh copy.
//!
//! ## Event Path
//!
//! ```text
//! TriggerEvent{workflow_ids, trigger_event_id}
//!     │  sender must be a capability DON member
//!     ▼
//! for each registered workflow ID:
//!     cache[(event, workflow)] += payload ─► ready? ─► aggregate ─► workflow stream
//! ```


use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use parking_lot::RwLock;
use shared_types::{
    sanitize_log_string, CapabilityInfo, Don, DonId, InputError, MessageBody, Method, PeerId,
    RemoteTriggerConfig, TriggerRegistrationRequest, TriggerResponse,
};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::domain::{Aggregator, MessageCache};
use crate::errors::{CapabilityError, ConfigError};
use crate::ports::inbound::{Dispatcher, Receiver, TriggerCapability};
use crate::ports::outbound::TimeSource;
use crate::schedule::{reset_if_changed, ticker};

/// Capacity of each workflow's event stream. Consumers are expected to
/// read without blocking.
pub const SEND_CHANNEL_BUFFER_SIZE: usize = 1000;

/// Workflow IDs honored per inbound event; the rest are dropped.
pub const MAX_BATCHED_WORKFLOW_IDS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TriggerEventKey {
    trigger_event_id: String,
    workflow_id: String,
}

struct WorkflowRegistration {
    callback: mpsc::Sender<TriggerResponse>,
    raw_request: Vec<u8>,
}

#[derive(Default)]
struct SubscriberState {
    cache: MessageCache<TriggerEventKey, PeerId>,
    workflows: HashMap<String, WorkflowRegistration>,
}

struct SubscriberConfig {
    remote: RemoteTriggerConfig,
    capability_info: CapabilityInfo,
    capability_don: Don,
    capability_don_members: HashSet<PeerId>,
    local_don_id: DonId,
    aggregator: Arc<dyn Aggregator>,
}

/// Client side of a remote trigger.
///
/// Cloning shares the same subscriber.
#[derive(Clone)]
pub struct TriggerSubscriber {
    inner: Arc<Inner>,
}

struct Inner {
    capability_id: String,
    method: String,
    dispatcher: Arc<dyn Dispatcher>,
    time_source: Arc<dyn TimeSource>,
    config: ArcSwapOption<SubscriberConfig>,
    state: RwLock<SubscriberState>,
    started: AtomicBool,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl TriggerSubscriber {
    pub fn new(
        capability_id: impl Into<String>,
        method: impl Into<String>,
        dispatcher: Arc<dyn Dispatcher>,
        time_source: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                capability_id: capability_id.into(),
                method: method.into(),
                dispatcher,
                time_source,
                config: ArcSwapOption::empty(),
                state: RwLock::new(SubscriberState::default()),
                started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Install a new configuration. `None` means all defaults.
    pub fn set_config(
        &self,
        config: Option<RemoteTriggerConfig>,
        capability_info: CapabilityInfo,
        local_don_id: DonId,
        capability_don: Don,
        aggregator: Option<Arc<dyn Aggregator>>,
    ) -> Result<(), ConfigError> {
        if config.is_none() {
            info!("set_config called without remote config, using defaults");
        }
        let remote = RemoteTriggerConfig::or_default(config);
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
        let aggregator = aggregator.ok_or(ConfigError::MissingAggregator)?;

        self.inner.config.store(Some(Arc::new(SubscriberConfig {
            remote,
            capability_info,
            capability_don_members: capability_don.member_set(),
            capability_don,
            local_don_id,
            aggregator,
        })));
        Ok(())
    }

    /// Spawn the registration and cleanup loops.
    pub fn start(&self) -> Result<(), ConfigError> {
        if self.inner.config.load().is_none() {
            return Err(ConfigError::NotSet);
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(ConfigError::AlreadyStarted("trigger subscriber"));
        }

        let inner = Arc::clone(&self.inner);
        self.inner
            .tasks
            .spawn(async move { inner.registration_loop().await });
        let inner = Arc::clone(&self.inner);
        self.inner
            .tasks
            .spawn(async move { inner.event_cleanup_loop().await });

        info!(capability_id = %self.inner.capability_id, "trigger subscriber started");
        Ok(())
    }

    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        info!(capability_id = %self.inner.capability_id, "trigger subscriber closed");
    }

    pub fn registered_workflows(&self) -> usize {
        self.inner.state.read().workflows.len()
    }
}

#[async_trait]
impl TriggerCapability for TriggerSubscriber {
    async fn info(&self) -> Result<CapabilityInfo, CapabilityError> {
        match self.inner.config.load_full() {
            Some(cfg) => Ok(cfg.capability_info.clone()),
            None => Err(ConfigError::NotSet.into()),
        }
    }

    /// Register a workflow. Registering the same workflow again replaces
    /// its request and its stream; the previous stream ends.
    async fn register_trigger(
        &self,
        request: TriggerRegistrationRequest,
        _cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<TriggerResponse>, CapabilityError> {
        let raw_request = request.encode()?;
        let workflow_id = request.metadata.workflow_id;
        if workflow_id.is_empty() {
            return Err(InputError::EmptyWorkflowId.into());
        }
        let Some(cfg) = self.inner.config.load_full() else {
            return Err(ConfigError::NotSet.into());
        };

        let (callback, events) = mpsc::channel(SEND_CHANNEL_BUFFER_SIZE);
        let mut state = self.inner.state.write();
        info!(
            capability_id = %cfg.capability_info.id,
            don_id = cfg.capability_don.id,
            workflow_id = %sanitize_log_string(&workflow_id),
            "register_trigger called"
        );
        if state.workflows.contains_key(&workflow_id) {
            warn!(
                capability_id = %cfg.capability_info.id,
                workflow_id = %sanitize_log_string(&workflow_id),
                "re-registering trigger"
            );
        }
        state.workflows.insert(
            workflow_id,
            WorkflowRegistration {
                callback,
                raw_request,
            },
        );
        Ok(events)
    }

    /// Drop a workflow's registration and close its stream. Remote
    /// publishers expire it once refreshes stop.
    async fn unregister_trigger(
        &self,
        request: TriggerRegistrationRequest,
    ) -> Result<(), CapabilityError> {
        self.inner
            .state
            .write()
            .workflows
            .remove(&request.metadata.workflow_id);
        Ok(())
    }
}

#[async_trait]
impl Receiver for TriggerSubscriber {
    async fn receive(&self, body: MessageBody) {
        self.inner.receive(body);
    }
}

impl Inner {
    fn receive(&self, body: MessageBody) {
        let Some(cfg) = self.config.load_full() else {
            error!("config not set, dropping message");
            return;
        };
        let sender = body.sender;
        if !cfg.capability_don_members.contains(&sender) {
            error!(
                capability_id = %cfg.capability_info.id,
                sender = %sender,
                "received message from unexpected node"
            );
            return;
        }
        if body.method != Method::TriggerEvent {
            error!(
                method = %body.method,
                sender = %sender,
                error_msg = %sanitize_log_string(&body.error_msg),
                "received trigger event with unknown method"
            );
            return;
        }
        let Some(mut metadata) = body.metadata else {
            error!(
                capability_id = %cfg.capability_info.id,
                sender = %sender,
                "received message with invalid trigger metadata"
            );
            return;
        };
        if metadata.workflow_ids.len() > MAX_BATCHED_WORKFLOW_IDS {
            error!(
                capability_id = %cfg.capability_info.id,
                workflows = metadata.workflow_ids.len(),
                sender = %sender,
                "received message with too many workflow IDs, truncating"
            );
            metadata.workflow_ids.truncate(MAX_BATCHED_WORKFLOW_IDS);
        }

        let min_responses = cfg.remote.min_responses_to_aggregate as usize;
        let expiry_ms = cfg.remote.message_expiry.as_millis() as i64;
        for workflow_id in metadata.workflow_ids {
            let now = self.time_source.now();
            let key = TriggerEventKey {
                trigger_event_id: metadata.trigger_event_id.clone(),
                workflow_id,
            };
            let (callback, payloads) = {
                let mut state = self.state.write();
                let Some(callback) = state
                    .workflows
                    .get(&key.workflow_id)
                    .map(|r| r.callback.clone())
                else {
                    error!(
                        capability_id = %cfg.capability_info.id,
                        workflow_id = %sanitize_log_string(&key.workflow_id),
                        sender = %sender,
                        "received message for unregistered workflow"
                    );
                    continue;
                };
                let created_at = state
                    .cache
                    .insert(key.clone(), sender, now, body.payload.clone());
                let payloads = state
                    .cache
                    .ready(&key, min_responses, now - expiry_ms, true);
                debug!(
                    trigger_event_id = %sanitize_log_string(&key.trigger_event_id),
                    workflow_id = %sanitize_log_string(&key.workflow_id),
                    sender = %sender,
                    ready = payloads.is_some(),
                    now,
                    created_at,
                    min_responses,
                    "trigger event received"
                );
                (callback, payloads)
            };

            let Some(payloads) = payloads else {
                continue;
            };
            let response = match cfg.aggregator.aggregate(&key.trigger_event_id, &payloads) {
                Ok(response) => response,
                Err(err) => {
                    error!(
                        trigger_event_id = %sanitize_log_string(&key.trigger_event_id),
                        workflow_id = %sanitize_log_string(&key.workflow_id),
                        error = %err,
                        "failed to aggregate responses"
                    );
                    // Later copies may still agree.
                    self.state.write().cache.reset_ready(&key);
                    continue;
                }
            };
            info!(
                trigger_event_id = %sanitize_log_string(&key.trigger_event_id),
                capability_id = %cfg.capability_info.id,
                workflow_id = %sanitize_log_string(&key.workflow_id),
                "remote trigger event aggregated"
            );
            match callback.try_send(response) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => warn!(
                    workflow_id = %sanitize_log_string(&key.workflow_id),
                    "workflow event stream full, dropping event"
                ),
                Err(TrySendError::Closed(_)) => debug!(
                    workflow_id = %sanitize_log_string(&key.workflow_id),
                    "workflow event stream closed"
                ),
            }
        }
    }

    async fn registration_loop(self: Arc<Self>) {
        let Some(cfg) = self.config.load_full() else {
            return;
        };
        let mut period = cfg.remote.registration_refresh;
        let mut interval = ticker(period);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = interval.tick() => {}
            }
            let Some(cfg) = self.config.load_full() else {
                continue;
            };
            reset_if_changed(&mut interval, &mut period, cfg.remote.registration_refresh);
            self.announce_registrations(&cfg).await;
        }
    }

    /// Send every registered workflow's request to every capability DON member.
    async fn announce_registrations(&self, cfg: &SubscriberConfig) {
        let requests: Vec<Vec<u8>> = self
            .state
            .read()
            .workflows
            .values()
            .map(|r| r.raw_request.clone())
            .collect();
        info!(
            capability_id = %cfg.capability_info.id,
            don_id = cfg.capability_don.id,
            members = cfg.capability_don.members.len(),
            workflows = requests.len(),
            "register trigger for remote capability"
        );

        for raw_request in requests {
            for peer in &cfg.capability_don.members {
                let body = MessageBody::new(
                    cfg.capability_info.id.clone(),
                    cfg.capability_don.id,
                    self.method.clone(),
                    cfg.local_don_id,
                    Method::RegisterTrigger,
                    raw_request.clone(),
                );
                if let Err(err) = self.dispatcher.send(*peer, body).await {
                    error!(
                        capability_id = %cfg.capability_info.id,
                        peer = %peer,
                        error = %err,
                        "failed to send registration"
                    );
                }
            }
        }
    }

    async fn event_cleanup_loop(self: Arc<Self>) {
        let Some(cfg) = self.config.load_full() else {
            return;
        };
        let mut period = cfg.remote.message_expiry;
        let mut interval = ticker(period);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = interval.tick() => {}
            }
            let Some(cfg) = self.config.load_full() else {
                continue;
            };
            reset_if_changed(&mut interval, &mut period, cfg.remote.message_expiry);
            self.expire_events(&cfg);
        }
    }

    fn expire_events(&self, cfg: &SubscriberConfig) -> usize {
        let cutoff = self.time_source.now() - cfg.remote.message_expiry.as_millis() as i64;
        let removed = self.state.write().cache.delete_older_than(cutoff);
        if removed > 0 {
            debug!(removed, "expired trigger events");
        }
        removed
    }
}
