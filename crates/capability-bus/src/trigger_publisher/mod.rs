//! # Trigger Publisher
//!
//! Runs on the DON hosting a trigger capability. Accepts registrations from
//! remote workflow DONs and forwards the trigger's events back to them.
//!
//! ## Registration Quorum
//!
//! A workflow is registered with the underlying trigger only after `2F+1`
//! members of its DON sent a registration within `registration_expiry`, and
//! at least `F+1` of those payloads are byte-identical. Registrations whose
//! quorum lapses are unregistered by the cleanup loop.
//!
//! ## Background Tasks
//!
//! | Task        | Period                    | Work                                  |
//! |-------------|---------------------------|---------------------------------------|
//! | cleanup     | `message_expiry`          | unregister lapsed registrations       |
//! | batching    | `batch_collection_period` | flush queued identical events         |
//! | event loop  | per registration          | encode and send (or queue) each event |

mod batching;


use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use shared_types::{
    sanitize_log_string, validate_workflow_id, Don, DonId, MessageBody, Method, PeerId,
    RemoteTriggerConfig, TriggerEventMetadata, TriggerRegistrationRequest, TriggerResponse,
};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::domain::{aggregate_mode_raw, MessageCache};
use crate::errors::ConfigError;
use crate::ports::inbound::{Dispatcher, Receiver, TriggerCapability};
use crate::ports::outbound::TimeSource;
use crate::schedule::{reset_if_changed, ticker};

use batching::{BatchQueue, BatchedResponse};

/// Smallest collection period at which batching is worthwhile.
pub const MIN_BATCH_COLLECTION_PERIOD: std::time::Duration = std::time::Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RegistrationKey {
    caller_don_id: DonId,
    workflow_id: String,
}

struct Registration {
    request: TriggerRegistrationRequest,
    cancel: CancellationToken,
}

#[derive(Default)]
struct PublisherState {
    cache: MessageCache<RegistrationKey, PeerId>,
    registrations: HashMap<RegistrationKey, Registration>,
}

/// Snapshot installed by `set_config`.
struct PublisherConfig {
    remote: RemoteTriggerConfig,
    underlying: Arc<dyn TriggerCapability>,
    capability_don: Don,
    workflow_dons: HashMap<DonId, Don>,
    members: HashMap<DonId, HashSet<PeerId>>,
    batching_enabled: bool,
}

impl PublisherConfig {
    fn is_member(&self, don_id: DonId, peer: &PeerId) -> bool {
        self.members
            .get(&don_id)
            .is_some_and(|members| members.contains(peer))
    }
}

/// Server side of a remote trigger.
///
/// Cloning shares the same publisher.
#[derive(Clone)]
pub struct TriggerPublisher {
    inner: Arc<Inner>,
}

struct Inner {
    capability_id: String,
    method: String,
    dispatcher: Arc<dyn Dispatcher>,
    time_source: Arc<dyn TimeSource>,
    config: ArcSwapOption<PublisherConfig>,
    state: Mutex<PublisherState>,
    batch_queue: parking_lot::Mutex<BatchQueue>,
    started: AtomicBool,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl TriggerPublisher {
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
                state: Mutex::new(PublisherState::default()),
                batch_queue: parking_lot::Mutex::new(BatchQueue::default()),
                started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Install a new configuration. `None` means all defaults.
    ///
    /// Safe to call while running; loops pick up changed periods on their
    /// next tick.
    pub fn set_config(
        &self,
        config: Option<RemoteTriggerConfig>,
        underlying: Arc<dyn TriggerCapability>,
        capability_don: Don,
        workflow_dons: HashMap<DonId, Don>,
    ) -> Result<(), ConfigError> {
        if capability_don.id == 0 || capability_don.members.is_empty() {
            return Err(ConfigError::EmptyCapabilityDon);
        }
        let remote = RemoteTriggerConfig::or_default(config);
        let members = workflow_dons
            .iter()
            .map(|(id, don)| (*id, don.member_set()))
            .collect();
        let batching_enabled = remote.max_batch_size > 1
            && remote.batch_collection_period >= MIN_BATCH_COLLECTION_PERIOD;

        self.inner.config.store(Some(Arc::new(PublisherConfig {
            remote,
            underlying,
            capability_don,
            workflow_dons,
            members,
            batching_enabled,
        })));
        Ok(())
    }

    /// Spawn the cleanup and batching loops.
    pub fn start(&self) -> Result<(), ConfigError> {
        if self.inner.config.load().is_none() {
            return Err(ConfigError::NotSet);
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(ConfigError::AlreadyStarted("trigger publisher"));
        }

        let inner = Arc::clone(&self.inner);
        self.inner
            .tasks
            .spawn(async move { inner.registration_cleanup_loop().await });
        let inner = Arc::clone(&self.inner);
        self.inner
            .tasks
            .spawn(async move { inner.batching_loop().await });

        info!(
            capability_id = %self.inner.capability_id,
            method = %self.inner.method,
            "trigger publisher started"
        );
        Ok(())
    }

    /// Stop all loops. Registrations with the underlying trigger are
    /// cancelled but not unregistered.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        info!(capability_id = %self.inner.capability_id, "trigger publisher closed");
    }

    pub async fn registration_count(&self) -> usize {
        self.inner.state.lock().await.registrations.len()
    }

    pub async fn is_registered(&self, caller_don_id: DonId, workflow_id: &str) -> bool {
        let key = RegistrationKey {
            caller_don_id,
            workflow_id: workflow_id.to_string(),
        };
        self.inner.state.lock().await.registrations.contains_key(&key)
    }
}

#[async_trait]
impl Receiver for TriggerPublisher {
    async fn receive(&self, body: MessageBody) {
        self.inner.receive(body).await;
    }
}

impl Inner {
    async fn receive(self: &Arc<Self>, body: MessageBody) {
        let Some(cfg) = self.config.load_full() else {
            error!("config not set, dropping message");
            return;
        };
        if body.has_error() || !body.error_msg.is_empty() {
            error!(
                sender = %body.sender,
                method = %body.method,
                error_code = ?body.error,
                error_msg = %sanitize_log_string(&body.error_msg),
                "received a message with error"
            );
            return;
        }
        match body.method {
            Method::RegisterTrigger => self.handle_registration(&cfg, body).await,
            Method::TriggerEvent => {
                error!(sender = %body.sender, "publisher does not accept trigger events");
            }
            Method::UnregisterTrigger => {
                debug!(sender = %body.sender, "ignoring unregister, registration lapses by expiry");
            }
            other => {
                error!(
                    method = %other,
                    sender = %body.sender,
                    "received message with unknown method"
                );
            }
        }
    }

    async fn handle_registration(self: &Arc<Self>, cfg: &PublisherConfig, body: MessageBody) {
        let sender = body.sender;
        let request = match TriggerRegistrationRequest::decode(&body.payload) {
            Ok(request) => request,
            Err(err) => {
                error!(
                    sender = %sender,
                    error = %err,
                    "failed to decode trigger registration request"
                );
                return;
            }
        };
        let Some(caller_don) = cfg.workflow_dons.get(&body.caller_don_id) else {
            error!(
                caller_don_id = body.caller_don_id,
                sender = %sender,
                "received a message from unsupported workflow DON"
            );
            return;
        };
        if !cfg.is_member(body.caller_don_id, &sender) {
            error!(
                caller_don_id = body.caller_don_id,
                sender = %sender,
                "sender not a member of its workflow DON"
            );
            return;
        }
        let workflow_id = request.metadata.workflow_id.clone();
        if let Err(err) = validate_workflow_id(&workflow_id) {
            error!(
                workflow_id = %sanitize_log_string(&workflow_id),
                error = %err,
                "received trigger request with invalid workflow ID"
            );
            return;
        }
        debug!(
            workflow_id = %workflow_id,
            caller_don_id = body.caller_don_id,
            sender = %sender,
            "received trigger registration"
        );

        let key = RegistrationKey {
            caller_don_id: body.caller_don_id,
            workflow_id,
        };
        let now = self.time_source.now();
        let mut state = self.state.lock().await;
        state.cache.insert(key.clone(), sender, now, body.payload);
        if state.registrations.contains_key(&key) {
            debug!(workflow_id = %key.workflow_id, "trigger registration already exists");
            return;
        }

        let min_required = caller_don.honest_majority();
        let cutoff = now - cfg.remote.registration_expiry.as_millis() as i64;
        let Some(payloads) = state.cache.ready(&key, min_required, cutoff, false) else {
            debug!(
                workflow_id = %key.workflow_id,
                min_required,
                "not ready to aggregate yet"
            );
            return;
        };

        let aggregated = match aggregate_mode_raw(&payloads, caller_don.honest_agreement()) {
            Ok(aggregated) => aggregated,
            Err(err) => {
                error!(
                    workflow_id = %key.workflow_id,
                    error = %err,
                    "failed to aggregate trigger registrations"
                );
                return;
            }
        };
        let request = match TriggerRegistrationRequest::decode(&aggregated) {
            Ok(request) => request,
            Err(err) => {
                error!(
                    workflow_id = %key.workflow_id,
                    error = %err,
                    "failed to decode aggregated registration"
                );
                return;
            }
        };

        let cancel = self.shutdown.child_token();
        match cfg
            .underlying
            .register_trigger(request.clone(), cancel.clone())
            .await
        {
            Ok(events) => {
                state.registrations.insert(
                    key.clone(),
                    Registration {
                        request,
                        cancel: cancel.clone(),
                    },
                );
                info!(
                    workflow_id = %key.workflow_id,
                    caller_don_id = key.caller_don_id,
                    "registered trigger"
                );
                let inner = Arc::clone(self);
                self.tasks
                    .spawn(async move { inner.trigger_event_loop(events, key, cancel).await });
            }
            Err(err) => {
                cancel.cancel();
                error!(workflow_id = %key.workflow_id, error = %err, "failed to register trigger");
            }
        }
    }

    // =========================================================================
    // BACKGROUND LOOPS
    // =========================================================================

    async fn registration_cleanup_loop(self: Arc<Self>) {
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
            self.expire_registrations(&cfg).await;
        }
    }

    /// Unregister every registration whose quorum no longer holds.
    async fn expire_registrations(&self, cfg: &PublisherConfig) -> usize {
        let now = self.time_source.now();
        let cutoff = now - cfg.remote.registration_expiry.as_millis() as i64;

        let mut state = self.state.lock().await;
        let PublisherState {
            cache,
            registrations,
        } = &mut *state;
        let expired: Vec<RegistrationKey> = registrations
            .keys()
            .filter(|key| match cfg.workflow_dons.get(&key.caller_don_id) {
                Some(don) => cache
                    .ready(key, don.honest_majority(), cutoff, false)
                    .is_none(),
                None => true,
            })
            .cloned()
            .collect();

        for key in &expired {
            let Some(registration) = registrations.remove(key) else {
                continue;
            };
            info!(workflow_id = %key.workflow_id, "trigger registration expired");
            let result = cfg
                .underlying
                .unregister_trigger(registration.request)
                .await;
            registration.cancel.cancel();
            cache.delete(key);
            match result {
                Ok(()) => info!(workflow_id = %key.workflow_id, "unregistered trigger"),
                Err(err) => warn!(
                    workflow_id = %key.workflow_id,
                    error = %err,
                    "failed to unregister trigger"
                ),
            }
        }

        // Requests that never reached quorum.
        let stale = cache.delete_stale(cutoff, |key| registrations.contains_key(key));
        if stale > 0 {
            debug!(stale, "dropped unregistered requests past expiry");
        }
        expired.len()
    }

    async fn batching_loop(self: Arc<Self>) {
        let Some(cfg) = self.config.load_full() else {
            return;
        };
        let mut period = cfg.remote.batch_collection_period;
        let mut interval = ticker(period);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = interval.tick() => {}
            }
            let Some(cfg) = self.config.load_full() else {
                continue;
            };
            reset_if_changed(&mut interval, &mut period, cfg.remote.batch_collection_period);
            self.flush_batches(&cfg).await;
        }
    }

    async fn flush_batches(&self, cfg: &PublisherConfig) {
        let batches = self.batch_queue.lock().take();
        for batch in batches {
            self.send_batch(cfg, batch).await;
        }
    }

    async fn trigger_event_loop(
        self: Arc<Self>,
        mut events: mpsc::Receiver<TriggerResponse>,
        key: RegistrationKey,
        cancel: CancellationToken,
    ) {
        loop {
            let response = tokio::select! {
                _ = cancel.cancelled() => return,
                response = events.recv() => match response {
                    Some(response) => response,
                    None => {
                        info!(workflow_id = %key.workflow_id, "trigger event channel closed");
                        return;
                    }
                },
            };
            let trigger_event_id = response.event.id.clone();
            debug!(
                workflow_id = %key.workflow_id,
                trigger_event_id = %sanitize_log_string(&trigger_event_id),
                "received trigger event"
            );
            let raw_response = match response.encode() {
                Ok(raw) => raw,
                Err(err) => {
                    debug!(error = %err, "can't encode trigger event");
                    continue;
                }
            };
            let Some(cfg) = self.config.load_full() else {
                continue;
            };
            if cfg.batching_enabled {
                self.batch_queue.lock().enqueue(
                    key.caller_don_id,
                    &trigger_event_id,
                    key.workflow_id.clone(),
                    raw_response,
                );
            } else {
                let batch = BatchedResponse {
                    raw_response,
                    trigger_event_id,
                    caller_don_id: key.caller_don_id,
                    workflow_ids: vec![key.workflow_id.clone()],
                };
                self.send_batch(&cfg, batch).await;
            }
        }
    }

    /// Send `batch` to every member of its caller DON, split into messages
    /// of at most `max_batch_size` workflow IDs.
    async fn send_batch(&self, cfg: &PublisherConfig, batch: BatchedResponse) {
        let Some(caller_don) = cfg.workflow_dons.get(&batch.caller_don_id) else {
            warn!(
                caller_don_id = batch.caller_don_id,
                "caller DON no longer configured, dropping event"
            );
            return;
        };
        let chunk_size = if cfg.batching_enabled {
            cfg.remote.max_batch_size as usize
        } else {
            batch.workflow_ids.len()
        };

        for workflow_ids in batch.workflow_ids.chunks(chunk_size.max(1)) {
            let body = MessageBody::new(
                self.capability_id.clone(),
                cfg.capability_don.id,
                self.method.clone(),
                batch.caller_don_id,
                Method::TriggerEvent,
                batch.raw_response.clone(),
            )
            .with_metadata(TriggerEventMetadata {
                workflow_ids: workflow_ids.to_vec(),
                trigger_event_id: batch.trigger_event_id.clone(),
            });
            for peer in &caller_don.members {
                if let Err(err) = self.dispatcher.send(*peer, body.clone()).await {
                    error!(
                        peer = %peer,
                        trigger_event_id = %sanitize_log_string(&batch.trigger_event_id),
                        error = %err,
                        "failed to send trigger event"
                    );
                }
            }
        }
    }
}
