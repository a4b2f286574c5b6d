//! Capability-side host that serves a local executable to remote workflow
//! DONs.
//!
//! A request is identified by its message ID and the hash of its payload,
//! so a member sending a different payload under someone else's message ID
//! starts a separate request instead of joining theirs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use shared_types::{
    sanitize_log_string, validate_message_id, CapabilityInfo, CapabilityRequest, Don, DonId,
    ErrorCode, MessageBody, Method, PeerId, RemoteExecutableConfig,
};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::Outcome;
use crate::errors::ConfigError;
use crate::ports::inbound::{Dispatcher, ExecutableCapability, Receiver};
use crate::ports::outbound::{TimeSource, Timestamp};
use crate::schedule::{reset_if_changed, ticker};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RequestKey {
    message_id: String,
    payload_hash: [u8; 32],
}

enum RequestStatus {
    Collecting,
    Executing,
    Done(Outcome),
}

struct ServerRequest {
    caller_don_id: DonId,
    created_at: Timestamp,
    requesters: HashSet<PeerId>,
    status: RequestStatus,
}

#[derive(Default)]
struct ServerState {
    requests: HashMap<RequestKey, ServerRequest>,
    /// Distinct payloads seen per message ID.
    payloads_by_message: HashMap<String, HashSet<[u8; 32]>>,
}

struct ServerConfig {
    remote: RemoteExecutableConfig,
    underlying: Arc<dyn ExecutableCapability>,
    capability_info: CapabilityInfo,
    local_don: Don,
    workflow_dons: HashMap<DonId, Don>,
    members: HashMap<DonId, HashSet<PeerId>>,
}

/// What `receive` does once the state lock is released.
enum Action {
    Wait,
    Execute,
    Reply(Outcome),
}

/// Server side of a remote executable.
///
/// Cloning shares the same server.
#[derive(Clone)]
pub struct ExecutableServer {
    inner: Arc<Inner>,
}

struct Inner {
    capability_id: String,
    method: String,
    dispatcher: Arc<dyn Dispatcher>,
    time_source: Arc<dyn TimeSource>,
    config: ArcSwapOption<ServerConfig>,
    state: Mutex<ServerState>,
    /// Bounds concurrent executions; installed by `start`.
    parallel: ArcSwapOption<Semaphore>,
    started: AtomicBool,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl ExecutableServer {
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
                state: Mutex::new(ServerState::default()),
                parallel: ArcSwapOption::empty(),
                started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Install a new configuration. `None` means all defaults.
    ///
    /// `server_max_parallel_requests` only takes effect on the next start.
    pub fn set_config(
        &self,
        config: Option<RemoteExecutableConfig>,
        underlying: Arc<dyn ExecutableCapability>,
        capability_info: CapabilityInfo,
        local_don: Don,
        workflow_dons: HashMap<DonId, Don>,
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
        if local_don.members.is_empty() {
            return Err(ConfigError::EmptyLocalDon);
        }
        if workflow_dons.is_empty() {
            return Err(ConfigError::EmptyWorkflowDons);
        }
        if let Some(current) = self.inner.config.load_full() {
            if self.inner.started.load(Ordering::SeqCst)
                && current.remote.server_max_parallel_requests
                    != remote.server_max_parallel_requests
            {
                warn!("server_max_parallel_requests changed, applied on next start");
            }
        }
        let members = workflow_dons
            .iter()
            .map(|(id, don)| (*id, don.member_set()))
            .collect();

        self.inner.config.store(Some(Arc::new(ServerConfig {
            remote,
            underlying,
            capability_info,
            local_don,
            workflow_dons,
            members,
        })));
        Ok(())
    }

    /// Install the execution limit and spawn the expiry loop.
    pub fn start(&self) -> Result<(), ConfigError> {
        let Some(cfg) = self.inner.config.load_full() else {
            return Err(ConfigError::NotSet);
        };
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(ConfigError::AlreadyStarted("executable server"));
        }
        let permits = cfg.remote.server_max_parallel_requests as usize;
        self.inner
            .parallel
            .store(Some(Arc::new(Semaphore::new(permits))));

        let inner = Arc::clone(&self.inner);
        self.inner
            .tasks
            .spawn(async move { inner.expiry_loop().await });

        info!(
            capability_id = %self.inner.capability_id,
            method = %self.inner.method,
            max_parallel = permits,
            "executable capability server started"
        );
        Ok(())
    }

    /// Stop the expiry loop and abandon in-flight executions.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        info!(capability_id = %self.inner.capability_id, "executable capability server closed");
    }

    /// Requests not yet expired, executed or not.
    pub fn request_count(&self) -> usize {
        self.inner.state.lock().requests.len()
    }
}

#[async_trait]
impl Receiver for ExecutableServer {
    async fn receive(&self, body: MessageBody) {
        self.inner.receive(body).await;
    }
}

impl Inner {
    async fn receive(self: &Arc<Self>, body: MessageBody) {
        let Some(cfg) = self.config.load_full() else {
            error!("config not set, cannot process request");
            return;
        };
        let sender = body.sender;
        if body.method != Method::Execute {
            error!(
                method = %body.method,
                sender = %sender,
                "received request for unsupported method type"
            );
            return;
        }
        if let Err(err) = validate_message_id(&body.message_id) {
            error!(
                message_id = %sanitize_log_string(&body.message_id),
                error = %err,
                "invalid message id"
            );
            return;
        }
        let Some(caller_don) = cfg.workflow_dons.get(&body.caller_don_id) else {
            error!(don_id = body.caller_don_id, "received request from unregistered don");
            return;
        };
        if !cfg
            .members
            .get(&body.caller_don_id)
            .is_some_and(|members| members.contains(&sender))
        {
            error!(
                don_id = body.caller_don_id,
                sender = %sender,
                "sender not a member of its workflow DON"
            );
            return;
        }
        let Some(semaphore) = self.parallel.load_full() else {
            error!("server not started, dropping request");
            return;
        };

        let key = RequestKey {
            message_id: body.message_id.clone(),
            payload_hash: Sha256::digest(&body.payload).into(),
        };
        let now = self.time_source.now();
        let action = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let payloads = state
                .payloads_by_message
                .entry(key.message_id.clone())
                .or_default();
            payloads.insert(key.payload_hash);
            if payloads.len() > 1 {
                warn!(
                    message_id = %sanitize_log_string(&key.message_id),
                    payloads = payloads.len(),
                    "received messages with the same id and different payloads"
                );
            }

            let request = state
                .requests
                .entry(key.clone())
                .or_insert_with(|| ServerRequest {
                    caller_don_id: body.caller_don_id,
                    created_at: now,
                    requesters: HashSet::new(),
                    status: RequestStatus::Collecting,
                });
            request.requesters.insert(sender);
            match request.status {
                RequestStatus::Done(ref outcome) => Action::Reply(outcome.clone()),
                RequestStatus::Executing => Action::Wait,
                RequestStatus::Collecting => {
                    if request.requesters.len() >= caller_don.honest_agreement() {
                        request.status = RequestStatus::Executing;
                        Action::Execute
                    } else {
                        Action::Wait
                    }
                }
            }
        };
        debug!(
            message_id = %sanitize_log_string(&key.message_id),
            sender = %sender,
            "received request"
        );

        match action {
            Action::Wait => {}
            Action::Reply(outcome) => {
                self.respond(&cfg, body.caller_don_id, &key.message_id, sender, &outcome)
                    .await;
            }
            Action::Execute => {
                let inner = Arc::clone(self);
                let caller_don_id = body.caller_don_id;
                let payload = body.payload;
                self.tasks.spawn(async move {
                    inner
                        .execute(cfg, semaphore, key, caller_don_id, payload)
                        .await
                });
            }
        }
    }

    /// Run the underlying capability once and answer every requester.
    async fn execute(
        self: Arc<Self>,
        cfg: Arc<ServerConfig>,
        semaphore: Arc<Semaphore>,
        key: RequestKey,
        caller_don_id: DonId,
        payload: Vec<u8>,
    ) {
        let _permit = tokio::select! {
            _ = self.shutdown.cancelled() => return,
            permit = semaphore.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };
        let outcome = tokio::select! {
            _ = self.shutdown.cancelled() => return,
            outcome = run_underlying(&cfg, &payload) => outcome,
        };

        let requesters: Vec<PeerId> = {
            let mut state = self.state.lock();
            let Some(request) = state.requests.get_mut(&key) else {
                debug!(
                    message_id = %sanitize_log_string(&key.message_id),
                    "request expired during execution"
                );
                return;
            };
            request.status = RequestStatus::Done(outcome.clone());
            request.requesters.iter().copied().collect()
        };
        for peer in requesters {
            self.respond(&cfg, caller_don_id, &key.message_id, peer, &outcome)
                .await;
        }
    }

    async fn respond(
        &self,
        cfg: &ServerConfig,
        caller_don_id: DonId,
        message_id: &str,
        peer: PeerId,
        outcome: &Outcome,
    ) {
        let mut body = MessageBody::new(
            cfg.capability_info.id.clone(),
            cfg.local_don.id,
            self.method.clone(),
            caller_don_id,
            Method::Execute,
            Vec::new(),
        )
        .with_message_id(message_id);
        match outcome {
            Ok(payload) => body.payload = payload.clone(),
            Err((code, message)) => {
                body.error = *code;
                body.error_msg = message.clone();
            }
        }
        if let Err(err) = self.dispatcher.send(peer, body).await {
            warn!(peer = %peer, error = %err, "failed to send execute response");
        }
    }

    async fn expiry_loop(self: Arc<Self>) {
        let Some(cfg) = self.config.load_full() else {
            return;
        };
        let mut period = cfg.remote.request_timeout;
        let mut interval = ticker(period);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = interval.tick() => {}
            }
            let Some(cfg) = self.config.load_full() else {
                continue;
            };
            reset_if_changed(&mut interval, &mut period, cfg.remote.request_timeout);
            self.expire_requests(&cfg).await;
        }
    }

    /// Drop requests older than the request timeout. Requesters still
    /// waiting on them get a timeout error.
    async fn expire_requests(&self, cfg: &ServerConfig) -> usize {
        let cutoff = self.time_source.now() - cfg.remote.request_timeout.as_millis() as i64;
        let expired: Vec<(RequestKey, ServerRequest)> = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let keys: Vec<RequestKey> = state
                .requests
                .iter()
                .filter(|(_, request)| request.created_at < cutoff)
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| {
                    state.payloads_by_message.remove(&key.message_id);
                    state.requests.remove_entry(&key)
                })
                .collect()
        };

        let timeout: Outcome = Err((
            ErrorCode::Timeout,
            "request expired by executable server".to_string(),
        ));
        for (key, request) in &expired {
            if matches!(request.status, RequestStatus::Done(_)) {
                continue;
            }
            for peer in &request.requesters {
                self.respond(cfg, request.caller_don_id, &key.message_id, *peer, &timeout)
                    .await;
            }
        }
        if !expired.is_empty() {
            debug!(expired = expired.len(), "expired executable requests");
        }
        expired.len()
    }
}

async fn run_underlying(cfg: &ServerConfig, payload: &[u8]) -> Outcome {
    let request = match CapabilityRequest::decode(payload) {
        Ok(request) => request,
        Err(err) => return Err((ErrorCode::InvalidRequest, err.to_string())),
    };
    match cfg.underlying.execute(request).await {
        Ok(response) => response
            .encode()
            .map_err(|err| (ErrorCode::Internal, err.to_string())),
        Err(err) => {
            warn!(error = %err, "underlying capability failed");
            Err((ErrorCode::Internal, err.to_string()))
        }
    }
}
