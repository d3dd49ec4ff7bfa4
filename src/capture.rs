use std::{
    collections::BTreeMap,
    future::Future,
    sync::{Arc, Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{
    body::BodyFetchTicket,
    ledger::{Ledger, LedgerLimits},
    model::{ContextId, RequestRecord, RequestStart, RequestSummary, ResponseBody, ResponseMetadata},
};

const ATTACH_SUPERSEDED: &str = "capture was detached before the attach finished";

/// Lifecycle notifications pushed by the instrumentation channel for one context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum NetworkEvent {
    RequestStarted {
        id: String,
        #[serde(flatten)]
        request: RequestStart,
    },
    ResponseReceived {
        id: String,
        #[serde(flatten)]
        response: ResponseMetadata,
    },
    LoadingFinished {
        id: String,
        #[serde(default)]
        encoded_size: Option<u64>,
    },
    LoadingFailed {
        id: String,
        #[serde(default)]
        error_text: String,
        #[serde(default)]
        canceled: bool,
    },
    /// The channel was severed from the outside (e.g. the operator opened devtools).
    ForcedDetach {
        #[serde(default)]
        reason: String,
    },
}

/// A [`NetworkEvent`] together with the context it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelEvent {
    pub context: ContextId,
    #[serde(flatten)]
    pub event: NetworkEvent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelError {
    message: String,
}

impl ChannelError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ChannelError {}

/// The host's debugging channel. Implementations own the transport; the controller only
/// sequences the calls.
pub trait InstrumentationChannel: Send + Sync {
    fn attach(&self, context: ContextId) -> impl Future<Output = Result<(), ChannelError>> + Send;

    fn enable_network_observation(
        &self,
        context: ContextId,
    ) -> impl Future<Output = Result<(), ChannelError>> + Send;

    fn detach(&self, context: ContextId) -> impl Future<Output = Result<(), ChannelError>> + Send;

    fn get_response_body(
        &self,
        context: ContextId,
        request_id: &str,
    ) -> impl Future<Output = Result<ResponseBody, ChannelError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionPhase {
    Detached,
    Attaching,
    Attached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CaptureSession {
    phase: SessionPhase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureStatus {
    pub attached: bool,
    pub request_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AttachOutcome {
    fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct CaptureState {
    sessions: BTreeMap<ContextId, CaptureSession>,
    pub(crate) ledger: Ledger,
}

impl CaptureState {
    pub(crate) fn is_attached(&self, context: ContextId) -> bool {
        self.sessions
            .get(&context)
            .is_some_and(|session| session.phase == SessionPhase::Attached)
    }

    fn phase(&self, context: ContextId) -> Option<SessionPhase> {
        self.sessions.get(&context).map(|session| session.phase)
    }

    fn set_phase(&mut self, context: ContextId, phase: SessionPhase) {
        self.sessions.insert(context, CaptureSession { phase });
    }

    /// Like `set_phase`, but never recreates a session dropped by a context close.
    fn settle(&mut self, context: ContextId, phase: SessionPhase) {
        if let Some(session) = self.sessions.get_mut(&context) {
            session.phase = phase;
        }
    }
}

/// Attach/detach lifecycle per context plus the ledger those contexts feed.
///
/// A single mutex guards sessions and ledger together, so every record mutation is serialized;
/// the lock is never held across a channel call.
pub struct CaptureController<C> {
    pub(crate) channel: C,
    state: Mutex<CaptureState>,
}

impl<C: InstrumentationChannel> CaptureController<C> {
    pub fn new(channel: C, limits: LedgerLimits) -> Self {
        Self {
            channel,
            state: Mutex::new(CaptureState {
                sessions: BTreeMap::new(),
                ledger: Ledger::new(limits),
            }),
        }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, CaptureState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn attach(&self, context: ContextId) -> AttachOutcome {
        {
            let mut state = self.lock_state();
            match state.phase(context) {
                Some(SessionPhase::Attached) => {
                    tracing::debug!(context = %context, "capture already attached");
                    return AttachOutcome::ok();
                }
                Some(SessionPhase::Attaching) => {
                    return AttachOutcome::failed("attach already in progress");
                }
                Some(SessionPhase::Detached) | None => {
                    state.set_phase(context, SessionPhase::Attaching);
                }
            }
        }

        if let Err(err) = self.channel.attach(context).await {
            tracing::warn!(context = %context, "attach failed: {err}");
            self.lock_state().settle(context, SessionPhase::Detached);
            return AttachOutcome::failed(err.message());
        }

        if let Err(err) = self.channel.enable_network_observation(context).await {
            tracing::warn!(context = %context, "enable network observation failed: {err}");
            self.rollback_channel(context).await;
            self.lock_state().settle(context, SessionPhase::Detached);
            return AttachOutcome::failed(err.message());
        }

        // A detach, forced detach or close may have landed while the channel calls ran.
        let promoted = {
            let mut state = self.lock_state();
            let attaching = state.phase(context) == Some(SessionPhase::Attaching);
            if attaching {
                state.set_phase(context, SessionPhase::Attached);
            }
            attaching
        };
        if !promoted {
            tracing::info!(context = %context, "capture detached while attaching");
            self.rollback_channel(context).await;
            return AttachOutcome::failed(ATTACH_SUPERSEDED);
        }

        tracing::info!(context = %context, "capture attached");
        AttachOutcome::ok()
    }

    async fn rollback_channel(&self, context: ContextId) {
        if let Err(err) = self.channel.detach(context).await {
            tracing::debug!(context = %context, "rollback detach failed: {err}");
        }
    }

    /// Always reports success: a failing external detach usually means the context is gone.
    /// Detaching a session that is still attaching cancels it; the attach rolls the channel back.
    pub async fn detach(&self, context: ContextId) -> AttachOutcome {
        {
            let mut state = self.lock_state();
            match state.phase(context) {
                Some(SessionPhase::Attached) => {}
                Some(SessionPhase::Attaching) => {
                    state.set_phase(context, SessionPhase::Detached);
                    tracing::info!(context = %context, "pending attach canceled");
                    return AttachOutcome::ok();
                }
                Some(SessionPhase::Detached) | None => {
                    tracing::debug!(context = %context, "capture not attached");
                    return AttachOutcome::ok();
                }
            }
        }

        if let Err(err) = self.channel.detach(context).await {
            tracing::warn!(context = %context, "detach failed, marking detached anyway: {err}");
        }
        self.lock_state().settle(context, SessionPhase::Detached);
        tracing::info!(context = %context, "capture detached");
        AttachOutcome::ok()
    }

    /// The channel is already severed; flip the flag without calling out.
    pub fn handle_forced_detach(&self, context: ContextId, reason: &str) {
        self.lock_state().settle(context, SessionPhase::Detached);
        tracing::info!(context = %context, reason, "capture detached by channel");
    }

    /// Tears down everything known about a closed context.
    pub async fn context_closed(&self, context: ContextId) {
        let attached = self.lock_state().is_attached(context);
        if attached && let Err(err) = self.channel.detach(context).await {
            tracing::debug!(context = %context, "detach on close failed: {err}");
        }
        let mut state = self.lock_state();
        let removed = state.ledger.remove_context(context);
        state.sessions.remove(&context);
        tracing::info!(context = %context, removed, "context closed");
    }

    pub fn status(&self, context: ContextId) -> CaptureStatus {
        let state = self.lock_state();
        CaptureStatus {
            attached: state.is_attached(context),
            request_count: state.ledger.len(context),
        }
    }

    pub fn all_statuses(&self) -> BTreeMap<ContextId, CaptureStatus> {
        let state = self.lock_state();
        state
            .sessions
            .keys()
            .map(|&context| {
                (
                    context,
                    CaptureStatus {
                        attached: state.is_attached(context),
                        request_count: state.ledger.len(context),
                    },
                )
            })
            .collect()
    }

    pub fn requests(&self, context: ContextId) -> Vec<RequestSummary> {
        self.lock_state().ledger.snapshot(context)
    }

    pub fn request_detail(&self, context: ContextId, id: &str) -> Option<RequestRecord> {
        self.lock_state().ledger.get_detail(context, id).cloned()
    }

    pub fn clear(&self, context: ContextId) -> usize {
        let removed = self.lock_state().ledger.clear(context);
        tracing::info!(context = %context, removed, "requests cleared");
        removed
    }

    /// Applies one event to the ledger. A completion hands back the body fetch it triggers.
    pub fn apply_event(&self, context: ContextId, event: NetworkEvent) -> Option<BodyFetchTicket> {
        match event {
            NetworkEvent::RequestStarted { id, request } => {
                self.lock_state()
                    .ledger
                    .upsert_on_request_start(context, &id, request);
                None
            }
            NetworkEvent::ResponseReceived { id, response } => {
                self.lock_state()
                    .ledger
                    .attach_response_metadata(context, &id, response);
                None
            }
            NetworkEvent::LoadingFinished { id, encoded_size } => {
                let fetch = self
                    .lock_state()
                    .ledger
                    .mark_completed(context, &id, encoded_size);
                fetch.then(|| BodyFetchTicket {
                    context,
                    request_id: id,
                })
            }
            NetworkEvent::LoadingFailed {
                id,
                error_text,
                canceled,
            } => {
                if self
                    .lock_state()
                    .ledger
                    .mark_failed(context, &id, &error_text, canceled)
                {
                    tracing::debug!(context = %context, request_id = %id, error = %error_text, "request failed");
                }
                None
            }
            NetworkEvent::ForcedDetach { reason } => {
                self.handle_forced_detach(context, &reason);
                None
            }
        }
    }

    /// Applies an event and, for completions, waits for the body fetch it triggers.
    pub async fn handle_event(&self, context: ContextId, event: NetworkEvent) {
        if let Some(ticket) = self.apply_event(context, event) {
            self.fetch_body(ticket).await;
        }
    }
}

impl<C: InstrumentationChannel + 'static> CaptureController<C> {
    /// Drains channel events in arrival order. Body fetches run as their own tasks so a slow
    /// fetch never holds up later events.
    pub fn spawn_event_pump(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<ChannelEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(ChannelEvent { context, event }) = events.recv().await {
                let Some(ticket) = controller.apply_event(context, event) else {
                    continue;
                };
                let controller = Arc::clone(&controller);
                tokio::spawn(async move {
                    controller.fetch_body(ticket).await;
                });
            }
            tracing::debug!("event channel closed");
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::{
        collections::HashMap,
        sync::{Mutex, MutexGuard},
    };

    use tokio::sync::{Notify, oneshot};

    use super::{ChannelError, InstrumentationChannel};
    use crate::model::{ContextId, ResponseBody};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum ChannelCall {
        Attach(ContextId),
        Enable(ContextId),
        Detach(ContextId),
        GetBody(ContextId, String),
    }

    /// Records every call and answers from canned results.
    #[derive(Debug, Default)]
    pub(crate) struct ScriptedChannel {
        pub(crate) fail_attach: Option<String>,
        pub(crate) fail_enable: Option<String>,
        pub(crate) fail_detach: Option<String>,
        pub(crate) bodies: Mutex<HashMap<String, Result<ResponseBody, String>>>,
        pub(crate) calls: Mutex<Vec<ChannelCall>>,
        /// When set, `enable_network_observation` parks until the sender fires.
        pub(crate) enable_gate: Mutex<Option<oneshot::Receiver<()>>>,
        pub(crate) enable_parked: Notify,
    }

    impl ScriptedChannel {
        /// Returns the release handle for a parked enable step.
        pub(crate) fn gate_enable(&self) -> oneshot::Sender<()> {
            let (release, gate) = oneshot::channel();
            *lock(&self.enable_gate) = Some(gate);
            release
        }

        pub(crate) async fn enable_entered(&self) {
            self.enable_parked.notified().await;
        }

        pub(crate) fn with_body(self, id: &str, body: Result<ResponseBody, String>) -> Self {
            lock(&self.bodies).insert(id.to_owned(), body);
            self
        }

        pub(crate) fn calls(&self) -> Vec<ChannelCall> {
            lock(&self.calls).clone()
        }

        fn record(&self, call: ChannelCall) {
            lock(&self.calls).push(call);
        }
    }

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().expect("scripted channel lock poisoned")
    }

    fn outcome(failure: &Option<String>) -> Result<(), ChannelError> {
        match failure {
            Some(message) => Err(ChannelError::new(message.clone())),
            None => Ok(()),
        }
    }

    impl InstrumentationChannel for ScriptedChannel {
        async fn attach(&self, context: ContextId) -> Result<(), ChannelError> {
            self.record(ChannelCall::Attach(context));
            outcome(&self.fail_attach)
        }

        async fn enable_network_observation(&self, context: ContextId) -> Result<(), ChannelError> {
            self.record(ChannelCall::Enable(context));
            let gate = lock(&self.enable_gate).take();
            if let Some(gate) = gate {
                self.enable_parked.notify_one();
                let _ = gate.await;
            }
            outcome(&self.fail_enable)
        }

        async fn detach(&self, context: ContextId) -> Result<(), ChannelError> {
            self.record(ChannelCall::Detach(context));
            outcome(&self.fail_detach)
        }

        async fn get_response_body(
            &self,
            context: ContextId,
            request_id: &str,
        ) -> Result<ResponseBody, ChannelError> {
            self.record(ChannelCall::GetBody(context, request_id.to_owned()));
            match lock(&self.bodies).get(request_id) {
                Some(Ok(body)) => Ok(body.clone()),
                Some(Err(message)) => Err(ChannelError::new(message.clone())),
                None => Err(ChannelError::new("No resource with given identifier found")),
            }
        }
    }
}
