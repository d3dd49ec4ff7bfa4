use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{
    capture::{AttachOutcome, CaptureController, ChannelEvent, InstrumentationChannel},
    codec::{RequestDraft, build_raw_request, build_raw_response, parse_raw_request},
    config::Config,
    model::{ContextId, ReplayResponse},
    replay::{ReplayDispatcher, ReplayOutcome, ReplayTransport},
    repeater::{PARSE_FAILURE_MESSAGE, Repeater},
};

/// Messages accepted from the presentation layer, tagged by `action`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum InspectorRequest {
    GetRequests {
        #[serde(alias = "tabId")]
        context_id: ContextId,
    },
    GetRequestDetail {
        #[serde(alias = "tabId")]
        context_id: ContextId,
        request_id: String,
    },
    ClearRequests {
        #[serde(alias = "tabId")]
        context_id: ContextId,
    },
    StartCapture {
        #[serde(alias = "tabId")]
        context_id: ContextId,
    },
    StopCapture {
        #[serde(alias = "tabId")]
        context_id: ContextId,
    },
    GetCaptureState {
        #[serde(alias = "tabId")]
        context_id: ContextId,
    },
    GetAllCaptureStates,
    ParseRequest {
        raw: String,
    },
    BuildRequestText {
        #[serde(alias = "tabId")]
        context_id: ContextId,
        request_id: String,
    },
    BuildResponseText {
        response: ReplayResponse,
    },
    SendReplay {
        raw: String,
    },
}

const ACTIONS: &[&str] = &[
    "getRequests",
    "getRequestDetail",
    "clearRequests",
    "startCapture",
    "stopCapture",
    "getCaptureState",
    "getAllCaptureStates",
    "parseRequest",
    "buildRequestText",
    "buildResponseText",
    "sendReplay",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InspectorReply {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InspectorReply {
    fn data(data: impl Serialize) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => Self {
                success: true,
                data: Some(data),
                message: None,
                error: None,
            },
            Err(err) => Self::error(format!("serialize reply: {err}")),
        }
    }

    fn message(message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: None,
            message: Some(message.into()),
            error: None,
        }
    }

    fn error(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: None,
            error: Some(error.into()),
        }
    }
}

impl From<AttachOutcome> for InspectorReply {
    fn from(outcome: AttachOutcome) -> Self {
        Self {
            success: outcome.success,
            data: None,
            message: None,
            error: outcome.error,
        }
    }
}

/// Capture, history and replay behind one message interface.
pub struct Inspector<C, T> {
    capture: Arc<CaptureController<C>>,
    repeater: Repeater<T>,
    auto_capture: bool,
}

impl<C: InstrumentationChannel, T: ReplayTransport> Inspector<C, T> {
    pub fn new(channel: C, transport: T, config: &Config) -> Self {
        Self {
            capture: Arc::new(CaptureController::new(channel, config.ledger_limits())),
            repeater: Repeater::new(ReplayDispatcher::new(
                transport,
                config.host_mismatch_policy(),
            )),
            auto_capture: config.auto_capture(),
        }
    }

    pub fn capture(&self) -> &Arc<CaptureController<C>> {
        &self.capture
    }

    pub fn repeater(&self) -> &Repeater<T> {
        &self.repeater
    }

    /// Attaches right away when auto capture is configured.
    pub async fn context_opened(&self, context: ContextId) -> Option<AttachOutcome> {
        if !self.auto_capture {
            return None;
        }
        Some(self.capture.attach(context).await)
    }

    pub async fn context_closed(&self, context: ContextId) {
        self.capture.context_closed(context).await;
    }

    /// Seeds a replay tab from a captured record.
    pub fn open_replay_tab(&self, context: ContextId, request_id: &str) -> Option<String> {
        let record = self.capture.request_detail(context, request_id)?;
        Some(self.repeater.open_from_record(&record))
    }

    pub async fn handle(&self, request: InspectorRequest) -> InspectorReply {
        match request {
            InspectorRequest::GetRequests { context_id } => {
                InspectorReply::data(self.capture.requests(context_id))
            }
            InspectorRequest::GetRequestDetail {
                context_id,
                request_id,
            } => InspectorReply::data(self.capture.request_detail(context_id, &request_id)),
            InspectorRequest::ClearRequests { context_id } => {
                self.capture.clear(context_id);
                InspectorReply::message("requests cleared")
            }
            InspectorRequest::StartCapture { context_id } => {
                self.capture.attach(context_id).await.into()
            }
            InspectorRequest::StopCapture { context_id } => {
                self.capture.detach(context_id).await.into()
            }
            InspectorRequest::GetCaptureState { context_id } => {
                InspectorReply::data(self.capture.status(context_id))
            }
            InspectorRequest::GetAllCaptureStates => {
                InspectorReply::data(self.capture.all_statuses())
            }
            InspectorRequest::ParseRequest { raw } => match parse_raw_request(&raw) {
                Some(parsed) => InspectorReply::data(parsed),
                None => InspectorReply::error(PARSE_FAILURE_MESSAGE),
            },
            InspectorRequest::BuildRequestText {
                context_id,
                request_id,
            } => match self.capture.request_detail(context_id, &request_id) {
                Some(record) => InspectorReply::data(build_raw_request(&RequestDraft::from(&record))),
                None => InspectorReply::error(format!("request `{request_id}` not found")),
            },
            InspectorRequest::BuildResponseText { response } => {
                InspectorReply::data(build_raw_response(&response))
            }
            InspectorRequest::SendReplay { raw } => {
                let Some(parsed) = parse_raw_request(&raw) else {
                    return InspectorReply::error(PARSE_FAILURE_MESSAGE);
                };
                match self.repeater.dispatcher().dispatch(&parsed).await {
                    ReplayOutcome::Completed(result) => InspectorReply::data(result),
                    ReplayOutcome::Failed { message } => InspectorReply::error(message),
                }
            }
        }
    }

    /// Decodes one JSON message and answers it. Malformed input is answered, never raised.
    pub async fn handle_json(&self, message: &str) -> InspectorReply {
        let value: Value = match serde_json::from_str(message) {
            Ok(value) => value,
            Err(err) => return InspectorReply::error(format!("invalid message: {err}")),
        };
        let action = match value.get("action") {
            Some(Value::String(action)) => action.clone(),
            Some(other) => other.to_string(),
            None => return InspectorReply::error("missing action"),
        };
        if !ACTIONS.contains(&action.as_str()) {
            tracing::warn!(action = %action, "unknown action");
            return InspectorReply::error(format!("unknown action: {action}"));
        }

        match serde_json::from_value::<InspectorRequest>(value) {
            Ok(request) => self.handle(request).await,
            Err(err) => InspectorReply::error(format!("invalid `{action}` message: {err}")),
        }
    }
}

impl<C: InstrumentationChannel + 'static, T> Inspector<C, T> {
    pub fn spawn_event_pump(
        &self,
        events: mpsc::Receiver<ChannelEvent>,
    ) -> tokio::task::JoinHandle<()> {
        self.capture.spawn_event_pump(events)
    }
}
