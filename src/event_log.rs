//! Recorded channel traffic in JSON Lines form.
//!
//! Each non-blank line is either a [`ChannelEvent`] or a body entry keyed by context and request
//! id:
//!
//! ```text
//! {"context":7,"event":"requestStarted","id":"r1","url":"https://a.test/","method":"GET","timestamp":1}
//! {"context":7,"event":"loadingFinished","id":"r1","encodedSize":5}
//! {"context":7,"event":"responseBody","id":"r1","body":"hello","base64Encoded":false}
//! {"context":7,"event":"responseBody","id":"r2","error":"No data found"}
//! ```

use std::{collections::HashMap, fs, path::Path};

use anyhow::Context as _;
use serde::Deserialize;
use serde_json::Value;

use crate::{
    capture::{ChannelError, ChannelEvent, InstrumentationChannel},
    model::{ContextId, ResponseBody},
};

const BODY_ENTRY_EVENT: &str = "responseBody";
const MISSING_BODY_ERROR: &str = "No resource with given identifier found";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLogError {
    line: usize,
    message: String,
}

impl EventLogError {
    pub fn line(&self) -> usize {
        self.line
    }
}

impl std::fmt::Display for EventLogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for EventLogError {}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BodyEntry {
    context: ContextId,
    id: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    base64_encoded: bool,
    #[serde(default)]
    error: Option<String>,
}

type BodyKey = (ContextId, String);

#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<ChannelEvent>,
    bodies: HashMap<BodyKey, Result<ResponseBody, String>>,
}

impl EventLog {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("read event log {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parse event log {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self, EventLogError> {
        let mut log = Self::default();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let error = |message: String| EventLogError {
                line: index + 1,
                message,
            };

            let value: Value =
                serde_json::from_str(line).map_err(|err| error(err.to_string()))?;
            if value.get("event").and_then(Value::as_str) == Some(BODY_ENTRY_EVENT) {
                let entry: BodyEntry =
                    serde_json::from_value(value).map_err(|err| error(err.to_string()))?;
                let body = match entry.error {
                    Some(message) => Err(message),
                    None => Ok(ResponseBody {
                        body: entry.body,
                        base64_encoded: entry.base64_encoded,
                    }),
                };
                log.bodies.insert((entry.context, entry.id), body);
            } else {
                let event: ChannelEvent =
                    serde_json::from_value(value).map_err(|err| error(err.to_string()))?;
                log.events.push(event);
            }
        }
        Ok(log)
    }

    pub fn events(&self) -> &[ChannelEvent] {
        &self.events
    }

    /// Contexts in order of first appearance.
    pub fn contexts(&self) -> Vec<ContextId> {
        let mut contexts = Vec::new();
        for event in &self.events {
            if !contexts.contains(&event.context) {
                contexts.push(event.context);
            }
        }
        contexts
    }

    /// Splits the log into its event stream and a channel that serves the recorded bodies.
    pub fn into_parts(self) -> (Vec<ChannelEvent>, EventLogChannel) {
        (
            self.events,
            EventLogChannel {
                bodies: self.bodies,
            },
        )
    }
}

/// An instrumentation channel backed by a recording: attach always succeeds and bodies come
/// from the log.
#[derive(Debug, Default)]
pub struct EventLogChannel {
    bodies: HashMap<BodyKey, Result<ResponseBody, String>>,
}

impl InstrumentationChannel for EventLogChannel {
    async fn attach(&self, _context: ContextId) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn enable_network_observation(&self, _context: ContextId) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn detach(&self, _context: ContextId) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn get_response_body(
        &self,
        context: ContextId,
        request_id: &str,
    ) -> Result<ResponseBody, ChannelError> {
        match self.bodies.get(&(context, request_id.to_owned())) {
            Some(Ok(body)) => Ok(body.clone()),
            Some(Err(message)) => Err(ChannelError::new(message.clone())),
            None => Err(ChannelError::new(MISSING_BODY_ERROR)),
        }
    }
}
