use std::sync::{Mutex, MutexGuard};

use hyper::Uri;
use serde::Serialize;

use crate::{
    codec::{ParsedRequest, RequestDraft, build_raw_request, parse_raw_request},
    model::RequestRecord,
    replay::{ReplayDispatcher, ReplayOutcome, ReplayTransport},
};

pub const PARSE_FAILURE_MESSAGE: &str = "cannot parse request: check the request format";
const MAX_TAB_NAME_CHARS: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayTab {
    pub id: String,
    pub name: String,
    pub raw_request_text: String,
    pub raw_response_text: String,
    pub status: Option<u16>,
    pub elapsed_ms: Option<u64>,
    pub response_size: Option<usize>,
    pub loading: bool,
    /// Bumped on every submission; results carrying an older value are stale.
    #[serde(skip)]
    generation: u64,
}

/// A submission in flight for one tab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendTicket {
    pub tab_id: String,
    pub generation: u64,
    pub request: ParsedRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginSendError {
    UnknownTab,
    Unparsable,
}

/// Open replay tabs. Edits here never reach the ledger record a tab was seeded from.
#[derive(Debug, Default)]
pub struct ReplayWorkspace {
    tabs: Vec<ReplayTab>,
    created: u64,
    active: Option<String>,
}

impl ReplayWorkspace {
    pub fn create_tab(&mut self, raw_request: Option<String>, source_url: Option<&str>) -> String {
        self.created += 1;
        let id = format!("repeater-{}", self.created);
        let name = source_url
            .and_then(tab_name_from_url)
            .unwrap_or_else(|| format!("Tab {}", self.created));
        self.tabs.push(ReplayTab {
            id: id.clone(),
            name,
            raw_request_text: raw_request.unwrap_or_default(),
            raw_response_text: String::new(),
            status: None,
            elapsed_ms: None,
            response_size: None,
            loading: false,
            generation: 0,
        });
        self.active = Some(id.clone());
        tracing::debug!(tab = %id, "replay tab created");
        id
    }

    pub fn tabs(&self) -> &[ReplayTab] {
        &self.tabs
    }

    pub fn tab(&self, id: &str) -> Option<&ReplayTab> {
        self.tabs.iter().find(|tab| tab.id == id)
    }

    pub fn active_tab_id(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn activate(&mut self, id: &str) -> bool {
        if self.tab(id).is_none() {
            return false;
        }
        self.active = Some(id.to_owned());
        true
    }

    /// Closing the active tab hands focus to the last remaining tab.
    pub fn close_tab(&mut self, id: &str) -> bool {
        let Some(index) = self.tabs.iter().position(|tab| tab.id == id) else {
            return false;
        };
        self.tabs.remove(index);
        if self.active.as_deref() == Some(id) {
            self.active = self.tabs.last().map(|tab| tab.id.clone());
        }
        true
    }

    pub fn set_request_text(&mut self, id: &str, text: impl Into<String>) -> bool {
        let Some(tab) = self.tab_mut(id) else {
            return false;
        };
        tab.raw_request_text = text.into();
        true
    }

    /// Starts a submission. An unparsable request is answered in the tab right away and still
    /// supersedes anything in flight.
    pub fn begin_send(&mut self, id: &str) -> Result<SendTicket, BeginSendError> {
        let tab = self.tab_mut(id).ok_or(BeginSendError::UnknownTab)?;
        tab.generation += 1;

        let Some(request) = parse_raw_request(&tab.raw_request_text) else {
            tab.loading = false;
            tab.raw_response_text = PARSE_FAILURE_MESSAGE.to_owned();
            return Err(BeginSendError::Unparsable);
        };
        tab.loading = true;
        Ok(SendTicket {
            tab_id: tab.id.clone(),
            generation: tab.generation,
            request,
        })
    }

    /// Applies a finished submission. Returns `false` if the tab was closed or resubmitted since.
    pub fn complete_send(&mut self, ticket: &SendTicket, outcome: &ReplayOutcome) -> bool {
        let Some(tab) = self.tab_mut(&ticket.tab_id) else {
            return false;
        };
        if tab.generation != ticket.generation {
            return false;
        }

        tab.loading = false;
        match outcome {
            ReplayOutcome::Completed(result) => {
                tab.status = Some(result.response.status);
                tab.elapsed_ms = Some(result.elapsed_ms);
                tab.response_size = Some(result.response_size);
                tab.raw_response_text = result.raw_response.clone();
            }
            ReplayOutcome::Failed { message } => {
                tab.status = None;
                tab.elapsed_ms = None;
                tab.response_size = None;
                tab.raw_response_text = message.clone();
            }
        }
        true
    }

    fn tab_mut(&mut self, id: &str) -> Option<&mut ReplayTab> {
        self.tabs.iter_mut().find(|tab| tab.id == id)
    }
}

/// Last path segment, or the hostname when the path ends in `/`.
fn tab_name_from_url(url: &str) -> Option<String> {
    let uri: Uri = url.parse().ok()?;
    let authority = uri.authority()?;
    let last_segment = uri.path().rsplit('/').next().unwrap_or_default();
    let name = if last_segment.is_empty() {
        authority.host()
    } else {
        last_segment
    };
    if name.chars().count() > MAX_TAB_NAME_CHARS {
        let short: String = name.chars().take(MAX_TAB_NAME_CHARS).collect();
        return Some(format!("{short}..."));
    }
    Some(name.to_owned())
}

/// Replay tabs wired to a dispatcher. Tabs may be sent concurrently; each send only lands if
/// it is still the tab's latest submission.
pub struct Repeater<T> {
    dispatcher: ReplayDispatcher<T>,
    workspace: Mutex<ReplayWorkspace>,
}

impl<T: ReplayTransport> Repeater<T> {
    pub fn new(dispatcher: ReplayDispatcher<T>) -> Self {
        Self {
            dispatcher,
            workspace: Mutex::new(ReplayWorkspace::default()),
        }
    }

    pub fn dispatcher(&self) -> &ReplayDispatcher<T> {
        &self.dispatcher
    }

    pub fn workspace(&self) -> MutexGuard<'_, ReplayWorkspace> {
        self.workspace
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn open_from_record(&self, record: &RequestRecord) -> String {
        let raw = build_raw_request(&RequestDraft::from(record));
        self.workspace().create_tab(Some(raw), Some(&record.url))
    }

    /// Sends the tab's current text and returns the tab as it stands afterwards.
    pub async fn send(&self, tab_id: &str) -> Option<ReplayTab> {
        let begun = self.workspace().begin_send(tab_id);
        let ticket = match begun {
            Ok(ticket) => ticket,
            Err(BeginSendError::UnknownTab) => return None,
            Err(BeginSendError::Unparsable) => {
                tracing::debug!(tab = tab_id, "replay text could not be parsed");
                return self.workspace().tab(tab_id).cloned();
            }
        };

        let outcome = self.dispatcher.dispatch(&ticket.request).await;

        let mut workspace = self.workspace();
        if !workspace.complete_send(&ticket, &outcome) {
            tracing::debug!(tab = tab_id, generation = ticket.generation, "stale replay result discarded");
        }
        workspace.tab(tab_id).cloned()
    }
}
