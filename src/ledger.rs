use std::collections::HashMap;

use crate::model::{
    ContextId, RedirectResponse, RequestRecord, RequestStart, RequestSummary, ResponseBody,
    ResponseHead, ResponseMetadata,
};

pub const DEFAULT_MAX_REQUESTS_PER_CONTEXT: usize = 1000;
pub const DEFAULT_MAX_RESPONSE_BODY_BYTES: usize = 5 * 1024 * 1024;
pub const CANCELED_ERROR_TEXT: &str = "request canceled";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerLimits {
    pub max_requests_per_context: usize,
    pub max_response_body_bytes: usize,
}

impl Default for LedgerLimits {
    fn default() -> Self {
        Self {
            max_requests_per_context: DEFAULT_MAX_REQUESTS_PER_CONTEXT,
            max_response_body_bytes: DEFAULT_MAX_RESPONSE_BODY_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// A record with the same id existed and its response was kept as the redirect hop.
    pub redirected: bool,
    pub evicted: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyAttachOutcome {
    Stored { truncated: bool },
    AlreadyPresent,
    UnknownRequest,
}

/// Owner of every captured record, partitioned by browsing context.
///
/// All mutation goes through the methods below; events that reference an id the ledger does not
/// know about are dropped, since they can belong to evicted or pre-capture traffic.
#[derive(Debug, Default)]
pub struct Ledger {
    limits: LedgerLimits,
    contexts: HashMap<ContextId, HashMap<String, RequestRecord>>,
    request_contexts: HashMap<String, ContextId>,
    next_sequence: u64,
}

impl Ledger {
    pub fn new(limits: LedgerLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    pub fn limits(&self) -> LedgerLimits {
        self.limits
    }

    pub fn upsert_on_request_start(
        &mut self,
        context: ContextId,
        id: &str,
        mut start: RequestStart,
    ) -> UpsertOutcome {
        let redirect_head = start.redirect_response.take();
        let records = self.contexts.entry(context).or_default();

        let redirect = records.get(id).and_then(|prior| {
            let head = redirect_head.or_else(|| final_response_head(prior))?;
            Some(RedirectResponse {
                status: head.status,
                status_text: head.status_text,
                headers: head.headers,
                redirect_url: start.url.clone(),
            })
        });
        let redirected = redirect.is_some();

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let mut record = RequestRecord::from_start(context, id.to_owned(), start, sequence);
        record.redirect_response = redirect;
        tracing::debug!(
            context = %context,
            request_id = id,
            method = %record.method,
            url = %record.url,
            redirected,
            "request captured"
        );
        records.insert(id.to_owned(), record);
        self.request_contexts.insert(id.to_owned(), context);

        let evicted = self.evict_overflow(context);
        UpsertOutcome {
            redirected,
            evicted,
        }
    }

    pub fn attach_response_metadata(
        &mut self,
        context: ContextId,
        id: &str,
        metadata: ResponseMetadata,
    ) -> bool {
        let Some(record) = self.record_mut(context, id) else {
            tracing::debug!(context = %context, request_id = id, "response for unknown request dropped");
            return false;
        };

        record.status = Some(metadata.status);
        record.status_text = Some(metadata.status_text);
        record.response_headers = Some(metadata.headers);
        record.mime_type = metadata.mime_type;
        record.response_size = Some(metadata.encoded_size.unwrap_or(0));
        record.remote_address = metadata.remote_address;
        record.remote_port = metadata.remote_port;
        record.protocol = metadata.protocol;
        true
    }

    /// Marks the record completed and reports whether a body fetch should now be attempted.
    ///
    /// At most one fetch is ever requested per record; failed records never request one.
    pub fn mark_completed(
        &mut self,
        context: ContextId,
        id: &str,
        encoded_size: Option<u64>,
    ) -> bool {
        let Some(record) = self.record_mut(context, id) else {
            tracing::debug!(context = %context, request_id = id, "completion for unknown request dropped");
            return false;
        };

        if let Some(size) = encoded_size {
            record.response_size = Some(size);
        }
        if !record.state.complete() {
            return false;
        }
        if record.body_fetch_requested {
            return false;
        }
        record.body_fetch_requested = true;
        true
    }

    pub fn mark_failed(
        &mut self,
        context: ContextId,
        id: &str,
        error_text: &str,
        canceled: bool,
    ) -> bool {
        let Some(record) = self.record_mut(context, id) else {
            tracing::debug!(context = %context, request_id = id, "failure for unknown request dropped");
            return false;
        };

        let error = if canceled {
            CANCELED_ERROR_TEXT.to_owned()
        } else {
            error_text.to_owned()
        };
        record.state.fail(error)
    }

    pub fn attach_response_body(
        &mut self,
        context: ContextId,
        id: &str,
        body: ResponseBody,
    ) -> BodyAttachOutcome {
        let ceiling = self.limits.max_response_body_bytes;
        let Some(record) = self.record_mut(context, id) else {
            return BodyAttachOutcome::UnknownRequest;
        };
        if record.response_body.is_some() {
            return BodyAttachOutcome::AlreadyPresent;
        }

        let (text, truncated) = truncate_to_ceiling(body.body, ceiling);
        record.response_body = Some(text);
        record.response_body_truncated = truncated;
        record.response_body_is_binary_encoded = body.base64_encoded;
        record.response_body_error = None;
        BodyAttachOutcome::Stored { truncated }
    }

    /// Records a body-fetch error unless a body was already obtained. The record's
    /// completed/failed state is left alone.
    pub fn record_body_error(&mut self, context: ContextId, id: &str, error: String) -> bool {
        let Some(record) = self.record_mut(context, id) else {
            return false;
        };
        if record.response_body.is_some() {
            return false;
        }
        record.response_body_error = Some(error);
        true
    }

    /// Summaries for one context, newest first.
    pub fn snapshot(&self, context: ContextId) -> Vec<RequestSummary> {
        let Some(records) = self.contexts.get(&context) else {
            return Vec::new();
        };
        let mut ordered: Vec<&RequestRecord> = records.values().collect();
        ordered.sort_by(|a, b| {
            b.request_timestamp
                .total_cmp(&a.request_timestamp)
                .then(b.sequence.cmp(&a.sequence))
        });
        ordered.into_iter().map(RequestRecord::summary).collect()
    }

    pub fn get_detail(&self, context: ContextId, id: &str) -> Option<&RequestRecord> {
        self.contexts.get(&context)?.get(id)
    }

    pub fn len(&self, context: ContextId) -> usize {
        self.contexts.get(&context).map_or(0, HashMap::len)
    }

    pub fn context_of(&self, id: &str) -> Option<ContextId> {
        self.request_contexts.get(id).copied()
    }

    /// Drops every record of `context`, keeping the context itself known.
    pub fn clear(&mut self, context: ContextId) -> usize {
        let Some(records) = self.contexts.get_mut(&context) else {
            return 0;
        };
        let removed: Vec<String> = records.drain().map(|(id, _)| id).collect();
        self.release_ids(context, &removed);
        removed.len()
    }

    pub fn remove_context(&mut self, context: ContextId) -> usize {
        let Some(records) = self.contexts.remove(&context) else {
            return 0;
        };
        let removed: Vec<String> = records.into_keys().collect();
        self.release_ids(context, &removed);
        removed.len()
    }

    fn record_mut(&mut self, context: ContextId, id: &str) -> Option<&mut RequestRecord> {
        self.contexts.get_mut(&context)?.get_mut(id)
    }

    fn evict_overflow(&mut self, context: ContextId) -> usize {
        let cap = self.limits.max_requests_per_context;
        let Some(records) = self.contexts.get_mut(&context) else {
            return 0;
        };
        if records.len() <= cap {
            return 0;
        }

        let mut by_age: Vec<(f64, u64, &str)> = records
            .values()
            .map(|record| (record.request_timestamp, record.sequence, record.id.as_str()))
            .collect();
        by_age.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        let excess = records.len() - cap;
        let doomed: Vec<String> = by_age
            .into_iter()
            .take(excess)
            .map(|(_, _, id)| id.to_owned())
            .collect();

        for id in &doomed {
            records.remove(id);
        }
        self.release_ids(context, &doomed);
        tracing::info!(context = %context, evicted = doomed.len(), "evicted oldest requests");
        doomed.len()
    }

    fn release_ids(&mut self, context: ContextId, ids: &[String]) {
        for id in ids {
            if self.request_contexts.get(id) == Some(&context) {
                self.request_contexts.remove(id);
            }
        }
    }
}

fn final_response_head(record: &RequestRecord) -> Option<ResponseHead> {
    Some(ResponseHead {
        status: record.status?,
        status_text: record.status_text.clone().unwrap_or_default(),
        headers: record.response_headers.clone().unwrap_or_default(),
    })
}

/// Cuts `body` to at most `ceiling` bytes, backing off to a char boundary if needed.
fn truncate_to_ceiling(mut body: String, ceiling: usize) -> (String, bool) {
    if body.len() <= ceiling {
        return (body, false);
    }
    let mut cut = ceiling;
    while !body.is_char_boundary(cut) {
        cut -= 1;
    }
    body.truncate(cut);
    (body, true)
}
