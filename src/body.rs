use crate::{
    capture::{CaptureController, InstrumentationChannel},
    ledger::BodyAttachOutcome,
    model::ContextId,
};

/// A completed request whose body should be pulled from the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyFetchTicket {
    pub context: ContextId,
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyFetchOutcome {
    /// The session detached before the fetch could start.
    Skipped,
    Stored { truncated: bool },
    AlreadyPresent,
    /// The record was evicted or cleared while the fetch was in flight.
    RequestGone,
    Failed(String),
}

impl<C: InstrumentationChannel> CaptureController<C> {
    /// Makes the single body-fetch attempt for a completed request. Failures are recorded on
    /// the record and never change its completed/failed state.
    pub async fn fetch_body(&self, ticket: BodyFetchTicket) -> BodyFetchOutcome {
        let BodyFetchTicket {
            context,
            request_id,
        } = ticket;
        if !self.lock_state().is_attached(context) {
            tracing::debug!(context = %context, request_id = %request_id, "session detached, body not fetched");
            return BodyFetchOutcome::Skipped;
        }

        let fetched = self.channel.get_response_body(context, &request_id).await;

        let mut state = self.lock_state();
        match fetched {
            Ok(body) => {
                let size = body.body.len();
                match state.ledger.attach_response_body(context, &request_id, body) {
                    BodyAttachOutcome::Stored { truncated } => {
                        tracing::debug!(
                            context = %context,
                            request_id = %request_id,
                            size,
                            truncated,
                            "response body stored"
                        );
                        BodyFetchOutcome::Stored { truncated }
                    }
                    BodyAttachOutcome::AlreadyPresent => BodyFetchOutcome::AlreadyPresent,
                    BodyAttachOutcome::UnknownRequest => BodyFetchOutcome::RequestGone,
                }
            }
            Err(err) => {
                tracing::warn!(context = %context, request_id = %request_id, "fetch response body failed: {err}");
                let message = err.message().to_owned();
                if state
                    .ledger
                    .record_body_error(context, &request_id, message.clone())
                {
                    BodyFetchOutcome::Failed(message)
                } else if state.ledger.get_detail(context, &request_id).is_none() {
                    BodyFetchOutcome::RequestGone
                } else {
                    BodyFetchOutcome::AlreadyPresent
                }
            }
        }
    }
}
