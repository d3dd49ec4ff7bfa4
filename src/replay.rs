use std::{future::Future, time::Instant};

use hyper::{
    Uri,
    header::{HeaderName, HeaderValue},
    http::uri::Authority,
};
use serde::{Deserialize, Serialize};

use crate::{
    codec::{ParsedRequest, build_raw_response},
    model::{HeaderList, ReplayResponse},
};

/// Whether ambient credentials (cookies, authorization) travel with the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialsMode {
    #[default]
    Include,
    Omit,
}

/// What happens when an absolute request target disagrees with the declared `Host` header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostMismatchPolicy {
    /// Send to the target as written; the `Host` header is left to the transport.
    #[default]
    Allow,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub method: String,
    pub url: String,
    pub headers: HeaderList,
    pub body: Option<String>,
    pub credentials: CredentialsMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    InvalidRequest,
    Network,
    Body,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    kind: TransportErrorKind,
    message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for TransportError {}

/// The outbound send primitive used for replay.
pub trait ReplayTransport: Send + Sync {
    fn send(
        &self,
        request: OutboundRequest,
    ) -> impl Future<Output = Result<ReplayResponse, TransportError>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayResult {
    pub response: ReplayResponse,
    pub raw_response: String,
    pub elapsed_ms: u64,
    pub response_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum ReplayOutcome {
    Completed(ReplayResult),
    /// Transport failure or refused dispatch; no timing is reported.
    Failed { message: String },
}

#[derive(Debug, Clone)]
pub struct ReplayDispatcher<T> {
    transport: T,
    host_mismatch: HostMismatchPolicy,
}

impl<T: ReplayTransport> ReplayDispatcher<T> {
    pub fn new(transport: T, host_mismatch: HostMismatchPolicy) -> Self {
        Self {
            transport,
            host_mismatch,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub async fn dispatch(&self, parsed: &ParsedRequest) -> ReplayOutcome {
        if self.host_mismatch == HostMismatchPolicy::Reject
            && let Some(message) = host_mismatch(parsed)
        {
            tracing::warn!(url = %parsed.url, "replay refused: {message}");
            return ReplayOutcome::Failed { message };
        }

        let request = outbound_request(parsed);
        let started_at = Instant::now();
        let result = self.transport.send(request).await;
        let elapsed_ms = u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX);

        match result {
            Ok(response) => {
                tracing::info!(
                    method = %parsed.method,
                    url = %parsed.url,
                    status = response.status,
                    elapsed_ms,
                    "replay completed"
                );
                let raw_response = build_raw_response(&response);
                let response_size = response.body.len();
                ReplayOutcome::Completed(ReplayResult {
                    response,
                    raw_response,
                    elapsed_ms,
                    response_size,
                })
            }
            Err(err) => {
                tracing::warn!(method = %parsed.method, url = %parsed.url, "replay failed: {err}");
                ReplayOutcome::Failed {
                    message: format!("request failed: {err}"),
                }
            }
        }
    }
}

fn outbound_request(parsed: &ParsedRequest) -> OutboundRequest {
    let mut headers = HeaderList::new();
    for header in &parsed.headers {
        if header.name.is_empty() || header.name.eq_ignore_ascii_case("host") {
            continue;
        }
        if let Err(reason) = validate_header(&header.name, &header.value) {
            tracing::warn!(header = %header.name, "skipping invalid replay header: {reason}");
            continue;
        }
        headers.push(header.name.clone(), header.value.clone());
    }

    let bodyless =
        parsed.method.eq_ignore_ascii_case("GET") || parsed.method.eq_ignore_ascii_case("HEAD");
    let body = (!bodyless && !parsed.body.is_empty()).then(|| parsed.body.clone());

    OutboundRequest {
        method: parsed.method.clone(),
        url: parsed.url.clone(),
        headers,
        body,
        credentials: CredentialsMode::Include,
    }
}

fn validate_header(name: &str, value: &str) -> Result<(), String> {
    HeaderName::from_bytes(name.as_bytes()).map_err(|err| err.to_string())?;
    HeaderValue::from_str(value).map_err(|err| err.to_string())?;
    Ok(())
}

fn host_mismatch(parsed: &ParsedRequest) -> Option<String> {
    let declared = parsed.headers.first("host").filter(|host| !host.is_empty())?;
    let uri: Uri = parsed.url.parse().ok()?;
    let target = uri.authority()?;
    let default_port = if uri
        .scheme_str()
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("https"))
    {
        443
    } else {
        80
    };
    let target_port = target.port_u16().unwrap_or(default_port);

    let matches = declared.parse::<Authority>().is_ok_and(|declared| {
        declared.host().eq_ignore_ascii_case(target.host())
            && declared.port_u16().unwrap_or(default_port) == target_port
    });
    (!matches).then(|| {
        format!(
            "Host header `{declared}` does not match request target `{}`",
            target.as_str()
        )
    })
}
