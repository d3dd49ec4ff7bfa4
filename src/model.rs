use std::fmt;

use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    ser::SerializeMap as _,
};
use serde_json::Value;

/// Identifies one observed browsing context (a tab in the host browser).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ContextId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Ordered header collection. Duplicate names are kept as separate entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct HeaderList(Vec<Header>);

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push(Header::new(name, value));
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Header> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Header] {
        &self.0
    }

    /// First value for `name`, compared case-insensitively.
    pub fn first(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|header| header.name.eq_ignore_ascii_case(name))
            .map(|header| header.value.as_str())
    }

    pub fn into_vec(self) -> Vec<Header> {
        self.0
    }
}

impl From<Vec<Header>> for HeaderList {
    fn from(headers: Vec<Header>) -> Self {
        Self(headers)
    }
}

impl FromIterator<Header> for HeaderList {
    fn from_iter<I: IntoIterator<Item = Header>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for HeaderList {
    type Item = Header;
    type IntoIter = std::vec::IntoIter<Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a HeaderList {
    type Item = &'a Header;
    type IntoIter = std::slice::Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawHeaders {
    List(Vec<RawHeaderEntry>),
    Object(serde_json::Map<String, Value>),
}

#[derive(Deserialize)]
struct RawHeaderEntry {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    value: Value,
}

/// Header collections arrive either as `[{name, value}]` or as a plain object.
impl<'de> Deserialize<'de> for HeaderList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<RawHeaders>::deserialize(deserializer)?;
        let headers = match raw {
            None => Vec::new(),
            Some(RawHeaders::List(entries)) => entries
                .into_iter()
                .filter_map(|entry| {
                    let name = entry.name.filter(|name| !name.is_empty())?;
                    Some(Header::new(name, header_value_text(&entry.value)))
                })
                .collect(),
            Some(RawHeaders::Object(map)) => map
                .into_iter()
                .filter(|(name, _)| !name.is_empty())
                .map(|(name, value)| {
                    let value = header_value_text(&value);
                    Header::new(name, value)
                })
                .collect(),
        };
        Ok(Self(headers))
    }
}

fn header_value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Array(items) => items
            .iter()
            .map(header_value_text)
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}

/// Lifecycle of a captured exchange. Transitions only move forward:
/// `Pending -> Completed`, `Pending -> Failed`, `Completed -> Failed`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RequestState {
    #[default]
    Pending,
    Completed,
    Failed(String),
}

impl RequestState {
    pub fn is_completed(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Failed(error) => Some(error),
            Self::Pending | Self::Completed => None,
        }
    }

    /// Returns `false` when the record already failed; that state is terminal.
    pub(crate) fn complete(&mut self) -> bool {
        match self {
            Self::Pending => {
                *self = Self::Completed;
                true
            }
            Self::Completed => true,
            Self::Failed(_) => false,
        }
    }

    pub(crate) fn fail(&mut self, error: String) -> bool {
        match self {
            Self::Pending | Self::Completed => {
                *self = Self::Failed(error);
                true
            }
            Self::Failed(_) => false,
        }
    }
}

impl Serialize for RequestState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("completed", &self.is_completed())?;
        map.serialize_entry("failed", &self.is_failed())?;
        map.serialize_entry("error", &self.error())?;
        map.end()
    }
}

/// Status line and headers of a response, as carried by redirect notifications.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseHead {
    pub status: u16,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub headers: HeaderList,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedirectResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: HeaderList,
    pub redirect_url: String,
}

/// Base fields of a request as announced by the instrumentation channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStart {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: HeaderList,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub resource_type: Option<String>,
    /// Monotonic seconds.
    pub timestamp: f64,
    /// Seconds since the unix epoch, when the channel reports one.
    #[serde(default)]
    pub wall_time: Option<f64>,
    #[serde(default)]
    pub initiator: Option<Value>,
    #[serde(default)]
    pub redirect_response: Option<ResponseHead>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    pub status: u16,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub headers: HeaderList,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub encoded_size: Option<u64>,
    #[serde(default)]
    pub remote_address: Option<String>,
    #[serde(default)]
    pub remote_port: Option<u16>,
    #[serde(default)]
    pub protocol: Option<String>,
}

/// Body bytes delivered by the instrumentation channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseBody {
    pub body: String,
    #[serde(default)]
    pub base64_encoded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub id: String,
    pub context_id: ContextId,
    pub url: String,
    pub method: String,
    pub resource_type: Option<String>,
    /// Milliseconds on the channel's monotonic clock.
    pub request_timestamp: f64,
    pub formatted_time: String,
    pub request_headers: HeaderList,
    pub request_body: Option<String>,
    pub initiator: Option<Value>,
    pub redirect_response: Option<RedirectResponse>,
    pub status: Option<u16>,
    pub status_text: Option<String>,
    pub response_headers: Option<HeaderList>,
    pub mime_type: Option<String>,
    pub response_size: Option<u64>,
    pub remote_address: Option<String>,
    pub remote_port: Option<u16>,
    pub protocol: Option<String>,
    pub response_body: Option<String>,
    pub response_body_truncated: bool,
    pub response_body_is_binary_encoded: bool,
    pub response_body_error: Option<String>,
    #[serde(flatten)]
    pub state: RequestState,
    #[serde(skip)]
    pub(crate) sequence: u64,
    #[serde(skip)]
    pub(crate) body_fetch_requested: bool,
}

impl RequestRecord {
    pub(crate) fn from_start(
        context_id: ContextId,
        id: String,
        start: RequestStart,
        sequence: u64,
    ) -> Self {
        let request_timestamp = start.timestamp * 1000.0;
        let formatted_time = format_clock_time(start.wall_time.unwrap_or(start.timestamp));
        Self {
            id,
            context_id,
            url: start.url,
            method: start.method,
            resource_type: start.resource_type,
            request_timestamp,
            formatted_time,
            request_headers: start.headers,
            request_body: start.body,
            initiator: start.initiator,
            redirect_response: None,
            status: None,
            status_text: None,
            response_headers: None,
            mime_type: None,
            response_size: None,
            remote_address: None,
            remote_port: None,
            protocol: None,
            response_body: None,
            response_body_truncated: false,
            response_body_is_binary_encoded: false,
            response_body_error: None,
            state: RequestState::Pending,
            sequence,
            body_fetch_requested: false,
        }
    }

    pub fn completed(&self) -> bool {
        self.state.is_completed()
    }

    pub fn failed(&self) -> bool {
        self.state.is_failed()
    }

    pub fn error(&self) -> Option<&str> {
        self.state.error()
    }

    pub fn summary(&self) -> RequestSummary {
        RequestSummary {
            id: self.id.clone(),
            url: self.url.clone(),
            method: self.method.clone(),
            resource_type: self.resource_type.clone(),
            status: self.status,
            status_text: self.status_text.clone(),
            mime_type: self.mime_type.clone(),
            response_size: self.response_size,
            formatted_time: self.formatted_time.clone(),
            request_timestamp: self.request_timestamp,
            completed: self.completed(),
            failed: self.failed(),
            error: self.error().map(str::to_owned),
        }
    }
}

/// List projection of a record: no headers, no bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSummary {
    pub id: String,
    pub url: String,
    pub method: String,
    pub resource_type: Option<String>,
    pub status: Option<u16>,
    pub status_text: Option<String>,
    pub mime_type: Option<String>,
    pub response_size: Option<u64>,
    pub formatted_time: String,
    pub request_timestamp: f64,
    pub completed: bool,
    pub failed: bool,
    pub error: Option<String>,
}

/// A response as returned by the replay transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayResponse {
    pub status: u16,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub headers: HeaderList,
    #[serde(default)]
    pub body: String,
}

fn format_clock_time(seconds: f64) -> String {
    if !seconds.is_finite() {
        return String::new();
    }
    let millis = (seconds * 1000.0) as i64;
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|time| time.format("%H:%M:%S").to_string())
        .unwrap_or_default()
}
