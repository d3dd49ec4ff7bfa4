//! Raw HTTP/1.1-style text <-> structured request/response.
//!
//! Parsing is lenient: malformed header lines are skipped rather than rejected, and
//! the only hard failures are a missing request line/target and a relative target whose host
//! cannot be recovered from `Host`, `Origin` or `Referer`.

use std::collections::HashMap;

use hyper::Uri;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{HeaderList, ReplayResponse, RequestRecord};

const DEFAULT_SCHEME: &str = "http";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedRequest {
    pub method: String,
    pub url: String,
    pub headers: HeaderList,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    Empty,
    MissingRequestTarget,
    UnresolvableHost,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "request text is empty"),
            Self::MissingRequestTarget => {
                write!(f, "request line needs a method and a target")
            }
            Self::UnresolvableHost => write!(
                f,
                "relative target without a usable Host, Origin or Referer header"
            ),
        }
    }
}

impl std::error::Error for ParseError {}

/// Parses raw request text, returning `None` when it cannot be replayed.
pub fn parse_raw_request(raw: &str) -> Option<ParsedRequest> {
    try_parse_raw_request(raw).ok()
}

pub fn try_parse_raw_request(raw: &str) -> Result<ParsedRequest, ParseError> {
    if raw.is_empty() {
        return Err(ParseError::Empty);
    }

    let (head, body) = match find_head_separator(raw) {
        Some((start, end)) => (&raw[..start], &raw[end..]),
        None => (raw, ""),
    };
    let lines: Vec<&str> = head
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .collect();

    let request_line_index = lines
        .iter()
        .position(|line| !line.trim().is_empty())
        .ok_or(ParseError::Empty)?;
    let mut parts = lines[request_line_index].split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return Err(ParseError::MissingRequestTarget);
    };

    let headers = parse_header_lines(&lines[request_line_index + 1..]);
    let url = resolve_url(target, &headers)?;

    Ok(ParsedRequest {
        method: method.to_owned(),
        url,
        headers: headers.into_list(),
        body: body.to_owned(),
    })
}

/// Locates the first blank line, tolerating both CRLF and bare LF. Returns the byte range of
/// the separator itself.
fn find_head_separator(raw: &str) -> Option<(usize, usize)> {
    let bytes = raw.as_bytes();
    for (index, byte) in bytes.iter().enumerate() {
        if *byte != b'\n' {
            continue;
        }
        let end = match bytes.get(index + 1..) {
            Some([b'\n', ..]) => index + 2,
            Some([b'\r', b'\n', ..]) => index + 3,
            _ => continue,
        };
        let start = if index > 0 && bytes[index - 1] == b'\r' {
            index - 1
        } else {
            index
        };
        return Some((start, end));
    }
    None
}

/// Ordered headers plus a case-insensitive index of where each name occurs.
///
/// The index points into the list, so a folded continuation is visible through lookups as soon
/// as it is appended.
struct ParsedHeaders {
    list: Vec<(String, String)>,
    positions: HashMap<String, Vec<usize>>,
}

impl ParsedHeaders {
    fn first(&self, name: &str) -> &str {
        self.positions
            .get(name)
            .and_then(|positions| positions.first())
            .map(|&index| self.list[index].1.as_str())
            .unwrap_or("")
    }

    fn into_list(self) -> HeaderList {
        let mut headers = HeaderList::new();
        for (name, value) in self.list {
            headers.push(name, value);
        }
        headers
    }
}

fn parse_header_lines(lines: &[&str]) -> ParsedHeaders {
    let mut list: Vec<(String, String)> = Vec::new();
    let mut positions: HashMap<String, Vec<usize>> = HashMap::new();

    for line in lines {
        if line.is_empty() {
            continue;
        }
        let folded = line.starts_with(|c: char| c.is_whitespace());
        if folded && let Some(last) = list.last_mut() {
            let continuation = line.trim();
            if !continuation.is_empty() {
                last.1.push(' ');
                last.1.push_str(continuation);
            }
            continue;
        }

        let Some(colon) = line.find(':') else {
            continue;
        };
        if colon == 0 {
            continue;
        }
        let name = line[..colon].trim();
        let value = line[colon + 1..].trim();
        positions
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(list.len());
        list.push((name.to_owned(), value.to_owned()));
    }

    ParsedHeaders { list, positions }
}

/// `scheme://` prefix with a syntactically valid scheme, whatever the scheme is.
fn split_scheme(target: &str) -> Option<(&str, &str)> {
    let (scheme, rest) = target.split_once("://")?;
    let mut chars = scheme.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    valid.then_some((scheme, rest))
}

fn resolve_url(target: &str, headers: &ParsedHeaders) -> Result<String, ParseError> {
    if split_scheme(target).is_some() {
        return Ok(target.to_owned());
    }

    let origin = absolute_url_parts(headers.first("origin"));
    let referer = absolute_url_parts(headers.first("referer"));

    let host = Some(headers.first("host"))
        .filter(|host| !host.is_empty())
        .map(str::to_owned)
        .or_else(|| origin.as_ref().map(|parts| parts.host.clone()))
        .or_else(|| referer.as_ref().map(|parts| parts.host.clone()))
        .filter(|host| !host.is_empty())
        .ok_or(ParseError::UnresolvableHost)?;

    let scheme = infer_scheme(
        origin.as_ref(),
        referer.as_ref(),
        headers.first("x-forwarded-proto"),
        &host,
    );
    let path = if target.starts_with('/') {
        target.to_owned()
    } else {
        format!("/{target}")
    };
    Ok(format!("{scheme}://{host}{path}"))
}

/// Scheme fallback order: Origin, Referer, X-Forwarded-Proto, explicit :443/:80 on the host,
/// then plain http.
fn infer_scheme(
    origin: Option<&UrlParts>,
    referer: Option<&UrlParts>,
    forwarded_proto: &str,
    host: &str,
) -> String {
    if let Some(parts) = origin.or(referer) {
        return parts.scheme.clone();
    }
    if !forwarded_proto.is_empty() {
        return forwarded_proto.to_owned();
    }
    match explicit_port(host) {
        Some("443") => "https".to_owned(),
        _ => DEFAULT_SCHEME.to_owned(),
    }
}

fn explicit_port(host: &str) -> Option<&str> {
    let (_, port) = host.rsplit_once(':')?;
    (!port.is_empty() && port.bytes().all(|b| b.is_ascii_digit())).then_some(port)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct UrlParts {
    scheme: String,
    /// Host with the port only when it is not the scheme default.
    host: String,
    path_and_query: String,
}

fn absolute_url_parts(value: &str) -> Option<UrlParts> {
    let value = value.split('#').next().unwrap_or(value);
    if value.is_empty() {
        return None;
    }
    match value.parse::<Uri>() {
        Ok(uri) => uri_parts(&uri),
        Err(_) => lenient_url_parts(value),
    }
}

fn uri_parts(uri: &Uri) -> Option<UrlParts> {
    let scheme = uri.scheme_str()?.to_ascii_lowercase();
    let authority = uri.authority()?;
    let host = host_with_port(&scheme, authority.host(), authority.port_u16());
    let path_and_query =
        normalize_path_and_query(uri.path_and_query().map_or("", |pq| pq.as_str()));
    Some(UrlParts {
        scheme,
        host,
        path_and_query,
    })
}

/// Splits URLs `Uri` refuses (quotes, spaces, braces in the query) on `://` and the next `/`.
fn lenient_url_parts(value: &str) -> Option<UrlParts> {
    let (scheme, rest) = split_scheme(value)?;
    let scheme = scheme.to_ascii_lowercase();
    let authority_end = rest.find(['/', '?']).unwrap_or(rest.len());
    let (authority, path_and_query) = rest.split_at(authority_end);
    let authority = authority
        .rsplit_once('@')
        .map_or(authority, |(_, host_port)| host_port);
    if authority.is_empty() {
        return None;
    }

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port))
            if !port.is_empty()
                && port.bytes().all(|b| b.is_ascii_digit())
                && (!host.contains('[') || host.ends_with(']')) =>
        {
            (host, Some(port.parse::<u16>().ok()?))
        }
        _ => (authority, None),
    };
    Some(UrlParts {
        host: host_with_port(&scheme, host, port),
        scheme,
        path_and_query: normalize_path_and_query(path_and_query),
    })
}

fn normalize_path_and_query(path_and_query: &str) -> String {
    match path_and_query {
        "" => "/".to_owned(),
        query if query.starts_with('?') => format!("/{query}"),
        path => path.to_owned(),
    }
}

fn host_with_port(scheme: &str, host: &str, port: Option<u16>) -> String {
    let default_port = match scheme {
        "http" | "ws" => Some(80),
        "https" | "wss" => Some(443),
        _ => None,
    };
    match port {
        Some(port) if Some(port) != default_port => format!("{host}:{port}"),
        _ => host.to_owned(),
    }
}

/// Anything that can seed a replay workspace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestDraft {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub request_headers: HeaderList,
    #[serde(default)]
    pub request_body: Option<Value>,
}

impl From<&RequestRecord> for RequestDraft {
    fn from(record: &RequestRecord) -> Self {
        Self {
            method: record.method.clone(),
            url: record.url.clone(),
            request_headers: record.request_headers.clone(),
            request_body: record.request_body.clone().map(Value::String),
        }
    }
}

/// Rebuilds request text: request line, `Host` first, remaining headers in their original order,
/// blank line, body.
///
/// The request line uses origin-form unless the headers would lead a re-parse to a different
/// scheme, in which case the absolute URL is written so the text still targets the same place.
pub fn build_raw_request(draft: &RequestDraft) -> String {
    let url_parts = absolute_url_parts(&draft.url);
    let declared_host = draft
        .request_headers
        .first("host")
        .filter(|host| !host.is_empty());
    let host = url_parts
        .as_ref()
        .map(|parts| parts.host.as_str())
        .or(declared_host);

    let target = match url_parts.as_ref() {
        Some(parts) => {
            let origin = absolute_url_parts(draft.request_headers.first("origin").unwrap_or(""));
            let referer =
                absolute_url_parts(draft.request_headers.first("referer").unwrap_or(""));
            let inferred = infer_scheme(
                origin.as_ref(),
                referer.as_ref(),
                draft.request_headers.first("x-forwarded-proto").unwrap_or(""),
                &parts.host,
            );
            if inferred.eq_ignore_ascii_case(&parts.scheme) {
                parts.path_and_query.clone()
            } else {
                format!("{}://{}{}", parts.scheme, parts.host, parts.path_and_query)
            }
        }
        None => draft.url.clone(),
    };

    let mut raw = format!("{} {} HTTP/1.1\r\n", draft.method, target);
    if let Some(host) = host {
        raw.push_str(&format!("Host: {host}\r\n"));
    }
    for header in &draft.request_headers {
        if header.name.is_empty() || header.name.eq_ignore_ascii_case("host") {
            continue;
        }
        push_header_line(&mut raw, &header.name, &header.value);
    }
    raw.push_str("\r\n");

    match &draft.request_body {
        None | Some(Value::Null) => {}
        Some(Value::String(text)) => raw.push_str(text),
        Some(structured) => raw.push_str(&structured.to_string()),
    }
    raw
}

pub fn build_raw_response(response: &ReplayResponse) -> String {
    let mut raw = format!("HTTP/1.1 {} {}\r\n", response.status, response.status_text);
    for header in &response.headers {
        push_header_line(&mut raw, &header.name, &header.value);
    }
    raw.push_str("\r\n");
    raw.push_str(&response.body);
    raw
}

fn push_header_line(raw: &mut String, name: &str, value: &str) {
    raw.push_str(name);
    raw.push_str(": ");
    raw.push_str(value);
    raw.push_str("\r\n");
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        ParseError, ParsedRequest, RequestDraft, build_raw_request, build_raw_response,
        parse_raw_request, try_parse_raw_request,
    };
    use crate::model::{HeaderList, ReplayResponse};

    fn headers(pairs: &[(&str, &str)]) -> HeaderList {
        let mut list = HeaderList::new();
        for (name, value) in pairs {
            list.push(*name, *value);
        }
        list
    }

    #[test]
    fn rejects_structurally_broken_input() {
        assert_eq!(parse_raw_request(""), None);
        assert_eq!(parse_raw_request("\r\n\r\n"), None);
        assert_eq!(
            try_parse_raw_request("GET\r\n\r\n"),
            Err(ParseError::MissingRequestTarget)
        );
        assert_eq!(
            try_parse_raw_request("GET /x HTTP/1.1\r\nAccept: */*\r\n\r\n"),
            Err(ParseError::UnresolvableHost)
        );
    }

    #[test]
    fn parses_minimal_request() {
        let parsed = parse_raw_request("GET /x HTTP/1.1\r\nHost: a.test\r\n\r\n").unwrap();
        assert_eq!(
            parsed,
            ParsedRequest {
                method: "GET".to_owned(),
                url: "http://a.test/x".to_owned(),
                headers: headers(&[("Host", "a.test")]),
                body: String::new(),
            }
        );
    }

    #[test]
    fn body_is_kept_verbatim_after_first_blank_line() {
        let raw = "POST /submit HTTP/1.1\nHost: a.test\n\n{\"a\":1}\r\n\r\ntrailing";
        let parsed = parse_raw_request(raw).unwrap();
        assert_eq!(parsed.body, "{\"a\":1}\r\n\r\ntrailing");
        assert_eq!(parsed.method, "POST");
    }

    #[test]
    fn leading_blank_lines_before_request_line_are_skipped() {
        let parsed = parse_raw_request("   \r\nGET /y HTTP/1.1\r\nHost: b.test\r\n\r\n").unwrap();
        assert_eq!(parsed.url, "http://b.test/y");
    }

    #[test]
    fn folded_headers_extend_previous_value_and_lookups() {
        let raw = "GET /p HTTP/1.1\r\nX-Long: first\r\n  second\r\n\tthird\r\nHost: c.test\r\n\r\n";
        let parsed = parse_raw_request(raw).unwrap();
        assert_eq!(parsed.headers.first("x-long"), Some("first second third"));
        assert_eq!(parsed.headers.len(), 2);

        let raw = "GET /p HTTP/1.1\r\nHost: d.test\r\n :8443\r\n\r\n";
        let parsed = parse_raw_request(raw).unwrap();
        assert_eq!(parsed.url, "http://d.test :8443/p");
    }

    #[test]
    fn malformed_header_lines_are_skipped() {
        let raw = "GET /p HTTP/1.1\r\nnot a header\r\n: empty-name\r\nHost: e.test\r\n\r\n";
        let parsed = parse_raw_request(raw).unwrap();
        assert_eq!(parsed.headers, headers(&[("Host", "e.test")]));
    }

    #[test]
    fn duplicate_host_uses_first_occurrence() {
        let raw = "GET /p HTTP/1.1\r\nhost: first.test\r\nHost: second.test\r\n\r\n";
        let parsed = parse_raw_request(raw).unwrap();
        assert_eq!(parsed.url, "http://first.test/p");
        assert_eq!(parsed.headers.len(), 2);
    }

    #[test]
    fn absolute_target_is_used_as_is() {
        let raw = "GET HTTPS://other.test/abs?q=1 HTTP/1.1\r\nHost: ignored.test\r\n\r\n";
        let parsed = parse_raw_request(raw).unwrap();
        assert_eq!(parsed.url, "HTTPS://other.test/abs?q=1");
    }

    #[test]
    fn absolute_target_keeps_any_scheme() {
        let raw = "GET wss://a.test/socket HTTP/1.1\r\nHost: a.test\r\n\r\n";
        assert_eq!(parse_raw_request(raw).unwrap().url, "wss://a.test/socket");

        let raw = "GET 1x://a.test/p HTTP/1.1\r\nHost: a.test\r\n\r\n";
        assert_eq!(
            parse_raw_request(raw).unwrap().url,
            "http://a.test/1x://a.test/p"
        );
    }

    #[test]
    fn host_falls_back_to_origin_then_referer() {
        let raw = "GET api HTTP/1.1\r\nOrigin: https://o.test:8443\r\n\r\n";
        assert_eq!(
            parse_raw_request(raw).unwrap().url,
            "https://o.test:8443/api"
        );

        let raw = "GET /r HTTP/1.1\r\nReferer: https://ref.test/page?x=1\r\n\r\n";
        assert_eq!(parse_raw_request(raw).unwrap().url, "https://ref.test/r");
    }

    #[test]
    fn scheme_fallback_order_is_preserved() {
        // Origin wins over a conflicting X-Forwarded-Proto.
        let raw = "GET / HTTP/1.1\r\nHost: a.test\r\nOrigin: http://a.test\r\nX-Forwarded-Proto: https\r\n\r\n";
        assert_eq!(parse_raw_request(raw).unwrap().url, "http://a.test/");

        let raw = "GET / HTTP/1.1\r\nHost: a.test\r\nReferer: https://a.test/x\r\nX-Forwarded-Proto: http\r\n\r\n";
        assert_eq!(parse_raw_request(raw).unwrap().url, "https://a.test/");

        let raw = "GET / HTTP/1.1\r\nHost: a.test:80\r\nX-Forwarded-Proto: https\r\n\r\n";
        assert_eq!(parse_raw_request(raw).unwrap().url, "https://a.test:80/");

        let raw = "GET / HTTP/1.1\r\nHost: a.test:443\r\n\r\n";
        assert_eq!(parse_raw_request(raw).unwrap().url, "https://a.test:443/");

        let raw = "GET / HTTP/1.1\r\nHost: a.test:8080\r\nOrigin: not a url\r\n\r\n";
        assert_eq!(parse_raw_request(raw).unwrap().url, "http://a.test:8080/");
    }

    #[test]
    fn build_request_puts_host_first_and_skips_duplicates() {
        let draft = RequestDraft {
            method: "POST".to_owned(),
            url: "http://a.test:8080/p?q=1#frag".to_owned(),
            request_headers: headers(&[
                ("Accept", "*/*"),
                ("Host", "stale.test"),
                ("Content-Type", "application/json"),
            ]),
            request_body: Some(json!({"k": "v"})),
        };
        let raw = build_raw_request(&draft);
        assert_eq!(
            raw,
            "POST /p?q=1 HTTP/1.1\r\nHost: a.test:8080\r\nAccept: */*\r\nContent-Type: application/json\r\n\r\n{\"k\":\"v\"}"
        );
    }

    #[test]
    fn build_request_falls_back_to_declared_host_for_unparsable_url() {
        let draft = RequestDraft {
            method: "GET".to_owned(),
            url: "not a url".to_owned(),
            request_headers: headers(&[("host", "h.test")]),
            request_body: None,
        };
        assert_eq!(
            build_raw_request(&draft),
            "GET not a url HTTP/1.1\r\nHost: h.test\r\n\r\n"
        );
    }

    #[test]
    fn build_request_writes_host_for_urls_uri_rejects() {
        let draft = RequestDraft {
            method: "GET".to_owned(),
            url: "https://a.test/p?q=\"x\"".to_owned(),
            request_headers: headers(&[("Accept", "*/*")]),
            request_body: None,
        };
        assert_eq!(
            build_raw_request(&draft),
            "GET /p?q=\"x\" HTTP/1.1\r\nHost: a.test\r\nAccept: */*\r\n\r\n"
        );

        let draft = RequestDraft {
            method: "GET".to_owned(),
            url: "http://user@b.test:8080/a b".to_owned(),
            request_headers: HeaderList::new(),
            request_body: None,
        };
        assert_eq!(
            build_raw_request(&draft),
            "GET /a b HTTP/1.1\r\nHost: b.test:8080\r\n\r\n"
        );
    }

    #[test]
    fn build_then_parse_round_trips_target() {
        let cases = [
            ("GET", "https://a.test/x?y=1", vec![("Accept", "text/html")]),
            (
                "POST",
                "https://a.test/form",
                vec![("Origin", "https://a.test"), ("Cookie", "a=1")],
            ),
            ("PUT", "http://b.test:8080/", vec![("X-Forwarded-Proto", "https")]),
            ("DELETE", "http://c.test/item/1", vec![]),
        ];
        for (method, url, pairs) in cases {
            let draft = RequestDraft {
                method: method.to_owned(),
                url: url.to_owned(),
                request_headers: headers(&pairs),
                request_body: None,
            };
            let parsed = parse_raw_request(&build_raw_request(&draft)).unwrap();
            assert_eq!(parsed.method, method);
            assert_eq!(parsed.url, url, "round trip of {url}");
            for (name, value) in &pairs {
                assert_eq!(parsed.headers.first(name), Some(*value));
            }
        }
    }

    #[test]
    fn build_response_writes_status_headers_and_body() {
        let response = ReplayResponse {
            status: 404,
            status_text: "Not Found".to_owned(),
            headers: headers(&[("content-type", "text/plain")]),
            body: "missing".to_owned(),
        };
        assert_eq!(
            build_raw_response(&response),
            "HTTP/1.1 404 Not Found\r\ncontent-type: text/plain\r\n\r\nmissing"
        );
    }
}
