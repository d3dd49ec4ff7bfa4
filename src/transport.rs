use std::error::Error as StdError;

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{
    HeaderMap, Method, Request, Response, Uri,
    ext::ReasonPhrase,
    header::{self, HeaderName, HeaderValue},
};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};

use crate::{
    model::{HeaderList, ReplayResponse},
    replay::{CredentialsMode, OutboundRequest, ReplayTransport, TransportError, TransportErrorKind},
};

type ReplayHttpsConnector = HttpsConnector<HttpConnector>;
type HttpClient = Client<ReplayHttpsConnector, Full<Bytes>>;

/// Sends replayed requests over hyper's pooled client, speaking both http and https.
#[derive(Clone)]
pub struct HyperTransport {
    client: HttpClient,
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperTransport").finish_non_exhaustive()
    }
}

impl HyperTransport {
    pub fn new() -> anyhow::Result<Self> {
        ensure_rustls_crypto_provider()?;
        let connector = build_https_connector();
        Ok(Self {
            client: Client::builder(TokioExecutor::new()).build(connector),
        })
    }
}

fn ensure_rustls_crypto_provider() -> anyhow::Result<()> {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return Ok(());
    }

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err(anyhow::anyhow!("install rustls ring crypto provider"));
    }
    Ok(())
}

fn build_https_connector() -> ReplayHttpsConnector {
    match HttpsConnectorBuilder::new().with_native_roots() {
        Ok(builder) => builder.https_or_http().enable_http1().enable_http2().build(),
        Err(err) => {
            tracing::warn!("native TLS roots unavailable, using bundled roots: {err}");
            HttpsConnectorBuilder::new()
                .with_webpki_roots()
                .https_or_http()
                .enable_http1()
                .enable_http2()
                .build()
        }
    }
}

impl ReplayTransport for HyperTransport {
    async fn send(&self, request: OutboundRequest) -> Result<ReplayResponse, TransportError> {
        let hyper_request = build_hyper_request(request)?;
        let response = self
            .client
            .request(hyper_request)
            .await
            .map_err(|err| TransportError::new(TransportErrorKind::Network, error_chain(&err)))?;

        let status_text = status_text(&response);
        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|err| TransportError::new(TransportErrorKind::Body, error_chain(&err)))?
            .to_bytes();

        let mut headers = HeaderList::new();
        for (name, value) in &parts.headers {
            headers.push(
                name.as_str(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            );
        }
        Ok(ReplayResponse {
            status: parts.status.as_u16(),
            status_text,
            headers,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}

/// The reason phrase the server sent, else the registered one for the code.
fn status_text<B>(response: &Response<B>) -> String {
    match response.extensions().get::<ReasonPhrase>() {
        Some(reason) => String::from_utf8_lossy(reason.as_bytes()).into_owned(),
        None => response
            .status()
            .canonical_reason()
            .unwrap_or_default()
            .to_owned(),
    }
}

fn build_hyper_request(request: OutboundRequest) -> Result<Request<Full<Bytes>>, TransportError> {
    let invalid = |message: String| TransportError::new(TransportErrorKind::InvalidRequest, message);

    let method = Method::from_bytes(request.method.as_bytes())
        .map_err(|err| invalid(format!("invalid method `{}`: {err}", request.method)))?;
    let uri: Uri = request
        .url
        .parse()
        .map_err(|err| invalid(format!("invalid URL `{}`: {err}", request.url)))?;
    if !matches!(uri.scheme_str(), Some("http" | "https")) || uri.authority().is_none() {
        return Err(invalid(format!(
            "URL `{}` must be absolute http(s)",
            request.url
        )));
    }

    let mut headers = HeaderMap::new();
    for entry in &request.headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(entry.name.as_bytes()),
            HeaderValue::from_str(&entry.value),
        ) else {
            tracing::warn!(header = %entry.name, "transport dropped unrepresentable header");
            continue;
        };
        headers.append(name, value);
    }
    strip_transport_managed_headers(&mut headers);
    if request.credentials == CredentialsMode::Omit {
        headers.remove(header::COOKIE);
        headers.remove(header::AUTHORIZATION);
    }

    let body = request.body.map(Bytes::from).unwrap_or_default();
    let mut hyper_request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Full::new(body))
        .map_err(|err| invalid(format!("build request: {err}")))?;
    *hyper_request.headers_mut() = headers;
    Ok(hyper_request)
}

/// Removes headers the client computes itself: framing, `Host` and hop-by-hop fields.
fn strip_transport_managed_headers(headers: &mut HeaderMap) {
    let mut to_remove = Vec::new();
    for value in headers.get_all(header::CONNECTION).iter() {
        let Ok(value) = value.to_str() else { continue };
        for name in value.split(',') {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            to_remove.push(header_name);
        }
    }
    for header_name in to_remove {
        headers.remove(header_name);
    }

    const MANAGED: &[&str] = &[
        "connection",
        "content-length",
        "host",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "proxy-connection",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
    ];
    for header_name in MANAGED {
        headers.remove(*header_name);
    }
}

fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
