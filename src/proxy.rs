// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! HTTP proxy server: control-plane endpoints for session lifecycle plus
//! the record/playback data plane.
//!
//! Control plane: `POST /Record/start|stop`, `POST /Playback/start|stop`,
//! `GET /Admin/IsAlive`, and the `POST /Admin/*` session configuration
//! endpoints. Every other request bearing `x-recording-id` and
//! `x-recording-mode` headers is treated as a proxied call: forwarded
//! upstream in record mode, matched against the session in playback mode.

use crate::errors::ProxyError;
use crate::matcher::RecordMatcher;
use crate::record_entry::{RecordEntry, RequestInfo, ResponseInfo};
use crate::sanitize::{BodyKeySanitizer, GeneralRegexSanitizer, HeaderSanitizer, SANITIZED_VALUE};
use crate::session::{Session, SessionMode, SessionStore};
use crate::shutdown::IdleTimer;
use crate::transform::HeaderTransform;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::{service::service_fn, HeaderMap, Method, Request, Response, Uri};
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::Client as LegacyClient;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoConnBuilder;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{error, info, warn};

pub const RECORDING_ID_HEADER: &str = "x-recording-id";
pub const RECORDING_MODE_HEADER: &str = "x-recording-mode";
pub const UPSTREAM_BASE_URI_HEADER: &str = "x-recording-upstream-base-uri";
pub const UNCONSUMED_COUNT_HEADER: &str = "x-unconsumed-entry-count";

/// JSON key naming the recording file in start requests.
const RECORDING_FILE_KEY: &str = "x-recording-file";

/// Per-request escape hatches recovered from SDK usage: skip capturing a
/// request entirely, or leave a matched entry unconsumed.
const RECORDING_SKIP_HEADER: &str = "x-recording-skip";
const RECORDING_REMOVE_HEADER: &str = "x-recording-remove";

type ServiceFuture =
    Pin<Box<dyn Future<Output = Result<Response<BoxBody<Bytes, Infallible>>, Infallible>> + Send>>;

type UpstreamClient = LegacyClient<
    hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>,
    Full<Bytes>,
>;

// RFC 7230 Section 6.1: Hop-by-hop headers must not be forwarded by proxies.
static HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

struct Shared {
    client: UpstreamClient,
    store: SessionStore,
    timer: Arc<IdleTimer>,
}

pub async fn run_proxy(
    listen: SocketAddr,
    store: SessionStore,
    timer: Arc<IdleTimer>,
) -> anyhow::Result<()> {
    // Default behavior: no accept limit (runs forever)
    run_proxy_with_limit(listen, store, timer, None).await
}

/// Testable variant of `run_proxy` that accepts an optional `accept_limit`.
/// When `accept_limit` is `Some(n)`, the accept loop returns after accepting
/// the Nth connection; handlers may still be running at that point.
pub async fn run_proxy_with_limit(
    listen: SocketAddr,
    store: SessionStore,
    timer: Arc<IdleTimer>,
    accept_limit: Option<usize>,
) -> anyhow::Result<()> {
    let https = HttpsConnectorBuilder::new()
        .with_native_roots()?
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();
    let client: UpstreamClient = LegacyClient::builder(TokioExecutor::new()).build(https);

    let shared = Arc::new(Shared {
        client,
        store,
        timer,
    });

    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(%listen, "listening");

    let executor = TokioExecutor::new();
    let server_builder = AutoConnBuilder::new(executor);

    let mut remaining = accept_limit;
    loop {
        if let Some(0) = remaining {
            break;
        }

        let (stream, _remote_addr) = listener.accept().await?;

        if let Some(ref mut n) = remaining {
            *n -= 1;
        }

        let shared = shared.clone();
        let builder_clone = server_builder.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let shared = shared.clone();
                let fut: ServiceFuture = Box::pin(async move { handle_request(req, shared).await });
                fut
            });

            let io = TokioIo::new(stream);
            if let Err(e) = builder_clone.serve_connection(io, service).await {
                error!(%e, "connection error");
            }
        });
    }

    Ok(())
}

async fn handle_request<B>(
    req: Request<B>,
    shared: Arc<Shared>,
) -> Result<Response<BoxBody<Bytes, Infallible>>, Infallible>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    // Any intercepted request resets the idle shutdown countdown.
    shared.timer.ping();

    let result = route(req, shared).await;
    Ok(result.unwrap_or_else(|err| error_response(&err)))
}

async fn route<B>(
    req: Request<B>,
    shared: Arc<Shared>,
) -> Result<Response<BoxBody<Bytes, Infallible>>, ProxyError>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    let is = |target: &str| path.eq_ignore_ascii_case(target);

    if method == Method::GET && is("/Admin/IsAlive") {
        return Ok(empty_response(200));
    }
    if method == Method::POST {
        if is("/Record/start") {
            return record_start(req, &shared).await;
        }
        if is("/Record/stop") {
            return record_stop(req, &shared).await;
        }
        if is("/Playback/start") {
            return playback_start(req, &shared).await;
        }
        if is("/Playback/stop") {
            return playback_stop(req, &shared).await;
        }
        if is("/Admin/SetMatcher") {
            return admin_set_matcher(req, &shared).await;
        }
        if is("/Admin/AddSanitizer") {
            return admin_add_sanitizer(req, &shared).await;
        }
        if is("/Admin/AddTransform") {
            return admin_add_transform(req, &shared).await;
        }
    }

    proxied(req, &shared).await
}

// ── control plane ─────────────────────────────────────────────────────────

async fn record_start<B>(
    req: Request<B>,
    shared: &Shared,
) -> Result<Response<BoxBody<Bytes, Infallible>>, ProxyError>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let recording_file = recording_file_from(req).await?;
    let session = shared.store.start_record(&recording_file);
    Ok(session_response(&session.id))
}

async fn record_stop<B>(
    req: Request<B>,
    shared: &Shared,
) -> Result<Response<BoxBody<Bytes, Infallible>>, ProxyError>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let session_id = require_header(&req, RECORDING_ID_HEADER)?;
    let save = get_header(&req, RECORDING_SKIP_HEADER).as_deref() != Some("request-response");

    let body = collect_body(req.into_body()).await?;
    let variables: BTreeMap<String, String> = if body.is_empty() {
        BTreeMap::new()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ProxyError::InvalidRequest(format!("invalid variables payload: {e}")))?
    };

    shared.store.stop_record(&session_id, variables, save).await?;
    Ok(empty_response(200))
}

async fn playback_start<B>(
    req: Request<B>,
    shared: &Shared,
) -> Result<Response<BoxBody<Bytes, Infallible>>, ProxyError>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let recording_file = recording_file_from(req).await?;
    let (session, variables) = shared.store.start_playback(&recording_file).await?;

    let payload = serde_json::to_vec(&variables).unwrap_or_else(|_| b"{}".to_vec());
    let response = Response::builder()
        .status(200)
        .header(RECORDING_ID_HEADER, session.id.as_str())
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(payload)).boxed());
    Ok(response.unwrap_or_else(|_| empty_response(200)))
}

async fn playback_stop<B>(
    req: Request<B>,
    shared: &Shared,
) -> Result<Response<BoxBody<Bytes, Infallible>>, ProxyError>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let session_id = require_header(&req, RECORDING_ID_HEADER)?;
    let report = shared.store.stop_playback(&session_id).await?;

    if report.unconsumed.is_empty() {
        return Ok(empty_response(200));
    }
    let payload = serde_json::to_vec(&report.unconsumed).unwrap_or_else(|_| b"[]".to_vec());
    let response = Response::builder()
        .status(200)
        .header(UNCONSUMED_COUNT_HEADER, report.unconsumed.len())
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(payload)).boxed());
    Ok(response.unwrap_or_else(|_| empty_response(200)))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct MatcherRequest {
    matcher_type: String,
    compare_bodies: Option<bool>,
    excluded_headers: Option<String>,
    excluded_query_parameters: Option<String>,
}

async fn admin_set_matcher<B>(
    req: Request<B>,
    shared: &Shared,
) -> Result<Response<BoxBody<Bytes, Infallible>>, ProxyError>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let session = resolve_session(&req, shared)?;
    let body = collect_body(req.into_body()).await?;
    let request: MatcherRequest = serde_json::from_slice(&body)
        .map_err(|e| ProxyError::InvalidRequest(format!("invalid matcher payload: {e}")))?;

    let mut matcher = match request.matcher_type.to_ascii_lowercase().as_str() {
        "default" | "" => RecordMatcher::default_matcher(),
        "bodiless" => RecordMatcher::bodiless(),
        "headerless" => RecordMatcher::headerless(),
        "custom" => RecordMatcher::custom(
            request.compare_bodies.unwrap_or(true),
            request.excluded_headers.as_deref().unwrap_or(""),
        ),
        other => {
            return Err(ProxyError::InvalidRequest(format!(
                "unknown matcher type {other:?}"
            )))
        }
    };
    if let Some(params) = &request.excluded_query_parameters {
        matcher = matcher.with_excluded_query_params(params);
    }

    session.set_matcher(matcher);
    Ok(empty_response(200))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct SanitizerRequest {
    sanitizer_type: String,
    headers: Option<String>,
    regex: Option<String>,
    json_path: Option<String>,
    replacement: Option<String>,
}

async fn admin_add_sanitizer<B>(
    req: Request<B>,
    shared: &Shared,
) -> Result<Response<BoxBody<Bytes, Infallible>>, ProxyError>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let session = resolve_session(&req, shared)?;
    let body = collect_body(req.into_body()).await?;
    let request: SanitizerRequest = serde_json::from_slice(&body)
        .map_err(|e| ProxyError::InvalidRequest(format!("invalid sanitizer payload: {e}")))?;
    let replacement = request.replacement.as_deref().unwrap_or(SANITIZED_VALUE);

    match request.sanitizer_type.to_ascii_lowercase().as_str() {
        "header" => {
            let names = request.headers.as_deref().unwrap_or("");
            let names: Vec<&str> = names
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect();
            if names.is_empty() {
                return Err(ProxyError::InvalidRequest(
                    "header sanitizer needs a Headers list".into(),
                ));
            }
            session.add_sanitizer(Box::new(
                HeaderSanitizer::new(&names).with_replacement(replacement),
            ));
        }
        "generalregex" | "general_regex" => {
            let pattern = request.regex.as_deref().ok_or_else(|| {
                ProxyError::InvalidRequest("regex sanitizer needs a Regex".into())
            })?;
            session.add_sanitizer(Box::new(GeneralRegexSanitizer::new(pattern, replacement)?));
        }
        "bodykey" | "body_key" => {
            let json_path = request.json_path.as_deref().ok_or_else(|| {
                ProxyError::InvalidRequest("body key sanitizer needs a JsonPath".into())
            })?;
            session.add_sanitizer(Box::new(
                BodyKeySanitizer::new(json_path).with_replacement(replacement),
            ));
        }
        other => {
            return Err(ProxyError::InvalidRequest(format!(
                "unknown sanitizer type {other:?}"
            )))
        }
    }
    Ok(empty_response(200))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct TransformRequest {
    header: String,
    value: String,
    condition_regex: Option<String>,
}

async fn admin_add_transform<B>(
    req: Request<B>,
    shared: &Shared,
) -> Result<Response<BoxBody<Bytes, Infallible>>, ProxyError>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let session = resolve_session(&req, shared)?;
    let body = collect_body(req.into_body()).await?;
    let request: TransformRequest = serde_json::from_slice(&body)
        .map_err(|e| ProxyError::InvalidRequest(format!("invalid transform payload: {e}")))?;

    let mut transform = HeaderTransform::try_new(&request.header, &request.value)?;
    if let Some(pattern) = &request.condition_regex {
        transform = transform.with_condition_regex(pattern)?;
    }
    session.add_transform(Box::new(transform));
    Ok(empty_response(200))
}

// ── data plane ────────────────────────────────────────────────────────────

async fn proxied<B>(
    req: Request<B>,
    shared: &Shared,
) -> Result<Response<BoxBody<Bytes, Infallible>>, ProxyError>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let session = resolve_session(&req, shared)?;
    let mode = require_header(&req, RECORDING_MODE_HEADER)?;
    if !mode.eq_ignore_ascii_case(session.mode.as_str()) {
        return Err(ProxyError::InvalidRequest(format!(
            "session {} is in {} mode, request says {mode:?}",
            session.id,
            session.mode.as_str()
        )));
    }

    let uri = upstream_uri(&req)?;
    let method = req.method().as_str().to_string();
    let skip = get_header(&req, RECORDING_SKIP_HEADER).as_deref() == Some("request-response");
    let consume = get_header(&req, RECORDING_REMOVE_HEADER).as_deref() != Some("false");
    let headers = outbound_headers(req.headers());

    let body = collect_body(req.into_body()).await?;
    let mut request_info = RequestInfo {
        method,
        uri,
        headers,
        body: if body.is_empty() { None } else { Some(body) },
    };
    // Captured entries store JSON bodies in compact form; normalize the
    // live request the same way so byte comparison lines up in playback.
    request_info.normalize_json_body();

    let response = match session.mode {
        SessionMode::Record => {
            forward_and_record(shared, &session, request_info, skip).await?
        }
        SessionMode::Playback => session.play_entry(&request_info, consume).await?,
    };
    Ok(into_response(response))
}

/// Forward the live request upstream, capture the pair, and hand the
/// response back. With `skip` the exchange is proxied but not captured.
async fn forward_and_record(
    shared: &Shared,
    session: &Arc<Session>,
    request_info: RequestInfo,
    skip: bool,
) -> Result<ResponseInfo, ProxyError> {
    let mut builder = Request::builder()
        .method(request_info.method.as_str())
        .uri(&request_info.uri);
    for (name, value) in request_info.headers.iter() {
        builder = builder.header(name, value);
    }
    let upstream_req = builder
        .body(Full::new(request_info.body.clone().unwrap_or_default()))
        .map_err(|e| ProxyError::InvalidRequest(format!("failed to build upstream request: {e}")))?;

    let resp = shared
        .client
        .request(upstream_req)
        .await
        .map_err(|e| ProxyError::Upstream(e.to_string()))?;

    let status = resp.status().as_u16();
    let headers = strip_hop_by_hop(resp.headers());
    let body = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| ProxyError::Upstream(format!("failed to read upstream body: {e}")))?
        .to_bytes();

    let response_info = ResponseInfo {
        status,
        headers,
        body: if body.is_empty() { None } else { Some(body) },
    };

    if skip {
        return Ok(response_info);
    }

    session
        .record_entry(RecordEntry {
            request: request_info,
            response: response_info.clone(),
        })
        .await;
    Ok(response_info)
}

// ── helpers ───────────────────────────────────────────────────────────────

fn get_header<B>(req: &Request<B>, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn require_header<B>(req: &Request<B>, name: &str) -> Result<String, ProxyError> {
    get_header(req, name)
        .ok_or_else(|| ProxyError::InvalidRequest(format!("missing required header {name}")))
}

fn resolve_session<B>(req: &Request<B>, shared: &Shared) -> Result<Arc<Session>, ProxyError> {
    let session_id = require_header(req, RECORDING_ID_HEADER)?;
    shared.store.resolve(&session_id)
}

/// Recording file named in the start request body (header fallback).
async fn recording_file_from<B>(req: Request<B>) -> Result<String, ProxyError>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    if let Some(file) = get_header(&req, RECORDING_FILE_KEY) {
        return Ok(file);
    }
    let body = collect_body(req.into_body()).await?;
    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| ProxyError::InvalidRequest(format!("invalid start payload: {e}")))?;
    payload
        .get(RECORDING_FILE_KEY)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            ProxyError::InvalidRequest(format!("start payload is missing {RECORDING_FILE_KEY:?}"))
        })
}

async fn collect_body<B>(body: B) -> Result<Bytes, ProxyError>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match body.collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) => {
            let boxed: Box<dyn std::error::Error + Send + Sync> = e.into();
            Err(ProxyError::InvalidRequest(format!(
                "failed to read request body: {boxed}"
            )))
        }
    }
}

/// Rebuild the absolute upstream URI from the request path and the
/// `x-recording-upstream-base-uri` header.
fn upstream_uri<B>(req: &Request<B>) -> Result<String, ProxyError> {
    let base = require_header(req, UPSTREAM_BASE_URI_HEADER)?;
    let parsed: Uri = base.parse().map_err(|_| {
        ProxyError::InvalidRequest(format!(
            "the value in header {UPSTREAM_BASE_URI_HEADER:?} is not a valid URI: {base}"
        ))
    })?;
    let scheme = parsed.scheme_str().ok_or_else(|| {
        ProxyError::InvalidRequest(format!("{UPSTREAM_BASE_URI_HEADER} must carry a scheme"))
    })?;
    let authority = parsed.authority().ok_or_else(|| {
        ProxyError::InvalidRequest(format!("{UPSTREAM_BASE_URI_HEADER} must carry a host"))
    })?;
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    Ok(format!("{scheme}://{authority}{path_and_query}"))
}

/// Headers the data plane forwards and captures: everything except the
/// proxy's own `x-recording-*` controls, `host` (recomputed from the
/// upstream URI), and hop-by-hop headers.
fn outbound_headers(headers: &HeaderMap) -> HeaderMap {
    let connection_hop_headers = parse_connection_tokens(headers.get(hyper::header::CONNECTION));
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        let name_str = name.as_str();
        if name_str.starts_with("x-recording-") || name_str == "host" {
            continue;
        }
        if is_hop_by_hop_header(name_str, &connection_hop_headers) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let connection_hop_headers = parse_connection_tokens(headers.get(hyper::header::CONNECTION));
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        if is_hop_by_hop_header(name.as_str(), &connection_hop_headers) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

// Parse a Connection header value into a lowercased set of tokens
fn parse_connection_tokens(
    val: Option<&hyper::header::HeaderValue>,
) -> std::collections::HashSet<String> {
    let mut set = std::collections::HashSet::new();
    if let Some(conn_val) = val {
        if let Ok(conn_str) = conn_val.to_str() {
            for token in conn_str.split(',') {
                let trimmed = token.trim().to_ascii_lowercase();
                if !trimmed.is_empty() {
                    set.insert(trimmed);
                }
            }
        }
    }
    set
}

fn is_hop_by_hop_header(
    name: &str,
    connection_hop_headers: &std::collections::HashSet<String>,
) -> bool {
    connection_hop_headers.contains(name) || HOP_BY_HOP_HEADERS.contains(&name)
}

fn into_response(info: ResponseInfo) -> Response<BoxBody<Bytes, Infallible>> {
    let mut builder = Response::builder().status(info.status);
    for (name, value) in info.headers.iter() {
        builder = builder.header(name, value);
    }
    let body = info.body.unwrap_or_default();
    builder
        .body(Full::new(body.clone()).boxed())
        .unwrap_or_else(|_| Response::new(Full::new(body).boxed()))
}

fn empty_response(status: u16) -> Response<BoxBody<Bytes, Infallible>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()).boxed())
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new()).boxed()))
}

fn session_response(session_id: &str) -> Response<BoxBody<Bytes, Infallible>> {
    Response::builder()
        .status(200)
        .header(RECORDING_ID_HEADER, session_id)
        .body(Full::new(Bytes::new()).boxed())
        .unwrap_or_else(|_| empty_response(200))
}

fn error_response(err: &ProxyError) -> Response<BoxBody<Bytes, Infallible>> {
    warn!(error = %err, status = err.status_code(), "request failed");
    Response::builder()
        .status(err.status_code())
        .header("content-type", "text/plain")
        .body(Full::new(Bytes::from(err.to_string())).boxed())
        .unwrap_or_else(|_| {
            Response::new(Full::new(Bytes::from("internal error")).boxed())
        })
}
