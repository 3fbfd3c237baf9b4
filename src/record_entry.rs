// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Canonical record entry struct and the on-disk recording format.
//!
//! A recording file is a single JSON document:
//! `{"Entries": [...], "Variables": {...}}`. Text bodies are stored as
//! strings, JSON bodies are embedded directly, everything else is base64.

use crate::errors::ProxyError;
use bytes::Bytes;
use hyper::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

/// Request half of a captured request/response pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub method: String,
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

/// Response half of a captured request/response pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseInfo {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

/// One captured request/response pair. Immutable once captured; playback
/// consumption state lives in the owning session, not on the entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordEntry {
    pub request: RequestInfo,
    pub response: ResponseInfo,
}

/// Ordered entry list plus session-level variables recorded by the client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordSession {
    #[serde(rename = "Entries", default)]
    pub entries: Vec<RecordEntry>,

    #[serde(rename = "Variables", default)]
    pub variables: BTreeMap<String, String>,
}

impl RecordSession {
    /// Load a recording file. Missing file and unparsable content are
    /// distinct failures so session start can report them precisely.
    pub async fn load(path: &Path) -> Result<Self, ProxyError> {
        let display = path.display().to_string();
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProxyError::RecordingNotFound(display));
            }
            Err(e) => return Err(e.into()),
        };
        let mut session: RecordSession =
            serde_json::from_slice(&raw).map_err(|e| ProxyError::MalformedRecording {
                path: display,
                reason: e.to_string(),
            })?;
        for entry in &mut session.entries {
            entry.normalize_json_bodies();
        }
        Ok(session)
    }

    /// Serialize to `path` atomically (temp file + rename) so an interrupted
    /// stop never leaves a half-written recording behind.
    pub async fn save(&self, path: &Path) -> Result<(), ProxyError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(self).map_err(|e| {
            ProxyError::MalformedRecording {
                path: path.display().to_string(),
                reason: e.to_string(),
            }
        })?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

impl RequestInfo {
    /// Re-serialize a JSON body in compact form so byte comparison stays
    /// stable across capture, reload, and live playback requests.
    pub fn normalize_json_body(&mut self) {
        normalize_json_body_parts(&mut self.headers, &mut self.body);
    }
}

impl ResponseInfo {
    pub fn normalize_json_body(&mut self) {
        normalize_json_body_parts(&mut self.headers, &mut self.body);
    }
}

impl RecordEntry {
    pub fn normalize_json_bodies(&mut self) {
        self.request.normalize_json_body();
        self.response.normalize_json_body();
    }
}

/// First `content-type` header value, if readable.
pub fn content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(hyper::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Whether the body should be treated as text in the recording file.
pub fn is_text_content_type(headers: &HeaderMap) -> bool {
    match content_type(headers) {
        Some(ct) => {
            let ct = ct.to_ascii_lowercase();
            ct.starts_with("text/")
                || ct.contains("json")
                || ct.contains("xml")
                || ct.contains("html")
                || ct.contains("urlencoded")
        }
        None => false,
    }
}

pub fn is_json_content_type(headers: &HeaderMap) -> bool {
    content_type(headers)
        .map(|ct| ct.to_ascii_lowercase().contains("json"))
        .unwrap_or(false)
}

/// Rewrite `Content-Length` after a body mutation, but only when the header
/// was already present.
pub fn update_content_length(headers: &mut HeaderMap, len: usize) {
    if headers.contains_key(hyper::header::CONTENT_LENGTH) {
        if let Ok(value) = len.to_string().parse() {
            headers.insert(hyper::header::CONTENT_LENGTH, value);
        }
    }
}

fn normalize_json_body_parts(headers: &mut HeaderMap, body: &mut Option<Bytes>) {
    if !is_json_content_type(headers) {
        return;
    }
    if let Some(bytes) = body.as_ref() {
        if let Ok(value) = serde_json::from_slice::<Value>(bytes) {
            // Arrays and bare strings keep their original text form, same
            // as the serializer below.
            if !matches!(value, Value::Array(_) | Value::String(_) | Value::Null) {
                if let Ok(compact) = serde_json::to_vec(&value) {
                    let len = compact.len();
                    *body = Some(Bytes::from(compact));
                    update_content_length(headers, len);
                }
            }
        }
    }
}

// ── wire format ───────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct WireEntry {
    #[serde(rename = "RequestUri")]
    request_uri: String,

    #[serde(rename = "RequestMethod")]
    request_method: String,

    #[serde(
        rename = "RequestHeaders",
        serialize_with = "crate::serde_helpers::serialize_headers",
        deserialize_with = "crate::serde_helpers::deserialize_headers"
    )]
    request_headers: HeaderMap,

    #[serde(rename = "RequestBody", default)]
    request_body: Value,

    #[serde(rename = "StatusCode")]
    status_code: u16,

    #[serde(
        rename = "ResponseHeaders",
        serialize_with = "crate::serde_helpers::serialize_headers",
        deserialize_with = "crate::serde_helpers::deserialize_headers"
    )]
    response_headers: HeaderMap,

    #[serde(rename = "ResponseBody", default)]
    response_body: Value,
}

fn encode_body(headers: &HeaderMap, body: &Option<Bytes>) -> Value {
    let bytes = match body {
        None => return Value::Null,
        Some(b) if b.is_empty() => return Value::Array(Vec::new()),
        Some(b) => b,
    };

    if is_json_content_type(headers) {
        if let Ok(value) = serde_json::from_slice::<Value>(bytes) {
            // Arrays and strings fall through to plain-text storage so a
            // body that happens to be a JSON string literal still round
            // trips byte-for-byte.
            if !matches!(value, Value::Array(_) | Value::String(_) | Value::Null) {
                return value;
            }
        }
    }

    if is_text_content_type(headers) {
        if let Ok(text) = std::str::from_utf8(bytes) {
            return Value::String(text.to_string());
        }
    }

    use base64::Engine;
    Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
}

fn decode_body(headers: &HeaderMap, value: Value) -> Result<Option<Bytes>, String> {
    match value {
        Value::Null => Ok(None),
        Value::Array(items) if items.is_empty() => Ok(Some(Bytes::new())),
        Value::Array(items) => {
            // Older recordings split long text bodies across array items.
            let mut text = String::new();
            for item in items {
                match item.as_str() {
                    Some(s) => text.push_str(s),
                    None => return Err("body array items must be strings".into()),
                }
            }
            Ok(Some(Bytes::from(text)))
        }
        Value::String(s) => {
            if is_text_content_type(headers) {
                Ok(Some(Bytes::from(s)))
            } else {
                use base64::Engine;
                base64::engine::general_purpose::STANDARD
                    .decode(s.as_bytes())
                    .map(|b| Some(Bytes::from(b)))
                    .map_err(|e| format!("invalid base64 body: {e}"))
            }
        }
        other => {
            // Embedded JSON value; store the compact rendering.
            serde_json::to_vec(&other)
                .map(|b| Some(Bytes::from(b)))
                .map_err(|e| e.to_string())
        }
    }
}

impl Serialize for RecordEntry {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let wire = WireEntry {
            request_uri: self.request.uri.clone(),
            request_method: self.request.method.clone(),
            request_headers: self.request.headers.clone(),
            request_body: encode_body(&self.request.headers, &self.request.body),
            status_code: self.response.status,
            response_headers: self.response.headers.clone(),
            response_body: encode_body(&self.response.headers, &self.response.body),
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RecordEntry {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let wire = WireEntry::deserialize(deserializer)?;
        let request_body =
            decode_body(&wire.request_headers, wire.request_body).map_err(serde::de::Error::custom)?;
        let response_body = decode_body(&wire.response_headers, wire.response_body)
            .map_err(serde::de::Error::custom)?;
        Ok(RecordEntry {
            request: RequestInfo {
                method: wire.request_method,
                uri: wire.request_uri,
                headers: wire.request_headers,
                body: request_body,
            },
            response: ResponseInfo {
                status: wire.status_code,
                headers: wire.response_headers,
                body: response_body,
            },
        })
    }
}
