// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Error taxonomy shared by the proxy, the session store, and the git layer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("no active session with id {0}")]
    SessionNotActive(String),

    #[error("unable to find a matching recorded entry:\n{0}")]
    NoMatch(String),

    #[error("recording not found: {0}")]
    RecordingNotFound(String),

    #[error("malformed recording {path}: {reason}")]
    MalformedRecording { path: String, reason: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("git {args} exited with code {exit_code}\nstdout: {stdout}\nstderr: {stderr}")]
    GitProcess {
        args: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("git {0} timed out")]
    GitTimeout(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// HTTP status used when the error is surfaced on the control or data plane.
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::SessionNotActive(_) => 404,
            ProxyError::NoMatch(_) => 404,
            ProxyError::RecordingNotFound(_) => 404,
            ProxyError::MalformedRecording { .. } => 400,
            ProxyError::InvalidRequest(_) => 400,
            ProxyError::GitProcess { .. } | ProxyError::GitTimeout(_) => 500,
            ProxyError::Upstream(_) => 502,
            ProxyError::Io(_) => 500,
        }
    }
}
