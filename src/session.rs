// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Session management for record and playback contexts.
//!
//! Cross-session state lives in a concurrency-safe map; each session owns
//! its record session exclusively and serializes entry-list mutation
//! (append on record, match-and-consume on playback) behind one async
//! mutex. Requests against different sessions never block each other.

use crate::errors::ProxyError;
use crate::matcher::RecordMatcher;
use crate::record_entry::{RecordEntry, RecordSession, RequestInfo, ResponseInfo};
use crate::sanitize::{self, Sanitizer};
use crate::transform::{self, ResponseTransform};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Record,
    Playback,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Record => "record",
            SessionMode::Playback => "playback",
        }
    }
}

struct SessionState {
    recording: RecordSession,
    consumed: Vec<bool>,
}

/// One record or playback context, identified by an opaque id.
pub struct Session {
    pub id: String,
    pub mode: SessionMode,
    pub recording_path: PathBuf,
    state: tokio::sync::Mutex<SessionState>,
    matcher: Mutex<RecordMatcher>,
    sanitizers: Mutex<Vec<Box<dyn Sanitizer>>>,
    transforms: Mutex<Vec<Box<dyn ResponseTransform>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("recording_path", &self.recording_path)
            .finish_non_exhaustive()
    }
}

impl Session {
    fn new(mode: SessionMode, recording_path: PathBuf, recording: RecordSession) -> Self {
        let consumed = vec![false; recording.entries.len()];
        Self {
            id: Uuid::new_v4().to_string(),
            mode,
            recording_path,
            state: tokio::sync::Mutex::new(SessionState {
                recording,
                consumed,
            }),
            matcher: Mutex::new(RecordMatcher::default_matcher()),
            sanitizers: Mutex::new(sanitize::default_sanitizers()),
            transforms: Mutex::new(transform::default_transforms()),
        }
    }

    /// Record mode: sanitize the captured pair and append it.
    pub async fn record_entry(&self, mut entry: RecordEntry) {
        {
            let sanitizers = self.lock_component(&self.sanitizers);
            sanitize::apply_all(&sanitizers, &mut entry);
        }
        entry.normalize_json_bodies();
        let mut state = self.state.lock().await;
        state.recording.entries.push(entry);
        state.consumed.push(false);
    }

    /// Playback mode: select the best unconsumed entry, mark it consumed
    /// (unless reuse is allowed or the caller opted out), and return its
    /// transformed response.
    pub async fn play_entry(
        &self,
        request: &RequestInfo,
        consume: bool,
    ) -> Result<ResponseInfo, ProxyError> {
        let mut response = {
            let matcher = self.lock_component(&self.matcher).clone();
            let mut state = self.state.lock().await;
            let idx = matcher.find_match(request, &state.recording.entries, &state.consumed)?;
            if consume && !matcher.allow_reuse() {
                state.consumed[idx] = true;
            }
            state.recording.entries[idx].response.clone()
        };

        let transforms = self.lock_component(&self.transforms);
        transform::apply_all(&transforms, request, &mut response);
        Ok(response)
    }

    pub fn set_matcher(&self, matcher: RecordMatcher) {
        *self.lock_component(&self.matcher) = matcher;
    }

    pub fn add_sanitizer(&self, sanitizer: Box<dyn Sanitizer>) {
        self.lock_component(&self.sanitizers).push(sanitizer);
    }

    pub fn add_transform(&self, transform: Box<dyn ResponseTransform>) {
        self.lock_component(&self.transforms).push(transform);
    }

    fn lock_component<'a, T>(&self, mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Report returned by a playback stop.
#[derive(Debug, Default)]
pub struct PlaybackStopReport {
    /// Request URIs of entries never selected during the playback pass.
    pub unconsumed: Vec<String>,
}

/// Thread-safe store of active sessions keyed by opaque session id.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    storage_root: PathBuf,
    strict_playback: bool,
}

impl SessionStore {
    pub fn new(storage_root: impl Into<PathBuf>, strict_playback: bool) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            storage_root: storage_root.into(),
            strict_playback,
        }
    }

    fn recording_path(&self, recording_file: &str) -> PathBuf {
        self.storage_root.join(recording_file)
    }

    fn insert(&self, session: Session) -> Arc<Session> {
        let session = Arc::new(session);
        let mut sessions = self.write_sessions();
        sessions.insert(session.id.clone(), session.clone());
        session
    }

    fn remove(&self, session_id: &str, mode: SessionMode) -> Result<Arc<Session>, ProxyError> {
        let mut sessions = self.write_sessions();
        let matches_mode = sessions
            .get(session_id)
            .map(|session| session.mode == mode)
            .unwrap_or(false);
        if !matches_mode {
            return Err(ProxyError::SessionNotActive(session_id.to_string()));
        }
        sessions
            .remove(session_id)
            .ok_or_else(|| ProxyError::SessionNotActive(session_id.to_string()))
    }

    /// Allocate a fresh record session. The recording file is only written
    /// at stop time.
    pub fn start_record(&self, recording_file: &str) -> Arc<Session> {
        let path = self.recording_path(recording_file);
        let session = self.insert(Session::new(
            SessionMode::Record,
            path,
            RecordSession::default(),
        ));
        info!(id = %session.id, file = %recording_file, "record session started");
        session
    }

    /// Load the recording and allocate a playback session. Fails fast on a
    /// missing or malformed recording; no partial session is created.
    pub async fn start_playback(
        &self,
        recording_file: &str,
    ) -> Result<(Arc<Session>, BTreeMap<String, String>), ProxyError> {
        let path = self.recording_path(recording_file);
        let recording = RecordSession::load(&path).await?;
        let variables = recording.variables.clone();
        let session = self.insert(Session::new(SessionMode::Playback, path, recording));
        info!(id = %session.id, file = %recording_file, "playback session started");
        Ok((session, variables))
    }

    /// Stop a record session. With `save`, sanitizes the variables and
    /// serializes the recording to its path; without, the capture is
    /// discarded.
    pub async fn stop_record(
        &self,
        session_id: &str,
        variables: BTreeMap<String, String>,
        save: bool,
    ) -> Result<(), ProxyError> {
        let session = self.remove(session_id, SessionMode::Record)?;
        let mut state = session.state.lock().await;
        state.recording.variables = variables;

        if !save {
            info!(id = %session_id, "record session discarded");
            return Ok(());
        }

        {
            let sanitizers = session.lock_component(&session.sanitizers);
            for sanitizer in sanitizers.iter() {
                sanitizer.sanitize_variables(&mut state.recording.variables);
            }
        }

        state.recording.save(&session.recording_path).await?;
        info!(
            id = %session_id,
            path = %session.recording_path.display(),
            entries = state.recording.entries.len(),
            "record session saved"
        );
        Ok(())
    }

    /// Stop a playback session, reporting entries that were never consumed.
    /// In strict mode unconsumed entries fail the stop.
    pub async fn stop_playback(&self, session_id: &str) -> Result<PlaybackStopReport, ProxyError> {
        let session = self.remove(session_id, SessionMode::Playback)?;
        let state = session.state.lock().await;
        let unconsumed: Vec<String> = state
            .recording
            .entries
            .iter()
            .zip(&state.consumed)
            .filter(|(_, consumed)| !**consumed)
            .map(|(entry, _)| entry.request.uri.clone())
            .collect();

        if !unconsumed.is_empty() {
            warn!(
                id = %session_id,
                count = unconsumed.len(),
                "playback session stopped with unconsumed entries"
            );
            if self.strict_playback {
                return Err(ProxyError::InvalidRequest(format!(
                    "playback stopped with {} unconsumed entries: {}",
                    unconsumed.len(),
                    unconsumed.join(", ")
                )));
            }
        }
        Ok(PlaybackStopReport { unconsumed })
    }

    /// O(1) lookup; does not remove the session.
    pub fn resolve(&self, session_id: &str) -> Result<Arc<Session>, ProxyError> {
        let sessions = self
            .sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| ProxyError::SessionNotActive(session_id.to_string()))
    }

    fn write_sessions(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{make_entry, make_request};
    use bytes::Bytes;

    fn store_in(dir: &tempfile::TempDir) -> SessionStore {
        SessionStore::new(dir.path(), false)
    }

    #[tokio::test]
    async fn record_then_playback_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store_in(&dir);

        let session = store.start_record("suite/roundtrip.json");
        let mut entry = make_entry("GET", "https://example.test/foo", 200);
        entry.response.body = Some(Bytes::from(r#"{"x":1}"#));
        session.record_entry(entry).await;
        let id = session.id.clone();
        drop(session);

        let mut variables = BTreeMap::new();
        variables.insert("seed".to_string(), "7".to_string());
        store.stop_record(&id, variables, true).await?;

        let (playback, variables) = store.start_playback("suite/roundtrip.json").await?;
        assert_eq!(variables.get("seed").map(String::as_str), Some("7"));

        let request = make_request("GET", "https://example.test/foo", &[], None);
        let response = playback.play_entry(&request, true).await?;
        assert_eq!(response.status, 200);
        assert_eq!(response.body.as_deref(), Some(br#"{"x":1}"#.as_ref()));

        let report = store.stop_playback(&playback.id).await?;
        assert!(report.unconsumed.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn stop_with_unknown_id_reports_session_not_active() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store_in(&dir);
        let err = store
            .stop_record("not-a-session", BTreeMap::new(), true)
            .await
            .expect_err("unknown id");
        assert!(matches!(err, ProxyError::SessionNotActive(_)));
        Ok(())
    }

    #[tokio::test]
    async fn stop_record_with_playback_id_is_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store_in(&dir);

        let session = store.start_record("suite/mode.json");
        let id = session.id.clone();
        store.stop_record(&id, BTreeMap::new(), true).await?;

        let (playback, _) = store.start_playback("suite/mode.json").await?;
        let err = store
            .stop_record(&playback.id, BTreeMap::new(), true)
            .await
            .expect_err("mode mismatch");
        assert!(matches!(err, ProxyError::SessionNotActive(_)));
        Ok(())
    }

    #[tokio::test]
    async fn playback_of_missing_recording_fails_fast() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store_in(&dir);
        let err = store
            .start_playback("missing.json")
            .await
            .expect_err("missing recording");
        assert!(matches!(err, ProxyError::RecordingNotFound(_)));
        Ok(())
    }

    #[tokio::test]
    async fn entries_are_consumed_at_most_once() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store_in(&dir);

        let session = store.start_record("suite/twice.json");
        let mut first = make_entry("GET", "https://example.test/seq", 200);
        first.response.body = Some(Bytes::from("first"));
        let mut second = make_entry("GET", "https://example.test/seq", 200);
        second.response.body = Some(Bytes::from("second"));
        session.record_entry(first).await;
        session.record_entry(second).await;
        let id = session.id.clone();
        store.stop_record(&id, BTreeMap::new(), true).await?;

        let (playback, _) = store.start_playback("suite/twice.json").await?;
        let request = make_request("GET", "https://example.test/seq", &[], None);

        let one = playback.play_entry(&request, true).await?;
        let two = playback.play_entry(&request, true).await?;
        assert_eq!(one.body.as_deref(), Some(b"first".as_ref()));
        assert_eq!(two.body.as_deref(), Some(b"second".as_ref()));

        let err = playback
            .play_entry(&request, true)
            .await
            .expect_err("both entries consumed");
        assert!(matches!(err, ProxyError::NoMatch(_)));
        Ok(())
    }

    #[tokio::test]
    async fn consume_false_leaves_entry_available() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store_in(&dir);

        let session = store.start_record("suite/reuse.json");
        session
            .record_entry(make_entry("GET", "https://example.test/once", 200))
            .await;
        let id = session.id.clone();
        store.stop_record(&id, BTreeMap::new(), true).await?;

        let (playback, _) = store.start_playback("suite/reuse.json").await?;
        let request = make_request("GET", "https://example.test/once", &[], None);
        playback.play_entry(&request, false).await?;
        playback.play_entry(&request, true).await?;

        let err = playback.play_entry(&request, true).await;
        assert!(err.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_playback_never_double_consumes() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store_in(&dir);

        let session = store.start_record("suite/race.json");
        for body in ["a", "b"] {
            let mut entry = make_entry("GET", "https://example.test/race", 200);
            entry.response.body = Some(Bytes::from(body));
            session.record_entry(entry).await;
        }
        let id = session.id.clone();
        store.stop_record(&id, BTreeMap::new(), true).await?;

        let (playback, _) = store.start_playback("suite/race.json").await?;
        let request = make_request("GET", "https://example.test/race", &[], None);

        let a = {
            let playback = playback.clone();
            let request = request.clone();
            tokio::spawn(async move { playback.play_entry(&request, true).await })
        };
        let b = {
            let playback = playback.clone();
            let request = request.clone();
            tokio::spawn(async move { playback.play_entry(&request, true).await })
        };
        let first = a.await?.expect("first play");
        let second = b.await?.expect("second play");

        let mut bodies = vec![first.body, second.body];
        bodies.sort();
        assert_eq!(
            bodies,
            vec![Some(Bytes::from("a")), Some(Bytes::from("b"))]
        );
        Ok(())
    }

    #[tokio::test]
    async fn strict_playback_fails_stop_on_unconsumed_entries() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = SessionStore::new(dir.path(), true);

        let session = store.start_record("suite/strict.json");
        session
            .record_entry(make_entry("GET", "https://example.test/left", 200))
            .await;
        let id = session.id.clone();
        store.stop_record(&id, BTreeMap::new(), true).await?;

        let (playback, _) = store.start_playback("suite/strict.json").await?;
        let err = store
            .stop_playback(&playback.id)
            .await
            .expect_err("strict mode");
        assert!(err.to_string().contains("unconsumed"));
        Ok(())
    }

    #[tokio::test]
    async fn stop_without_save_discards_recording() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store_in(&dir);

        let session = store.start_record("suite/discard.json");
        session
            .record_entry(make_entry("GET", "https://example.test/", 200))
            .await;
        let id = session.id.clone();
        store.stop_record(&id, BTreeMap::new(), false).await?;

        assert!(!dir.path().join("suite/discard.json").exists());
        Ok(())
    }

    #[tokio::test]
    async fn swapping_matcher_applies_to_subsequent_plays() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store_in(&dir);

        let session = store.start_record("suite/matcher.json");
        let mut entry = make_entry("POST", "https://example.test/m", 200);
        entry.request.body = Some(Bytes::from("recorded"));
        session.record_entry(entry).await;
        let id = session.id.clone();
        store.stop_record(&id, BTreeMap::new(), true).await?;

        let (playback, _) = store.start_playback("suite/matcher.json").await?;
        let request = make_request("POST", "https://example.test/m", &[], Some(b"live"));
        assert!(playback.play_entry(&request, true).await.is_err());

        playback.set_matcher(RecordMatcher::bodiless());
        assert!(playback.play_entry(&request, true).await.is_ok());
        Ok(())
    }
}
