//! Per-session runtime and the session registry.
//!
//! A [`SessionRuntime`] owns exactly what one session needs while live: the
//! event sink the current transport is attached to, and the handle of the
//! active turn, if any. The one-turn-per-session invariant is enforced here
//! by taking the runtime lock across check-and-spawn; everything else in the
//! system can assume it.
//!
//! The [`SessionManager`] maps session ids to runtimes, caches dataset
//! profiles, accepts upload registrations from the collaborator, and owns
//! cascade deletion (store row + messages + on-disk directory).

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::agent::{AgentLoop, TurnTrigger};
use crate::config::Settings;
use crate::engine::QueryEngine;
use crate::events::{ClientMessage, EventSink, ServerEvent};
use crate::llm::ModelClient;
use crate::profile::{self, DatasetProfile};
use crate::store::{MessageStore, SessionRecord};
use crate::tools::ToolContext;
use crate::types::{DatasetFile, SessionId, SessionMeta, UserId};
use crate::{Error, Result};

struct ActiveTurn {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Live state for one session.
pub struct SessionRuntime {
    session_id: SessionId,
    sink: EventSink,
    active: Mutex<Option<ActiveTurn>>,
}

impl SessionRuntime {
    fn new(session_id: SessionId) -> Self {
        SessionRuntime {
            session_id,
            sink: EventSink::detached(),
            active: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Point the sink at a new transport; used on connect and reconnect.
    pub fn attach_transport(&self, tx: mpsc::Sender<ServerEvent>) {
        self.sink.attach(tx);
    }

    pub fn sink(&self) -> &EventSink {
        &self.sink
    }

    /// Whether a turn is currently running for this session.
    pub fn has_active_turn(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .map(|turn| !turn.handle.is_finished())
            .unwrap_or(false)
    }

    fn clear_active(&self) {
        *self.active.lock() = None;
    }

    /// Cancel the active turn. Returns whether there was one to cancel.
    fn stop(&self) -> bool {
        let guard = self.active.lock();
        match guard.as_ref() {
            Some(turn) if !turn.handle.is_finished() => {
                turn.cancel.cancel();
                true
            }
            _ => false,
        }
    }
}

impl Drop for SessionRuntime {
    fn drop(&mut self) {
        if let Some(turn) = self.active.lock().take() {
            turn.cancel.cancel();
            turn.handle.abort();
        }
    }
}

/// Registry of live sessions plus the shared machinery turns need.
pub struct SessionManager {
    settings: Settings,
    store: Arc<MessageStore>,
    engine: Arc<QueryEngine>,
    agent: Arc<AgentLoop>,
    runtimes: DashMap<SessionId, Arc<SessionRuntime>>,
    profiles: DashMap<SessionId, Arc<DatasetProfile>>,
}

impl SessionManager {
    pub fn new(settings: Settings, store: Arc<MessageStore>, model: Arc<dyn ModelClient>) -> Self {
        let engine = Arc::new(QueryEngine::new(settings.sql_timeout));
        let agent = Arc::new(AgentLoop::new(model, &settings));
        SessionManager {
            settings,
            store,
            engine,
            agent,
            runtimes: DashMap::new(),
            profiles: DashMap::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_agent(mut self, agent: AgentLoop) -> Self {
        self.agent = Arc::new(agent);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    /// Accept an upload from the collaborator: profile the file, persist the
    /// session row, and make the session ready for turns.
    pub async fn register_upload(
        &self,
        user_id: &UserId,
        session_id: &SessionId,
        file_path: &str,
        filename: &str,
    ) -> Result<SessionRecord> {
        let file = DatasetFile::from_path(file_path)?;

        let size = std::fs::metadata(&file.path)?.len();
        if size > self.settings.max_upload_bytes {
            return Err(Error::invalid_input(format!(
                "file is {size} bytes; limit is {}",
                self.settings.max_upload_bytes
            )));
        }

        let sample_rows = self.settings.profile_sample_rows;
        let filename_owned = filename.to_string();
        let profile = tokio::task::spawn_blocking(move || {
            profile::build_profile(&file, &filename_owned, sample_rows)
        })
        .await
        .map_err(|e| Error::other(format!("profiling task failed: {e}")))??;

        let meta = SessionMeta {
            id: session_id.clone(),
            user_id: user_id.clone(),
            title: None,
            filename: filename.to_string(),
            created_at: Utc::now(),
        };
        self.store.register_session(&meta, file_path, &profile)?;
        self.profiles.insert(session_id.clone(), Arc::new(profile));

        self.store
            .get_session(user_id, session_id)?
            .ok_or_else(|| Error::other("session vanished after registration"))
    }

    /// Runtime for a session, created on first use.
    pub fn runtime(&self, session_id: &SessionId) -> Arc<SessionRuntime> {
        self.runtimes
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(SessionRuntime::new(session_id.clone())))
            .clone()
    }

    fn profile_for(&self, record: &SessionRecord) -> Arc<DatasetProfile> {
        self.profiles
            .entry(record.meta.id.clone())
            .or_insert_with(|| Arc::new(record.profile.clone()))
            .clone()
    }

    /// Handle one client message for an authenticated owner.
    ///
    /// All outcomes, including rejections, surface as events on the
    /// session's sink; this function only fails when the session itself is
    /// missing.
    pub async fn handle_client_message(
        &self,
        user_id: &UserId,
        session_id: &SessionId,
        message: ClientMessage,
    ) -> Result<()> {
        let runtime = self.runtime(session_id);

        match message {
            ClientMessage::Message { text } => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    runtime
                        .sink
                        .emit_direct(ServerEvent::error("message text must not be empty"))
                        .await;
                    return Ok(());
                }
                self.start_turn(user_id, session_id, TurnTrigger::UserMessage(trimmed.to_string()))
                    .await
            }
            ClientMessage::AutoAnalyze => {
                self.start_turn(user_id, session_id, TurnTrigger::AutoAnalyze).await
            }
            ClientMessage::Stop => {
                if !runtime.stop() {
                    runtime
                        .sink
                        .emit_direct(ServerEvent::error("no turn is in progress"))
                        .await;
                }
                Ok(())
            }
        }
    }

    async fn start_turn(
        &self,
        user_id: &UserId,
        session_id: &SessionId,
        trigger: TurnTrigger,
    ) -> Result<()> {
        // A session without a successful upload has no file to analyze.
        let record = self
            .store
            .get_session(user_id, session_id)?
            .ok_or_else(|| Error::not_found(format!("session {session_id}")))?;
        let file = DatasetFile::from_path(&record.file_path)?;
        let profile = self.profile_for(&record);
        let runtime = self.runtime(session_id);

        let ctx = ToolContext {
            session_id: session_id.clone(),
            file,
            store: self.store.clone(),
            sink: runtime.sink.clone(),
            engine: self.engine.clone(),
            max_result_rows: self.settings.max_result_rows,
            max_plot_rows: self.settings.max_plot_rows,
        };

        let mut active = runtime.active.lock();
        if active.as_ref().map(|t| !t.handle.is_finished()).unwrap_or(false) {
            drop(active);
            runtime
                .sink
                .emit_direct(ServerEvent::error(
                    "a turn is already in progress; wait for it to finish or send stop",
                ))
                .await;
            return Ok(());
        }

        runtime.sink.reset_for_turn();
        let cancel = CancellationToken::new();
        let agent = self.agent.clone();
        let turn_runtime = runtime.clone();
        let turn_cancel = cancel.clone();
        let span = tracing::info_span!(
            "turn",
            session = %session_id,
            trigger = match &trigger {
                TurnTrigger::UserMessage(_) => "message",
                TurnTrigger::AutoAnalyze => "auto_analyze",
            }
        );
        let handle = tokio::spawn(
            async move {
                let report = agent.run_turn(&ctx, &profile, trigger, turn_cancel).await;
                tracing::debug!(
                    end = ?report.end,
                    iterations = report.iterations,
                    "turn finished"
                );
                turn_runtime.clear_active();
            }
            .instrument(span),
        );
        *active = Some(ActiveTurn { cancel, handle });
        Ok(())
    }

    /// Cascade-delete a session: active turn, store rows, dataset directory.
    pub async fn delete_session(&self, user_id: &UserId, session_id: &SessionId) -> Result<bool> {
        if let Some((_, runtime)) = self.runtimes.remove(session_id) {
            runtime.stop();
        }
        self.profiles.remove(session_id);

        let record = self.store.get_session(user_id, session_id)?;
        let deleted = self.store.delete_session(user_id, session_id)?;

        if deleted {
            if let Some(record) = record {
                // Remove the session directory. Best effort: the row is
                // gone, a leftover directory is garbage-collectable.
                if let Some(dir) = PathBuf::from(&record.file_path).parent() {
                    if let Err(err) = std::fs::remove_dir_all(dir) {
                        tracing::warn!(session = %session_id, error = %err, "dataset dir removal failed");
                    }
                }
            }
        }
        Ok(deleted)
    }
}
