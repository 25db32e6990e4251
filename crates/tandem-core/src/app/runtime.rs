use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{AgentApi, HistoryMessage, TurnRequest};
use crate::app::accumulator::{PendingFlush, TurnOutcome};
use crate::app::turn::{StreamUpdate, run_turn};
use crate::config::RuntimeConfig;
use crate::session::memory::{EvictTrigger, MemoryGovernor, MemoryPressure};
use crate::session::persist::PersistenceManager;
use crate::session::state::{
    ChatMessage, MessageRole, SessionId, SessionState, StreamHandle, TraceEntry,
};
use crate::session::store::SessionStore;

const EVENT_BROADCAST_CAPACITY: usize = 256;
const UPDATE_CHANNEL_CAPACITY: usize = 256;
const CMD_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: SessionId },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Channel closed")]
    ChannelClosed,
}

/// State-change notifications for the presentation layer. Receivers that
/// lag lose the oldest events and re-read state through the handle.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    SessionsChanged,
    CurrentSessionChanged {
        session_id: SessionId,
    },
    MessagesUpdated {
        session_id: SessionId,
    },
    ThinkingUpdated {
        session_id: SessionId,
        entries: Vec<TraceEntry>,
    },
    ContextUsage {
        session_id: SessionId,
        prompt_tokens: u32,
        completion_tokens: u32,
        context_window: u32,
    },
    Notice {
        session_id: SessionId,
        text: String,
    },
    /// A turn finished in a session other than the visible one.
    TaskCompleted {
        session_id: SessionId,
        title: String,
    },
}

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: SessionId,
    pub title: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub unread: bool,
    pub streaming: bool,
    pub message_count: usize,
    pub linked_task_id: Option<String>,
}

enum RuntimeCmd {
    SendMessage {
        text: String,
        target: Option<SessionId>,
        images: Vec<String>,
        reply: oneshot::Sender<Result<SessionId, RuntimeError>>,
    },
    QueueMessage {
        session_id: SessionId,
        text: String,
        reply: oneshot::Sender<Result<(), RuntimeError>>,
    },
    CancelAgent {
        target: Option<SessionId>,
        reply: oneshot::Sender<bool>,
    },
    Resume {
        target: Option<SessionId>,
        reply: oneshot::Sender<Result<bool, RuntimeError>>,
    },
    SwitchTo {
        session_id: SessionId,
        reply: oneshot::Sender<Result<(), RuntimeError>>,
    },
    NewSession {
        linked_task_id: Option<String>,
        reply: oneshot::Sender<SessionId>,
    },
    DeleteSession {
        session_id: SessionId,
        reply: oneshot::Sender<Result<(), RuntimeError>>,
    },
    ListSessions {
        reply: oneshot::Sender<Vec<SessionSummary>>,
    },
    SessionMessages {
        session_id: SessionId,
        reply: oneshot::Sender<Vec<ChatMessage>>,
    },
    FullHistory {
        session_id: SessionId,
        reply: oneshot::Sender<Option<Vec<ChatMessage>>>,
    },
    ThinkingSteps {
        session_id: SessionId,
        reply: oneshot::Sender<Vec<TraceEntry>>,
    },
    CurrentSession {
        reply: oneshot::Sender<SessionId>,
    },
    StreamingSessions {
        reply: oneshot::Sender<Vec<SessionId>>,
    },
    SaveNow {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

/// The runtime actor: single authoritative owner of the session store and
/// all ephemeral session state. Commands arrive over an mpsc channel with
/// oneshot replies; stream tasks hand results back over the update channel;
/// the memory governor asks for evictions over its trigger channel. No
/// other task touches the shared state.
struct Runtime {
    config: RuntimeConfig,
    api: Arc<dyn AgentApi>,
    store: SessionStore,
    states: HashMap<SessionId, SessionState>,
    streaming: HashSet<SessionId>,
    persistence: PersistenceManager,
    governor: MemoryGovernor,
    events: broadcast::Sender<RuntimeEvent>,
    update_tx: mpsc::Sender<StreamUpdate>,
    turn_counter: u64,
}

impl Runtime {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<RuntimeCmd>,
        mut update_rx: mpsc::Receiver<StreamUpdate>,
        mut evict_rx: mpsc::Receiver<EvictTrigger>,
    ) {
        loop {
            tokio::select! {
                biased;

                Some(cmd) = cmd_rx.recv() => {
                    match cmd {
                        RuntimeCmd::SendMessage { text, target, images, reply } => {
                            let result = self.handle_send(text, target, images).await;
                            let _ = reply.send(result);
                        }
                        RuntimeCmd::QueueMessage { session_id, text, reply } => {
                            let result = self.handle_queue(session_id, text).await;
                            let _ = reply.send(result);
                        }
                        RuntimeCmd::CancelAgent { target, reply } => {
                            let cancelled = self.handle_cancel(target).await;
                            let _ = reply.send(cancelled);
                        }
                        RuntimeCmd::Resume { target, reply } => {
                            let result = self.handle_resume(target).await;
                            let _ = reply.send(result);
                        }
                        RuntimeCmd::SwitchTo { session_id, reply } => {
                            let result = self.handle_switch(session_id).await;
                            let _ = reply.send(result);
                        }
                        RuntimeCmd::NewSession { linked_task_id, reply } => {
                            let id = self.handle_new_session(linked_task_id).await;
                            let _ = reply.send(id);
                        }
                        RuntimeCmd::DeleteSession { session_id, reply } => {
                            let result = self.handle_delete(session_id).await;
                            let _ = reply.send(result);
                        }
                        RuntimeCmd::ListSessions { reply } => {
                            let _ = reply.send(self.summaries());
                        }
                        RuntimeCmd::SessionMessages { session_id, reply } => {
                            let _ = reply.send(self.store.live_messages(session_id));
                        }
                        RuntimeCmd::FullHistory { session_id, reply } => {
                            let _ = reply.send(self.store.full_history(session_id));
                        }
                        RuntimeCmd::ThinkingSteps { session_id, reply } => {
                            let entries = self
                                .states
                                .get(&session_id)
                                .map(|s| s.thinking.clone())
                                .unwrap_or_default();
                            let _ = reply.send(entries);
                        }
                        RuntimeCmd::CurrentSession { reply } => {
                            let _ = reply.send(self.store.current_id());
                        }
                        RuntimeCmd::StreamingSessions { reply } => {
                            let _ = reply.send(self.streaming.iter().copied().collect());
                        }
                        RuntimeCmd::SaveNow { reply } => {
                            let snapshot = self.store.snapshot();
                            self.persistence.save_now(snapshot).await;
                            let _ = reply.send(());
                        }
                        RuntimeCmd::Shutdown => break,
                    }
                }

                Some(update) = update_rx.recv() => {
                    self.handle_update(update).await;
                }

                Some(trigger) = evict_rx.recv() => {
                    self.handle_evict(trigger).await;
                }

                else => break,
            }
        }

        self.shutdown().await;
    }

    async fn shutdown(mut self) {
        for state in self.states.values_mut() {
            state.cancel_stream();
        }
        self.streaming.clear();
        self.governor.shutdown().await;

        let snapshot = self.store.snapshot();
        self.persistence.save_now(snapshot).await;
        self.persistence.shutdown().await;

        info!("runtime stopped");
    }

    fn emit(&self, event: RuntimeEvent) {
        let _ = self.events.send(event);
    }

    async fn persist(&mut self) {
        let snapshot = self.store.snapshot();
        self.persistence.save(snapshot).await;
    }

    fn summaries(&self) -> Vec<SessionSummary> {
        self.store
            .sessions()
            .iter()
            .map(|s| SessionSummary {
                id: s.id,
                title: s.title.clone(),
                created_at: s.created_at,
                unread: s.unread,
                streaming: self.streaming.contains(&s.id),
                message_count: self
                    .store
                    .full_history(s.id)
                    .map(|h| h.len())
                    .unwrap_or(s.messages.len()),
                linked_task_id: s.linked_task_id.clone(),
            })
            .collect()
    }

    async fn handle_send(
        &mut self,
        text: String,
        target: Option<SessionId>,
        images: Vec<String>,
    ) -> Result<SessionId, RuntimeError> {
        if text.trim().is_empty() {
            return Err(RuntimeError::InvalidInput {
                message: "message must not be empty".to_string(),
            });
        }

        let id = target.unwrap_or_else(|| self.store.current_id());
        let existed = self.store.contains(id);
        // Placeholder first: the session shows up in listings before the
        // first agent token arrives.
        self.store.ensure_session(id);
        self.store.append_live(id, ChatMessage::user(text.clone()));

        if !existed {
            self.emit(RuntimeEvent::SessionsChanged);
        }
        self.emit(RuntimeEvent::MessagesUpdated { session_id: id });

        self.start_turn(id, text, images).await;
        Ok(id)
    }

    /// Queue a follow-up: dispatched when the in-flight turn completes, or
    /// sent immediately when the session is idle.
    async fn handle_queue(
        &mut self,
        session_id: SessionId,
        text: String,
    ) -> Result<(), RuntimeError> {
        if !self.store.contains(session_id) {
            return Err(RuntimeError::SessionNotFound { session_id });
        }

        if self.streaming.contains(&session_id) {
            let state = self.states.entry(session_id).or_default();
            state.queue.push_back(text);
            Ok(())
        } else {
            self.handle_send(text, Some(session_id), Vec::new())
                .await
                .map(|_| ())
        }
    }

    async fn handle_cancel(&mut self, target: Option<SessionId>) -> bool {
        let id = target.unwrap_or_else(|| self.store.current_id());
        let Some(state) = self.states.get_mut(&id) else {
            return false;
        };
        if !state.cancel_stream() {
            return false;
        }

        state.was_stopped = true;
        state.is_loading = false;
        state.active_turn = None;
        state.thinking.clear();
        state.queue.clear();
        state.touch();
        self.streaming.remove(&id);

        self.store.append_live(id, ChatMessage::stopped());
        self.store.sync_live(id);
        self.persist().await;
        self.emit(RuntimeEvent::MessagesUpdated { session_id: id });

        info!(session_id = %id, "agent stopped by user");
        true
    }

    /// Re-send the last prompt after a stop or error. The prompt is already
    /// part of the transcript, so no user message is appended.
    async fn handle_resume(&mut self, target: Option<SessionId>) -> Result<bool, RuntimeError> {
        let id = target.unwrap_or_else(|| self.store.current_id());
        if !self.store.contains(id) {
            return Err(RuntimeError::SessionNotFound { session_id: id });
        }

        let prompt = match self.states.get(&id) {
            Some(state) if state.is_streaming() => return Ok(false),
            Some(state) => state.last_prompt.clone(),
            None => None,
        };
        let Some(prompt) = prompt else {
            return Ok(false);
        };

        self.start_turn(id, prompt, Vec::new()).await;
        Ok(true)
    }

    async fn handle_switch(&mut self, session_id: SessionId) -> Result<(), RuntimeError> {
        if !self.store.switch_to(session_id) {
            return Err(RuntimeError::SessionNotFound { session_id });
        }
        self.states.entry(session_id).or_default().touch();
        self.persist().await;
        self.emit(RuntimeEvent::CurrentSessionChanged { session_id });
        self.emit(RuntimeEvent::MessagesUpdated { session_id });
        Ok(())
    }

    async fn handle_new_session(&mut self, linked_task_id: Option<String>) -> SessionId {
        let id = self.store.create(linked_task_id);
        self.states.entry(id).or_default();
        self.persist().await;
        self.emit(RuntimeEvent::SessionsChanged);
        self.emit(RuntimeEvent::CurrentSessionChanged { session_id: id });
        id
    }

    async fn handle_delete(&mut self, session_id: SessionId) -> Result<(), RuntimeError> {
        if !self.store.contains(session_id) {
            return Err(RuntimeError::SessionNotFound { session_id });
        }

        // Cancel any in-flight stream before tearing the session down.
        if let Some(mut state) = self.states.remove(&session_id) {
            state.cancel_stream();
        }
        self.streaming.remove(&session_id);

        let outcome = self.store.delete(session_id);
        if let Some(fresh) = outcome.new_current {
            self.states.entry(fresh).or_default();
            self.emit(RuntimeEvent::CurrentSessionChanged { session_id: fresh });
        }

        self.persist().await;
        self.emit(RuntimeEvent::SessionsChanged);
        info!(session_id = %session_id, "deleted session");
        Ok(())
    }

    /// Open a stream for one turn. Any previous stream for the session is
    /// cancelled and replaced before the new one starts.
    async fn start_turn(&mut self, id: SessionId, prompt: String, images: Vec<String>) {
        let mut history: Vec<HistoryMessage> = self
            .store
            .live_messages(id)
            .iter()
            .filter(|m| matches!(m.role, MessageRole::User | MessageRole::Assistant))
            .map(|m| HistoryMessage {
                role: match m.role {
                    MessageRole::User => "user".to_string(),
                    _ => "assistant".to_string(),
                },
                content: m.content.clone(),
            })
            .collect();
        // The prompt itself travels in `message`, not in the history.
        if history
            .last()
            .is_some_and(|m| m.role == "user" && m.content == prompt)
        {
            history.pop();
        }

        let request = TurnRequest {
            message: prompt.clone(),
            agent_type: self.config.agent.agent_type.clone(),
            provider: self.config.agent.provider.clone(),
            model: self.config.agent.model.clone(),
            temperature: self.config.agent.temperature,
            conversation_history: (!history.is_empty()).then_some(history),
            images: (!images.is_empty()).then_some(images),
        };

        self.turn_counter += 1;
        let turn = self.turn_counter;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_turn(
            self.api.clone(),
            request,
            id,
            turn,
            self.config.flush_interval,
            cancel.clone(),
            self.update_tx.clone(),
        ));

        let state = self.states.entry(id).or_default();
        state.touch();
        state.last_prompt = Some(prompt);
        state.was_stopped = false;
        state.thinking.clear();
        state.active_turn = Some(turn);
        let replaced = state.replace_stream(StreamHandle { cancel, task });
        if replaced {
            debug!(session_id = %id, "replaced in-flight stream");
        }

        self.streaming.insert(id);
        self.persist().await;
    }

    async fn handle_update(&mut self, update: StreamUpdate) {
        match update {
            StreamUpdate::Partial {
                session_id,
                turn,
                flush,
            } => self.handle_partial(session_id, turn, flush),
            StreamUpdate::Finished {
                session_id,
                turn,
                outcome,
                cancelled,
            } => {
                if cancelled {
                    self.finish_turn(session_id, turn);
                } else if let Some(error) = outcome.error.clone() {
                    self.complete_with_error(session_id, turn, error).await;
                } else {
                    self.complete_turn(session_id, turn, outcome).await;
                }
            }
            StreamUpdate::Failed {
                session_id,
                turn,
                error,
            } => {
                warn!(session_id = %session_id, error = %error, "turn failed");
                self.complete_with_error(session_id, turn, error.to_string())
                    .await;
            }
        }
    }

    fn handle_partial(&mut self, id: SessionId, turn: u64, flush: PendingFlush) {
        let current = self.store.current_id();
        let Some(state) = self.states.get_mut(&id) else {
            return;
        };
        if state.active_turn != Some(turn) {
            debug!(session_id = %id, "discarding partial flush from superseded turn");
            return;
        }
        state.touch();

        let mut usage_event = None;
        if let Some(usage) = &flush.usage {
            if let Some(tokens) = usage.prompt_tokens {
                state.prompt_tokens = tokens;
            }
            if let Some(tokens) = usage.completion_tokens {
                state.completion_tokens = tokens;
            }
            if let Some(window) = usage.context_window {
                state.context_window = window;
            }
            usage_event = Some(RuntimeEvent::ContextUsage {
                session_id: id,
                prompt_tokens: state.prompt_tokens,
                completion_tokens: state.completion_tokens,
                context_window: state.context_window,
            });
        }
        if !flush.entries.is_empty() {
            state.thinking.extend(flush.entries.iter().cloned());
        }

        if let Some(event) = usage_event {
            self.emit(event);
        }
        for text in flush.notices {
            self.emit(RuntimeEvent::Notice {
                session_id: id,
                text,
            });
        }
        if id == current && !flush.entries.is_empty() {
            self.emit(RuntimeEvent::ThinkingUpdated {
                session_id: id,
                entries: flush.entries,
            });
        }
    }

    /// Common turn teardown. Returns false when the update belongs to a
    /// superseded turn or a deleted session and must be discarded.
    fn finish_turn(&mut self, id: SessionId, turn: u64) -> bool {
        let Some(state) = self.states.get_mut(&id) else {
            return false;
        };
        if state.active_turn != Some(turn) {
            debug!(session_id = %id, "discarding completion from superseded turn");
            return false;
        }
        state.active_turn = None;
        state.stream = None;
        state.is_loading = false;
        state.thinking.clear();
        state.touch();
        self.streaming.remove(&id);
        true
    }

    async fn complete_turn(&mut self, id: SessionId, turn: u64, outcome: TurnOutcome) {
        if !self.finish_turn(id, turn) || !self.store.contains(id) {
            return;
        }

        let content = outcome.final_answer.unwrap_or_default();
        self.store
            .append_live(id, ChatMessage::assistant(content, outcome.trace));

        if let Some(state) = self.states.get_mut(&id) {
            if let Some(tokens) = outcome.usage.prompt_tokens {
                state.prompt_tokens = tokens;
            }
            if let Some(tokens) = outcome.usage.completion_tokens {
                state.completion_tokens = tokens;
            }
            if let Some(window) = outcome.usage.context_window {
                state.context_window = window;
            }
            state.last_prompt = None;
        }

        self.store.sync_live(id);
        self.persist().await;
        self.emit(RuntimeEvent::MessagesUpdated { session_id: id });
        self.notify_if_background(id);

        debug!(
            session_id = %id,
            tool_steps = outcome.tool_steps,
            confidence = ?outcome.confidence,
            "turn finished"
        );

        let next = self
            .states
            .get_mut(&id)
            .and_then(|state| state.queue.pop_front());
        if let Some(prompt) = next {
            self.store.append_live(id, ChatMessage::user(prompt.clone()));
            self.emit(RuntimeEvent::MessagesUpdated { session_id: id });
            self.start_turn(id, prompt, Vec::new()).await;
        }
    }

    /// Transport and agent errors surface as a single inline message in the
    /// affected session; `last_prompt` stays set so the turn can be resumed.
    async fn complete_with_error(&mut self, id: SessionId, turn: u64, error: String) {
        if !self.finish_turn(id, turn) || !self.store.contains(id) {
            return;
        }

        self.store.append_live(id, ChatMessage::error(error));
        self.store.sync_live(id);
        self.persist().await;
        self.emit(RuntimeEvent::MessagesUpdated { session_id: id });
        self.notify_if_background(id);
    }

    fn notify_if_background(&mut self, id: SessionId) {
        if id == self.store.current_id() {
            return;
        }
        let title = match self.store.get_mut(id) {
            Some(session) => {
                session.unread = true;
                session.title.clone()
            }
            None => return,
        };
        self.emit(RuntimeEvent::TaskCompleted {
            session_id: id,
            title,
        });
        self.emit(RuntimeEvent::SessionsChanged);
    }

    /// Evict in-RAM buffers of dormant sessions. The governor decides when;
    /// eligibility is re-checked here, under the single writer, so the
    /// visible session, streaming sessions, and just-deleted sessions are
    /// never touched.
    async fn handle_evict(&mut self, trigger: EvictTrigger) {
        let current = self.store.current_id();
        let mut evicted = 0usize;

        for id in self.store.ids() {
            if id == current || self.streaming.contains(&id) {
                continue;
            }

            let idle = match trigger {
                EvictTrigger::Scan => self
                    .states
                    .get(&id)
                    .is_none_or(|s| s.last_access.elapsed() >= self.config.idle_threshold),
                EvictTrigger::Pressure(_) => true,
            };
            if !idle {
                continue;
            }

            let has_buffer = self.store.has_live(id);
            let has_trace = self.states.get(&id).is_some_and(|s| !s.thinking.is_empty());
            if !has_buffer && !has_trace {
                continue;
            }
            if !self.store.contains(id) {
                continue;
            }

            // Durable record is updated before the buffer is dropped, so
            // rehydration on next access loses nothing.
            self.store.drop_live(id);
            if let Some(state) = self.states.get_mut(&id) {
                state.clear_for_eviction();
            }
            evicted += 1;
        }

        if evicted > 0 {
            debug!(evicted, ?trigger, "evicted dormant session buffers");
            self.persist().await;
        }
    }
}

/// Cloneable handle to the runtime actor.
#[derive(Clone)]
pub struct RuntimeHandle {
    cmd_tx: mpsc::Sender<RuntimeCmd>,
    pressure_tx: mpsc::Sender<MemoryPressure>,
    events: broadcast::Sender<RuntimeEvent>,
}

impl RuntimeHandle {
    pub async fn send_message(
        &self,
        text: impl Into<String>,
        target: Option<SessionId>,
        images: Vec<String>,
    ) -> Result<SessionId, RuntimeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(RuntimeCmd::SendMessage {
                text: text.into(),
                target,
                images,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        reply_rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    pub async fn queue_message(
        &self,
        session_id: SessionId,
        text: impl Into<String>,
    ) -> Result<(), RuntimeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(RuntimeCmd::QueueMessage {
                session_id,
                text: text.into(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        reply_rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Stop the in-flight turn. Returns whether anything was cancelled.
    pub async fn cancel_agent(&self, target: Option<SessionId>) -> Result<bool, RuntimeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(RuntimeCmd::CancelAgent {
                target,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        reply_rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Re-run the last prompt of a stopped or failed turn.
    pub async fn resume(&self, target: Option<SessionId>) -> Result<bool, RuntimeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(RuntimeCmd::Resume {
                target,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        reply_rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    pub async fn switch_to_session(&self, session_id: SessionId) -> Result<(), RuntimeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(RuntimeCmd::SwitchTo {
                session_id,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        reply_rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    pub async fn new_session(&self) -> Result<SessionId, RuntimeError> {
        self.create_session(None).await
    }

    /// New conversation linked to an external task or topic.
    pub async fn new_task_session(
        &self,
        task_id: impl Into<String>,
    ) -> Result<SessionId, RuntimeError> {
        self.create_session(Some(task_id.into())).await
    }

    async fn create_session(
        &self,
        linked_task_id: Option<String>,
    ) -> Result<SessionId, RuntimeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(RuntimeCmd::NewSession {
                linked_task_id,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        reply_rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    pub async fn delete_session(&self, session_id: SessionId) -> Result<(), RuntimeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(RuntimeCmd::DeleteSession {
                session_id,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        reply_rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>, RuntimeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(RuntimeCmd::ListSessions { reply: reply_tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        reply_rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Live message window of a session.
    pub async fn session_messages(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<ChatMessage>, RuntimeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(RuntimeCmd::SessionMessages {
                session_id,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        reply_rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Complete history, including anything beyond the eager window.
    pub async fn full_history(
        &self,
        session_id: SessionId,
    ) -> Result<Option<Vec<ChatMessage>>, RuntimeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(RuntimeCmd::FullHistory {
                session_id,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        reply_rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    pub async fn thinking_steps(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<TraceEntry>, RuntimeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(RuntimeCmd::ThinkingSteps {
                session_id,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        reply_rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    pub async fn current_session(&self) -> Result<SessionId, RuntimeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(RuntimeCmd::CurrentSession { reply: reply_tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        reply_rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    pub async fn streaming_sessions(&self) -> Result<Vec<SessionId>, RuntimeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(RuntimeCmd::StreamingSessions { reply: reply_tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        reply_rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Forward an OS memory-pressure notification to the governor.
    pub async fn memory_pressure(&self, pressure: MemoryPressure) {
        let _ = self.pressure_tx.send(pressure).await;
    }

    /// Write the durable snapshot immediately, bypassing the debounce.
    pub async fn save_now(&self) -> Result<(), RuntimeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(RuntimeCmd::SaveNow { reply: reply_tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        reply_rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.try_send(RuntimeCmd::Shutdown);
    }
}

/// Owns the runtime actor task.
pub struct RuntimeService {
    handle: RuntimeHandle,
    task: JoinHandle<()>,
}

impl RuntimeService {
    /// Spawn against the HTTP agent endpoint from the config.
    pub async fn connect(config: RuntimeConfig) -> crate::error::Result<Self> {
        let client = crate::api::AgentClient::new(config.endpoint.as_str(), config.request_timeout)?;
        Self::spawn(config, Arc::new(client)).await
    }

    pub async fn spawn(
        config: RuntimeConfig,
        api: Arc<dyn AgentApi>,
    ) -> crate::error::Result<Self> {
        let path = config.session_file()?;
        let store = match PersistenceManager::load(&path).await? {
            Some(snapshot) => SessionStore::from_snapshot(
                snapshot,
                config.rehydrate_window,
                config.live_message_cap,
            ),
            None => SessionStore::new(config.rehydrate_window, config.live_message_cap),
        };

        let persistence = PersistenceManager::spawn(path, config.save_debounce);
        let (update_tx, update_rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        let (evict_tx, evict_rx) = mpsc::channel(8);
        let governor = MemoryGovernor::spawn(config.evict_scan_interval, evict_tx);
        let pressure_tx = governor.pressure_sender();
        let (events, _) = broadcast::channel(EVENT_BROADCAST_CAPACITY);
        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_CAPACITY);

        let mut states = HashMap::new();
        states.insert(store.current_id(), SessionState::new());

        let runtime = Runtime {
            config,
            api,
            store,
            states,
            streaming: HashSet::new(),
            persistence,
            governor,
            events: events.clone(),
            update_tx,
            turn_counter: 0,
        };
        let task = tokio::spawn(runtime.run(cmd_rx, update_rx, evict_rx));

        info!("runtime started");

        Ok(Self {
            handle: RuntimeHandle {
                cmd_tx,
                pressure_tx,
                events,
            },
            task,
        })
    }

    pub fn handle(&self) -> RuntimeHandle {
        self.handle.clone()
    }

    /// Stop the actor: cancels in-flight streams and flushes persistence.
    pub async fn shutdown(self) {
        self.handle.shutdown();
        let _ = self.task.await;
    }
}
