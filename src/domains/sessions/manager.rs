use super::stream::{StreamEntry, StreamHeaders, StreamProducer, StreamReader, StreamService};
use super::watcher::{DEFAULT_POLL_INTERVAL, ExternalMessageHandler, StreamWatcher};
use crate::domains::agents::{AgentConnector, AgentSession, AgentSessionOptions};
use crate::errors::CoordinatorError;
use crate::infrastructure::events::{
    CoordinatorEvent, EventBus, SessionErrorPayload, SessionLifecyclePayload,
};
use anyhow::Result;
use dashmap::DashSet;
use log::{error, info, warn};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use uuid::Uuid;

/// One registered agent conversation. The `turn` mutex keeps at most one
/// message in flight per session; `abort` carries the preemption signal the
/// in-flight turn listens on.
struct ManagedSession {
    session_id: String,
    agent: Arc<dyn AgentSession>,
    producer: Option<Arc<dyn StreamProducer>>,
    turn: Mutex<()>,
    abort: Mutex<Option<watch::Sender<bool>>>,
    resume_token: Mutex<Option<String>>,
    watcher: std::sync::Mutex<Option<StreamWatcher>>,
}

/// Owns the live agent sessions: starts and resumes them, routes user
/// messages (direct or picked up from the stream), persists every agent
/// event verbatim, and preempts the running turn when a newer message
/// arrives.
///
/// A failed turn never tears the session down. The error is published as an
/// event and the session stays registered for the next message.
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Arc<ManagedSession>>>,
    // Ids reserved by an in-flight start, so the sessions lock never has to
    // be held across agent/stream construction.
    starting: DashSet<String>,
    connector: Arc<dyn AgentConnector>,
    streams: Arc<dyn StreamService>,
    reader: Arc<dyn StreamReader>,
    events: EventBus,
    poll_interval: Duration,
}

/// A turn that has been registered as the session's newest message but not
/// driven yet. Registration order decides preemption; driving can happen
/// concurrently.
struct PreparedTurn {
    session: Arc<ManagedSession>,
    abort_rx: watch::Receiver<bool>,
    text: String,
    message_id: String,
}

impl SessionManager {
    pub fn new(
        connector: Arc<dyn AgentConnector>,
        streams: Arc<dyn StreamService>,
        reader: Arc<dyn StreamReader>,
        events: EventBus,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            starting: DashSet::new(),
            connector,
            streams,
            reader,
            events,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    #[cfg(test)]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Create (or resume, when a token is given) an agent session and start
    /// watching its stream for externally-injected user messages. Starting an
    /// already-running session is a no-op.
    pub async fn start_session(
        self: &Arc<Self>,
        session_id: &str,
        options: AgentSessionOptions,
        resume_token: Option<&str>,
    ) -> Result<()> {
        if self.sessions.lock().await.contains_key(session_id) {
            warn!("Session {session_id} already running, ignoring start");
            return Ok(());
        }
        if !self.starting.insert(session_id.to_string()) {
            warn!("Session {session_id} already starting, ignoring start");
            return Ok(());
        }

        let result = self.start_session_inner(session_id, options, resume_token).await;
        self.starting.remove(session_id);
        result
    }

    async fn start_session_inner(
        self: &Arc<Self>,
        session_id: &str,
        options: AgentSessionOptions,
        resume_token: Option<&str>,
    ) -> Result<()> {
        // Persistence is best-effort: a session without a stream still runs,
        // it just leaves no durable transcript.
        let producer = match self.streams.connect(session_id).await {
            Ok(producer) => Some(producer),
            Err(err) => {
                warn!("Stream unavailable for {session_id}, running without persistence: {err}");
                None
            }
        };

        let agent: Arc<dyn AgentSession> = match resume_token {
            Some(token) => {
                info!("Resuming agent session {session_id}");
                Arc::from(self.connector.resume_session(token, &options).await?)
            }
            None => Arc::from(self.connector.create_session(&options).await?),
        };

        let watcher = StreamWatcher::start(
            Arc::clone(&self.reader),
            session_id.to_string(),
            self.poll_interval,
            self.spawn_external_dispatcher(session_id),
        );

        let session = Arc::new(ManagedSession {
            session_id: session_id.to_string(),
            agent,
            producer,
            turn: Mutex::new(()),
            abort: Mutex::new(None),
            resume_token: Mutex::new(resume_token.map(str::to_string)),
            watcher: std::sync::Mutex::new(Some(watcher)),
        });

        self.sessions
            .lock()
            .await
            .insert(session_id.to_string(), session);

        self.events.publish(
            CoordinatorEvent::SessionStarted,
            &SessionLifecyclePayload {
                session_id: session_id.to_string(),
            },
        );
        Ok(())
    }

    /// External messages from one poll batch must preempt each other in
    /// stream order, so a single dispatcher task registers every turn
    /// sequentially before the turns run concurrently. The dispatcher exits
    /// when the watcher (the only sender) is stopped.
    fn spawn_external_dispatcher(self: &Arc<Self>, session_id: &str) -> ExternalMessageHandler {
        let (entry_tx, mut entry_rx) = mpsc::unbounded_channel::<StreamEntry>();

        let manager = Arc::clone(self);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            while let Some(entry) = entry_rx.recv().await {
                let Some(text) = entry
                    .value
                    .get("text")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                else {
                    warn!("External message {} has no text, skipping", entry.key);
                    continue;
                };
                let Some(turn) = manager
                    .prepare_turn(&session_id, &text, &entry.headers.message_id)
                    .await
                else {
                    continue;
                };
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.drive_turn(turn).await });
            }
        });

        Arc::new(move |entry: StreamEntry| {
            // Send only fails once the dispatcher is gone, i.e. after stop.
            let _ = entry_tx.send(entry);
        })
    }

    /// Submit a user message on behalf of the embedding UI.
    pub async fn send_message(&self, session_id: &str, text: &str) -> Result<()> {
        let message_id = Uuid::new_v4().to_string();
        self.process_message(session_id, text, &message_id).await
    }

    /// Run one conversation turn. Any turn already in flight for the session
    /// is aborted first; the newest message always wins.
    ///
    /// Turn failures are reported via `SessionError` events rather than
    /// returned, so a flaky agent never poisons the callers above.
    pub async fn process_message(
        &self,
        session_id: &str,
        text: &str,
        message_id: &str,
    ) -> Result<()> {
        if let Some(turn) = self.prepare_turn(session_id, text, message_id).await {
            self.drive_turn(turn).await;
        }
        Ok(())
    }

    /// Register a message as the session's newest turn: the current abort
    /// slot is replaced and the previous holder signalled. Returns `None`
    /// (after publishing a `SessionError`) for unknown sessions.
    async fn prepare_turn(
        &self,
        session_id: &str,
        text: &str,
        message_id: &str,
    ) -> Option<PreparedTurn> {
        let session = {
            let sessions = self.sessions.lock().await;
            sessions.get(session_id).cloned()
        };
        let Some(session) = session else {
            self.publish_session_error(
                session_id,
                &CoordinatorError::SessionNotFound {
                    session_id: session_id.to_string(),
                }
                .to_string(),
            );
            return None;
        };

        // Signal the in-flight turn (if any) before queueing on the turn
        // lock, so it unwinds instead of finishing ahead of us.
        let (abort_tx, abort_rx) = watch::channel(false);
        if let Some(previous) = session.abort.lock().await.replace(abort_tx) {
            let _ = previous.send(true);
        }

        Some(PreparedTurn {
            session,
            abort_rx,
            text: text.to_string(),
            message_id: message_id.to_string(),
        })
    }

    async fn drive_turn(&self, turn: PreparedTurn) {
        let PreparedTurn {
            session,
            mut abort_rx,
            text,
            message_id,
        } = turn;
        let session_id = session.session_id.clone();

        let _turn = session.turn.lock().await;
        if *abort_rx.borrow() {
            // A newer message preempted this one while it waited its turn.
            return;
        }

        if let Some(producer) = &session.producer {
            let entry = StreamEntry {
                key: message_id.clone(),
                value: json!({ "text": &text }),
                headers: StreamHeaders {
                    role: "user".to_string(),
                    message_id: message_id.clone(),
                    origin: None,
                },
            };
            if let Err(err) = producer.append(&entry).await {
                warn!("Failed to persist user message for {session_id}: {err}");
            }
        }

        if let Err(err) = session.agent.send(&text).await {
            error!("Agent send failed for {session_id}: {err}");
            self.publish_session_error(&session_id, &err.to_string());
            return;
        }

        let response_id = Uuid::new_v4().to_string();
        let mut seq: u64 = 0;
        loop {
            tokio::select! {
                changed = abort_rx.changed() => {
                    // A closed channel means the session was stopped.
                    if changed.is_err() || *abort_rx.borrow() {
                        info!("Turn for {session_id} preempted");
                        break;
                    }
                }
                event = session.agent.next_event() => {
                    match event {
                        Ok(Some(value)) => {
                            if let Some(token) =
                                value.get("session_id").and_then(|v| v.as_str())
                            {
                                *session.resume_token.lock().await = Some(token.to_string());
                            }
                            if let Some(producer) = &session.producer {
                                let entry = StreamEntry {
                                    key: format!("{response_id}:{seq}"),
                                    value,
                                    headers: StreamHeaders {
                                        role: "assistant".to_string(),
                                        message_id: response_id.clone(),
                                        origin: None,
                                    },
                                };
                                if let Err(err) = producer.append(&entry).await {
                                    warn!(
                                        "Failed to persist agent event for {session_id}: {err}"
                                    );
                                }
                            }
                            seq += 1;
                        }
                        Ok(None) => break,
                        Err(err) => {
                            error!("Agent stream failed for {session_id}: {err}");
                            self.publish_session_error(&session_id, &err.to_string());
                            break;
                        }
                    }
                }
            }
        }

        if let Some(producer) = &session.producer
            && let Err(err) = producer.flush().await
        {
            warn!("Failed to flush stream for {session_id}: {err}");
        }
    }

    /// Abort the in-flight turn, if any. The session stays running.
    pub async fn interrupt(&self, session_id: &str) -> Result<()> {
        let sessions = self.sessions.lock().await;
        let session = sessions.get(session_id).ok_or_else(|| {
            CoordinatorError::SessionNotFound {
                session_id: session_id.to_string(),
            }
        })?;
        if let Some(abort) = session.abort.lock().await.as_ref() {
            let _ = abort.send(true);
        }
        Ok(())
    }

    /// Latest resume token captured from the agent's event stream.
    pub async fn resume_token(&self, session_id: &str) -> Option<String> {
        let sessions = self.sessions.lock().await;
        let session = sessions.get(session_id)?.clone();
        drop(sessions);
        session.resume_token.lock().await.clone()
    }

    pub async fn is_running(&self, session_id: &str) -> bool {
        self.sessions.lock().await.contains_key(session_id)
    }

    /// Tear the session down: abort the in-flight turn, stop the watcher,
    /// close the agent, seal the stream. Stopping an unknown session is a
    /// no-op.
    pub async fn stop_session(&self, session_id: &str) -> Result<()> {
        let session = {
            let mut sessions = self.sessions.lock().await;
            sessions.remove(session_id)
        };
        let Some(session) = session else {
            warn!("Session {session_id} not running, ignoring stop");
            return Ok(());
        };

        if let Some(abort) = session.abort.lock().await.take() {
            let _ = abort.send(true);
        }
        if let Some(mut watcher) = session.watcher.lock().unwrap().take() {
            watcher.stop();
        }
        if let Err(err) = session.agent.close().await {
            warn!("Agent close failed for {session_id}: {err}");
        }
        if let Some(producer) = &session.producer {
            if let Err(err) = producer.flush().await {
                warn!("Stream flush failed for {session_id}: {err}");
            }
            if let Err(err) = producer.close().await {
                warn!("Stream close failed for {session_id}: {err}");
            }
        }

        self.events.publish(
            CoordinatorEvent::SessionStopped,
            &SessionLifecyclePayload {
                session_id: session.session_id.clone(),
            },
        );
        Ok(())
    }

    pub async fn stop_all(&self) {
        let session_ids: Vec<String> = {
            let sessions = self.sessions.lock().await;
            sessions.keys().cloned().collect()
        };
        for session_id in session_ids {
            if let Err(err) = self.stop_session(&session_id).await {
                warn!("Failed to stop session {session_id}: {err}");
            }
        }
    }

    fn publish_session_error(&self, session_id: &str, message: &str) {
        self.events.publish(
            CoordinatorEvent::SessionError,
            &SessionErrorPayload {
                session_id: session_id.to_string(),
                error: message.to_string(),
            },
        );
    }
}
