use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use usher_core::events::TurnEvent;
use usher_core::ids::SessionId;
use usher_core::session::{Session, SessionState};
use usher_engine::runner::{TurnInput, TurnRunner};
use usher_engine::EngineError;
use usher_store::sessions::SessionRepo;
use usher_store::{Database, StoreError};

/// Inbound message from the transport.
#[derive(Clone, Debug)]
pub struct SubmitParams {
    pub session_id: SessionId,
    pub text: String,
    pub confirm_consent: Option<bool>,
}

/// Acknowledgement that a turn was accepted; results stream as TurnEvents.
#[derive(Clone, Debug)]
pub struct SubmitResult {
    pub turn_ref: String,
}

struct ActiveTurn {
    cancel: CancellationToken,
    _started_at: Instant,
}

/// Maps transport messages to Turn Orchestrator invocations, enforcing the
/// per-session exclusion: exactly one turn in flight per session id. A second
/// concurrent submit is rejected with SessionBusy rather than queued, so
/// session mutation can never interleave.
pub struct SessionGateway {
    runner: Arc<TurnRunner>,
    sessions: SessionRepo,
    event_tx: broadcast::Sender<TurnEvent>,
    active_turns: Arc<DashMap<SessionId, ActiveTurn>>,
}

impl SessionGateway {
    pub fn new(
        runner: Arc<TurnRunner>,
        db: Database,
        event_tx: broadcast::Sender<TurnEvent>,
    ) -> Self {
        Self {
            runner,
            sessions: SessionRepo::new(db),
            event_tx,
            active_turns: Arc::new(DashMap::new()),
        }
    }

    /// Accept an inbound turn. Loads (or creates) the session, acquires the
    /// per-session slot, and runs the turn in a background task. Events stream
    /// through the broadcast channel.
    #[instrument(skip(self, params), fields(session_id = %params.session_id))]
    pub async fn submit_turn(&self, params: SubmitParams) -> Result<SubmitResult, EngineError> {
        // Acquire the exclusion slot first; holding the entry makes the
        // busy-check and the insert one atomic step.
        let cancel = CancellationToken::new();
        match self.active_turns.entry(params.session_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(EngineError::SessionBusy(params.session_id.to_string()));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(ActiveTurn {
                    cancel: cancel.clone(),
                    _started_at: Instant::now(),
                });
            }
        }

        let session = match self.acquire_session(&params.session_id) {
            Ok(session) => session,
            Err(e) => {
                self.active_turns.remove(&params.session_id);
                return Err(e);
            }
        };

        let turn_ref = uuid::Uuid::now_v7().to_string();
        let runner = Arc::clone(&self.runner);
        let active_turns = Arc::clone(&self.active_turns);
        let event_tx = self.event_tx.clone();
        let session_id = params.session_id.clone();
        let input = TurnInput {
            text: params.text,
            confirm_consent: params.confirm_consent,
        };

        tokio::spawn(async move {
            let mut session = session;
            let result = runner.run_turn(&mut session, input, &cancel).await;

            match result {
                Ok(outcome) => {
                    info!(session_id = %session_id, turn_index = outcome.turn_index, "turn completed");
                }
                Err(EngineError::Aborted) => {
                    // Cancelled mid-flight: state stays at the last checkpoint
                    info!(session_id = %session_id, "turn aborted");
                }
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "turn failed");
                    let _ = event_tx.send(TurnEvent::Error {
                        session_id: session_id.clone(),
                        message: "The assistant hit an internal problem with that turn.".into(),
                    });
                }
            }

            active_turns.remove(&session_id);
        });

        Ok(SubmitResult { turn_ref })
    }

    /// Load the session, creating it on first contact and reinitializing it
    /// when the stored state is expired or unrecoverable.
    fn acquire_session(&self, id: &SessionId) -> Result<Session, EngineError> {
        match self.sessions.load(id) {
            Ok(session) if session.state == SessionState::Expired => {
                info!(session_id = %id, "session expired, reinitializing");
                self.reset_session(id, "Your previous conversation expired, so we're starting fresh.")
            }
            Ok(session) => Ok(session),
            Err(StoreError::NotFound(_)) => {
                // First inbound message for a new id
                Ok(self.sessions.create(id)?)
            }
            Err(StoreError::CorruptRow { .. }) => {
                warn!(session_id = %id, "session checkpoint unrecoverable, reinitializing");
                self.reset_session(id, "I'm sorry - I couldn't restore our earlier conversation, so we're starting fresh.")
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drop the stored state and start over; the user is told transparently
    /// that context was reset. Prior identifiers are not recoverable.
    fn reset_session(&self, id: &SessionId, message: &str) -> Result<Session, EngineError> {
        self.sessions.delete(id)?;
        let session = self.sessions.create(id)?;
        let _ = self.event_tx.send(TurnEvent::ContextReset {
            session_id: id.clone(),
            message: message.to_string(),
        });
        Ok(session)
    }

    /// Cancel the in-flight turn for a session (client abort or disconnect).
    /// Model and tool work in progress is abandoned; the per-session slot is
    /// released by the turn task; state stays at the last checkpoint.
    pub fn abort(&self, session_id: &SessionId) -> bool {
        if let Some(active) = self.active_turns.get(session_id) {
            active.cancel.cancel();
            true
        } else {
            false
        }
    }

    pub fn is_running(&self, session_id: &SessionId) -> bool {
        self.active_turns.contains_key(session_id)
    }

    pub fn active_count(&self) -> usize {
        self.active_turns.len()
    }

    pub fn abort_all(&self) -> usize {
        let count = self.active_turns.len();
        for entry in self.active_turns.iter() {
            entry.value().cancel.cancel();
        }
        count
    }
}
