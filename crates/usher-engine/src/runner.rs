use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use usher_core::errors::ModelError;
use usher_core::events::TurnEvent;
use usher_core::protocol::{Decision, ToolCallRequest};
use usher_core::provider::{ModelProvider, PromptContext, ProposedAction};
use usher_core::session::{PendingConsent, Session, SessionState};
use usher_core::tools::{ToolContext, ToolError};
use usher_core::turns::TurnRecord;
use usher_store::sessions::SessionRepo;
use usher_store::summaries::SummaryRepo;
use usher_store::{Database, StoreError};

use crate::error::EngineError;
use crate::guard::ProtocolGuard;
use crate::registry::ToolRegistry;
use crate::summarize::{milestone_for, SummaryTriggers, SUMMARIZE_TOOL};

/// Configuration for one turn's execution. Timeouts are per operation class;
/// the keyword vocabulary and the canned texts are business configuration.
#[derive(Clone, Debug)]
pub struct TurnConfig {
    pub model_timeout: Duration,
    /// Protocol/argument rejections absorbed before giving up on the turn.
    pub max_corrective_rounds: u32,
    /// Tool-use cycles allowed within one turn.
    pub max_tool_rounds: u32,
    /// Character size of the partial-text chunks (typing effect).
    pub reply_chunk_size: usize,
    pub summary_triggers: SummaryTriggers,
    pub apology_text: String,
    pub fallback_text: String,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            model_timeout: Duration::from_secs(60),
            max_corrective_rounds: 2,
            max_tool_rounds: 8,
            reply_chunk_size: 24,
            summary_triggers: SummaryTriggers::default(),
            apology_text: "I'm sorry - I ran into a temporary problem while processing that. \
                           Could we try again in a moment?"
                .into(),
            fallback_text: "I wasn't able to complete that step. Could you rephrase, or give \
                            me a bit more detail?"
                .into(),
        }
    }
}

/// One inbound message. `confirm_consent` is the explicit user confirmation
/// event; it is honored only while a consent request is pending.
#[derive(Clone, Debug)]
pub struct TurnInput {
    pub text: String,
    pub confirm_consent: Option<bool>,
}

impl TurnInput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            confirm_consent: None,
        }
    }
}

/// Result of a completed turn.
#[derive(Clone, Debug)]
pub struct TurnOutcome {
    pub reply: String,
    /// Index of the assistant turn in the session's total order.
    pub turn_index: u64,
}

/// Drives one conversation turn through the state machine: model proposal,
/// guard validation, tool execution, atomic effect application, the silent
/// summarization check, and the reply. The session is checkpointed after
/// every effect application and after the summarization check, so a crash
/// never loses an executed tool effect.
pub struct TurnRunner {
    provider: Arc<dyn ModelProvider>,
    registry: Arc<ToolRegistry>,
    guard: ProtocolGuard,
    sessions: SessionRepo,
    summaries: SummaryRepo,
    event_tx: broadcast::Sender<TurnEvent>,
    config: TurnConfig,
}

impl TurnRunner {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        registry: Arc<ToolRegistry>,
        db: Database,
        event_tx: broadcast::Sender<TurnEvent>,
        config: TurnConfig,
    ) -> Self {
        let guard = registry.guard();
        Self {
            provider,
            registry,
            guard,
            sessions: SessionRepo::new(db.clone()),
            summaries: SummaryRepo::new(db),
            event_tx,
            config,
        }
    }

    fn send_event(&self, event: TurnEvent) {
        if self.event_tx.send(event).is_err() {
            debug!("no event receivers, event dropped");
        }
    }

    /// Execute one turn. Cancellation leaves the session at its last
    /// checkpoint; no partial effect application is ever visible.
    #[instrument(skip(self, session, input, cancel), fields(session_id = %session.id))]
    pub async fn run_turn(
        &self,
        session: &mut Session,
        input: TurnInput,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Aborted);
        }

        self.send_event(TurnEvent::Processing { session_id: session.id.clone() });
        session.state = SessionState::Active;

        // Explicit user confirmation event. A flag gating a tool is never
        // synthesized here; it is set only when a request was pending.
        if let Some(granted) = input.confirm_consent {
            match session.resolve_consent(granted) {
                Some(resolved) => {
                    info!(tool = %resolved.tool, granted, "consent resolved by user event");
                }
                None => debug!("confirmation event without pending consent request ignored"),
            }
        }

        let user_turn_index = session.record_turn(TurnRecord::user(&input.text));
        self.sessions.checkpoint(session)?;

        let mut notes: Vec<String> = Vec::new();
        let mut corrective_rounds = 0u32;
        let mut tool_rounds = 0u32;
        let mut booked_appointment: Option<String> = None;
        let mut consent_event: Option<(String, String)> = None;

        let reply = loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Aborted);
            }

            let context = PromptContext {
                turns: session.turns.clone(),
                flags: session.flags.clone(),
                identifiers: session.identifiers.clone(),
                tools: self.registry.descriptors(),
                notes: notes.clone(),
            };

            let action = match self.propose(&context, cancel).await {
                Ok(action) => action,
                Err(ModelError::Cancelled) => return Err(EngineError::Aborted),
                Err(e) => {
                    warn!(error = %e, "model proposal failed after bounded retry");
                    break self.config.apology_text.clone();
                }
            };

            match action {
                ProposedAction::Reply { text } => break text,

                ProposedAction::ConsentRequest { tool, prompt } => {
                    let Some(gate) = self.guard.descriptor(&tool).and_then(|d| d.consent.clone())
                    else {
                        corrective_rounds += 1;
                        if corrective_rounds > self.config.max_corrective_rounds {
                            break self.config.fallback_text.clone();
                        }
                        notes.push(format!(
                            "`{tool}` has no consent requirement; do not request consent for it."
                        ));
                        continue;
                    };
                    session.pending_consent = Some(PendingConsent {
                        tool: tool.clone(),
                        flag: gate.flag,
                        prompt: prompt.clone(),
                    });
                    consent_event = Some((tool, prompt.clone()));
                    break prompt;
                }

                ProposedAction::ToolCall(call) => match self.guard.evaluate(session, &call) {
                    Decision::Deny(reason) => {
                        warn!(tool = %call.name, %reason, "tool call denied");
                        corrective_rounds += 1;
                        if corrective_rounds > self.config.max_corrective_rounds {
                            break self.config.fallback_text.clone();
                        }
                        notes.push(format!(
                            "The call to `{}` was rejected: {}. Adjust your plan; never invent \
                             identifiers or skip protocol steps.",
                            call.name, reason
                        ));
                        continue;
                    }

                    Decision::RequiresConfirmation { prompt } => {
                        let flag = self
                            .guard
                            .descriptor(&call.name)
                            .and_then(|d| d.consent.as_ref().map(|g| g.flag.clone()))
                            .unwrap_or_else(|| "consent_given".into());
                        session.pending_consent = Some(PendingConsent {
                            tool: call.name.clone(),
                            flag,
                            prompt: prompt.clone(),
                        });
                        consent_event = Some((call.name.clone(), prompt.clone()));
                        break prompt;
                    }

                    Decision::Allow => {
                        self.send_event(TurnEvent::ToolStart {
                            session_id: session.id.clone(),
                            tool_call_id: call.id.clone(),
                            tool_name: call.name.clone(),
                        });

                        let tctx = ToolContext::new(
                            session.id.clone(),
                            user_turn_index,
                            session.flags.clone(),
                            session.identifiers.clone(),
                            cancel.clone(),
                        );
                        let started = Instant::now();
                        let result = self.registry.invoke(&self.guard, &call, session, &tctx).await;

                        self.send_event(TurnEvent::ToolEnd {
                            session_id: session.id.clone(),
                            tool_call_id: call.id.clone(),
                            tool_name: call.name.clone(),
                            is_error: result.is_err(),
                            duration_ms: started.elapsed().as_millis() as u64,
                        });

                        match result {
                            Ok(output) => {
                                // The single mutation point for business state
                                if let Err(conflict) = session.apply_delta(&output.delta) {
                                    error!(%conflict, tool = %call.name, "effect delta rejected");
                                    corrective_rounds += 1;
                                    if corrective_rounds > self.config.max_corrective_rounds {
                                        break self.config.fallback_text.clone();
                                    }
                                    notes.push(format!(
                                        "The result of `{}` was discarded: {conflict}.",
                                        call.name
                                    ));
                                    continue;
                                }

                                if let Some(apt) = output.delta.identifiers.get("appointment_id") {
                                    booked_appointment = Some(apt.clone());
                                }

                                session.record_turn(TurnRecord::tool(output.content.to_string()));
                                self.sessions.checkpoint(session)?;

                                tool_rounds += 1;
                                if tool_rounds >= self.config.max_tool_rounds {
                                    warn!(tool_rounds, "max tool rounds reached");
                                    break self.config.fallback_text.clone();
                                }
                                continue;
                            }
                            Err(ToolError::Cancelled) => return Err(EngineError::Aborted),
                            Err(e @ (ToolError::ExternalService(_) | ToolError::Timeout(_))) => {
                                warn!(tool = %call.name, error = %e, "tool failed after bounded retry");
                                break self.config.apology_text.clone();
                            }
                            Err(e) => {
                                corrective_rounds += 1;
                                if corrective_rounds > self.config.max_corrective_rounds {
                                    break self.config.fallback_text.clone();
                                }
                                notes.push(format!(
                                    "The call to `{}` failed: {e}. Correct the call and try again.",
                                    call.name
                                ));
                                continue;
                            }
                        }
                    }
                },
            }
        };

        // Mandatory silent summarization at milestones
        if let Some(milestone) = milestone_for(
            booked_appointment.as_deref(),
            &input.text,
            user_turn_index,
            &self.config.summary_triggers,
        ) {
            if !session.milestone_fired(&milestone) {
                self.run_summarizer(session, &milestone, user_turn_index, cancel).await;
                self.sessions.checkpoint(session)?;
            }
        }

        if let Some((tool_name, prompt)) = consent_event {
            self.send_event(TurnEvent::ConsentRequired {
                session_id: session.id.clone(),
                tool_name,
                prompt,
            });
        }

        for chunk in chunk_text(&reply, self.config.reply_chunk_size) {
            self.send_event(TurnEvent::PartialText {
                session_id: session.id.clone(),
                delta: chunk,
            });
        }

        let turn_index = session.record_turn(TurnRecord::assistant(&reply));
        session.state = SessionState::Checkpointed;
        self.sessions.checkpoint(session)?;

        self.send_event(TurnEvent::FinalText {
            session_id: session.id.clone(),
            text: reply.clone(),
        });
        self.send_event(TurnEvent::Completed {
            session_id: session.id.clone(),
            turn_index,
        });

        Ok(TurnOutcome { reply, turn_index })
    }

    /// Model call under the configured timeout, with the single bounded retry
    /// on transport failure.
    async fn propose(
        &self,
        context: &PromptContext,
        cancel: &CancellationToken,
    ) -> Result<ProposedAction, ModelError> {
        let mut attempt = 0u32;
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(ModelError::Cancelled),
                r = tokio::time::timeout(self.config.model_timeout, self.provider.propose(context)) => {
                    match r {
                        Ok(inner) => inner,
                        Err(_) => Err(ModelError::Timeout(self.config.model_timeout)),
                    }
                }
            };
            match result {
                Ok(action) => return Ok(action),
                Err(e) if e.is_retryable() && attempt == 0 => {
                    warn!(error = %e, "retrying model proposal");
                    attempt = 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Invoke the summarizer through the registry path and persist the result.
    /// A failure leaves the milestone unfired so a later trigger retries it;
    /// the turn itself always completes.
    async fn run_summarizer(
        &self,
        session: &mut Session,
        milestone: &str,
        user_turn_index: u64,
        cancel: &CancellationToken,
    ) {
        let call = ToolCallRequest::new(
            SUMMARIZE_TOOL,
            serde_json::json!({
                "transcript": session.turns,
                "turn_index": user_turn_index,
            }),
        );
        let tctx = ToolContext::new(
            session.id.clone(),
            user_turn_index,
            session.flags.clone(),
            session.identifiers.clone(),
            cancel.clone(),
        );

        match self.registry.invoke(&self.guard, &call, session, &tctx).await {
            Ok(output) => {
                match self.summaries.record(&session.id, milestone, output.content) {
                    Ok(_) | Err(StoreError::Conflict(_)) => {
                        if let Err(conflict) = session.apply_delta(&output.delta) {
                            warn!(%conflict, "summary effect delta rejected");
                        }
                        session.mark_milestone(milestone);
                        info!(milestone, "conversation summarized");
                    }
                    Err(e) => error!(error = %e, milestone, "failed to persist summary"),
                }
            }
            Err(e) => warn!(error = %e, milestone, "summarizer failed, milestone left unfired"),
        }
    }
}

/// Split a reply into fixed-size character chunks for the typing effect.
pub fn chunk_text(text: &str, size: usize) -> Vec<String> {
    if size == 0 {
        return vec![text.to_string()];
    }
    text.chars()
        .collect::<Vec<_>>()
        .chunks(size)
        .map(|c| c.iter().collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use usher_core::ids::SessionId;
    use usher_core::protocol::{EffectDelta, ToolDescriptor};
    use usher_core::tools::{Tool, ToolOutput};
    use usher_llm::mock::{MockModel, MockReply};

    use crate::backends::{InMemoryAppointmentBook, InMemoryDirectory, InMemoryRoster, Specialist};
    use crate::tools::{create_default_registry, ToolBackends};

    struct EmptyRetriever;

    #[async_trait]
    impl usher_core::retrieval::Retriever for EmptyRetriever {
        async fn search(
            &self,
            _query: &str,
            _corpus: &str,
            _k: usize,
        ) -> Result<Vec<usher_core::retrieval::RetrievalHit>, usher_core::retrieval::RetrievalError>
        {
            Ok(Vec::new())
        }
    }

    fn roster() -> Vec<Specialist> {
        vec![Specialist {
            specialist_id: "PS-301".into(),
            name: "Mika".into(),
            title: "Cloud Migration Architect".into(),
            products: vec!["AWS".into()],
            skills: vec!["migration".into()],
            industries: vec!["retail".into()],
        }]
    }

    struct Harness {
        runner: TurnRunner,
        session: Session,
        model: Arc<MockModel>,
        db: Database,
        events: broadcast::Receiver<TurnEvent>,
    }

    fn harness(model: MockModel) -> Harness {
        let db = Database::in_memory().unwrap();
        let session = SessionRepo::new(db.clone()).create(&SessionId::new()).unwrap();
        let model = Arc::new(model);

        let registry = Arc::new(create_default_registry(ToolBackends {
            directory: Arc::new(InMemoryDirectory::new()),
            appointments: Arc::new(InMemoryAppointmentBook::new()),
            roster: Arc::new(InMemoryRoster::new(roster())),
            retriever: Arc::new(EmptyRetriever),
            provider: Arc::clone(&model) as Arc<dyn ModelProvider>,
        }));

        let (tx, events) = broadcast::channel(256);
        let runner = TurnRunner::new(
            Arc::clone(&model) as Arc<dyn ModelProvider>,
            registry,
            db.clone(),
            tx,
            TurnConfig::default(),
        );

        Harness { runner, session, model, db, events }
    }

    fn drain(events: &mut broadcast::Receiver<TurnEvent>) -> Vec<TurnEvent> {
        let mut out = Vec::new();
        while let Ok(e) = events.try_recv() {
            out.push(e);
        }
        out
    }

    #[tokio::test]
    async fn plain_reply_turn() {
        let mut h = harness(MockModel::new(vec![MockReply::reply("Happy to help!")]));
        let cancel = CancellationToken::new();

        let outcome = h
            .runner
            .run_turn(&mut h.session, TurnInput::text("hello"), &cancel)
            .await
            .unwrap();

        assert_eq!(outcome.reply, "Happy to help!");
        assert_eq!(h.session.turn_count(), 2);

        // Durable state matches
        let restored = SessionRepo::new(h.db.clone()).load(&h.session.id).unwrap();
        assert_eq!(restored.turn_count(), 2);
        assert_eq!(restored.state, SessionState::Checkpointed);

        let types: Vec<&str> = drain(&mut h.events).iter().map(|e| e.event_type()).collect::<Vec<_>>();
        assert_eq!(types.first(), Some(&"processing"));
        assert!(types.contains(&"partial_text"));
        assert!(types.contains(&"final_text"));
        assert_eq!(types.last(), Some(&"completed"));
    }

    #[tokio::test]
    async fn partial_chunks_reassemble_reply() {
        let mut h = harness(MockModel::new(vec![MockReply::reply(
            "We handle migration, modernization, and cloud operations.",
        )]));
        let cancel = CancellationToken::new();
        let outcome = h
            .runner
            .run_turn(&mut h.session, TurnInput::text("what do you do?"), &cancel)
            .await
            .unwrap();

        let mut assembled = String::new();
        for event in drain(&mut h.events) {
            if let TurnEvent::PartialText { delta, .. } = event {
                assembled.push_str(&delta);
            }
        }
        assert_eq!(assembled, outcome.reply);
    }

    #[tokio::test]
    async fn tool_call_records_identifier() {
        let mut h = harness(MockModel::new(vec![
            MockReply::tool_call("find_specialist", serde_json::json!({"query": "migration help"})),
            MockReply::reply("Mika is our migration architect."),
        ]));
        let cancel = CancellationToken::new();

        let outcome = h
            .runner
            .run_turn(&mut h.session, TurnInput::text("I need an expert"), &cancel)
            .await
            .unwrap();

        assert_eq!(h.session.identifiers.get("specialist_id"), Some("PS-301"));
        assert!(h.session.flags.is_set("specialist_selected"));
        assert!(outcome.reply.contains("Mika"));
        // user + tool result + assistant
        assert_eq!(h.session.turn_count(), 3);

        // The identifier survived the checkpoint
        let restored = SessionRepo::new(h.db.clone()).load(&h.session.id).unwrap();
        assert_eq!(restored.identifiers.get("specialist_id"), Some("PS-301"));
    }

    #[tokio::test]
    async fn booking_denied_without_customer_id() {
        let mut h = harness(MockModel::new(vec![
            MockReply::tool_call(
                "book_appointment",
                serde_json::json!({"slot_datetime": "2026-03-02 11:00:00", "reason": "kickoff"}),
            ),
            MockReply::reply("Let me first set up your profile."),
        ]));
        let cancel = CancellationToken::new();

        let outcome = h
            .runner
            .run_turn(&mut h.session, TurnInput::text("book me a slot"), &cancel)
            .await
            .unwrap();

        // Denied, corrected through the feedback loop, no identifier written
        assert!(!h.session.identifiers.contains("appointment_id"));
        assert_eq!(h.model.propose_calls(), 2);
        assert_eq!(outcome.reply, "Let me first set up your profile.");
    }

    #[tokio::test]
    async fn consent_gated_tool_pauses_for_confirmation() {
        let mut h = harness(MockModel::new(vec![MockReply::tool_call(
            "onboard_customer",
            serde_json::json!({"company_name": "Acme", "name": "Dana", "email": "dana@acme.test"}),
        )]));
        let cancel = CancellationToken::new();

        let outcome = h
            .runner
            .run_turn(&mut h.session, TurnInput::text("sign me up"), &cancel)
            .await
            .unwrap();

        let pending = h.session.pending_consent.as_ref().unwrap();
        assert_eq!(pending.tool, "onboard_customer");
        assert_eq!(pending.flag, "consent_given");
        assert_eq!(outcome.reply, pending.prompt);
        assert!(!h.session.identifiers.contains("customer_id"));

        let types: Vec<String> = drain(&mut h.events)
            .iter()
            .map(|e| e.event_type().to_string())
            .collect();
        assert!(types.contains(&"consent_required".to_string()));
    }

    #[tokio::test]
    async fn confirmation_event_unlocks_gated_tool() {
        let mut h = harness(MockModel::new(vec![
            // First turn: the model goes straight for the gated tool
            MockReply::tool_call(
                "onboard_customer",
                serde_json::json!({"company_name": "Acme", "name": "Dana", "email": "dana@acme.test"}),
            ),
            // Second turn: consent granted, onboarding goes through
            MockReply::tool_call(
                "onboard_customer",
                serde_json::json!({"company_name": "Acme", "name": "Dana", "email": "dana@acme.test"}),
            ),
            MockReply::reply("You're all set, Dana."),
        ]));
        let cancel = CancellationToken::new();

        h.runner
            .run_turn(&mut h.session, TurnInput::text("sign me up"), &cancel)
            .await
            .unwrap();
        assert!(h.session.pending_consent.is_some());

        let outcome = h
            .runner
            .run_turn(
                &mut h.session,
                TurnInput { text: "yes please".into(), confirm_consent: Some(true) },
                &cancel,
            )
            .await
            .unwrap();

        assert!(h.session.flags.is_set("consent_given"));
        assert_eq!(h.session.identifiers.get("customer_id"), Some("CUST-001"));
        assert!(h.session.pending_consent.is_none());
        assert!(outcome.reply.contains("all set"));
    }

    #[tokio::test]
    async fn affirmative_text_without_pending_consent_is_noop() {
        let mut h = harness(MockModel::new(vec![MockReply::reply(
            "Great! What would you like to achieve?",
        )]));
        let cancel = CancellationToken::new();

        h.runner
            .run_turn(&mut h.session, TurnInput::text("I agree, sign me up"), &cancel)
            .await
            .unwrap();

        // No consent-requiring tool call was pending: nothing was set
        assert!(!h.session.flags.is_set("consent_given"));
        assert!(h.session.pending_consent.is_none());
    }

    #[tokio::test]
    async fn confirmation_event_without_pending_request_ignored() {
        let mut h = harness(MockModel::new(vec![MockReply::reply("Noted.")]));
        let cancel = CancellationToken::new();

        h.runner
            .run_turn(
                &mut h.session,
                TurnInput { text: "yes".into(), confirm_consent: Some(true) },
                &cancel,
            )
            .await
            .unwrap();

        assert!(!h.session.flags.is_set("consent_given"));
    }

    #[tokio::test]
    async fn model_consent_request_sets_pending() {
        let mut h = harness(MockModel::new(vec![MockReply::consent_request(
            "onboard_customer",
            "May I save your contact details?",
        )]));
        let cancel = CancellationToken::new();

        let outcome = h
            .runner
            .run_turn(&mut h.session, TurnInput::text("onboard me"), &cancel)
            .await
            .unwrap();

        assert_eq!(outcome.reply, "May I save your contact details?");
        assert_eq!(h.session.pending_consent.as_ref().unwrap().flag, "consent_given");
    }

    #[tokio::test]
    async fn booking_triggers_exactly_one_summary() {
        let mut h = harness(
            MockModel::new(vec![
                MockReply::tool_call(
                    "book_appointment",
                    serde_json::json!({"slot_datetime": "2026-03-02 11:00:00", "reason": "kickoff"}),
                ),
                MockReply::reply("Your consultation is booked."),
            ])
            .with_generations(vec![Ok(
                r#"{"summary": "Dana from Acme booked a migration kickoff"}"#.into(),
            )]),
        );
        let cancel = CancellationToken::new();

        // Satisfy booking preconditions the way earlier turns would have
        h.session
            .apply_delta(
                &EffectDelta::new()
                    .with_identifier("customer_id", "CUST-001")
                    .with_identifier("specialist_id", "PS-301"),
            )
            .unwrap();

        let outcome = h
            .runner
            .run_turn(&mut h.session, TurnInput::text("book the 11:00 slot"), &cancel)
            .await
            .unwrap();

        let apt = h.session.identifiers.get("appointment_id").unwrap().to_string();
        assert!(h.session.milestone_fired(&format!("booking:{apt}")));
        assert_eq!(h.model.generate_calls(), 1);

        let summaries = SummaryRepo::new(h.db.clone()).list(&h.session.id).unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].milestone, format!("booking:{apt}"));

        // The silent protocol: the summary never reaches the user
        assert!(!outcome.reply.contains("Dana from Acme booked"));
        for event in drain(&mut h.events) {
            if let TurnEvent::FinalText { text, .. } = event {
                assert!(!text.contains("Dana from Acme booked"));
            }
        }
        assert!(h.session.flags.is_set("last_summary_turn_index"));
    }

    #[tokio::test]
    async fn keyword_triggers_summary_once() {
        let mut h = harness(
            MockModel::new(vec![
                MockReply::reply("Understood, noting your budget."),
                MockReply::reply("Anything else?"),
            ])
            .with_generations(vec![Ok(r#"{"summary": "budget 50k"}"#.into())]),
        );
        let cancel = CancellationToken::new();

        h.runner
            .run_turn(&mut h.session, TurnInput::text("our budget is 50k"), &cancel)
            .await
            .unwrap();
        assert_eq!(h.model.generate_calls(), 1);

        // A turn without a trigger does not summarize again
        h.runner
            .run_turn(&mut h.session, TurnInput::text("thanks"), &cancel)
            .await
            .unwrap();
        assert_eq!(h.model.generate_calls(), 1);
        assert_eq!(SummaryRepo::new(h.db.clone()).count(&h.session.id).unwrap(), 1);
    }

    #[tokio::test]
    async fn summarizer_failure_does_not_block_reply() {
        let mut h = harness(
            MockModel::new(vec![MockReply::reply("Noted.")]).with_generations(vec![
                Err(ModelError::Overloaded),
                Err(ModelError::Overloaded),
            ]),
        );
        let cancel = CancellationToken::new();

        let outcome = h
            .runner
            .run_turn(&mut h.session, TurnInput::text("our budget is 50k"), &cancel)
            .await
            .unwrap();

        assert_eq!(outcome.reply, "Noted.");
        // Milestone left unfired so a later trigger can retry
        assert!(h.session.fired_milestones.is_empty());
        assert_eq!(SummaryRepo::new(h.db.clone()).count(&h.session.id).unwrap(), 0);
    }

    struct FlakyTool {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Tool for FlakyTool {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor::new("flaky_lookup", "transient backend")
                .with_effect_flag("lookup_done")
        }

        async fn execute(
            &self,
            _args: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<ToolOutput, ToolError> {
            if self.calls.fetch_add(1, Ordering::Relaxed) == 0 {
                return Err(ToolError::ExternalService("backend hiccup".into()));
            }
            Ok(ToolOutput {
                content: serde_json::json!({"ok": true}),
                delta: EffectDelta::new().with_flag("lookup_done", true),
            })
        }
    }

    #[tokio::test]
    async fn transient_tool_failure_retried_one_effect_applied() {
        let db = Database::in_memory().unwrap();
        let mut session = SessionRepo::new(db.clone()).create(&SessionId::new()).unwrap();
        let model = Arc::new(MockModel::new(vec![
            MockReply::tool_call("flaky_lookup", serde_json::json!({})),
            MockReply::reply("Found it."),
        ]));

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(FlakyTool { calls: AtomicUsize::new(0) }));

        let (tx, _rx) = broadcast::channel(64);
        let runner = TurnRunner::new(
            Arc::clone(&model) as Arc<dyn ModelProvider>,
            Arc::new(registry),
            db,
            tx,
            TurnConfig::default(),
        );

        let cancel = CancellationToken::new();
        let outcome = runner
            .run_turn(&mut session, TurnInput::text("look it up"), &cancel)
            .await
            .unwrap();

        // Exactly one effect applied, success surfaced to the user
        assert!(session.flags.is_set("lookup_done"));
        assert_eq!(outcome.reply, "Found it.");
    }

    #[tokio::test]
    async fn persistent_tool_failure_becomes_apology() {
        struct DownTool;

        #[async_trait]
        impl Tool for DownTool {
            fn descriptor(&self) -> ToolDescriptor {
                ToolDescriptor::new("down_tool", "always failing")
            }
            async fn execute(
                &self,
                _args: serde_json::Value,
                _ctx: &ToolContext,
            ) -> Result<ToolOutput, ToolError> {
                Err(ToolError::ExternalService("still down".into()))
            }
        }

        let db = Database::in_memory().unwrap();
        let mut session = SessionRepo::new(db.clone()).create(&SessionId::new()).unwrap();
        let model = Arc::new(MockModel::new(vec![MockReply::tool_call(
            "down_tool",
            serde_json::json!({}),
        )]));

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(DownTool));

        let (tx, _rx) = broadcast::channel(64);
        let config = TurnConfig::default();
        let apology = config.apology_text.clone();
        let runner = TurnRunner::new(
            Arc::clone(&model) as Arc<dyn ModelProvider>,
            Arc::new(registry),
            db,
            tx,
            config,
        );

        let cancel = CancellationToken::new();
        let outcome = runner
            .run_turn(&mut session, TurnInput::text("try it"), &cancel)
            .await
            .unwrap();
        assert_eq!(outcome.reply, apology);
    }

    #[tokio::test]
    async fn model_transport_failure_retried_once() {
        let mut h = harness(MockModel::new(vec![
            MockReply::Error(ModelError::NetworkError("reset".into())),
            MockReply::reply("Recovered."),
        ]));
        let cancel = CancellationToken::new();

        let outcome = h
            .runner
            .run_turn(&mut h.session, TurnInput::text("hi"), &cancel)
            .await
            .unwrap();
        assert_eq!(outcome.reply, "Recovered.");
        assert_eq!(h.model.propose_calls(), 2);
    }

    #[tokio::test]
    async fn model_failure_after_retry_becomes_apology() {
        let mut h = harness(MockModel::new(vec![
            MockReply::Error(ModelError::ServerError { status: 500, body: "a".into() }),
            MockReply::Error(ModelError::ServerError { status: 500, body: "b".into() }),
        ]));
        let cancel = CancellationToken::new();

        let outcome = h
            .runner
            .run_turn(&mut h.session, TurnInput::text("hi"), &cancel)
            .await
            .unwrap();
        assert_eq!(outcome.reply, TurnConfig::default().apology_text);
        // The apology is still a durable assistant turn
        assert_eq!(h.session.turn_count(), 2);
    }

    #[tokio::test]
    async fn repeated_denials_hit_fallback() {
        let mut h = harness(MockModel::new(vec![
            MockReply::tool_call("no_such_tool", serde_json::json!({})),
            MockReply::tool_call("no_such_tool", serde_json::json!({})),
            MockReply::tool_call("no_such_tool", serde_json::json!({})),
        ]));
        let cancel = CancellationToken::new();

        let outcome = h
            .runner
            .run_turn(&mut h.session, TurnInput::text("do the thing"), &cancel)
            .await
            .unwrap();
        assert_eq!(outcome.reply, TurnConfig::default().fallback_text);
        assert_eq!(h.model.propose_calls(), 3);
    }

    #[tokio::test]
    async fn cancellation_before_start_leaves_session_untouched() {
        let mut h = harness(MockModel::new(vec![MockReply::reply("never")]));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = h
            .runner
            .run_turn(&mut h.session, TurnInput::text("hello"), &cancel)
            .await;
        assert!(matches!(result, Err(EngineError::Aborted)));
        assert_eq!(h.session.turn_count(), 0);

        let restored = SessionRepo::new(h.db.clone()).load(&h.session.id).unwrap();
        assert_eq!(restored.turn_count(), 0);
        assert_eq!(restored.checkpoint_version, 0);
    }

    #[test]
    fn chunk_text_splits_and_reassembles() {
        let chunks = chunk_text("hello world", 4);
        assert_eq!(chunks, vec!["hell", "o wo", "rld"]);
        assert_eq!(chunks.concat(), "hello world");
        assert!(chunk_text("", 4).is_empty());
        assert_eq!(chunk_text("abc", 0), vec!["abc"]);
    }
}
