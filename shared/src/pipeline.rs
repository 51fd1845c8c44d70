//! AI run lifecycle: the state machine that turns a queued run into a draft
//! and reconciles it onto its ticket.
//!
//! A run moves `queued -> running -> done | error` and never leaves a terminal
//! state. Processing the same run id more than once is safe: every transition
//! is a conditional store write, and a terminal run short-circuits.
//!
//! Ticket reconciliation is decided by [`plan_reconciliation`], a pure
//! function of the freshly loaded ticket, the run and the org's AI
//! enablement. The plan is applied with a version compare-and-swap and
//! re-planned if another writer got there first.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::drafting::DraftingClient;
use crate::heuristic::{self, TicketSignals};
use crate::models::{
    AiRun, AiSettings, AiStatus, Analysis, DraftSource, NewNotification, Priority, RunCompletion,
    RunStatus, Ticket, TicketPatch, TicketStatus,
};
use crate::store::TicketStore;
use crate::{Error, Result};

const MAX_RECONCILE_ATTEMPTS: usize = 3;

/// Notification type raised when a run fails.
pub const RUN_FAILED_NOTIFICATION: &str = "ai_run_failed";

/// Result of one invocation of the pipeline for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<DraftSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunOutcome {
    fn from_run(run: &AiRun) -> Self {
        Self {
            run_id: run.id,
            status: run.status,
            source: run.source,
            error: run.error.clone(),
        }
    }
}

/// Why a completed run left the ticket alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// AI is disabled and this run is not the ticket's latest.
    AiDisabled,
    /// A newer run has been triggered for the ticket.
    Superseded,
}

/// What a completed run is allowed to write onto its ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// AI was disabled while the run was in flight; drop the pending marker.
    ClearAiStatus,
    /// Leave the ticket untouched.
    Skip(SkipReason),
    /// The draft changed after the run started; only touch `ai_status`.
    KeepHumanDraft(AiStatus),
    /// Write the run's draft, confidence and sentiment.
    WriteDraft,
}

impl Reconciliation {
    /// Patch for `ticket`, or `None` when nothing would change.
    pub fn patch(&self, ticket: &Ticket, analysis: &Analysis) -> Option<TicketPatch> {
        let patch = match self {
            Reconciliation::Skip(_) => return None,
            Reconciliation::ClearAiStatus => {
                if ticket.ai_status.is_none() {
                    return None;
                }
                TicketPatch {
                    ai_status: Some(None),
                    ..Default::default()
                }
            }
            Reconciliation::KeepHumanDraft(status) => {
                if ticket.ai_status == Some(*status) {
                    return None;
                }
                TicketPatch {
                    ai_status: Some(Some(*status)),
                    ..Default::default()
                }
            }
            Reconciliation::WriteDraft => TicketPatch {
                ai_status: Some(Some(AiStatus::DraftReady)),
                draft_response: Some(analysis.draft_response.clone()),
                confidence: Some(analysis.confidence),
                sentiment: Some(analysis.sentiment),
                ..Default::default()
            },
        };
        Some(patch)
    }
}

/// Decide how a finished run may touch its ticket.
///
/// Checks run in order: AI enablement, latest-run-wins, then human-edit
/// safety (`draft_updated_at` at or after the run's `started_at`).
pub fn plan_reconciliation(ticket: &Ticket, run: &AiRun, ai_enabled: bool) -> Reconciliation {
    let is_latest = ticket.latest_run_id == Some(run.id);

    if !ai_enabled {
        return if is_latest {
            Reconciliation::ClearAiStatus
        } else {
            Reconciliation::Skip(SkipReason::AiDisabled)
        };
    }

    if !is_latest {
        return Reconciliation::Skip(SkipReason::Superseded);
    }

    let edited_since_start = match (ticket.draft_updated_at, run.started_at) {
        (Some(edited_at), Some(started_at)) => edited_at >= started_at,
        // A run without a start time cannot prove it is newer than the edit.
        (Some(_), None) => true,
        (None, _) => false,
    };

    if edited_since_start {
        let status = match ticket.ai_status {
            Some(AiStatus::HumanNeeded) => AiStatus::HumanNeeded,
            _ => AiStatus::DraftReady,
        };
        return Reconciliation::KeepHumanDraft(status);
    }

    Reconciliation::WriteDraft
}

/// Drives runs through their lifecycle.
pub struct RunManager {
    store: Arc<dyn TicketStore>,
    drafting: Option<DraftingClient>,
}

impl RunManager {
    /// `drafting` is `None` when no generative provider is configured.
    pub fn new(store: Arc<dyn TicketStore>, drafting: Option<DraftingClient>) -> Self {
        Self { store, drafting }
    }

    /// Process one run. Safe to call repeatedly and concurrently for the same
    /// run id.
    ///
    /// Errors are returned only when the run does not exist or when the store
    /// fails before the run can be started or while recording a failure.
    pub async fn process_run(&self, run_id: Uuid) -> Result<RunOutcome> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("AI run {}", run_id)))?;

        if run.status.is_terminal() {
            info!(run_id = %run_id, status = %run.status, "Run already finished; nothing to do");
            return Ok(RunOutcome::from_run(&run));
        }

        let Some(run) = self.store.start_run(run_id).await? else {
            return self.current_outcome(run_id).await;
        };

        info!(run_id = %run.id, ticket_id = %run.ticket_id, "Processing AI run");

        let mut settings = None;
        match self.execute(&run, &mut settings).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!(run_id = %run.id, ticket_id = %run.ticket_id, error = %e, "AI run failed");
                self.record_failure(&run, settings, &e.to_string()).await
            }
        }
    }

    /// Fail a run that never got processed, e.g. one whose hand-off kept
    /// getting lost. No-op for terminal runs.
    pub async fn abandon_run(&self, run_id: Uuid, reason: &str) -> Result<RunOutcome> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("AI run {}", run_id)))?;

        if run.status.is_terminal() {
            return Ok(RunOutcome::from_run(&run));
        }

        warn!(run_id = %run_id, reason, "Abandoning AI run");
        self.record_failure(&run, None, reason).await
    }

    /// Steps 3-6: load, analyze, persist output, reconcile, finish.
    async fn execute(&self, run: &AiRun, settings_slot: &mut Option<AiSettings>) -> Result<RunOutcome> {
        let ticket = self
            .store
            .get_ticket(run.ticket_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Ticket {} for AI run {}", run.ticket_id, run.id)))?;

        let settings = self.store.get_org_settings(ticket.org_id).await?;
        *settings_slot = Some(settings.clone());

        let (analysis, source) = self.analyze(&ticket, &settings).await?;

        if !self.store.record_run_output(run.id, &analysis, source).await? {
            return self.current_outcome(run.id).await;
        }

        let reconciliation = self.reconcile(run, &analysis, &settings).await?;
        debug!(run_id = %run.id, ?reconciliation, "Ticket reconciled");

        if !self.store.finish_run(run.id, RunCompletion::Done).await? {
            return self.current_outcome(run.id).await;
        }

        info!(run_id = %run.id, source = %source, "AI run completed");

        Ok(RunOutcome {
            run_id: run.id,
            status: RunStatus::Done,
            source: Some(source),
            error: None,
        })
    }

    /// Generative draft if possible, heuristic otherwise. Only store errors
    /// propagate; a missing customer or a provider failure falls back.
    async fn analyze(&self, ticket: &Ticket, settings: &AiSettings) -> Result<(Analysis, DraftSource)> {
        if let Some(drafting) = &self.drafting {
            match self.store.get_customer(ticket.customer_id).await? {
                Some(customer) => match drafting.generate(ticket, &customer, settings).await {
                    Ok(analysis) => return Ok((analysis, DraftSource::Generative)),
                    Err(e) => {
                        warn!(ticket_id = %ticket.id, error = %e, "Generative draft failed; using heuristic analysis");
                    }
                },
                None => {
                    warn!(
                        ticket_id = %ticket.id,
                        customer_id = %ticket.customer_id,
                        "Customer not found; using heuristic analysis"
                    );
                }
            }
        }

        let signals = TicketSignals {
            priority: ticket.priority,
            content: &ticket.content,
            category: ticket.category,
            subject: &ticket.subject,
        };
        Ok((heuristic::analyze(&signals, settings.persona), DraftSource::Heuristic))
    }

    async fn reconcile(&self, run: &AiRun, analysis: &Analysis, settings: &AiSettings) -> Result<Reconciliation> {
        for attempt in 1..=MAX_RECONCILE_ATTEMPTS {
            let ticket = self
                .store
                .get_ticket(run.ticket_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("Ticket {}", run.ticket_id)))?;

            let plan = plan_reconciliation(&ticket, run, settings.ai_enabled);
            let Some(patch) = plan.patch(&ticket, analysis) else {
                return Ok(plan);
            };

            if self
                .store
                .update_ticket(ticket.id, Some(ticket.version), patch)
                .await?
            {
                return Ok(plan);
            }

            debug!(run_id = %run.id, attempt, "Ticket changed during reconciliation; re-planning");
        }

        Err(Error::Conflict(format!(
            "Ticket {} kept changing during reconciliation",
            run.ticket_id
        )))
    }

    /// Mark the run failed, return the ticket to a human and notify operators.
    async fn record_failure(&self, run: &AiRun, settings: Option<AiSettings>, message: &str) -> Result<RunOutcome> {
        let failure = RunCompletion::Failed {
            error: message.to_string(),
        };
        if !self.store.finish_run(run.id, failure).await? {
            return self.current_outcome(run.id).await;
        }

        let outcome = RunOutcome {
            run_id: run.id,
            status: RunStatus::Error,
            source: None,
            error: Some(message.to_string()),
        };

        let Some(ticket) = self.store.get_ticket(run.ticket_id).await? else {
            warn!(run_id = %run.id, ticket_id = %run.ticket_id, "Ticket missing; skipping failure bookkeeping");
            return Ok(outcome);
        };

        let settings = match settings {
            Some(settings) => settings,
            None => self.store.get_org_settings(ticket.org_id).await?,
        };

        if ticket.latest_run_id == Some(run.id) {
            let ai_status = settings.ai_enabled.then_some(AiStatus::HumanNeeded);
            let patch = TicketPatch {
                status: Some(TicketStatus::Open),
                ai_status: Some(ai_status),
                ..Default::default()
            };
            self.store.update_ticket(ticket.id, None, patch).await?;
        }

        self.store
            .insert_notification(NewNotification {
                org_id: ticket.org_id,
                kind: RUN_FAILED_NOTIFICATION.to_string(),
                priority: Priority::High,
                title: "AI draft failed".to_string(),
                message: format!(
                    "The AI run for ticket \"{}\" failed and needs a human response: {}",
                    ticket.subject, message
                ),
                ticket_id: Some(ticket.id),
            })
            .await?;

        Ok(outcome)
    }

    /// Outcome of a run some other invocation already moved on.
    async fn current_outcome(&self, run_id: Uuid) -> Result<RunOutcome> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("AI run {}", run_id)))?;
        info!(run_id = %run_id, status = %run.status, "Run finished by another invocation");
        Ok(RunOutcome::from_run(&run))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drafting::testing::{valid_reply, ScriptedGenerator};
    use crate::drafting::{DraftingError, Prompt, TextGenerator};
    use crate::models::{Category, Urgency};
    use crate::store::memory::INTERLEAVED_AGENT_DRAFT;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    struct Harness {
        store: Arc<MemoryStore>,
        org_id: Uuid,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryStore::new()),
                org_id: Uuid::new_v4(),
            }
        }

        async fn ticket(&self) -> Ticket {
            self.store
                .seed_ticket(
                    self.org_id,
                    Category::Refund,
                    Priority::High,
                    "Refund please",
                    "I was charged twice, please refund me today.",
                )
                .await
        }

        /// Insert a queued run and point the ticket at it, as the trigger does.
        async fn queue_run(&self, ticket_id: Uuid) -> AiRun {
            let run = self.store.insert_run(ticket_id).await.unwrap();
            let patch = TicketPatch {
                latest_run_id: Some(run.id),
                ai_status: Some(Some(AiStatus::Pending)),
                ..Default::default()
            };
            self.store.update_ticket(ticket_id, None, patch).await.unwrap();
            run
        }

        fn manager(&self, generator: Option<Arc<dyn TextGenerator>>) -> RunManager {
            let drafting = generator.map(|g| DraftingClient::new(g, Duration::from_millis(200)));
            RunManager::new(self.store.clone(), drafting)
        }
    }

    fn replying(draft: &str, confidence: i32, sentiment: i32) -> Option<Arc<dyn TextGenerator>> {
        Some(Arc::new(ScriptedGenerator::replying(&valid_reply(draft, confidence, sentiment))))
    }

    /// Performs a human draft edit while the provider call is in flight.
    struct EditingGenerator {
        store: Arc<MemoryStore>,
        ticket_id: Uuid,
    }

    #[async_trait]
    impl TextGenerator for EditingGenerator {
        async fn complete(&self, _prompt: &Prompt) -> std::result::Result<String, DraftingError> {
            self.store
                .record_draft_edit(self.ticket_id, "Agent's own reply")
                .await
                .unwrap();
            Ok(valid_reply("AI reply", 90, 7))
        }
    }

    /// Disables AI for the org while the provider call is in flight.
    struct DisablingGenerator {
        store: Arc<MemoryStore>,
        org_id: Uuid,
    }

    #[async_trait]
    impl TextGenerator for DisablingGenerator {
        async fn complete(&self, _prompt: &Prompt) -> std::result::Result<String, DraftingError> {
            self.store.set_settings(self.org_id, AiSettings::disabled()).await;
            Ok(valid_reply("AI reply", 90, 7))
        }
    }

    #[tokio::test]
    async fn test_generative_run_writes_draft() {
        let h = Harness::new();
        let ticket = h.ticket().await;
        let run = h.queue_run(ticket.id).await;

        let outcome = h
            .manager(replying("We have refunded you.", 91, 3))
            .process_run(run.id)
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Done);
        assert_eq!(outcome.source, Some(DraftSource::Generative));

        let stored_run = h.store.run(run.id).await.unwrap();
        assert!(stored_run.started_at.is_some());
        assert!(stored_run.finished_at.is_some());
        assert_eq!(stored_run.urgency, Some(Urgency::High));

        let stored = h.store.ticket(ticket.id).await.unwrap();
        assert_eq!(stored.ai_status, Some(AiStatus::DraftReady));
        assert_eq!(stored.draft_response.as_deref(), Some("We have refunded you."));
        assert_eq!(stored.confidence, Some(91));
        assert_eq!(stored.sentiment, Some(3));
    }

    #[tokio::test]
    async fn test_terminal_run_is_a_no_op() {
        let h = Harness::new();
        let ticket = h.ticket().await;
        let run = h.queue_run(ticket.id).await;
        let generator = Arc::new(ScriptedGenerator::replying(&valid_reply("First", 80, 5)));
        let manager = h.manager(Some(generator.clone() as Arc<dyn TextGenerator>));

        let first = manager.process_run(run.id).await.unwrap();
        let writes_after_first = h.store.ticket_writes().await;
        let second = manager.process_run(run.id).await.unwrap();

        assert_eq!(first.status, RunStatus::Done);
        assert_eq!(second.status, RunStatus::Done);
        assert_eq!(h.store.ticket_writes().await, writes_after_first);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_errored_run_is_a_no_op() {
        let h = Harness::new();
        let ticket = h.ticket().await;
        let run = h.queue_run(ticket.id).await;
        let manager = h.manager(None);

        h.store.fail_next_ticket_updates(1);
        let first = manager.process_run(run.id).await.unwrap();
        let writes = h.store.ticket_writes().await;
        let notifications = h.store.notifications().await.len();

        let second = manager.process_run(run.id).await.unwrap();

        assert_eq!(first.status, RunStatus::Error);
        assert_eq!(second.status, RunStatus::Error);
        assert_eq!(second.error, first.error);
        assert_eq!(h.store.ticket_writes().await, writes);
        assert_eq!(h.store.notifications().await.len(), notifications);
    }

    #[tokio::test]
    async fn test_provider_failures_fall_back_to_heuristic() {
        let generators: Vec<Arc<dyn TextGenerator>> = vec![
            Arc::new(ScriptedGenerator::failing("503 from provider")),
            Arc::new(ScriptedGenerator::replying("I'm sorry, I can't do JSON today.")),
            Arc::new(ScriptedGenerator::replying(
                r#"{"intent":"x","urgency":"extreme","confidence":50,"sentiment":5,"draftResponse":"hi"}"#,
            )),
            Arc::new(
                ScriptedGenerator::replying(&valid_reply("too late", 50, 5))
                    .with_delay(Duration::from_secs(2)),
            ),
        ];

        for generator in generators {
            let h = Harness::new();
            let ticket = h.ticket().await;
            let run = h.queue_run(ticket.id).await;

            let outcome = h.manager(Some(generator)).process_run(run.id).await.unwrap();

            assert_eq!(outcome.status, RunStatus::Done);
            assert_eq!(outcome.source, Some(DraftSource::Heuristic));
            let stored = h.store.ticket(ticket.id).await.unwrap();
            assert_eq!(stored.ai_status, Some(AiStatus::DraftReady));
            assert!(stored.draft_response.unwrap().contains("refund request"));
        }
    }

    #[tokio::test]
    async fn test_no_provider_uses_heuristic() {
        let h = Harness::new();
        let ticket = h.ticket().await;
        let run = h.queue_run(ticket.id).await;

        let outcome = h.manager(None).process_run(run.id).await.unwrap();

        assert_eq!(outcome.source, Some(DraftSource::Heuristic));
        let stored_run = h.store.run(run.id).await.unwrap();
        assert_eq!(stored_run.intent.as_deref(), Some("Refund Request"));
        assert_eq!(stored_run.urgency, Some(Urgency::High));
    }

    #[tokio::test]
    async fn test_latest_run_wins_regardless_of_completion_order() {
        let h = Harness::new();
        let ticket = h.ticket().await;
        let r1 = h.queue_run(ticket.id).await;
        let r2 = h.queue_run(ticket.id).await;

        // R1 starts first but its provider call is slow; R2 finishes first.
        h.store.start_run(r1.id).await.unwrap();
        h.manager(replying("R2 draft", 70, 4)).process_run(r2.id).await.unwrap();
        h.manager(replying("R1 draft", 99, 9)).process_run(r1.id).await.unwrap();

        let stored = h.store.ticket(ticket.id).await.unwrap();
        assert_eq!(stored.latest_run_id, Some(r2.id));
        assert_eq!(stored.draft_response.as_deref(), Some("R2 draft"));
        assert_eq!(stored.confidence, Some(70));
        assert_eq!(stored.sentiment, Some(4));

        // The superseded run still keeps its own audit record.
        let r1_stored = h.store.run(r1.id).await.unwrap();
        assert_eq!(r1_stored.status, RunStatus::Done);
        assert_eq!(r1_stored.draft_response.as_deref(), Some("R1 draft"));
    }

    #[tokio::test]
    async fn test_human_edit_during_run_is_preserved() {
        let h = Harness::new();
        let ticket = h.ticket().await;
        let run = h.queue_run(ticket.id).await;

        let generator: Arc<dyn TextGenerator> = Arc::new(EditingGenerator {
            store: h.store.clone(),
            ticket_id: ticket.id,
        });
        let outcome = h.manager(Some(generator)).process_run(run.id).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Done);
        let stored = h.store.ticket(ticket.id).await.unwrap();
        assert_eq!(stored.draft_response.as_deref(), Some("Agent's own reply"));
        assert_eq!(stored.confidence, None);
        assert_eq!(stored.sentiment, None);
        assert_eq!(stored.ai_status, Some(AiStatus::DraftReady));
    }

    #[tokio::test]
    async fn test_human_edit_preserves_human_needed() {
        let h = Harness::new();
        let ticket = h.ticket().await;
        let run = h.queue_run(ticket.id).await;
        let patch = TicketPatch {
            ai_status: Some(Some(AiStatus::HumanNeeded)),
            ..Default::default()
        };
        h.store.update_ticket(ticket.id, None, patch).await.unwrap();

        let generator: Arc<dyn TextGenerator> = Arc::new(EditingGenerator {
            store: h.store.clone(),
            ticket_id: ticket.id,
        });
        h.manager(Some(generator)).process_run(run.id).await.unwrap();

        let stored = h.store.ticket(ticket.id).await.unwrap();
        assert_eq!(stored.ai_status, Some(AiStatus::HumanNeeded));
        assert_eq!(stored.draft_response.as_deref(), Some("Agent's own reply"));
    }

    #[tokio::test]
    async fn test_disabled_ai_clears_pending_status() {
        let h = Harness::new();
        let ticket = h.ticket().await;
        let run = h.queue_run(ticket.id).await;

        h.store.set_settings(h.org_id, AiSettings::disabled()).await;
        let outcome = h.manager(replying("AI reply", 90, 7)).process_run(run.id).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Done);
        let stored = h.store.ticket(ticket.id).await.unwrap();
        assert_eq!(stored.ai_status, None);
        assert_eq!(stored.draft_response, None);
        assert_eq!(stored.confidence, None);

        // Audit record is still written.
        let stored_run = h.store.run(run.id).await.unwrap();
        assert_eq!(stored_run.draft_response.as_deref(), Some("AI reply"));
    }

    #[tokio::test]
    async fn test_settings_change_mid_run_does_not_affect_run() {
        let h = Harness::new();
        let ticket = h.ticket().await;
        let run = h.queue_run(ticket.id).await;

        let generator: Arc<dyn TextGenerator> = Arc::new(DisablingGenerator {
            store: h.store.clone(),
            org_id: h.org_id,
        });
        h.manager(Some(generator)).process_run(run.id).await.unwrap();

        let stored = h.store.ticket(ticket.id).await.unwrap();
        assert_eq!(stored.ai_status, Some(AiStatus::DraftReady));
        assert_eq!(stored.draft_response.as_deref(), Some("AI reply"));
    }

    #[tokio::test]
    async fn test_disabled_ai_skips_stale_run_entirely() {
        let h = Harness::new();
        let ticket = h.ticket().await;
        let r1 = h.queue_run(ticket.id).await;
        let _r2 = h.queue_run(ticket.id).await;

        h.store.set_settings(h.org_id, AiSettings::disabled()).await;
        h.manager(None).process_run(r1.id).await.unwrap();

        let stored = h.store.ticket(ticket.id).await.unwrap();
        assert_eq!(stored.ai_status, Some(AiStatus::Pending));
    }

    #[tokio::test]
    async fn test_reconciliation_failure_returns_ticket_to_human() {
        let h = Harness::new();
        let ticket = h.ticket().await;
        let run = h.queue_run(ticket.id).await;
        let patch = TicketPatch {
            status: Some(TicketStatus::Resolved),
            ..Default::default()
        };
        h.store.update_ticket(ticket.id, None, patch).await.unwrap();

        h.store.fail_next_ticket_updates(1);
        let outcome = h.manager(replying("AI reply", 90, 7)).process_run(run.id).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Error);
        let stored_run = h.store.run(run.id).await.unwrap();
        assert_eq!(stored_run.status, RunStatus::Error);
        assert!(!stored_run.error.unwrap_or_default().is_empty());
        assert!(stored_run.finished_at.is_some());

        let stored = h.store.ticket(ticket.id).await.unwrap();
        assert_eq!(stored.status, TicketStatus::Open);
        assert_eq!(stored.ai_status, Some(AiStatus::HumanNeeded));

        let notifications = h.store.notifications().await;
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].ticket_id, Some(ticket.id));
        assert_eq!(notifications[0].priority, Priority::High);
        assert_eq!(notifications[0].kind, RUN_FAILED_NOTIFICATION);
    }

    #[tokio::test]
    async fn test_failure_with_ai_disabled_clears_status() {
        let h = Harness::new();
        let ticket = h.ticket().await;
        let run = h.queue_run(ticket.id).await;
        h.store.set_settings(h.org_id, AiSettings::disabled()).await;

        h.store.fail_next_ticket_updates(1);
        let outcome = h.manager(None).process_run(run.id).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Error);
        let stored = h.store.ticket(ticket.id).await.unwrap();
        assert_eq!(stored.status, TicketStatus::Open);
        assert_eq!(stored.ai_status, None);
        assert_eq!(h.store.notifications().await.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_ticket_errors_run() {
        let h = Harness::new();
        let ticket = h.ticket().await;
        let run = h.queue_run(ticket.id).await;
        h.store.remove_ticket(ticket.id).await;

        let outcome = h.manager(None).process_run(run.id).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Error);
        assert!(outcome.error.unwrap().contains("Ticket"));
        assert!(h.store.notifications().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_run_is_not_found() {
        let h = Harness::new();
        let err = h.manager(None).process_run(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_retry_of_running_run_keeps_started_at() {
        let h = Harness::new();
        let ticket = h.ticket().await;
        let run = h.queue_run(ticket.id).await;

        let started = h.store.start_run(run.id).await.unwrap().unwrap();
        h.manager(None).process_run(run.id).await.unwrap();

        let stored_run = h.store.run(run.id).await.unwrap();
        assert_eq!(stored_run.started_at, started.started_at);
        assert_eq!(stored_run.status, RunStatus::Done);
    }

    #[tokio::test]
    async fn test_abandon_queued_run() {
        let h = Harness::new();
        let ticket = h.ticket().await;
        let run = h.queue_run(ticket.id).await;

        let outcome = h.manager(None).abandon_run(run.id, "hand-off never delivered").await.unwrap();

        assert_eq!(outcome.status, RunStatus::Error);
        let stored = h.store.ticket(ticket.id).await.unwrap();
        assert_eq!(stored.ai_status, Some(AiStatus::HumanNeeded));
        assert_eq!(h.store.notifications().await.len(), 1);

        // Abandoning again changes nothing.
        h.manager(None).abandon_run(run.id, "again").await.unwrap();
        assert_eq!(h.store.notifications().await.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_customer_falls_back_to_heuristic() {
        let h = Harness::new();
        let ticket = h.ticket().await;
        let run = h.queue_run(ticket.id).await;
        h.store.remove_customer(ticket.customer_id).await;

        let generator = Arc::new(ScriptedGenerator::replying(&valid_reply("AI reply", 90, 7)));
        let outcome = h
            .manager(Some(generator.clone() as Arc<dyn TextGenerator>))
            .process_run(run.id)
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Done);
        assert_eq!(outcome.source, Some(DraftSource::Heuristic));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);

        let stored = h.store.ticket(ticket.id).await.unwrap();
        assert_eq!(stored.ai_status, Some(AiStatus::DraftReady));
        assert!(stored.draft_response.unwrap().contains("refund request"));
        assert!(h.store.notifications().await.is_empty());
    }

    #[tokio::test]
    async fn test_lost_version_check_replans_against_fresh_ticket() {
        let h = Harness::new();
        let ticket = h.ticket().await;
        let run = h.queue_run(ticket.id).await;

        // An agent edits the draft between the first read and the write.
        h.store.interleave_agent_edits(1);
        let outcome = h.manager(replying("AI reply", 90, 7)).process_run(run.id).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Done);
        let stored = h.store.ticket(ticket.id).await.unwrap();
        assert_eq!(stored.draft_response.as_deref(), Some(INTERLEAVED_AGENT_DRAFT));
        assert_eq!(stored.ai_status, Some(AiStatus::DraftReady));
        assert_eq!(stored.confidence, None);
        assert_eq!(stored.sentiment, None);
        assert!(h.store.notifications().await.is_empty());

        let stored_run = h.store.run(run.id).await.unwrap();
        assert_eq!(stored_run.draft_response.as_deref(), Some("AI reply"));
    }

    #[tokio::test]
    async fn test_ticket_that_keeps_changing_fails_run() {
        let h = Harness::new();
        let ticket = h.ticket().await;
        let run = h.queue_run(ticket.id).await;

        h.store.interleave_agent_edits(MAX_RECONCILE_ATTEMPTS);
        let outcome = h.manager(replying("AI reply", 90, 7)).process_run(run.id).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Error);
        assert!(outcome.error.unwrap().contains("kept changing"));

        let stored_run = h.store.run(run.id).await.unwrap();
        assert_eq!(stored_run.status, RunStatus::Error);
        assert!(stored_run.finished_at.is_some());

        let stored = h.store.ticket(ticket.id).await.unwrap();
        assert_eq!(stored.status, TicketStatus::Open);
        assert_eq!(stored.ai_status, Some(AiStatus::HumanNeeded));
        assert_eq!(stored.draft_response.as_deref(), Some(INTERLEAVED_AGENT_DRAFT));

        let notifications = h.store.notifications().await;
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].kind, RUN_FAILED_NOTIFICATION);
    }

    #[tokio::test]
    async fn test_failure_of_superseded_run_only_notifies() {
        let h = Harness::new();
        let ticket = h.ticket().await;
        let r1 = h.queue_run(ticket.id).await;
        let r2 = h.queue_run(ticket.id).await;
        let patch = TicketPatch {
            status: Some(TicketStatus::Resolved),
            ..Default::default()
        };
        h.store.update_ticket(ticket.id, None, patch).await.unwrap();
        let before = h.store.ticket(ticket.id).await.unwrap();

        let outcome = h.manager(None).abandon_run(r1.id, "hand-off never delivered").await.unwrap();

        assert_eq!(outcome.status, RunStatus::Error);
        assert_eq!(h.store.run(r1.id).await.unwrap().status, RunStatus::Error);

        let stored = h.store.ticket(ticket.id).await.unwrap();
        assert_eq!(stored.latest_run_id, Some(r2.id));
        assert_eq!(stored.status, TicketStatus::Resolved);
        assert_eq!(stored.ai_status, Some(AiStatus::Pending));
        assert_eq!(stored.version, before.version);

        let notifications = h.store.notifications().await;
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].ticket_id, Some(ticket.id));
        assert_eq!(notifications[0].kind, RUN_FAILED_NOTIFICATION);
    }

    fn planning_fixture() -> (Ticket, AiRun) {
        let now = Utc::now();
        let run_id = Uuid::new_v4();
        let ticket = Ticket {
            id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            subject: "s".into(),
            content: "c".into(),
            category: Category::General,
            priority: Priority::Low,
            status: TicketStatus::Open,
            ai_status: Some(AiStatus::Pending),
            latest_run_id: Some(run_id),
            draft_response: None,
            draft_updated_at: None,
            confidence: None,
            sentiment: None,
            version: 3,
            created_at: now,
            updated_at: now,
        };
        let run = AiRun {
            id: run_id,
            ticket_id: ticket.id,
            status: RunStatus::Running,
            started_at: Some(now),
            finished_at: None,
            intent: None,
            urgency: None,
            confidence: None,
            sentiment: None,
            draft_response: None,
            source: None,
            error: None,
            dispatch_attempts: 1,
            last_dispatched_at: None,
            created_at: now,
        };
        (ticket, run)
    }

    #[test]
    fn test_plan_checks_in_order() {
        let (mut ticket, run) = planning_fixture();
        assert_eq!(plan_reconciliation(&ticket, &run, true), Reconciliation::WriteDraft);
        assert_eq!(plan_reconciliation(&ticket, &run, false), Reconciliation::ClearAiStatus);

        ticket.draft_updated_at = run.started_at;
        assert_eq!(
            plan_reconciliation(&ticket, &run, true),
            Reconciliation::KeepHumanDraft(AiStatus::DraftReady)
        );

        ticket.draft_updated_at = run.started_at.map(|t| t - ChronoDuration::seconds(5));
        assert_eq!(plan_reconciliation(&ticket, &run, true), Reconciliation::WriteDraft);

        ticket.latest_run_id = Some(Uuid::new_v4());
        assert_eq!(
            plan_reconciliation(&ticket, &run, true),
            Reconciliation::Skip(SkipReason::Superseded)
        );
        assert_eq!(
            plan_reconciliation(&ticket, &run, false),
            Reconciliation::Skip(SkipReason::AiDisabled)
        );
    }

    #[test]
    fn test_plan_patches_only_what_changes() {
        let (mut ticket, _) = planning_fixture();
        let analysis = Analysis {
            intent: "i".into(),
            urgency: Urgency::Low,
            confidence: 77,
            sentiment: 6,
            draft_response: "d".into(),
        };

        ticket.ai_status = None;
        assert_eq!(Reconciliation::ClearAiStatus.patch(&ticket, &analysis), None);

        ticket.ai_status = Some(AiStatus::DraftReady);
        assert_eq!(
            Reconciliation::KeepHumanDraft(AiStatus::DraftReady).patch(&ticket, &analysis),
            None
        );

        let patch = Reconciliation::WriteDraft.patch(&ticket, &analysis).unwrap();
        assert_eq!(patch.draft_response.as_deref(), Some("d"));
        assert_eq!(patch.confidence, Some(77));
        assert_eq!(patch.sentiment, Some(6));
        assert_eq!(patch.status, None);
    }
}
