//! Entry points that start AI runs and record human draft edits.

use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatch::RunDispatcher;
use crate::models::{AiStatus, RunCompletion, TicketPatch};
use crate::store::TicketStore;
use crate::{Error, Result};

const MAX_TRIGGER_ATTEMPTS: usize = 3;

pub struct RunTrigger {
    store: Arc<dyn TicketStore>,
    dispatcher: Arc<dyn RunDispatcher>,
}

impl RunTrigger {
    pub fn new(store: Arc<dyn TicketStore>, dispatcher: Arc<dyn RunDispatcher>) -> Self {
        Self { store, dispatcher }
    }

    /// Start an AI run for a ticket and hand it to the worker.
    ///
    /// Returns the id of the run now responsible for the ticket's draft, or
    /// `None` when AI is disabled for the organization. Without `force`, a
    /// run that is still queued or running is reused instead of creating a
    /// new one.
    ///
    /// The ticket is pointed at the new run with a version check. When a
    /// concurrent trigger wins that write, the unused run is closed and the
    /// winner's in-flight run is returned.
    pub async fn trigger(&self, ticket_id: Uuid, force: bool) -> Result<Option<Uuid>> {
        for attempt in 1..=MAX_TRIGGER_ATTEMPTS {
            let ticket = self
                .store
                .get_ticket(ticket_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("Ticket {}", ticket_id)))?;

            if attempt == 1 {
                let settings = self.store.get_org_settings(ticket.org_id).await?;
                if !settings.ai_enabled {
                    info!(ticket_id = %ticket_id, org_id = %ticket.org_id, "AI disabled; not starting a run");
                    return Ok(None);
                }
            }

            // A run queued by a concurrent trigger satisfies a forced request too.
            if !force || attempt > 1 {
                if let Some(latest_id) = self.in_flight_run(ticket.latest_run_id).await? {
                    info!(ticket_id = %ticket_id, run_id = %latest_id, "Run already in flight");
                    return Ok(Some(latest_id));
                }
            }

            let run = self.store.insert_run(ticket_id).await?;
            let patch = TicketPatch {
                latest_run_id: Some(run.id),
                ai_status: Some(Some(AiStatus::Pending)),
                ..Default::default()
            };
            if !self
                .store
                .update_ticket(ticket_id, Some(ticket.version), patch)
                .await?
            {
                debug!(ticket_id = %ticket_id, run_id = %run.id, attempt, "Ticket changed while queuing run");
                let superseded = RunCompletion::Failed {
                    error: "Superseded by a concurrent trigger".to_string(),
                };
                self.store.finish_run(run.id, superseded).await?;
                continue;
            }

            info!(ticket_id = %ticket_id, run_id = %run.id, force, "AI run queued");

            match self.dispatcher.dispatch(run.id).await {
                Ok(()) => self.store.record_dispatch(run.id).await?,
                Err(e) => {
                    warn!(run_id = %run.id, error = %e, "Dispatch failed; run stays queued for the sweeper");
                }
            }

            return Ok(Some(run.id));
        }

        Err(Error::Conflict(format!(
            "Ticket {} kept changing while queuing an AI run",
            ticket_id
        )))
    }

    async fn in_flight_run(&self, run_id: Option<Uuid>) -> Result<Option<Uuid>> {
        let Some(run_id) = run_id else {
            return Ok(None);
        };
        let run = self.store.get_run(run_id).await?;
        Ok(run.filter(|r| r.status.is_in_flight()).map(|r| r.id))
    }
}

/// Record an agent's edit of a ticket's draft. Returns the ticket's new
/// version.
pub async fn record_draft_edit(store: &dyn TicketStore, ticket_id: Uuid, draft: &str) -> Result<i64> {
    if draft.trim().is_empty() {
        return Err(Error::Validation("Draft response must not be empty".to_string()));
    }

    let version = store
        .record_draft_edit(ticket_id, draft)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Ticket {}", ticket_id)))?;

    info!(ticket_id = %ticket_id, version, "Draft edited by agent");
    Ok(version)
}
