//! In-memory ticket store.
//!
//! Mirrors the conditional-write semantics of the Postgres store so pipeline
//! behavior can be exercised without a database. Also supports injecting
//! write failures and concurrent writers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::TicketStore;
use crate::models::{
    AiRun, AiSettings, Analysis, Category, Customer, DraftSource, NewNotification, Priority,
    RunCompletion, RunStatus, Ticket, TicketPatch, TicketStatus,
};
use crate::{Error, Result};

#[derive(Default)]
struct State {
    tickets: HashMap<Uuid, Ticket>,
    customers: HashMap<Uuid, Customer>,
    settings: HashMap<Uuid, AiSettings>,
    runs: HashMap<Uuid, AiRun>,
    notifications: Vec<NewNotification>,
    ticket_writes: usize,
}

/// Draft text written by [`MemoryStore::interleave_agent_edits`].
pub const INTERLEAVED_AGENT_DRAFT: &str = "Edited by an agent mid-write";

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    failing_ticket_updates: AtomicUsize,
    failing_dispatch_records: AtomicUsize,
    interleaved_agent_edits: AtomicUsize,
    yield_on_ticket_reads: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an open ticket (and its customer) for `org_id`.
    pub async fn seed_ticket(
        &self,
        org_id: Uuid,
        category: Category,
        priority: Priority,
        subject: &str,
        content: &str,
    ) -> Ticket {
        let now = Utc::now();
        let customer = Customer {
            id: Uuid::new_v4(),
            name: "Jordan Customer".to_string(),
            email: "jordan@example.com".to_string(),
        };
        let ticket = Ticket {
            id: Uuid::new_v4(),
            org_id,
            customer_id: customer.id,
            subject: subject.to_string(),
            content: content.to_string(),
            category,
            priority,
            status: TicketStatus::Open,
            ai_status: None,
            latest_run_id: None,
            draft_response: None,
            draft_updated_at: None,
            confidence: None,
            sentiment: None,
            version: 1,
            created_at: now,
            updated_at: now,
        };

        let mut state = self.state.lock().await;
        state.customers.insert(customer.id, customer);
        state.tickets.insert(ticket.id, ticket.clone());
        ticket
    }

    pub async fn set_settings(&self, org_id: Uuid, settings: AiSettings) {
        self.state.lock().await.settings.insert(org_id, settings);
    }

    /// Make the next `count` calls to `update_ticket` fail.
    pub fn fail_next_ticket_updates(&self, count: usize) {
        self.failing_ticket_updates.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` calls to `record_dispatch` fail.
    pub fn fail_next_dispatch_records(&self, count: usize) {
        self.failing_dispatch_records.store(count, Ordering::SeqCst);
    }

    /// Before each of the next `count` versioned ticket updates, apply an
    /// agent draft edit, so the update loses its version check.
    pub fn interleave_agent_edits(&self, count: usize) {
        self.interleaved_agent_edits.store(count, Ordering::SeqCst);
    }

    /// Yield to the scheduler after every ticket read, letting concurrent
    /// callers act on the same snapshot.
    pub fn set_yield_on_ticket_reads(&self, enabled: bool) {
        self.yield_on_ticket_reads.store(enabled, Ordering::SeqCst);
    }

    pub async fn ticket(&self, ticket_id: Uuid) -> Option<Ticket> {
        self.state.lock().await.tickets.get(&ticket_id).cloned()
    }

    pub async fn run(&self, run_id: Uuid) -> Option<AiRun> {
        self.state.lock().await.runs.get(&run_id).cloned()
    }

    pub async fn runs_for(&self, ticket_id: Uuid) -> Vec<AiRun> {
        let state = self.state.lock().await;
        let mut runs: Vec<AiRun> = state
            .runs
            .values()
            .filter(|r| r.ticket_id == ticket_id)
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.created_at);
        runs
    }

    pub async fn notifications(&self) -> Vec<NewNotification> {
        self.state.lock().await.notifications.clone()
    }

    /// Number of successful ticket writes (patches and draft edits).
    pub async fn ticket_writes(&self) -> usize {
        self.state.lock().await.ticket_writes
    }

    /// Rewrite a run's timestamps, e.g. to make it look stale.
    pub async fn backdate_run(&self, run_id: Uuid, created_at: DateTime<Utc>) {
        if let Some(run) = self.state.lock().await.runs.get_mut(&run_id) {
            run.created_at = created_at;
            run.last_dispatched_at = run.last_dispatched_at.map(|_| created_at);
        }
    }

    pub async fn remove_ticket(&self, ticket_id: Uuid) {
        self.state.lock().await.tickets.remove(&ticket_id);
    }

    pub async fn remove_customer(&self, customer_id: Uuid) {
        self.state.lock().await.customers.remove(&customer_id);
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn apply_draft_edit(ticket: &mut Ticket, draft: &str) {
    let now = Utc::now();
    ticket.draft_response = Some(draft.to_string());
    ticket.draft_updated_at = Some(now);
    ticket.version += 1;
    ticket.updated_at = now;
}

impl MemoryStore {
    fn take_injected_failure(&self) -> bool {
        take_one(&self.failing_ticket_updates)
    }
}

#[async_trait]
impl TicketStore for MemoryStore {
    async fn get_ticket(&self, ticket_id: Uuid) -> Result<Option<Ticket>> {
        let ticket = self.ticket(ticket_id).await;
        if self.yield_on_ticket_reads.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
        Ok(ticket)
    }

    async fn update_ticket(
        &self,
        ticket_id: Uuid,
        expected_version: Option<i64>,
        patch: TicketPatch,
    ) -> Result<bool> {
        if self.take_injected_failure() {
            return Err(Error::Internal("injected ticket write failure".to_string()));
        }

        let mut state = self.state.lock().await;
        let Some(ticket) = state.tickets.get_mut(&ticket_id) else {
            return Ok(false);
        };
        if expected_version.is_some() && take_one(&self.interleaved_agent_edits) {
            apply_draft_edit(ticket, INTERLEAVED_AGENT_DRAFT);
            state.ticket_writes += 1;
            return Ok(false);
        }
        if expected_version.is_some_and(|v| v != ticket.version) {
            return Ok(false);
        }

        patch.apply_to(ticket);
        ticket.version += 1;
        ticket.updated_at = Utc::now();
        state.ticket_writes += 1;
        Ok(true)
    }

    async fn record_draft_edit(&self, ticket_id: Uuid, draft: &str) -> Result<Option<i64>> {
        let mut state = self.state.lock().await;
        let Some(ticket) = state.tickets.get_mut(&ticket_id) else {
            return Ok(None);
        };

        apply_draft_edit(ticket, draft);
        let version = ticket.version;
        state.ticket_writes += 1;
        Ok(Some(version))
    }

    async fn get_org_settings(&self, org_id: Uuid) -> Result<AiSettings> {
        Ok(self
            .state
            .lock()
            .await
            .settings
            .get(&org_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_customer(&self, customer_id: Uuid) -> Result<Option<Customer>> {
        Ok(self.state.lock().await.customers.get(&customer_id).cloned())
    }

    async fn insert_run(&self, ticket_id: Uuid) -> Result<AiRun> {
        let run = AiRun {
            id: Uuid::new_v4(),
            ticket_id,
            status: RunStatus::Queued,
            started_at: None,
            finished_at: None,
            intent: None,
            urgency: None,
            confidence: None,
            sentiment: None,
            draft_response: None,
            source: None,
            error: None,
            dispatch_attempts: 0,
            last_dispatched_at: None,
            created_at: Utc::now(),
        };
        self.state.lock().await.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<AiRun>> {
        Ok(self.run(run_id).await)
    }

    async fn start_run(&self, run_id: Uuid) -> Result<Option<AiRun>> {
        let mut state = self.state.lock().await;
        match state.runs.get_mut(&run_id) {
            Some(run) if run.status.is_in_flight() => {
                run.status = RunStatus::Running;
                run.started_at.get_or_insert_with(Utc::now);
                Ok(Some(run.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn record_run_output(&self, run_id: Uuid, analysis: &Analysis, source: DraftSource) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.runs.get_mut(&run_id) {
            Some(run) if run.status.is_in_flight() => {
                run.set_output(analysis, source);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish_run(&self, run_id: Uuid, completion: RunCompletion) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.runs.get_mut(&run_id) {
            Some(run) if run.status.is_in_flight() => {
                completion.apply_to(run, Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_dispatch(&self, run_id: Uuid) -> Result<()> {
        if take_one(&self.failing_dispatch_records) {
            return Err(Error::Internal("injected dispatch record failure".to_string()));
        }
        if let Some(run) = self.state.lock().await.runs.get_mut(&run_id) {
            run.dispatch_attempts += 1;
            run.last_dispatched_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn list_stale_queued_runs(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<AiRun>> {
        let state = self.state.lock().await;
        let mut runs: Vec<AiRun> = state
            .runs
            .values()
            .filter(|r| r.status == RunStatus::Queued)
            .filter(|r| r.last_dispatched_at.unwrap_or(r.created_at) < cutoff)
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.created_at);
        runs.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(runs)
    }

    async fn insert_notification(&self, notification: NewNotification) -> Result<Uuid> {
        self.state.lock().await.notifications.push(notification);
        Ok(Uuid::new_v4())
    }
}
