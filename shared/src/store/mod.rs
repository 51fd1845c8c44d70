//! Ticket store contract consumed by the AI pipeline.
//!
//! The pipeline never talks to a database directly; it goes through
//! [`TicketStore`]. Production uses [`PgTicketStore`], tests use
//! [`MemoryStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    AiRun, AiSettings, Analysis, Customer, DraftSource, NewNotification, RunCompletion, Ticket,
    TicketPatch,
};
use crate::Result;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgTicketStore;

#[async_trait]
pub trait TicketStore: Send + Sync {
    async fn get_ticket(&self, ticket_id: Uuid) -> Result<Option<Ticket>>;

    /// Apply `patch` and bump the ticket version.
    ///
    /// With `expected_version` set, the write only happens if the stored
    /// version still matches. Returns whether a row was written.
    async fn update_ticket(
        &self,
        ticket_id: Uuid,
        expected_version: Option<i64>,
        patch: TicketPatch,
    ) -> Result<bool>;

    /// Human edit of the draft: sets the draft text and `draft_updated_at`.
    /// Returns the new version, or `None` if the ticket does not exist.
    async fn record_draft_edit(&self, ticket_id: Uuid, draft: &str) -> Result<Option<i64>>;

    /// Settings for an organization; organizations without a row get defaults.
    async fn get_org_settings(&self, org_id: Uuid) -> Result<AiSettings>;

    async fn get_customer(&self, customer_id: Uuid) -> Result<Option<Customer>>;

    /// Create a run in `queued` state.
    async fn insert_run(&self, ticket_id: Uuid) -> Result<AiRun>;

    async fn get_run(&self, run_id: Uuid) -> Result<Option<AiRun>>;

    /// Move a non-terminal run to `running`, setting `started_at` only if it
    /// was never set. Returns `None` when the run is missing or terminal.
    async fn start_run(&self, run_id: Uuid) -> Result<Option<AiRun>>;

    /// Persist generated output on a run that is still in flight. Returns
    /// `false` if the run is already terminal.
    async fn record_run_output(&self, run_id: Uuid, analysis: &Analysis, source: DraftSource) -> Result<bool>;

    /// Write the terminal state of a run. Returns `false` if the run was
    /// already terminal, in which case nothing is written.
    async fn finish_run(&self, run_id: Uuid, completion: RunCompletion) -> Result<bool>;

    /// Count a hand-off to the worker and stamp `last_dispatched_at`.
    async fn record_dispatch(&self, run_id: Uuid) -> Result<()>;

    /// Queued runs whose last hand-off (or creation) is older than `cutoff`.
    async fn list_stale_queued_runs(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<AiRun>>;

    async fn insert_notification(&self, notification: NewNotification) -> Result<Uuid>;
}
