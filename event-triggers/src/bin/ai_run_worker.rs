//! AI Run Worker Lambda - processes one queued AI run.
//!
//! Invoked asynchronously by the AI runs API (and the stale run sweeper) with
//! `{"runId": "..."}`. It:
//! 1. Moves the run to running
//! 2. Drafts a response with the configured provider, falling back to the
//!    heuristic analyzer
//! 3. Reconciles the draft onto the ticket if this run is still the latest
//! 4. Marks the run done, or error with a notification for operators
//!
//! Re-invoking for the same run is safe. Store failures are returned as
//! errors so Lambda's async retry policy re-delivers the event.

use lambda_runtime::{run, service_fn, Error, LambdaEvent};
use serde::Serialize;
use shared::models::{DraftSource, RunStatus};
use shared::{Config, PgTicketStore, RunInvocation, RunManager, RunOutcome};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WorkerResponse {
    ok: bool,
    run_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<RunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<DraftSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<RunOutcome> for WorkerResponse {
    fn from(outcome: RunOutcome) -> Self {
        Self {
            ok: outcome.status == RunStatus::Done,
            run_id: outcome.run_id,
            status: Some(outcome.status),
            source: outcome.source,
            error: outcome.error,
        }
    }
}

struct AppState {
    manager: RunManager,
}

impl AppState {
    async fn new() -> Result<Self, Error> {
        let config = Config::from_env()?;
        let sdk_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;

        let store = PgTicketStore::connect(&config, &sdk_config).await?;
        let drafting = shared::drafting::client_from_config(&config, &sdk_config).await?;

        Ok(Self {
            manager: RunManager::new(Arc::new(store), drafting),
        })
    }
}

async fn handler(state: Arc<AppState>, event: LambdaEvent<RunInvocation>) -> Result<WorkerResponse, Error> {
    let run_id = event.payload.run_id;
    info!(run_id = %run_id, request_id = %event.context.request_id, "AI run invocation received");

    match state.manager.process_run(run_id).await {
        Ok(outcome) => Ok(outcome.into()),
        // Retrying cannot make a missing run appear.
        Err(shared::Error::NotFound(message)) => {
            warn!(run_id = %run_id, "AI run not found");
            Ok(WorkerResponse {
                ok: false,
                run_id,
                status: None,
                source: None,
                error: Some(message),
            })
        }
        Err(e) => Err(e.into()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let state = Arc::new(AppState::new().await?);
    let state_clone = state.clone();

    run(service_fn(move |event| {
        let state = state_clone.clone();
        async move { handler(state, event).await }
    }))
    .await
}
