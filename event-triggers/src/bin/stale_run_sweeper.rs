//! Stale Run Sweeper Lambda - recovers AI runs whose hand-off was lost.
//!
//! Runs every few minutes via EventBridge. Queued runs that have waited
//! longer than `STALE_RUN_THRESHOLD_SECS` are dispatched to the worker again;
//! runs that have already used `MAX_DISPATCH_ATTEMPTS` are marked failed and
//! handed back to a human.

use lambda_runtime::{run, service_fn, Error, LambdaEvent};
use serde::Deserialize;
use shared::{sweep_stale_runs, Config, LambdaDispatcher, PgTicketStore, RunManager, SweepPolicy, SweepReport};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Deserialize)]
struct ScheduledEvent {
    #[serde(default, rename = "detail-type")]
    detail_type: String,
}

struct AppState {
    store: Arc<PgTicketStore>,
    dispatcher: LambdaDispatcher,
    manager: RunManager,
    policy: SweepPolicy,
}

impl AppState {
    async fn new() -> Result<Self, Error> {
        let config = Config::from_env()?;
        let sdk_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;

        let store = Arc::new(PgTicketStore::connect(&config, &sdk_config).await?);
        let dispatcher = LambdaDispatcher::new(
            aws_sdk_lambda::Client::new(&sdk_config),
            config.worker_function_name.clone(),
        );
        // Abandoning a run never calls the provider.
        let manager = RunManager::new(store.clone(), None);

        Ok(Self {
            store,
            dispatcher,
            manager,
            policy: SweepPolicy::from_config(&config),
        })
    }
}

async fn handler(state: Arc<AppState>, event: LambdaEvent<ScheduledEvent>) -> Result<SweepReport, Error> {
    info!(detail_type = %event.payload.detail_type, "Starting stale run sweep");

    let report = sweep_stale_runs(
        state.store.as_ref(),
        &state.dispatcher,
        &state.manager,
        &state.policy,
    )
    .await?;

    Ok(report)
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
