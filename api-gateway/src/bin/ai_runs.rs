//! AI Runs API Lambda - triggers AI drafts and records agent edits.
//!
//! Endpoints:
//! - POST /v1/ai-runs - Start (or reuse) an AI run for a ticket
//! - GET /v1/ai-runs/{id} - Get a run record
//! - PUT /v1/tickets/{id}/draft - Save an agent's edit of the ticket draft

use lambda_http::{run, service_fn, Body, Error, Request, Response};
use serde::Deserialize;
use shared::http::{error_response, error_to_response, json_response, ApiResponse};
use shared::{extract_agent, parse_body, Config, LambdaDispatcher, PgTicketStore, RunTrigger, TicketStore};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use validator::Validate;

/// Trigger run request
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct TriggerRunRequest {
    ticket_id: Uuid,
    #[serde(default)]
    force: bool,
}

/// Draft edit request
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct DraftEditRequest {
    #[validate(length(min = 1, max = 12000))]
    draft_response: String,
}

#[derive(Debug, PartialEq, Eq)]
enum Route {
    TriggerRun,
    GetRun(Uuid),
    EditDraft(Uuid),
}

/// Match a request onto a route. `None` means 404.
fn route(method: &str, path: &str) -> Option<Route> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    match (method, segments.as_slice()) {
        ("POST", ["v1", "ai-runs"]) => Some(Route::TriggerRun),
        ("GET", ["v1", "ai-runs", id]) => Uuid::parse_str(id).ok().map(Route::GetRun),
        ("PUT", ["v1", "tickets", id, "draft"]) => Uuid::parse_str(id).ok().map(Route::EditDraft),
        _ => None,
    }
}

/// Application state
struct AppState {
    store: Arc<PgTicketStore>,
    trigger: RunTrigger,
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
        let trigger = RunTrigger::new(store.clone(), Arc::new(dispatcher));

        Ok(Self { store, trigger })
    }
}

async fn handler(state: Arc<AppState>, event: Request) -> Result<Response<Body>, Error> {
    let method = event.method().as_str();
    let raw_path = event.uri().path();
    // Strip /api stage prefix if present (API Gateway REST API includes stage in path)
    let path = raw_path.strip_prefix("/api").unwrap_or(raw_path);

    let agent = match extract_agent(&event) {
        Ok(agent) => agent,
        Err(e) => return error_to_response(&e),
    };

    info!(agent_id = %agent.user_id, "AI runs request: {} {}", method, path);

    let Some(route) = route(method, path) else {
        return error_response(404, "Not found");
    };

    match route {
        Route::TriggerRun => {
            let request: TriggerRunRequest = parse_body!(event.body());

            match state.trigger.trigger(request.ticket_id, request.force).await {
                Ok(run_id) => {
                    let status = if run_id.is_some() { 202 } else { 200 };
                    json_response(
                        status,
                        &ApiResponse::success(serde_json::json!({ "runId": run_id })),
                    )
                }
                Err(e) => error_to_response(&e),
            }
        }

        Route::GetRun(run_id) => match state.store.get_run(run_id).await {
            Ok(Some(run)) => json_response(200, &ApiResponse::success(run)),
            Ok(None) => error_response(404, "AI run not found"),
            Err(e) => error_to_response(&e),
        },

        Route::EditDraft(ticket_id) => {
            let request: DraftEditRequest = parse_body!(event.body());

            match shared::trigger::record_draft_edit(state.store.as_ref(), ticket_id, &request.draft_response).await
            {
                Ok(version) => {
                    info!(ticket_id = %ticket_id, agent_id = %agent.user_id, version, "Draft saved");
                    json_response(200, &ApiResponse::success(serde_json::json!({ "version": version })))
                }
                Err(e) => error_to_response(&e),
            }
        }
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
