//! Hand-off of queued runs to the AI run worker.

use async_trait::async_trait;
use aws_sdk_lambda::primitives::Blob;
use aws_sdk_lambda::types::InvocationType;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::{Error, Result};

/// Payload the worker is invoked with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunInvocation {
    pub run_id: Uuid,
}

/// Delivers a run id to whatever processes runs. Delivery is fire-and-forget:
/// success means the hand-off was accepted, not that the run finished.
#[async_trait]
pub trait RunDispatcher: Send + Sync {
    async fn dispatch(&self, run_id: Uuid) -> Result<()>;
}

/// Dispatches runs by invoking the worker Lambda asynchronously.
pub struct LambdaDispatcher {
    lambda_client: aws_sdk_lambda::Client,
    worker_function_name: String,
}

impl LambdaDispatcher {
    pub fn new(lambda_client: aws_sdk_lambda::Client, worker_function_name: String) -> Self {
        Self {
            lambda_client,
            worker_function_name,
        }
    }
}

#[async_trait]
impl RunDispatcher for LambdaDispatcher {
    async fn dispatch(&self, run_id: Uuid) -> Result<()> {
        let payload = serde_json::to_vec(&RunInvocation { run_id })?;

        self.lambda_client
            .invoke()
            .function_name(&self.worker_function_name)
            .invocation_type(InvocationType::Event)
            .payload(Blob::new(payload))
            .send()
            .await
            .map_err(|e| Error::Aws(format!("Failed to invoke AI run worker: {}", e)))?;

        info!(run_id = %run_id, "AI run dispatched");
        Ok(())
    }
}
