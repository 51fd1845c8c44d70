//! AWS Secrets Manager integration.
//!
//! Secrets are cached for the lifetime of the Lambda execution environment,
//! so warm invocations skip the Secrets Manager round trip.

use aws_sdk_secretsmanager::Client as SecretsClient;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::OnceLock;
use tokio::sync::RwLock;

use crate::{Error, Result};

static SECRETS_CACHE: OnceLock<RwLock<HashMap<String, String>>> = OnceLock::new();

fn get_cache() -> &'static RwLock<HashMap<String, String>> {
    SECRETS_CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Database credentials from Secrets Manager.
#[derive(Debug, Deserialize)]
pub struct DatabaseCredentials {
    pub username: String,
    pub password: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub dbname: Option<String>,
}

/// Get a secret value from Secrets Manager with caching.
pub async fn get_secret(client: &SecretsClient, secret_arn: &str) -> Result<String> {
    if let Some(value) = get_cache().read().await.get(secret_arn) {
        return Ok(value.clone());
    }

    let response = client
        .get_secret_value()
        .secret_id(secret_arn)
        .send()
        .await
        .map_err(|e| Error::Aws(format!("Failed to get secret: {}", e)))?;

    let secret_string = response
        .secret_string()
        .ok_or_else(|| Error::Aws("Secret has no string value".to_string()))?
        .to_string();

    get_cache()
        .write()
        .await
        .insert(secret_arn.to_string(), secret_string.clone());

    Ok(secret_string)
}

/// Get database credentials from Secrets Manager.
pub async fn get_database_credentials(
    client: &SecretsClient,
    secret_arn: &str,
) -> Result<DatabaseCredentials> {
    let secret_string = get_secret(client, secret_arn).await?;

    serde_json::from_str(&secret_string)
        .map_err(|e| Error::Config(format!("Failed to parse database credentials: {}", e)))
}

/// Get the generative provider API key.
pub async fn get_api_key(client: &SecretsClient, secret_arn: &str) -> Result<String> {
    let secret_string = get_secret(client, secret_arn).await?;
    parse_api_key(&secret_string)
}

/// Accepts either a bare key or a JSON object with an `api_key` field.
fn parse_api_key(secret: &str) -> Result<String> {
    #[derive(Deserialize)]
    struct KeySecret {
        api_key: String,
    }

    let trimmed = secret.trim();
    let key = if trimmed.starts_with('{') {
        serde_json::from_str::<KeySecret>(trimmed)
            .map_err(|e| Error::Config(format!("Failed to parse API key secret: {}", e)))?
            .api_key
    } else {
        trimmed.to_string()
    };

    if key.is_empty() {
        return Err(Error::Config("API key secret is empty".to_string()));
    }
    Ok(key)
}
