//! Database connection management.

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::time::Duration;

use crate::secrets::{get_database_credentials, DatabaseCredentials};
use crate::{Config, Error, Result};

/// Create a database connection pool.
///
/// Host, port and database name from the secret win over the environment so a
/// rotated secret can move the database without a redeploy.
pub async fn create_pool(config: &Config, credentials: &DatabaseCredentials) -> Result<PgPool> {
    let options = PgConnectOptions::new()
        .host(credentials.host.as_deref().unwrap_or(&config.db_host))
        .port(credentials.port.unwrap_or(5432))
        .database(credentials.dbname.as_deref().unwrap_or(&config.db_name))
        .username(&credentials.username)
        .password(&credentials.password);

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(3))
        .connect_with(options)
        .await
        .map_err(Error::Database)?;

    Ok(pool)
}

/// Resolve credentials from Secrets Manager and connect.
pub async fn connect(config: &Config, sdk_config: &aws_config::SdkConfig) -> Result<PgPool> {
    let secrets_client = aws_sdk_secretsmanager::Client::new(sdk_config);
    let credentials = get_database_credentials(&secrets_client, &config.db_secret_arn).await?;
    create_pool(config, &credentials).await
}
