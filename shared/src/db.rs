//! Database connection management.

use aws_sdk_secretsmanager::Client as SecretsClient;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

use crate::secrets::{get_database_credentials, DatabaseCredentials};
use crate::{Config, Error, Result};

/// Create a database connection pool.
pub async fn create_pool(config: &Config, credentials: &DatabaseCredentials) -> Result<PgPool> {
    let host = credentials.host.as_deref().unwrap_or(&config.db_host);
    let port = credentials.port.unwrap_or(5432);
    let name = credentials.dbname.as_deref().unwrap_or(&config.db_name);

    let options = PgConnectOptions::new()
        .host(host)
        .port(port)
        .username(&credentials.username)
        .password(&credentials.password)
        .database(name);

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(Duration::from_secs(3))
        .connect_with(options)
        .await
        .map_err(Error::Database)?;

    info!(host, database = name, "Connected to database");
    Ok(pool)
}

/// Fetch credentials from Secrets Manager and open the pool.
pub async fn connect(config: &Config, secrets: &SecretsClient) -> Result<PgPool> {
    let credentials = get_database_credentials(secrets, &config.db_secret_arn).await?;
    create_pool(config, &credentials).await
}
