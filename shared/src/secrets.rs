//! AWS Secrets Manager integration.
//!
//! Besides database credentials, model header templates may reference secrets
//! with `{{secret:<name>}}`. Names are bare and always resolve inside the
//! owning organization's namespace (`chat-gateway/orgs/<org>/<name>`), so a
//! model configuration can never reach infrastructure secrets or another
//! tenant's. Placeholders are resolved here, before the template engine or
//! any adapter sees the headers.

use async_trait::async_trait;
use aws_sdk_secretsmanager::Client as SecretsClient;
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{Error, Result};

/// Namespace under which per-organization secrets live.
pub const TENANT_SECRET_PREFIX: &str = "chat-gateway/orgs";

/// Upper bound on cached secret values per container.
const MAX_CACHED_SECRETS: usize = 256;

/// Cached secrets with lazy initialization.
static SECRETS_CACHE: OnceLock<RwLock<HashMap<String, String>>> = OnceLock::new();

fn get_cache() -> &'static RwLock<HashMap<String, String>> {
    SECRETS_CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*secret:([^}\s]*)\s*\}\}").expect("valid secret pattern")
    })
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

/// Anything that can hand out secret values by name.
#[async_trait]
pub trait SecretSource: Send + Sync {
    async fn secret(&self, name: &str) -> Result<String>;
}

#[async_trait]
impl SecretSource for SecretsClient {
    async fn secret(&self, name: &str) -> Result<String> {
        get_secret(self, name).await
    }
}

#[async_trait]
impl SecretSource for HashMap<String, String> {
    async fn secret(&self, name: &str) -> Result<String> {
        self.get(name)
            .cloned()
            .ok_or_else(|| Error::Config(format!("Unknown secret: {}", name)))
    }
}

/// Get a secret value from Secrets Manager with caching.
pub async fn get_secret(client: &SecretsClient, secret_arn: &str) -> Result<String> {
    // Check cache first
    {
        let cache = get_cache().read().await;
        if let Some(value) = cache.get(secret_arn) {
            return Ok(value.clone());
        }
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

    {
        let mut cache = get_cache().write().await;
        remember(&mut cache, secret_arn, &secret_string);
    }

    Ok(secret_string)
}

/// Insert into a cache that never grows past [`MAX_CACHED_SECRETS`]. When
/// full, the cache starts over.
fn remember(cache: &mut HashMap<String, String>, key: &str, value: &str) {
    if cache.len() >= MAX_CACHED_SECRETS && !cache.contains_key(key) {
        cache.clear();
    }
    cache.insert(key.to_string(), value.to_string());
}

/// Get database credentials from Secrets Manager.
pub async fn get_database_credentials(
    client: &SecretsClient,
    secret_arn: &str,
) -> Result<DatabaseCredentials> {
    let secret_string = get_secret(client, secret_arn).await?;

    serde_json::from_str(&secret_string)
        .map_err(|e| Error::Aws(format!("Failed to parse database credentials: {}", e)))
}

/// A placeholder name must be bare: no ARNs, no paths.
fn check_secret_name(name: &str) -> Result<()> {
    let bare = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '+' | '=' | '.' | '@'));
    if bare {
        Ok(())
    } else {
        Err(Error::Validation(format!("Invalid secret reference: {:?}", name)))
    }
}

/// Reject header templates whose secret placeholders are not bare names.
pub fn validate_secret_refs(headers: &BTreeMap<String, String>) -> Result<()> {
    let pattern = placeholder_pattern();
    headers
        .values()
        .flat_map(|value| pattern.captures_iter(value))
        .try_for_each(|captures| check_secret_name(&captures[1]))
}

/// Secrets Manager id of an organization's secret.
pub fn tenant_secret_id(organization_id: Uuid, name: &str) -> String {
    format!("{}/{}/{}", TENANT_SECRET_PREFIX, organization_id, name)
}

/// Replace every `{{secret:<name>}}` placeholder in the header values with
/// the organization's secret of that name.
///
/// Each distinct secret is fetched once per call. An unknown secret fails the
/// whole resolution; a half-authenticated request is never sent upstream.
pub async fn resolve_header_secrets(
    headers: &BTreeMap<String, String>,
    organization_id: Uuid,
    source: &dyn SecretSource,
) -> Result<BTreeMap<String, String>> {
    validate_secret_refs(headers)?;

    let pattern = placeholder_pattern();
    let mut fetched: HashMap<String, String> = HashMap::new();

    for value in headers.values() {
        for captures in pattern.captures_iter(value) {
            let name = &captures[1];
            if !fetched.contains_key(name) {
                let secret = source.secret(&tenant_secret_id(organization_id, name)).await?;
                fetched.insert(name.to_string(), secret);
            }
        }
    }

    Ok(headers
        .iter()
        .map(|(key, value)| {
            let resolved = pattern.replace_all(value, |captures: &regex::Captures| {
                fetched.get(&captures[1]).cloned().unwrap_or_default()
            });
            (key.clone(), resolved.into_owned())
        })
        .collect())
}
