//! Per-container state shared by the gateway Lambdas.

use aws_sdk_secretsmanager::Client as SecretsClient;
use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::models::TenantContext;
use crate::secrets::get_secret;
use crate::tenant::{PgStore, TenantMediator, TenantStore};
use crate::{db, Config, Error, Result};

/// Built once per cold start and reused across invocations.
pub struct GatewayState {
    pub config: Config,
    pub secrets: SecretsClient,
    pub store: Arc<dyn TenantStore>,
    /// HS256 key for bearer session tokens, when function URLs are in use.
    pub session_secret: Option<Vec<u8>>,
}

impl GatewayState {
    pub async fn from_env() -> Result<Self> {
        let config = Config::from_env().map_err(|e| Error::Config(format!("Missing environment: {}", e)))?;
        let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let secrets = SecretsClient::new(&aws_config);

        let pool = db::connect(&config, &secrets).await?;

        let session_secret = match &config.session_secret_arn {
            Some(arn) => Some(get_secret(&secrets, arn).await?.into_bytes()),
            None => None,
        };

        Ok(Self {
            config,
            secrets,
            store: Arc::new(PgStore::new(pool)),
            session_secret,
        })
    }

    /// A mediator scoped to one request.
    pub fn mediator(&self, context: TenantContext, cancel: CancelToken) -> TenantMediator {
        TenantMediator::new(context, Arc::clone(&self.store)).with_cancel(cancel)
    }
}
