use chrono::{DateTime, Duration, Utc};

use crate::api::ApiClient;
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::storage::{repository, Database};
use crate::sync::rate_limit;

/// Hands out the OAuth bearer token, reusing the cached one until it is
/// about to expire.
pub struct TokenProvider {
    db: Database,
    client: ApiClient,
    provider: String,
    client_id: Option<String>,
    client_secret: Option<String>,
    refresh_margin: Duration,
}

impl TokenProvider {
    pub fn new(db: Database, client: ApiClient, config: &SyncConfig) -> Self {
        Self {
            db,
            client,
            provider: config.provider.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            refresh_margin: Duration::from_std(config.token_refresh_margin)
                .unwrap_or_else(|_| Duration::seconds(60)),
        }
    }

    pub async fn get_token(&self) -> Result<String> {
        self.get_token_at(Utc::now()).await
    }

    pub async fn get_token_at(&self, now: DateTime<Utc>) -> Result<String> {
        let (client_id, client_secret) = match (&self.client_id, &self.client_secret) {
            (Some(id), Some(secret)) => (id.clone(), secret.clone()),
            _ => {
                return Err(Error::Config(
                    "missing API credentials (client id and client secret)".into(),
                ))
            }
        };

        let cached = self
            .db
            .reader()
            .call({
                let provider = self.provider.clone();
                move |conn| repository::get_cached_token(conn, &provider)
            })
            .await?;

        if let Some(token) = cached {
            if token.expires_at > now + self.refresh_margin {
                log::debug!("Using cached token for {} (expires {})", self.provider, token.expires_at);
                return Ok(token.access_token);
            }
        }

        log::info!("Requesting new access token for {}", self.provider);
        let response = self.client.request_token(&client_id, &client_secret).await?;
        rate_limit::record(&self.db, response.rate_limit.as_ref()).await?;

        let token = response.body;
        if token.access_token.is_empty() {
            return Err(Error::Decode("token response has an empty access_token".into()));
        }
        let expires_at = now + Duration::seconds(token.expires_in.max(0));

        self.db
            .writer()
            .call({
                let provider = self.provider.clone();
                let access_token = token.access_token.clone();
                move |conn| repository::upsert_token(conn, &provider, &access_token, &expires_at, &now)
            })
            .await?;

        Ok(token.access_token)
    }
}
