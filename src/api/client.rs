use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

use super::models::{Page, TokenResponse};
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::sync::rate_limit::{self, RateLimitSnapshot};

pub const AUTH_ENDPOINT: &str = "auth";
pub const LISTINGS_ENDPOINT: &str = "listings";
pub const RESERVATIONS_ENDPOINT: &str = "reservations";

/// A decoded response body plus whatever rate-limit headers came with it.
#[derive(Debug, Clone)]
pub struct ApiResponse<T> {
    pub body: T,
    pub rate_limit: Option<RateLimitSnapshot>,
}

/// Thin client for the remote property-management API. Cheap to clone; clones
/// share the request counter and the last observed rate-limit snapshot.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    requests: Arc<AtomicU64>,
    last_rate_limit: Arc<Mutex<Option<RateLimitSnapshot>>>,
}

impl ApiClient {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let base_url = config.api_base_url.trim_end_matches('/').to_string();
        Url::parse(&base_url)
            .map_err(|e| Error::Config(format!("invalid API base URL {base_url}: {e}")))?;
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self {
            client,
            base_url,
            requests: Arc::new(AtomicU64::new(0)),
            last_rate_limit: Arc::new(Mutex::new(None)),
        })
    }

    /// Outbound requests made through this client (and its clones).
    pub fn requests_made(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Most recent rate-limit snapshot seen on any response, including errors.
    pub fn last_rate_limit(&self) -> Option<RateLimitSnapshot> {
        self.last_rate_limit
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or(None)
    }

    fn url(&self, path: &str) -> Result<Url> {
        Url::parse(&format!("{}{path}", self.base_url))
            .map_err(|e| Error::Config(format!("invalid API URL for {path}: {e}")))
    }

    /// Client-credentials grant.
    pub async fn request_token(
        &self,
        client_id: &str,
        client_secret: &str,
    ) -> Result<ApiResponse<TokenResponse>> {
        let url = self.url("/oauth2/token")?;
        let request = self.client.post(url).form(&[
            ("grant_type", "client_credentials"),
            ("client_id", client_id),
            ("client_secret", client_secret),
        ]);
        self.send(AUTH_ENDPOINT, request).await
    }

    pub async fn listings_page(
        &self,
        token: &str,
        page: u32,
        limit: u32,
    ) -> Result<ApiResponse<Page>> {
        let mut url = self.url("/v1/listings")?;
        url.query_pairs_mut()
            .append_pair("page", &page.to_string())
            .append_pair("limit", &limit.to_string());
        let request = self.client.get(url).bearer_auth(token);
        self.send(LISTINGS_ENDPOINT, request).await
    }

    /// Reservations of one listing whose end date is on or after `end_date_gte`.
    pub async fn reservations(
        &self,
        token: &str,
        listing_id: &str,
        end_date_gte: &str,
    ) -> Result<ApiResponse<Page>> {
        let mut url = self.url("/v1/reservations")?;
        url.query_pairs_mut()
            .append_pair("listingId", listing_id)
            .append_pair("endDate[gte]", end_date_gte);
        let request = self.client.get(url).bearer_auth(token);
        self.send(RESERVATIONS_ENDPOINT, request).await
    }

    async fn send<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        request: RequestBuilder,
    ) -> Result<ApiResponse<T>> {
        self.requests.fetch_add(1, Ordering::Relaxed);

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(format!("{endpoint} request"))
            } else {
                Error::Request(e)
            }
        })?;

        let status = response.status();
        let snapshot = rate_limit::extract(endpoint, response.headers(), Utc::now());
        if let Some(ref snap) = snapshot {
            if let Ok(mut last) = self.last_rate_limit.lock() {
                *last = Some(snap.clone());
            }
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            log::warn!("Rate limited (429) on {endpoint}");
            return Err(Error::RateLimited {
                endpoint: endpoint.to_string(),
            });
        }

        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(format!("{endpoint} response body"))
            } else {
                Error::Request(e)
            }
        })?;

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(Error::Auth {
                status: status.as_u16(),
                body,
            });
        }
        if !status.is_success() {
            return Err(Error::Http {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let body = serde_json::from_str(&body)
            .map_err(|e| Error::Decode(format!("{endpoint} response: {e}")))?;
        Ok(ApiResponse {
            body,
            rate_limit: snapshot,
        })
    }
}
