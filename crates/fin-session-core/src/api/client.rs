//! API client for the Fin Engine authentication endpoints.
//!
//! This module provides the `ApiClient` struct for logging in and for
//! exchanging a refresh token for a new access token.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::{header, Client, Url};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, warn};

use crate::auth::{SessionRecord, UserProfile};

use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for transient failures (429, 5xx, connect errors).
/// A rejected refresh token is never retried.
const MAX_TRANSIENT_RETRIES: u32 = 2;

/// Initial backoff delay in milliseconds for transient failures.
const INITIAL_BACKOFF_MS: u64 = 500;

/// Upper bound of random jitter added to each backoff, in milliseconds.
const BACKOFF_JITTER_MS: u64 = 250;

/// How the refresh token is sent to the refresh endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshEncoding {
    #[default]
    Form,
    Json,
}

/// Tokens returned by a successful refresh exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshedTokens {
    pub access_token: String,
    /// Present when the backend rotates refresh tokens
    pub refresh_token: Option<String>,
}

/// Exchanges a refresh token for a new access token.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh_access_token(
        &self,
        refresh_token: &str,
    ) -> Result<RefreshedTokens, ApiError>;
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(default, deserialize_with = "truthy")]
    success: bool,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    user: Option<UserProfile>,
    #[serde(default)]
    account_id: Option<JsonValue>,
    #[serde(default)]
    user_id: Option<JsonValue>,
    #[serde(flatten)]
    extra: Map<String, JsonValue>,
}

/// Accept the loose "success" values the backend has been seen to send:
/// booleans, 1/0, and strings such as "true", "1" or "ok".
fn truthy<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = JsonValue::deserialize(deserializer)?;
    Ok(match value {
        JsonValue::Bool(b) => b,
        JsonValue::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        JsonValue::String(s) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "true" | "1" | "ok" | "yes"
        ),
        _ => false,
    })
}

impl RefreshResponse {
    fn into_tokens(self) -> Result<RefreshedTokens, ApiError> {
        if !self.success {
            return Err(ApiError::InvalidResponse(
                self.message.unwrap_or_else(|| "refresh not successful".to_string()),
            ));
        }
        let access_token = self
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::InvalidResponse("missing access_token".to_string()))?;
        Ok(RefreshedTokens {
            access_token,
            refresh_token: self.refresh_token.filter(|t| !t.is_empty()),
        })
    }
}

impl LoginResponse {
    fn into_record(self) -> Result<SessionRecord, ApiError> {
        let access_token = self
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::InvalidResponse("missing access_token".to_string()))?;
        Ok(SessionRecord {
            access_token: Some(access_token),
            refresh_token: self.refresh_token,
            user: self.user,
            account_id: self.account_id,
            user_id: self.user_id,
            last_refresh: None,
            extra: self
                .extra
                .into_iter()
                .filter(|(key, _)| key != "success" && key != "message")
                .collect(),
        })
    }
}

/// API client for Fin Engine.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    refresh_url: Url,
    login_url: Url,
    encoding: RefreshEncoding,
}

impl ApiClient {
    /// Create a new API client against `base_url`.
    pub fn new(
        base_url: &str,
        refresh_path: &str,
        login_path: &str,
        encoding: RefreshEncoding,
    ) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            refresh_url: Self::join(base_url, refresh_path)?,
            login_url: Self::join(base_url, login_path)?,
            encoding,
        })
    }

    /// Create a client from the application configuration.
    pub fn from_config(config: &crate::Config) -> Result<Self, ApiError> {
        Self::new(
            &config.api_base_url,
            &config.refresh_path,
            &config.login_path,
            config.refresh_encoding,
        )
    }

    fn join(base_url: &str, path: &str) -> Result<Url, ApiError> {
        let joined = format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Url::parse(&joined).map_err(|e| ApiError::InvalidUrl(format!("{}: {}", joined, e)))
    }

    pub fn refresh_url(&self) -> &Url {
        &self.refresh_url
    }

    /// Authenticate and build a fresh session record from the response
    pub async fn login(&self, username: &str, password: &str) -> Result<SessionRecord, ApiError> {
        let response = self
            .client
            .post(self.login_url.clone())
            .header(header::ACCEPT, "application/json")
            .form(&[("username", username), ("password", password)])
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        let login: LoginResponse = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("login response: {}", e)))?;
        login.into_record()
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn refresh_once(&self, refresh_token: &str) -> Result<RefreshedTokens, ApiError> {
        let request = self
            .client
            .post(self.refresh_url.clone())
            .header(header::ACCEPT, "application/json");
        let request = match self.encoding {
            RefreshEncoding::Form => request.form(&[("refresh_token", refresh_token)]),
            RefreshEncoding::Json => {
                request.json(&serde_json::json!({ "refresh_token": refresh_token }))
            }
        };

        let response = Self::check_response(request.send().await?).await?;
        let body = response.text().await?;
        Self::parse_refresh_body(&body)
    }

    fn parse_refresh_body(body: &str) -> Result<RefreshedTokens, ApiError> {
        let parsed: RefreshResponse = serde_json::from_str(body)
            .map_err(|e| ApiError::InvalidResponse(format!("refresh response: {}", e)))?;
        parsed.into_tokens()
    }

    fn backoff_delay(backoff_ms: u64) -> Duration {
        let jitter = rand::thread_rng().gen_range(0..=BACKOFF_JITTER_MS);
        Duration::from_millis(backoff_ms + jitter)
    }
}

/// Run `attempt` until it succeeds, fails with a non-transient error, or
/// the transient retries are used up. Backoff doubles after each retry.
async fn retry_transient<T, F, Fut>(mut attempt: F) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut retries = 0;
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    loop {
        match attempt().await {
            Ok(value) => {
                debug!(retries, "Request succeeded");
                return Ok(value);
            }
            Err(e) if e.is_transient() && retries < MAX_TRANSIENT_RETRIES => {
                retries += 1;
                warn!(
                    error = %e,
                    retry = retries,
                    backoff_ms,
                    "Transient failure, backing off"
                );
                tokio::time::sleep(ApiClient::backoff_delay(backoff_ms)).await;
                backoff_ms *= 2; // Exponential backoff
            }
            Err(e) => return Err(e),
        }
    }
}

#[async_trait]
impl TokenRefresher for ApiClient {
    async fn refresh_access_token(
        &self,
        refresh_token: &str,
    ) -> Result<RefreshedTokens, ApiError> {
        retry_transient(|| self.refresh_once(refresh_token)).await
    }
}
