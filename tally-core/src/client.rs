use std::time::SystemTime;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::model::{TransactionPatch, TransactionPayload};

const DEFAULT_BASE_URL: &str = "https://api.tally.example";

#[derive(Debug, Error)]
pub enum LedgerApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api {
        status: StatusCode,
        body: String,
        retry_after: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

/// Result of applying one mutation against the authoritative store. A 409
/// with the current server state is a first-class outcome, not an error;
/// transport and other HTTP failures surface as `LedgerApiError`.
#[derive(Debug)]
pub enum ApplyOutcome {
    Committed(CommitReceipt),
    Conflict(ConflictSnapshot),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommitReceipt {
    pub id: String,
    pub version: i64,
    pub updated_at: String,
    #[serde(default)]
    pub receipt_url: Option<String>,
}

/// Authoritative state returned when a precondition check rejects a
/// mutation.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConflictSnapshot {
    pub transaction: TransactionPayload,
    pub version: i64,
    pub updated_at: String,
}

#[derive(Clone)]
pub struct LedgerClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl LedgerClient {
    pub fn new(token: impl Into<String>) -> Result<Self, LedgerApiError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, LedgerApiError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    pub async fn create_transaction(
        &self,
        payload: &TransactionPayload,
    ) -> Result<CommitReceipt, LedgerApiError> {
        let url = self.endpoint("/v1/ledger/transactions")?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(payload)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn update_transaction(
        &self,
        id: &str,
        patch: &TransactionPatch,
        precondition: Option<i64>,
    ) -> Result<ApplyOutcome, LedgerApiError> {
        let url = self.transaction_endpoint(id)?;
        let mut request = self
            .http
            .patch(url)
            .header("Authorization", self.auth_header_value())
            .json(patch);
        if let Some(version) = precondition {
            request = request.header("If-Match", version.to_string());
        }
        Self::handle_apply_response(request.send().await?).await
    }

    pub async fn delete_transaction(
        &self,
        id: &str,
        precondition: Option<i64>,
    ) -> Result<ApplyOutcome, LedgerApiError> {
        let url = self.transaction_endpoint(id)?;
        let mut request = self
            .http
            .delete(url)
            .header("Authorization", self.auth_header_value());
        if let Some(version) = precondition {
            request = request.header("If-Match", version.to_string());
        }
        Self::handle_apply_response(request.send().await?).await
    }

    pub async fn upload_receipt(
        &self,
        id: &str,
        bytes: Vec<u8>,
        mime: &str,
    ) -> Result<CommitReceipt, LedgerApiError> {
        let url = self.endpoint(&format!("/v1/ledger/transactions/{id}/receipt"))?;
        let response = self
            .http
            .put(url)
            .header("Authorization", self.auth_header_value())
            .header("Content-Type", mime.to_string())
            .body(bytes)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, LedgerApiError> {
        Ok(self.base_url.join(path)?)
    }

    fn transaction_endpoint(&self, id: &str) -> Result<Url, LedgerApiError> {
        let mut url = self.endpoint("/v1/ledger/transactions/")?;
        url.path_segments_mut()
            .map_err(|_| url::ParseError::SetHostOnCannotBeABaseUrl)?
            .pop_if_empty()
            .push(id);
        Ok(url)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, LedgerApiError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn handle_apply_response(
        response: reqwest::Response,
    ) -> Result<ApplyOutcome, LedgerApiError> {
        if response.status() == StatusCode::CONFLICT {
            let snapshot = response.json::<ConflictSnapshot>().await?;
            return Ok(ApplyOutcome::Conflict(snapshot));
        }
        if response.status().is_success() {
            let receipt = response.json::<CommitReceipt>().await?;
            return Ok(ApplyOutcome::Committed(receipt));
        }
        Err(Self::api_error(response).await)
    }

    async fn api_error(response: reqwest::Response) -> LedgerApiError {
        let status = response.status();
        let retry_after = retry_after_secs_from_headers(response.headers());
        let body = response.text().await.unwrap_or_default();
        LedgerApiError::Api {
            status,
            body,
            retry_after,
        }
    }
}

impl LedgerApiError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            LedgerApiError::Api { status, .. } => Some(classify_api_status(*status)),
            LedgerApiError::Request(err) if err.is_timeout() || err.is_connect() => {
                Some(ApiErrorClass::Transient)
            }
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            LedgerApiError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(status, StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_EARLY)
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

/// `Retry-After` is either delta-seconds or an HTTP-date.
fn retry_after_secs_from_headers(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Some(seconds);
    }
    let when = httpdate::parse_http_date(value).ok()?;
    let now = SystemTime::now();
    match when.duration_since(now) {
        Ok(delta) => Some(delta.as_secs()),
        Err(_) => Some(0),
    }
}
