//! Typed adapter over the upstream CSP accounts API
//!
//! The broker never creates sandboxes; it lists the pre-provisioned active
//! sandbox accounts and destroys them after use. All calls go through the
//! circuit breaker in `gateway`, never directly.
//!
//! Setting `CSP_API_TOKEN=mock` swaps the HTTP client for a small in-memory
//! fixture so local runs need no upstream; the contract to the rest of the
//! system is unchanged.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::config::CspConfig;

/// Token sentinel that selects the in-memory fixture
pub const MOCK_TOKEN: &str = "mock";

const LIST_PAGE_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum CspError {
    #[error("CSP request failed: {0}")]
    Request(String),

    #[error("CSP returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// An active sandbox account as the broker sees it
#[derive(Debug, Clone, PartialEq)]
pub struct CspAccount {
    /// Upstream `csp_id`; the broker's primary key
    pub sandbox_id: String,
    pub name: String,
    /// Upstream identity path used for destroy calls
    pub external_id: String,
    /// Seconds since epoch
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyOutcome {
    Destroyed,
    /// The upstream object was already absent (404); treated as success
    AlreadyGone,
}

#[async_trait]
pub trait CspApi: Send + Sync {
    async fn list_active_sandboxes(&self) -> Result<Vec<CspAccount>, CspError>;
    async fn destroy(&self, external_id: &str) -> Result<DestroyOutcome, CspError>;
}

/// Pick the real client or the mock fixture based on the configured token
pub fn build_client(cfg: &CspConfig) -> Result<Arc<dyn CspApi>, CspError> {
    if cfg.api_token == MOCK_TOKEN {
        debug!("CSP mock mode active (token sentinel)");
        Ok(Arc::new(MockCsp::with_fixture()))
    } else {
        Ok(Arc::new(HttpCspClient::new(cfg)?))
    }
}

pub struct HttpCspClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct AccountsPage {
    #[serde(default)]
    results: Vec<RawAccount>,
}

#[derive(Debug, Deserialize)]
struct RawAccount {
    /// Identity path, e.g. `identity/accounts/<uuid>`
    id: String,
    name: String,
    csp_id: Option<String>,
    state: String,
    account_type: String,
    created_at: Option<String>,
}

impl HttpCspClient {
    pub fn new(cfg: &CspConfig) -> Result<Self, CspError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(cfg.timeout_connect_sec))
            .timeout(Duration::from_secs(cfg.timeout_read_sec))
            .build()
            .map_err(|e| CspError::Request(e.to_string()))?;

        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            token: cfg.api_token.clone(),
        })
    }

    async fn fetch_page(&self, offset: usize) -> Result<Vec<RawAccount>, CspError> {
        let url = format!("{}/current_user/accounts", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("_limit", LIST_PAGE_SIZE.to_string()), ("_offset", offset.to_string())])
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| CspError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CspError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let page: AccountsPage = response
            .json()
            .await
            .map_err(|e| CspError::Request(format!("malformed accounts page: {}", e)))?;
        Ok(page.results)
    }
}

#[async_trait]
impl CspApi for HttpCspClient {
    async fn list_active_sandboxes(&self) -> Result<Vec<CspAccount>, CspError> {
        let mut accounts = Vec::new();
        let mut offset = 0;

        loop {
            let raw = self.fetch_page(offset).await?;
            let page_len = raw.len();
            accounts.extend(raw.into_iter().filter_map(map_account));

            if page_len < LIST_PAGE_SIZE {
                break;
            }
            offset += page_len;
        }

        debug!(count = accounts.len(), "Fetched active sandbox accounts from CSP");
        Ok(accounts)
    }

    async fn destroy(&self, external_id: &str) -> Result<DestroyOutcome, CspError> {
        let url = format!(
            "{}/{}",
            self.base_url,
            external_id.trim_start_matches('/')
        );
        let response = self
            .http
            .delete(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| CspError::Request(e.to_string()))?;

        match response.status().as_u16() {
            200 | 204 => Ok(DestroyOutcome::Destroyed),
            404 => Ok(DestroyOutcome::AlreadyGone),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(CspError::Status { status, body })
            }
        }
    }
}

fn map_account(raw: RawAccount) -> Option<CspAccount> {
    if raw.account_type != "sandbox" || raw.state != "active" {
        return None;
    }
    let sandbox_id = raw.csp_id?;
    let created_at = raw
        .created_at
        .as_deref()
        .and_then(parse_timestamp)
        .unwrap_or(0);

    Some(CspAccount {
        sandbox_id,
        name: raw.name,
        external_id: raw.id,
        created_at,
    })
}

fn parse_timestamp(iso: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(iso)
        .ok()
        .map(|dt| dt.timestamp())
}

/// In-memory CSP fixture for local development
pub struct MockCsp {
    accounts: Mutex<Vec<CspAccount>>,
}

impl MockCsp {
    pub fn new(accounts: Vec<CspAccount>) -> Self {
        Self {
            accounts: Mutex::new(accounts),
        }
    }

    pub fn with_fixture() -> Self {
        let accounts = (1..=3)
            .map(|i| CspAccount {
                sandbox_id: format!("mock-csp-{:02}", i),
                name: format!("mock-sandbox-{:02}", i),
                external_id: format!("identity/accounts/mock-{:02}", i),
                created_at: 1_700_000_000,
            })
            .collect();
        Self::new(accounts)
    }
}

#[async_trait]
impl CspApi for MockCsp {
    async fn list_active_sandboxes(&self) -> Result<Vec<CspAccount>, CspError> {
        Ok(self.accounts.lock().clone())
    }

    async fn destroy(&self, external_id: &str) -> Result<DestroyOutcome, CspError> {
        let mut accounts = self.accounts.lock();
        let before = accounts.len();
        accounts.retain(|a| a.external_id != external_id);
        if accounts.len() < before {
            Ok(DestroyOutcome::Destroyed)
        } else {
            Ok(DestroyOutcome::AlreadyGone)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(account_type: &str, state: &str, csp_id: Option<&str>) -> RawAccount {
        RawAccount {
            id: "identity/accounts/abc".into(),
            name: "sb-1".into(),
            csp_id: csp_id.map(String::from),
            state: state.into(),
            account_type: account_type.into(),
            created_at: Some("2024-02-01T10:00:00Z".into()),
        }
    }

    #[test]
    fn test_map_account_filters_type_and_state() {
        assert!(map_account(raw("sandbox", "active", Some("csp-1"))).is_some());
        assert!(map_account(raw("organization", "active", Some("csp-1"))).is_none());
        assert!(map_account(raw("sandbox", "suspended", Some("csp-1"))).is_none());
        assert!(map_account(raw("sandbox", "active", None)).is_none());
    }

    #[test]
    fn test_map_account_field_mapping() {
        let account = map_account(raw("sandbox", "active", Some("csp-1"))).unwrap();
        assert_eq!(account.sandbox_id, "csp-1");
        assert_eq!(account.external_id, "identity/accounts/abc");
        assert_eq!(account.created_at, 1_706_781_600);
    }

    #[test]
    fn test_parse_timestamp_tolerates_garbage() {
        assert_eq!(parse_timestamp("2024-02-01T10:00:00+00:00"), Some(1_706_781_600));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[tokio::test]
    async fn test_mock_destroy_is_gone_on_second_call() {
        let mock = MockCsp::with_fixture();
        let accounts = mock.list_active_sandboxes().await.unwrap();
        assert_eq!(accounts.len(), 3);

        let target = accounts[0].external_id.clone();
        assert_eq!(mock.destroy(&target).await.unwrap(), DestroyOutcome::Destroyed);
        assert_eq!(mock.destroy(&target).await.unwrap(), DestroyOutcome::AlreadyGone);
        assert_eq!(mock.list_active_sandboxes().await.unwrap().len(), 2);
    }
}
