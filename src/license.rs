//! Client for the remote premium-key backend.
//!
//! The backend has moved between hosts, so several base URLs are known. They
//! are tried most-recently-successful first. An `expired` or `revoked` answer
//! is final; transport errors and server errors move on to the next host.

use crate::storage::{Storage, KEY_LICENSE_PREFERRED};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const VALIDATE_PATH: &str = "/api/premium/keys/validate";
const CLAIM_PATH: &str = "/api/premium/claim";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Error, Debug)]
pub enum LicenseError {
    #[error("no license endpoints configured")]
    NoEndpoints,
    #[error("license service unreachable: {0}")]
    Unreachable(String),
    #[error("no active subscription for this e-mail")]
    NoSubscription,
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Answer to a key validation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValidation {
    pub valid: bool,
    #[serde(default)]
    pub plan: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, rename = "expiresAt", alias = "expires_at")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl KeyValidation {
    /// `expired` and `revoked` settle the question for every host.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status.as_deref(), Some("expired") | Some("revoked"))
    }

    /// Valid and not carrying a non-active status.
    pub fn is_active(&self) -> bool {
        self.valid && matches!(self.status.as_deref(), None | Some("active"))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClaimedKey {
    pub key: String,
    pub status: String,
}

/// Remote authority for premium keys.
#[async_trait]
pub trait LicenseValidator: Send + Sync {
    async fn validate(&self, key: &str) -> Result<KeyValidation, LicenseError>;

    /// Look up the active key bought with this e-mail address.
    async fn claim(&self, email: &str) -> Result<ClaimedKey, LicenseError>;
}

#[derive(Serialize)]
struct ValidateBody<'a> {
    key: &'a str,
}

#[derive(Serialize)]
struct ClaimBody<'a> {
    email: &'a str,
}

pub struct HttpLicenseClient {
    client: Client,
    base_urls: Vec<String>,
    storage: Option<Storage>,
}

impl HttpLicenseClient {
    pub fn new(base_urls: Vec<String>, timeout: Option<Duration>) -> Result<Self, LicenseError> {
        let client = Client::builder()
            .user_agent(concat!("briefly/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout.unwrap_or(REQUEST_TIMEOUT))
            .build()?;
        let base_urls = base_urls
            .into_iter()
            .map(|u| u.trim().trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
            .collect();
        Ok(Self {
            client,
            base_urls,
            storage: None,
        })
    }

    /// Remember which host answered last across restarts.
    pub fn with_storage(mut self, storage: Storage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Base URLs in the order they should be tried.
    pub fn ordered_bases(&self) -> Vec<String> {
        let preferred: Option<String> = self
            .storage
            .as_ref()
            .and_then(|s| s.get_json(KEY_LICENSE_PREFERRED).ok().flatten());
        let mut ordered = self.base_urls.clone();
        if let Some(preferred) = preferred {
            if let Some(pos) = ordered.iter().position(|b| *b == preferred) {
                let base = ordered.remove(pos);
                ordered.insert(0, base);
            }
        }
        ordered
    }

    fn remember(&self, base: &str) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.put_json(KEY_LICENSE_PREFERRED, &base) {
                warn!("failed to store preferred license host: {}", e);
            }
        }
    }
}

#[async_trait]
impl LicenseValidator for HttpLicenseClient {
    async fn validate(&self, key: &str) -> Result<KeyValidation, LicenseError> {
        let bases = self.ordered_bases();
        if bases.is_empty() {
            return Err(LicenseError::NoEndpoints);
        }

        let mut last_answer: Option<KeyValidation> = None;
        let mut last_error = String::new();
        for base in &bases {
            let url = format!("{base}{VALIDATE_PATH}");
            let response = match self.client.post(&url).json(&ValidateBody { key }).send().await {
                Ok(r) => r,
                Err(e) => {
                    debug!(%url, "license host unreachable: {}", e);
                    last_error = e.to_string();
                    continue;
                }
            };
            let status = response.status();
            if !status.is_success() {
                debug!(%url, %status, "license host returned an error");
                last_error = format!("HTTP {status}");
                continue;
            }
            let answer: KeyValidation = match response.json().await {
                Ok(a) => a,
                Err(e) => {
                    last_error = e.to_string();
                    continue;
                }
            };
            if answer.is_active() {
                self.remember(base);
                return Ok(answer);
            }
            if answer.is_terminal() {
                self.remember(base);
                return Ok(answer);
            }
            // Unknown here; a migrated host may still know the key.
            last_answer = Some(answer);
        }

        last_answer.ok_or(LicenseError::Unreachable(last_error))
    }

    async fn claim(&self, email: &str) -> Result<ClaimedKey, LicenseError> {
        let bases = self.ordered_bases();
        if bases.is_empty() {
            return Err(LicenseError::NoEndpoints);
        }

        let email = email.trim().to_lowercase();
        let mut not_found = false;
        let mut last_error = String::new();
        for base in &bases {
            let url = format!("{base}{CLAIM_PATH}");
            let response = match self
                .client
                .post(&url)
                .json(&ClaimBody { email: &email })
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    last_error = e.to_string();
                    continue;
                }
            };
            match response.status() {
                StatusCode::NOT_FOUND => not_found = true,
                s if s.is_success() => match response.json::<ClaimedKey>().await {
                    Ok(claimed) => {
                        self.remember(base);
                        return Ok(claimed);
                    }
                    Err(e) => last_error = e.to_string(),
                },
                s => last_error = format!("HTTP {s}"),
            }
        }

        if not_found {
            Err(LicenseError::NoSubscription)
        } else {
            Err(LicenseError::Unreachable(last_error))
        }
    }
}
