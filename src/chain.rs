//! Provider fallback chain.
//!
//! Order of attempts for one logical generation:
//!
//! 1. the primary model on the primary provider,
//! 2. each fallback model on the same provider, in order,
//! 3. one model on an independent alternate provider.
//!
//! An authentication failure on the primary provider ends the chain at once,
//! since the same key fails for every model there. Rate-limit and
//! unavailable answers start the global cooldown for later requests but do
//! not stop the current chain.

use crate::cooldown::CooldownGovernor;
use crate::provider::{AttemptOutcome, ChatBackend, ChatMessage, ProviderError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("provider rejected the configured credentials")]
    InvalidCredentials,
    #[error("all providers failed after {attempts} attempts")]
    Exhausted { attempts: usize },
    #[error("request cancelled")]
    Cancelled,
}

/// Record of one network call. Lives only for the duration of a chain run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderAttempt {
    pub provider: String,
    pub model: String,
    pub outcome: AttemptOutcome,
    pub http_status: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    pub model: String,
    pub attempts: Vec<ProviderAttempt>,
}

/// A provider plus the models to try on it.
#[derive(Clone)]
pub struct Route {
    pub backend: Arc<dyn ChatBackend>,
    pub models: Vec<String>,
}

impl Route {
    pub fn new(backend: Arc<dyn ChatBackend>, models: Vec<String>) -> Self {
        Self { backend, models }
    }
}

pub struct FallbackChain {
    primary: Route,
    alternate: Option<Route>,
    cooldown: CooldownGovernor,
    cooldown_window: Duration,
}

enum Step {
    Done(String),
    Failed(ProviderError),
    Cancelled,
}

impl FallbackChain {
    pub fn new(
        primary: Route,
        alternate: Option<Route>,
        cooldown: CooldownGovernor,
        cooldown_window: Duration,
    ) -> Self {
        Self {
            primary,
            alternate,
            cooldown,
            cooldown_window,
        }
    }

    /// Run the chain until one attempt succeeds or every option is used up.
    pub async fn generate(
        &self,
        messages: &[ChatMessage],
        max_tokens: u32,
        cancel: &CancellationToken,
    ) -> Result<Generation, ChainError> {
        let mut attempts = Vec::new();

        for model in &self.primary.models {
            match self
                .attempt(&self.primary, model, messages, max_tokens, cancel, &mut attempts)
                .await?
            {
                Some(text) => return Ok(finish(text, model, attempts)),
                None if last_is_fatal(&attempts) => {
                    warn!(provider = self.primary.backend.name(), "credentials rejected, aborting chain");
                    return Err(ChainError::InvalidCredentials);
                }
                None => {}
            }
        }

        if let Some(alternate) = &self.alternate {
            if let Some(model) = alternate.models.first() {
                info!(provider = alternate.backend.name(), model = %model, "primary provider exhausted, trying alternate");
                if let Some(text) = self
                    .attempt(alternate, model, messages, max_tokens, cancel, &mut attempts)
                    .await?
                {
                    return Ok(finish(text, model, attempts));
                }
            }
        }

        warn!(attempts = attempts.len(), "every provider attempt failed");
        Err(ChainError::Exhausted {
            attempts: attempts.len(),
        })
    }

    /// One network call. `Ok(None)` means the attempt failed and was recorded.
    async fn attempt(
        &self,
        route: &Route,
        model: &str,
        messages: &[ChatMessage],
        max_tokens: u32,
        cancel: &CancellationToken,
        attempts: &mut Vec<ProviderAttempt>,
    ) -> Result<Option<String>, ChainError> {
        if cancel.is_cancelled() {
            return Err(ChainError::Cancelled);
        }
        let provider = route.backend.name().to_string();

        // Dropping the request future aborts the HTTP call.
        let step = tokio::select! {
            _ = cancel.cancelled() => Step::Cancelled,
            result = route.backend.complete(model, messages, max_tokens) => match result {
                Ok(text) => Step::Done(text),
                Err(e) => Step::Failed(e),
            },
        };

        match step {
            Step::Cancelled => {
                debug!(%provider, model, "attempt cancelled");
                Err(ChainError::Cancelled)
            }
            Step::Done(text) => {
                attempts.push(ProviderAttempt {
                    provider,
                    model: model.to_string(),
                    outcome: AttemptOutcome::Success,
                    http_status: Some(200),
                });
                Ok(Some(text))
            }
            Step::Failed(err) => {
                let outcome = err.classify();
                warn!(%provider, model, status = ?err.status(), ?outcome, "attempt failed: {}", err);
                if let ProviderError::Http { body, .. } = &err {
                    debug!(%provider, model, "provider error body: {}", body);
                }
                if err.is_rate_limited() {
                    if let Err(e) = self.cooldown.trigger(self.cooldown_window) {
                        warn!("failed to persist cooldown: {}", e);
                    }
                }
                attempts.push(ProviderAttempt {
                    provider,
                    model: model.to_string(),
                    outcome,
                    http_status: err.status(),
                });
                Ok(None)
            }
        }
    }
}

fn last_is_fatal(attempts: &[ProviderAttempt]) -> bool {
    attempts
        .last()
        .is_some_and(|a| a.outcome == AttemptOutcome::Fatal)
}

fn finish(text: String, model: &str, attempts: Vec<ProviderAttempt>) -> Generation {
    debug!(model, attempts = attempts.len(), "generation succeeded");
    Generation {
        text,
        model: model.to_string(),
        attempts,
    }
}
