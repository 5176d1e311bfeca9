use async_trait::async_trait;
use briefly::chain::{FallbackChain, Route};
use briefly::clock::ManualClock;
use briefly::cooldown::CooldownGovernor;
use briefly::license::{ClaimedKey, KeyValidation, LicenseError, LicenseValidator};
use briefly::provider::{ChatBackend, ChatMessage, ProviderError};
use briefly::summarizer::{SummarizeError, SummarizerParts};
use briefly::{
    DetailLevel, Language, SettingsPatch, Storage, Summarizer, SummaryRequest, SummaryResponse, UserSettings,
};
use chrono::{TimeDelta, TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Answers from a queue in call order; an empty queue reads as a network error.
/// Calls whose index is in `hang_on` never answer.
struct Queued {
    answers: Mutex<VecDeque<Result<String, u16>>>,
    calls: Mutex<Vec<String>>,
    hang_on: Vec<usize>,
}

impl Queued {
    fn new(answers: Vec<Result<&str, u16>>) -> Arc<Self> {
        Self::hanging_on(&[], answers)
    }

    fn hanging_on(calls: &[usize], answers: Vec<Result<&str, u16>>) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.into_iter().map(|a| a.map(String::from)).collect()),
            calls: Mutex::new(Vec::new()),
            hang_on: calls.to_vec(),
        })
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn push(&self, answer: Result<&str, u16>) {
        self.answers.lock().unwrap().push_back(answer.map(String::from));
    }
}

#[async_trait]
impl ChatBackend for Queued {
    fn name(&self) -> &str {
        "openrouter"
    }

    async fn complete(&self, model: &str, _: &[ChatMessage], _: u32) -> Result<String, ProviderError> {
        let index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(model.to_string());
            calls.len() - 1
        };
        if self.hang_on.contains(&index) {
            return std::future::pending().await;
        }
        let next = self.answers.lock().unwrap().pop_front();
        match next {
            Some(Ok(text)) => Ok(text),
            Some(Err(status)) => Err(ProviderError::Http {
                provider: "openrouter".into(),
                status,
                body: "upstream said no".into(),
            }),
            None => Err(ProviderError::Network("connection refused".into())),
        }
    }
}

/// Validator with one fixed answer.
struct FixedValidator(KeyValidation);

#[async_trait]
impl LicenseValidator for FixedValidator {
    async fn validate(&self, _key: &str) -> Result<KeyValidation, LicenseError> {
        Ok(self.0.clone())
    }

    async fn claim(&self, _email: &str) -> Result<ClaimedKey, LicenseError> {
        Ok(ClaimedKey {
            key: "PREMIUM-KEY-ABCD".into(),
            status: "active".into(),
        })
    }
}

struct Harness {
    app: Summarizer,
    backend: Arc<Queued>,
    clock: Arc<ManualClock>,
}

fn free_validator() -> KeyValidation {
    KeyValidation {
        valid: false,
        plan: String::new(),
        status: Some("not_found".into()),
        expires_at: None,
    }
}

fn harness_with(backend: Arc<Queued>, validator: KeyValidation, daily_limit: u32) -> Harness {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap()));
    let chain_backend = backend.clone();
    let chain_builder = Arc::new(move |_: &UserSettings, cooldown: &CooldownGovernor| {
        Ok::<_, SummarizeError>(FallbackChain::new(
            Route::new(chain_backend.clone(), vec!["primary".into(), "fallback".into()]),
            None,
            cooldown.clone(),
            Duration::from_secs(20),
        ))
    });
    let app = Summarizer::from_parts(SummarizerParts {
        storage: Storage::temporary().unwrap(),
        mirror: Some(Storage::temporary().unwrap()),
        clock: clock.clone(),
        validator: Arc::new(FixedValidator(validator)),
        chain_builder,
        daily_limit,
        device_id: Some("dev-test".into()),
    })
    .unwrap();
    Harness { app, backend, clock }
}

fn harness(answers: Vec<Result<&str, u16>>) -> Harness {
    harness_with(Queued::new(answers), free_validator(), 5)
}

fn article(topic: &str) -> SummaryRequest {
    SummaryRequest::web(format!(
        "{topic}: a long enough article body that easily passes the minimum length check."
    ))
}

fn error_of(response: SummaryResponse) -> String {
    match response {
        SummaryResponse::Failure { error } => error,
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn fresh_summary_is_counted_cached_and_recorded() {
    let h = harness(vec![Ok("1. Topic: sentence")]);
    let response = h.app.handle(article("rust")).await;
    assert_eq!(
        response,
        SummaryResponse::Success {
            summary: "1. Topic: sentence".into(),
            title: "Página".into(),
            model_used: "primary".into(),
        }
    );
    assert_eq!(h.app.quota_status().await.unwrap().used, 1);
    assert_eq!(h.app.last_model_used().unwrap().as_deref(), Some("primary"));
    assert_eq!(h.app.history().unwrap().len(), 1);
}

#[tokio::test]
async fn cache_hit_counts_use_without_network() {
    let h = harness(vec![Ok("1. Topic: sentence")]);
    assert!(h.app.handle(article("rust")).await.is_success());
    let second = h.app.handle(article("rust")).await;
    assert!(second.is_success());
    assert_eq!(h.backend.calls().len(), 1);
    assert_eq!(h.app.quota_status().await.unwrap().used, 2);
}

#[tokio::test]
async fn persona_changes_cache_key() {
    let h = harness(vec![Ok("plain"), Ok("toned")]);
    h.app.handle(article("rust")).await;
    h.app
        .update_settings(SettingsPatch {
            persona: Some("a pirate".into()),
            ..Default::default()
        })
        .unwrap();
    h.app.handle(article("rust")).await;
    assert_eq!(h.backend.calls().len(), 2);
}

#[tokio::test]
async fn short_input_is_refused_before_side_effects() {
    let h = harness(vec![]);
    let error = error_of(h.app.handle(SummaryRequest::web("too short")).await);
    assert_eq!(error, "Conteúdo insuficiente para gerar resumo");
    assert!(h.backend.calls().is_empty());
    assert_eq!(h.app.quota_status().await.unwrap().used, 0);
}

#[tokio::test]
async fn disabled_extension_refuses_requests() {
    let h = harness(vec![Ok("unused")]);
    h.app
        .update_settings(SettingsPatch {
            extension_active: Some(false),
            language: Some(Language::En),
            ..Default::default()
        })
        .unwrap();
    let error = error_of(h.app.handle(article("rust")).await);
    assert_eq!(error, "Summaries are turned off.");
    assert!(h.backend.calls().is_empty());
}

#[tokio::test]
async fn daily_limit_blocks_then_resets_next_day() {
    let h = harness_with(Queued::new(vec![Ok("one"), Ok("two"), Ok("three")]), free_validator(), 2);
    assert!(h.app.handle(article("a")).await.is_success());
    assert!(h.app.handle(article("b")).await.is_success());
    assert_eq!(h.app.quota_status().await.unwrap().used, 2);

    let error = error_of(h.app.handle(article("c")).await);
    assert!(error.contains("Limite diário de 2"), "{error}");
    assert_eq!(h.backend.calls().len(), 2);

    h.clock.advance(TimeDelta::hours(30));
    assert!(h.app.handle(article("c")).await.is_success());
    assert_eq!(h.app.quota_status().await.unwrap().used, 1);
}

#[tokio::test]
async fn rate_limits_start_a_cooldown() {
    let h = harness(vec![Err(429), Err(429)]);
    let error = error_of(h.app.handle(article("a")).await);
    assert!(error.contains("várias tentativas"), "{error}");
    assert!(!error.contains("429"));
    assert_eq!(h.app.quota_status().await.unwrap().used, 0);

    h.backend.push(Ok("after the wait"));
    let error = error_of(h.app.handle(article("b")).await);
    assert_eq!(error, "Serviço temporariamente indisponível. Aguarde 20s.");
    assert_eq!(h.backend.calls().len(), 2);

    h.clock.advance(TimeDelta::seconds(21));
    assert!(h.app.handle(article("b")).await.is_success());
}

#[tokio::test]
async fn rejected_credentials_stop_the_chain() {
    let h = harness(vec![Err(401), Ok("never used")]);
    h.app
        .update_settings(SettingsPatch {
            language: Some(Language::En),
            ..Default::default()
        })
        .unwrap();
    let error = error_of(h.app.handle(article("a")).await);
    assert!(error.contains("API key was rejected"), "{error}");
    assert_eq!(h.backend.calls(), vec!["primary".to_string()]);
}

#[tokio::test]
async fn pdf_title_comes_from_the_model() {
    let h = harness(vec![Ok("TITLE: Annual Report\nSUMMARY:\n1. Revenue: grew")]);
    let request = SummaryRequest::pdf("x".repeat(120), "report.pdf");
    match h.app.handle(request).await {
        SummaryResponse::Success { summary, title, .. } => {
            assert_eq!(title, "Annual Report");
            assert_eq!(summary, "1. Revenue: grew");
        }
        other => panic!("unexpected {other:?}"),
    }
    let item = &h.app.history().unwrap()[0];
    assert_eq!(item.url, "imported-file");
}

#[tokio::test]
async fn deep_summary_gets_missing_expansion() {
    let h = harness(vec![Ok("1. Context: x"), Ok("ANÁLISE APROFUNDADA\n1. Finding: y")]);
    h.app
        .update_settings(SettingsPatch {
            detail_level: Some(DetailLevel::Deep),
            ..Default::default()
        })
        .unwrap();
    match h.app.handle(article("study")).await {
        SummaryResponse::Success { summary, .. } => {
            assert!(summary.starts_with("1. Context: x"));
            assert!(summary.contains("ANÁLISE APROFUNDADA"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(h.backend.calls().len(), 2);
}

#[tokio::test]
async fn failed_expansion_keeps_first_answer() {
    let h = harness(vec![Ok("1. Context: x"), Err(500), Err(500)]);
    h.app
        .update_settings(SettingsPatch {
            detail_level: Some(DetailLevel::Deep),
            ..Default::default()
        })
        .unwrap();
    match h.app.handle(article("study")).await {
        SummaryResponse::Success { summary, .. } => assert_eq!(summary, "1. Context: x"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn premium_key_lifts_the_limit() {
    let validator = KeyValidation {
        valid: true,
        plan: "premium".into(),
        status: Some("active".into()),
        expires_at: Some(Utc.with_ymd_and_hms(2026, 4, 10, 0, 0, 0).unwrap()),
    };
    let h = harness_with(Queued::new(vec![Ok("one"), Ok("two")]), validator, 1);
    assert!(h.app.handle(article("a")).await.is_success());

    let grant = h.app.apply_entitlement_key("PREMIUM-KEY-ABCD").await.unwrap();
    assert_eq!(grant.masked_key.as_deref(), Some("************ABCD"));
    assert!(h.app.handle(article("b")).await.is_success());
    assert_eq!(h.app.quota_status().await.unwrap().plan, "premium");
}

#[tokio::test]
async fn expired_key_is_rejected_and_state_stays_free() {
    let validator = KeyValidation {
        valid: true,
        plan: "premium".into(),
        status: Some("expired".into()),
        expires_at: None,
    };
    let h = harness_with(Queued::new(vec![]), validator, 5);
    let err = h.app.apply_entitlement_key("OLD-KEY-1234").await.unwrap_err();
    assert!(matches!(err, SummarizeError::InvalidKey));
    let status = h.app.quota_status().await.unwrap();
    assert_eq!(status.plan, "free");
    assert_eq!(status.masked_key, None);
}

#[tokio::test]
async fn claim_activates_the_returned_key() {
    let validator = KeyValidation {
        valid: true,
        plan: "premium_unlimited".into(),
        status: Some("active".into()),
        expires_at: None,
    };
    let h = harness_with(Queued::new(vec![]), validator, 5);
    let grant = h.app.claim_entitlement("someone@example.com").await.unwrap();
    assert!(grant.unlimited);
    assert_eq!(h.app.quota_status().await.unwrap().plan, "premium_unlimited");
}

#[tokio::test]
async fn history_can_be_cleared() {
    let h = harness(vec![Ok("one")]);
    h.app.handle(article("a")).await;
    h.app.clear_history().unwrap();
    assert!(h.app.history().unwrap().is_empty());
}

#[tokio::test]
async fn new_request_cancels_the_one_in_flight() {
    let h = harness_with(Queued::hanging_on(&[0], vec![Ok("second answer")]), free_validator(), 5);
    let (first, second) = tokio::join!(h.app.handle(article("a")), async {
        tokio::task::yield_now().await;
        h.app.handle(article("b")).await
    });

    assert_eq!(error_of(first), "Solicitação cancelada.");
    match second {
        SummaryResponse::Success { summary, .. } => assert_eq!(summary, "second answer"),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(h.backend.calls().len(), 2);
    assert_eq!(h.app.quota_status().await.unwrap().used, 1);
    assert_eq!(h.app.history().unwrap().len(), 1);
}

#[tokio::test]
async fn cancelled_request_keeps_its_cooldown() {
    let h = harness_with(Queued::hanging_on(&[1], vec![Err(429), Ok("later")]), free_validator(), 5);
    let (first, second) = tokio::join!(h.app.handle(article("a")), async {
        tokio::task::yield_now().await;
        h.app.handle(article("b")).await
    });

    assert_eq!(error_of(first), "Solicitação cancelada.");
    assert_eq!(error_of(second), "Serviço temporariamente indisponível. Aguarde 20s.");
    assert_eq!(h.backend.calls().len(), 2);

    h.clock.advance(TimeDelta::seconds(21));
    assert!(h.app.handle(article("b")).await.is_success());
}
