//! Request orchestration.
//!
//! [`Summarizer`] is the context object built once at startup and passed to
//! request handlers. It owns the stores, the quota tracker, the cache, the
//! cooldown gate and the current fallback chain. The chain is rebuilt when the
//! settings change, since user-supplied keys decide which credentials it uses.
//!
//! Every error is turned into a localized, user-facing message in
//! [`Summarizer::handle`]; provider details only reach the logs.

use crate::cache::{fingerprint, CacheEntry, ResultCache};
use crate::chain::{ChainError, FallbackChain, Route};
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, ConfigError, SettingsPatch, UserSettings};
use crate::cooldown::CooldownGovernor;
use crate::history::{HistoryItem, HistoryRecord, HistoryRecorder};
use crate::license::{HttpLicenseClient, LicenseError, LicenseValidator};
use crate::parser::{parse_title_summary, strip_code_fence};
use crate::prompt::{build_expansion_messages, build_messages, needs_expansion};
use crate::provider::{GeminiBackend, OpenRouterBackend, ProviderError};
use crate::quota::{DenyReason, Entitlement, QuotaDecision, QuotaError, QuotaStatus, QuotaTracker};
use crate::storage::{Storage, StorageError, KEY_LAST_MODEL};
use crate::summary::{DetailLevel, GenerationRequest, GenerationResult, Language, SourceKind};
use chrono::NaiveDate;
use serde::ser::{SerializeStruct, Serializer};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shorter input is rejected before any side effect.
pub const MIN_TEXT_CHARS: usize = 50;

#[derive(Error, Debug)]
pub enum SummarizeError {
    #[error("summaries are disabled")]
    Disabled,
    #[error("insufficient content")]
    InsufficientContent,
    #[error("daily limit of {limit} reached")]
    QuotaExceeded { limit: u32, resets_on: NaiveDate },
    #[error("cooling down for {seconds}s")]
    CoolingDown { seconds: u64 },
    #[error("credentials rejected")]
    InvalidCredentials,
    #[error("providers unavailable")]
    Unavailable,
    #[error("request cancelled")]
    Cancelled,
    #[error("invalid key")]
    InvalidKey,
    #[error("no active subscription")]
    NoSubscription,
    #[error("license service unavailable: {0}")]
    LicenseUnavailable(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("provider setup failed: {0}")]
    Provider(#[from] ProviderError),
}

impl From<ChainError> for SummarizeError {
    fn from(e: ChainError) -> Self {
        match e {
            ChainError::InvalidCredentials => SummarizeError::InvalidCredentials,
            ChainError::Exhausted { .. } => SummarizeError::Unavailable,
            ChainError::Cancelled => SummarizeError::Cancelled,
        }
    }
}

impl From<QuotaError> for SummarizeError {
    fn from(e: QuotaError) -> Self {
        match e {
            QuotaError::Storage(e) => SummarizeError::Storage(e),
            QuotaError::InvalidKey { .. } => SummarizeError::InvalidKey,
            QuotaError::License(e) => e.into(),
        }
    }
}

impl From<LicenseError> for SummarizeError {
    fn from(e: LicenseError) -> Self {
        match e {
            LicenseError::NoSubscription => SummarizeError::NoSubscription,
            other => SummarizeError::LicenseUnavailable(other.to_string()),
        }
    }
}

impl SummarizeError {
    /// Message safe to show to the end user.
    pub fn user_message(&self, language: Language) -> String {
        use SummarizeError::*;
        match (self, language) {
            (Disabled, Language::Pt) => "A extensão está desativada.".to_string(),
            (Disabled, Language::En) => "Summaries are turned off.".to_string(),
            (InsufficientContent, Language::Pt) => "Conteúdo insuficiente para gerar resumo".to_string(),
            (InsufficientContent, Language::En) => "Not enough content to summarise".to_string(),
            (QuotaExceeded { limit, resets_on }, Language::Pt) => format!(
                "Limite diário de {limit} resumos atingido. O contador reinicia em {}. Ative uma chave Premium para uso ilimitado.",
                resets_on.format("%d/%m/%Y")
            ),
            (QuotaExceeded { limit, resets_on }, Language::En) => format!(
                "Daily limit of {limit} summaries reached. The counter resets on {}. Activate a Premium key for unlimited use.",
                resets_on.format("%Y-%m-%d")
            ),
            (CoolingDown { seconds }, Language::Pt) => {
                format!("Serviço temporariamente indisponível. Aguarde {seconds}s.")
            }
            (CoolingDown { seconds }, Language::En) => {
                format!("Service temporarily unavailable. Wait {seconds}s.")
            }
            (InvalidCredentials, Language::Pt) => {
                "A chave de API foi recusada. Verifique a chave nas configurações.".to_string()
            }
            (InvalidCredentials, Language::En) => {
                "The API key was rejected. Check the key in your settings.".to_string()
            }
            (Unavailable, Language::Pt) => {
                "Serviço de IA temporariamente indisponível após várias tentativas. Tente novamente em alguns segundos.".to_string()
            }
            (Unavailable, Language::En) => {
                "The AI service is temporarily unavailable after multiple attempts. Try again in a few seconds.".to_string()
            }
            (Cancelled, Language::Pt) => "Solicitação cancelada.".to_string(),
            (Cancelled, Language::En) => "Request cancelled.".to_string(),
            (InvalidKey, Language::Pt) => "Chave inválida.".to_string(),
            (InvalidKey, Language::En) => "Invalid key.".to_string(),
            (NoSubscription, Language::Pt) => {
                "Nenhuma assinatura ativa encontrada para este e-mail.".to_string()
            }
            (NoSubscription, Language::En) => "No active subscription found for this e-mail.".to_string(),
            (LicenseUnavailable(_), Language::Pt) => {
                "Não foi possível verificar a chave agora. Tente novamente mais tarde.".to_string()
            }
            (LicenseUnavailable(_), Language::En) => {
                "The key could not be verified right now. Try again later.".to_string()
            }
            (Storage(_) | Config(_) | Provider(_), Language::Pt) => {
                "Falha ao acessar o serviço de IA".to_string()
            }
            (Storage(_) | Config(_) | Provider(_), Language::En) => {
                "Could not reach the AI service".to_string()
            }
        }
    }
}

/// Inbound request from the extraction layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryRequest {
    pub text: String,
    pub source: SourceKind,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub page_title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl SummaryRequest {
    pub fn web(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source: SourceKind::Web,
            ..Default::default()
        }
    }

    pub fn pdf(text: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source: SourceKind::Pdf,
            file_name: Some(file_name.into()),
            ..Default::default()
        }
    }
}

/// Outbound result. Serializes as `{ "success": true, ... }` or
/// `{ "success": false, "error": ... }`.
#[derive(Debug, Clone, PartialEq)]
pub enum SummaryResponse {
    Success {
        summary: String,
        title: String,
        model_used: String,
    },
    Failure {
        error: String,
    },
}

impl SummaryResponse {
    pub fn is_success(&self) -> bool {
        matches!(self, SummaryResponse::Success { .. })
    }
}

impl Serialize for SummaryResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SummaryResponse::Success {
                summary,
                title,
                model_used,
            } => {
                let mut s = serializer.serialize_struct("SummaryResponse", 4)?;
                s.serialize_field("success", &true)?;
                s.serialize_field("summary", summary)?;
                s.serialize_field("title", title)?;
                s.serialize_field("modelUsed", model_used)?;
                s.end()
            }
            SummaryResponse::Failure { error } => {
                let mut s = serializer.serialize_struct("SummaryResponse", 2)?;
                s.serialize_field("success", &false)?;
                s.serialize_field("error", error)?;
                s.end()
            }
        }
    }
}

/// Builds the fallback chain for the current settings.
pub type ChainBuilder =
    dyn Fn(&UserSettings, &CooldownGovernor) -> Result<FallbackChain, SummarizeError> + Send + Sync;

/// Pieces needed to assemble a [`Summarizer`]; lets tests swap the network out.
pub struct SummarizerParts {
    pub storage: Storage,
    pub mirror: Option<Storage>,
    pub clock: Arc<dyn Clock>,
    pub validator: Arc<dyn LicenseValidator>,
    pub chain_builder: Arc<ChainBuilder>,
    pub daily_limit: u32,
    pub device_id: Option<String>,
}

pub struct Summarizer {
    storage: Storage,
    clock: Arc<dyn Clock>,
    settings: RwLock<UserSettings>,
    chain_builder: Arc<ChainBuilder>,
    chain: RwLock<Option<Arc<FallbackChain>>>,
    quota: QuotaTracker,
    cache: ResultCache,
    cooldown: CooldownGovernor,
    history: HistoryRecorder,
    validator: Arc<dyn LicenseValidator>,
    in_flight: Mutex<Option<(u64, CancellationToken)>>,
    next_request: AtomicU64,
}

impl Summarizer {
    /// Open stores and HTTP clients described by `config`.
    pub fn open(config: Config) -> Result<Self, SummarizeError> {
        let storage = Storage::open(&config.storage.path)?;
        let mirror = match config.storage.mirror_dir() {
            Some(dir) => match Storage::open(&dir) {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!(path = %dir.display(), "quota mirror unavailable: {}", e);
                    None
                }
            },
            None => None,
        };
        let validator = HttpLicenseClient::new(
            config.license.base_urls.clone(),
            config.license.timeout_secs.map(Duration::from_secs),
        )?
        .with_storage(storage.clone());
        let daily_limit = config.quota.daily_limit;
        let chain_builder = Arc::new(move |settings: &UserSettings, cooldown: &CooldownGovernor| {
            build_http_chain(&config, settings, cooldown)
        });

        Self::from_parts(SummarizerParts {
            storage,
            mirror,
            clock: Arc::new(SystemClock),
            validator: Arc::new(validator),
            chain_builder,
            daily_limit,
            device_id: None,
        })
    }

    pub fn from_parts(parts: SummarizerParts) -> Result<Self, SummarizeError> {
        let settings = UserSettings::load(&parts.storage)?;
        let cooldown = CooldownGovernor::new(parts.storage.clone(), parts.clock.clone());
        let cache = ResultCache::open(&parts.storage, parts.clock.clone())?;
        let history = HistoryRecorder::new(parts.storage.clone(), parts.clock.clone());
        let quota = match parts.device_id {
            Some(id) => QuotaTracker::with_device_id(
                parts.storage.clone(),
                parts.mirror,
                parts.clock.clone(),
                parts.validator.clone(),
                parts.daily_limit,
                id,
            ),
            None => QuotaTracker::new(
                parts.storage.clone(),
                parts.mirror,
                parts.clock.clone(),
                parts.validator.clone(),
                parts.daily_limit,
            ),
        };

        Ok(Self {
            storage: parts.storage,
            clock: parts.clock,
            settings: RwLock::new(settings),
            chain_builder: parts.chain_builder,
            chain: RwLock::new(None),
            quota,
            cache,
            cooldown,
            history,
            validator: parts.validator,
            in_flight: Mutex::new(None),
            next_request: AtomicU64::new(1),
        })
    }

    pub fn settings(&self) -> UserSettings {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Settings for display. Silently rechecks the premium key first.
    pub async fn read_settings(&self) -> UserSettings {
        if let Err(e) = self.quota.revalidate().await {
            debug!("entitlement revalidation failed: {}", e);
        }
        self.settings()
    }

    /// Re-read settings from storage after an external change.
    pub fn reload_settings(&self) -> Result<UserSettings, SummarizeError> {
        let settings = UserSettings::load(&self.storage)?;
        self.install_settings(settings.clone());
        Ok(settings)
    }

    pub fn update_settings(&self, patch: SettingsPatch) -> Result<UserSettings, SummarizeError> {
        let settings = self.settings().merge(patch);
        settings.save(&self.storage)?;
        self.install_settings(settings.clone());
        info!(?settings, "settings updated");
        Ok(settings)
    }

    fn install_settings(&self, settings: UserSettings) {
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = settings;
        // Keys may have changed; build the chain again on next use.
        *self.chain.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn chain(&self) -> Result<Arc<FallbackChain>, SummarizeError> {
        if let Some(chain) = self.chain.read().unwrap_or_else(|e| e.into_inner()).as_ref() {
            return Ok(chain.clone());
        }
        let chain = Arc::new((self.chain_builder)(&self.settings(), &self.cooldown)?);
        *self.chain.write().unwrap_or_else(|e| e.into_inner()) = Some(chain.clone());
        Ok(chain)
    }

    pub async fn quota_status(&self) -> Result<QuotaStatus, SummarizeError> {
        if let Err(e) = self.quota.revalidate().await {
            debug!("entitlement revalidation failed: {}", e);
        }
        Ok(self.quota.status()?)
    }

    pub async fn apply_entitlement_key(&self, key: &str) -> Result<Entitlement, SummarizeError> {
        Ok(self.quota.apply_entitlement_key(key).await?)
    }

    /// Fetch the key bought with `email` and activate it.
    pub async fn claim_entitlement(&self, email: &str) -> Result<Entitlement, SummarizeError> {
        let claimed = self.validator.claim(email).await?;
        self.apply_entitlement_key(&claimed.key).await
    }

    pub fn history(&self) -> Result<Vec<HistoryItem>, SummarizeError> {
        Ok(self.history.list()?)
    }

    pub fn clear_history(&self) -> Result<(), SummarizeError> {
        Ok(self.history.clear()?)
    }

    pub fn last_model_used(&self) -> Result<Option<String>, SummarizeError> {
        Ok(self.storage.get_json(KEY_LAST_MODEL)?)
    }

    /// Cancel whatever generation is currently running.
    pub fn cancel_in_flight(&self) {
        if let Some((_, token)) = self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).take() {
            token.cancel();
        }
    }

    /// Top-level handler: never fails, always returns a response.
    pub async fn handle(&self, request: SummaryRequest) -> SummaryResponse {
        let language = self.settings().language;
        match self.summarize(request).await {
            Ok((result, title)) => SummaryResponse::Success {
                summary: result.summary_text,
                title,
                model_used: result.model_identifier,
            },
            Err(err) => {
                match &err {
                    SummarizeError::Storage(_) | SummarizeError::Config(_) | SummarizeError::Provider(_) => {
                        error!("summary failed: {}", err)
                    }
                    _ => info!("summary refused: {}", err),
                }
                SummaryResponse::Failure {
                    error: err.user_message(language),
                }
            }
        }
    }

    /// Run the pipeline. Returns the result and the display title.
    pub async fn summarize(
        &self,
        request: SummaryRequest,
    ) -> Result<(GenerationResult, String), SummarizeError> {
        let settings = self.settings();
        if !settings.extension_active {
            return Err(SummarizeError::Disabled);
        }
        if request.text.trim().chars().count() < MIN_TEXT_CHARS {
            return Err(SummarizeError::InsufficientContent);
        }

        let (request_id, cancel) = self.begin_request();
        let outcome = self.run(&settings, &request, &cancel).await;
        self.finish_request(request_id);
        let result = outcome?;

        let title = display_title(&request, result.inferred_title.as_deref(), settings.language);
        if let Err(e) = self.history.record(HistoryRecord {
            original_text: &request.text,
            summary: &result.summary_text,
            title: &title,
            url: request.url.as_deref(),
            model: &result.model_identifier,
            source: request.source,
        }) {
            warn!("failed to record history: {}", e);
        }
        Ok((result, title))
    }

    async fn run(
        &self,
        settings: &UserSettings,
        request: &SummaryRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationResult, SummarizeError> {
        if let QuotaDecision::Denied(DenyReason::DailyLimitReached { limit, resets_on }) =
            self.quota.check_and_reserve()?
        {
            return Err(SummarizeError::QuotaExceeded { limit, resets_on });
        }

        let generation = GenerationRequest::new(
            request.text.as_str(),
            request.source,
            settings.detail_level,
            settings.language,
            settings.persona.clone(),
        );
        let key = fingerprint(&generation);

        match self.cache.get(&key) {
            Ok(Some(hit)) => {
                debug!(key = %key, "cache hit");
                self.count_use();
                return Ok(GenerationResult {
                    summary_text: hit.summary,
                    inferred_title: hit.title,
                    model_identifier: hit.model,
                    completed_at: self.clock.now(),
                });
            }
            Ok(None) => {}
            Err(e) => warn!("cache read failed, treating as miss: {}", e),
        }

        if let Some(seconds) = self.cooldown.is_cooling_down()? {
            return Err(SummarizeError::CoolingDown { seconds });
        }

        let chain = self.chain()?;
        let result = self.generate(&chain, &generation, cancel).await?;

        let entry = CacheEntry {
            key: key.clone(),
            title: result.inferred_title.clone(),
            summary: result.summary_text.clone(),
            model: result.model_identifier.clone(),
            created_at: result.completed_at,
            source_kind: generation.mode(),
        };
        if let Err(e) = self.cache.put(&key, &entry) {
            warn!("failed to cache summary: {}", e);
        }
        self.count_use();
        if let Err(e) = self.storage.put_json(KEY_LAST_MODEL, &result.model_identifier) {
            warn!("failed to store last model: {}", e);
        }
        Ok(result)
    }

    async fn generate(
        &self,
        chain: &FallbackChain,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationResult, SummarizeError> {
        let level = request.detail_level();
        let first = chain
            .generate(&build_messages(request), level.max_output_tokens(), cancel)
            .await?;
        info!(model = %first.model, attempts = first.attempts.len(), "summary generated");

        let (title, mut summary) = match request.mode() {
            SourceKind::Pdf => {
                let parsed = parse_title_summary(&first.text);
                (parsed.title, parsed.summary)
            }
            SourceKind::Web => (None, strip_code_fence(&first.text)),
        };

        if needs_expansion(level, request.language(), &summary) {
            debug!("deep summary missing expansion section, requesting it");
            let messages = build_expansion_messages(request, &summary);
            match chain
                .generate(&messages, DetailLevel::Deep.max_output_tokens(), cancel)
                .await
            {
                Ok(extra) => {
                    summary.push_str("\n\n");
                    summary.push_str(strip_code_fence(&extra.text).as_str());
                }
                Err(ChainError::Cancelled) => return Err(SummarizeError::Cancelled),
                Err(e) => warn!("expansion request failed, keeping first answer: {}", e),
            }
        }

        Ok(GenerationResult {
            summary_text: summary,
            inferred_title: title,
            model_identifier: first.model,
            completed_at: self.clock.now(),
        })
    }

    fn count_use(&self) {
        // The tracker keeps the count in memory and rewrites it on its next update.
        if let Err(e) = self.quota.record_successful_use() {
            error!("failed to persist quota use, retrying on next update: {}", e);
        }
    }

    /// Register a new in-flight request, cancelling the previous one.
    fn begin_request(&self) -> (u64, CancellationToken) {
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let previous = self
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace((id, token.clone()));
        if let Some((old_id, old)) = previous {
            debug!(old_id, "cancelling previous request");
            old.cancel();
        }
        (id, token)
    }

    fn finish_request(&self, id: u64) {
        let mut slot = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|(current, _)| *current == id) {
            *slot = None;
        }
    }
}

fn display_title(request: &SummaryRequest, inferred: Option<&str>, language: Language) -> String {
    let non_empty = |s: Option<&str>| s.map(str::trim).filter(|s| !s.is_empty()).map(String::from);
    match request.source {
        SourceKind::Pdf => non_empty(inferred)
            .or_else(|| non_empty(request.file_name.as_deref()))
            .unwrap_or_else(|| match language {
                Language::Pt => "Documento PDF".to_string(),
                Language::En => "PDF document".to_string(),
            }),
        SourceKind::Web => non_empty(request.page_title.as_deref()).unwrap_or_else(|| match language {
            Language::Pt => "Página".to_string(),
            Language::En => "Page".to_string(),
        }),
    }
}

/// Chain over the real HTTP providers for the given settings.
pub fn build_http_chain(
    config: &Config,
    settings: &UserSettings,
    cooldown: &CooldownGovernor,
) -> Result<FallbackChain, SummarizeError> {
    let creds = config.resolve_credentials(settings)?;
    let provider = &config.provider;
    let timeout = Duration::from_secs(provider.timeout_secs);

    let models = provider.model_chain();
    if models.is_empty() {
        return Err(ConfigError::NoModels("openrouter".to_string()).into());
    }
    let primary = OpenRouterBackend::new(
        provider.openrouter_url.clone(),
        creds.openrouter.key,
        provider.temperature,
        timeout,
    )?;

    let alternate = match creds.gemini {
        Some(key) if !provider.alternate_model.trim().is_empty() => {
            let backend = GeminiBackend::new(provider.gemini_url.clone(), key.key, provider.temperature, timeout)?;
            Some(Route::new(Arc::new(backend), vec![provider.alternate_model.trim().to_string()]))
        }
        _ => None,
    };

    Ok(FallbackChain::new(
        Route::new(Arc::new(primary), models),
        alternate,
        cooldown.clone(),
        Duration::from_secs(provider.cooldown_secs),
    ))
}
