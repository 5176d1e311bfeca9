//! Per-device daily quota and premium entitlement.
//!
//! The state is loaded on first use, written after every change, and mirrored
//! to a second, independent database. If the primary store comes up empty
//! (fresh install, wiped data directory) the mirror is used to restore it.
//!
//! Only [`QuotaTracker::record_successful_use`] increments the counter, so
//! failed generations never cost the user anything.

use crate::clock::Clock;
use crate::config::mask_secret;
use crate::license::{LicenseError, LicenseValidator};
use crate::storage::{Storage, StorageError, KEY_QUOTA_STATE};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum QuotaError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("invalid key")]
    InvalidKey { status: Option<String> },
    #[error("license check failed: {0}")]
    License(#[from] LicenseError),
}

/// Premium grant attached to this device.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entitlement {
    pub active_until: Option<DateTime<Utc>>,
    pub unlimited: bool,
    #[serde(default)]
    pub plan: Option<String>,
    /// Display form, e.g. `*************DDDD`
    #[serde(default)]
    pub masked_key: Option<String>,
    /// Kept for silent revalidation.
    #[serde(default)]
    pub key: Option<String>,
}

impl std::fmt::Debug for Entitlement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entitlement")
            .field("active_until", &self.active_until)
            .field("unlimited", &self.unlimited)
            .field("plan", &self.plan)
            .field("masked_key", &self.masked_key)
            .finish()
    }
}

impl Entitlement {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        if self.key.is_none() {
            return false;
        }
        self.unlimited || self.active_until.is_some_and(|until| now < until)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaState {
    pub device_id: String,
    pub daily_count: u32,
    pub daily_reset_date: NaiveDate,
    #[serde(default)]
    pub entitlement: Entitlement,
}

impl QuotaState {
    pub fn fresh(device_id: String, today: NaiveDate) -> Self {
        Self {
            device_id,
            daily_count: 0,
            daily_reset_date: today,
            entitlement: Entitlement::default(),
        }
    }

    /// Zero the counter when the stored day is not today. Returns whether
    /// anything changed.
    pub fn roll_over(&mut self, today: NaiveDate) -> bool {
        if self.daily_reset_date == today {
            return false;
        }
        self.daily_count = 0;
        self.daily_reset_date = today;
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    DailyLimitReached { limit: u32, resets_on: NaiveDate },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaDecision {
    Allowed,
    Denied(DenyReason),
}

/// Snapshot for status displays.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaStatus {
    /// `free`, `premium` or `premium_unlimited`
    pub plan: String,
    pub used: u32,
    pub limit: u32,
    pub active_until: Option<DateTime<Utc>>,
    pub masked_key: Option<String>,
    pub device_id: String,
}

/// Stable identifier for this machine and user account.
pub fn derive_device_id() -> String {
    let var = |name: &str| std::env::var(name).unwrap_or_default();
    let mut hasher = Sha256::new();
    for part in [
        var("HOSTNAME"),
        var("COMPUTERNAME"),
        var("USER"),
        var("USERNAME"),
        std::env::consts::OS.to_string(),
        std::env::consts::ARCH.to_string(),
        dirs::home_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = format!("{:x}", hasher.finalize());
    format!("dev-{}", &digest[..16])
}

pub struct QuotaTracker {
    primary: Storage,
    mirror: Option<Storage>,
    clock: Arc<dyn Clock>,
    validator: Arc<dyn LicenseValidator>,
    daily_limit: u32,
    device_id: String,
    state: Mutex<Option<QuotaState>>,
    /// Set when the in-memory state is ahead of the primary store.
    unsaved: AtomicBool,
}

impl QuotaTracker {
    pub fn new(
        primary: Storage,
        mirror: Option<Storage>,
        clock: Arc<dyn Clock>,
        validator: Arc<dyn LicenseValidator>,
        daily_limit: u32,
    ) -> Self {
        Self::with_device_id(primary, mirror, clock, validator, daily_limit, derive_device_id())
    }

    pub fn with_device_id(
        primary: Storage,
        mirror: Option<Storage>,
        clock: Arc<dyn Clock>,
        validator: Arc<dyn LicenseValidator>,
        daily_limit: u32,
        device_id: String,
    ) -> Self {
        Self {
            primary,
            mirror,
            clock,
            validator,
            daily_limit,
            device_id,
            state: Mutex::new(None),
            unsaved: AtomicBool::new(false),
        }
    }

    pub fn daily_limit(&self) -> u32 {
        self.daily_limit
    }

    /// Decide whether a request may proceed. Does not consume quota.
    pub fn check_and_reserve(&self) -> Result<QuotaDecision, QuotaError> {
        let now = self.clock.now();
        let today = self.clock.today();
        self.update(|state| {
            let changed = state.roll_over(today);
            if changed {
                debug!("daily quota reset");
            }
            let decision = if state.entitlement.is_active(now) || state.daily_count < self.daily_limit {
                QuotaDecision::Allowed
            } else {
                QuotaDecision::Denied(DenyReason::DailyLimitReached {
                    limit: self.daily_limit,
                    resets_on: today.succ_opt().unwrap_or(today),
                })
            };
            (decision, changed)
        })
    }

    /// Count one completed generation, cached or fresh.
    pub fn record_successful_use(&self) -> Result<u32, QuotaError> {
        let today = self.clock.today();
        self.update(|state| {
            state.roll_over(today);
            state.daily_count = state.daily_count.saturating_add(1);
            (state.daily_count, true)
        })
    }

    /// Validate a premium key remotely and, if accepted, attach it.
    ///
    /// Any rejection leaves the stored state untouched.
    pub async fn apply_entitlement_key(&self, token: &str) -> Result<Entitlement, QuotaError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(QuotaError::InvalidKey { status: None });
        }
        let answer = self.validator.validate(token).await?;
        if !answer.is_active() {
            info!(status = ?answer.status, "premium key rejected");
            return Err(QuotaError::InvalidKey {
                status: answer.status,
            });
        }

        let unlimited = answer.expires_at.is_none() || answer.plan == "premium_unlimited";
        let entitlement = Entitlement {
            active_until: answer.expires_at,
            unlimited,
            plan: Some(if answer.plan.is_empty() {
                "premium".to_string()
            } else {
                answer.plan.clone()
            }),
            masked_key: Some(mask_secret(token)),
            key: Some(token.to_string()),
        };
        let stored = entitlement.clone();
        self.update(move |state| {
            state.entitlement = stored;
            ((), true)
        })?;
        info!(plan = ?entitlement.plan, "premium key activated");
        Ok(entitlement)
    }

    /// Re-check the stored key with the backend and drop it if the backend
    /// no longer accepts it. Network failures keep the current grant.
    ///
    /// Returns whether an entitlement is active afterwards.
    pub async fn revalidate(&self) -> Result<bool, QuotaError> {
        let now = self.clock.now();
        let key = self.update(|state| (state.entitlement.key.clone(), false))?;
        let Some(key) = key else {
            return Ok(false);
        };

        match self.validator.validate(&key).await {
            Ok(answer) if answer.is_active() => {
                self.update(|state| {
                    if state.entitlement.key.as_deref() != Some(key.as_str()) {
                        return (state.entitlement.is_active(now), false);
                    }
                    let changed = state.entitlement.active_until != answer.expires_at
                        && answer.expires_at.is_some();
                    if changed {
                        state.entitlement.active_until = answer.expires_at;
                        state.entitlement.unlimited = false;
                    }
                    (state.entitlement.is_active(now), changed)
                })
            }
            Ok(answer) => self.update(|state| {
                // A different key may have been applied while the check ran.
                if state.entitlement.key.as_deref() != Some(key.as_str()) {
                    return (state.entitlement.is_active(now), false);
                }
                info!(status = ?answer.status, "premium key no longer valid, reverting to free plan");
                state.entitlement = Entitlement::default();
                (false, true)
            }),
            Err(e) => {
                warn!("premium key revalidation skipped: {}", e);
                self.update(|state| (state.entitlement.is_active(now), false))
            }
        }
    }

    pub fn status(&self) -> Result<QuotaStatus, QuotaError> {
        let now = self.clock.now();
        let today = self.clock.today();
        let limit = self.daily_limit;
        self.update(|state| {
            let changed = state.roll_over(today);
            let ent = &state.entitlement;
            let plan = if !ent.is_active(now) {
                "free".to_string()
            } else if ent.unlimited {
                "premium_unlimited".to_string()
            } else {
                "premium".to_string()
            };
            let status = QuotaStatus {
                plan,
                used: state.daily_count,
                limit,
                active_until: ent.active_until,
                masked_key: ent.masked_key.clone(),
                device_id: state.device_id.clone(),
            };
            (status, changed)
        })
    }

    /// Current state, loading it if needed.
    pub fn snapshot(&self) -> Result<QuotaState, QuotaError> {
        self.update(|state| (state.clone(), false))
    }

    /// Run `f` against the loaded state; persist when it reports a change or
    /// an earlier write failed.
    ///
    /// The lock is never held across an await point.
    fn update<R>(&self, f: impl FnOnce(&mut QuotaState) -> (R, bool)) -> Result<R, QuotaError> {
        let mut guard = self.lock();
        let loaded = match guard.take() {
            Some(state) => state,
            None => self.load()?,
        };
        let state = guard.insert(loaded);
        let (result, changed) = f(state);
        if changed || self.unsaved.load(Ordering::Acquire) {
            if let Err(e) = self.persist(state) {
                self.unsaved.store(true, Ordering::Release);
                return Err(e);
            }
            self.unsaved.store(false, Ordering::Release);
        }
        Ok(result)
    }

    fn lock(&self) -> MutexGuard<'_, Option<QuotaState>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn load(&self) -> Result<QuotaState, QuotaError> {
        if let Some(state) = self.primary.get_json::<QuotaState>(KEY_QUOTA_STATE)? {
            return Ok(state);
        }
        if let Some(mirror) = &self.mirror {
            match mirror.get_json::<QuotaState>(KEY_QUOTA_STATE) {
                Ok(Some(state)) => {
                    info!("restored quota state from mirror");
                    self.primary.put_json(KEY_QUOTA_STATE, &state)?;
                    return Ok(state);
                }
                Ok(None) => {}
                Err(e) => warn!("quota mirror unreadable: {}", e),
            }
        }
        let state = QuotaState::fresh(self.device_id.clone(), self.clock.today());
        self.persist(&state)?;
        Ok(state)
    }

    fn persist(&self, state: &QuotaState) -> Result<(), QuotaError> {
        self.primary.put_json(KEY_QUOTA_STATE, state)?;
        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.put_json(KEY_QUOTA_STATE, state) {
                warn!("failed to mirror quota state: {}", e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::license::{ClaimedKey, KeyValidation};
    use async_trait::async_trait;
    use chrono::TimeDelta;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Validator that always returns the same answer.
    struct Fixed(Result<KeyValidation, String>);

    #[async_trait]
    impl LicenseValidator for Fixed {
        async fn validate(&self, _key: &str) -> Result<KeyValidation, LicenseError> {
            self.0.clone().map_err(LicenseError::Unreachable)
        }

        async fn claim(&self, _email: &str) -> Result<ClaimedKey, LicenseError> {
            Err(LicenseError::NoSubscription)
        }
    }

    /// Accepts every key on first sight; later checks of `slow_key` wait and
    /// then report it revoked.
    struct RevokesLater {
        slow_key: &'static str,
        seen: AtomicUsize,
    }

    #[async_trait]
    impl LicenseValidator for RevokesLater {
        async fn validate(&self, key: &str) -> Result<KeyValidation, LicenseError> {
            if key == self.slow_key && self.seen.fetch_add(1, Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
                return Ok(answer(false, "revoked", None));
            }
            Ok(KeyValidation {
                valid: true,
                plan: "premium_unlimited".into(),
                status: Some("active".into()),
                expires_at: None,
            })
        }

        async fn claim(&self, _email: &str) -> Result<ClaimedKey, LicenseError> {
            Err(LicenseError::NoSubscription)
        }
    }

    fn answer(valid: bool, status: &str, expires_at: Option<DateTime<Utc>>) -> KeyValidation {
        KeyValidation {
            valid,
            plan: if valid { "premium".into() } else { "free".into() },
            status: Some(status.into()),
            expires_at,
        }
    }

    fn tracker(
        validator: Fixed,
        limit: u32,
    ) -> (QuotaTracker, Storage, Storage, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let primary = Storage::temporary().unwrap();
        let mirror = Storage::temporary().unwrap();
        let tracker = QuotaTracker::with_device_id(
            primary.clone(),
            Some(mirror.clone()),
            clock.clone(),
            Arc::new(validator),
            limit,
            "dev-test".into(),
        );
        (tracker, primary, mirror, clock)
    }

    #[test]
    fn fresh_state_allows_and_check_does_not_consume() {
        let (tracker, _, _, _) = tracker(Fixed(Err("down".into())), 2);
        for _ in 0..5 {
            assert_eq!(tracker.check_and_reserve().unwrap(), QuotaDecision::Allowed);
        }
        assert_eq!(tracker.snapshot().unwrap().daily_count, 0);
    }

    #[test]
    fn limit_reached_denies_with_configured_limit() {
        let (tracker, _, _, clock) = tracker(Fixed(Err("down".into())), 3);
        tracker.record_successful_use().unwrap();
        tracker.record_successful_use().unwrap();
        assert_eq!(tracker.check_and_reserve().unwrap(), QuotaDecision::Allowed);
        assert_eq!(tracker.record_successful_use().unwrap(), 3);

        let tomorrow = clock.today().succ_opt().unwrap();
        assert_eq!(
            tracker.check_and_reserve().unwrap(),
            QuotaDecision::Denied(DenyReason::DailyLimitReached {
                limit: 3,
                resets_on: tomorrow
            })
        );
    }

    #[test]
    fn stale_day_resets_once() {
        let (tracker, primary, _, clock) = tracker(Fixed(Err("down".into())), 4);
        let yesterday = clock.today().pred_opt().unwrap();
        let stored = QuotaState {
            device_id: "dev-test".into(),
            daily_count: 4,
            daily_reset_date: yesterday,
            entitlement: Entitlement::default(),
        };
        primary.put_json(KEY_QUOTA_STATE, &stored).unwrap();

        assert_eq!(tracker.check_and_reserve().unwrap(), QuotaDecision::Allowed);
        let state = tracker.snapshot().unwrap();
        assert_eq!(state.daily_count, 0);
        assert_eq!(state.daily_reset_date, clock.today());

        tracker.record_successful_use().unwrap();
        tracker.check_and_reserve().unwrap();
        assert_eq!(tracker.snapshot().unwrap().daily_count, 1);
    }

    #[test]
    fn mirror_restores_wiped_primary() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mirror = Storage::temporary().unwrap();
        {
            let first = QuotaTracker::with_device_id(
                Storage::temporary().unwrap(),
                Some(mirror.clone()),
                clock.clone(),
                Arc::new(Fixed(Err("down".into()))),
                5,
                "dev-test".into(),
            );
            first.record_successful_use().unwrap();
            first.record_successful_use().unwrap();
        }

        let fresh_primary = Storage::temporary().unwrap();
        let second = QuotaTracker::with_device_id(
            fresh_primary.clone(),
            Some(mirror),
            clock,
            Arc::new(Fixed(Err("down".into()))),
            5,
            "dev-test".into(),
        );
        assert_eq!(second.snapshot().unwrap().daily_count, 2);
        let restored: Option<QuotaState> = fresh_primary.get_json(KEY_QUOTA_STATE).unwrap();
        assert_eq!(restored.unwrap().daily_count, 2);
    }

    #[tokio::test]
    async fn valid_key_unlocks_over_limit() {
        let until = Utc::now() + TimeDelta::days(30);
        let (tracker, _, mirror, _) = tracker(Fixed(Ok(answer(true, "active", Some(until)))), 1);
        tracker.record_successful_use().unwrap();
        assert!(matches!(tracker.check_and_reserve().unwrap(), QuotaDecision::Denied(_)));

        let ent = tracker.apply_entitlement_key("AAAA-BBBB-CCCC-DDDD").await.unwrap();
        assert_eq!(ent.masked_key.as_deref(), Some("***************DDDD"));
        assert_eq!(tracker.check_and_reserve().unwrap(), QuotaDecision::Allowed);

        let mirrored: QuotaState = mirror.get_json(KEY_QUOTA_STATE).unwrap().unwrap();
        assert_eq!(mirrored.entitlement.active_until, Some(until));
        assert_eq!(tracker.status().unwrap().plan, "premium");
    }

    #[tokio::test]
    async fn expired_key_leaves_state_inactive() {
        let (tracker, _, _, _) = tracker(Fixed(Ok(answer(false, "expired", None))), 1);
        let err = tracker.apply_entitlement_key("OLD-KEY").await.unwrap_err();
        assert!(matches!(err, QuotaError::InvalidKey { status: Some(ref s) } if s == "expired"));

        assert_eq!(tracker.snapshot().unwrap().entitlement, Entitlement::default());
        tracker.record_successful_use().unwrap();
        assert!(matches!(tracker.check_and_reserve().unwrap(), QuotaDecision::Denied(_)));
    }

    #[tokio::test]
    async fn entitlement_expires_with_time() {
        let (tracker, _, _, clock) = tracker(
            Fixed(Ok(answer(true, "active", Some(Utc::now() + TimeDelta::hours(1))))),
            0,
        );
        tracker.apply_entitlement_key("KEY-1234").await.unwrap();
        assert_eq!(tracker.check_and_reserve().unwrap(), QuotaDecision::Allowed);
        clock.advance(TimeDelta::hours(2));
        assert!(matches!(tracker.check_and_reserve().unwrap(), QuotaDecision::Denied(_)));
    }

    #[tokio::test]
    async fn revalidation_revokes_rejected_key() {
        let (tracker, primary, _, clock) = tracker(Fixed(Ok(answer(false, "revoked", None))), 1);
        let mut state = QuotaState::fresh("dev-test".into(), clock.today());
        state.entitlement = Entitlement {
            active_until: None,
            unlimited: true,
            plan: Some("premium_unlimited".into()),
            masked_key: Some("****1234".into()),
            key: Some("ABCD1234".into()),
        };
        primary.put_json(KEY_QUOTA_STATE, &state).unwrap();

        assert!(!tracker.revalidate().await.unwrap());
        assert_eq!(tracker.status().unwrap().plan, "free");
    }

    #[tokio::test]
    async fn revalidation_keeps_grant_when_backend_unreachable() {
        let (tracker, primary, _, clock) = tracker(Fixed(Err("timeout".into())), 1);
        let mut state = QuotaState::fresh("dev-test".into(), clock.today());
        state.entitlement.unlimited = true;
        state.entitlement.key = Some("ABCD1234".into());
        primary.put_json(KEY_QUOTA_STATE, &state).unwrap();

        assert!(tracker.revalidate().await.unwrap());
        assert_eq!(tracker.status().unwrap().plan, "premium_unlimited");
    }

    #[tokio::test]
    async fn late_revocation_does_not_drop_newer_key() {
        let tracker = QuotaTracker::with_device_id(
            Storage::temporary().unwrap(),
            None,
            Arc::new(ManualClock::new(Utc::now())),
            Arc::new(RevokesLater {
                slow_key: "OLD-KEY-1111",
                seen: AtomicUsize::new(0),
            }),
            1,
            "dev-test".into(),
        );
        tracker.apply_entitlement_key("OLD-KEY-1111").await.unwrap();

        let (still_active, applied) = tokio::join!(
            tracker.revalidate(),
            tracker.apply_entitlement_key("NEW-KEY-2222")
        );
        applied.unwrap();
        assert!(still_active.unwrap());

        let status = tracker.status().unwrap();
        assert_eq!(status.plan, "premium_unlimited");
        assert_eq!(status.masked_key.as_deref(), Some("********2222"));
    }

    #[test]
    fn failed_write_is_retried_on_next_update() {
        let (tracker, primary, _, _) = tracker(Fixed(Err("down".into())), 5);
        tracker.record_successful_use().unwrap();
        primary.remove(KEY_QUOTA_STATE).unwrap();
        tracker.unsaved.store(true, Ordering::Release);

        tracker.snapshot().unwrap();
        let stored: QuotaState = primary.get_json(KEY_QUOTA_STATE).unwrap().unwrap();
        assert_eq!(stored.daily_count, 1);
        assert!(!tracker.unsaved.load(Ordering::Acquire));
    }
}
