//! Global cooldown gate.
//!
//! One deadline shared by every provider and key. Once any provider answers
//! with a rate-limit or unavailable status, no request reaches the network
//! until the deadline passes. The deadline is persisted so a restart does not
//! lift it early.

use crate::clock::Clock;
use crate::storage::{Storage, StorageError, KEY_COOLDOWN_UNTIL};
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Clone, Debug)]
pub struct CooldownGovernor {
    storage: Storage,
    clock: Arc<dyn Clock>,
}

impl CooldownGovernor {
    pub fn new(storage: Storage, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    pub fn active_until(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        self.storage.get_json(KEY_COOLDOWN_UNTIL)
    }

    /// Seconds left in the current cooldown, rounded up; `None` when idle.
    pub fn is_cooling_down(&self) -> Result<Option<u64>, StorageError> {
        let Some(until) = self.active_until()? else {
            return Ok(None);
        };
        let remaining = until - self.clock.now();
        if remaining <= TimeDelta::zero() {
            return Ok(None);
        }
        let millis = remaining.num_milliseconds().max(1) as u64;
        Ok(Some(millis.div_ceil(1000)))
    }

    /// Start or extend the cooldown. An active window is never shortened.
    pub fn trigger(&self, duration: Duration) -> Result<DateTime<Utc>, StorageError> {
        let proposed = self.clock.now()
            + TimeDelta::from_std(duration).unwrap_or_else(|_| TimeDelta::seconds(20));
        let until = match self.active_until()? {
            Some(current) if current > proposed => current,
            _ => proposed,
        };
        self.storage.put_json(KEY_COOLDOWN_UNTIL, &until)?;
        info!(until = %until, "cooldown triggered");
        Ok(until)
    }
}
