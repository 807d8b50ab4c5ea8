//! IDs of assertions already turned into sessions, per tenant.
//!
//! A bearer assertion is usable once. An ID is remembered until the
//! assertion itself stops being acceptable, so a recorded entry outlives
//! every response that could still carry it. Unsolicited responses have no
//! pending request to consume, so this cache is their only replay guard.

use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Duration, Utc};
use dashmap::{DashMap, mapref::entry::Entry};

use crate::saml::error::SamlError;

#[derive(Debug)]
pub struct ReplayCache {
    seen: DashMap<(String, String), DateTime<Utc>>,
    /// Retention for assertions that carry no NotOnOrAfter.
    default_window: Duration,
    /// Size at which `record` sweeps before inserting.
    next_sweep_at: AtomicUsize,
}

impl ReplayCache {
    pub const DEFAULT_WINDOW_SECS: i64 = 60 * 60;
    const SWEEP_THRESHOLD: usize = 4_096;

    pub fn new(default_window: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            default_window,
            next_sweep_at: AtomicUsize::new(Self::SWEEP_THRESHOLD),
        }
    }

    /// Mark `assertion_id` of `tenant` as used until `usable_until`.
    ///
    /// Fails with `REPLAY_OR_UNKNOWN_REQUEST` when the ID is already
    /// recorded and not yet expired.
    pub fn record(
        &self,
        tenant: &str,
        assertion_id: &str,
        usable_until: Option<DateTime<Utc>>,
    ) -> Result<(), SamlError> {
        let now = Utc::now();
        if self.seen.len() >= self.next_sweep_at.load(Ordering::Relaxed) {
            self.sweep();
            let next = (self.seen.len() * 2).max(Self::SWEEP_THRESHOLD);
            self.next_sweep_at.store(next, Ordering::Relaxed);
        }

        let expires_at = usable_until.unwrap_or(now + self.default_window);
        match self
            .seen
            .entry((tenant.to_string(), assertion_id.to_string()))
        {
            Entry::Occupied(mut entry) => {
                if *entry.get() > now {
                    tracing::debug!(
                        tenant = %tenant,
                        assertion_id = %assertion_id,
                        "Assertion was already consumed"
                    );
                    return Err(SamlError::ReplayOrUnknownRequest(format!(
                        "assertion '{}' was already used",
                        assertion_id
                    )));
                }
                entry.insert(expires_at);
            }
            Entry::Vacant(entry) => {
                entry.insert(expires_at);
            }
        }
        Ok(())
    }

    /// Forget expired IDs and return how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let before = self.seen.len();
        self.seen.retain(|_, expires_at| *expires_at > now);
        before.saturating_sub(self.seen.len())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new(Duration::seconds(Self::DEFAULT_WINDOW_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_use_is_a_replay() {
        let cache = ReplayCache::default();
        let until = Some(Utc::now() + Duration::minutes(5));
        cache.record("demo", "_a1", until).unwrap();
        assert!(matches!(
            cache.record("demo", "_a1", until),
            Err(SamlError::ReplayOrUnknownRequest(_))
        ));
        // IDs are scoped to their tenant
        cache.record("sales", "_a1", until).unwrap();
    }

    #[test]
    fn test_expired_entries_are_swept() {
        let cache = ReplayCache::default();
        cache
            .record("demo", "_old", Some(Utc::now() - Duration::seconds(1)))
            .unwrap();
        cache
            .record("demo", "_live", Some(Utc::now() + Duration::minutes(5)))
            .unwrap();
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 1);

        // An expired record no longer blocks the ID
        cache
            .record("demo", "_gone", Some(Utc::now() - Duration::seconds(1)))
            .unwrap();
        cache.record("demo", "_gone", None).unwrap();
    }
}
