//! Outstanding AuthnRequests and LogoutRequests, keyed by request ID.
//!
//! Each entry is consumed at most once: `take` removes it atomically, so of
//! two responses carrying the same `InResponseTo` exactly one proceeds.
//! Expired entries are indistinguishable from unknown ones. They are swept
//! when the store reaches capacity or by [`PendingRequestStore::sweep`];
//! a store still full of live entries evicts its oldest ones, so abandoned
//! logins can delay but never refuse a new one.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::saml::error::SamlError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    Authn,
    Logout,
}

#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub kind: PendingKind,
    pub tenant: String,
    pub relay_state: Option<String>,
    /// The AuthnRequest asked for `IsPassive`.
    pub is_passive: bool,
    /// Session being logged out, for Logout entries.
    pub session_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl PendingRequest {
    pub fn authn(tenant: impl Into<String>, relay_state: Option<String>, is_passive: bool) -> Self {
        Self {
            kind: PendingKind::Authn,
            tenant: tenant.into(),
            relay_state,
            is_passive,
            session_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn logout(
        tenant: impl Into<String>,
        relay_state: Option<String>,
        session_id: Option<Uuid>,
    ) -> Self {
        Self {
            kind: PendingKind::Logout,
            tenant: tenant.into(),
            relay_state,
            is_passive: false,
            session_id,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug)]
pub struct PendingRequestStore {
    entries: DashMap<String, PendingRequest>,
    ttl: Duration,
    capacity: usize,
}

impl PendingRequestStore {
    pub const DEFAULT_TTL_SECS: i64 = 300;
    pub const DEFAULT_CAPACITY: usize = 10_000;
    /// Share of the capacity freed at once when live entries are evicted.
    const EVICTION_DIVISOR: usize = 16;

    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            capacity,
        }
    }

    fn is_live(&self, entry: &PendingRequest, now: DateTime<Utc>) -> bool {
        entry.created_at + self.ttl > now
    }

    /// Record a request, making room first when the store is full.
    pub fn insert(&self, request_id: String, request: PendingRequest) {
        if self.entries.len() >= self.capacity {
            self.sweep();
            if self.entries.len() >= self.capacity {
                self.evict_oldest();
            }
        }
        self.entries.insert(request_id, request);
    }

    /// Drop expired entries and return how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| self.is_live(entry, now));
        before.saturating_sub(self.entries.len())
    }

    /// Remove the oldest live entries, leaving room for a batch of inserts.
    fn evict_oldest(&self) {
        let batch = (self.capacity / Self::EVICTION_DIVISOR).max(1);
        let mut by_age: Vec<(DateTime<Utc>, String)> = self
            .entries
            .iter()
            .map(|entry| (entry.value().created_at, entry.key().clone()))
            .collect();
        let count = (by_age.len() + batch)
            .saturating_sub(self.capacity)
            .min(by_age.len());
        if count == 0 {
            return;
        }
        by_age.select_nth_unstable(count - 1);
        for (_, request_id) in &by_age[..count] {
            self.entries.remove(request_id);
        }
        tracing::warn!(
            capacity = self.capacity,
            evicted = count,
            "Pending request store is full, evicted the oldest requests"
        );
    }

    /// Remove and return the entry if it is live and of `kind` for `tenant`.
    ///
    /// The entry is removed even when it does not match, so a request ID is
    /// never usable twice.
    pub fn take(
        &self,
        request_id: &str,
        kind: PendingKind,
        tenant: &str,
    ) -> Result<PendingRequest, SamlError> {
        let unknown = || SamlError::ReplayOrUnknownRequest(request_id.to_string());
        let (_, entry) = self.entries.remove(request_id).ok_or_else(unknown)?;
        if !self.is_live(&entry, Utc::now()) {
            tracing::debug!(request_id = %request_id, "Pending request expired");
            return Err(unknown());
        }
        if entry.kind != kind || entry.tenant != tenant {
            tracing::debug!(
                request_id = %request_id,
                expected_tenant = %entry.tenant,
                tenant = %tenant,
                "Pending request does not match response"
            );
            return Err(unknown());
        }
        Ok(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PendingRequestStore {
    fn default() -> Self {
        Self::new(
            Duration::seconds(Self::DEFAULT_TTL_SECS),
            Self::DEFAULT_CAPACITY,
        )
    }
}
