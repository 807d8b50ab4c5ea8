//! Session storage for authenticated SAML principals.
//!
//! The host application owns session infrastructure; the adapter only needs
//! create, lookup and the NameID/SessionIndex match used by IdP-initiated
//! logout. `MemorySessionStore` is the single-node implementation.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Result type for session store operations.
pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Storage error: {0}")]
    Storage(String),
}

/// An authenticated SAML session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,

    /// Tenant the session was authenticated through
    pub tenant: String,

    /// Principal name, per the tenant's principal name policy
    pub principal: String,

    /// NameID value and format as issued by the IdP
    #[serde(default)]
    pub name_id: Option<String>,
    #[serde(default)]
    pub name_id_format: Option<String>,

    /// SAML SessionIndex for Single Logout
    #[serde(default)]
    pub session_index: Option<String>,

    /// Attribute values by Name, in document order
    #[serde(default)]
    pub attributes: BTreeMap<String, Vec<String>>,

    /// Attribute values by FriendlyName
    #[serde(default)]
    pub friendly_attributes: BTreeMap<String, Vec<String>>,

    #[serde(default)]
    pub roles: BTreeSet<String>,

    /// Assertion issuer (the IdP entity id)
    pub issuer: String,

    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Remaining lifetime, zero once expired.
    pub fn ttl(&self) -> Duration {
        (self.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// True when the session holds at least one of `required`, or when
    /// `required` is empty.
    pub fn has_any_role(&self, required: &[String]) -> bool {
        required.is_empty() || required.iter().any(|r| self.roles.contains(r))
    }

    /// First value of an attribute, looked up by Name then FriendlyName.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(name)
            .or_else(|| self.friendly_attributes.get(name))
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Whether an IdP LogoutRequest for `name_id` (and `session_indexes`,
    /// when non-empty) addresses this session.
    pub fn matches_logout(&self, tenant: &str, name_id: &str, session_indexes: &[String]) -> bool {
        self.tenant == tenant
            && self.name_id.as_deref() == Some(name_id)
            && (session_indexes.is_empty()
                || self
                    .session_index
                    .as_ref()
                    .is_some_and(|idx| session_indexes.contains(idx)))
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, session: Session) -> SessionResult<Uuid>;

    /// Expired sessions are reported as absent.
    async fn get_session(&self, id: Uuid) -> SessionResult<Option<Session>>;

    async fn delete_session(&self, id: Uuid) -> SessionResult<()>;

    /// Delete every session of `tenant` for `name_id`, restricted to
    /// `session_indexes` when non-empty. Returns the number removed.
    async fn delete_matching(
        &self,
        tenant: &str,
        name_id: &str,
        session_indexes: &[String],
    ) -> SessionResult<usize>;

    /// Drop expired sessions.
    async fn cleanup(&self) -> SessionResult<()>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Memory Session Store
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory session store (single-node only).
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<Uuid, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_session(&self, session: Session) -> SessionResult<Uuid> {
        let id = session.id;
        let mut sessions = self.sessions.write().await;
        sessions.insert(id, session);
        Ok(id)
    }

    async fn get_session(&self, id: Uuid) -> SessionResult<Option<Session>> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(&id).filter(|s| !s.is_expired()).cloned())
    }

    async fn delete_session(&self, id: Uuid) -> SessionResult<()> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(&id);
        Ok(())
    }

    async fn delete_matching(
        &self,
        tenant: &str,
        name_id: &str,
        session_indexes: &[String],
    ) -> SessionResult<usize> {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| !s.matches_logout(tenant, name_id, session_indexes));
        Ok(before - sessions.len())
    }

    async fn cleanup(&self) -> SessionResult<()> {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        sessions.retain(|_, s| s.expires_at > now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(tenant: &str, name_id: &str, index: Option<&str>) -> Session {
        let now = Utc::now();
        Session {
            id: Uuid::new_v4(),
            tenant: tenant.to_string(),
            principal: name_id.to_string(),
            name_id: Some(name_id.to_string()),
            name_id_format: None,
            session_index: index.map(str::to_string),
            attributes: BTreeMap::new(),
            friendly_attributes: BTreeMap::new(),
            roles: BTreeSet::from(["user".to_string()]),
            issuer: "https://idp".to_string(),
            created_at: now,
            expires_at: now + chrono::Duration::hours(1),
        }
    }

    #[tokio::test]
    async fn test_memory_session_store() {
        let store = MemorySessionStore::new();
        let session = session("demo", "bburke", Some("idx-1"));

        let id = store.create_session(session.clone()).await.unwrap();
        assert_eq!(id, session.id);

        let retrieved = store.get_session(id).await.unwrap().unwrap();
        assert_eq!(retrieved.principal, "bburke");

        store.delete_session(id).await.unwrap();
        assert!(store.get_session(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_session_is_absent_and_cleaned_up() {
        let store = MemorySessionStore::new();
        let mut expired = session("demo", "bburke", None);
        expired.expires_at = Utc::now() - chrono::Duration::seconds(1);
        let id = store.create_session(expired).await.unwrap();

        assert!(store.get_session(id).await.unwrap().is_none());
        assert_eq!(store.len().await, 1);
        store.cleanup().await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_delete_matching_honours_session_index() {
        let store = MemorySessionStore::new();
        store.create_session(session("demo", "bburke", Some("idx-1"))).await.unwrap();
        store.create_session(session("demo", "bburke", Some("idx-2"))).await.unwrap();
        store.create_session(session("other", "bburke", Some("idx-1"))).await.unwrap();

        let removed = store
            .delete_matching("demo", "bburke", &["idx-1".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);

        // No SessionIndex: every session of the NameID in the tenant
        let removed = store.delete_matching("demo", "bburke", &[]).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len().await, 1);
    }

    #[test]
    fn test_role_checks() {
        let session = session("demo", "u", None);
        assert!(session.has_role("user"));
        assert!(session.has_any_role(&[]));
        assert!(session.has_any_role(&["admin".to_string(), "user".to_string()]));
        assert!(!session.has_any_role(&["admin".to_string()]));
    }

    #[test]
    fn test_attribute_lookup_by_friendly_name() {
        let mut session = session("demo", "u", None);
        session
            .attributes
            .insert("urn:oid:0.9.2342.19200300.100.1.3".into(), vec!["a@b.c".into()]);
        session
            .friendly_attributes
            .insert("mail".into(), vec!["a@b.c".into()]);
        assert_eq!(session.attribute("mail"), Some("a@b.c"));
        assert_eq!(session.attribute("urn:oid:0.9.2342.19200300.100.1.3"), Some("a@b.c"));
        assert_eq!(session.attribute("missing"), None);
    }
}
