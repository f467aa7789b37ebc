use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, warn};

use crate::store::SessionStore;

use super::token;

/// Cached profile snapshot for display. Not authoritative.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl UserProfile {
    /// Name to show for the user, falling back to email then id
    pub fn display_name(&self) -> String {
        if let Some(ref name) = self.name {
            return name.clone();
        }
        if let Some(ref email) = self.email {
            return email.clone();
        }
        match self.id {
            Some(JsonValue::String(ref s)) => s.clone(),
            Some(ref other) => other.to_string(),
            None => "unknown".to_string(),
        }
    }
}

/// The persisted session. Unknown fields are carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub user: Option<UserProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refresh: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl SessionRecord {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: Some(access_token.into()),
            refresh_token: Some(refresh_token.into()),
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user: UserProfile) -> Self {
        self.user = Some(user);
        self
    }

    /// Access token if present and non-empty
    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref().filter(|t| !t.is_empty())
    }

    /// Refresh token if present and non-empty
    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref().filter(|t| !t.is_empty())
    }

    pub fn access_expired(&self) -> bool {
        self.access_token().map(token::is_expired).unwrap_or(true)
    }

    /// Refresh token that is worth sending to the backend: present and not
    /// carrying an expiry that has already passed.
    pub fn usable_refresh_token(&self) -> Option<&str> {
        self.refresh_token()
            .filter(|t| !token::is_detectably_expired(t))
    }

    pub fn access_expires_at(&self) -> Option<DateTime<Utc>> {
        self.access_token().and_then(token::expires_at)
    }

    pub fn refresh_expires_at(&self) -> Option<DateTime<Utc>> {
        self.refresh_token().and_then(token::expires_at)
    }
}

/// Reads and writes the session record through a backend, folding every
/// failure into "no session".
pub struct SessionStorage {
    backend: Box<dyn SessionStore>,
}

impl SessionStorage {
    pub fn new(backend: impl SessionStore + 'static) -> Self {
        Self {
            backend: Box::new(backend),
        }
    }

    /// Load the stored record. Missing, unreadable or malformed data is `None`.
    pub fn load(&self) -> Option<SessionRecord> {
        let contents = match self.backend.read() {
            Ok(Some(contents)) => contents,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Failed to read session");
                return None;
            }
        };

        match serde_json::from_str::<SessionRecord>(&contents) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(error = %e, "Stored session is malformed, treating as absent");
                None
            }
        }
    }

    /// Persist the record, replacing any existing one. Returns false on failure.
    pub fn store(&self, record: &SessionRecord) -> bool {
        let contents = match serde_json::to_string_pretty(record) {
            Ok(contents) => contents,
            Err(e) => {
                warn!(error = %e, "Failed to serialize session");
                return false;
            }
        };
        match self.backend.write(&contents) {
            Ok(()) => {
                debug!("Session stored");
                true
            }
            Err(e) => {
                warn!(error = %e, "Failed to store session");
                false
            }
        }
    }

    pub fn clear(&self) {
        if let Err(e) = self.backend.remove() {
            warn!(error = %e, "Failed to clear session");
        } else {
            debug!("Session cleared");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StorageError};
    use serde_json::json;

    struct BrokenStore;

    impl SessionStore for BrokenStore {
        fn read(&self) -> Result<Option<String>, StorageError> {
            Err(StorageError::Unavailable("disk on fire".into()))
        }
        fn write(&self, _value: &str) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("disk on fire".into()))
        }
        fn remove(&self) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("disk on fire".into()))
        }
    }

    #[test]
    fn test_unknown_fields_pass_through() {
        let raw = json!({
            "access_token": "a.b.c",
            "refresh_token": "r",
            "user": { "id": 7, "name": "Ada", "roles": ["admin"], "team": "ops" },
            "account_id": "acc-1",
            "theme": "dark"
        });
        let store = MemoryStore::with_value(raw.to_string());
        let storage = SessionStorage::new(store.clone());

        let record = storage.load().expect("record should load");
        assert_eq!(record.extra.get("theme"), Some(&json!("dark")));
        let user = record.user.as_ref().unwrap();
        assert_eq!(user.extra.get("team"), Some(&json!("ops")));
        assert_eq!(user.roles, vec!["admin".to_string()]);

        assert!(storage.store(&record));
        let reread: JsonValue = serde_json::from_str(&store.read().unwrap().unwrap()).unwrap();
        assert_eq!(reread["theme"], json!("dark"));
        assert_eq!(reread["user"]["team"], json!("ops"));
        assert_eq!(reread["account_id"], json!("acc-1"));
    }

    #[test]
    fn test_malformed_or_empty_storage_is_absent() {
        assert!(SessionStorage::new(MemoryStore::new()).load().is_none());
        assert!(SessionStorage::new(MemoryStore::with_value("{not json")).load().is_none());
        assert!(SessionStorage::new(MemoryStore::with_value("[1,2]")).load().is_none());
    }

    #[test]
    fn test_backend_failure_folds_into_absent() {
        let storage = SessionStorage::new(BrokenStore);
        assert!(storage.load().is_none());
        assert!(!storage.store(&SessionRecord::new("a", "r")));
        storage.clear();
    }

    #[test]
    fn test_clear_is_idempotent() {
        let storage = SessionStorage::new(MemoryStore::new());
        storage.store(&SessionRecord::new("a", "r"));
        storage.clear();
        storage.clear();
        assert!(storage.load().is_none());
    }

    #[test]
    fn test_usable_refresh_token() {
        let expired = SessionRecord::new("a", token::token_expiring_in(-5));
        assert!(expired.usable_refresh_token().is_none());

        let opaque = SessionRecord::new("a", "opaque");
        assert_eq!(opaque.usable_refresh_token(), Some("opaque"));

        let empty = SessionRecord::new("a", "");
        assert!(empty.usable_refresh_token().is_none());
    }

    #[test]
    fn test_display_name_fallbacks() {
        let mut user = UserProfile { id: Some(json!(12)), ..Default::default() };
        assert_eq!(user.display_name(), "12");
        user.email = Some("ada@example.com".into());
        assert_eq!(user.display_name(), "ada@example.com");
        user.name = Some("Ada".into());
        assert_eq!(user.display_name(), "Ada");
    }
}
