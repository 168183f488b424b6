use std::collections::{BTreeMap, HashMap};

use amiibo_core::{CollectionStateRow, UserContext, UserPreferences};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("spreadsheet not found: {0}")]
    NotFound(String),
    #[error("permission denied for spreadsheet {0}")]
    PermissionDenied(String),
    #[error("invalid or expired credentials")]
    InvalidCredentials,
    #[error("no credential attached to the session")]
    MissingCredential,
    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: Option<u64> },
    #[error("api quota exceeded")]
    QuotaExceeded,
    #[error("sheets service unavailable (status {0})")]
    Unavailable(u16),
    #[error("worksheet {0} does not exist")]
    MissingWorksheet(String),
    #[error("network error talking to sheets: {0}")]
    Network(#[from] reqwest::Error),
    #[error("malformed sheets payload: {0}")]
    Malformed(String),
    #[error("unexpected sheets status {status}: {body}")]
    Http { status: u16, body: String },
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Unavailable(_) => true,
            Self::Network(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            Self::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Message safe to show to the signed-in user.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::NotFound(_) | Self::MissingWorksheet(_) => {
                "Your spreadsheet could not be found. Please log out and log in again to create a new one."
            }
            Self::PermissionDenied(_) => {
                "Permission denied. Please log out and log in again to refresh your access."
            }
            Self::InvalidCredentials | Self::MissingCredential => {
                "Your login session has expired. Please log out and log in again."
            }
            Self::RateLimited { .. } => {
                "Rate limit reached. Please wait a few seconds before trying again."
            }
            Self::QuotaExceeded => "Daily quota for Google Sheets has been exceeded. Please try again later.",
            Self::Unavailable(_) | Self::Http { .. } | Self::Malformed(_) => {
                "Google Sheets is temporarily unavailable. Please try again in a few moments."
            }
            Self::Network(_) => "Unable to reach Google Sheets. Please check your connection and try again.",
        }
    }
}

/// Remote-authoritative per-user table of amiibo id -> collected flag.
///
/// Every call is a round trip; nothing is cached between requests. Concurrent
/// writers for the same user are not serialized: the last write wins.
#[async_trait]
pub trait CollectionStore: Send + Sync {
    async fn read_all(&self, user: &UserContext) -> Result<BTreeMap<String, bool>, StoreError>;

    /// Update the row matching `amiibo_id` in place, or append one if absent.
    async fn write(
        &self,
        user: &UserContext,
        amiibo_id: &str,
        amiibo_name: &str,
        collected: bool,
    ) -> Result<(), StoreError>;

    async fn read_preferences(&self, user: &UserContext) -> Result<UserPreferences, StoreError>;

    async fn write_preferences(
        &self,
        user: &UserContext,
        preferences: UserPreferences,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Default, Clone)]
struct UserSheet {
    rows: Vec<CollectionStateRow>,
    preferences: UserPreferences,
}

/// Process-local collection store keyed by `UserContext::user_id`.
#[derive(Debug, Default)]
pub struct MemoryCollectionStore {
    sheets: Mutex<HashMap<String, UserSheet>>,
}

impl MemoryCollectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn rows(&self, user: &UserContext) -> Vec<CollectionStateRow> {
        self.sheets
            .lock()
            .await
            .get(&user.user_id)
            .map(|s| s.rows.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CollectionStore for MemoryCollectionStore {
    async fn read_all(&self, user: &UserContext) -> Result<BTreeMap<String, bool>, StoreError> {
        let sheets = self.sheets.lock().await;
        let mut out = BTreeMap::new();
        if let Some(sheet) = sheets.get(&user.user_id) {
            for row in &sheet.rows {
                out.entry(row.amiibo_id.clone()).or_insert(row.collected);
            }
        }
        Ok(out)
    }

    async fn write(
        &self,
        user: &UserContext,
        amiibo_id: &str,
        amiibo_name: &str,
        collected: bool,
    ) -> Result<(), StoreError> {
        let mut sheets = self.sheets.lock().await;
        let sheet = sheets.entry(user.user_id.clone()).or_default();
        match sheet.rows.iter_mut().find(|r| r.amiibo_id == amiibo_id) {
            Some(row) => row.collected = collected,
            None => sheet.rows.push(CollectionStateRow {
                amiibo_id: amiibo_id.to_string(),
                amiibo_name: amiibo_name.to_string(),
                collected,
            }),
        }
        Ok(())
    }

    async fn read_preferences(&self, user: &UserContext) -> Result<UserPreferences, StoreError> {
        Ok(self
            .sheets
            .lock()
            .await
            .get(&user.user_id)
            .map(|s| s.preferences)
            .unwrap_or_default())
    }

    async fn write_preferences(
        &self,
        user: &UserContext,
        preferences: UserPreferences,
    ) -> Result<(), StoreError> {
        self.sheets
            .lock()
            .await
            .entry(user.user_id.clone())
            .or_default()
            .preferences = preferences;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repeated_writes_update_in_place() {
        let store = MemoryCollectionStore::new();
        let user = UserContext::new("sheet-1");

        store.write(&user, "A1", "Mario", true).await.unwrap();
        store.write(&user, "A1", "Mario", false).await.unwrap();
        store.write(&user, "A1", "Mario", true).await.unwrap();

        let rows = store.rows(&user).await;
        assert_eq!(rows.len(), 1);
        assert!(rows[0].collected);
        assert_eq!(store.read_all(&user).await.unwrap().get("A1"), Some(&true));
    }

    #[tokio::test]
    async fn users_do_not_share_rows_or_preferences() {
        let store = MemoryCollectionStore::new();
        let alice = UserContext::new("sheet-a");
        let bob = UserContext::new("sheet-b");

        store.write(&alice, "A1", "Mario", true).await.unwrap();
        store
            .write_preferences(&alice, UserPreferences { dark_mode: true })
            .await
            .unwrap();

        assert!(store.read_all(&bob).await.unwrap().is_empty());
        assert!(!store.read_preferences(&bob).await.unwrap().dark_mode);
        assert!(store.read_preferences(&alice).await.unwrap().dark_mode);
    }

    #[test]
    fn throttling_is_retryable_but_auth_failures_are_not() {
        assert!(StoreError::RateLimited { retry_after_secs: Some(30) }.is_retryable());
        assert!(StoreError::Unavailable(503).is_retryable());
        assert!(!StoreError::InvalidCredentials.is_retryable());
        assert!(!StoreError::QuotaExceeded.is_retryable());
    }
}
