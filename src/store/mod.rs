use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::auth::repo_types::{LoginRecord, NewUser, User, UserChanges};
use crate::config::{AppConfig, StoreConfig};

pub mod memory;
pub mod postgres;
pub mod supabase;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use supabase::SupabaseStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Email or Google id already belongs to another account.
    #[error("duplicate identity")]
    Duplicate,
    #[error("record not found")]
    NotFound,
    /// Timeouts, exhausted pool, unreachable hosted backend. Safe to retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable user and login-history records. Implementations enforce
/// email (case-insensitive) and Google id uniqueness themselves.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>>;
    async fn find_by_google_id(&self, google_id: &str) -> StoreResult<Option<User>>;
    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<User>>;
    async fn create(&self, user: NewUser) -> StoreResult<User>;
    async fn update(&self, id: Uuid, changes: UserChanges) -> StoreResult<User>;
    /// Appends a login_history row and bumps `last_login`.
    async fn record_login(&self, user_id: Uuid, ip_address: &str) -> StoreResult<()>;
    /// Removes the user; login history goes with it.
    async fn delete(&self, id: Uuid) -> StoreResult<()>;
    async fn list_users(&self) -> StoreResult<Vec<User>>;
    async fn login_history(&self, user_id: Uuid, limit: i64) -> StoreResult<Vec<LoginRecord>>;
}

/// Picks the backend named in the config.
pub async fn connect(config: &AppConfig) -> anyhow::Result<Arc<dyn CredentialStore>> {
    let store: Arc<dyn CredentialStore> = match &config.store {
        StoreConfig::Postgres {
            database_url,
            max_connections,
        } => Arc::new(
            PgStore::connect(database_url, *max_connections, config.upstream_timeout).await?,
        ),
        StoreConfig::Supabase { url, service_key } => {
            Arc::new(SupabaseStore::new(url, service_key, config.upstream_timeout)?)
        }
        StoreConfig::Memory => Arc::new(MemoryStore::default()),
    };
    Ok(store)
}
