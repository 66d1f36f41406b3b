use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{CredentialStore, StoreError, StoreResult};
use crate::auth::repo_types::{LoginRecord, NewUser, Role, User, UserChanges};

/// Process-local backend for development and tests. Every mutation runs
/// under one write lock, which makes the uniqueness checks atomic.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    logins: Vec<LoginRecord>,
}

impl Tables {
    fn email_taken(&self, email: &str, except: Option<Uuid>) -> bool {
        self.users
            .values()
            .any(|u| Some(u.id) != except && u.email.eq_ignore_ascii_case(email))
    }

    fn google_id_taken(&self, google_id: &str, except: Option<Uuid>) -> bool {
        self.users
            .values()
            .any(|u| Some(u.id) != except && u.google_id.as_deref() == Some(google_id))
    }
}

#[cfg(test)]
impl MemoryStore {
    pub async fn user_count(&self) -> usize {
        self.tables.read().await.users.len()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let t = self.tables.read().await;
        Ok(t.users
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn find_by_google_id(&self, google_id: &str) -> StoreResult<Option<User>> {
        let t = self.tables.read().await;
        Ok(t.users
            .values()
            .find(|u| u.google_id.as_deref() == Some(google_id))
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
        Ok(self.tables.read().await.users.get(&id).cloned())
    }

    async fn create(&self, user: NewUser) -> StoreResult<User> {
        let mut t = self.tables.write().await;
        if t.email_taken(&user.email, None) {
            return Err(StoreError::Duplicate);
        }
        if let Some(gid) = &user.google_id {
            if t.google_id_taken(gid, None) {
                return Err(StoreError::Duplicate);
            }
        }
        let now = OffsetDateTime::now_utc();
        let created = User {
            id: Uuid::new_v4(),
            email: user.email.to_lowercase(),
            name: user.name,
            password_hash: user.password_hash,
            google_id: user.google_id,
            picture: user.picture,
            role: Role::User,
            created_at: now,
            updated_at: now,
            last_login: None,
        };
        t.users.insert(created.id, created.clone());
        Ok(created)
    }

    async fn update(&self, id: Uuid, changes: UserChanges) -> StoreResult<User> {
        let mut t = self.tables.write().await;
        if !t.users.contains_key(&id) {
            return Err(StoreError::NotFound);
        }
        if let Some(email) = &changes.email {
            if t.email_taken(email, Some(id)) {
                return Err(StoreError::Duplicate);
            }
        }
        if let Some(gid) = &changes.google_id {
            if t.google_id_taken(gid, Some(id)) {
                return Err(StoreError::Duplicate);
            }
        }
        let user = t.users.get_mut(&id).ok_or(StoreError::NotFound)?;
        if let Some(email) = changes.email {
            user.email = email.to_lowercase();
        }
        if let Some(name) = changes.name {
            user.name = name;
        }
        if let Some(hash) = changes.password_hash {
            user.password_hash = Some(hash);
        } else if changes.clear_password {
            user.password_hash = None;
        }
        if let Some(gid) = changes.google_id {
            user.google_id = Some(gid);
        }
        if let Some(picture) = changes.picture {
            user.picture = Some(picture);
        }
        if let Some(role) = changes.role {
            user.role = role;
        }
        user.updated_at = OffsetDateTime::now_utc();
        Ok(user.clone())
    }

    async fn record_login(&self, user_id: Uuid, ip_address: &str) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        let now = OffsetDateTime::now_utc();
        let user = t.users.get_mut(&user_id).ok_or(StoreError::NotFound)?;
        user.last_login = Some(now);
        t.logins.push(LoginRecord {
            id: Uuid::new_v4(),
            user_id,
            login_time: now,
            ip_address: ip_address.to_string(),
        });
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        t.users.remove(&id).ok_or(StoreError::NotFound)?;
        t.logins.retain(|l| l.user_id != id);
        Ok(())
    }

    async fn list_users(&self) -> StoreResult<Vec<User>> {
        let t = self.tables.read().await;
        let mut users: Vec<User> = t.users.values().cloned().collect();
        users.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(users)
    }

    async fn login_history(&self, user_id: Uuid, limit: i64) -> StoreResult<Vec<LoginRecord>> {
        let t = self.tables.read().await;
        Ok(t.logins
            .iter()
            .rev()
            .filter(|l| l.user_id == user_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}
