use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::{debug, info};
use uuid::Uuid;

use super::{CredentialStore, StoreError, StoreResult};
use crate::auth::repo_types::{LoginRecord, NewUser, User, UserChanges, UserRow};

/// Relational backend over a pooled Postgres connection set.
#[derive(Clone)]
pub struct PgStore {
    db: PgPool,
}

impl PgStore {
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let db = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await
            .context("connect to database")?;

        sqlx::migrate!("./migrations")
            .run(&db)
            .await
            .context("run migrations")?;
        info!(max_connections, "postgres store ready");

        Ok(Self { db })
    }
}

fn classify(err: sqlx::Error, what: &'static str) -> StoreError {
    match err {
        sqlx::Error::Database(ref db) if db.is_unique_violation() => StoreError::Duplicate,
        sqlx::Error::Database(ref db) if db.is_foreign_key_violation() => StoreError::NotFound,
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(format!("{what}: {err}"))
        }
        other => StoreError::Backend(anyhow::Error::new(other).context(what)),
    }
}

fn into_user(row: UserRow) -> StoreResult<User> {
    User::try_from(row).map_err(|e| StoreError::Backend(e.into()))
}

#[async_trait]
impl CredentialStore for PgStore {
    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, email, name, password_hash, google_id, picture, role,
                   created_at, updated_at, last_login
            FROM users
            WHERE lower(email) = lower($1)
            "#,
        )
        .bind(email)
        .fetch_optional(&self.db)
        .await
        .map_err(|e| classify(e, "find user by email"))?;
        row.map(into_user).transpose()
    }

    async fn find_by_google_id(&self, google_id: &str) -> StoreResult<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, email, name, password_hash, google_id, picture, role,
                   created_at, updated_at, last_login
            FROM users
            WHERE google_id = $1
            "#,
        )
        .bind(google_id)
        .fetch_optional(&self.db)
        .await
        .map_err(|e| classify(e, "find user by google id"))?;
        row.map(into_user).transpose()
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, email, name, password_hash, google_id, picture, role,
                   created_at, updated_at, last_login
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await
        .map_err(|e| classify(e, "find user by id"))?;
        row.map(into_user).transpose()
    }

    async fn create(&self, user: NewUser) -> StoreResult<User> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            INSERT INTO users (id, email, name, password_hash, google_id, picture)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, email, name, password_hash, google_id, picture, role,
                      created_at, updated_at, last_login
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&user.email)
        .bind(&user.name)
        .bind(&user.password_hash)
        .bind(&user.google_id)
        .bind(&user.picture)
        .fetch_one(&self.db)
        .await
        .map_err(|e| classify(e, "insert user"))?;
        debug!(user_id = %row.id, "user row inserted");
        into_user(row)
    }

    async fn update(&self, id: Uuid, changes: UserChanges) -> StoreResult<User> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            UPDATE users SET
                email         = COALESCE($2, email),
                name          = COALESCE($3, name),
                password_hash = CASE WHEN $8 AND $4::text IS NULL THEN NULL
                                     ELSE COALESCE($4, password_hash) END,
                google_id     = COALESCE($5, google_id),
                picture       = COALESCE($6, picture),
                role          = COALESCE($7, role),
                updated_at    = now()
            WHERE id = $1
            RETURNING id, email, name, password_hash, google_id, picture, role,
                      created_at, updated_at, last_login
            "#,
        )
        .bind(id)
        .bind(changes.email.map(|e| e.to_lowercase()))
        .bind(changes.name)
        .bind(changes.password_hash)
        .bind(changes.google_id)
        .bind(changes.picture)
        .bind(changes.role.map(|r| r.as_str()))
        .bind(changes.clear_password)
        .fetch_optional(&self.db)
        .await
        .map_err(|e| classify(e, "update user"))?
        .ok_or(StoreError::NotFound)?;
        into_user(row)
    }

    async fn record_login(&self, user_id: Uuid, ip_address: &str) -> StoreResult<()> {
        let mut tx = self
            .db
            .begin()
            .await
            .map_err(|e| classify(e, "begin tx"))?;

        sqlx::query(
            r#"
            INSERT INTO login_history (id, user_id, ip_address)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(ip_address)
        .execute(&mut *tx)
        .await
        .map_err(|e| classify(e, "insert login history"))?;

        sqlx::query(r#"UPDATE users SET last_login = now() WHERE id = $1"#)
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| classify(e, "update last_login"))?;

        tx.commit().await.map_err(|e| classify(e, "commit tx"))?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> StoreResult<()> {
        let res = sqlx::query(r#"DELETE FROM users WHERE id = $1"#)
            .bind(id)
            .execute(&self.db)
            .await
            .map_err(|e| classify(e, "delete user"))?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn list_users(&self) -> StoreResult<Vec<User>> {
        let rows = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, email, name, password_hash, google_id, picture, role,
                   created_at, updated_at, last_login
            FROM users
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.db)
        .await
        .map_err(|e| classify(e, "list users"))?;
        rows.into_iter().map(into_user).collect()
    }

    async fn login_history(&self, user_id: Uuid, limit: i64) -> StoreResult<Vec<LoginRecord>> {
        let rows = sqlx::query_as::<_, LoginRecord>(
            r#"
            SELECT id, user_id, login_time, ip_address
              FROM login_history
             WHERE user_id = $1
             ORDER BY login_time DESC
             LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.db)
        .await
        .map_err(|e| classify(e, "list login history"))?;
        Ok(rows)
    }
}
