use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Map, Value};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::{debug, error};
use uuid::Uuid;

use super::{CredentialStore, StoreError, StoreResult};
use crate::auth::repo_types::{LoginRecord, NewUser, User, UserChanges, UserRow};

/// Hosted backend: the same `users` / `login_history` tables reached through
/// the Supabase PostgREST API with a service key.
#[derive(Clone)]
pub struct SupabaseStore {
    http: Client,
    rest_url: String,
    service_key: String,
}

#[derive(Debug, Deserialize)]
struct PostgrestError {
    code: Option<String>,
    message: Option<String>,
}

impl SupabaseStore {
    pub fn new(base_url: &str, service_key: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("build supabase http client")?;
        Ok(Self {
            http,
            rest_url: format!("{}/rest/v1", base_url.trim_end_matches('/')),
            service_key: service_key.to_string(),
        })
    }

    fn table(&self, builder: fn(&Client, String) -> RequestBuilder, table: &str) -> RequestBuilder {
        builder(&self.http, format!("{}/{}", self.rest_url, table))
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
    }

    fn get(&self, table: &str) -> RequestBuilder {
        self.table(|c, url| c.get(url), table)
    }

    fn post(&self, table: &str) -> RequestBuilder {
        self.table(|c, url| c.post(url), table)
            .header("Prefer", "return=representation")
    }

    fn patch(&self, table: &str) -> RequestBuilder {
        self.table(|c, url| c.patch(url), table)
            .header("Prefer", "return=representation")
    }

    fn delete_from(&self, table: &str) -> RequestBuilder {
        self.table(|c, url| c.delete(url), table)
            .header("Prefer", "return=representation")
    }

    async fn rows<T: DeserializeOwned>(&self, req: RequestBuilder, what: &'static str) -> StoreResult<Vec<T>> {
        let resp = req.send().await.map_err(|e| transport(e, what))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &body, what));
        }
        resp.json::<Vec<T>>()
            .await
            .with_context(|| format!("{what}: decode response"))
            .map_err(StoreError::Backend)
    }

    async fn users(&self, req: RequestBuilder, what: &'static str) -> StoreResult<Vec<User>> {
        self.rows::<UserRow>(req, what)
            .await?
            .into_iter()
            .map(|r| User::try_from(r).map_err(|e| StoreError::Backend(e.into())))
            .collect()
    }

    async fn one_user(&self, req: RequestBuilder, what: &'static str) -> StoreResult<Option<User>> {
        Ok(self.users(req, what).await?.into_iter().next())
    }
}

fn transport(err: reqwest::Error, what: &'static str) -> StoreError {
    error!(error = %err, what, "supabase request failed");
    if err.is_timeout() || err.is_connect() || err.is_request() {
        StoreError::Unavailable(format!("{what}: {err}"))
    } else {
        StoreError::Backend(anyhow::Error::new(err).context(what))
    }
}

/// Maps a PostgREST failure onto the store taxonomy. Postgres error codes in
/// the body win over the HTTP status.
fn classify_status(status: StatusCode, body: &str, what: &'static str) -> StoreError {
    let parsed: Option<PostgrestError> = serde_json::from_str(body).ok();
    let code = parsed.as_ref().and_then(|p| p.code.as_deref());
    match (code, status) {
        (Some("23505"), _) => StoreError::Duplicate,
        (Some("23503"), _) => StoreError::NotFound,
        (_, StatusCode::CONFLICT) => StoreError::Duplicate,
        (_, s) if s == StatusCode::SERVICE_UNAVAILABLE
            || s == StatusCode::GATEWAY_TIMEOUT
            || s == StatusCode::BAD_GATEWAY =>
        {
            StoreError::Unavailable(format!("{what}: upstream status {s}"))
        }
        (_, s) => {
            let message = parsed
                .as_ref()
                .and_then(|p| p.message.clone())
                .unwrap_or_else(|| body.chars().take(200).collect());
            StoreError::Backend(anyhow!("{what}: status {s}: {message}"))
        }
    }
}

fn changes_body(changes: UserChanges) -> Value {
    let mut body = Map::new();
    if let Some(email) = changes.email {
        body.insert("email".into(), json!(email.to_lowercase()));
    }
    if let Some(name) = changes.name {
        body.insert("name".into(), json!(name));
    }
    if let Some(hash) = changes.password_hash {
        body.insert("password_hash".into(), json!(hash));
    } else if changes.clear_password {
        body.insert("password_hash".into(), Value::Null);
    }
    if let Some(gid) = changes.google_id {
        body.insert("google_id".into(), json!(gid));
    }
    if let Some(picture) = changes.picture {
        body.insert("picture".into(), json!(picture));
    }
    if let Some(role) = changes.role {
        body.insert("role".into(), json!(role.as_str()));
    }
    body.insert("updated_at".into(), json!(now_rfc3339()));
    Value::Object(body)
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

#[async_trait]
impl CredentialStore for SupabaseStore {
    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let req = self
            .get("users")
            .query(&[("select", "*".to_string()), ("email", format!("eq.{}", email.to_lowercase()))]);
        self.one_user(req, "find user by email").await
    }

    async fn find_by_google_id(&self, google_id: &str) -> StoreResult<Option<User>> {
        let req = self
            .get("users")
            .query(&[("select", "*".to_string()), ("google_id", format!("eq.{google_id}"))]);
        self.one_user(req, "find user by google id").await
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
        let req = self
            .get("users")
            .query(&[("select", "*".to_string()), ("id", format!("eq.{id}"))]);
        self.one_user(req, "find user by id").await
    }

    async fn create(&self, user: NewUser) -> StoreResult<User> {
        let body = json!({
            "id": Uuid::new_v4(),
            "email": user.email.to_lowercase(),
            "name": user.name,
            "password_hash": user.password_hash,
            "google_id": user.google_id,
            "picture": user.picture,
        });
        let created = self
            .one_user(self.post("users").json(&body), "insert user")
            .await?
            .ok_or_else(|| StoreError::Backend(anyhow!("insert user: empty representation")))?;
        debug!(user_id = %created.id, "user row inserted");
        Ok(created)
    }

    async fn update(&self, id: Uuid, changes: UserChanges) -> StoreResult<User> {
        let req = self
            .patch("users")
            .query(&[("id", format!("eq.{id}"))])
            .json(&changes_body(changes));
        self.one_user(req, "update user")
            .await?
            .ok_or(StoreError::NotFound)
    }

    async fn record_login(&self, user_id: Uuid, ip_address: &str) -> StoreResult<()> {
        // PostgREST has no multi-statement transaction; touch the user first so
        // a vanished account never gets a history row.
        let req = self
            .patch("users")
            .query(&[("id", format!("eq.{user_id}"))])
            .json(&json!({ "last_login": now_rfc3339() }));
        self.one_user(req, "update last_login")
            .await?
            .ok_or(StoreError::NotFound)?;

        let body = json!({
            "id": Uuid::new_v4(),
            "user_id": user_id,
            "ip_address": ip_address,
        });
        self.rows::<LoginRecord>(self.post("login_history").json(&body), "insert login history")
            .await?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> StoreResult<()> {
        let req = self.delete_from("users").query(&[("id", format!("eq.{id}"))]);
        let removed = self.users(req, "delete user").await?;
        if removed.is_empty() {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn list_users(&self) -> StoreResult<Vec<User>> {
        let req = self
            .get("users")
            .query(&[("select", "*"), ("order", "created_at.desc")]);
        self.users(req, "list users").await
    }

    async fn login_history(&self, user_id: Uuid, limit: i64) -> StoreResult<Vec<LoginRecord>> {
        let req = self.get("login_history").query(&[
            ("select", "*".to_string()),
            ("user_id", format!("eq.{user_id}")),
            ("order", "login_time.desc".to_string()),
            ("limit", limit.max(0).to_string()),
        ]);
        self.rows(req, "list login history").await
    }
}
