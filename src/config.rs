use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;
use tracing::warn;

/// Signing secret used when `JWT_SECRET` is unset in development.
pub const DEV_JWT_SECRET: &str = "coursehub-dev-secret-do-not-use-in-production";
/// Google client id used when `GOOGLE_CLIENT_ID` is unset in development.
pub const DEV_GOOGLE_CLIENT_ID: &str = "coursehub-dev.apps.googleusercontent.com";
pub const GOOGLE_JWKS_URI: &str = "https://www.googleapis.com/oauth2/v3/certs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Production,
}

#[derive(Debug, Clone, Deserialize)]
pub enum StoreConfig {
    Postgres {
        database_url: String,
        max_connections: u32,
    },
    Supabase {
        url: String,
        service_key: String,
    },
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleConfig {
    pub client_id: String,
    pub jwks_uri: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub environment: Environment,
    pub store: StoreConfig,
    pub jwt: JwtConfig,
    pub google: GoogleConfig,
    pub admin_emails: HashSet<String>,
    /// Peers whose `X-Forwarded-For` / `X-Real-IP` headers are believed.
    pub trusted_proxies: HashSet<IpAddr>,
    pub upstream_timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset and blank values are treated alike.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let environment = match get("APP_ENV").as_deref() {
            None | Some("development") | Some("dev") => Environment::Development,
            Some("production") | Some("prod") => Environment::Production,
            Some(other) => bail!("APP_ENV must be development or production, got {other:?}"),
        };

        let store = match get("STORE_BACKEND").as_deref() {
            None | Some("postgres") => StoreConfig::Postgres {
                database_url: get("DATABASE_URL").context("DATABASE_URL must be set")?,
                max_connections: parse_or(get("DATABASE_MAX_CONNECTIONS"), 10)
                    .context("DATABASE_MAX_CONNECTIONS")?,
            },
            Some("supabase") => StoreConfig::Supabase {
                url: get("SUPABASE_URL").context("SUPABASE_URL must be set")?,
                service_key: get("SUPABASE_SERVICE_KEY")
                    .context("SUPABASE_SERVICE_KEY must be set")?,
            },
            Some("memory") => {
                if environment == Environment::Production {
                    bail!("STORE_BACKEND=memory is not allowed in production");
                }
                StoreConfig::Memory
            }
            Some(other) => bail!("unknown STORE_BACKEND {other:?}"),
        };

        let secret = match get("JWT_SECRET") {
            Some(s) if s == DEV_JWT_SECRET && environment == Environment::Production => {
                bail!("JWT_SECRET is set to the development default; refusing to start in production")
            }
            Some(s) => s,
            None if environment == Environment::Production => {
                bail!("JWT_SECRET must be set in production")
            }
            None => {
                warn!("JWT_SECRET not set; using the insecure development secret");
                DEV_JWT_SECRET.to_string()
            }
        };

        let jwt = JwtConfig {
            secret,
            issuer: get("JWT_ISSUER").unwrap_or_else(|| "coursehub".into()),
            audience: get("JWT_AUDIENCE").unwrap_or_else(|| "coursehub-users".into()),
            ttl_days: parse_or(get("JWT_TTL_DAYS"), 30).context("JWT_TTL_DAYS")?,
        };
        if jwt.ttl_days <= 0 {
            bail!("JWT_TTL_DAYS must be positive");
        }

        let client_id = match get("GOOGLE_CLIENT_ID") {
            Some(id) => id,
            None if environment == Environment::Production => {
                bail!("GOOGLE_CLIENT_ID must be set in production")
            }
            None => {
                warn!("GOOGLE_CLIENT_ID not set; Google sign-in will only accept the development client id");
                DEV_GOOGLE_CLIENT_ID.to_string()
            }
        };
        let google = GoogleConfig {
            client_id,
            jwks_uri: get("GOOGLE_JWKS_URI").unwrap_or_else(|| GOOGLE_JWKS_URI.into()),
        };

        let admin_emails = get("ADMIN_EMAILS")
            .map(|raw| parse_email_list(&raw))
            .unwrap_or_default();

        let trusted_proxies = get("TRUSTED_PROXIES")
            .map(|raw| parse_ip_list(&raw))
            .transpose()
            .context("TRUSTED_PROXIES")?
            .unwrap_or_default();

        let upstream_timeout = Duration::from_secs(
            parse_or(get("UPSTREAM_TIMEOUT_SECS"), 8).context("UPSTREAM_TIMEOUT_SECS")?,
        );

        Ok(Self {
            environment,
            store,
            jwt,
            google,
            admin_emails,
            trusted_proxies,
            upstream_timeout,
        })
    }
}

fn parse_email_list(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_ip_list(raw: &str) -> anyhow::Result<HashSet<IpAddr>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<IpAddr>().with_context(|| format!("invalid proxy address {s:?}")))
        .collect()
}

fn parse_or<T>(value: Option<String>, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(v) => Ok(v.parse::<T>()?),
        None => Ok(default),
    }
}
