use std::sync::Arc;

use crate::auth::google::{GoogleVerifier, IdentityVerifier};
use crate::auth::jwt::JwtKeys;
use crate::config::AppConfig;
use crate::store::{self, CredentialStore};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn CredentialStore>,
    pub config: Arc<AppConfig>,
    pub keys: JwtKeys,
    pub identity: Arc<dyn IdentityVerifier>,
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let config = Arc::new(AppConfig::from_env()?);
        let store = store::connect(&config).await?;
        let identity = Arc::new(GoogleVerifier::new(&config.google, config.upstream_timeout)?)
            as Arc<dyn IdentityVerifier>;
        Ok(Self::from_parts(store, config, identity))
    }

    pub fn from_parts(
        store: Arc<dyn CredentialStore>,
        config: Arc<AppConfig>,
        identity: Arc<dyn IdentityVerifier>,
    ) -> Self {
        let keys = JwtKeys::from(&config.jwt);
        Self {
            store,
            config,
            keys,
            identity,
        }
    }

    /// In-memory store plus a verifier that trusts `fake:<sub>:<email>[:<name>]` tokens.
    #[cfg(test)]
    pub fn fake(admin_emails: &[&str]) -> (Self, Arc<crate::store::MemoryStore>) {
        use crate::auth::google::{ExternalIdentity, VerifyError};
        use crate::config::{Environment, GoogleConfig, JwtConfig, StoreConfig};
        use async_trait::async_trait;
        use std::time::Duration;

        struct FakeVerifier;
        #[async_trait]
        impl IdentityVerifier for FakeVerifier {
            async fn verify(
                &self,
                raw_token: &str,
                expected_audience: &str,
            ) -> Result<ExternalIdentity, VerifyError> {
                if expected_audience != "test-client" {
                    return Err(VerifyError::InvalidAssertion("audience".into()));
                }
                if raw_token == "fake-upstream-down" {
                    return Err(VerifyError::Upstream("jwks timeout".into()));
                }
                let mut parts = raw_token.split(':');
                match (parts.next(), parts.next(), parts.next()) {
                    (Some("fake"), Some(sub), Some(email)) => Ok(ExternalIdentity {
                        subject_id: sub.to_string(),
                        email: email.to_lowercase(),
                        email_verified: true,
                        name: parts.next().unwrap_or(email).to_string(),
                        picture: parts.next().map(|p| format!("https://img.example.com/{p}")),
                    }),
                    _ => Err(VerifyError::InvalidAssertion("not a fake token".into())),
                }
            }
        }

        let config = Arc::new(AppConfig {
            environment: Environment::Development,
            store: StoreConfig::Memory,
            jwt: JwtConfig {
                secret: "test".into(),
                issuer: "test-issuer".into(),
                audience: "test-aud".into(),
                ttl_days: 30,
            },
            google: GoogleConfig {
                client_id: "test-client".into(),
                jwks_uri: "http://127.0.0.1:1/certs".into(),
            },
            admin_emails: admin_emails.iter().map(|e| e.to_lowercase()).collect(),
            trusted_proxies: ["10.0.0.2".parse().expect("ip")].into_iter().collect(),
            upstream_timeout: Duration::from_secs(5),
        });

        let memory = Arc::new(crate::store::MemoryStore::default());
        let store = memory.clone() as Arc<dyn CredentialStore>;
        (
            Self::from_parts(store, config, Arc::new(FakeVerifier)),
            memory,
        )
    }
}
