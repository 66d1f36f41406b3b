use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use async_trait::async_trait;
use jsonwebtoken::{
    decode, decode_header,
    jwk::{Jwk, JwkSet},
    Algorithm, DecodingKey, Validation,
};
use serde::{Deserialize, Deserializer};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::GoogleConfig;

const GOOGLE_ISSUERS: [&str; 2] = ["accounts.google.com", "https://accounts.google.com"];

/// Floor between JWKS fetches, successful or not.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Claims that are trustworthy only after [`IdentityVerifier::verify`] succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalIdentity {
    pub subject_id: String,
    pub email: String,
    pub email_verified: bool,
    pub name: String,
    pub picture: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("invalid assertion: {0}")]
    InvalidAssertion(String),
    /// Provider keys could not be fetched. Safe to retry.
    #[error("identity provider unavailable: {0}")]
    Upstream(String),
}

#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(
        &self,
        raw_token: &str,
        expected_audience: &str,
    ) -> Result<ExternalIdentity, VerifyError>;
}

#[derive(Debug, Deserialize)]
struct GoogleClaims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default, deserialize_with = "bool_or_string")]
    email_verified: bool,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    picture: Option<String>,
}

// Older Google tokens encode email_verified as "true".
fn bool_or_string<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }
    Ok(match Flag::deserialize(d)? {
        Flag::Bool(b) => b,
        Flag::Text(s) => s.eq_ignore_ascii_case("true"),
    })
}

/// Verifies Google ID tokens against Google's published JWKS.
///
/// Keys are cached by `kid`; an unknown `kid` triggers a refetch, which
/// is how provider key rotation is picked up. Refetches are serialized and
/// at most one runs per [`MIN_REFRESH_INTERVAL`].
#[derive(Clone)]
pub struct GoogleVerifier {
    http: reqwest::Client,
    jwks_uri: String,
    keys: Arc<RwLock<HashMap<String, Jwk>>>,
    last_fetch: Arc<Mutex<Option<Instant>>>,
}

impl GoogleVerifier {
    pub fn new(config: &GoogleConfig, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build jwks http client")?;
        Ok(Self {
            http,
            jwks_uri: config.jwks_uri.clone(),
            keys: Arc::new(RwLock::new(HashMap::new())),
            last_fetch: Arc::new(Mutex::new(None)),
        })
    }

    async fn replace_keys(&self, set: JwkSet) -> usize {
        let fresh: HashMap<String, Jwk> = set
            .keys
            .into_iter()
            .filter_map(|jwk| jwk.common.key_id.clone().map(|kid| (kid, jwk)))
            .collect();
        let mut cache = self.keys.write().await;
        *cache = fresh;
        cache.len()
    }

    async fn refresh(&self) -> Result<(), VerifyError> {
        debug!(uri = %self.jwks_uri, "fetching google jwks");
        let resp = self
            .http
            .get(&self.jwks_uri)
            .send()
            .await
            .map_err(|e| VerifyError::Upstream(format!("fetch {}: {e}", self.jwks_uri)))?;
        if !resp.status().is_success() {
            return Err(VerifyError::Upstream(format!(
                "jwks request to {} returned {}",
                self.jwks_uri,
                resp.status()
            )));
        }
        let set: JwkSet = resp
            .json()
            .await
            .map_err(|e| VerifyError::Upstream(format!("parse jwks: {e}")))?;
        let count = self.replace_keys(set).await;
        info!(keys = count, "google jwks cache refreshed");
        Ok(())
    }

    async fn key_for(&self, kid: &str) -> Result<Jwk, VerifyError> {
        if let Some(jwk) = self.keys.read().await.get(kid) {
            return Ok(jwk.clone());
        }

        let mut last_fetch = self.last_fetch.lock().await;
        // another request may have refreshed while we waited
        if let Some(jwk) = self.keys.read().await.get(kid) {
            return Ok(jwk.clone());
        }
        if let Some(at) = *last_fetch {
            if at.elapsed() < MIN_REFRESH_INTERVAL {
                debug!(%kid, "jwks refresh throttled");
                return Err(VerifyError::InvalidAssertion(format!("unknown signing key {kid}")));
            }
        }
        *last_fetch = Some(Instant::now());
        self.refresh().await?;
        drop(last_fetch);

        self.keys
            .read()
            .await
            .get(kid)
            .cloned()
            .ok_or_else(|| VerifyError::InvalidAssertion(format!("unknown signing key {kid}")))
    }
}

#[async_trait]
impl IdentityVerifier for GoogleVerifier {
    async fn verify(
        &self,
        raw_token: &str,
        expected_audience: &str,
    ) -> Result<ExternalIdentity, VerifyError> {
        let header = decode_header(raw_token)
            .map_err(|e| VerifyError::InvalidAssertion(format!("malformed token: {e}")))?;
        if header.alg != Algorithm::RS256 {
            return Err(VerifyError::InvalidAssertion(format!(
                "unexpected algorithm {:?}",
                header.alg
            )));
        }
        let kid = header
            .kid
            .ok_or_else(|| VerifyError::InvalidAssertion("missing kid".into()))?;

        let jwk = self.key_for(&kid).await?;
        let key = DecodingKey::from_jwk(&jwk)
            .map_err(|e| VerifyError::InvalidAssertion(format!("unusable key {kid}: {e}")))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[expected_audience]);
        validation.set_issuer(&GOOGLE_ISSUERS);

        let claims = decode::<GoogleClaims>(raw_token, &key, &validation)
            .map_err(|e| {
                warn!(error = %e, "google id token rejected");
                VerifyError::InvalidAssertion(e.to_string())
            })?
            .claims;

        let email = claims
            .email
            .map(|e| e.trim().to_lowercase())
            .filter(|e| !e.is_empty())
            .ok_or_else(|| VerifyError::InvalidAssertion("token carries no email".into()))?;
        let name = claims
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| email.clone());

        Ok(ExternalIdentity {
            subject_id: claims.sub,
            email,
            email_verified: claims.email_verified,
            name,
            picture: claims.picture,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;
    use time::OffsetDateTime;

    const AUD: &str = "client-123.apps.googleusercontent.com";
    const TEST_KEY_PEM: &[u8] = include_bytes!("testdata/google_test_key.pem");
    const TEST_KEY_N: &str = "p8KzqY3GVv9_FCB6VsXdHRZN9QjpyeJB1x2hXKJmQUkAe0Iwxb_rPtcEd8SCjnVDxACTXd4XIBLIWkqEMKh57wskjH_EqCM1kdy1iEmJVFUBzUwcRQ3FOnBcUPmhK3VKF3Dd6qr2vprIuq19oR2F-Ql1DKk4CJ3QCW7RSGWLfYhDONC-TO-PsAYy3ICVnMOr3rLd9rqGR7UuQRexFyDuZOR4W6t_nfpA8uqH0VUtcn_155BdO50b2LLGBD0Mpgnq6-h-C1Y5gttkQfzdJhFfvbpzGIutG5jfxSl5DABDOM81sTfaqZTCMlYGXG3Nydd9Zparlri6gjNWBT_QdCK3sw";

    async fn verifier() -> GoogleVerifier {
        let v = GoogleVerifier::new(
            &GoogleConfig {
                client_id: AUD.into(),
                // nothing listens here; a cache miss surfaces as Upstream
                jwks_uri: "http://127.0.0.1:1/oauth2/v3/certs".into(),
            },
            Duration::from_secs(2),
        )
        .expect("verifier");
        let set: JwkSet = serde_json::from_value(json!({
            "keys": [{
                "kty": "RSA",
                "kid": "test-kid",
                "use": "sig",
                "alg": "RS256",
                "n": TEST_KEY_N,
                "e": "AQAB"
            }]
        }))
        .expect("jwk set");
        v.replace_keys(set).await;
        v
    }

    fn sign(kid: &str, claims: serde_json::Value) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(kid.into());
        let key = EncodingKey::from_rsa_pem(TEST_KEY_PEM).expect("test key");
        encode(&header, &claims, &key).expect("sign")
    }

    fn claims(aud: &str, exp_offset: i64) -> serde_json::Value {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        json!({
            "iss": "https://accounts.google.com",
            "aud": aud,
            "sub": "1098765",
            "email": "Alice@Example.com",
            "email_verified": true,
            "name": "Alice",
            "picture": "https://example.com/a.png",
            "iat": now - 10,
            "exp": now + exp_offset,
        })
    }

    #[tokio::test]
    async fn valid_token_yields_identity() {
        let v = verifier().await;
        let token = sign("test-kid", claims(AUD, 3600));
        let id = v.verify(&token, AUD).await.expect("verified");
        assert_eq!(id.subject_id, "1098765");
        assert_eq!(id.email, "alice@example.com");
        assert!(id.email_verified);
        assert_eq!(id.name, "Alice");
        assert_eq!(id.picture.as_deref(), Some("https://example.com/a.png"));
    }

    #[tokio::test]
    async fn wrong_audience_is_rejected() {
        let v = verifier().await;
        let token = sign("test-kid", claims("someone-else", 3600));
        assert!(matches!(
            v.verify(&token, AUD).await,
            Err(VerifyError::InvalidAssertion(_))
        ));
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let v = verifier().await;
        let token = sign("test-kid", claims(AUD, -3600));
        assert!(matches!(
            v.verify(&token, AUD).await,
            Err(VerifyError::InvalidAssertion(_))
        ));
    }

    #[tokio::test]
    async fn foreign_issuer_is_rejected() {
        let v = verifier().await;
        let mut c = claims(AUD, 3600);
        c["iss"] = json!("https://evil.example.com");
        let token = sign("test-kid", c);
        assert!(matches!(
            v.verify(&token, AUD).await,
            Err(VerifyError::InvalidAssertion(_))
        ));
    }

    #[tokio::test]
    async fn malformed_and_symmetric_tokens_are_rejected() {
        let v = verifier().await;
        assert!(matches!(
            v.verify("garbage", AUD).await,
            Err(VerifyError::InvalidAssertion(_))
        ));

        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some("test-kid".into());
        let hs = encode(&header, &claims(AUD, 3600), &EncodingKey::from_secret(b"guess"))
            .unwrap();
        assert!(matches!(
            v.verify(&hs, AUD).await,
            Err(VerifyError::InvalidAssertion(_))
        ));
    }

    #[tokio::test]
    async fn unknown_kid_refetches_and_reports_upstream_failure() {
        let v = verifier().await;
        let token = sign("rotated-kid", claims(AUD, 3600));
        assert!(matches!(
            v.verify(&token, AUD).await,
            Err(VerifyError::Upstream(_))
        ));
    }

    #[tokio::test]
    async fn unknown_kids_do_not_refetch_within_interval() {
        let v = verifier().await;
        let first = sign("rotated-kid", claims(AUD, 3600));
        assert!(matches!(
            v.verify(&first, AUD).await,
            Err(VerifyError::Upstream(_))
        ));
        let fetched_at = (*v.last_fetch.lock().await).expect("fetch attempt recorded");

        for kid in ["other-kid", "rotated-kid", "third-kid"] {
            let token = sign(kid, claims(AUD, 3600));
            assert!(matches!(
                v.verify(&token, AUD).await,
                Err(VerifyError::InvalidAssertion(_))
            ));
        }
        assert_eq!(*v.last_fetch.lock().await, Some(fetched_at));

        // cached keys keep working while refreshes are throttled
        let ok = sign("test-kid", claims(AUD, 3600));
        assert!(v.verify(&ok, AUD).await.is_ok());
    }

    #[test]
    fn email_verified_accepts_string_form() {
        let c: GoogleClaims =
            serde_json::from_value(json!({"sub": "1", "email_verified": "true"})).unwrap();
        assert!(c.email_verified);
        let c: GoogleClaims = serde_json::from_value(json!({"sub": "1"})).unwrap();
        assert!(!c.email_verified);
    }
}
