use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

use axum::{
    async_trait,
    extract::{ConnectInfo, FromRef, FromRequestParts},
    http::{header, request::Parts, HeaderMap},
};
use tracing::debug;

use super::{
    claims::SessionSubject,
    jwt::JwtKeys,
    repo_types::{Role, User},
    services::require_role,
};
use crate::{error::ApiError, state::AppState};

/// Bearer-token session. Carries the token's claims; the role in here is a
/// display hint only.
#[derive(Debug, Clone)]
pub struct AuthUser(pub SessionSubject);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    JwtKeys: FromRef<S>,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::Unauthenticated("Access token required"))?;

        let token = auth_header
            .strip_prefix("Bearer ")
            .or_else(|| auth_header.strip_prefix("bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(ApiError::Unauthenticated("Access token required"))?;

        let keys = JwtKeys::from_ref(state);
        let subject = keys.verify(token).map_err(|e| {
            debug!(error = %e, "session token rejected");
            ApiError::from(e)
        })?;
        Ok(AuthUser(subject))
    }
}

/// Authenticated caller whose stored role is `admin`.
#[derive(Debug, Clone)]
pub struct AdminUser(pub User);

#[async_trait]
impl FromRequestParts<AppState> for AdminUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let AuthUser(subject) = AuthUser::from_request_parts(parts, state).await?;
        let user = require_role(state.store.as_ref(), &subject, Role::Admin).await?;
        Ok(AdminUser(user))
    }
}

/// Best-effort client address for login history; empty when unknown.
/// Forwarding headers count only when the socket peer is a trusted proxy.
#[derive(Debug, Clone, Default)]
pub struct ClientAddr(pub String);

#[async_trait]
impl FromRequestParts<AppState> for ClientAddr {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        Ok(ClientAddr(client_addr(
            &parts.headers,
            peer,
            &state.config.trusted_proxies,
        )))
    }
}

fn client_addr(headers: &HeaderMap, peer: Option<IpAddr>, trusted: &HashSet<IpAddr>) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    let forwarded = match peer {
        Some(ip) if trusted.contains(&ip) => header("x-forwarded-for")
            // the proxy appends the address it saw last
            .and_then(|v| v.rsplit(',').map(str::trim).find(|s| !s.is_empty()))
            .or_else(|| header("x-real-ip"))
            .map(str::to_string),
        _ => None,
    };

    let addr = forwarded
        .or_else(|| peer.map(|ip| ip.to_string()))
        .unwrap_or_default();
    addr.chars().take(64).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, Request};

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(*k, HeaderValue::from_static(v));
        }
        h
    }

    fn proxies() -> HashSet<IpAddr> {
        ["10.0.0.2".parse().unwrap()].into_iter().collect()
    }

    #[test]
    fn forwarded_headers_ignored_from_untrusted_peer() {
        let h = headers(&[("x-forwarded-for", "6.6.6.6"), ("x-real-ip", "7.7.7.7")]);
        let peer = Some("203.0.113.9".parse().unwrap());
        assert_eq!(client_addr(&h, peer, &proxies()), "203.0.113.9");
        assert_eq!(client_addr(&h, None, &proxies()), "");
    }

    #[test]
    fn trusted_proxy_supplies_client_address() {
        let peer = Some("10.0.0.2".parse().unwrap());
        let h = headers(&[("x-forwarded-for", "6.6.6.6, 198.51.100.4")]);
        assert_eq!(client_addr(&h, peer, &proxies()), "198.51.100.4");
        let h = headers(&[("x-real-ip", "198.51.100.5")]);
        assert_eq!(client_addr(&h, peer, &proxies()), "198.51.100.5");
        assert_eq!(client_addr(&HeaderMap::new(), peer, &proxies()), "10.0.0.2");
    }

    #[tokio::test]
    async fn extractor_reads_connect_info() {
        let (state, _) = AppState::fake(&[]);
        let mut req = Request::builder()
            .header("x-forwarded-for", "6.6.6.6")
            .body(())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 1], 5000))));
        let (mut parts, _) = req.into_parts();
        let ClientAddr(addr) = ClientAddr::from_request_parts(&mut parts, &state)
            .await
            .unwrap();
        assert_eq!(addr, "192.0.2.1");
    }
}
