//! HTTP-facing error type. Everything below the handlers converts into
//! [`ApiError`]; storage and crypto detail is logged here and never sent.

use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequest, FromRequestParts, Path, Request},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::{error, warn};

use crate::auth::{google::VerifyError, jwt::TokenError, password::PasswordError};
use crate::store::StoreError;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing or malformed input.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Email or external identity already registered.
    #[error("duplicate identity: {0}")]
    DuplicateIdentity(String),

    /// No/invalid/expired token or bad credentials. The message is kept generic.
    #[error("unauthenticated: {0}")]
    Unauthenticated(&'static str),

    /// Password login attempted on an account created through Google.
    #[error("account uses external sign-in")]
    ExternalSignInOnly,

    #[error("forbidden: {0}")]
    Forbidden(&'static str),

    #[error("{0} not found")]
    NotFound(&'static str),

    /// Identity provider unreachable or key fetch failed.
    #[error("upstream verification failure: {0}")]
    Upstream(String),

    /// Store timed out or is unreachable.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        ApiError::Validation(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::DuplicateIdentity(_) => StatusCode::CONFLICT,
            ApiError::Unauthenticated(_) | ApiError::ExternalSignInOnly => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate => ApiError::DuplicateIdentity("email already registered".into()),
            StoreError::NotFound => ApiError::NotFound("user"),
            StoreError::Unavailable(msg) => ApiError::Unavailable(msg),
            StoreError::Backend(e) => ApiError::Internal(e.context("credential store")),
        }
    }
}

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Invalid(_) | TokenError::Expired => ApiError::Unauthenticated("invalid token"),
            TokenError::Sign(msg) => ApiError::Internal(anyhow::anyhow!("sign session token: {msg}")),
        }
    }
}

impl From<VerifyError> for ApiError {
    fn from(err: VerifyError) -> Self {
        match err {
            VerifyError::InvalidAssertion(_) => ApiError::Unauthenticated("google authentication failed"),
            VerifyError::Upstream(msg) => ApiError::Upstream(msg),
        }
    }
}

impl From<PasswordError> for ApiError {
    fn from(err: PasswordError) -> Self {
        match err {
            PasswordError::EmptyInput => ApiError::validation("password is required"),
            PasswordError::Hash(msg) => ApiError::Internal(anyhow::anyhow!(msg)),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Validation(msg) | ApiError::DuplicateIdentity(msg) => msg.clone(),
            ApiError::Unauthenticated(msg) => {
                warn!(reason = msg, "unauthenticated request");
                msg.to_string()
            }
            ApiError::ExternalSignInOnly => {
                "this account uses Google sign-in; log in with Google".to_string()
            }
            ApiError::Forbidden(msg) => {
                warn!(reason = msg, "forbidden request");
                msg.to_string()
            }
            ApiError::NotFound(what) => format!("{what} not found"),
            ApiError::Upstream(detail) => {
                error!(%detail, "identity provider failure");
                "identity provider unavailable, try again".to_string()
            }
            ApiError::Unavailable(detail) => {
                error!(%detail, "store unavailable");
                "service temporarily unavailable, try again".to_string()
            }
            ApiError::Internal(e) => {
                error!(error = ?e, "internal error");
                "internal server error".to_string()
            }
        };

        (
            status,
            Json(ErrorResponse {
                success: false,
                message,
            }),
        )
            .into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// `Json<T>` whose rejections come back as [`ApiError::Validation`].
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => {
                warn!(error = %rejection.body_text(), "rejected request body");
                Err(ApiError::validation("Invalid request body"))
            }
        }
    }
}

/// `Path<T>` whose rejections come back as [`ApiError::Validation`].
pub struct ApiPath<T>(pub T);

#[async_trait]
impl<S, T> FromRequestParts<S> for ApiPath<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Path::<T>::from_request_parts(parts, state).await {
            Ok(Path(value)) => Ok(ApiPath(value)),
            Err(rejection) => {
                warn!(error = %rejection.body_text(), "rejected path parameters");
                Err(ApiError::validation("Invalid path parameter"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_of(err: ApiError) -> (StatusCode, serde_json::Value) {
        let resp = err.into_response();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn store_failures_do_not_leak_detail() {
        let err: ApiError = StoreError::Backend(anyhow::anyhow!("relation \"users\" does not exist")).into();
        let (status, body) = body_of(err).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
        assert_eq!(body["message"], "internal server error");
    }

    #[tokio::test]
    async fn expired_and_invalid_tokens_look_the_same() {
        let (s1, b1) = body_of(TokenError::Expired.into()).await;
        let (s2, b2) = body_of(TokenError::Invalid("InvalidSignature".into()).into()).await;
        assert_eq!(s1, StatusCode::UNAUTHORIZED);
        assert_eq!(s1, s2);
        assert_eq!(b1, b2);
    }

    #[test]
    fn taxonomy_status_codes() {
        assert_eq!(ApiError::validation("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::from(StoreError::Duplicate).status(), StatusCode::CONFLICT);
        assert_eq!(ApiError::Forbidden("admin access required").status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::from(StoreError::NotFound).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::from(VerifyError::Upstream("timeout".into())).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::from(StoreError::Unavailable("pool".into())).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ApiError::ExternalSignInOnly.status(), StatusCode::UNAUTHORIZED);
    }
}
