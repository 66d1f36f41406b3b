use axum::{
    extract::State,
    http::StatusCode,
    routing::{delete, get, post, put},
    Json, Router,
};
use tracing::{info, instrument};

use crate::{
    auth::{
        dto::{
            AuthResponse, ChangePasswordRequest, GoogleSignInRequest, LoginHistoryResponse,
            LoginRequest, OkResponse, RegisterRequest, UpdateProfileRequest, UserResponse,
        },
        extractors::{AuthUser, ClientAddr},
        services,
    },
    error::{ApiError, ApiJson, ApiResult},
    state::AppState,
};

const HISTORY_LIMIT: i64 = 20;

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/google-signin", post(google_signin))
        .route("/auth/logout", post(logout))
}

pub fn me_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/me", get(get_me))
        .route("/auth/update-profile", put(update_profile))
        .route("/auth/change-password", put(change_password))
        .route("/auth/login-history", get(login_history))
        .route("/auth/delete-account", delete(delete_account))
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<AuthResponse>)> {
    let user = services::register(
        state.store.as_ref(),
        &payload.name,
        &payload.email,
        &payload.password,
    )
    .await?;
    let token = services::issue_session(&state.keys, &user)?;
    Ok((
        StatusCode::CREATED,
        Json(AuthResponse {
            success: true,
            token,
            user: user.into(),
        }),
    ))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    ClientAddr(ip): ClientAddr,
    ApiJson(payload): ApiJson<LoginRequest>,
) -> ApiResult<Json<AuthResponse>> {
    let user =
        services::login_with_password(state.store.as_ref(), &payload.email, &payload.password, &ip)
            .await?;
    let token = services::issue_session(&state.keys, &user)?;
    Ok(Json(AuthResponse {
        success: true,
        token,
        user: user.into(),
    }))
}

#[instrument(skip(state, payload))]
pub async fn google_signin(
    State(state): State<AppState>,
    ClientAddr(ip): ClientAddr,
    ApiJson(payload): ApiJson<GoogleSignInRequest>,
) -> ApiResult<Json<AuthResponse>> {
    if payload.external_token.trim().is_empty() {
        return Err(ApiError::validation("ID token is required"));
    }
    let identity = state
        .identity
        .verify(payload.external_token.trim(), &state.config.google.client_id)
        .await?;
    let user = services::sign_in_with_google(
        state.store.as_ref(),
        &state.config.admin_emails,
        &identity,
        &ip,
    )
    .await?;
    let token = services::issue_session(&state.keys, &user)?;
    Ok(Json(AuthResponse {
        success: true,
        token,
        user: user.into(),
    }))
}

/// Tokens are stateless; the client drops its copy.
pub async fn logout() -> Json<OkResponse> {
    Json(OkResponse {
        success: true,
        message: "Logged out successfully",
    })
}

#[instrument(skip(state))]
pub async fn get_me(
    State(state): State<AppState>,
    AuthUser(subject): AuthUser,
) -> ApiResult<Json<UserResponse>> {
    let user = state
        .store
        .find_by_id(subject.user_id)
        .await?
        .ok_or(ApiError::NotFound("user"))?;
    Ok(Json(UserResponse {
        success: true,
        user: user.into(),
    }))
}

#[instrument(skip(state, payload))]
pub async fn update_profile(
    State(state): State<AppState>,
    AuthUser(subject): AuthUser,
    ApiJson(payload): ApiJson<UpdateProfileRequest>,
) -> ApiResult<Json<UserResponse>> {
    let user = services::update_profile(
        state.store.as_ref(),
        subject.user_id,
        payload.name.as_deref(),
        payload.email.as_deref(),
    )
    .await?;
    Ok(Json(UserResponse {
        success: true,
        user: user.into(),
    }))
}

#[instrument(skip(state, payload))]
pub async fn change_password(
    State(state): State<AppState>,
    AuthUser(subject): AuthUser,
    ApiJson(payload): ApiJson<ChangePasswordRequest>,
) -> ApiResult<Json<UserResponse>> {
    let user = services::change_password(
        state.store.as_ref(),
        subject.user_id,
        payload.current_password.as_deref(),
        &payload.new_password,
    )
    .await?;
    Ok(Json(UserResponse {
        success: true,
        user: user.into(),
    }))
}

#[instrument(skip(state))]
pub async fn login_history(
    State(state): State<AppState>,
    AuthUser(subject): AuthUser,
) -> ApiResult<Json<LoginHistoryResponse>> {
    let logins = state
        .store
        .login_history(subject.user_id, HISTORY_LIMIT)
        .await?;
    Ok(Json(LoginHistoryResponse {
        success: true,
        logins,
    }))
}

#[instrument(skip(state))]
pub async fn delete_account(
    State(state): State<AppState>,
    AuthUser(subject): AuthUser,
) -> ApiResult<Json<OkResponse>> {
    state.store.delete(subject.user_id).await?;
    info!(user_id = %subject.user_id, "account deleted");
    Ok(Json(OkResponse {
        success: true,
        message: "Account deleted successfully",
    }))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{header, Method, Request, StatusCode},
        Router,
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::{
        app::build_app,
        auth::repo_types::{Role, UserChanges},
        state::AppState,
        store::CredentialStore,
    };

    async fn call(app: &Router, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(t) = token {
            req = req.header(header::AUTHORIZATION, format!("Bearer {t}"));
        }
        let req = match body {
            Some(b) => req
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(b.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    fn setup(admins: &[&str]) -> (Router, AppState) {
        let (state, _memory) = AppState::fake(admins);
        (build_app(state.clone()), state)
    }

    async fn register_alice(app: &Router) -> (String, Value) {
        let (status, body) = call(
            app,
            Method::POST,
            "/auth/register",
            None,
            Some(json!({"name": "Alice", "email": "alice@example.com", "password": "password123"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        (body["token"].as_str().unwrap().to_string(), body["user"].clone())
    }

    #[tokio::test]
    async fn register_login_and_me() {
        let (app, state) = setup(&[]);
        let (_, user) = register_alice(&app).await;
        assert_eq!(user["role"], "user");
        assert!(user.get("password_hash").is_none());

        let (status, body) = call(
            &app,
            Method::POST,
            "/auth/login",
            None,
            Some(json!({"email": "alice@example.com", "password": "password123"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let token = body["token"].as_str().unwrap();
        let claims = state.keys.verify(token).unwrap();
        assert_eq!(claims.role, Role::User);
        assert_eq!(claims.email, "alice@example.com");

        let (status, me) = call(&app, Method::GET, "/auth/me", Some(token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(me["user"]["email"], "alice@example.com");
    }

    #[tokio::test]
    async fn client_cannot_pick_its_role() {
        let (app, _) = setup(&[]);
        let (status, body) = call(
            &app,
            Method::POST,
            "/auth/register",
            None,
            Some(json!({"name": "Eve", "email": "eve@example.com", "password": "password123", "role": "admin"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["user"]["role"], "user");
    }

    #[tokio::test]
    async fn register_errors() {
        let (app, _) = setup(&[]);
        register_alice(&app).await;
        let (status, body) = call(
            &app,
            Method::POST,
            "/auth/register",
            None,
            Some(json!({"name": "Alice", "email": "alice@example.com", "password": "password123"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);

        let (status, _) = call(
            &app,
            Method::POST,
            "/auth/register",
            None,
            Some(json!({"name": "Bob", "email": "bob@example.com", "password": "123"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, Method::POST, "/auth/register", None, Some(json!("nope"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn bad_credentials_are_generic() {
        let (app, _) = setup(&[]);
        register_alice(&app).await;
        let (s1, b1) = call(
            &app,
            Method::POST,
            "/auth/login",
            None,
            Some(json!({"email": "alice@example.com", "password": "wrong-pass"})),
        )
        .await;
        let (s2, b2) = call(
            &app,
            Method::POST,
            "/auth/login",
            None,
            Some(json!({"email": "nobody@example.com", "password": "wrong-pass"})),
        )
        .await;
        assert_eq!(s1, StatusCode::UNAUTHORIZED);
        assert_eq!(s2, StatusCode::UNAUTHORIZED);
        assert_eq!(b1["message"], b2["message"]);
    }

    #[tokio::test]
    async fn missing_or_bad_token_is_401() {
        let (app, _) = setup(&[]);
        let (status, _) = call(&app, Method::GET, "/auth/me", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = call(&app, Method::GET, "/auth/me", Some("abc.def.ghi"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn google_signin_flow() {
        let (app, state) = setup(&["boss@example.com"]);
        let (status, body) = call(
            &app,
            Method::POST,
            "/auth/google-signin",
            None,
            Some(json!({"externalToken": "fake:g-1:gina@example.com:Gina"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["user"]["role"], "user");
        let first_id = body["user"]["id"].clone();

        let (_, again) = call(
            &app,
            Method::POST,
            "/auth/google-signin",
            None,
            Some(json!({"idToken": "fake:g-1:gina@example.com:Gina B:pic"})),
        )
        .await;
        assert_eq!(again["user"]["id"], first_id);
        assert_eq!(again["user"]["name"], "Gina B");

        let (status, body) = call(
            &app,
            Method::POST,
            "/auth/google-signin",
            None,
            Some(json!({"externalToken": "fake:g-9:boss@example.com:Boss"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"]["role"], "admin");
        let token = body["token"].as_str().unwrap();
        assert_eq!(state.keys.verify(token).unwrap().role, Role::Admin);

        let (status, _) = call(
            &app,
            Method::POST,
            "/auth/login",
            None,
            Some(json!({"email": "gina@example.com", "password": "password123"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn google_signin_failures() {
        let (app, _) = setup(&[]);
        let (status, _) = call(
            &app,
            Method::POST,
            "/auth/google-signin",
            None,
            Some(json!({"externalToken": "forged"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = call(
            &app,
            Method::POST,
            "/auth/google-signin",
            None,
            Some(json!({"externalToken": "fake-upstream-down"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);

        let (status, _) = call(&app, Method::POST, "/auth/google-signin", None, Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn profile_update_and_duplicate_email() {
        let (app, _) = setup(&[]);
        let (token, _) = register_alice(&app).await;
        call(
            &app,
            Method::POST,
            "/auth/register",
            None,
            Some(json!({"name": "Bob", "email": "bob@example.com", "password": "password123"})),
        )
        .await;

        let (status, body) = call(
            &app,
            Method::PUT,
            "/auth/update-profile",
            Some(&token),
            Some(json!({"name": "Alice A.", "email": "bob@example.com"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");

        let (status, body) = call(
            &app,
            Method::PUT,
            "/auth/update-profile",
            Some(&token),
            Some(json!({"name": "Alice A."})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"]["name"], "Alice A.");
    }

    #[tokio::test]
    async fn delete_account_then_me_is_404() {
        let (app, state) = setup(&[]);
        let (token, user) = register_alice(&app).await;
        let id = user["id"].as_str().unwrap().parse().unwrap();
        call(
            &app,
            Method::POST,
            "/auth/login",
            None,
            Some(json!({"email": "alice@example.com", "password": "password123"})),
        )
        .await;
        assert_eq!(state.store.login_history(id, 10).await.unwrap().len(), 1);

        let (status, body) = call(&app, Method::DELETE, "/auth/delete-account", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert!(state.store.login_history(id, 10).await.unwrap().is_empty());

        let (status, _) = call(&app, Method::GET, "/auth/me", Some(&token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn login_history_lists_own_logins() {
        let (app, _) = setup(&[]);
        let (token, _) = register_alice(&app).await;
        call(
            &app,
            Method::POST,
            "/auth/login",
            None,
            Some(json!({"email": "alice@example.com", "password": "password123"})),
        )
        .await;
        let (status, body) = call(&app, Method::GET, "/auth/login-history", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["logins"].as_array().unwrap().len(), 1);
        assert_eq!(body["logins"][0]["ip_address"], "");
    }

    #[tokio::test]
    async fn demoted_admin_loses_access_with_same_token() {
        let (app, state) = setup(&["boss@example.com"]);
        let (_, body) = call(
            &app,
            Method::POST,
            "/auth/google-signin",
            None,
            Some(json!({"externalToken": "fake:g-9:boss@example.com:Boss"})),
        )
        .await;
        let token = body["token"].as_str().unwrap().to_string();
        let id = body["user"]["id"].as_str().unwrap().parse().unwrap();

        let (status, _) = call(&app, Method::GET, "/admin/users", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);

        state
            .store
            .update(id, UserChanges { role: Some(Role::User), ..Default::default() })
            .await
            .unwrap();
        assert!(state.keys.verify(&token).is_ok());
        let (status, _) = call(&app, Method::GET, "/admin/users", Some(&token), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
}
