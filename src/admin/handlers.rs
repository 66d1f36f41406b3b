use axum::{
    extract::State,
    routing::{delete, get, put},
    Json, Router,
};
use tracing::{info, instrument};
use uuid::Uuid;

use super::dto::{RoleUpdatedResponse, UpdateRoleRequest, UserListResponse, UserLoginsResponse};
use crate::{
    auth::{
        dto::OkResponse,
        extractors::AdminUser,
        repo_types::{Role, UserChanges},
    },
    error::{ApiError, ApiJson, ApiPath, ApiResult},
    state::AppState,
};

const ADMIN_HISTORY_LIMIT: i64 = 100;

pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/admin/users", get(list_users))
        .route("/admin/users/:id", delete(delete_user))
        .route("/admin/users/:id/role", put(update_role))
        .route("/admin/users/:id/logins", get(user_logins))
}

#[instrument(skip(state, admin), fields(admin_id = %admin.0.id))]
pub async fn list_users(
    State(state): State<AppState>,
    admin: AdminUser,
) -> ApiResult<Json<UserListResponse>> {
    let users = state.store.list_users().await?;
    Ok(Json(UserListResponse {
        success: true,
        users: users.into_iter().map(Into::into).collect(),
    }))
}

#[instrument(skip(state, admin, payload), fields(admin_id = %admin.0.id))]
pub async fn update_role(
    State(state): State<AppState>,
    admin: AdminUser,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(payload): ApiJson<UpdateRoleRequest>,
) -> ApiResult<Json<RoleUpdatedResponse>> {
    let role: Role = payload
        .role
        .parse()
        .map_err(|_| ApiError::validation("Invalid role. Must be user or admin"))?;

    let changes = UserChanges {
        role: Some(role),
        ..Default::default()
    };
    let user = state.store.update(id, changes).await?;
    info!(user_id = %user.id, %role, "role updated");
    Ok(Json(RoleUpdatedResponse {
        success: true,
        message: "User role updated successfully",
        user: user.into(),
    }))
}

#[instrument(skip(state, admin), fields(admin_id = %admin.0.id))]
pub async fn delete_user(
    State(state): State<AppState>,
    admin: AdminUser,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<OkResponse>> {
    if id == admin.0.id {
        return Err(ApiError::validation("Cannot delete your own account"));
    }
    state.store.delete(id).await?;
    info!(user_id = %id, "user deleted by admin");
    Ok(Json(OkResponse {
        success: true,
        message: "User deleted successfully",
    }))
}

#[instrument(skip(state, admin), fields(admin_id = %admin.0.id))]
pub async fn user_logins(
    State(state): State<AppState>,
    admin: AdminUser,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<UserLoginsResponse>> {
    state
        .store
        .find_by_id(id)
        .await?
        .ok_or(ApiError::NotFound("user"))?;
    let logins = state.store.login_history(id, ADMIN_HISTORY_LIMIT).await?;
    Ok(Json(UserLoginsResponse {
        success: true,
        logins,
    }))
}
