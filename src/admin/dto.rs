use serde::{Deserialize, Serialize};

use crate::auth::{dto::PublicUser, repo_types::LoginRecord};

#[derive(Debug, Deserialize)]
pub struct UpdateRoleRequest {
    #[serde(default)]
    pub role: String,
}

#[derive(Debug, Serialize)]
pub struct UserListResponse {
    pub success: bool,
    pub users: Vec<PublicUser>,
}

#[derive(Debug, Serialize)]
pub struct RoleUpdatedResponse {
    pub success: bool,
    pub message: &'static str,
    pub user: PublicUser,
}

#[derive(Debug, Serialize)]
pub struct UserLoginsResponse {
    pub success: bool,
    pub logins: Vec<LoginRecord>,
}
