use std::collections::HashSet;

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    claims::SessionSubject,
    google::ExternalIdentity,
    jwt::JwtKeys,
    password::{hash_password_blocking, verify_password_blocking},
    repo_types::{NewUser, Role, User, UserChanges},
};
use crate::error::{ApiError, ApiResult};
use crate::store::{CredentialStore, StoreError};

pub const MIN_PASSWORD_LEN: usize = 6;

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

pub(crate) fn normalize_email(email: &str) -> ApiResult<String> {
    let email = email.trim().to_lowercase();
    if !is_valid_email(&email) {
        return Err(ApiError::validation("Invalid email"));
    }
    Ok(email)
}

fn check_password(password: &str) -> ApiResult<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::validation(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters long"
        )));
    }
    Ok(())
}

fn check_name(name: &str) -> ApiResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ApiError::validation("Name is required"));
    }
    Ok(name.to_string())
}

pub fn issue_session(keys: &JwtKeys, user: &User) -> ApiResult<String> {
    Ok(keys.issue(user.id, &user.email, user.role)?)
}

/// Creates a password account. Role is always `user`; the store's unique
/// index is what rejects a taken email.
pub async fn register(
    store: &dyn CredentialStore,
    name: &str,
    email: &str,
    password: &str,
) -> ApiResult<User> {
    let name = check_name(name)?;
    let email = normalize_email(email)?;
    check_password(password)?;

    let hash = hash_password_blocking(password.to_string()).await?;
    match store.create(NewUser::with_password(&email, &name, hash)).await {
        Ok(user) => {
            info!(user_id = %user.id, email = %user.email, "user registered");
            Ok(user)
        }
        Err(StoreError::Duplicate) => {
            warn!(email = %email, "email already registered");
            Err(ApiError::DuplicateIdentity(
                "User already exists with this email".into(),
            ))
        }
        Err(e) => Err(e.into()),
    }
}

/// Password login. Failed attempts never touch `last_login`.
pub async fn login_with_password(
    store: &dyn CredentialStore,
    email: &str,
    password: &str,
    ip_address: &str,
) -> ApiResult<User> {
    let email = normalize_email(email)?;
    if password.is_empty() {
        return Err(ApiError::validation("Email and password are required"));
    }

    let Some(user) = store.find_by_email(&email).await? else {
        warn!(email = %email, "login unknown email");
        return Err(ApiError::Unauthenticated("Invalid email or password"));
    };

    let Some(hash) = user.password_hash.clone() else {
        warn!(user_id = %user.id, "password login on google-only account");
        return Err(ApiError::ExternalSignInOnly);
    };

    if !verify_password_blocking(password.to_string(), hash).await {
        warn!(user_id = %user.id, "login invalid password");
        return Err(ApiError::Unauthenticated("Invalid email or password"));
    }

    finish_login(store, user, ip_address).await
}

/// Maps a verified Google identity onto a local account, creating it on
/// first sign-in, then applies the admin allow-list and records the login.
pub async fn sign_in_with_google(
    store: &dyn CredentialStore,
    admin_emails: &HashSet<String>,
    identity: &ExternalIdentity,
    ip_address: &str,
) -> ApiResult<User> {
    let user = match resolve_google_user(store, identity).await? {
        Some(user) => user,
        None => {
            let new_user = NewUser::with_google(
                &identity.email,
                &identity.name,
                &identity.subject_id,
                identity.picture.clone(),
            );
            match store.create(new_user).await {
                Ok(user) => {
                    info!(user_id = %user.id, email = %user.email, "user created from google identity");
                    user
                }
                Err(StoreError::Duplicate) => {
                    // Lost a race with a concurrent first sign-in, or the email
                    // belongs to an account we may not link. One retry only.
                    debug!(sub = %identity.subject_id, "duplicate on create; retrying lookup");
                    resolve_google_user(store, identity).await?.ok_or_else(|| {
                        warn!(email = %identity.email, "google email already bound to another account");
                        ApiError::DuplicateIdentity(
                            "Email already registered with a different sign-in method".into(),
                        )
                    })?
                }
                Err(e) => return Err(e.into()),
            }
        }
    };

    let user = promote_if_listed(store, admin_emails, identity, user).await?;
    finish_login(store, user, ip_address).await
}

async fn resolve_google_user(
    store: &dyn CredentialStore,
    identity: &ExternalIdentity,
) -> ApiResult<Option<User>> {
    if let Some(user) = store.find_by_google_id(&identity.subject_id).await? {
        return sync_profile(store, user, identity).await.map(Some);
    }

    if !identity.email_verified {
        return Ok(None);
    }
    match store.find_by_email(&identity.email).await? {
        Some(existing) if existing.google_id.is_none() => {
            // Registration never proves mailbox ownership, so a password set
            // before the link may belong to someone else.
            let changes = UserChanges {
                google_id: Some(identity.subject_id.clone()),
                clear_password: existing.password_hash.is_some(),
                picture: existing
                    .picture
                    .is_none()
                    .then(|| identity.picture.clone())
                    .flatten(),
                ..Default::default()
            };
            let linked = store.update(existing.id, changes).await?;
            info!(
                user_id = %linked.id,
                password_cleared = existing.password_hash.is_some(),
                "google identity linked to existing account"
            );
            Ok(Some(linked))
        }
        _ => Ok(None),
    }
}

async fn sync_profile(
    store: &dyn CredentialStore,
    user: User,
    identity: &ExternalIdentity,
) -> ApiResult<User> {
    let changes = UserChanges {
        name: (user.name != identity.name).then(|| identity.name.clone()),
        picture: identity
            .picture
            .clone()
            .filter(|p| user.picture.as_deref() != Some(p.as_str())),
        ..Default::default()
    };
    if changes.is_empty() {
        return Ok(user);
    }
    debug!(user_id = %user.id, "syncing profile from google");
    Ok(store.update(user.id, changes).await?)
}

/// Upgrades the account when the provider-verified email is allow-listed.
/// The stored email is user-editable and never consulted. Never downgrades.
async fn promote_if_listed(
    store: &dyn CredentialStore,
    admin_emails: &HashSet<String>,
    identity: &ExternalIdentity,
    user: User,
) -> ApiResult<User> {
    if user.role == Role::Admin
        || !identity.email_verified
        || !admin_emails.contains(&identity.email.to_lowercase())
    {
        return Ok(user);
    }
    let changes = UserChanges {
        role: Some(Role::Admin),
        ..Default::default()
    };
    let promoted = store.update(user.id, changes).await?;
    info!(user_id = %promoted.id, email = %promoted.email, "allow-listed user promoted to admin");
    Ok(promoted)
}

async fn finish_login(store: &dyn CredentialStore, user: User, ip_address: &str) -> ApiResult<User> {
    store.record_login(user.id, ip_address).await?;
    let user = store.find_by_id(user.id).await?.unwrap_or(user);
    info!(user_id = %user.id, email = %user.email, "user logged in");
    Ok(user)
}

/// Loads the acting user and checks the stored role, not the token's.
pub async fn require_role(
    store: &dyn CredentialStore,
    subject: &SessionSubject,
    role: Role,
) -> ApiResult<User> {
    let Some(user) = store.find_by_id(subject.user_id).await? else {
        warn!(user_id = %subject.user_id, "token for missing user");
        return Err(ApiError::Unauthenticated("invalid token"));
    };
    if user.role != role {
        warn!(user_id = %user.id, have = %user.role, need = %role, "role check failed");
        return Err(ApiError::Forbidden(match role {
            Role::Admin => "Admin access required",
            Role::User => "User access required",
        }));
    }
    Ok(user)
}

pub async fn update_profile(
    store: &dyn CredentialStore,
    user_id: Uuid,
    name: Option<&str>,
    email: Option<&str>,
) -> ApiResult<User> {
    let changes = UserChanges {
        name: name.map(check_name).transpose()?,
        email: email.map(normalize_email).transpose()?,
        ..Default::default()
    };
    if changes.is_empty() {
        return Err(ApiError::validation("Nothing to update"));
    }
    match store.update(user_id, changes).await {
        Ok(user) => {
            info!(user_id = %user.id, "profile updated");
            Ok(user)
        }
        Err(StoreError::Duplicate) => Err(ApiError::validation("Email is already in use")),
        Err(e) => Err(e.into()),
    }
}

/// Sets a new password. Accounts that already have one must prove it first.
pub async fn change_password(
    store: &dyn CredentialStore,
    user_id: Uuid,
    current: Option<&str>,
    new_password: &str,
) -> ApiResult<User> {
    check_password(new_password)?;
    let user = store
        .find_by_id(user_id)
        .await?
        .ok_or(ApiError::NotFound("user"))?;

    if let Some(hash) = user.password_hash.clone() {
        let current = current.unwrap_or_default();
        if current.is_empty() || !verify_password_blocking(current.to_string(), hash).await {
            warn!(user_id = %user.id, "change password with wrong current password");
            return Err(ApiError::Unauthenticated("Invalid email or password"));
        }
    }

    let hash = hash_password_blocking(new_password.to_string()).await?;
    let changes = UserChanges {
        password_hash: Some(hash),
        ..Default::default()
    };
    let user = store.update(user.id, changes).await?;
    info!(user_id = %user.id, "password changed");
    Ok(user)
}
