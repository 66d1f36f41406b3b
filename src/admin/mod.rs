//! Admin-only user management. Every route extracts [`AdminUser`], which
//! re-reads the caller's role from the store.
//!
//! [`AdminUser`]: crate::auth::extractors::AdminUser

use crate::state::AppState;
use axum::Router;

mod dto;
pub mod handlers;

pub fn router() -> Router<AppState> {
    handlers::admin_routes()
}
