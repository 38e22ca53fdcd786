use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::users::{ChangePasswordRequest, ResetPasswordRequest, UpdateProfileRequest, UserList},
    error::{AppError, AppResult},
    middleware::auth::{AuthUser, ensure_admin},
    models::{User, UserChanges},
    response::{ApiResponse, Meta},
    routes::params::Pagination,
    services::auth_service::{ensure_password_len, hash_password, normalize_email, verify_password},
    state::AppState,
    store::{AuditEntry, StoreError, UserFilter},
};

pub async fn get_profile(state: &AppState, user: &AuthUser) -> AppResult<ApiResponse<User>> {
    let profile = state
        .users
        .find_by_id(user.user_id)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(ApiResponse::ok("Profile", profile))
}

pub async fn update_profile(
    state: &AppState,
    user: &AuthUser,
    payload: UpdateProfileRequest,
) -> AppResult<ApiResponse<User>> {
    let name = match payload.name {
        Some(name) if name.trim().is_empty() => {
            return Err(AppError::BadRequest("Name must not be empty".into()));
        }
        Some(name) => Some(name.trim().to_string()),
        None => None,
    };
    let email = payload.email.as_deref().map(normalize_email).transpose()?;

    let changes = UserChanges {
        name,
        email,
        password_hash: None,
    };
    let updated = apply_changes(state, user.user_id, changes).await?;

    log_audit(
        state.audit.as_ref(),
        AuditEntry::new("user_update", "users")
            .by(Some(user.user_id))
            .with_metadata(serde_json::json!({ "userId": user.user_id })),
    )
    .await;

    Ok(ApiResponse::ok("Profile updated", updated))
}

pub async fn change_password(
    state: &AppState,
    user: &AuthUser,
    payload: ChangePasswordRequest,
) -> AppResult<ApiResponse<serde_json::Value>> {
    let current = state
        .users
        .find_by_id(user.user_id)
        .await?
        .ok_or(AppError::NotFound)?;
    if !verify_password(&payload.current_password, &current.password_hash)? {
        return Err(AppError::BadRequest("Current password is incorrect".into()));
    }
    ensure_password_len(&payload.new_password)?;

    let changes = UserChanges {
        password_hash: Some(hash_password(&payload.new_password)?),
        ..Default::default()
    };
    apply_changes(state, user.user_id, changes).await?;

    log_audit(
        state.audit.as_ref(),
        AuditEntry::new("user_password_change", "users")
            .by(Some(user.user_id))
            .with_metadata(serde_json::json!({ "userId": user.user_id })),
    )
    .await;

    Ok(ApiResponse::ok("Password changed", serde_json::json!({})))
}

pub async fn list_users(
    state: &AppState,
    user: &AuthUser,
    pagination: Pagination,
) -> AppResult<ApiResponse<UserList>> {
    ensure_admin(user)?;
    let (page, limit, offset) = pagination.normalize();
    let filter = UserFilter {
        limit: limit as u64,
        offset: offset as u64,
    };

    let (items, total) = state.users.list(&filter).await?;
    Ok(ApiResponse::paged(
        "Users",
        UserList { items },
        Meta::paged(page, limit, total),
    ))
}

/// Admins read any account; everyone else only their own.
pub async fn get_user(state: &AppState, user: &AuthUser, id: Uuid) -> AppResult<ApiResponse<User>> {
    ensure_self_or_admin(user, id)?;
    let found = state.users.find_by_id(id).await?.ok_or(AppError::NotFound)?;
    Ok(ApiResponse::ok("User", found))
}

pub async fn reset_password(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    payload: ResetPasswordRequest,
) -> AppResult<ApiResponse<serde_json::Value>> {
    ensure_admin(user)?;
    ensure_password_len(&payload.new_password)?;

    let changes = UserChanges {
        password_hash: Some(hash_password(&payload.new_password)?),
        ..Default::default()
    };
    apply_changes(state, id, changes).await?;

    log_audit(
        state.audit.as_ref(),
        AuditEntry::new("user_password_reset", "users")
            .by(Some(user.user_id))
            .with_metadata(serde_json::json!({ "userId": id })),
    )
    .await;

    Ok(ApiResponse::ok("Password reset", serde_json::json!({})))
}

pub async fn delete_user(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<serde_json::Value>> {
    ensure_self_or_admin(user, id)?;
    if !state.users.delete(id).await? {
        return Err(AppError::NotFound);
    }

    // The acting account may be the one just deleted.
    let actor = (user.user_id != id).then_some(user.user_id);
    log_audit(
        state.audit.as_ref(),
        AuditEntry::new("user_delete", "users")
            .by(actor)
            .with_metadata(serde_json::json!({ "userId": id })),
    )
    .await;

    Ok(ApiResponse::ok("Deleted", serde_json::json!({})))
}

fn ensure_self_or_admin(user: &AuthUser, id: Uuid) -> AppResult<()> {
    if user.user_id != id && !user.is_admin() {
        return Err(AppError::Forbidden);
    }
    Ok(())
}

async fn apply_changes(state: &AppState, id: Uuid, changes: UserChanges) -> AppResult<User> {
    state
        .users
        .update(id, changes)
        .await
        .map_err(|err| match err {
            StoreError::Conflict(_) => AppError::Conflict("Email is already taken".into()),
            err => err.into(),
        })?
        .ok_or(AppError::NotFound)
}
