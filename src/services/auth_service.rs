use argon2::{
    Argon2, PasswordHasher,
    password_hash::{PasswordHash, PasswordVerifier, SaltString},
};
use password_hash::rand_core::OsRng;

use crate::{
    audit::log_audit,
    dto::auth::{AuthResponse, LoginRequest, RegisterRequest},
    error::{AppError, AppResult},
    models::NewUser,
    response::ApiResponse,
    state::AppState,
    store::AuditEntry,
};

pub const DEFAULT_ROLE: &str = "user";
pub const MIN_PASSWORD_LEN: usize = 8;

pub fn hash_password(password: &str) -> AppResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::Internal(anyhow::anyhow!(e.to_string())))
}

pub fn verify_password(password: &str, stored_hash: &str) -> AppResult<bool> {
    let parsed_hash = PasswordHash::new(stored_hash)
        .map_err(|_| AppError::Internal(anyhow::anyhow!("Invalid password hash")))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

pub fn ensure_password_len(password: &str) -> AppResult<()> {
    if password.len() < MIN_PASSWORD_LEN {
        return Err(AppError::BadRequest(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

/// Lower-cases and trims `email`, rejecting values without an `@`.
pub fn normalize_email(email: &str) -> AppResult<String> {
    let email = email.trim().to_lowercase();
    if !email.contains('@') {
        return Err(AppError::BadRequest("A valid email is required".into()));
    }
    Ok(email)
}

pub async fn register_user(
    state: &AppState,
    payload: RegisterRequest,
) -> AppResult<ApiResponse<AuthResponse>> {
    let RegisterRequest {
        name,
        email,
        password,
    } = payload;
    let name = name.trim().to_string();
    if name.is_empty() {
        return Err(AppError::BadRequest("Name is required".into()));
    }
    let email = normalize_email(&email)?;
    ensure_password_len(&password)?;

    if state.users.find_by_email(&email).await?.is_some() {
        return Err(AppError::Conflict("Email is already taken".into()));
    }

    let user = state
        .users
        .create(NewUser {
            name,
            email,
            password_hash: hash_password(&password)?,
            role: DEFAULT_ROLE.to_string(),
        })
        .await
        .map_err(|err| match err {
            err if err.is_conflict() => AppError::Conflict("Email is already taken".into()),
            err => err.into(),
        })?;

    let token = state.tokens.issue(&user)?;

    log_audit(
        state.audit.as_ref(),
        AuditEntry::new("user_register", "users")
            .by(Some(user.id))
            .with_metadata(serde_json::json!({ "userId": user.id })),
    )
    .await;

    Ok(ApiResponse::ok("User created", AuthResponse { token, user }))
}

pub async fn login_user(
    state: &AppState,
    payload: LoginRequest,
) -> AppResult<ApiResponse<AuthResponse>> {
    let LoginRequest { email, password } = payload;
    let email = email.trim().to_lowercase();

    let user = state
        .users
        .find_by_email(&email)
        .await?
        .ok_or_else(|| AppError::BadRequest("Invalid email or password".into()))?;

    if !verify_password(&password, &user.password_hash)? {
        return Err(AppError::BadRequest("Invalid email or password".into()));
    }

    let token = state.tokens.issue(&user)?;

    log_audit(
        state.audit.as_ref(),
        AuditEntry::new("user_login", "users")
            .by(Some(user.id))
            .with_metadata(serde_json::json!({ "userId": user.id })),
    )
    .await;

    Ok(ApiResponse::ok("Logged in", AuthResponse { token, user }))
}
