//! Account lifecycle: registration, login, token refresh and password reset.
//!
//! Supabase Auth owns credentials. After Supabase accepts them this service
//! issues its own access/refresh pair through [`JwtAuthManager`]; Supabase
//! sessions are not handed to clients.
//!
//! Login and password reset attempts are limited per client IP with the
//! `auth` limit. Only failed logins count against it, and a successful login
//! clears the counter.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::{Result, ServerError};
use crate::jwt::{Claims, JwtAuthManager, TokenPair, TokenType};
use crate::rate_limit::{LimitType, RateLimitResult, RateLimiter};
use crate::supabase::{SupabaseClient, SupabaseError};
use crate::types::{User, UserRole, UserStatus};
use crate::validation::{validate_email, validate_password, validate_text};

const USERS: &str = "users";
const MAX_FULL_NAME_LEN: usize = 100;

/// Profile and tokens returned by register and login.
#[derive(Debug, Clone, Serialize)]
pub struct AuthResponse {
    pub user: User,
    pub tokens: TokenPair,
}

#[derive(Debug, Clone)]
pub struct AuthService {
    supabase: Arc<SupabaseClient>,
    jwt: Arc<JwtAuthManager>,
    rate_limiter: RateLimiter,
}

impl AuthService {
    pub fn new(
        supabase: Arc<SupabaseClient>,
        jwt: Arc<JwtAuthManager>,
        rate_limiter: RateLimiter,
    ) -> Self {
        Self {
            supabase,
            jwt,
            rate_limiter,
        }
    }

    /// Creates an account and signs it in.
    ///
    /// The Supabase auth user and the `users` profile row share an ID. New
    /// accounts always get the `user` role.
    pub async fn register(
        &self,
        email: &str,
        password: &str,
        full_name: &str,
        ip: &str,
    ) -> Result<AuthResponse> {
        self.check_auth_limit(ip, false).await?;

        let email = validate_email(email)?;
        validate_password(password, Some(&email))?;
        let full_name = validate_text(full_name, 1, MAX_FULL_NAME_LEN, "full_name")?;

        let auth_user = self
            .supabase
            .sign_up(
                &email,
                password,
                &json!({ "full_name": full_name, "role": UserRole::User.as_str() }),
            )
            .await
            .map_err(sign_up_error)?;

        let user: User = self
            .supabase
            .from(USERS)
            .insert(json!({
                "id": auth_user.id,
                "email": email,
                "full_name": full_name,
                "role": UserRole::User.as_str(),
                "status": UserStatus::Active.as_str(),
            }))
            .execute_one()
            .await?
            .ok_or_else(|| ServerError::internal("user insert returned no row"))?;

        self.rate_limiter
            .check_ip_rate_limit(ip, LimitType::Auth, true)
            .await;

        let tokens = self.jwt.create_token_pair(&user.id, &user.role.scopes())?;
        info!(user_id = %user.id, "User registered");

        Ok(AuthResponse { user, tokens })
    }

    /// Verifies credentials with Supabase and issues a token pair.
    pub async fn login(&self, email: &str, password: &str, ip: &str) -> Result<AuthResponse> {
        self.check_auth_limit(ip, false).await?;

        let email = validate_email(email)?;
        if password.is_empty() {
            return Err(ServerError::validation("password is required"));
        }

        let session = match self.supabase.sign_in_with_password(&email, password).await {
            Ok(session) => session,
            Err(SupabaseError::Unauthorized) => {
                self.rate_limiter
                    .check_ip_rate_limit(ip, LimitType::Auth, true)
                    .await;
                debug!("Login failed");
                return Err(ServerError::auth("invalid email or password"));
            }
            Err(e) => return Err(e.into()),
        };

        self.rate_limiter
            .reset_ip_limits(ip, Some(LimitType::Auth))
            .await;

        // Only our own tokens are used from here on.
        if let Err(e) = self.supabase.sign_out(&session.access_token).await {
            warn!(error = %e, "Failed to close Supabase session");
        }

        let user = self.load_user(&session.user.id).await?;
        if user.status == UserStatus::Disabled {
            info!(user_id = %user.id, "Login refused for disabled user");
            return Err(ServerError::forbidden("account is disabled"));
        }

        let tokens = self.jwt.create_token_pair(&user.id, &user.role.scopes())?;
        info!(user_id = %user.id, "User logged in");

        Ok(AuthResponse { user, tokens })
    }

    /// Rotates a refresh token.
    ///
    /// Role and status are read again so that scope changes take effect on
    /// the next refresh. A disabled user loses every outstanding token.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let claims = self
            .jwt
            .validate_token(refresh_token, &[], TokenType::Refresh)?;

        let user = self
            .find_user(&claims.sub)
            .await?
            .ok_or_else(|| ServerError::auth("user no longer exists"))?;

        if user.status == UserStatus::Disabled {
            self.jwt.revoke_all_for_user(&user.id);
            return Err(ServerError::forbidden("account is disabled"));
        }

        Ok(self.jwt.rotate(&claims, &user.role.scopes())?)
    }

    /// Revokes the caller's access token and, if given, their refresh token.
    ///
    /// A refresh token belonging to someone else, or one that doesn't
    /// validate, is ignored.
    pub async fn logout(&self, access_claims: &Claims, refresh_token: Option<&str>) -> Result<()> {
        self.jwt
            .revoke_jti(access_claims.jti(), Some(access_claims.exp));

        if let Some(token) = refresh_token {
            match self.jwt.validate_token(token, &[], TokenType::Refresh) {
                Ok(refresh) if refresh.sub == access_claims.sub => {
                    self.jwt.revoke_jti(refresh.jti(), Some(refresh.exp));
                }
                Ok(_) => warn!(user_id = %access_claims.sub, "Ignoring foreign refresh token on logout"),
                Err(e) => debug!(error = %e, "Ignoring invalid refresh token on logout"),
            }
        }

        info!(user_id = %access_claims.sub, "User logged out");
        Ok(())
    }

    /// Revokes every token issued to the user so far.
    pub async fn logout_all(&self, user_id: &str) -> Result<()> {
        self.jwt.revoke_all_for_user(user_id);
        info!(user_id = %user_id, "All sessions revoked");
        Ok(())
    }

    pub async fn current_user(&self, user_id: &str) -> Result<User> {
        self.load_user(user_id).await
    }

    /// Starts a password reset.
    ///
    /// Answers the same whether or not the address belongs to an account.
    pub async fn request_password_reset(&self, email: &str, ip: &str) -> Result<()> {
        self.check_auth_limit(ip, true).await?;
        let email = validate_email(email)?;

        if let Err(e) = self.supabase.recover_password(&email).await {
            warn!(error = %e, "Password recovery request failed");
        }

        Ok(())
    }

    /// Completes a password reset with the recovery token from the e-mail.
    ///
    /// All tokens issued before the reset are revoked.
    pub async fn confirm_password_reset(&self, recovery_token: &str, new_password: &str) -> Result<()> {
        let auth_user = self
            .supabase
            .get_user(recovery_token)
            .await
            .map_err(|e| match e {
                SupabaseError::Unauthorized => ServerError::auth("invalid or expired reset token"),
                other => other.into(),
            })?;

        validate_password(new_password, auth_user.email.as_deref())?;

        self.supabase
            .update_password(recovery_token, new_password)
            .await
            .map_err(|e| match e {
                SupabaseError::Rejected { message, .. } => ServerError::validation(message),
                other => other.into(),
            })?;

        self.jwt.revoke_all_for_user(&auth_user.id);
        info!(user_id = %auth_user.id, "Password reset completed");
        Ok(())
    }

    async fn check_auth_limit(&self, ip: &str, increment: bool) -> Result<()> {
        match self
            .rate_limiter
            .check_ip_rate_limit(ip, LimitType::Auth, increment)
            .await
        {
            RateLimitResult::Allowed(_) => Ok(()),
            RateLimitResult::Limited {
                retry_after_secs, ..
            } => Err(ServerError::rate_limit(
                LimitType::Auth.as_str(),
                retry_after_secs,
            )),
        }
    }

    async fn find_user(&self, user_id: &str) -> Result<Option<User>> {
        Ok(self
            .supabase
            .from(USERS)
            .eq("id", user_id)
            .limit(1)
            .execute_one()
            .await?)
    }

    async fn load_user(&self, user_id: &str) -> Result<User> {
        self.find_user(user_id)
            .await?
            .ok_or_else(|| ServerError::not_found("user"))
    }
}

/// Supabase reports duplicate addresses and weak passwords as 400/422.
fn sign_up_error(err: SupabaseError) -> ServerError {
    match err {
        SupabaseError::Rejected {
            status: 400 | 422,
            message,
        } => {
            if message.to_ascii_lowercase().contains("already") {
                ServerError::conflict("email is already registered")
            } else {
                ServerError::validation(message)
            }
        }
        other => other.into(),
    }
}
