//! Access and refresh token issuance and validation.
//!
//! Tokens are HS256-signed JWTs. Validation pins the algorithm, checks the
//! signature, expiry (no leeway), issuer and audience, then consults the
//! [`TokenRevocationStore`] and the token type. Scopes are only enforced on
//! access tokens.
//!
//! Refresh tokens are single use: rotating one revokes it together with the
//! access token it was issued alongside.

use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::revocation::TokenRevocationStore;

/// Audience claim on every token this server issues.
pub const TOKEN_AUDIENCE: &str = "authenticated";

/// Issuer claim on every token this server issues.
pub const TOKEN_ISSUER: &str = "voicehub";

/// Errors produced while issuing or validating tokens.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JwtError {
    /// The token's `exp` is in the past.
    #[error("token has expired")]
    Expired,

    /// Signature, structure or claims are invalid.
    #[error("invalid token: {0}")]
    Invalid(String),

    /// The token or its user has been revoked.
    #[error("token has been revoked")]
    Revoked,

    /// An access token was presented where a refresh token was expected or vice versa.
    #[error("expected {expected} token, got {found}")]
    WrongType {
        expected: TokenType,
        found: TokenType,
    },

    /// The access token lacks scopes required by the operation.
    #[error("missing required scopes: {}", .0.join(", "))]
    MissingScopes(Vec<String>),

    /// Signing failed.
    #[error("failed to encode token: {0}")]
    Encoding(String),
}

/// Token kind carried in the `type` claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

impl std::fmt::Display for TokenType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Access => f.write_str("access"),
            Self::Refresh => f.write_str("refresh"),
        }
    }
}

/// Claims carried by access and refresh tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User ID.
    pub sub: String,
    pub iat: i64,
    /// Issue time in milliseconds, checked against per-user revocation cutoffs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat_ms: Option<i64>,
    pub exp: i64,
    /// Token ID used for revocation. Tokens without one are rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    #[serde(rename = "type")]
    pub token_type: TokenType,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// On refresh tokens, the `jti` of the paired access token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_jti: Option<String>,
    pub iss: String,
    pub aud: String,
}

impl Claims {
    /// Returns the token ID, or an empty string when absent.
    pub fn jti(&self) -> &str {
        self.jti.as_deref().unwrap_or_default()
    }

    /// Issue time in milliseconds, falling back to the start of `iat`.
    pub fn issued_at_ms(&self) -> i64 {
        self.iat_ms.unwrap_or_else(|| self.iat.saturating_mul(1000))
    }

    /// Returns `true` if the scopes include `scope`.
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

/// Access/refresh token pair returned to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Access token lifetime in seconds.
    pub expires_in: u64,
    /// Refresh token lifetime in seconds.
    pub refresh_expires_in: u64,
}

/// Signing settings for [`JwtAuthManager`].
#[derive(Clone)]
pub struct JwtConfig {
    pub secret: String,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
}

impl std::fmt::Debug for JwtConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtConfig")
            .field("secret", &"<redacted>")
            .field("access_token_ttl", &self.access_token_ttl)
            .field("refresh_token_ttl", &self.refresh_token_ttl)
            .finish()
    }
}

/// Issues, validates, rotates and revokes tokens.
pub struct JwtAuthManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    access_ttl_secs: i64,
    refresh_ttl_secs: i64,
    revocations: TokenRevocationStore,
}

impl JwtAuthManager {
    /// Creates a manager that records revocations in `revocations`.
    pub fn new(config: JwtConfig, revocations: TokenRevocationStore) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[TOKEN_AUDIENCE]);
        validation.set_issuer(&[TOKEN_ISSUER]);
        validation.set_required_spec_claims(&["exp", "iat", "sub", "aud", "iss"]);
        validation.leeway = 0;

        Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
            access_ttl_secs: duration_secs(config.access_token_ttl),
            refresh_ttl_secs: duration_secs(config.refresh_token_ttl),
            revocations,
        }
    }

    /// The revocation store backing this manager.
    pub fn revocations(&self) -> &TokenRevocationStore {
        &self.revocations
    }

    /// Issues a new access/refresh token pair for `user_id`.
    ///
    /// The pair is always issued after any revocation cutoff already recorded
    /// for the user, so it survives a `logout_all` made a moment earlier.
    pub fn create_token_pair(&self, user_id: &str, scopes: &[String]) -> Result<TokenPair, JwtError> {
        let mut issued_ms = Utc::now().timestamp_millis();
        if let Some(cutoff) = self.revocations.user_cutoff(user_id) {
            issued_ms = issued_ms.max(cutoff.saturating_add(1));
        }
        let now = issued_ms.div_euclid(1000);
        let access_jti = Uuid::new_v4().to_string();

        let access = Claims {
            sub: user_id.to_string(),
            iat: now,
            iat_ms: Some(issued_ms),
            exp: now + self.access_ttl_secs,
            jti: Some(access_jti.clone()),
            token_type: TokenType::Access,
            scopes: scopes.to_vec(),
            access_jti: None,
            iss: TOKEN_ISSUER.to_string(),
            aud: TOKEN_AUDIENCE.to_string(),
        };

        let refresh = Claims {
            sub: user_id.to_string(),
            iat: now,
            iat_ms: Some(issued_ms),
            exp: now + self.refresh_ttl_secs,
            jti: Some(Uuid::new_v4().to_string()),
            token_type: TokenType::Refresh,
            scopes: Vec::new(),
            access_jti: Some(access_jti),
            iss: TOKEN_ISSUER.to_string(),
            aud: TOKEN_AUDIENCE.to_string(),
        };

        trace!(user_id = %user_id, scope_count = scopes.len(), "Issuing token pair");

        Ok(TokenPair {
            access_token: self.sign(&access)?,
            refresh_token: self.sign(&refresh)?,
            token_type: "bearer".to_string(),
            expires_in: self.access_ttl_secs.unsigned_abs(),
            refresh_expires_in: self.refresh_ttl_secs.unsigned_abs(),
        })
    }

    /// Validates a token and returns its claims.
    ///
    /// Checks, in order: signature/expiry/issuer/audience, presence of `jti`,
    /// revocation, token type, and (for access tokens) `required_scopes`.
    pub fn validate_token(
        &self,
        token: &str,
        required_scopes: &[&str],
        expected_type: TokenType,
    ) -> Result<Claims, JwtError> {
        let claims = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => JwtError::Expired,
                _ => JwtError::Invalid(e.to_string()),
            })?
            .claims;

        let jti = match claims.jti.as_deref() {
            Some(jti) if !jti.is_empty() => jti,
            _ => return Err(JwtError::Invalid("missing token id".to_string())),
        };

        if self
            .revocations
            .is_token_revoked(jti, &claims.sub, claims.issued_at_ms())
        {
            debug!(user_id = %claims.sub, "Rejected revoked token");
            return Err(JwtError::Revoked);
        }

        if claims.token_type != expected_type {
            return Err(JwtError::WrongType {
                expected: expected_type,
                found: claims.token_type,
            });
        }

        if claims.token_type == TokenType::Access {
            let missing: Vec<String> = required_scopes
                .iter()
                .filter(|scope| !claims.has_scope(scope))
                .map(|scope| scope.to_string())
                .collect();
            if !missing.is_empty() {
                return Err(JwtError::MissingScopes(missing));
            }
        }

        Ok(claims)
    }

    /// Validates a refresh token and rotates it into a new pair.
    pub fn refresh_token(&self, refresh_token: &str, scopes: &[String]) -> Result<TokenPair, JwtError> {
        let claims = self.validate_token(refresh_token, &[], TokenType::Refresh)?;
        self.rotate(&claims, scopes)
    }

    /// Revokes an already-validated refresh token and its paired access
    /// token, then issues a new pair.
    pub fn rotate(&self, refresh_claims: &Claims, scopes: &[String]) -> Result<TokenPair, JwtError> {
        if refresh_claims.token_type != TokenType::Refresh {
            return Err(JwtError::WrongType {
                expected: TokenType::Refresh,
                found: refresh_claims.token_type,
            });
        }

        self.revocations
            .revoke_token(refresh_claims.jti(), Some(refresh_claims.exp));

        if let Some(access_jti) = refresh_claims.access_jti.as_deref() {
            self.revocations
                .revoke_token(access_jti, Some(refresh_claims.iat + self.access_ttl_secs));
        }

        debug!(user_id = %refresh_claims.sub, "Refresh token rotated");
        self.create_token_pair(&refresh_claims.sub, scopes)
    }

    /// Revokes a token given its encoded form.
    ///
    /// The signature is not verified: revoking a forged token is harmless.
    /// Returns `false` if the token cannot be decoded or has no `jti`.
    pub fn revoke_token(&self, token: &str) -> bool {
        match decode_unverified(token) {
            Ok(claims) => match claims.jti {
                Some(jti) => self.revocations.revoke_token(&jti, claims.exp),
                None => false,
            },
            Err(_) => false,
        }
    }

    /// Revokes a token by its ID.
    pub fn revoke_jti(&self, jti: &str, expires_at: Option<i64>) -> bool {
        self.revocations.revoke_token(jti, expires_at)
    }

    /// Revokes every token issued to `user_id` so far.
    pub fn revoke_all_for_user(&self, user_id: &str) -> bool {
        self.revocations.revoke_all_user_tokens(user_id)
    }

    /// Drops revocations for tokens that have expired.
    pub fn cleanup_expired_tokens(&self) -> usize {
        self.revocations.cleanup_expired_tokens()
    }

    /// Returns `true` if the token is expired or cannot be decoded.
    pub fn is_token_expired(&self, token: &str) -> bool {
        match decode_unverified(token) {
            Ok(UnverifiedClaims { exp: Some(exp), .. }) => exp < Utc::now().timestamp(),
            _ => true,
        }
    }

    fn sign(&self, claims: &Claims) -> Result<String, JwtError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| JwtError::Encoding(e.to_string()))
    }
}

impl std::fmt::Debug for JwtAuthManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtAuthManager")
            .field("access_ttl_secs", &self.access_ttl_secs)
            .field("refresh_ttl_secs", &self.refresh_ttl_secs)
            .field("revocations", &self.revocations)
            .finish_non_exhaustive()
    }
}

/// Subset of claims readable without verifying the signature.
#[derive(Debug, Deserialize)]
struct UnverifiedClaims {
    jti: Option<String>,
    exp: Option<i64>,
}

fn decode_unverified(token: &str) -> Result<UnverifiedClaims, jsonwebtoken::errors::Error> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    decode::<UnverifiedClaims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map(|data| data.claims)
}

fn duration_secs(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}
