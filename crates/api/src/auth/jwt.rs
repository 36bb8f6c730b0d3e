//! Verification of user bearer tokens.
//!
//! Users arrive with HS256 JWTs minted by the platform's identity service.
//! This server only checks signature and expiry and reads the caller's id
//! and role from the payload. [`mint_user_token`] signs with the same secret
//! for local tooling and the test suites.

use atelier_core::types::DbId;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Role assumed when a token carries none.
pub const DEFAULT_ROLE: &str = "user";

fn default_role() -> String {
    DEFAULT_ROLE.to_string()
}

/// The part of an identity-service token this server reads.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UserClaims {
    /// The caller's user id.
    pub sub: DbId,
    /// Role name; `moderator` and `admin` bypass ownership checks.
    #[serde(default = "default_role")]
    pub role: String,
    pub exp: i64,
}

#[derive(Debug, Clone)]
pub struct JwtConfig {
    /// Secret shared with the identity service.
    pub secret: String,
    /// Clock skew tolerated on `exp`, in seconds.
    pub leeway_secs: u64,
}

const DEFAULT_LEEWAY_SECS: u64 = 30;

impl JwtConfig {
    /// Read `JWT_SECRET` (required) and `JWT_LEEWAY_SECS` (default `30`).
    ///
    /// # Panics
    ///
    /// Panics if `JWT_SECRET` is unset or empty, or the leeway does not parse.
    pub fn from_env() -> Self {
        let secret =
            std::env::var("JWT_SECRET").expect("JWT_SECRET must be set in the environment");
        assert!(!secret.is_empty(), "JWT_SECRET must not be empty");

        let leeway_secs: u64 = std::env::var("JWT_LEEWAY_SECS")
            .unwrap_or_else(|_| DEFAULT_LEEWAY_SECS.to_string())
            .parse()
            .expect("JWT_LEEWAY_SECS must be a valid u64");

        Self {
            secret,
            leeway_secs,
        }
    }
}

/// Check an `Authorization: Bearer` token and return its claims.
///
/// Only HS256 is accepted, and `sub` and `exp` must both be present.
pub fn verify_user_token(
    token: &str,
    config: &JwtConfig,
) -> Result<UserClaims, jsonwebtoken::errors::Error> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = config.leeway_secs;
    validation.set_required_spec_claims(&["exp", "sub"]);

    decode::<UserClaims>(
        token,
        &DecodingKey::from_secret(config.secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
}

/// Sign a token for `user_id` that expires after `ttl`.
pub fn mint_user_token(
    user_id: DbId,
    role: &str,
    ttl: chrono::Duration,
    config: &JwtConfig,
) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = UserClaims {
        sub: user_id,
        role: role.to_string(),
        exp: (chrono::Utc::now() + ttl).timestamp(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(config.secret.as_bytes()),
    )
}
