use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::AuthConfig;

/// Token validity in seconds.
pub const TOKEN_TTL_SECS: i64 = 2 * 60 * 60;

/// Allowed clock skew in seconds.
pub const LEEWAY_SECS: u64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

/// Checks the single configured identity and issues HS256 bearer tokens.
#[derive(Clone)]
pub struct Authenticator {
    user: String,
    password: String,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl Authenticator {
    pub fn new(config: &AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = LEEWAY_SECS;

        Self {
            user: config.user.clone(),
            password: config.password.clone(),
            encoding_key: EncodingKey::from_secret(config.jwt_secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            validation,
        }
    }

    #[tracing::instrument(name = "Authenticator::login", skip_all, fields(username = %username))]
    pub fn login(&self, username: &str, password: &str) -> Result<String, AuthError> {
        if username != self.user || password != self.password {
            warn!("rejected login");
            return Err(AuthError::InvalidCredentials);
        }

        let token = self.issue(username, Utc::now())?;

        info!("issued token");

        Ok(token)
    }

    /// Signs a token for `subject` as if issued at `issued_at`.
    pub fn issue(&self, subject: &str, issued_at: DateTime<Utc>) -> Result<String, AuthError> {
        let claims = Claims {
            sub: subject.to_owned(),
            iat: issued_at.timestamp(),
            exp: (issued_at + Duration::seconds(TOKEN_TTL_SECS)).timestamp(),
        };

        Ok(encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &self.encoding_key,
        )?)
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)?;

        Ok(data.claims)
    }
}
