use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::types::Actor;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Operator identifier, recorded as the actor on migration records
    pub sub: String,
    pub role: Option<String>,
    pub exp: i64,
    pub iat: i64,
}

impl Claims {
    pub fn new(sub: impl Into<String>, role: Option<String>, expiry_hours: u64) -> Self {
        let now = Utc::now();
        let exp = (now + Duration::hours(expiry_hours as i64)).timestamp();

        Self {
            sub: sub.into(),
            role,
            exp,
            iat: now.timestamp(),
        }
    }
}

impl From<Claims> for Actor {
    fn from(claims: Claims) -> Self {
        Actor {
            id: Some(claims.sub),
            role: claims.role,
        }
    }
}

#[derive(Debug)]
pub enum JwtError {
    TokenGeneration(String),
    InvalidToken(String),
    InvalidSecret,
}

impl std::fmt::Display for JwtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JwtError::TokenGeneration(msg) => write!(f, "JWT generation error: {}", msg),
            JwtError::InvalidToken(msg) => write!(f, "Invalid JWT token: {}", msg),
            JwtError::InvalidSecret => write!(f, "JWT secret not configured"),
        }
    }
}

impl std::error::Error for JwtError {}

pub fn generate_jwt(claims: &Claims, secret: &str) -> Result<String, JwtError> {
    if secret.is_empty() {
        return Err(JwtError::InvalidSecret);
    }

    let encoding_key = EncodingKey::from_secret(secret.as_bytes());
    let header = Header::default();

    encode(&header, claims, &encoding_key).map_err(|e| JwtError::TokenGeneration(e.to_string()))
}

pub fn validate_jwt(token: &str, secret: &str) -> Result<Claims, JwtError> {
    if secret.is_empty() {
        return Err(JwtError::InvalidSecret);
    }

    let decoding_key = DecodingKey::from_secret(secret.as_bytes());
    let validation = Validation::default();

    let token_data = decode::<Claims>(token, &decoding_key, &validation)
        .map_err(|e| JwtError::InvalidToken(e.to_string()))?;

    Ok(token_data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trips_actor() {
        let claims = Claims::new("ops-1", Some("super_admin".into()), 1);
        let token = generate_jwt(&claims, "secret").unwrap();
        let actor: Actor = validate_jwt(&token, "secret").unwrap().into();
        assert_eq!(actor.id.as_deref(), Some("ops-1"));
        assert_eq!(actor.role.as_deref(), Some("super_admin"));
    }

    #[test]
    fn wrong_secret_and_empty_secret_are_rejected() {
        let token = generate_jwt(&Claims::new("ops-1", None, 1), "secret").unwrap();
        assert!(matches!(validate_jwt(&token, "other"), Err(JwtError::InvalidToken(_))));
        assert!(matches!(validate_jwt(&token, ""), Err(JwtError::InvalidSecret)));
    }
}
