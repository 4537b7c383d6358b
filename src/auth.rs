use axum::http::{header::AUTHORIZATION, HeaderMap};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind as JwtErrorKind, Algorithm, DecodingKey, EncodingKey,
    Header, Validation,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::{AppError, AppResult, ErrorKind};

pub const TOKEN_ISSUER: &str = "video-fetch-api";
const DEFAULT_PERMISSION: &str = "download";

/// Decoded identity handed to the core. The core never looks at raw tokens.
#[derive(Debug, Clone, PartialEq)]
pub struct Principal {
    pub subject_id: String,
    pub email: String,
    pub permissions: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    user_id: String,
    email: String,
    #[serde(default)]
    permissions: Vec<String>,
    exp: i64,
    iat: i64,
    iss: String,
}

#[derive(Clone)]
pub struct JwtVerifier {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    expiry_hours: i64,
}

impl JwtVerifier {
    pub fn new(secret: &str, expiry_hours: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            expiry_hours,
        }
    }

    pub fn issue_token(
        &self,
        user_id: &str,
        email: &str,
        permissions: Option<Vec<String>>,
    ) -> AppResult<String> {
        let now = Utc::now();
        self.issue_token_at(user_id, email, permissions, now, now + Duration::hours(self.expiry_hours))
    }

    fn issue_token_at(
        &self,
        user_id: &str,
        email: &str,
        permissions: Option<Vec<String>>,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> AppResult<String> {
        let claims = Claims {
            user_id: user_id.to_string(),
            email: email.to_string(),
            permissions: permissions.unwrap_or_else(|| vec![DEFAULT_PERMISSION.to_string()]),
            exp: expires_at.timestamp(),
            iat: issued_at.timestamp(),
            iss: TOKEN_ISSUER.to_string(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key).map_err(
            |e| {
                AppError::new(ErrorKind::AuthFailed, "Failed to generate authentication token")
                    .with_detail("error", e.to_string())
            },
        )?;
        info!(user_id = %user_id, "Token generated");
        Ok(token)
    }

    pub fn verify_token(&self, token: &str) -> AppResult<Principal> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[TOKEN_ISSUER]);

        let data = decode::<Claims>(token, &self.decoding_key, &validation).map_err(|e| {
            match e.kind() {
                JwtErrorKind::ExpiredSignature => {
                    AppError::new(ErrorKind::TokenExpired, "Authentication token has expired")
                }
                _ => AppError::new(ErrorKind::InvalidToken, "Invalid authentication token")
                    .with_detail("error", e.to_string()),
            }
        })?;

        let claims = data.claims;
        Ok(Principal {
            subject_id: claims.user_id,
            email: claims.email,
            permissions: claims.permissions,
            expires_at: DateTime::from_timestamp(claims.exp, 0).unwrap_or_default(),
        })
    }
}

pub fn extract_bearer_token(headers: &HeaderMap) -> AppResult<String> {
    let Some(raw_header) = headers.get(AUTHORIZATION) else {
        return Err(auth_failed("Missing Authorization header"));
    };

    let Ok(value) = raw_header.to_str() else {
        return Err(auth_failed("Invalid Authorization header"));
    };

    let Some(token) = value.strip_prefix("Bearer ") else {
        return Err(auth_failed("Authorization must use Bearer token"));
    };

    let token = token.trim();
    if token.is_empty() {
        return Err(auth_failed("Empty bearer token"));
    }
    Ok(token.to_string())
}

pub fn authenticate(headers: &HeaderMap, verifier: &JwtVerifier) -> AppResult<Principal> {
    let token = extract_bearer_token(headers)?;
    verifier.verify_token(&token).inspect_err(|err| {
        warn!(kind = %err.kind, "Token validation failed");
    })
}

fn auth_failed(message: &str) -> AppError {
    AppError::new(ErrorKind::AuthFailed, message)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn verifier() -> JwtVerifier {
        JwtVerifier::new("test-secret", 24)
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).expect("header"),
        );
        headers
    }

    #[test]
    fn issued_token_round_trips_to_principal() {
        let v = verifier();
        let token = v.issue_token("user-1", "u1@example.com", None).expect("token");
        let principal = authenticate(&bearer(&token), &v).expect("principal");
        assert_eq!(principal.subject_id, "user-1");
        assert_eq!(principal.email, "u1@example.com");
        assert_eq!(principal.permissions, vec!["download".to_string()]);
        assert!(principal.expires_at > Utc::now());
    }

    #[test]
    fn missing_header_is_auth_failed() {
        let err = authenticate(&HeaderMap::new(), &verifier()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthFailed);
    }

    #[test]
    fn non_bearer_scheme_is_auth_failed() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        let err = authenticate(&headers, &verifier()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthFailed);
    }

    #[test]
    fn expired_token_is_token_expired() {
        let v = verifier();
        let issued = Utc::now() - Duration::hours(3);
        let token = v
            .issue_token_at("user-1", "u1@example.com", None, issued, issued + Duration::hours(1))
            .expect("token");
        let err = v.verify_token(&token).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TokenExpired);
    }

    #[test]
    fn foreign_signature_is_invalid_token() {
        let other = JwtVerifier::new("other-secret", 24);
        let token = other.issue_token("user-1", "u1@example.com", None).expect("token");
        let err = verifier().verify_token(&token).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidToken);

        let garbage = verifier().verify_token("not-a-jwt").unwrap_err();
        assert_eq!(garbage.kind, ErrorKind::InvalidToken);
    }
}
