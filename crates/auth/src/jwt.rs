//! Bearer token verification.

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use thiserror::Error;

use crate::claims::{JwtClaims, TokenValidationError, validate_claims};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JwtError {
    #[error("token rejected: {0}")]
    Decode(String),

    #[error(transparent)]
    Claims(#[from] TokenValidationError),
}

/// Turns a raw bearer token into verified claims.
pub trait JwtValidator: Send + Sync {
    fn validate(&self, token: &str, now: DateTime<Utc>) -> Result<JwtClaims, JwtError>;
}

/// HMAC-SHA256 validator with a shared secret.
///
/// Our claims carry their own `issued_at`/`expires_at` window, so the registered
/// `exp` claim is not required; the window is checked by [`validate_claims`].
pub struct Hs256JwtValidator {
    key: DecodingKey,
    validation: Validation,
}

impl Hs256JwtValidator {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.required_spec_claims.clear();

        Self { key: DecodingKey::from_secret(secret.as_ref()), validation }
    }
}

impl JwtValidator for Hs256JwtValidator {
    fn validate(&self, token: &str, now: DateTime<Utc>) -> Result<JwtClaims, JwtError> {
        let data = decode::<JwtClaims>(token, &self.key, &self.validation)
            .map_err(|e| JwtError::Decode(e.to_string()))?;
        validate_claims(&data.claims, now)?;
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use engage_core::TenantId;
    use jsonwebtoken::{EncodingKey, Header, encode};

    use super::*;
    use crate::{PrincipalId, Role};

    fn mint(secret: &[u8], claims: &JwtClaims) -> String {
        encode(&Header::new(Algorithm::HS256), claims, &EncodingKey::from_secret(secret)).unwrap()
    }

    fn claims(expires_in: Duration) -> JwtClaims {
        let now = Utc::now();
        JwtClaims {
            sub: PrincipalId::new(),
            tenant_id: TenantId::new(),
            roles: vec![Role::new(Role::DIVISION_ADMIN)],
            division_ids: vec![],
            financer_ids: vec![],
            issued_at: now - Duration::seconds(5),
            expires_at: now + expires_in,
        }
    }

    #[test]
    fn accepts_token_signed_with_same_secret() {
        let c = claims(Duration::minutes(10));
        let token = mint(b"s3cret", &c);
        let validated = Hs256JwtValidator::new("s3cret").validate(&token, Utc::now()).unwrap();
        assert_eq!(validated, c);
    }

    #[test]
    fn rejects_wrong_signature() {
        let token = mint(b"other", &claims(Duration::minutes(10)));
        let err = Hs256JwtValidator::new("s3cret").validate(&token, Utc::now()).unwrap_err();
        assert!(matches!(err, JwtError::Decode(_)));
    }

    #[test]
    fn rejects_expired_window() {
        let c = claims(Duration::minutes(1));
        let token = mint(b"s3cret", &c);
        let later = Utc::now() + Duration::minutes(2);
        let err = Hs256JwtValidator::new("s3cret").validate(&token, later).unwrap_err();
        assert_eq!(err, JwtError::Claims(TokenValidationError::Expired));
    }
}
