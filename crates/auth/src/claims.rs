use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use engage_core::{AggregateId, TenantId};

use crate::{AccessScope, PrincipalId, Role};

/// Claims carried by an Engage access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwtClaims {
    pub sub: PrincipalId,
    pub tenant_id: TenantId,
    pub roles: Vec<Role>,

    /// Divisions the principal administers.
    #[serde(default)]
    pub division_ids: Vec<AggregateId>,

    /// Financers the principal administers.
    #[serde(default)]
    pub financer_ids: Vec<AggregateId>,

    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl JwtClaims {
    pub fn access_scope(&self) -> AccessScope {
        AccessScope::new(self.division_ids.clone(), self.financer_ids.clone())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenValidationError {
    #[error("token has expired")]
    Expired,

    #[error("token not yet valid (issued_at is in the future)")]
    NotYetValid,

    #[error("invalid token time window (expires_at <= issued_at)")]
    InvalidTimeWindow,
}

/// Check the token time window against `now`.
pub fn validate_claims(claims: &JwtClaims, now: DateTime<Utc>) -> Result<(), TokenValidationError> {
    if claims.expires_at <= claims.issued_at {
        return Err(TokenValidationError::InvalidTimeWindow);
    }
    if now < claims.issued_at {
        return Err(TokenValidationError::NotYetValid);
    }
    if now >= claims.expires_at {
        return Err(TokenValidationError::Expired);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn claims(issued_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> JwtClaims {
        JwtClaims {
            sub: PrincipalId::new(),
            tenant_id: TenantId::new(),
            roles: vec![],
            division_ids: vec![],
            financer_ids: vec![],
            issued_at,
            expires_at,
        }
    }

    #[test]
    fn window_checks_run_in_order() {
        let now = Utc::now();
        assert_eq!(
            validate_claims(&claims(now, now), now),
            Err(TokenValidationError::InvalidTimeWindow)
        );
        assert_eq!(
            validate_claims(&claims(now + Duration::minutes(1), now + Duration::minutes(5)), now),
            Err(TokenValidationError::NotYetValid)
        );
        assert_eq!(
            validate_claims(&claims(now - Duration::minutes(5), now), now),
            Err(TokenValidationError::Expired)
        );
        assert!(validate_claims(&claims(now - Duration::minutes(1), now + Duration::minutes(1)), now).is_ok());
    }

    #[test]
    fn scope_fields_default_to_empty() {
        let json = serde_json::json!({
            "sub": PrincipalId::new(),
            "tenant_id": TenantId::new(),
            "roles": ["division_admin"],
            "issued_at": Utc::now(),
            "expires_at": Utc::now() + Duration::minutes(5),
        });
        let parsed: JwtClaims = serde_json::from_value(json).unwrap();
        assert!(parsed.access_scope().division_ids.is_empty());
    }
}
