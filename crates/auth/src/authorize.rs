use thiserror::Error;

use engage_core::TenantId;

use crate::{AccessScope, Permission, PrincipalId, TenantMembership, default_permissions};

/// A principal resolved for one request: identity, tenant membership, scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub principal_id: PrincipalId,
    pub active_tenant_id: TenantId,
    pub membership: TenantMembership,
    pub scope: AccessScope,
}

impl Principal {
    /// Build a principal whose permissions come from the built-in role ladder.
    pub fn from_roles(
        principal_id: PrincipalId,
        tenant_id: TenantId,
        roles: Vec<crate::Role>,
        scope: AccessScope,
    ) -> Self {
        let mut permissions: Vec<Permission> = roles.iter().flat_map(default_permissions).collect();
        permissions.sort();
        permissions.dedup();

        Self {
            principal_id,
            active_tenant_id: tenant_id,
            membership: TenantMembership { tenant_id, roles, permissions },
            scope,
        }
    }

    pub fn has_permission(&self, permission: &Permission) -> bool {
        authorize(self, permission).is_ok()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("tenant mismatch")]
    TenantMismatch,

    #[error("forbidden: missing permission '{0}'")]
    Forbidden(String),

    #[error("forbidden: {0}")]
    OutOfScope(String),
}

/// Permissions a command needs before it may be dispatched.
pub trait CommandAuthorization {
    fn required_permissions(&self) -> &[Permission];
}

/// Pure RBAC check inside the principal's active tenant.
pub fn authorize(principal: &Principal, required: &Permission) -> Result<(), AuthzError> {
    if principal.active_tenant_id != principal.membership.tenant_id {
        return Err(AuthzError::TenantMismatch);
    }

    let granted = principal
        .membership
        .permissions
        .iter()
        .any(|p| p.is_wildcard() || p == required);

    if granted {
        Ok(())
    } else {
        Err(AuthzError::Forbidden(required.as_str().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Role;
    use crate::permissions::invoices;

    fn principal(roles: &[&'static str]) -> Principal {
        Principal::from_roles(
            PrincipalId::new(),
            TenantId::new(),
            roles.iter().map(|r| Role::new(*r)).collect(),
            AccessScope::default(),
        )
    }

    #[test]
    fn wildcard_grants_everything() {
        let p = principal(&[Role::GOD]);
        assert!(authorize(&p, &invoices::MARK_PAID_DIVISION).is_ok());
    }

    #[test]
    fn missing_permission_is_forbidden() {
        let p = principal(&[Role::FINANCER_SUPER_ADMIN]);
        assert_eq!(
            authorize(&p, &invoices::CONFIRM_FINANCER),
            Err(AuthzError::Forbidden("confirm_invoice_financer".into()))
        );
    }

    #[test]
    fn foreign_tenant_membership_is_rejected() {
        let mut p = principal(&[Role::GOD]);
        p.active_tenant_id = TenantId::new();
        assert_eq!(authorize(&p, &invoices::READ_DIVISION), Err(AuthzError::TenantMismatch));
    }

    #[test]
    fn permissions_from_several_roles_are_merged() {
        let p = principal(&[Role::FINANCER_ADMIN, Role::FINANCER_SUPER_ADMIN]);
        let names: Vec<&str> = p.membership.permissions.iter().map(|p| p.as_str()).collect();
        assert_eq!(names, vec!["read_invoice_financer", "read_organizations"]);
    }
}
