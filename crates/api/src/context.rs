use engage_auth::{AccessScope, Principal, PrincipalId, Role};
use engage_core::TenantId;

/// Tenant context for a request.
///
/// This is immutable and must be present for all domain routes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TenantContext {
    tenant_id: TenantId,
}

impl TenantContext {
    pub fn new(tenant_id: TenantId) -> Self {
        Self { tenant_id }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

/// Principal context for a request (authenticated identity, roles and the
/// organizations it administers).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrincipalContext {
    principal_id: PrincipalId,
    roles: Vec<Role>,
    scope: AccessScope,
}

impl PrincipalContext {
    pub fn new(principal_id: PrincipalId, roles: Vec<Role>, scope: AccessScope) -> Self {
        Self { principal_id, roles, scope }
    }

    pub fn principal_id(&self) -> PrincipalId {
        self.principal_id
    }

    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    pub fn scope(&self) -> &AccessScope {
        &self.scope
    }

    /// Resolve the principal inside the request's tenant, with the built-in
    /// role permissions.
    pub fn principal(&self, tenant: &TenantContext) -> Principal {
        Principal::from_roles(self.principal_id, tenant.tenant_id(), self.roles.clone(), self.scope.clone())
    }
}
