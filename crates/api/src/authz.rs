//! API-side authorization guard for commands.
//!
//! This enforces authorization at the command boundary (before dispatch),
//! while keeping domain aggregates and infra auth-agnostic. Invoice rules that
//! also depend on the invoice itself live in `engage_invoicing::policy`.

use engage_auth::{AuthzError, CommandAuthorization, authorize};

use crate::context::{PrincipalContext, TenantContext};

/// Check authorization for a command in the current request context.
///
/// This is intended to be called **before** dispatching a command.
pub fn authorize_command<C: CommandAuthorization>(
    tenant: &TenantContext,
    principal: &PrincipalContext,
    command: &C,
) -> Result<(), AuthzError> {
    let principal = principal.principal(tenant);

    for perm in command.required_permissions() {
        authorize(&principal, perm)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use engage_auth::permissions::organizations;
    use engage_auth::{AccessScope, PrincipalId, Role};
    use engage_core::TenantId;

    use crate::app::routes::common::CmdAuth;

    fn ctx(role: &'static str) -> (TenantContext, PrincipalContext) {
        (
            TenantContext::new(TenantId::new()),
            PrincipalContext::new(PrincipalId::new(), vec![Role::new(role)], AccessScope::default()),
        )
    }

    #[test]
    fn role_permissions_gate_commands() {
        let cmd = CmdAuth { inner: (), required: vec![organizations::MANAGE] };

        let (tenant, admin) = ctx(Role::DIVISION_ADMIN);
        assert!(authorize_command(&tenant, &admin, &cmd).is_ok());

        let (tenant, reader) = ctx(Role::FINANCER_ADMIN);
        assert_eq!(
            authorize_command(&tenant, &reader, &cmd),
            Err(AuthzError::Forbidden("manage_organizations".into()))
        );
    }
}
