use std::borrow::Cow;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::permissions::{Permission, invoices, organizations};

/// Role name carried in tokens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(Cow<'static, str>);

impl Role {
    pub const GOD: &'static str = "god";
    pub const HEXEKO_SUPER_ADMIN: &'static str = "hexeko_super_admin";
    pub const HEXEKO_ADMIN: &'static str = "hexeko_admin";
    pub const DIVISION_SUPER_ADMIN: &'static str = "division_super_admin";
    pub const DIVISION_ADMIN: &'static str = "division_admin";
    pub const FINANCER_SUPER_ADMIN: &'static str = "financer_super_admin";
    pub const FINANCER_ADMIN: &'static str = "financer_admin";
    pub const BENEFICIARY: &'static str = "beneficiary";

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Built-in role → permission mapping.
///
/// Roles form a ladder: each admin level inherits everything granted to the
/// level below it. Unknown roles grant nothing.
pub fn default_permissions(role: &Role) -> Vec<Permission> {
    let mut granted = BTreeSet::new();
    collect(role.as_str(), &mut granted);
    granted.into_iter().collect()
}

fn collect(role: &str, granted: &mut BTreeSet<Permission>) {
    match role {
        // "admin" is kept for tokens minted before the role ladder existed.
        Role::GOD | Role::HEXEKO_SUPER_ADMIN | "admin" => {
            granted.insert(Permission::WILDCARD);
        }
        Role::HEXEKO_ADMIN => {
            collect(Role::DIVISION_SUPER_ADMIN, granted);
            granted.extend([
                invoices::CREATE_DIVISION,
                invoices::UPDATE_DIVISION,
                invoices::DELETE_DIVISION,
                invoices::CONFIRM_DIVISION,
                invoices::MARK_SENT_DIVISION,
                invoices::MARK_PAID_DIVISION,
                invoices::GENERATE,
            ]);
        }
        Role::DIVISION_SUPER_ADMIN => collect(Role::DIVISION_ADMIN, granted),
        Role::DIVISION_ADMIN => {
            collect(Role::FINANCER_SUPER_ADMIN, granted);
            granted.extend([
                invoices::READ_DIVISION,
                invoices::MANAGE_ITEMS_DIVISION,
                invoices::CREATE_FINANCER,
                invoices::UPDATE_FINANCER,
                invoices::DELETE_FINANCER,
                invoices::CONFIRM_FINANCER,
                invoices::MARK_SENT_FINANCER,
                invoices::MARK_PAID_FINANCER,
                invoices::MANAGE_ITEMS_FINANCER,
                organizations::MANAGE,
            ]);
        }
        Role::FINANCER_SUPER_ADMIN => {
            collect(Role::FINANCER_ADMIN, granted);
            granted.insert(invoices::READ_FINANCER);
        }
        Role::FINANCER_ADMIN => {
            granted.insert(organizations::READ);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn has(role: &str, perm: &Permission) -> bool {
        default_permissions(&Role::new(role.to_string())).contains(perm)
    }

    #[test]
    fn division_admin_inherits_financer_ladder() {
        assert!(has(Role::DIVISION_ADMIN, &invoices::READ_DIVISION));
        assert!(has(Role::DIVISION_ADMIN, &invoices::READ_FINANCER));
        assert!(has(Role::DIVISION_ADMIN, &organizations::READ));
        assert!(!has(Role::DIVISION_ADMIN, &invoices::CREATE_DIVISION));
    }

    #[test]
    fn hexeko_admin_can_generate_and_issue_platform_invoices() {
        assert!(has(Role::HEXEKO_ADMIN, &invoices::GENERATE));
        assert!(has(Role::HEXEKO_ADMIN, &invoices::CONFIRM_DIVISION));
        assert!(has(Role::HEXEKO_ADMIN, &invoices::CONFIRM_FINANCER));
    }

    #[test]
    fn operators_get_the_wildcard() {
        assert_eq!(default_permissions(&Role::new(Role::GOD)), vec![Permission::WILDCARD]);
        assert_eq!(default_permissions(&Role::new("admin")), vec![Permission::WILDCARD]);
    }

    #[test]
    fn beneficiaries_and_unknown_roles_get_nothing() {
        assert!(default_permissions(&Role::new(Role::BENEFICIARY)).is_empty());
        assert!(default_permissions(&Role::new("viewer")).is_empty());
    }
}
