use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// Opaque permission name (`"read_invoice_division"`).
///
/// `"*"` is the wildcard granted to platform operators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(Cow<'static, str>);

impl Permission {
    pub const WILDCARD: Permission = Permission(Cow::Borrowed("*"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_wildcard(&self) -> bool {
        self.as_str() == "*"
    }
}

impl core::fmt::Display for Permission {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Invoice permissions, split by the side of the billing relationship.
///
/// `*_DIVISION` permissions cover invoices a division receives from the platform
/// (and read access to invoices it issues); `*_FINANCER` permissions cover the
/// invoices a division issues to its financers.
pub mod invoices {
    use super::Permission;

    pub const READ_DIVISION: Permission = Permission::from_static("read_invoice_division");
    pub const CREATE_DIVISION: Permission = Permission::from_static("create_invoice_division");
    pub const UPDATE_DIVISION: Permission = Permission::from_static("update_invoice_division");
    pub const DELETE_DIVISION: Permission = Permission::from_static("delete_invoice_division");
    pub const CONFIRM_DIVISION: Permission = Permission::from_static("confirm_invoice_division");
    pub const MARK_SENT_DIVISION: Permission = Permission::from_static("mark_invoice_sent_division");
    pub const MARK_PAID_DIVISION: Permission = Permission::from_static("mark_invoice_paid_division");
    pub const MANAGE_ITEMS_DIVISION: Permission =
        Permission::from_static("manage_invoice_items_division");

    pub const READ_FINANCER: Permission = Permission::from_static("read_invoice_financer");
    pub const CREATE_FINANCER: Permission = Permission::from_static("create_invoice_financer");
    pub const UPDATE_FINANCER: Permission = Permission::from_static("update_invoice_financer");
    pub const DELETE_FINANCER: Permission = Permission::from_static("delete_invoice_financer");
    pub const CONFIRM_FINANCER: Permission = Permission::from_static("confirm_invoice_financer");
    pub const MARK_SENT_FINANCER: Permission = Permission::from_static("mark_invoice_sent_financer");
    pub const MARK_PAID_FINANCER: Permission = Permission::from_static("mark_invoice_paid_financer");
    pub const MANAGE_ITEMS_FINANCER: Permission =
        Permission::from_static("manage_invoice_items_financer");

    /// Start monthly runs, inspect batches and the job queue.
    pub const GENERATE: Permission = Permission::from_static("generate_invoices");
}

pub mod organizations {
    use super::Permission;

    pub const READ: Permission = Permission::from_static("read_organizations");
    pub const MANAGE: Permission = Permission::from_static("manage_organizations");
}
