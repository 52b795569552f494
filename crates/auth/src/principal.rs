use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use engage_core::{AggregateId, TenantId};

/// Authenticated identity (admin user or service account).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrincipalId(Uuid);

impl PrincipalId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for PrincipalId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for PrincipalId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for PrincipalId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::from_str(s).map(Self)
    }
}

/// Roles and permissions granted to a principal inside one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantMembership {
    pub tenant_id: TenantId,
    pub roles: Vec<crate::Role>,
    pub permissions: Vec<crate::Permission>,
}

/// Organizations a principal may act on, on top of its permissions.
///
/// Division ids scope access to platform→division invoices and to the invoices
/// those divisions issue; financer ids scope read access to invoices received.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessScope {
    #[serde(default)]
    pub division_ids: Vec<AggregateId>,
    #[serde(default)]
    pub financer_ids: Vec<AggregateId>,
}

impl AccessScope {
    pub fn new(division_ids: Vec<AggregateId>, financer_ids: Vec<AggregateId>) -> Self {
        Self { division_ids, financer_ids }
    }

    pub fn covers_division(&self, division_id: &AggregateId) -> bool {
        self.division_ids.contains(division_id)
    }

    pub fn covers_financer(&self, financer_id: &AggregateId) -> bool {
        self.financer_ids.contains(financer_id)
    }
}
