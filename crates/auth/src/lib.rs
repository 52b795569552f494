//! `engage-auth` — authentication and RBAC boundary.
//!
//! No HTTP, no storage: the API layer feeds it tokens and gets principals back.

pub mod authorize;
pub mod claims;
pub mod jwt;
pub mod permissions;
pub mod principal;
pub mod roles;

pub use authorize::{AuthzError, CommandAuthorization, Principal, authorize};
pub use claims::{JwtClaims, TokenValidationError, validate_claims};
pub use jwt::{Hs256JwtValidator, JwtError, JwtValidator};
pub use permissions::Permission;
pub use principal::{AccessScope, PrincipalId, TenantMembership};
pub use roles::{Role, default_permissions};
