//! `engage-core` — shared domain primitives for the Engage invoicing backend.
//!
//! Nothing in here touches storage, transport or clocks.

pub mod aggregate;
pub mod error;
pub mod id;
pub mod value_object;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, TenantId, UserId};
pub use value_object::{ValueObject, VatRate};
