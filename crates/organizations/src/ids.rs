use serde::{Deserialize, Serialize};

use engage_core::AggregateId;

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub AggregateId);

        impl $name {
            pub fn new(id: AggregateId) -> Self {
                Self(id)
            }

            pub fn generate() -> Self {
                Self(AggregateId::new())
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<$name> for AggregateId {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

typed_id!(
    /// Division identifier (the reseller that invoices financers).
    DivisionId
);

typed_id!(
    /// Financer identifier (the employer that pays per beneficiary).
    FinancerId
);

typed_id!(
    /// Platform module identifier. Modules are referenced, not event-sourced here.
    ModuleId
);
