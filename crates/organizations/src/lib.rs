//! Organizations domain module (event-sourced).
//!
//! Divisions resell the platform to financers (employers). A financer subscribes
//! to modules and enrolls beneficiaries; those facts drive monthly invoicing.
//! Pure domain logic: no IO, no HTTP, no storage.

pub mod division;
pub mod financer;
pub mod ids;

pub use division::{
    CreateDivision, Division, DivisionCommand, DivisionCreated, DivisionEvent,
    DivisionModulePriceSet, DivisionPricingUpdated, SetDivisionModulePrice, UpdateDivisionPricing,
};
pub use financer::{
    ActivateModule, BeneficiaryEnrolled, BeneficiaryMembership, BeneficiaryOffboarded,
    DeactivateModule, EnrollBeneficiary, Financer, FinancerCommand, FinancerContractUpdated,
    FinancerEvent, FinancerRegistered, ModuleActivated, ModuleDeactivated, ModuleSubscription,
    ModuleToggle, OffboardBeneficiary, RegisterFinancer, UpdateFinancerContract,
};
pub use ids::{DivisionId, FinancerId, ModuleId};
