//! Invoice access policy.
//!
//! RBAC decides *what* a principal may do; the access scope decides *which*
//! invoices. Platform→division invoices are governed by the `*_division`
//! permissions and the recipient division; division→financer invoices by the
//! `*_financer` permissions and the issuing division.

use serde::{Deserialize, Serialize};

use engage_auth::permissions::invoices;
use engage_auth::{AuthzError, Permission, Principal};
use engage_core::AggregateId;

use crate::invoice::{Invoice, InvoiceParty, InvoiceStatus};
use crate::numbering::InvoiceType;

/// What the policy needs to know about an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceAccessFacts {
    pub invoice_type: InvoiceType,
    pub issuer_division: Option<AggregateId>,
    pub recipient_id: AggregateId,
}

impl InvoiceAccessFacts {
    /// `None` for an invoice that was never issued (or was deleted).
    pub fn of(invoice: &Invoice) -> Option<Self> {
        if !invoice.exists() {
            return None;
        }
        let issuer_division = match invoice.issuer() {
            InvoiceParty::Division(id) => Some(id.0),
            _ => None,
        };
        Some(Self {
            invoice_type: invoice.invoice_type(),
            issuer_division,
            recipient_id: invoice.recipient().aggregate_id()?,
        })
    }

    /// The division whose scope governs this invoice.
    pub fn governing_division(&self) -> Option<AggregateId> {
        match self.invoice_type {
            InvoiceType::HexekoToDivision => Some(self.recipient_id),
            InvoiceType::DivisionToFinancer => self.issuer_division,
        }
    }
}

fn forbidden(permission: &Permission) -> AuthzError {
    AuthzError::Forbidden(permission.as_str().to_string())
}

fn require(principal: &Principal, permission: &Permission) -> Result<(), AuthzError> {
    engage_auth::authorize(principal, permission)
}

/// Wildcard holders are platform operators and are not bound to a scope.
fn unscoped(principal: &Principal) -> bool {
    principal.membership.permissions.iter().any(Permission::is_wildcard)
}

fn division_in_scope(principal: &Principal, division_id: Option<AggregateId>) -> Result<(), AuthzError> {
    if unscoped(principal) {
        return Ok(());
    }
    match division_id {
        Some(id) if principal.scope.covers_division(&id) => Ok(()),
        Some(id) => Err(AuthzError::OutOfScope(format!("division {id} is outside the principal's scope"))),
        None => Err(AuthzError::OutOfScope("invoice has no issuing division".into())),
    }
}

pub fn view_any(principal: &Principal) -> Result<(), AuthzError> {
    if principal.has_permission(&invoices::READ_DIVISION) || principal.has_permission(&invoices::READ_FINANCER) {
        return Ok(());
    }
    Err(forbidden(&invoices::READ_DIVISION))
}

pub fn view(principal: &Principal, facts: &InvoiceAccessFacts) -> Result<(), AuthzError> {
    if principal.has_permission(&invoices::READ_DIVISION) {
        return division_in_scope(principal, facts.governing_division());
    }

    if principal.has_permission(&invoices::READ_FINANCER) {
        if facts.invoice_type == InvoiceType::DivisionToFinancer
            && principal.scope.covers_financer(&facts.recipient_id)
        {
            return Ok(());
        }
        return Err(AuthzError::OutOfScope(format!(
            "invoice recipient {} is outside the principal's scope",
            facts.recipient_id
        )));
    }

    Err(forbidden(&invoices::READ_DIVISION))
}

pub fn create(principal: &Principal, invoice_type: InvoiceType) -> Result<(), AuthzError> {
    match invoice_type {
        InvoiceType::HexekoToDivision => require(principal, &invoices::CREATE_DIVISION),
        InvoiceType::DivisionToFinancer => require(principal, &invoices::CREATE_FINANCER),
    }
}

fn can_manage(
    principal: &Principal,
    facts: &InvoiceAccessFacts,
    division_permission: &Permission,
    financer_permission: &Permission,
) -> Result<(), AuthzError> {
    let permission = match facts.invoice_type {
        InvoiceType::HexekoToDivision => division_permission,
        InvoiceType::DivisionToFinancer => financer_permission,
    };
    require(principal, permission)?;
    division_in_scope(principal, facts.governing_division())
}

pub fn update(principal: &Principal, facts: &InvoiceAccessFacts) -> Result<(), AuthzError> {
    can_manage(principal, facts, &invoices::UPDATE_DIVISION, &invoices::UPDATE_FINANCER)
}

pub fn delete(principal: &Principal, facts: &InvoiceAccessFacts) -> Result<(), AuthzError> {
    can_manage(principal, facts, &invoices::DELETE_DIVISION, &invoices::DELETE_FINANCER)
}

pub fn confirm(principal: &Principal, facts: &InvoiceAccessFacts) -> Result<(), AuthzError> {
    can_manage(principal, facts, &invoices::CONFIRM_DIVISION, &invoices::CONFIRM_FINANCER)
}

pub fn mark_sent(principal: &Principal, facts: &InvoiceAccessFacts) -> Result<(), AuthzError> {
    can_manage(principal, facts, &invoices::MARK_SENT_DIVISION, &invoices::MARK_SENT_FINANCER)
}

pub fn mark_paid(principal: &Principal, facts: &InvoiceAccessFacts) -> Result<(), AuthzError> {
    can_manage(principal, facts, &invoices::MARK_PAID_DIVISION, &invoices::MARK_PAID_FINANCER)
}

pub fn manage_items(principal: &Principal, facts: &InvoiceAccessFacts) -> Result<(), AuthzError> {
    can_manage(principal, facts, &invoices::MANAGE_ITEMS_DIVISION, &invoices::MANAGE_ITEMS_FINANCER)
}

/// Division ledgers are readable by anyone who may read platform invoices
/// for that division.
pub fn view_division_balance(principal: &Principal, division_id: AggregateId) -> Result<(), AuthzError> {
    require(principal, &invoices::READ_DIVISION)?;
    division_in_scope(principal, Some(division_id))
}

pub fn view_financer_balance(
    principal: &Principal,
    financer_id: AggregateId,
    division_id: Option<AggregateId>,
) -> Result<(), AuthzError> {
    if principal.has_permission(&invoices::READ_DIVISION) {
        return division_in_scope(principal, division_id);
    }
    require(principal, &invoices::READ_FINANCER)?;
    if principal.scope.covers_financer(&financer_id) {
        return Ok(());
    }
    Err(AuthzError::OutOfScope(format!("financer {financer_id} is outside the principal's scope")))
}

/// All-or-nothing check for a bulk status change. `None` marks an invoice that
/// does not exist.
pub fn bulk_update_status(
    principal: &Principal,
    target: InvoiceStatus,
    invoices: &[Option<InvoiceAccessFacts>],
) -> Result<(), AuthzError> {
    let check: fn(&Principal, &InvoiceAccessFacts) -> Result<(), AuthzError> = match target {
        InvoiceStatus::Confirmed => confirm,
        InvoiceStatus::Sent => mark_sent,
        InvoiceStatus::Paid => mark_paid,
        InvoiceStatus::Cancelled => delete,
        other => {
            return Err(AuthzError::OutOfScope(format!(
                "bulk transition to '{}' is not allowed",
                other.as_str()
            )));
        }
    };

    for facts in invoices {
        match facts {
            Some(facts) => check(principal, facts)?,
            None => return Err(AuthzError::OutOfScope("unknown invoice in bulk request".into())),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use engage_auth::{AccessScope, PrincipalId, Role};
    use engage_core::TenantId;

    fn principal(role: &'static str, divisions: &[AggregateId], financers: &[AggregateId]) -> Principal {
        Principal::from_roles(
            PrincipalId::new(),
            TenantId::new(),
            vec![Role::new(role)],
            AccessScope::new(divisions.to_vec(), financers.to_vec()),
        )
    }

    fn platform_invoice(division: AggregateId) -> InvoiceAccessFacts {
        InvoiceAccessFacts { invoice_type: InvoiceType::HexekoToDivision, issuer_division: None, recipient_id: division }
    }

    fn financer_invoice(division: AggregateId, financer: AggregateId) -> InvoiceAccessFacts {
        InvoiceAccessFacts {
            invoice_type: InvoiceType::DivisionToFinancer,
            issuer_division: Some(division),
            recipient_id: financer,
        }
    }

    #[test]
    fn division_reader_sees_both_sides_of_its_division_only() {
        let (division, other) = (AggregateId::new(), AggregateId::new());
        let p = principal(Role::DIVISION_ADMIN, &[division], &[]);

        assert!(view(&p, &platform_invoice(division)).is_ok());
        assert!(view(&p, &financer_invoice(division, AggregateId::new())).is_ok());
        assert!(matches!(view(&p, &platform_invoice(other)), Err(AuthzError::OutOfScope(_))));
    }

    #[test]
    fn financer_reader_sees_only_invoices_it_received() {
        let (division, financer) = (AggregateId::new(), AggregateId::new());
        let p = principal(Role::FINANCER_SUPER_ADMIN, &[], &[financer]);

        assert!(view_any(&p).is_ok());
        assert!(view(&p, &financer_invoice(division, financer)).is_ok());
        assert!(view(&p, &financer_invoice(division, AggregateId::new())).is_err());
        assert!(view(&p, &platform_invoice(division)).is_err());
    }

    #[test]
    fn no_read_permission_denies_listing() {
        let p = principal(Role::BENEFICIARY, &[], &[]);
        assert!(matches!(view_any(&p), Err(AuthzError::Forbidden(_))));
    }

    #[test]
    fn create_depends_on_invoice_type() {
        let p = principal(Role::DIVISION_ADMIN, &[], &[]);
        assert!(create(&p, InvoiceType::DivisionToFinancer).is_ok());
        assert_eq!(
            create(&p, InvoiceType::HexekoToDivision),
            Err(AuthzError::Forbidden("create_invoice_division".into()))
        );
    }

    #[test]
    fn managing_requires_permission_and_issuer_scope() {
        let division = AggregateId::new();
        let facts = financer_invoice(division, AggregateId::new());

        assert!(confirm(&principal(Role::DIVISION_ADMIN, &[division], &[]), &facts).is_ok());
        assert!(confirm(&principal(Role::DIVISION_ADMIN, &[], &[]), &facts).is_err());
        assert!(confirm(&principal(Role::FINANCER_SUPER_ADMIN, &[division], &[]), &facts).is_err());
        assert!(confirm(&principal(Role::DIVISION_ADMIN, &[division], &[]), &platform_invoice(division)).is_err());
    }

    #[test]
    fn bulk_rejects_whole_request_on_one_failure() {
        let division = AggregateId::new();
        let p = principal(Role::DIVISION_ADMIN, &[division], &[]);
        let ok = Some(financer_invoice(division, AggregateId::new()));
        let foreign = Some(financer_invoice(AggregateId::new(), AggregateId::new()));

        assert!(bulk_update_status(&p, InvoiceStatus::Sent, &[ok, ok]).is_ok());
        assert!(bulk_update_status(&p, InvoiceStatus::Sent, &[ok, foreign]).is_err());
        assert!(bulk_update_status(&p, InvoiceStatus::Paid, &[ok, None]).is_err());
        assert!(bulk_update_status(&p, InvoiceStatus::Draft, &[ok]).is_err());
    }

    #[test]
    fn balances_follow_read_scope() {
        let (division, financer) = (AggregateId::new(), AggregateId::new());
        let admin = principal(Role::DIVISION_ADMIN, &[division], &[]);
        let financer_admin = principal(Role::FINANCER_SUPER_ADMIN, &[], &[financer]);

        assert!(view_division_balance(&admin, division).is_ok());
        assert!(view_division_balance(&admin, AggregateId::new()).is_err());
        assert!(view_financer_balance(&admin, financer, Some(division)).is_ok());
        assert!(view_financer_balance(&admin, financer, None).is_err());

        assert!(view_division_balance(&financer_admin, division).is_err());
        assert!(view_financer_balance(&financer_admin, financer, Some(division)).is_ok());
        assert!(view_financer_balance(&financer_admin, AggregateId::new(), Some(division)).is_err());
    }

    #[test]
    fn wildcard_is_not_bound_to_a_scope() {
        let division = AggregateId::new();
        let god = principal(Role::GOD, &[], &[]);
        assert!(create(&god, InvoiceType::HexekoToDivision).is_ok());
        assert!(mark_paid(&god, &platform_invoice(division)).is_ok());
        assert!(view(&god, &financer_invoice(division, AggregateId::new())).is_ok());
    }
}
