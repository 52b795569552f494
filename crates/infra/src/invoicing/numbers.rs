//! Invoice number allocation.

use std::collections::HashMap;
use std::sync::Mutex;

use engage_core::{DomainError, DomainResult, TenantId};
use engage_invoicing::{InvoiceNumber, InvoiceType};

/// Hands out `PREFIX-YYYY-NNNNNN` numbers, one monotonic counter per tenant,
/// invoice type and year. A number taken by an issue that is then rejected is
/// not handed out again, so the issued sequence can have holes.
///
/// Counters live in memory. After a restart call [`observe`](Self::observe)
/// with every known number (the invoices projection rebuild does this) so
/// allocation continues after the highest one.
#[derive(Debug, Default)]
pub struct InvoiceNumberAllocator {
    counters: Mutex<HashMap<(TenantId, InvoiceType, i32), u32>>,
}

impl InvoiceNumberAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, tenant_id: TenantId, invoice_type: InvoiceType, year: i32) -> DomainResult<InvoiceNumber> {
        let mut counters = self
            .counters
            .lock()
            .map_err(|_| DomainError::invariant("invoice number allocator lock poisoned"))?;
        let counter = counters.entry((tenant_id, invoice_type, year)).or_insert(0);
        let number = InvoiceNumber::next(invoice_type, year, *counter + 1)?;
        *counter += 1;
        Ok(number)
    }

    pub fn observe(&self, tenant_id: TenantId, invoice_type: InvoiceType, number: &InvoiceNumber) {
        let (Some(year), Some(sequence)) = (number.year(), number.sequence()) else {
            return;
        };
        if let Ok(mut counters) = self.counters.lock() {
            let counter = counters.entry((tenant_id, invoice_type, year)).or_insert(0);
            *counter = (*counter).max(sequence);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_are_per_tenant_type_and_year() {
        let numbers = InvoiceNumberAllocator::new();
        let (t1, t2) = (TenantId::new(), TenantId::new());

        let a = numbers.next(t1, InvoiceType::DivisionToFinancer, 2025).unwrap();
        let b = numbers.next(t1, InvoiceType::DivisionToFinancer, 2025).unwrap();
        assert_eq!(a.as_str(), "DIVISION_TO_FINANCER-2025-000001");
        assert_eq!(b.as_str(), "DIVISION_TO_FINANCER-2025-000002");

        assert_eq!(numbers.next(t2, InvoiceType::DivisionToFinancer, 2025).unwrap().sequence(), Some(1));
        assert_eq!(numbers.next(t1, InvoiceType::HexekoToDivision, 2025).unwrap().sequence(), Some(1));
        assert_eq!(numbers.next(t1, InvoiceType::DivisionToFinancer, 2026).unwrap().sequence(), Some(1));
    }

    #[test]
    fn observed_numbers_move_the_counter_forward_only() {
        let numbers = InvoiceNumberAllocator::new();
        let tenant = TenantId::new();
        let seen = InvoiceNumber::parse("HEXEKO_TO_DIVISION-2025-000041").unwrap();
        let older = InvoiceNumber::parse("HEXEKO_TO_DIVISION-2025-000003").unwrap();

        numbers.observe(tenant, InvoiceType::HexekoToDivision, &seen);
        numbers.observe(tenant, InvoiceType::HexekoToDivision, &older);

        let next = numbers.next(tenant, InvoiceType::HexekoToDivision, 2025).unwrap();
        assert_eq!(next.sequence(), Some(42));
    }

    #[test]
    fn a_number_is_never_handed_out_twice() {
        let numbers = InvoiceNumberAllocator::new();
        let tenant = TenantId::new();

        // The first number went to an issue that was rejected.
        let burned = numbers.next(tenant, InvoiceType::DivisionToFinancer, 2025).unwrap();
        let issued = numbers.next(tenant, InvoiceType::DivisionToFinancer, 2025).unwrap();
        assert_eq!((burned.sequence(), issued.sequence()), (Some(1), Some(2)));

        numbers.observe(tenant, InvoiceType::DivisionToFinancer, &issued);
        assert_eq!(numbers.next(tenant, InvoiceType::DivisionToFinancer, 2025).unwrap().sequence(), Some(3));
    }
}
