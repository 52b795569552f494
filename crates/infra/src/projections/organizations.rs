//! Organization directory: divisions and financers as the invoicing pipeline
//! and the API see them.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value as JsonValue;

use engage_core::{TenantId, UserId, VatRate};
use engage_events::EventEnvelope;
use engage_organizations::{
    BeneficiaryMembership, DivisionEvent, DivisionId, FinancerEvent, FinancerId, ModuleId,
    ModuleSubscription, ModuleToggle,
};

use super::cursor::{StreamCursors, decode, ensure_stream};
use super::{Projection, ProjectionError};
use crate::read_model::TenantStore;

pub const DIVISION_AGGREGATE_TYPE: &str = "organizations.division";
pub const FINANCER_AGGREGATE_TYPE: &str = "organizations.financer";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DivisionReadModel {
    pub division_id: DivisionId,
    pub name: String,
    pub country: String,
    pub currency: String,
    pub vat_rate: Option<VatRate>,
    pub core_package_price: Option<i64>,
    pub contract_start_date: Option<NaiveDate>,
    pub module_prices: BTreeMap<ModuleId, i64>,
    /// Filled at query time from the financer rows.
    pub financer_ids: Vec<FinancerId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinancerReadModel {
    pub financer_id: FinancerId,
    pub name: String,
    pub division_id: Option<DivisionId>,
    pub contract_start_date: Option<NaiveDate>,
    pub core_package_price: Option<i64>,
    pub modules: BTreeMap<ModuleId, ModuleSubscription>,
    pub beneficiaries: BTreeMap<UserId, BeneficiaryMembership>,
}

impl FinancerReadModel {
    fn new(financer_id: FinancerId) -> Self {
        Self {
            financer_id,
            name: String::new(),
            division_id: None,
            contract_start_date: None,
            core_package_price: None,
            modules: BTreeMap::new(),
            beneficiaries: BTreeMap::new(),
        }
    }

    pub fn active_module_count(&self) -> usize {
        self.modules.values().filter(|m| m.active).count()
    }

    /// Beneficiaries enrolled and not yet offboarded as of `on`.
    pub fn active_beneficiary_count(&self, on: NaiveDate) -> usize {
        self.beneficiaries.values().filter(|b| b.is_active_between(on, on)).count()
    }

    pub fn active_beneficiaries_between(&self, start: NaiveDate, end: NaiveDate) -> usize {
        self.beneficiaries.values().filter(|b| b.is_active_between(start, end)).count()
    }
}

/// Builds `DivisionReadModel` and `FinancerReadModel` rows from both
/// organization streams.
#[derive(Debug)]
pub struct OrganizationDirectoryProjection<D, F>
where
    D: TenantStore<DivisionId, DivisionReadModel>,
    F: TenantStore<FinancerId, FinancerReadModel>,
{
    divisions: D,
    financers: F,
    cursors: StreamCursors,
}

impl<D, F> OrganizationDirectoryProjection<D, F>
where
    D: TenantStore<DivisionId, DivisionReadModel>,
    F: TenantStore<FinancerId, FinancerReadModel>,
{
    pub fn new(divisions: D, financers: F) -> Self {
        Self { divisions, financers, cursors: StreamCursors::new() }
    }

    pub fn division(&self, tenant_id: TenantId, division_id: &DivisionId) -> Option<DivisionReadModel> {
        let mut division = self.divisions.get(tenant_id, division_id)?;
        division.financer_ids = self.financers_of(tenant_id, *division_id).into_iter().map(|f| f.financer_id).collect();
        Some(division)
    }

    /// Ordered by name.
    pub fn divisions(&self, tenant_id: TenantId) -> Vec<DivisionReadModel> {
        let financers = self.financers.list(tenant_id);
        let mut divisions = self.divisions.list(tenant_id);
        for division in &mut divisions {
            division.financer_ids = financers
                .iter()
                .filter(|f| f.division_id == Some(division.division_id))
                .map(|f| f.financer_id)
                .collect();
            division.financer_ids.sort();
        }
        divisions.sort_by(|a, b| a.name.cmp(&b.name).then(a.division_id.cmp(&b.division_id)));
        divisions
    }

    pub fn financer(&self, tenant_id: TenantId, financer_id: &FinancerId) -> Option<FinancerReadModel> {
        self.financers.get(tenant_id, financer_id)
    }

    /// Ordered by name.
    pub fn financers(&self, tenant_id: TenantId) -> Vec<FinancerReadModel> {
        let mut financers = self.financers.list(tenant_id);
        financers.sort_by(|a, b| a.name.cmp(&b.name).then(a.financer_id.cmp(&b.financer_id)));
        financers
    }

    /// Ordered by id.
    pub fn financers_of(&self, tenant_id: TenantId, division_id: DivisionId) -> Vec<FinancerReadModel> {
        let mut financers: Vec<_> = self
            .financers
            .list(tenant_id)
            .into_iter()
            .filter(|f| f.division_id == Some(division_id))
            .collect();
        financers.sort_by_key(|f| f.financer_id);
        financers
    }

    pub fn apply_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), ProjectionError> {
        let is_division = match envelope.aggregate_type() {
            DIVISION_AGGREGATE_TYPE => true,
            FINANCER_AGGREGATE_TYPE => false,
            _ => return Ok(()),
        };
        if !self.cursors.admit(envelope)? {
            return Ok(());
        }

        if is_division {
            self.apply_division(envelope, decode(envelope)?)?;
        } else {
            self.apply_financer(envelope, decode(envelope)?)?;
        }

        self.cursors.advance(envelope.tenant_id(), envelope.aggregate_id(), envelope.sequence_number());
        Ok(())
    }

    fn apply_division(&self, envelope: &EventEnvelope<JsonValue>, ev: DivisionEvent) -> Result<(), ProjectionError> {
        let tenant_id = envelope.tenant_id();
        match ev {
            DivisionEvent::DivisionCreated(e) => {
                ensure_stream(envelope, e.tenant_id, e.division_id.0)?;
                self.divisions.upsert(
                    tenant_id,
                    e.division_id,
                    DivisionReadModel {
                        division_id: e.division_id,
                        name: e.name,
                        country: e.country,
                        currency: e.currency,
                        vat_rate: e.vat_rate,
                        core_package_price: e.core_package_price,
                        contract_start_date: e.contract_start_date,
                        module_prices: BTreeMap::new(),
                        financer_ids: Vec::new(),
                    },
                );
            }
            DivisionEvent::DivisionPricingUpdated(e) => {
                ensure_stream(envelope, e.tenant_id, e.division_id.0)?;
                if let Some(mut rm) = self.divisions.get(tenant_id, &e.division_id) {
                    rm.core_package_price = e.core_package_price;
                    rm.vat_rate = e.vat_rate;
                    rm.contract_start_date = e.contract_start_date;
                    self.divisions.upsert(tenant_id, e.division_id, rm);
                }
            }
            DivisionEvent::DivisionModulePriceSet(e) => {
                ensure_stream(envelope, e.tenant_id, e.division_id.0)?;
                if let Some(mut rm) = self.divisions.get(tenant_id, &e.division_id) {
                    rm.module_prices.insert(e.module_id, e.price);
                    self.divisions.upsert(tenant_id, e.division_id, rm);
                }
            }
        }
        Ok(())
    }

    fn apply_financer(&self, envelope: &EventEnvelope<JsonValue>, ev: FinancerEvent) -> Result<(), ProjectionError> {
        let tenant_id = envelope.tenant_id();
        let financer_id = FinancerId::new(envelope.aggregate_id());
        let mut rm = self.financers.get(tenant_id, &financer_id).unwrap_or_else(|| FinancerReadModel::new(financer_id));

        match ev {
            FinancerEvent::FinancerRegistered(e) => {
                ensure_stream(envelope, e.tenant_id, e.financer_id.0)?;
                rm.name = e.name;
                rm.division_id = e.division_id;
                rm.contract_start_date = e.contract_start_date;
                rm.core_package_price = e.core_package_price;
            }
            FinancerEvent::FinancerContractUpdated(e) => {
                ensure_stream(envelope, e.tenant_id, e.financer_id.0)?;
                rm.contract_start_date = e.contract_start_date;
                rm.core_package_price = e.core_package_price;
            }
            FinancerEvent::ModuleActivated(e) => {
                ensure_stream(envelope, e.tenant_id, e.financer_id.0)?;
                let sub = rm.modules.entry(e.module_id).or_insert_with(|| ModuleSubscription {
                    module_id: e.module_id,
                    active: false,
                    price_per_beneficiary: None,
                    subscribed_on: e.on,
                    toggles: Vec::new(),
                });
                if !sub.active {
                    sub.toggles.push(ModuleToggle { on: e.on, active: true });
                }
                sub.active = true;
                sub.price_per_beneficiary = e.price_per_beneficiary;
            }
            FinancerEvent::ModuleDeactivated(e) => {
                ensure_stream(envelope, e.tenant_id, e.financer_id.0)?;
                if let Some(sub) = rm.modules.get_mut(&e.module_id) {
                    sub.active = false;
                    sub.toggles.push(ModuleToggle { on: e.on, active: false });
                }
            }
            FinancerEvent::BeneficiaryEnrolled(e) => {
                ensure_stream(envelope, e.tenant_id, e.financer_id.0)?;
                rm.beneficiaries.insert(e.user_id, BeneficiaryMembership { user_id: e.user_id, from: e.from, to: None });
            }
            FinancerEvent::BeneficiaryOffboarded(e) => {
                ensure_stream(envelope, e.tenant_id, e.financer_id.0)?;
                if let Some(m) = rm.beneficiaries.get_mut(&e.user_id) {
                    m.to = Some(e.to);
                }
            }
        }

        self.financers.upsert(tenant_id, financer_id, rm);
        Ok(())
    }
}

impl<D, F> Projection for OrganizationDirectoryProjection<D, F>
where
    D: TenantStore<DivisionId, DivisionReadModel>,
    F: TenantStore<FinancerId, FinancerReadModel>,
{
    fn name(&self) -> &'static str {
        "organizations.directory"
    }

    fn apply_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), ProjectionError> {
        OrganizationDirectoryProjection::apply_envelope(self, envelope)
    }

    fn clear_tenant(&self, tenant_id: TenantId) {
        self.divisions.clear_tenant(tenant_id);
        self.financers.clear_tenant(tenant_id);
        self.cursors.clear_tenant(tenant_id);
    }
}
