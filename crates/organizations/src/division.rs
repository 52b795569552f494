use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use engage_core::{Aggregate, AggregateId, AggregateRoot, DomainError, TenantId, VatRate};
use engage_events::{Command, Event};

use crate::ids::{DivisionId, ModuleId};

pub const DEFAULT_COUNTRY: &str = "FR";
pub const DEFAULT_CURRENCY: &str = "EUR";

/// Aggregate root: Division.
///
/// Carries the prices a division charges its financers and the contract that
/// the platform bills the division against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Division {
    id: DivisionId,
    tenant_id: Option<TenantId>,
    name: String,
    country: String,
    currency: String,
    vat_rate: Option<VatRate>,
    core_package_price: Option<i64>,
    contract_start_date: Option<NaiveDate>,
    module_prices: BTreeMap<ModuleId, i64>,
    version: u64,
    created: bool,
}

impl Division {
    pub fn empty(id: DivisionId) -> Self {
        Self {
            id,
            tenant_id: None,
            name: String::new(),
            country: DEFAULT_COUNTRY.to_string(),
            currency: DEFAULT_CURRENCY.to_string(),
            vat_rate: None,
            core_package_price: None,
            contract_start_date: None,
            module_prices: BTreeMap::new(),
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> DivisionId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// ISO 3166 alpha-2, upper case.
    pub fn country(&self) -> &str {
        &self.country
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    /// VAT override; `None` means the country rate applies.
    pub fn vat_rate(&self) -> Option<VatRate> {
        self.vat_rate
    }

    /// Price per beneficiary in cents.
    pub fn core_package_price(&self) -> Option<i64> {
        self.core_package_price
    }

    pub fn contract_start_date(&self) -> Option<NaiveDate> {
        self.contract_start_date
    }

    pub fn module_price(&self, module_id: ModuleId) -> Option<i64> {
        self.module_prices.get(&module_id).copied()
    }

    pub fn module_prices(&self) -> &BTreeMap<ModuleId, i64> {
        &self.module_prices
    }
}

impl AggregateRoot for Division {
    type Id = DivisionId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateDivision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateDivision {
    pub tenant_id: TenantId,
    pub division_id: DivisionId,
    pub name: String,
    pub country: Option<String>,
    pub currency: Option<String>,
    pub vat_rate: Option<VatRate>,
    pub core_package_price: Option<i64>,
    pub contract_start_date: Option<NaiveDate>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: UpdateDivisionPricing. `None` fields are left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateDivisionPricing {
    pub tenant_id: TenantId,
    pub division_id: DivisionId,
    pub core_package_price: Option<i64>,
    pub vat_rate: Option<VatRate>,
    pub contract_start_date: Option<NaiveDate>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SetDivisionModulePrice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetDivisionModulePrice {
    pub tenant_id: TenantId,
    pub division_id: DivisionId,
    pub module_id: ModuleId,
    pub price: i64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DivisionCommand {
    CreateDivision(CreateDivision),
    UpdateDivisionPricing(UpdateDivisionPricing),
    SetDivisionModulePrice(SetDivisionModulePrice),
}

impl Command for DivisionCommand {
    fn target_aggregate_id(&self) -> AggregateId {
        match self {
            DivisionCommand::CreateDivision(c) => c.division_id.0,
            DivisionCommand::UpdateDivisionPricing(c) => c.division_id.0,
            DivisionCommand::SetDivisionModulePrice(c) => c.division_id.0,
        }
    }
}

/// Event: DivisionCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DivisionCreated {
    pub tenant_id: TenantId,
    pub division_id: DivisionId,
    pub name: String,
    pub country: String,
    pub currency: String,
    pub vat_rate: Option<VatRate>,
    pub core_package_price: Option<i64>,
    pub contract_start_date: Option<NaiveDate>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: DivisionPricingUpdated (full pricing snapshot after the change).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DivisionPricingUpdated {
    pub tenant_id: TenantId,
    pub division_id: DivisionId,
    pub core_package_price: Option<i64>,
    pub vat_rate: Option<VatRate>,
    pub contract_start_date: Option<NaiveDate>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: DivisionModulePriceSet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DivisionModulePriceSet {
    pub tenant_id: TenantId,
    pub division_id: DivisionId,
    pub module_id: ModuleId,
    pub price: i64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DivisionEvent {
    DivisionCreated(DivisionCreated),
    DivisionPricingUpdated(DivisionPricingUpdated),
    DivisionModulePriceSet(DivisionModulePriceSet),
}

impl Event for DivisionEvent {
    fn event_type(&self) -> &'static str {
        match self {
            DivisionEvent::DivisionCreated(_) => "organizations.division.created",
            DivisionEvent::DivisionPricingUpdated(_) => "organizations.division.pricing_updated",
            DivisionEvent::DivisionModulePriceSet(_) => "organizations.division.module_price_set",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            DivisionEvent::DivisionCreated(e) => e.occurred_at,
            DivisionEvent::DivisionPricingUpdated(e) => e.occurred_at,
            DivisionEvent::DivisionModulePriceSet(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Division {
    type Command = DivisionCommand;
    type Event = DivisionEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            DivisionEvent::DivisionCreated(e) => {
                self.id = e.division_id;
                self.tenant_id = Some(e.tenant_id);
                self.name = e.name.clone();
                self.country = e.country.clone();
                self.currency = e.currency.clone();
                self.vat_rate = e.vat_rate;
                self.core_package_price = e.core_package_price;
                self.contract_start_date = e.contract_start_date;
                self.created = true;
            }
            DivisionEvent::DivisionPricingUpdated(e) => {
                self.core_package_price = e.core_package_price;
                self.vat_rate = e.vat_rate;
                self.contract_start_date = e.contract_start_date;
            }
            DivisionEvent::DivisionModulePriceSet(e) => {
                self.module_prices.insert(e.module_id, e.price);
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            DivisionCommand::CreateDivision(cmd) => self.handle_create(cmd),
            DivisionCommand::UpdateDivisionPricing(cmd) => self.handle_update_pricing(cmd),
            DivisionCommand::SetDivisionModulePrice(cmd) => self.handle_set_module_price(cmd),
        }
    }
}

impl Division {
    fn ensure_existing(&self, tenant_id: TenantId, division_id: DivisionId) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        if self.id != division_id {
            return Err(DomainError::invariant("division_id mismatch"));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateDivision) -> Result<Vec<DivisionEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("division already exists"));
        }

        let name = cmd.name.trim();
        if name.is_empty() {
            return Err(DomainError::validation("division name cannot be empty"));
        }

        let country = normalize_code(cmd.country.as_deref(), DEFAULT_COUNTRY, 2, "country")?;
        let currency = normalize_code(cmd.currency.as_deref(), DEFAULT_CURRENCY, 3, "currency")?;
        ensure_price(cmd.core_package_price, "core_package_price")?;

        Ok(vec![DivisionEvent::DivisionCreated(DivisionCreated {
            tenant_id: cmd.tenant_id,
            division_id: cmd.division_id,
            name: name.to_string(),
            country,
            currency,
            vat_rate: cmd.vat_rate,
            core_package_price: cmd.core_package_price,
            contract_start_date: cmd.contract_start_date,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_update_pricing(
        &self,
        cmd: &UpdateDivisionPricing,
    ) -> Result<Vec<DivisionEvent>, DomainError> {
        self.ensure_existing(cmd.tenant_id, cmd.division_id)?;

        if cmd.core_package_price.is_none()
            && cmd.vat_rate.is_none()
            && cmd.contract_start_date.is_none()
        {
            return Err(DomainError::validation("pricing update has no changes"));
        }
        ensure_price(cmd.core_package_price, "core_package_price")?;

        Ok(vec![DivisionEvent::DivisionPricingUpdated(DivisionPricingUpdated {
            tenant_id: cmd.tenant_id,
            division_id: cmd.division_id,
            core_package_price: cmd.core_package_price.or(self.core_package_price),
            vat_rate: cmd.vat_rate.or(self.vat_rate),
            contract_start_date: cmd.contract_start_date.or(self.contract_start_date),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_set_module_price(
        &self,
        cmd: &SetDivisionModulePrice,
    ) -> Result<Vec<DivisionEvent>, DomainError> {
        self.ensure_existing(cmd.tenant_id, cmd.division_id)?;
        ensure_price(Some(cmd.price), "module price")?;

        if self.module_price(cmd.module_id) == Some(cmd.price) {
            return Ok(vec![]);
        }

        Ok(vec![DivisionEvent::DivisionModulePriceSet(DivisionModulePriceSet {
            tenant_id: cmd.tenant_id,
            division_id: cmd.division_id,
            module_id: cmd.module_id,
            price: cmd.price,
            occurred_at: cmd.occurred_at,
        })])
    }
}

fn normalize_code(
    raw: Option<&str>,
    default: &str,
    len: usize,
    field: &str,
) -> Result<String, DomainError> {
    let code = raw.map(str::trim).filter(|s| !s.is_empty()).unwrap_or(default).to_ascii_uppercase();
    if code.len() != len || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(DomainError::validation(format!(
            "{field} must be {len} ASCII letters, got '{code}'"
        )));
    }
    Ok(code)
}

pub(crate) fn ensure_price(price: Option<i64>, field: &str) -> Result<(), DomainError> {
    match price {
        Some(p) if p < 0 => Err(DomainError::validation(format!("{field} cannot be negative"))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_cmd(tenant_id: TenantId, division_id: DivisionId) -> CreateDivision {
        CreateDivision {
            tenant_id,
            division_id,
            name: "  Benelux  ".to_string(),
            country: Some("be".to_string()),
            currency: None,
            vat_rate: None,
            core_package_price: Some(500),
            contract_start_date: None,
            occurred_at: Utc::now(),
        }
    }

    fn created(tenant_id: TenantId, division_id: DivisionId) -> Division {
        let mut division = Division::empty(division_id);
        let events = division
            .handle(&DivisionCommand::CreateDivision(create_cmd(tenant_id, division_id)))
            .unwrap();
        division.apply(&events[0]);
        division
    }

    #[test]
    fn create_normalizes_codes_and_applies_defaults() {
        let tenant_id = TenantId::new();
        let division = created(tenant_id, DivisionId::generate());

        assert_eq!(division.name(), "Benelux");
        assert_eq!(division.country(), "BE");
        assert_eq!(division.currency(), "EUR");
        assert_eq!(division.core_package_price(), Some(500));
        assert_eq!(division.version(), 1);
    }

    #[test]
    fn invalid_country_is_rejected() {
        let division_id = DivisionId::generate();
        let mut cmd = create_cmd(TenantId::new(), division_id);
        cmd.country = Some("BEL".to_string());

        let err = Division::empty(division_id)
            .handle(&DivisionCommand::CreateDivision(cmd))
            .unwrap_err();
        match err {
            DomainError::Validation(msg) if msg.contains("country") => {}
            other => panic!("Expected Validation error, got {other:?}"),
        }
    }

    #[test]
    fn creating_twice_conflicts() {
        let tenant_id = TenantId::new();
        let division_id = DivisionId::generate();
        let division = created(tenant_id, division_id);

        let err = division
            .handle(&DivisionCommand::CreateDivision(create_cmd(tenant_id, division_id)))
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn pricing_update_keeps_untouched_fields() {
        let tenant_id = TenantId::new();
        let division_id = DivisionId::generate();
        let mut division = created(tenant_id, division_id);

        let events = division
            .handle(&DivisionCommand::UpdateDivisionPricing(UpdateDivisionPricing {
                tenant_id,
                division_id,
                core_package_price: None,
                vat_rate: Some(VatRate::percent(17)),
                contract_start_date: None,
                occurred_at: Utc::now(),
            }))
            .unwrap();
        division.apply(&events[0]);

        assert_eq!(division.vat_rate(), Some(VatRate::percent(17)));
        assert_eq!(division.core_package_price(), Some(500));
    }

    #[test]
    fn commands_on_unknown_division_are_not_found() {
        let division_id = DivisionId::generate();
        let err = Division::empty(division_id)
            .handle(&DivisionCommand::SetDivisionModulePrice(SetDivisionModulePrice {
                tenant_id: TenantId::new(),
                division_id,
                module_id: ModuleId::generate(),
                price: 100,
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert_eq!(err, DomainError::NotFound);
    }

    #[test]
    fn module_price_is_idempotent_and_non_negative() {
        let tenant_id = TenantId::new();
        let division_id = DivisionId::generate();
        let module_id = ModuleId::generate();
        let mut division = created(tenant_id, division_id);

        let set = |price| {
            DivisionCommand::SetDivisionModulePrice(SetDivisionModulePrice {
                tenant_id,
                division_id,
                module_id,
                price,
                occurred_at: Utc::now(),
            })
        };

        let events = division.handle(&set(250)).unwrap();
        division.apply(&events[0]);
        assert_eq!(division.module_price(module_id), Some(250));

        assert!(division.handle(&set(250)).unwrap().is_empty());
        assert!(matches!(division.handle(&set(-1)), Err(DomainError::Validation(_))));
    }

    #[test]
    fn command_targets_its_division_stream() {
        let division_id = DivisionId::generate();
        let cmd = DivisionCommand::CreateDivision(create_cmd(TenantId::new(), division_id));
        assert_eq!(cmd.target_aggregate_id(), division_id.0);
    }
}
