use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use engage_core::{Aggregate, AggregateId, AggregateRoot, DomainError, TenantId, UserId};
use engage_events::{Command, Event};

use crate::division::ensure_price;
use crate::ids::{DivisionId, FinancerId, ModuleId};

/// A dated activation or deactivation of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleToggle {
    pub on: NaiveDate,
    pub active: bool,
}

/// A financer's subscription to one module, with its activation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSubscription {
    pub module_id: ModuleId,
    pub active: bool,
    /// Financer-specific price in cents; falls back to the division price when `None`.
    pub price_per_beneficiary: Option<i64>,
    pub subscribed_on: NaiveDate,
    /// Ordered by date.
    pub toggles: Vec<ModuleToggle>,
}

impl ModuleSubscription {
    /// State in effect at the end of `date`.
    pub fn state_at(&self, date: NaiveDate) -> bool {
        self.toggles
            .iter()
            .rev()
            .find(|t| t.on <= date)
            .map(|t| t.active)
            .unwrap_or(false)
    }

    /// Active on `start`, or activated at some point in `[start, end]`.
    pub fn was_active_between(&self, start: NaiveDate, end: NaiveDate) -> bool {
        self.state_at(start) || self.toggles.iter().any(|t| t.active && t.on >= start && t.on <= end)
    }

    /// A module is billed for a period when it is active at the period end or
    /// was active at any point inside it.
    pub fn is_billable_between(&self, start: NaiveDate, end: NaiveDate) -> bool {
        self.state_at(end) || self.was_active_between(start, end)
    }

    pub fn first_activation_between(&self, start: NaiveDate, end: NaiveDate) -> Option<NaiveDate> {
        self.toggles.iter().find(|t| t.active && t.on >= start && t.on <= end).map(|t| t.on)
    }

    pub fn last_deactivation_between(&self, start: NaiveDate, end: NaiveDate) -> Option<NaiveDate> {
        self.toggles.iter().rev().find(|t| !t.active && t.on >= start && t.on <= end).map(|t| t.on)
    }
}

/// A beneficiary's enrollment window with a financer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeneficiaryMembership {
    pub user_id: UserId,
    pub from: NaiveDate,
    pub to: Option<NaiveDate>,
}

impl BeneficiaryMembership {
    pub fn is_active_between(&self, start: NaiveDate, end: NaiveDate) -> bool {
        self.from <= end && self.to.is_none_or(|to| to >= start)
    }
}

/// Aggregate root: Financer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Financer {
    id: FinancerId,
    tenant_id: Option<TenantId>,
    name: String,
    division_id: Option<DivisionId>,
    contract_start_date: Option<NaiveDate>,
    core_package_price: Option<i64>,
    modules: BTreeMap<ModuleId, ModuleSubscription>,
    beneficiaries: BTreeMap<UserId, BeneficiaryMembership>,
    version: u64,
    created: bool,
}

impl Financer {
    pub fn empty(id: FinancerId) -> Self {
        Self {
            id,
            tenant_id: None,
            name: String::new(),
            division_id: None,
            contract_start_date: None,
            core_package_price: None,
            modules: BTreeMap::new(),
            beneficiaries: BTreeMap::new(),
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> FinancerId {
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

    pub fn division_id(&self) -> Option<DivisionId> {
        self.division_id
    }

    pub fn contract_start_date(&self) -> Option<NaiveDate> {
        self.contract_start_date
    }

    pub fn core_package_price(&self) -> Option<i64> {
        self.core_package_price
    }

    pub fn module(&self, module_id: ModuleId) -> Option<&ModuleSubscription> {
        self.modules.get(&module_id)
    }

    pub fn modules(&self) -> impl Iterator<Item = &ModuleSubscription> {
        self.modules.values()
    }

    pub fn active_module_count(&self) -> usize {
        self.modules.values().filter(|m| m.active).count()
    }

    /// Modules to bill for `[start, end]`, ordered by module id.
    pub fn billable_modules_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> impl Iterator<Item = &ModuleSubscription> {
        self.modules.values().filter(move |m| m.is_billable_between(start, end))
    }

    /// All memberships, current and past, ordered by user id.
    pub fn beneficiaries(&self) -> impl Iterator<Item = &BeneficiaryMembership> {
        self.beneficiaries.values()
    }

    pub fn beneficiary(&self, user_id: UserId) -> Option<&BeneficiaryMembership> {
        self.beneficiaries.get(&user_id)
    }

    pub fn active_beneficiaries_between(&self, start: NaiveDate, end: NaiveDate) -> usize {
        self.beneficiaries.values().filter(|b| b.is_active_between(start, end)).count()
    }
}

impl AggregateRoot for Financer {
    type Id = FinancerId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: RegisterFinancer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterFinancer {
    pub tenant_id: TenantId,
    pub financer_id: FinancerId,
    pub name: String,
    pub division_id: Option<DivisionId>,
    pub contract_start_date: Option<NaiveDate>,
    pub core_package_price: Option<i64>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: UpdateFinancerContract. `None` fields are left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateFinancerContract {
    pub tenant_id: TenantId,
    pub financer_id: FinancerId,
    pub contract_start_date: Option<NaiveDate>,
    pub core_package_price: Option<i64>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ActivateModule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivateModule {
    pub tenant_id: TenantId,
    pub financer_id: FinancerId,
    pub module_id: ModuleId,
    pub price_per_beneficiary: Option<i64>,
    pub on: NaiveDate,
    pub occurred_at: DateTime<Utc>,
}

/// Command: DeactivateModule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeactivateModule {
    pub tenant_id: TenantId,
    pub financer_id: FinancerId,
    pub module_id: ModuleId,
    pub on: NaiveDate,
    pub occurred_at: DateTime<Utc>,
}

/// Command: EnrollBeneficiary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollBeneficiary {
    pub tenant_id: TenantId,
    pub financer_id: FinancerId,
    pub user_id: UserId,
    pub from: NaiveDate,
    pub occurred_at: DateTime<Utc>,
}

/// Command: OffboardBeneficiary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffboardBeneficiary {
    pub tenant_id: TenantId,
    pub financer_id: FinancerId,
    pub user_id: UserId,
    pub to: NaiveDate,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinancerCommand {
    RegisterFinancer(RegisterFinancer),
    UpdateFinancerContract(UpdateFinancerContract),
    ActivateModule(ActivateModule),
    DeactivateModule(DeactivateModule),
    EnrollBeneficiary(EnrollBeneficiary),
    OffboardBeneficiary(OffboardBeneficiary),
}

impl Command for FinancerCommand {
    fn target_aggregate_id(&self) -> AggregateId {
        let id = match self {
            FinancerCommand::RegisterFinancer(c) => c.financer_id,
            FinancerCommand::UpdateFinancerContract(c) => c.financer_id,
            FinancerCommand::ActivateModule(c) => c.financer_id,
            FinancerCommand::DeactivateModule(c) => c.financer_id,
            FinancerCommand::EnrollBeneficiary(c) => c.financer_id,
            FinancerCommand::OffboardBeneficiary(c) => c.financer_id,
        };
        id.0
    }
}

/// Event: FinancerRegistered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinancerRegistered {
    pub tenant_id: TenantId,
    pub financer_id: FinancerId,
    pub name: String,
    pub division_id: Option<DivisionId>,
    pub contract_start_date: Option<NaiveDate>,
    pub core_package_price: Option<i64>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: FinancerContractUpdated (contract snapshot after the change).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinancerContractUpdated {
    pub tenant_id: TenantId,
    pub financer_id: FinancerId,
    pub contract_start_date: Option<NaiveDate>,
    pub core_package_price: Option<i64>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ModuleActivated. Also emitted to reprice an already active module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleActivated {
    pub tenant_id: TenantId,
    pub financer_id: FinancerId,
    pub module_id: ModuleId,
    pub price_per_beneficiary: Option<i64>,
    pub on: NaiveDate,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ModuleDeactivated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDeactivated {
    pub tenant_id: TenantId,
    pub financer_id: FinancerId,
    pub module_id: ModuleId,
    pub on: NaiveDate,
    pub occurred_at: DateTime<Utc>,
}

/// Event: BeneficiaryEnrolled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeneficiaryEnrolled {
    pub tenant_id: TenantId,
    pub financer_id: FinancerId,
    pub user_id: UserId,
    pub from: NaiveDate,
    pub occurred_at: DateTime<Utc>,
}

/// Event: BeneficiaryOffboarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeneficiaryOffboarded {
    pub tenant_id: TenantId,
    pub financer_id: FinancerId,
    pub user_id: UserId,
    pub to: NaiveDate,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinancerEvent {
    FinancerRegistered(FinancerRegistered),
    FinancerContractUpdated(FinancerContractUpdated),
    ModuleActivated(ModuleActivated),
    ModuleDeactivated(ModuleDeactivated),
    BeneficiaryEnrolled(BeneficiaryEnrolled),
    BeneficiaryOffboarded(BeneficiaryOffboarded),
}

impl Event for FinancerEvent {
    fn event_type(&self) -> &'static str {
        match self {
            FinancerEvent::FinancerRegistered(_) => "organizations.financer.registered",
            FinancerEvent::FinancerContractUpdated(_) => "organizations.financer.contract_updated",
            FinancerEvent::ModuleActivated(_) => "organizations.financer.module_activated",
            FinancerEvent::ModuleDeactivated(_) => "organizations.financer.module_deactivated",
            FinancerEvent::BeneficiaryEnrolled(_) => "organizations.financer.beneficiary_enrolled",
            FinancerEvent::BeneficiaryOffboarded(_) => {
                "organizations.financer.beneficiary_offboarded"
            }
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            FinancerEvent::FinancerRegistered(e) => e.occurred_at,
            FinancerEvent::FinancerContractUpdated(e) => e.occurred_at,
            FinancerEvent::ModuleActivated(e) => e.occurred_at,
            FinancerEvent::ModuleDeactivated(e) => e.occurred_at,
            FinancerEvent::BeneficiaryEnrolled(e) => e.occurred_at,
            FinancerEvent::BeneficiaryOffboarded(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Financer {
    type Command = FinancerCommand;
    type Event = FinancerEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            FinancerEvent::FinancerRegistered(e) => {
                self.id = e.financer_id;
                self.tenant_id = Some(e.tenant_id);
                self.name = e.name.clone();
                self.division_id = e.division_id;
                self.contract_start_date = e.contract_start_date;
                self.core_package_price = e.core_package_price;
                self.created = true;
            }
            FinancerEvent::FinancerContractUpdated(e) => {
                self.contract_start_date = e.contract_start_date;
                self.core_package_price = e.core_package_price;
            }
            FinancerEvent::ModuleActivated(e) => {
                let sub = self.modules.entry(e.module_id).or_insert_with(|| ModuleSubscription {
                    module_id: e.module_id,
                    active: false,
                    price_per_beneficiary: None,
                    subscribed_on: e.on,
                    toggles: Vec::new(),
                });
                if !sub.active {
                    sub.toggles.push(ModuleToggle { on: e.on, active: true });
                    sub.active = true;
                }
                sub.price_per_beneficiary = e.price_per_beneficiary;
            }
            FinancerEvent::ModuleDeactivated(e) => {
                if let Some(sub) = self.modules.get_mut(&e.module_id) {
                    sub.toggles.push(ModuleToggle { on: e.on, active: false });
                    sub.active = false;
                }
            }
            FinancerEvent::BeneficiaryEnrolled(e) => {
                self.beneficiaries.insert(
                    e.user_id,
                    BeneficiaryMembership { user_id: e.user_id, from: e.from, to: None },
                );
            }
            FinancerEvent::BeneficiaryOffboarded(e) => {
                if let Some(m) = self.beneficiaries.get_mut(&e.user_id) {
                    m.to = Some(e.to);
                }
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            FinancerCommand::RegisterFinancer(cmd) => self.handle_register(cmd),
            FinancerCommand::UpdateFinancerContract(cmd) => self.handle_update_contract(cmd),
            FinancerCommand::ActivateModule(cmd) => self.handle_activate_module(cmd),
            FinancerCommand::DeactivateModule(cmd) => self.handle_deactivate_module(cmd),
            FinancerCommand::EnrollBeneficiary(cmd) => self.handle_enroll(cmd),
            FinancerCommand::OffboardBeneficiary(cmd) => self.handle_offboard(cmd),
        }
    }
}

impl Financer {
    fn ensure_existing(&self, tenant_id: TenantId, financer_id: FinancerId) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        if self.id != financer_id {
            return Err(DomainError::invariant("financer_id mismatch"));
        }
        Ok(())
    }

    fn ensure_toggle_order(&self, module_id: ModuleId, on: NaiveDate) -> Result<(), DomainError> {
        let last = self.modules.get(&module_id).and_then(|m| m.toggles.last());
        if let Some(last) = last {
            if on < last.on {
                return Err(DomainError::validation(format!(
                    "module change on {on} precedes the last change on {}",
                    last.on
                )));
            }
        }
        Ok(())
    }

    fn handle_register(&self, cmd: &RegisterFinancer) -> Result<Vec<FinancerEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("financer already exists"));
        }

        let name = cmd.name.trim();
        if name.is_empty() {
            return Err(DomainError::validation("financer name cannot be empty"));
        }
        ensure_price(cmd.core_package_price, "core_package_price")?;

        Ok(vec![FinancerEvent::FinancerRegistered(FinancerRegistered {
            tenant_id: cmd.tenant_id,
            financer_id: cmd.financer_id,
            name: name.to_string(),
            division_id: cmd.division_id,
            contract_start_date: cmd.contract_start_date,
            core_package_price: cmd.core_package_price,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_update_contract(
        &self,
        cmd: &UpdateFinancerContract,
    ) -> Result<Vec<FinancerEvent>, DomainError> {
        self.ensure_existing(cmd.tenant_id, cmd.financer_id)?;

        if cmd.contract_start_date.is_none() && cmd.core_package_price.is_none() {
            return Err(DomainError::validation("contract update has no changes"));
        }
        ensure_price(cmd.core_package_price, "core_package_price")?;

        Ok(vec![FinancerEvent::FinancerContractUpdated(FinancerContractUpdated {
            tenant_id: cmd.tenant_id,
            financer_id: cmd.financer_id,
            contract_start_date: cmd.contract_start_date.or(self.contract_start_date),
            core_package_price: cmd.core_package_price.or(self.core_package_price),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_activate_module(
        &self,
        cmd: &ActivateModule,
    ) -> Result<Vec<FinancerEvent>, DomainError> {
        self.ensure_existing(cmd.tenant_id, cmd.financer_id)?;
        ensure_price(cmd.price_per_beneficiary, "price_per_beneficiary")?;

        if let Some(sub) = self.modules.get(&cmd.module_id) {
            if sub.active && sub.price_per_beneficiary == cmd.price_per_beneficiary {
                return Ok(vec![]);
            }
        }
        self.ensure_toggle_order(cmd.module_id, cmd.on)?;

        Ok(vec![FinancerEvent::ModuleActivated(ModuleActivated {
            tenant_id: cmd.tenant_id,
            financer_id: cmd.financer_id,
            module_id: cmd.module_id,
            price_per_beneficiary: cmd.price_per_beneficiary,
            on: cmd.on,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_deactivate_module(
        &self,
        cmd: &DeactivateModule,
    ) -> Result<Vec<FinancerEvent>, DomainError> {
        self.ensure_existing(cmd.tenant_id, cmd.financer_id)?;

        let active = self.modules.get(&cmd.module_id).is_some_and(|m| m.active);
        if !active {
            return Err(DomainError::invariant("module is not active for this financer"));
        }
        self.ensure_toggle_order(cmd.module_id, cmd.on)?;

        Ok(vec![FinancerEvent::ModuleDeactivated(ModuleDeactivated {
            tenant_id: cmd.tenant_id,
            financer_id: cmd.financer_id,
            module_id: cmd.module_id,
            on: cmd.on,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_enroll(&self, cmd: &EnrollBeneficiary) -> Result<Vec<FinancerEvent>, DomainError> {
        self.ensure_existing(cmd.tenant_id, cmd.financer_id)?;

        // Re-enrolling an offboarded beneficiary replaces the old window.
        if let Some(existing) = self.beneficiaries.get(&cmd.user_id) {
            if existing.to.is_none() {
                return Err(DomainError::conflict("beneficiary is already enrolled"));
            }
        }

        Ok(vec![FinancerEvent::BeneficiaryEnrolled(BeneficiaryEnrolled {
            tenant_id: cmd.tenant_id,
            financer_id: cmd.financer_id,
            user_id: cmd.user_id,
            from: cmd.from,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_offboard(&self, cmd: &OffboardBeneficiary) -> Result<Vec<FinancerEvent>, DomainError> {
        self.ensure_existing(cmd.tenant_id, cmd.financer_id)?;

        let membership = self
            .beneficiaries
            .get(&cmd.user_id)
            .ok_or_else(|| DomainError::invariant("beneficiary is not enrolled"))?;
        if membership.to.is_some() {
            return Err(DomainError::invariant("beneficiary is already offboarded"));
        }
        if cmd.to < membership.from {
            return Err(DomainError::validation(
                "offboarding date cannot precede the enrollment date",
            ));
        }

        Ok(vec![FinancerEvent::BeneficiaryOffboarded(BeneficiaryOffboarded {
            tenant_id: cmd.tenant_id,
            financer_id: cmd.financer_id,
            user_id: cmd.user_id,
            to: cmd.to,
            occurred_at: cmd.occurred_at,
        })])
    }
}
