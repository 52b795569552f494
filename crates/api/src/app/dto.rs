use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use engage_core::{AggregateId, UserId, VatRate};
use engage_infra::projections::{InvoiceFilter, InvoiceReadModel};
use engage_invoicing::{InvoiceItemId, InvoiceItemType, InvoiceStatus, NewInvoiceItem, ProrataPercentage};
use engage_organizations::ModuleId;

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateDivisionRequest {
    pub name: String,
    pub country: Option<String>,
    pub currency: Option<String>,
    pub vat_rate: Option<VatRate>,
    pub core_package_price: Option<i64>,
    pub contract_start_date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateDivisionPricingRequest {
    pub core_package_price: Option<i64>,
    pub vat_rate: Option<VatRate>,
    pub contract_start_date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
pub struct SetModulePriceRequest {
    pub price: i64,
}

#[derive(Debug, Deserialize)]
pub struct RegisterFinancerRequest {
    pub name: String,
    pub division_id: Option<String>,
    pub contract_start_date: Option<NaiveDate>,
    pub core_package_price: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateFinancerContractRequest {
    pub contract_start_date: Option<NaiveDate>,
    pub core_package_price: Option<i64>,
}

/// `on` defaults to today.
#[derive(Debug, Default, Deserialize)]
pub struct ToggleModuleRequest {
    pub price_per_beneficiary: Option<i64>,
    pub on: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
pub struct EnrollBeneficiaryRequest {
    pub user_id: String,
    pub from: NaiveDate,
}

#[derive(Debug, Deserialize)]
pub struct OffboardBeneficiaryRequest {
    pub to: NaiveDate,
}

#[derive(Debug, Deserialize)]
pub struct MonthQuery {
    pub month: String,
}

#[derive(Debug, Deserialize)]
pub struct InvoiceItemRequest {
    pub item_type: InvoiceItemType,
    pub module_id: Option<String>,
    pub label: String,
    pub unit_price: i64,
    pub quantity: i64,
    #[serde(default)]
    pub prorata: ProrataPercentage,
    pub prorata_days: Option<i64>,
    pub total_days: Option<i64>,
    pub beneficiaries_count: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateInvoiceRequest {
    /// `division` or `financer`.
    pub recipient_type: String,
    pub recipient_id: String,
    pub billing_period_start: NaiveDate,
    pub billing_period_end: NaiveDate,
    pub vat_rate: VatRate,
    pub currency: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub notes: Option<String>,
    #[serde(default)]
    pub items: Vec<InvoiceItemRequest>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateInvoiceRequest {
    pub notes: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub currency: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MarkPaidRequest {
    pub amount_paid: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct BulkStatusRequest {
    pub status: String,
    pub invoice_ids: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListInvoicesQuery {
    pub status: Option<String>,
    pub recipient_id: Option<String>,
    pub billing_period_start: Option<NaiveDate>,
    pub billing_period_end: Option<NaiveDate>,
    pub per_page: Option<usize>,
    pub page: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct StartRunRequest {
    pub month_year: String,
    pub division_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeadLetterQuery {
    pub limit: Option<usize>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct BeneficiaryProrata {
    pub user_id: UserId,
    pub prorata: ProrataPercentage,
}

#[derive(Debug, Serialize)]
pub struct ProrataResponse {
    pub month_year: String,
    pub total_days: i64,
    pub beneficiaries: Vec<BeneficiaryProrata>,
}

impl ProrataResponse {
    pub fn new(month_year: String, total_days: i64, shares: BTreeMap<UserId, ProrataPercentage>) -> Self {
        let beneficiaries = shares.into_iter().map(|(user_id, prorata)| BeneficiaryProrata { user_id, prorata }).collect();
        Self { month_year, total_days, beneficiaries }
    }
}

#[derive(Debug, Serialize)]
pub struct BulkStatusResult {
    pub updated: Vec<String>,
    pub failed: Vec<BulkFailure>,
}

#[derive(Debug, Serialize)]
pub struct BulkFailure {
    pub invoice_id: String,
    pub error: String,
}

pub fn invoice_to_json(rm: InvoiceReadModel) -> serde_json::Value {
    serde_json::to_value(rm).unwrap_or_else(|_| serde_json::json!({}))
}

// -------------------------
// Mapping helpers
// -------------------------

pub fn parse_id(raw: &str, what: &str) -> Result<AggregateId, axum::response::Response> {
    raw.parse().map_err(|_| errors::invalid_id(what))
}

pub fn parse_opt_id(raw: Option<&str>, what: &str) -> Result<Option<AggregateId>, axum::response::Response> {
    raw.map(|r| parse_id(r, what)).transpose()
}

pub fn parse_status(raw: &str) -> Result<InvoiceStatus, axum::response::Response> {
    raw.parse().map_err(errors::domain_error_to_response)
}

impl ListInvoicesQuery {
    pub fn filter(&self) -> Result<InvoiceFilter, axum::response::Response> {
        Ok(InvoiceFilter {
            status: self.status.as_deref().map(parse_status).transpose()?,
            recipient_id: parse_opt_id(self.recipient_id.as_deref(), "recipient_id")?,
            billing_period_start: self.billing_period_start,
            billing_period_end: self.billing_period_end,
        })
    }
}

impl InvoiceItemRequest {
    pub fn into_new_item(self) -> Result<NewInvoiceItem, axum::response::Response> {
        let module_id = parse_opt_id(self.module_id.as_deref(), "module_id")?.map(ModuleId);
        Ok(NewInvoiceItem {
            id: InvoiceItemId::generate(),
            item_type: self.item_type,
            module_id,
            label: self.label,
            unit_price: self.unit_price,
            quantity: self.quantity,
            prorata: self.prorata,
            prorata_days: self.prorata_days,
            total_days: self.total_days,
            beneficiaries_count: self.beneficiaries_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn item_prorata_defaults_to_full_period() {
        let item: InvoiceItemRequest = serde_json::from_value(serde_json::json!({
            "item_type": "custom",
            "label": "Onboarding",
            "unit_price": 5000,
            "quantity": 1
        }))
        .unwrap();
        let item = item.into_new_item().unwrap();
        assert_eq!(item.prorata, ProrataPercentage::FULL);
        assert_eq!(item.module_id, None);
    }

    #[test]
    fn list_query_rejects_bad_ids_and_statuses() {
        let bad_id = ListInvoicesQuery { recipient_id: Some("nope".into()), ..Default::default() };
        assert_eq!(bad_id.filter().unwrap_err().status(), StatusCode::BAD_REQUEST);

        let bad_status = ListInvoicesQuery { status: Some("archived".into()), ..Default::default() };
        assert_eq!(bad_status.filter().unwrap_err().status(), StatusCode::BAD_REQUEST);

        let ok = ListInvoicesQuery { status: Some("paid".into()), ..Default::default() };
        assert_eq!(ok.filter().unwrap().status, Some(InvoiceStatus::Paid));
    }
}
