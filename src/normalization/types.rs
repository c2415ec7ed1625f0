//! Standardized tax-transaction record produced by the normalizer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::systems::ExternalSystemType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardizedTransaction {
    pub transaction_id: String,
    pub timestamp: DateTime<Utc>,
    pub total_amount: f64,
    pub total_tax: f64,
    pub tax_lines: Vec<TaxLine>,
    pub location: Option<LocationInfo>,
    pub line_items: Vec<LineItem>,
    pub currency: String,
    pub status: TransactionStatus,
    pub metadata: TransactionMetadata,
}

/// Carries the source system and untouched payload for auditability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionMetadata {
    pub system: ExternalSystemType,
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxLine {
    pub name: String,
    /// Decimal rate (0.0825 for 8.25%), when the source provided one.
    pub rate: Option<f64>,
    pub amount: f64,
    pub jurisdiction: Jurisdiction,
    pub tax_type: TaxType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Jurisdiction {
    pub name: String,
    pub scope: JurisdictionScope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JurisdictionScope {
    State,
    County,
    City,
    Special,
}

impl JurisdictionScope {
    /// Best-effort guess from a jurisdiction or tax name.
    pub fn infer(name: &str) -> Self {
        let lowered = name.to_ascii_lowercase();
        if lowered.contains("county") || lowered.contains("parish") {
            JurisdictionScope::County
        } else if lowered.contains("city") || lowered.contains("municipal") {
            JurisdictionScope::City
        } else if lowered.contains("district")
            || lowered.contains("special")
            || lowered.contains("transit")
        {
            JurisdictionScope::Special
        } else {
            JurisdictionScope::State
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaxType {
    Percentage,
    Fixed,
}

impl TaxType {
    /// Maps an explicit vendor type label; `None` for labels that say nothing about
    /// how the tax is computed.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "percentage" | "percent" | "rate" => Some(TaxType::Percentage),
            "fixed" | "flat" | "amount" => Some(TaxType::Fixed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub id: Option<String>,
    pub name: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub total_amount: f64,
    pub tax_lines: Vec<TaxLine>,
    pub tax_exempt: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationInfo {
    pub id: Option<String>,
    pub name: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
}

impl LocationInfo {
    pub fn is_empty(&self) -> bool {
        self == &LocationInfo::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Completed,
    Pending,
    Failed,
    Refunded,
}

impl TransactionStatus {
    /// Maps vendor status vocabularies; unknown or absent statuses count as completed.
    pub fn from_raw(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return TransactionStatus::Completed;
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" | "open" | "authorized" | "processing" | "in_progress" => {
                TransactionStatus::Pending
            }
            "failed" | "declined" | "voided" | "void" | "cancelled" | "canceled" => {
                TransactionStatus::Failed
            }
            "refunded" | "partially_refunded" | "returned" => TransactionStatus::Refunded,
            _ => TransactionStatus::Completed,
        }
    }
}
