//! Declarative per-system field-path schemas.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::systems::ExternalSystemType;

/// How bare numeric amounts are expressed by a system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmountConvention {
    /// Integer cents (or equivalent minor unit).
    MinorUnits,
    /// Decimal amounts in the currency's major unit.
    MajorUnits,
}

impl AmountConvention {
    pub fn as_str(&self) -> &'static str {
        match self {
            AmountConvention::MinorUnits => "minor",
            AmountConvention::MajorUnits => "major",
        }
    }
}

impl fmt::Display for AmountConvention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown amount convention '{0}' (expected 'minor' or 'major')")]
pub struct UnknownAmountConvention(pub String);

impl FromStr for AmountConvention {
    type Err = UnknownAmountConvention;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minor" | "minor_units" | "cents" => Ok(AmountConvention::MinorUnits),
            "major" | "major_units" | "decimal" => Ok(AmountConvention::MajorUnits),
            _ => Err(UnknownAmountConvention(s.to_string())),
        }
    }
}

/// Field paths for one system's transaction payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformSchema {
    pub system: ExternalSystemType,
    pub amount_convention: AmountConvention,
    /// Path to the transaction object inside a webhook envelope. When it does not
    /// resolve the payload itself is treated as the transaction.
    #[serde(default)]
    pub root: Option<String>,
    pub transaction_id: String,
    pub timestamp: String,
    pub total_amount: String,
    #[serde(default)]
    pub total_tax: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub tax_lines: Option<String>,
    pub tax_line: TaxLineFields,
    #[serde(default)]
    pub line_items: Option<String>,
    pub line_item: LineItemFields,
    #[serde(default)]
    pub location: LocationFields,
}

/// Paths relative to a single tax-line object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxLineFields {
    pub name: String,
    pub rate: Option<String>,
    pub amount: String,
    pub jurisdiction: Option<String>,
    pub tax_type: Option<String>,
}

impl Default for TaxLineFields {
    fn default() -> Self {
        Self {
            name: "name".to_string(),
            rate: Some("rate".to_string()),
            amount: "amount".to_string(),
            jurisdiction: Some("jurisdiction".to_string()),
            tax_type: Some("type".to_string()),
        }
    }
}

/// Paths relative to a single line-item object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItemFields {
    pub id: Option<String>,
    pub name: String,
    pub quantity: String,
    pub unit_price: String,
    pub total_amount: Option<String>,
    pub taxes: Option<String>,
    pub tax_exempt: Option<String>,
    /// Inverse of `tax_exempt` for systems that flag taxable items instead.
    pub taxable: Option<String>,
}

impl Default for LineItemFields {
    fn default() -> Self {
        Self {
            id: Some("id".to_string()),
            name: "name".to_string(),
            quantity: "quantity".to_string(),
            unit_price: "price".to_string(),
            total_amount: Some("total".to_string()),
            taxes: Some("taxes".to_string()),
            tax_exempt: Some("tax_exempt".to_string()),
            taxable: None,
        }
    }
}

/// Paths relative to the transaction object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationFields {
    pub id: Option<String>,
    pub name: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
}

fn path(value: &str) -> Option<String> {
    Some(value.to_string())
}

impl TransformSchema {
    /// Built-in schema for a system, using the given amount convention.
    pub fn default_for(system: ExternalSystemType, amount_convention: AmountConvention) -> Self {
        match system {
            ExternalSystemType::Shopify => Self {
                system,
                amount_convention,
                root: None,
                transaction_id: "id".to_string(),
                timestamp: "created_at".to_string(),
                total_amount: "total_price".to_string(),
                total_tax: path("total_tax"),
                currency: path("currency"),
                status: path("financial_status"),
                tax_lines: path("tax_lines"),
                tax_line: TaxLineFields {
                    name: "title".to_string(),
                    rate: path("rate"),
                    amount: "price".to_string(),
                    jurisdiction: path("jurisdiction"),
                    tax_type: path("type"),
                },
                line_items: path("line_items"),
                line_item: LineItemFields {
                    id: path("id"),
                    name: "title".to_string(),
                    quantity: "quantity".to_string(),
                    unit_price: "price".to_string(),
                    total_amount: None,
                    taxes: path("tax_lines"),
                    tax_exempt: None,
                    taxable: path("taxable"),
                },
                location: LocationFields {
                    id: path("location_id"),
                    name: None,
                    address: path("billing_address.address1"),
                    city: path("billing_address.city"),
                    state: path("billing_address.province_code"),
                    postal_code: path("billing_address.zip"),
                    country: path("billing_address.country_code"),
                },
            },
            ExternalSystemType::Square => Self {
                system,
                amount_convention,
                root: path("data.object.order"),
                transaction_id: "id".to_string(),
                timestamp: "created_at".to_string(),
                total_amount: "total_money.amount".to_string(),
                total_tax: path("total_tax_money.amount"),
                currency: path("total_money.currency"),
                status: path("state"),
                tax_lines: path("taxes"),
                tax_line: TaxLineFields {
                    name: "name".to_string(),
                    rate: path("percentage"),
                    amount: "applied_money.amount".to_string(),
                    jurisdiction: None,
                    tax_type: path("type"),
                },
                line_items: path("line_items"),
                line_item: LineItemFields {
                    id: path("uid"),
                    name: "name".to_string(),
                    quantity: "quantity".to_string(),
                    unit_price: "base_price_money.amount".to_string(),
                    total_amount: path("total_money.amount"),
                    taxes: path("applied_taxes"),
                    tax_exempt: None,
                    taxable: None,
                },
                location: LocationFields {
                    id: path("location_id"),
                    ..LocationFields::default()
                },
            },
            ExternalSystemType::Clover => Self {
                system,
                amount_convention,
                root: None,
                transaction_id: "id".to_string(),
                timestamp: "createdTime".to_string(),
                total_amount: "total".to_string(),
                total_tax: path("taxAmount"),
                currency: path("currency"),
                status: path("state"),
                tax_lines: path("lineItems.elements[].taxRates.elements"),
                tax_line: TaxLineFields {
                    name: "name".to_string(),
                    rate: None,
                    amount: "taxAmount".to_string(),
                    jurisdiction: None,
                    tax_type: None,
                },
                line_items: path("lineItems.elements"),
                line_item: LineItemFields {
                    id: path("id"),
                    name: "name".to_string(),
                    quantity: "unitQty".to_string(),
                    unit_price: "price".to_string(),
                    total_amount: None,
                    taxes: path("taxRates.elements"),
                    tax_exempt: None,
                    taxable: None,
                },
                location: LocationFields {
                    id: path("merchant.id"),
                    name: path("merchant.name"),
                    ..LocationFields::default()
                },
            },
            ExternalSystemType::Toast => Self {
                system,
                amount_convention,
                root: None,
                transaction_id: "guid".to_string(),
                timestamp: "createdDate".to_string(),
                total_amount: "checks[0].totalAmount".to_string(),
                total_tax: path("checks[0].taxAmount"),
                currency: None,
                status: path("checks[0].paymentStatus"),
                tax_lines: path("checks[].selections[].appliedTaxes"),
                tax_line: TaxLineFields {
                    name: "name".to_string(),
                    rate: path("rate"),
                    amount: "taxAmount".to_string(),
                    jurisdiction: None,
                    tax_type: path("type"),
                },
                line_items: path("checks[].selections"),
                line_item: LineItemFields {
                    id: path("guid"),
                    name: "displayName".to_string(),
                    quantity: "quantity".to_string(),
                    unit_price: "preDiscountPrice".to_string(),
                    total_amount: path("price"),
                    taxes: path("appliedTaxes"),
                    tax_exempt: None,
                    taxable: None,
                },
                location: LocationFields {
                    id: path("restaurantGuid"),
                    ..LocationFields::default()
                },
            },
            ExternalSystemType::Lightspeed => Self {
                system,
                amount_convention,
                root: path("sale"),
                transaction_id: "id".to_string(),
                timestamp: "created_at".to_string(),
                total_amount: "total_price".to_string(),
                total_tax: path("total_tax"),
                currency: path("currency"),
                status: path("status"),
                tax_lines: path("taxes"),
                tax_line: TaxLineFields {
                    name: "name".to_string(),
                    rate: path("rate"),
                    amount: "amount".to_string(),
                    jurisdiction: None,
                    tax_type: None,
                },
                line_items: path("line_items"),
                line_item: LineItemFields {
                    id: path("id"),
                    name: "product_name".to_string(),
                    quantity: "quantity".to_string(),
                    unit_price: "price".to_string(),
                    total_amount: path("total_price"),
                    taxes: None,
                    tax_exempt: path("tax_exempt"),
                    taxable: None,
                },
                location: LocationFields {
                    id: path("outlet_id"),
                    ..LocationFields::default()
                },
            },
        }
    }
}
