//! Data normalizer: vendor payloads to [`StandardizedTransaction`] records.
//!
//! [`transform`] is pure and synchronous. A missing transaction id, timestamp or total
//! amount raises `TRANSFORMATION_FAILED`; everything else degrades to defaults.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use crate::error::IntegrationError;
use crate::systems::ExternalSystemType;

pub mod path;
pub mod schema;
pub mod types;
pub mod values;

pub use path::{collect_path, get_path};
pub use schema::{AmountConvention, LineItemFields, LocationFields, TaxLineFields, TransformSchema};
pub use types::{
    Jurisdiction, JurisdictionScope, LineItem, LocationInfo, StandardizedTransaction, TaxLine,
    TaxType, TransactionMetadata, TransactionStatus,
};

const DEFAULT_CURRENCY: &str = "USD";
const TAX_TYPE_KEYS: [&str; 3] = ["type", "taxType", "tax_type"];

pub fn transform(
    payload: &Value,
    schema: &TransformSchema,
) -> Result<StandardizedTransaction, IntegrationError> {
    let record = schema
        .root
        .as_deref()
        .and_then(|root| get_path(payload, root))
        .unwrap_or(payload);
    let convention = schema.amount_convention;

    let transaction_id = get_path(record, &schema.transaction_id)
        .and_then(values::as_string)
        .ok_or_else(|| IntegrationError::transformation_failed("transaction_id"))?;
    let timestamp = get_path(record, &schema.timestamp)
        .and_then(values::parse_timestamp)
        .ok_or_else(|| IntegrationError::transformation_failed("timestamp"))?;
    let total_amount = get_path(record, &schema.total_amount)
        .and_then(|value| values::normalize_amount(value, convention))
        .ok_or_else(|| IntegrationError::transformation_failed("total_amount"))?;

    let tax_lines: Vec<TaxLine> = schema
        .tax_lines
        .as_deref()
        .map(|path| extract_tax_lines(record, path, &schema.tax_line, convention))
        .unwrap_or_default();

    let total_tax = schema
        .total_tax
        .as_deref()
        .and_then(|path| get_path(record, path))
        .and_then(|value| values::normalize_amount(value, convention))
        .unwrap_or_else(|| values::round_cents(tax_lines.iter().map(|line| line.amount).sum()));

    let line_items = schema
        .line_items
        .as_deref()
        .map(|path| {
            collect_path(record, path)
                .into_iter()
                .filter_map(|item| extract_line_item(item, schema, convention))
                .collect()
        })
        .unwrap_or_default();

    let location = extract_location(record, &schema.location);

    let currency = schema
        .currency
        .as_deref()
        .and_then(|path| get_path(record, path))
        .and_then(values::as_string)
        .map(|code| code.to_ascii_uppercase())
        .unwrap_or_else(|| DEFAULT_CURRENCY.to_string());

    let status_raw = schema
        .status
        .as_deref()
        .and_then(|path| get_path(record, path))
        .and_then(values::as_string);

    Ok(StandardizedTransaction {
        transaction_id,
        timestamp,
        total_amount,
        total_tax,
        tax_lines,
        location,
        line_items,
        currency,
        status: TransactionStatus::from_raw(status_raw.as_deref()),
        metadata: TransactionMetadata {
            system: schema.system,
            raw: payload.clone(),
        },
    })
}

fn extract_tax_lines(
    source: &Value,
    path: &str,
    fields: &TaxLineFields,
    convention: AmountConvention,
) -> Vec<TaxLine> {
    collect_path(source, path)
        .into_iter()
        .filter_map(|line| extract_tax_line(line, fields, convention))
        .collect()
}

fn extract_tax_line(
    line: &Value,
    fields: &TaxLineFields,
    convention: AmountConvention,
) -> Option<TaxLine> {
    if !line.is_object() {
        return None;
    }

    let name = get_path(line, &fields.name)
        .and_then(values::as_string)
        .unwrap_or_else(|| "Tax".to_string());
    let rate = fields
        .rate
        .as_deref()
        .and_then(|path| get_path(line, path))
        .and_then(values::normalize_rate);
    let amount = get_path(line, &fields.amount)
        .and_then(|value| values::normalize_amount(value, convention))
        .unwrap_or(0.0);

    let jurisdiction_name = fields
        .jurisdiction
        .as_deref()
        .and_then(|path| get_path(line, path))
        .and_then(values::as_string)
        .unwrap_or_else(|| name.clone());

    let explicit_type = fields
        .tax_type
        .as_deref()
        .into_iter()
        .chain(TAX_TYPE_KEYS)
        .filter_map(|path| get_path(line, path))
        .filter_map(Value::as_str)
        .find_map(TaxType::from_label);
    let tax_type = explicit_type.unwrap_or(if rate.is_some() {
        TaxType::Percentage
    } else {
        TaxType::Fixed
    });

    Some(TaxLine {
        name,
        rate,
        amount,
        jurisdiction: Jurisdiction {
            scope: JurisdictionScope::infer(&jurisdiction_name),
            name: jurisdiction_name,
        },
        tax_type,
    })
}

fn extract_line_item(
    item: &Value,
    schema: &TransformSchema,
    convention: AmountConvention,
) -> Option<LineItem> {
    if !item.is_object() {
        return None;
    }
    let fields = &schema.line_item;

    let quantity = get_path(item, &fields.quantity)
        .and_then(values::parse_number)
        .unwrap_or(1.0);
    let unit_price = get_path(item, &fields.unit_price)
        .and_then(|value| values::normalize_amount(value, convention))
        .unwrap_or(0.0);
    let total_amount = fields
        .total_amount
        .as_deref()
        .and_then(|path| get_path(item, path))
        .and_then(|value| values::normalize_amount(value, convention))
        .unwrap_or_else(|| values::round_cents(unit_price * quantity));

    let tax_lines = fields
        .taxes
        .as_deref()
        .map(|path| extract_tax_lines(item, path, &schema.tax_line, convention))
        .unwrap_or_default();

    let exempt_flag = fields
        .tax_exempt
        .as_deref()
        .and_then(|path| get_path(item, path))
        .and_then(values::as_bool);
    let taxable_flag = fields
        .taxable
        .as_deref()
        .and_then(|path| get_path(item, path))
        .and_then(values::as_bool);

    Some(LineItem {
        id: fields
            .id
            .as_deref()
            .and_then(|path| get_path(item, path))
            .and_then(values::as_string),
        name: get_path(item, &fields.name)
            .and_then(values::as_string)
            .unwrap_or_else(|| "Item".to_string()),
        quantity,
        unit_price,
        total_amount,
        tax_lines,
        tax_exempt: exempt_flag.or(taxable_flag.map(|taxable| !taxable)).unwrap_or(false),
    })
}

fn extract_location(record: &Value, fields: &LocationFields) -> Option<LocationInfo> {
    let read = |path: &Option<String>| {
        path.as_deref()
            .and_then(|path| get_path(record, path))
            .and_then(values::as_string)
    };

    let location = LocationInfo {
        id: read(&fields.id),
        name: read(&fields.name),
        address: read(&fields.address),
        city: read(&fields.city),
        state: read(&fields.state),
        postal_code: read(&fields.postal_code),
        country: read(&fields.country),
    };

    (!location.is_empty()).then_some(location)
}

/// Holds the active transform schema for each system.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    schemas: HashMap<ExternalSystemType, TransformSchema>,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in schemas for every system, with amount conventions taken from
    /// configuration and falling back to each system's default.
    pub fn with_defaults(conventions: &BTreeMap<ExternalSystemType, AmountConvention>) -> Self {
        let mut normalizer = Self::new();
        for system in ExternalSystemType::ALL {
            let convention = conventions
                .get(&system)
                .copied()
                .unwrap_or_else(|| system.default_amount_convention());
            normalizer.register(TransformSchema::default_for(system, convention));
        }
        normalizer
    }

    pub fn register(&mut self, schema: TransformSchema) {
        self.schemas.insert(schema.system, schema);
    }

    pub fn schema(&self, system: ExternalSystemType) -> Option<&TransformSchema> {
        self.schemas.get(&system)
    }

    /// Registered schemas in system order.
    pub fn schemas(&self) -> Vec<TransformSchema> {
        let mut schemas: Vec<_> = self.schemas.values().cloned().collect();
        schemas.sort_by_key(|schema| schema.system);
        schemas
    }

    pub fn transform(
        &self,
        system: ExternalSystemType,
        payload: &Value,
    ) -> Result<StandardizedTransaction, IntegrationError> {
        let schema = self.schema(system).ok_or_else(|| {
            IntegrationError::validation(format!("no transform schema registered for {system}"))
        })?;
        transform(payload, schema)
    }
}
