//! Required-field checks for MIGO transfer requests, run before any SAP call.

use serde_json::Value;

use crate::error::AppError;

/// Fields every element of `TransferItemSet` must carry.
pub const TRANSFER_ITEM_FIELDS: [&str; 12] = [
    "Material",
    "Plant",
    "StgeLoc",
    "Quantity",
    "EntryUom",
    "Batch",
    "SalesOrder",
    "SoItem",
    "SpecStock",
    "StgeLocTo",
    "BatchTo",
    "MoveType",
];

/// Fields of the single-movement request shape.
pub const LEGACY_TRANSFER_FIELDS: [&str; 11] = [
    "salesOrder",
    "salesOrderItem",
    "movementType",
    "storageLocationTo",
    "specialStock",
    "MATNR",
    "Werks",
    "LGORT",
    "QTY",
    "MEINS",
    "Charg",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferShape {
    Items,
    Legacy,
}

impl TransferShape {
    pub fn detect(body: &Value) -> Self {
        match body.get("TransferItemSet") {
            Some(Value::Array(items)) if !items.is_empty() => TransferShape::Items,
            _ => TransferShape::Legacy,
        }
    }
}

/// Reject `body` with every missing field named, across all items.
pub fn validate_transfer(body: &Value) -> Result<TransferShape, AppError> {
    let shape = TransferShape::detect(body);

    match shape {
        TransferShape::Items => {
            let items = body
                .get("TransferItemSet")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();

            let invalid: Vec<String> = items
                .iter()
                .enumerate()
                .filter_map(|(index, item)| {
                    let missing = missing_fields(item, &TRANSFER_ITEM_FIELDS);
                    (!missing.is_empty())
                        .then(|| format!("Item {} missing: {}", index + 1, missing.join(", ")))
                })
                .collect();

            if !invalid.is_empty() {
                return Err(AppError::Validation(format!(
                    "Invalid items: {}",
                    invalid.join("; ")
                )));
            }
        }
        TransferShape::Legacy => {
            let missing = missing_fields(body, &LEGACY_TRANSFER_FIELDS);
            if !missing.is_empty() {
                return Err(AppError::Validation(format!(
                    "Missing required fields: {}",
                    missing.join(", ")
                )));
            }
        }
    }

    Ok(shape)
}

fn missing_fields<'a>(object: &Value, fields: &[&'a str]) -> Vec<&'a str> {
    fields
        .iter()
        .copied()
        .filter(|field| !object.get(*field).is_some_and(is_present))
        .collect()
}

/// Mirrors how the frontend marks a field as filled: empty strings, zero,
/// `false` and `null` count as absent.
fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0 && !n.is_nan()),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
