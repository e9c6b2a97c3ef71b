//! Input validation for reserve requests.

use store::{Address, CartLine};

use crate::error::{EngineError, Result};

/// Smallest quantity a single line may request.
pub const MIN_LINE_QUANTITY: u32 = 1;

/// Largest quantity a single line may request.
pub const MAX_LINE_QUANTITY: u32 = 5;

/// Rejects empty carts, out-of-range quantities, duplicate product lines,
/// and incomplete addresses. Shipping methods are validated by type at the
/// transport boundary; an unrecognized method never reaches the engine.
pub fn validate_reserve(lines: &[CartLine], address: &Address) -> Result<()> {
    if lines.is_empty() {
        return Err(EngineError::Validation("cart is empty".to_string()));
    }

    for line in lines {
        if line.quantity < MIN_LINE_QUANTITY || line.quantity > MAX_LINE_QUANTITY {
            return Err(EngineError::Validation(format!(
                "quantity {} for product {} is outside [{MIN_LINE_QUANTITY}, {MAX_LINE_QUANTITY}]",
                line.quantity, line.product_id
            )));
        }
    }

    for (i, line) in lines.iter().enumerate() {
        if lines[..i].iter().any(|l| l.product_id == line.product_id) {
            return Err(EngineError::Validation(format!(
                "duplicate line for product {}",
                line.product_id
            )));
        }
    }

    let required = [
        ("name", &address.name),
        ("phone", &address.phone),
        ("line1", &address.line1),
        ("city", &address.city),
        ("state", &address.state),
        ("pincode", &address.pincode),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(EngineError::Validation(format!(
                "address field '{field}' is required"
            )));
        }
    }

    Ok(())
}
