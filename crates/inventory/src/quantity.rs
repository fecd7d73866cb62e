//! Quantity rules shared by resources, requests and donations.
//!
//! Quantities are stored as `NUMERIC(10, 2)`: two fractional digits and an
//! absolute value below 10^8.

use rust_decimal::Decimal;

use reliefops_core::{DomainError, DomainResult};

/// Fractional digits a quantity may carry.
pub const QUANTITY_SCALE: u32 = 2;

/// Exclusive upper bound for any stored quantity.
pub fn quantity_limit() -> Decimal {
    Decimal::from(100_000_000i64)
}

/// Check that `value` fits the storage format.
pub fn ensure_representable(field: &str, value: Decimal) -> DomainResult<()> {
    if value.normalize().scale() > QUANTITY_SCALE {
        return Err(DomainError::validation(format!(
            "{field} must have at most {QUANTITY_SCALE} decimal places"
        )));
    }
    if value.abs() >= quantity_limit() {
        return Err(DomainError::validation(format!("{field} is out of range")));
    }
    Ok(())
}

/// Check that `value` is representable and strictly positive.
pub fn ensure_positive(field: &str, value: Decimal) -> DomainResult<()> {
    ensure_representable(field, value)?;
    if value <= Decimal::ZERO {
        return Err(DomainError::validation(format!("{field} must be greater than zero")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_two_decimal_places() {
        assert!(ensure_positive("quantity", Decimal::new(1250, 2)).is_ok());
        assert!(ensure_positive("quantity", Decimal::new(12500, 3)).is_ok());
    }

    #[test]
    fn rejects_extra_precision_and_overflow() {
        assert!(ensure_representable("quantity", Decimal::new(1, 3)).is_err());
        assert!(ensure_representable("quantity", quantity_limit()).is_err());
    }

    #[test]
    fn zero_is_not_positive() {
        assert!(matches!(
            ensure_positive("quantity_delta", Decimal::ZERO),
            Err(DomainError::Validation(_))
        ));
    }
}
