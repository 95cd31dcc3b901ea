/*!
 * Data type definitions for provider billing records
 *
 * Providers and billing line items as they exist in memory and in storage.
 * A billing record refers to its provider by identifier only; the two are
 * joined by NPI at query time.
 */

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::constants::PAYMENT_SCALE;

/// Provider identifier as it appears in the extract (normally a 10-digit NPI)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Npi(String);

impl Npi {
    /// Create a new identifier. Blank values are rejected, surrounding whitespace is trimmed.
    pub fn new(npi: impl AsRef<str>) -> Option<Self> {
        let trimmed = npi.as_ref().trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Npi(trimmed.to_string()))
        }
    }

    /// Get the NPI as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Npi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A rendering provider. Created once per distinct NPI during ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub npi: Npi,
    pub name: String,
    pub specialty: String,
    pub state: String,
}

/// A billing line item that has not been written to storage yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingLine {
    pub npi: Npi,
    pub procedure_code: String,
    pub procedure_description: String,
    pub place_of_service: String,
    pub service_count: u32,
    pub total_payment: Decimal,
}

/// A stored billing record. `id` is assigned by storage in insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingRecord {
    pub id: i64,
    pub npi: Npi,
    pub procedure_code: String,
    pub procedure_description: String,
    pub place_of_service: String,
    pub service_count: u32,
    pub total_payment: Decimal,
}

/// A billing record together with the national average for its procedure code.
///
/// The average is looked up at query time and is never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedBillingRecord {
    #[serde(flatten)]
    pub record: BillingRecord,
    pub national_average: Option<Decimal>,
}

impl EnrichedBillingRecord {
    /// Payment relative to the national average (`payment - average`), if an average exists
    pub fn difference_from_average(&self) -> Option<Decimal> {
        self.national_average.map(|avg| self.record.total_payment - avg)
    }
}

/// One fully typed row of the extract: the provider attributes it carries and its billing line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRow {
    pub provider: Provider,
    pub line: BillingLine,
}

/// Convert a payment to the integer representation used in storage.
///
/// Payments are rounded half away from zero to `PAYMENT_SCALE` decimal places.
/// Returns `None` for negative amounts and amounts that do not fit in an `i64`.
pub fn payment_to_storage(amount: Decimal) -> Option<i64> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return None;
    }
    let rounded = amount.round_dp_with_strategy(PAYMENT_SCALE, RoundingStrategy::MidpointAwayFromZero);
    let factor = Decimal::from(10_i64.pow(PAYMENT_SCALE));
    rounded.checked_mul(factor)?.trunc().to_i64()
}

/// Convert a stored payment back to a decimal amount
pub fn payment_from_storage(raw: i64) -> Decimal {
    Decimal::new(raw, PAYMENT_SCALE).normalize()
}
