/*!
 * National per-procedure payment averages
 *
 * Averages are computed with one grouped query over the billing records and
 * kept in memory as an immutable map. [`AverageCache`] publishes a map to any
 * number of readers and swaps in a freshly computed one on reload; readers
 * always see either the old map or the new one, never a partial build.
 */

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use rust_decimal::Decimal;
use tracing::info;

use crate::constants::PAYMENT_SCALE;
use crate::store::Database;
use crate::{BillingError, ErrorContext, Result};

// Payments are summed as high and low 32-bit halves. Each half-sum stays
// within SQLite's 64-bit integers for up to 2^31 records per code.
const AVERAGES_SQL: &str = "
    SELECT hcpcs_code,
           SUM(total_payment >> 32),
           SUM(total_payment & 4294967295),
           COUNT(*)
    FROM billing_records
    GROUP BY hcpcs_code";

/// Procedure code -> mean total payment across all billing records with that code
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NationalAverages {
    averages: HashMap<String, Decimal>,
}

impl NationalAverages {
    /// Compute all averages with a single grouped aggregation query
    pub fn compute(db: &Database) -> Result<Self> {
        let mut stmt = db.connection().prepare(AVERAGES_SQL)?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut averages = HashMap::new();
        for row in rows {
            let (code, high, low, count) = row?;
            if count > 0 {
                let sum = (i128::from(high) << 32) + i128::from(low);
                let average = mean(sum, count).ok_or_else(|| BillingError::DataValidation {
                    message: format!("payment total for procedure {} is out of range", code),
                    field: Some("total_payment".to_string()),
                    value: Some(sum.to_string()),
                    context: ErrorContext::default(),
                })?;
                averages.insert(code, average);
            }
        }

        info!(procedure_codes = averages.len(), "national averages computed");
        Ok(Self { averages })
    }

    /// Average payment for a procedure code, `None` when the code has no records
    pub fn get(&self, procedure_code: &str) -> Option<Decimal> {
        self.averages.get(procedure_code).copied()
    }

    /// Number of procedure codes with an average
    pub fn len(&self) -> usize {
        self.averages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.averages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Decimal)> {
        self.averages.iter().map(|(code, avg)| (code.as_str(), *avg))
    }
}

impl FromIterator<(String, Decimal)> for NationalAverages {
    fn from_iter<I: IntoIterator<Item = (String, Decimal)>>(iter: I) -> Self {
        Self {
            averages: iter.into_iter().collect(),
        }
    }
}

/// Exact mean of stored (scaled) payments, `None` past Decimal's 96-bit range
fn mean(scaled_sum: i128, count: i64) -> Option<Decimal> {
    let sum = Decimal::try_from_i128_with_scale(scaled_sum, PAYMENT_SCALE).ok()?;
    sum.checked_div(Decimal::from(count)).map(|avg| avg.normalize())
}

/// Shared, swappable handle to the current averages.
///
/// Readers take an [`Arc`] snapshot and work on it without further
/// synchronization. The lock is only held for the pointer copy or swap.
#[derive(Debug, Default)]
pub struct AverageCache {
    current: RwLock<Arc<NationalAverages>>,
}

impl AverageCache {
    pub fn new(averages: NationalAverages) -> Self {
        Self {
            current: RwLock::new(Arc::new(averages)),
        }
    }

    /// The currently published averages
    pub fn snapshot(&self) -> Arc<NationalAverages> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Average for one code from the current snapshot
    pub fn get(&self, procedure_code: &str) -> Option<Decimal> {
        self.snapshot().get(procedure_code)
    }

    /// Recompute from storage and publish the result.
    ///
    /// The new map is fully built before it replaces the old one; on error the
    /// old map stays published.
    pub fn reload(&self, db: &Database) -> Result<Arc<NationalAverages>> {
        let fresh = Arc::new(NationalAverages::compute(db)?);
        self.publish(Arc::clone(&fresh));
        Ok(fresh)
    }

    fn publish(&self, averages: Arc<NationalAverages>) {
        match self.current.write() {
            Ok(mut guard) => *guard = averages,
            Err(poisoned) => *poisoned.into_inner() = averages,
        }
    }
}
