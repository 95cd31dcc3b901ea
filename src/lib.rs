/*!
 * # Medical Billing Data Library
 *
 * Ingests provider/procedure billing extracts (such as the CMS "Medicare
 * Physician & Other Practitioners - by Provider and Service" files) into a
 * SQLite database, computes national per-procedure payment averages and
 * answers provider search and top-billing queries.
 *
 * ## Features
 *
 * - **Full-refresh bulk load**: every ingestion replaces the previous data,
 *   committed in fixed-size batches with indexes rebuilt at the end
 * - **Exact currency**: payments are `rust_decimal::Decimal` in memory and
 *   scaled integers on disk, so sums and averages never drift
 * - **Shared averages**: one immutable snapshot per load, swapped atomically
 *   on reload while queries keep running
 * - **Tolerant parsing**: case-insensitive headers, CMS and plain column
 *   names, defective rows skipped and counted
 *
 * ## Quick Start
 *
 * ```no_run
 * use medbill::prelude::*;
 *
 * # fn main() -> Result<()> {
 * let dataset = BillingDatasetBuilder::new()
 *     .database("billing.db")
 *     .input_file("data/extract.csv")
 *     .build()?;
 *
 * let queries = dataset.queries()?;
 * let page = queries.search_providers(&ProviderSearch::new().state("CA").page_size(10))?;
 * println!("{} providers in CA", page.total_count);
 *
 * for row in queries.top_billing_records("1003000126", None)? {
 *     println!(
 *         "{} {} vs national {:?}",
 *         row.record.procedure_code, row.record.total_payment, row.national_average
 *     );
 * }
 * # Ok(())
 * # }
 * ```
 *
 * ## Opening an existing database
 *
 * ```no_run
 * # use medbill::prelude::*;
 * # fn main() -> Result<()> {
 * let dataset = BillingDataset::open("billing.db")?;
 * let specialties = dataset.queries()?.distinct_specialties()?;
 * # Ok(())
 * # }
 * ```
 *
 * ## Configuration
 *
 * ```no_run
 * # use medbill::prelude::*;
 * # fn main() -> Result<()> {
 * // defaults <- ~/.config/medbill/config.toml <- MEDBILL_* env vars
 * let config = BillingConfig::load()?;
 *
 * // Or build your own
 * let config = ConfigBuilder::new()
 *     .batch_size(5_000)
 *     .progress_bar(false)
 *     .build()?;
 * # Ok(())
 * # }
 * ```
 */

// Re-export error types from root
pub use error::{BillingError, ErrorContext, Result};

// Public modules
pub mod aggregation;
pub mod config;
pub mod data_types;
pub mod dataset;
pub mod error;
pub mod loader;
pub mod query;
pub mod reader;
pub mod schema;
pub mod store;

/// Prelude module for convenient imports
///
/// Import everything you need with:
/// ```
/// use medbill::prelude::*;
/// ```
pub mod prelude {
    pub use crate::aggregation::{AverageCache, NationalAverages};
    pub use crate::config::{BillingConfig, ConfigBuilder};
    pub use crate::data_types::*;
    pub use crate::dataset::{BillingDataset, BillingDatasetBuilder, DatasetStatistics};
    pub use crate::error::{BillingError, Result};
    pub use crate::loader::{BulkLoader, IngestSummary, LoadProgress};
    pub use crate::query::{ProviderPage, ProviderSearch, QueryService};
    pub use crate::reader::{BillingReader, ParseStats};
    pub use crate::store::Database;
}

/// Billing data constants
pub mod constants {
    /// Decimal places kept for stored payment amounts
    pub const PAYMENT_SCALE: u32 = 4;

    /// Billing records per insert transaction
    pub const DEFAULT_BATCH_SIZE: usize = 20_000;

    /// Providers per search page when none is requested
    pub const DEFAULT_PAGE_SIZE: u32 = 25;

    /// Maximum rows returned by a top billing records query
    pub const TOP_RECORDS_LIMIT: usize = 10;

    /// Fallback for a blank provider name, specialty or state
    pub const UNKNOWN_PROVIDER_FIELD: &str = "Unknown";

    /// Fallback for a blank procedure code
    pub const UNKNOWN_PROCEDURE_CODE: &str = "UNKNOWN";

    /// Fallback for a blank procedure description or place of service
    pub const NOT_AVAILABLE: &str = "N/A";

    /// Skipped rows logged individually before going quiet
    pub const SKIP_WARNING_LIMIT: usize = 10;
}
