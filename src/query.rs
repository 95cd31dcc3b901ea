/*!
 * Query service over a loaded billing database
 *
 * Provider search composes optional filters into one WHERE clause, counts the
 * matches, then fetches the requested page. Top billing records are ranked in
 * memory and enriched from the national averages snapshot.
 */

use std::cmp::Ordering;
use std::sync::{Arc, RwLock, RwLockReadGuard};

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use serde::Serialize;
use tracing::debug;

use crate::{
    aggregation::AverageCache,
    constants::{DEFAULT_PAGE_SIZE, TOP_RECORDS_LIMIT},
    data_types::*,
    store::Database,
    Result,
};

/// Provider search request.
///
/// `page` is 1-based. A `page` or `page_size` of zero selects nothing: the
/// result page is empty but `total_count` is still reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSearch {
    pub search: Option<String>,
    pub state: Option<String>,
    pub specialty: Option<String>,
    pub page: u32,
    pub page_size: u32,
}

impl Default for ProviderSearch {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderSearch {
    /// First page of all providers
    pub fn new() -> Self {
        Self {
            search: None,
            state: None,
            specialty: None,
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Substring matched against NPI or provider name
    pub fn search(mut self, text: impl Into<String>) -> Self {
        self.search = Some(text.into());
        self
    }

    /// Exact state filter
    pub fn state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    /// Exact specialty filter
    pub fn specialty(mut self, specialty: impl Into<String>) -> Self {
        self.specialty = Some(specialty.into());
        self
    }

    pub fn page(mut self, page: u32) -> Self {
        self.page = page;
        self
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Build the WHERE clause and its parameters. Blank filters add nothing.
    fn predicate(&self) -> (String, Vec<Value>) {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(text) = non_blank(&self.search) {
            clauses.push("(instr(npi, ?) > 0 OR instr(provider_name, ?) > 0)");
            values.push(Value::Text(text.to_string()));
            values.push(Value::Text(text.to_string()));
        }
        if let Some(state) = non_blank(&self.state) {
            clauses.push("state = ?");
            values.push(Value::Text(state.to_string()));
        }
        if let Some(specialty) = non_blank(&self.specialty) {
            clauses.push("specialty = ?");
            values.push(Value::Text(specialty.to_string()));
        }

        if clauses.is_empty() {
            (String::new(), values)
        } else {
            (format!(" WHERE {}", clauses.join(" AND ")), values)
        }
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

/// One page of provider search results
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderPage {
    pub providers: Vec<Provider>,
    /// Matches across all pages
    pub total_count: usize,
    pub page: u32,
    pub page_size: u32,
}

impl ProviderPage {
    /// Number of pages needed for `total_count` at this page size
    pub fn total_pages(&self) -> usize {
        if self.page_size == 0 {
            0
        } else {
            self.total_count.div_ceil(self.page_size as usize)
        }
    }
}

/// Lock shared by a dataset and the query services it hands out. Ingestion
/// holds it exclusively, every query holds it shared.
pub(crate) type ReadyGate = Arc<RwLock<()>>;

/// Read-only queries against a loaded database.
///
/// Each service owns its own connection; create one per thread and share the
/// [`AverageCache`] between them. Services obtained from
/// [`BillingDataset::queries`](crate::dataset::BillingDataset::queries) wait
/// while that dataset re-ingests.
pub struct QueryService {
    db: Database,
    averages: Arc<AverageCache>,
    gate: ReadyGate,
}

impl QueryService {
    /// A standalone service; nothing else gates its queries
    pub fn new(db: Database, averages: Arc<AverageCache>) -> Self {
        Self::gated(db, averages, ReadyGate::default())
    }

    pub(crate) fn gated(db: Database, averages: Arc<AverageCache>, gate: ReadyGate) -> Self {
        Self { db, averages, gate }
    }

    /// Blocks while an ingestion holds the gate
    fn ready(&self) -> RwLockReadGuard<'_, ()> {
        match self.gate.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn averages(&self) -> &Arc<AverageCache> {
        &self.averages
    }

    /// Filtered, paginated provider search ordered by NPI ascending
    pub fn search_providers(&self, request: &ProviderSearch) -> Result<ProviderPage> {
        let _ready = self.ready();
        let (where_clause, mut values) = request.predicate();
        let conn = self.db.connection();

        let count_sql = format!("SELECT COUNT(*) FROM providers{}", where_clause);
        let total: i64 = conn.query_row(&count_sql, params_from_iter(values.iter()), |row| row.get(0))?;

        let mut providers = Vec::new();
        if let Some(offset) = page_offset(request.page, request.page_size) {
            values.push(Value::Integer(i64::from(request.page_size)));
            values.push(Value::Integer(offset));

            let page_sql = format!(
                "SELECT npi, provider_name, specialty, state FROM providers{} ORDER BY npi LIMIT ? OFFSET ?",
                where_clause
            );
            let mut stmt = conn.prepare(&page_sql)?;
            providers = stmt
                .query_map(params_from_iter(values.iter()), provider_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
        }

        debug!(total, returned = providers.len(), page = request.page, "provider search");

        Ok(ProviderPage {
            providers,
            total_count: total as usize,
            page: request.page,
            page_size: request.page_size,
        })
    }

    /// Look up a single provider
    pub fn get_provider(&self, npi: &str) -> Result<Option<Provider>> {
        let _ready = self.ready();
        let provider = self
            .db
            .connection()
            .query_row(
                "SELECT npi, provider_name, specialty, state FROM providers WHERE npi = ?1",
                params![npi],
                provider_from_row,
            )
            .optional()?;
        Ok(provider)
    }

    /// All distinct provider states, ascending
    pub fn distinct_states(&self) -> Result<Vec<String>> {
        self.distinct("SELECT DISTINCT state FROM providers ORDER BY state", None)
    }

    /// All distinct provider specialties, ascending
    pub fn distinct_specialties(&self) -> Result<Vec<String>> {
        self.distinct("SELECT DISTINCT specialty FROM providers ORDER BY specialty", None)
    }

    /// Distinct places of service among one provider's billing records, ascending
    pub fn distinct_places_of_service(&self, npi: &str) -> Result<Vec<String>> {
        self.distinct(
            "SELECT DISTINCT place_of_service FROM billing_records
             WHERE npi = ?1 ORDER BY place_of_service",
            Some(npi),
        )
    }

    fn distinct(&self, sql: &str, npi: Option<&str>) -> Result<Vec<String>> {
        let _ready = self.ready();
        let mut stmt = self.db.connection().prepare(sql)?;
        let values = match npi {
            Some(npi) => stmt.query_map(params![npi], text_column)?,
            None => stmt.query_map([], text_column)?,
        }
        .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(values)
    }

    /// A provider's highest-paid billing records with their national averages.
    ///
    /// Returns at most ten records, highest payment first; equal payments keep
    /// file order (record id ascending).
    pub fn top_billing_records(
        &self,
        npi: &str,
        place_of_service: Option<&str>,
    ) -> Result<Vec<EnrichedBillingRecord>> {
        let _ready = self.ready();
        let place = place_of_service.filter(|p| !p.trim().is_empty());
        let mut sql = String::from(
            "SELECT id, npi, hcpcs_code, hcpcs_description, place_of_service,
                    number_of_services, total_payment
             FROM billing_records WHERE npi = ?1",
        );
        if place.is_some() {
            sql.push_str(" AND place_of_service = ?2");
        }

        let mut stmt = self.db.connection().prepare(&sql)?;
        let records = match place {
            Some(place) => stmt.query_map(params![npi, place], record_from_row)?,
            None => stmt.query_map(params![npi], record_from_row)?,
        }
        .collect::<rusqlite::Result<Vec<_>>>()?;

        let averages = self.averages.snapshot();
        let enriched = rank_top(records, TOP_RECORDS_LIMIT)
            .into_iter()
            .map(|record| EnrichedBillingRecord {
                national_average: averages.get(&record.procedure_code),
                record,
            })
            .collect();

        Ok(enriched)
    }
}

/// Rows skipped before the requested page, `None` when the page selects nothing.
/// An offset too large for SQLite is past the end of any table.
fn page_offset(page: u32, page_size: u32) -> Option<i64> {
    if page == 0 || page_size == 0 {
        return None;
    }
    (i64::from(page) - 1).checked_mul(i64::from(page_size))
}

/// Highest payments first, ties broken by record id ascending, truncated to `limit`
pub(crate) fn rank_top(mut records: Vec<BillingRecord>, limit: usize) -> Vec<BillingRecord> {
    records.sort_by(|a, b| match b.total_payment.cmp(&a.total_payment) {
        Ordering::Equal => a.id.cmp(&b.id),
        other => other,
    });
    records.truncate(limit);
    records
}

fn text_column(row: &Row<'_>) -> rusqlite::Result<String> {
    row.get(0)
}

fn provider_from_row(row: &Row<'_>) -> rusqlite::Result<Provider> {
    let npi: String = row.get(0)?;
    Ok(Provider {
        npi: stored_npi(npi, 0)?,
        name: row.get(1)?,
        specialty: row.get(2)?,
        state: row.get(3)?,
    })
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<BillingRecord> {
    let npi: String = row.get(1)?;
    Ok(BillingRecord {
        id: row.get(0)?,
        npi: stored_npi(npi, 1)?,
        procedure_code: row.get(2)?,
        procedure_description: row.get(3)?,
        place_of_service: row.get(4)?,
        service_count: row.get(5)?,
        total_payment: payment_from_storage(row.get(6)?),
    })
}

/// Stored NPIs are never blank; a blank one means the file was written by something else
fn stored_npi(raw: String, column: usize) -> rusqlite::Result<Npi> {
    Npi::new(&raw).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(column, "npi".to_string(), rusqlite::types::Type::Text)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn record(id: i64, cents: i64) -> BillingRecord {
        BillingRecord {
            id,
            npi: Npi::new("1000000001").unwrap(),
            procedure_code: "X".to_string(),
            procedure_description: "D".to_string(),
            place_of_service: "O".to_string(),
            service_count: 1,
            total_payment: Decimal::new(cents, 2),
        }
    }

    #[test]
    fn test_rank_top_orders_by_payment_then_id() {
        let records = vec![record(1, 500), record(2, 900), record(3, 500), record(4, 100)];
        let ids: Vec<i64> = rank_top(records, 10).iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![2, 1, 3, 4]);
    }

    #[test]
    fn test_rank_top_tie_break_ignores_input_order() {
        let records = vec![record(7, 500), record(3, 500), record(5, 500)];
        let ids: Vec<i64> = rank_top(records, 2).iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 5]);
    }

    #[test]
    fn test_predicate_skips_blank_filters() {
        let request = ProviderSearch::new().search("  ").state("").specialty("Cardiology");
        let (clause, values) = request.predicate();
        assert_eq!(clause, " WHERE specialty = ?");
        assert_eq!(values, vec![Value::Text("Cardiology".to_string())]);
    }

    #[test]
    fn test_page_offset() {
        assert_eq!(page_offset(1, 25), Some(0));
        assert_eq!(page_offset(3, 25), Some(50));
        assert_eq!(page_offset(0, 25), None);
        assert_eq!(page_offset(2, 0), None);
        assert_eq!(page_offset(u32::MAX, u32::MAX), None);
        assert_eq!(page_offset(u32::MAX, 1), Some(i64::from(u32::MAX) - 1));
    }

    #[test]
    fn test_total_pages() {
        let page = ProviderPage { providers: vec![], total_count: 5, page: 1, page_size: 2 };
        assert_eq!(page.total_pages(), 3);
        let page = ProviderPage { providers: vec![], total_count: 5, page: 1, page_size: 0 };
        assert_eq!(page.total_pages(), 0);
    }
}
