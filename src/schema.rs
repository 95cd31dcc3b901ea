/*!
 * Schema definitions for billing extracts and the relational store
 *
 * This module maps the logical columns of a billing extract to the header
 * spellings seen in the wild, and holds the table and index definitions used
 * by the store.
 */

use csv::StringRecord;

/// Logical columns recognized in a billing extract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BillingColumn {
    Npi,
    ProviderName,
    Specialty,
    State,
    ProcedureCode,
    ProcedureDescription,
    PlaceOfService,
    ServiceCount,
    TotalPayment,
}

impl BillingColumn {
    /// All logical columns in extract order
    pub const ALL: [BillingColumn; 9] = [
        BillingColumn::Npi,
        BillingColumn::ProviderName,
        BillingColumn::Specialty,
        BillingColumn::State,
        BillingColumn::ProcedureCode,
        BillingColumn::ProcedureDescription,
        BillingColumn::PlaceOfService,
        BillingColumn::ServiceCount,
        BillingColumn::TotalPayment,
    ];

    /// Accepted header spellings, lowercase. The CMS name comes first.
    pub fn aliases(self) -> &'static [&'static str] {
        match self {
            BillingColumn::Npi => &["rndrng_npi", "npi", "provider_id", "provider_npi"],
            BillingColumn::ProviderName => &[
                "rndrng_prvdr_last_org_name",
                "provider_name",
                "name",
            ],
            BillingColumn::Specialty => &["rndrng_prvdr_type", "specialty", "provider_type"],
            BillingColumn::State => &["rndrng_prvdr_state_abrvtn", "state", "provider_state"],
            BillingColumn::ProcedureCode => &["hcpcs_cd", "hcpcs_code", "procedure_code"],
            BillingColumn::ProcedureDescription => &[
                "hcpcs_desc",
                "hcpcs_description",
                "procedure_description",
            ],
            BillingColumn::PlaceOfService => &["place_of_srvc", "place_of_service"],
            BillingColumn::ServiceCount => &["tot_srvcs", "service_count", "number_of_services"],
            BillingColumn::TotalPayment => &[
                "avg_mdcr_pymt_amt",
                "total_payment",
                "total_medicare_payment",
            ],
        }
    }

    /// Canonical (CMS) header name
    pub fn header_name(self) -> &'static str {
        self.aliases()[0]
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Normalize a raw header cell for matching: trim, drop a UTF-8 BOM, lowercase
pub fn normalize_header(raw: &str) -> String {
    raw.trim().trim_start_matches('\u{feff}').trim().to_lowercase()
}

/// Resolved positions of the logical columns within a concrete header row.
///
/// Unknown headers are ignored and missing columns resolve to `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    positions: [Option<usize>; 9],
}

impl HeaderMap {
    /// Resolve logical columns against a header row (case-insensitive).
    ///
    /// When several headers match the same column, the leftmost one wins.
    pub fn from_headers<'h, I>(headers: I) -> Self
    where
        I: IntoIterator<Item = &'h str>,
    {
        let mut positions = [None; 9];

        for (position, header) in headers.into_iter().enumerate() {
            let normalized = normalize_header(header);
            for column in BillingColumn::ALL {
                let slot = &mut positions[column.index()];
                if slot.is_none() && column.aliases().contains(&normalized.as_str()) {
                    *slot = Some(position);
                }
            }
        }

        Self { positions }
    }

    /// Position of a logical column, if the header row contains it
    pub fn position(&self, column: BillingColumn) -> Option<usize> {
        self.positions[column.index()]
    }

    /// Read a logical column from a record. Blank cells are reported as `None`.
    pub fn get<'r>(&self, record: &'r StringRecord, column: BillingColumn) -> Option<&'r str> {
        self.position(column)
            .and_then(|idx| record.get(idx))
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Logical columns that the header row does not provide
    pub fn missing_columns(&self) -> Vec<BillingColumn> {
        BillingColumn::ALL
            .into_iter()
            .filter(|c| self.position(*c).is_none())
            .collect()
    }
}

/// Table definitions. Payments are INTEGER ten-thousandths of a currency unit.
pub const CREATE_TABLES_SQL: &str = "
    CREATE TABLE providers (
        npi            TEXT PRIMARY KEY NOT NULL,
        provider_name  TEXT NOT NULL,
        specialty      TEXT NOT NULL,
        state          TEXT NOT NULL
    );
    CREATE TABLE billing_records (
        id                     INTEGER PRIMARY KEY,
        npi                    TEXT NOT NULL REFERENCES providers(npi),
        hcpcs_code             TEXT NOT NULL,
        hcpcs_description      TEXT NOT NULL,
        place_of_service       TEXT NOT NULL,
        number_of_services     INTEGER NOT NULL CHECK (number_of_services >= 0),
        total_payment          INTEGER NOT NULL CHECK (total_payment >= 0)
    );
";

/// Drops both tables, children first
pub const DROP_TABLES_SQL: &str = "
    DROP TABLE IF EXISTS billing_records;
    DROP TABLE IF EXISTS providers;
";

/// A secondary index maintained around bulk loads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecondaryIndex {
    pub name: &'static str,
    pub table: &'static str,
    pub column: &'static str,
}

impl SecondaryIndex {
    pub fn create_sql(&self) -> String {
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {}({})",
            self.name, self.table, self.column
        )
    }

    pub fn drop_sql(&self) -> String {
        format!("DROP INDEX IF EXISTS {}", self.name)
    }
}

/// Every secondary index of the store
pub const SECONDARY_INDEXES: [SecondaryIndex; 4] = [
    SecondaryIndex { name: "ix_billing_records_npi", table: "billing_records", column: "npi" },
    SecondaryIndex {
        name: "ix_billing_records_hcpcs_code",
        table: "billing_records",
        column: "hcpcs_code",
    },
    SecondaryIndex { name: "ix_providers_specialty", table: "providers", column: "specialty" },
    SecondaryIndex { name: "ix_providers_state", table: "providers", column: "state" },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_matching_is_case_insensitive() {
        let headers = ["Rndrng_NPI", "HCPCS_CD", "Tot_Srvcs", "AVG_MDCR_PYMT_AMT", "Extra_Column"];
        let map = HeaderMap::from_headers(headers);

        assert_eq!(map.position(BillingColumn::Npi), Some(0));
        assert_eq!(map.position(BillingColumn::ProcedureCode), Some(1));
        assert_eq!(map.position(BillingColumn::ServiceCount), Some(2));
        assert_eq!(map.position(BillingColumn::TotalPayment), Some(3));
        assert_eq!(map.position(BillingColumn::State), None);
    }

    #[test]
    fn test_missing_columns_are_reported() {
        let map = HeaderMap::from_headers(["npi", "service_count", "total_payment"]);
        let missing = map.missing_columns();

        assert_eq!(missing.len(), 6);
        assert!(missing.contains(&BillingColumn::ProviderName));
        assert!(!missing.contains(&BillingColumn::Npi));
    }

    #[test]
    fn test_bom_and_whitespace_in_headers() {
        let map = HeaderMap::from_headers(["\u{feff}Rndrng_NPI ", " place_of_srvc"]);
        assert_eq!(map.position(BillingColumn::Npi), Some(0));
        assert_eq!(map.position(BillingColumn::PlaceOfService), Some(1));
    }

    #[test]
    fn test_blank_cells_read_as_none() {
        let map = HeaderMap::from_headers(["npi", "state"]);
        let record = StringRecord::from(vec!["1003000126", "  "]);

        assert_eq!(map.get(&record, BillingColumn::Npi), Some("1003000126"));
        assert_eq!(map.get(&record, BillingColumn::State), None);
        assert_eq!(map.get(&record, BillingColumn::Specialty), None);
    }

    #[test]
    fn test_index_sql() {
        let sql = SECONDARY_INDEXES[0].create_sql();
        assert_eq!(sql, "CREATE INDEX IF NOT EXISTS ix_billing_records_npi ON billing_records(npi)");
        assert_eq!(SECONDARY_INDEXES[3].drop_sql(), "DROP INDEX IF EXISTS ix_providers_state");
    }
}
