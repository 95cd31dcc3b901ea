/*!
 * Streaming CSV reader for billing extracts
 *
 * This module turns a delimited billing extract into a lazy sequence of typed
 * rows. Headers are matched case-insensitively by semantic name, defective
 * rows are dropped and counted, and cosmetic gaps are filled with fallback
 * values. Nothing untyped leaves this module.
 */

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use csv::{ReaderBuilder, StringRecord, StringRecordsIntoIter};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::{
    constants::*,
    data_types::*,
    schema::{BillingColumn, HeaderMap},
    BillingError, ErrorContext, Result,
};

/// Why a row was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Provider identifier blank or absent
    MissingNpi,
    /// Service count absent, negative, or not an integer
    InvalidServiceCount,
    /// Payment absent, negative, not a decimal, or too large to store
    InvalidPayment,
    /// The CSV layer could not decode the row
    Malformed,
}

/// Diagnostic counts collected while reading an extract
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseStats {
    /// Data rows seen (excluding the header)
    pub rows_read: usize,
    /// Rows converted into typed rows
    pub rows_parsed: usize,
    pub missing_npi: usize,
    pub invalid_service_count: usize,
    pub invalid_payment: usize,
    pub malformed: usize,
}

impl ParseStats {
    /// Total rows dropped for any reason
    pub fn rows_skipped(&self) -> usize {
        self.missing_npi + self.invalid_service_count + self.invalid_payment + self.malformed
    }

    fn record_skip(&mut self, reason: SkipReason) {
        match reason {
            SkipReason::MissingNpi => self.missing_npi += 1,
            SkipReason::InvalidServiceCount => self.invalid_service_count += 1,
            SkipReason::InvalidPayment => self.invalid_payment += 1,
            SkipReason::Malformed => self.malformed += 1,
        }
    }
}

/// A row as found in the extract: every logical column as an optional string
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRow {
    pub npi: Option<String>,
    pub provider_name: Option<String>,
    pub specialty: Option<String>,
    pub state: Option<String>,
    pub procedure_code: Option<String>,
    pub procedure_description: Option<String>,
    pub place_of_service: Option<String>,
    pub service_count: Option<String>,
    pub total_payment: Option<String>,
}

impl RawRow {
    /// Pull the logical columns out of a CSV record
    pub fn from_record(headers: &HeaderMap, record: &StringRecord) -> Self {
        let get = |column| headers.get(record, column).map(str::to_string);

        Self {
            npi: get(BillingColumn::Npi),
            provider_name: get(BillingColumn::ProviderName),
            specialty: get(BillingColumn::Specialty),
            state: get(BillingColumn::State),
            procedure_code: get(BillingColumn::ProcedureCode),
            procedure_description: get(BillingColumn::ProcedureDescription),
            place_of_service: get(BillingColumn::PlaceOfService),
            service_count: get(BillingColumn::ServiceCount),
            total_payment: get(BillingColumn::TotalPayment),
        }
    }

    /// Convert to strict types, or report why the row must be dropped
    pub fn into_parsed(self) -> std::result::Result<ParsedRow, SkipReason> {
        let npi = self
            .npi
            .as_deref()
            .and_then(Npi::new)
            .ok_or(SkipReason::MissingNpi)?;

        let service_count = self
            .service_count
            .as_deref()
            .and_then(parse_service_count)
            .ok_or(SkipReason::InvalidServiceCount)?;

        let total_payment = self
            .total_payment
            .as_deref()
            .and_then(parse_payment)
            .ok_or(SkipReason::InvalidPayment)?;

        let or_fallback = |value: Option<String>, fallback: &str| {
            value.unwrap_or_else(|| fallback.to_string())
        };

        let provider = Provider {
            npi: npi.clone(),
            name: or_fallback(self.provider_name, UNKNOWN_PROVIDER_FIELD),
            specialty: or_fallback(self.specialty, UNKNOWN_PROVIDER_FIELD),
            state: or_fallback(self.state, UNKNOWN_PROVIDER_FIELD),
        };

        let line = BillingLine {
            npi,
            procedure_code: or_fallback(self.procedure_code, UNKNOWN_PROCEDURE_CODE),
            procedure_description: or_fallback(self.procedure_description, NOT_AVAILABLE),
            place_of_service: or_fallback(self.place_of_service, NOT_AVAILABLE),
            service_count,
            total_payment,
        };

        Ok(ParsedRow { provider, line })
    }
}

fn parse_service_count(value: &str) -> Option<u32> {
    value.trim().parse::<u32>().ok()
}

fn parse_payment(value: &str) -> Option<Decimal> {
    let amount = Decimal::from_str(value.trim()).ok()?;
    // Rejects negatives and amounts the store cannot represent
    payment_to_storage(amount)?;
    Some(amount)
}

/// Reader configuration for billing extracts
#[derive(Debug, Clone)]
pub struct BillingReader {
    delimiter: u8,
}

impl Default for BillingReader {
    fn default() -> Self {
        Self::new()
    }
}

impl BillingReader {
    /// Create a reader for comma-delimited extracts
    pub fn new() -> Self {
        Self { delimiter: b',' }
    }

    /// Use a different field delimiter (e.g. `b'\t'` or `b'|'`)
    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Open an extract on disk. Fails before reading anything if the file is missing.
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<BillingRows<File>> {
        let path = path.as_ref();

        if !path.is_file() {
            return Err(BillingError::file_not_found_with_suggestion(path.to_path_buf()));
        }

        let file = File::open(path).map_err(|e| BillingError::Io {
            message: format!("cannot open {}: {}", path.display(), e),
            source: e,
            context: ErrorContext {
                file_path: Some(path.to_path_buf()),
                ..Default::default()
            },
        })?;

        let mut rows = self.open_reader(file)?;
        rows.path = Some(path.to_path_buf());
        Ok(rows)
    }

    /// Read an extract from any byte source
    pub fn open_reader<R: Read>(&self, source: R) -> Result<BillingRows<R>> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .delimiter(self.delimiter)
            .from_reader(source);

        let headers = HeaderMap::from_headers(reader.headers()?.iter());
        let missing = headers.missing_columns();
        if !missing.is_empty() {
            let names: Vec<&str> = missing.iter().map(|c| c.header_name()).collect();
            warn!(missing = ?names, "extract header row lacks recognized columns");
        }

        Ok(BillingRows {
            records: reader.into_records(),
            headers,
            stats: ParseStats::default(),
            path: None,
            finished: false,
        })
    }
}

/// Lazy, single-pass sequence of typed rows from an extract.
///
/// Defective rows are skipped and counted in [`ParseStats`]. Only I/O
/// failures surface as errors, after which the sequence ends.
pub struct BillingRows<R: Read> {
    records: StringRecordsIntoIter<R>,
    headers: HeaderMap,
    stats: ParseStats,
    path: Option<PathBuf>,
    finished: bool,
}

impl<R: Read> BillingRows<R> {
    /// Counts collected so far
    pub fn stats(&self) -> ParseStats {
        self.stats
    }

    /// Header resolution used for this extract
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn log_skip(&self, reason: SkipReason) {
        // Only the first few are worth a warning on multi-million row files
        if self.stats.rows_skipped() <= SKIP_WARNING_LIMIT {
            warn!(row = self.stats.rows_read, ?reason, "skipping billing row");
        } else {
            debug!(row = self.stats.rows_read, ?reason, "skipping billing row");
        }
    }
}

impl<R: Read> Iterator for BillingRows<R> {
    type Item = Result<ParsedRow>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        loop {
            let result = self.records.next()?;
            self.stats.rows_read += 1;

            match result {
                Ok(record) => match RawRow::from_record(&self.headers, &record).into_parsed() {
                    Ok(row) => {
                        self.stats.rows_parsed += 1;
                        return Some(Ok(row));
                    }
                    Err(reason) => {
                        self.stats.record_skip(reason);
                        self.log_skip(reason);
                    }
                },
                Err(e) if e.is_io_error() => {
                    self.finished = true;
                    let line = e.position().map(|p| p.line() as usize);
                    return Some(Err(BillingError::CsvParse {
                        message: e.to_string(),
                        line,
                        context: ErrorContext {
                            file_path: self.path.clone(),
                            line_number: line,
                            ..Default::default()
                        },
                    }));
                }
                Err(_) => {
                    self.stats.record_skip(SkipReason::Malformed);
                    self.log_skip(SkipReason::Malformed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CMS_HEADER: &str = "Rndrng_NPI,Rndrng_Prvdr_Last_Org_Name,Rndrng_Prvdr_Type,Rndrng_Prvdr_State_Abrvtn,HCPCS_Cd,HCPCS_Desc,Place_Of_Srvc,Tot_Srvcs,Avg_Mdcr_Pymt_Amt";

    fn read_all(data: &str) -> (Vec<ParsedRow>, ParseStats) {
        let mut rows = BillingReader::new().open_reader(data.as_bytes()).unwrap();
        let parsed: Vec<ParsedRow> = rows.by_ref().map(|r| r.unwrap()).collect();
        (parsed, rows.stats())
    }

    #[test]
    fn test_parses_cms_extract() {
        let data = format!(
            "{}\n1003000126,Enkeshafi,Internal Medicine,MD,99223,Initial hospital care,F,24,150.25\n",
            CMS_HEADER
        );
        let (rows, stats) = read_all(&data);

        assert_eq!(rows.len(), 1);
        assert_eq!(stats.rows_read, 1);
        let row = &rows[0];
        assert_eq!(row.provider.npi.as_str(), "1003000126");
        assert_eq!(row.provider.name, "Enkeshafi");
        assert_eq!(row.provider.state, "MD");
        assert_eq!(row.line.procedure_code, "99223");
        assert_eq!(row.line.place_of_service, "F");
        assert_eq!(row.line.service_count, 24);
        assert_eq!(row.line.total_payment, Decimal::new(15025, 2));
    }

    #[test]
    fn test_skips_rows_with_defective_required_fields() {
        let data = format!(
            "{}\n\
             ,Nobody,Internal Medicine,MD,99223,Visit,F,24,150.25\n\
             1003000126,A,Internal Medicine,MD,99223,Visit,F,abc,150.25\n\
             1003000126,A,Internal Medicine,MD,99223,Visit,F,-3,150.25\n\
             1003000126,A,Internal Medicine,MD,99223,Visit,F,3,\n\
             1003000126,A,Internal Medicine,MD,99223,Visit,F,3,-1.00\n\
             1003000126,A,Internal Medicine,MD,99223,Visit,F,3,12.00\n",
            CMS_HEADER
        );
        let (rows, stats) = read_all(&data);

        assert_eq!(rows.len(), 1);
        assert_eq!(stats.rows_read, 6);
        assert_eq!(stats.missing_npi, 1);
        assert_eq!(stats.invalid_service_count, 2);
        assert_eq!(stats.invalid_payment, 2);
        assert_eq!(stats.rows_skipped(), 5);
    }

    #[test]
    fn test_fallback_values_for_cosmetic_fields() {
        let data = "NPI,Tot_Srvcs,Avg_Mdcr_Pymt_Amt,Unrelated\n1003000126,5,10.5,zzz\n";
        let (rows, _) = read_all(data);

        let row = &rows[0];
        assert_eq!(row.provider.name, "Unknown");
        assert_eq!(row.provider.specialty, "Unknown");
        assert_eq!(row.provider.state, "Unknown");
        assert_eq!(row.line.procedure_code, "UNKNOWN");
        assert_eq!(row.line.procedure_description, "N/A");
        assert_eq!(row.line.place_of_service, "N/A");
    }

    #[test]
    fn test_short_rows_do_not_abort() {
        let data = format!(
            "{}\n1003000126,A,Internal Medicine\n1003000134,B,Pathology,IL,88305,Tissue exam,F,10,40\n",
            CMS_HEADER
        );
        let (rows, stats) = read_all(&data);

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].provider.npi.as_str(), "1003000134");
        assert_eq!(stats.invalid_service_count, 1);
    }

    #[test]
    fn test_custom_delimiter() {
        let data = "npi|service_count|total_payment\n1003000126|2|99.99\n";
        let mut rows = BillingReader::new().with_delimiter(b'|').open_reader(data.as_bytes()).unwrap();
        let row = rows.next().unwrap().unwrap();
        assert_eq!(row.line.total_payment, Decimal::new(9999, 2));
        assert!(rows.next().is_none());
    }

    #[test]
    fn test_missing_file_is_reported() {
        let err = BillingReader::new().open("/definitely/not/here.csv").err().unwrap();
        assert!(matches!(err, BillingError::FileNotFound { .. }));
    }
}
