/*!
 * Bulk loading of parsed billing rows into the store
 *
 * A load is a full refresh: the schema is dropped and recreated, secondary
 * indexes are removed, providers go in as one transaction, billing records go
 * in as fixed-size batches that each commit on their own, and the indexes are
 * rebuilt at the end. Rows are written straight from the staged vectors
 * through a cached prepared statement; nothing keeps track of an entity once
 * it has been inserted.
 */

use std::collections::HashSet;
use std::path::Path;
use std::time::{Duration, Instant};

#[cfg(feature = "progress")]
use indicatif::{ProgressBar, ProgressStyle};
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::{debug, info};

use crate::{
    config::BillingConfig,
    constants::DEFAULT_BATCH_SIZE,
    data_types::*,
    reader::BillingReader,
    store::Database,
    BillingError, ErrorContext, Result,
};

const INSERT_PROVIDER_SQL: &str =
    "INSERT INTO providers (npi, provider_name, specialty, state) VALUES (?1, ?2, ?3, ?4)";

const INSERT_RECORD_SQL: &str = "INSERT INTO billing_records
    (npi, hcpcs_code, hcpcs_description, place_of_service, number_of_services, total_payment)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6)";

/// How often the deadline is checked while staging rows
const STAGING_CHECK_INTERVAL: usize = 100_000;

/// Progress of the billing record insert phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadProgress {
    /// Zero-based index of the batch that was just committed
    pub batch_index: usize,
    pub batch_count: usize,
    /// Billing records durably committed so far
    pub rows_committed: usize,
    pub total_rows: usize,
    pub elapsed: Duration,
}

impl LoadProgress {
    /// Committed share of all billing records, between 0.0 and 1.0
    pub fn fraction(&self) -> f64 {
        if self.total_rows == 0 {
            1.0
        } else {
            self.rows_committed as f64 / self.total_rows as f64
        }
    }
}

/// Final counts of a successful load
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub providers_loaded: usize,
    pub records_loaded: usize,
    /// Data rows seen in the input. For [`BulkLoader::load`] these are the
    /// parsed rows it was given.
    pub rows_read: usize,
    /// Input rows dropped by the parser. Always 0 for [`BulkLoader::load`],
    /// which never sees the rows its caller skipped.
    pub rows_skipped: usize,
    pub batches_committed: usize,
    pub elapsed: Duration,
}

/// Parsed rows held in memory between parsing and writing
#[derive(Debug, Default)]
struct StagedLoad {
    providers: Vec<Provider>,
    lines: Vec<BillingLine>,
    rows_seen: usize,
}

/// Time limit for a whole ingestion job
#[derive(Debug, Clone, Copy)]
struct Deadline {
    started: Instant,
    limit: Option<Duration>,
}

impl Deadline {
    fn check(&self, stage: &str) -> Result<()> {
        let Some(limit) = self.limit else {
            return Ok(());
        };
        let elapsed = self.started.elapsed();
        if elapsed >= limit {
            return Err(BillingError::IngestTimeout {
                stage: stage.to_string(),
                elapsed,
                limit,
            });
        }
        Ok(())
    }
}

/// Bulk loader for billing extracts
pub struct BulkLoader {
    batch_size: usize,
    timeout: Option<Duration>,
    reader: BillingReader,
    progress_callback: Option<Box<dyn Fn(LoadProgress) + Send + Sync>>,
    #[cfg(feature = "progress")]
    show_progress_bar: bool,
}

impl Default for BulkLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl BulkLoader {
    /// Create a loader with default batch size, no timeout and no progress output
    pub fn new() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            timeout: None,
            reader: BillingReader::new(),
            progress_callback: None,
            #[cfg(feature = "progress")]
            show_progress_bar: false,
        }
    }

    /// Create a loader from configuration
    pub fn from_config(config: &BillingConfig) -> Self {
        let loader = Self::new()
            .with_batch_size(config.batch_size)
            .with_timeout(config.ingest_timeout());

        #[cfg(feature = "progress")]
        let loader = loader.with_progress_bar(config.enable_progress_bar);

        loader
    }

    /// Billing records per committed batch (at least 1)
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Time limit for the whole job, parsing included
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Use a differently configured reader (e.g. another delimiter)
    pub fn with_reader(mut self, reader: BillingReader) -> Self {
        self.reader = reader;
        self
    }

    /// Set a callback invoked after every committed batch
    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(LoadProgress) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
        self
    }

    #[cfg(feature = "progress")]
    /// Enable or disable the terminal progress bar
    pub fn with_progress_bar(mut self, show: bool) -> Self {
        self.show_progress_bar = show;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Ingest an extract file, replacing everything in the database.
    ///
    /// A missing file is reported before the database is touched, and the
    /// whole file is parsed before the old contents are dropped.
    pub fn ingest<P: AsRef<Path>>(&self, path: P, db: &mut Database) -> Result<IngestSummary> {
        let path = path.as_ref();
        let deadline = self.start_deadline();

        info!(path = %path.display(), "parsing billing extract");
        let mut rows = self.reader.open(path)?;
        let staged = stage(&mut rows, &deadline)?;
        let stats = rows.stats();

        info!(
            providers = staged.providers.len(),
            records = staged.lines.len(),
            skipped = stats.rows_skipped(),
            "parsed billing extract"
        );

        let mut summary = self.write(staged, db, &deadline)?;
        summary.rows_read = stats.rows_read;
        summary.rows_skipped = stats.rows_skipped();
        Ok(summary)
    }

    /// Load an already parsed row sequence, replacing everything in the database.
    ///
    /// Parser skips happen before the rows get here, so the summary reports
    /// `rows_read` as the number of rows received and `rows_skipped` as 0.
    pub fn load<I>(&self, rows: I, db: &mut Database) -> Result<IngestSummary>
    where
        I: IntoIterator<Item = Result<ParsedRow>>,
    {
        let deadline = self.start_deadline();
        let staged = stage(rows, &deadline)?;
        self.write(staged, db, &deadline)
    }

    fn start_deadline(&self) -> Deadline {
        Deadline {
            started: Instant::now(),
            limit: self.timeout,
        }
    }

    fn write(&self, staged: StagedLoad, db: &mut Database, deadline: &Deadline) -> Result<IngestSummary> {
        let StagedLoad { providers, lines, rows_seen } = staged;
        deadline.check("schema reset")?;

        info!("recreating schema and dropping secondary indexes");
        db.reset_schema()?;
        db.drop_indexes()?;

        insert_providers(db.connection_mut(), &providers)?;
        info!(providers = providers.len(), "providers committed");

        let total_rows = lines.len();
        let batch_count = total_rows.div_ceil(self.batch_size);
        let mut rows_committed = 0;

        #[cfg(feature = "progress")]
        let progress_bar = self.progress_bar(total_rows);

        for (batch_index, batch) in lines.chunks(self.batch_size).enumerate() {
            deadline.check("billing record insert")?;

            insert_batch(db.connection_mut(), batch)
                .map_err(|e| BillingError::batch_failed(batch_index, rows_committed, e))?;
            rows_committed += batch.len();

            let progress = LoadProgress {
                batch_index,
                batch_count,
                rows_committed,
                total_rows,
                elapsed: deadline.started.elapsed(),
            };
            debug!(
                batch = batch_index + 1,
                of = batch_count,
                committed = rows_committed,
                "billing record batch committed"
            );

            #[cfg(feature = "progress")]
            if let Some(ref pb) = progress_bar {
                pb.set_position(rows_committed as u64);
            }

            if let Some(ref callback) = self.progress_callback {
                callback(progress);
            }
        }

        #[cfg(feature = "progress")]
        if let Some(pb) = progress_bar {
            pb.finish_with_message("billing records inserted");
        }

        deadline.check("index rebuild")?;
        info!("rebuilding secondary indexes");
        db.create_indexes()?;

        let elapsed = deadline.started.elapsed();
        info!(
            providers = providers.len(),
            records = rows_committed,
            batches = batch_count,
            elapsed_secs = elapsed.as_secs_f64(),
            "ingestion complete"
        );

        Ok(IngestSummary {
            providers_loaded: providers.len(),
            records_loaded: rows_committed,
            rows_read: rows_seen,
            rows_skipped: 0,
            batches_committed: batch_count,
            elapsed,
        })
    }

    #[cfg(feature = "progress")]
    fn progress_bar(&self, total_rows: usize) -> Option<ProgressBar> {
        if !self.show_progress_bar {
            return None;
        }
        let pb = ProgressBar::new(total_rows as u64);
        let style = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} records ({eta})")
            .map(|s| s.progress_chars("#>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        pb.set_style(style);
        Some(pb)
    }
}

/// Collect rows into deduplicated providers and billing lines.
///
/// The first row carrying an NPI decides that provider's attributes.
fn stage<I>(rows: I, deadline: &Deadline) -> Result<StagedLoad>
where
    I: IntoIterator<Item = Result<ParsedRow>>,
{
    let mut staged = StagedLoad::default();
    let mut seen: HashSet<Npi> = HashSet::new();

    for row in rows {
        let ParsedRow { provider, line } = row?;
        staged.rows_seen += 1;

        if staged.rows_seen % STAGING_CHECK_INTERVAL == 0 {
            deadline.check("parsing")?;
        }

        if seen.insert(provider.npi.clone()) {
            staged.providers.push(provider);
        }
        staged.lines.push(line);
    }

    Ok(staged)
}

fn insert_providers(conn: &mut Connection, providers: &[Provider]) -> Result<()> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare_cached(INSERT_PROVIDER_SQL)?;
        for provider in providers {
            stmt.execute(params![
                provider.npi.as_str(),
                provider.name,
                provider.specialty,
                provider.state,
            ])
            .map_err(|e| BillingError::storage(format!("failed inserting provider {}", provider.npi), e))?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// Insert one batch in its own transaction. On error nothing of the batch remains.
fn insert_batch(conn: &mut Connection, lines: &[BillingLine]) -> Result<()> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare_cached(INSERT_RECORD_SQL)?;
        for line in lines {
            let payment = payment_to_storage(line.total_payment).ok_or_else(|| {
                BillingError::DataValidation {
                    message: format!("payment {} cannot be stored", line.total_payment),
                    field: Some("total_payment".to_string()),
                    value: Some(line.total_payment.to_string()),
                    context: ErrorContext {
                        record_npi: Some(line.npi.to_string()),
                        ..Default::default()
                    },
                }
            })?;

            stmt.execute(params![
                line.npi.as_str(),
                line.procedure_code,
                line.procedure_description,
                line.place_of_service,
                line.service_count,
                payment,
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}
