/*!
 * Ready-to-query billing dataset
 *
 * A [`BillingDataset`] only exists once its database holds the billing tables
 * and the national averages have been computed from them. Startup either
 * ingests an extract first or opens a database loaded earlier; in both cases
 * queries are only handed out after the averages are in place. Re-ingesting
 * closes the gate again: every query service of the dataset waits until the
 * new data and its averages are published.
 */

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use serde::Serialize;
use tracing::info;

use crate::{
    aggregation::{AverageCache, NationalAverages},
    config::BillingConfig,
    loader::{BulkLoader, IngestSummary, LoadProgress},
    query::{ProviderSearch, QueryService, ReadyGate},
    store::Database,
    BillingError, Result,
};

type ProgressCallback = Box<dyn Fn(LoadProgress) + Send + Sync>;

/// Builder for opening or loading a billing dataset
///
/// # Example
/// ```no_run
/// # use medbill::dataset::BillingDatasetBuilder;
/// let dataset = BillingDatasetBuilder::new()
///     .database("data/billing.db")
///     .input_file("data/MUP_PHY_R24_P05_V10_D22_Prov_Svc.csv")
///     .build()?;
/// # Ok::<(), medbill::BillingError>(())
/// ```
#[derive(Default)]
pub struct BillingDatasetBuilder {
    database_path: Option<PathBuf>,
    input_file: Option<PathBuf>,
    config: BillingConfig,
    progress_callback: Option<ProgressCallback>,
}

impl BillingDatasetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Database file; overrides `database_path` from the configuration
    pub fn database<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.database_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Extract to ingest before the dataset becomes ready.
    ///
    /// Without one, the database must already contain loaded data.
    pub fn input_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.input_file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn config(mut self, config: BillingConfig) -> Self {
        self.config = config;
        self
    }

    /// Callback invoked after every committed billing record batch
    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(LoadProgress) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
        self
    }

    /// Ingest (if an input file was given), then compute the national averages
    pub fn build(self) -> Result<BillingDataset> {
        self.config.validate()?;
        let database_path = self
            .database_path
            .unwrap_or_else(|| self.config.database_path.clone());

        let (db, ingest_summary) = match self.input_file {
            Some(input) => {
                // a missing extract must not leave an empty database behind
                if !input.is_file() {
                    return Err(BillingError::file_not_found_with_suggestion(input));
                }
                let mut db = Database::open(&database_path)?;
                let mut loader = BulkLoader::from_config(&self.config);
                if let Some(callback) = self.progress_callback {
                    loader = loader.with_progress(callback);
                }
                let summary = loader.ingest(&input, &mut db)?;
                (db, Some(summary))
            }
            None => {
                let db = Database::open_existing(&database_path)?;
                if !db.has_schema()? {
                    return Err(BillingError::Custom {
                        message: format!("'{}' holds no billing data", database_path.display()),
                        suggestion: Some("Ingest an extract first with `mbcli ingest`".to_string()),
                    });
                }
                (db, None)
            }
        };

        let averages = NationalAverages::compute(&db)?;
        info!(
            database = %database_path.display(),
            procedure_codes = averages.len(),
            "billing dataset ready"
        );

        Ok(BillingDataset {
            database_path,
            db,
            averages: Arc::new(AverageCache::new(averages)),
            gate: ReadyGate::default(),
            ingest_summary,
            config: self.config,
        })
    }
}

/// A loaded billing database with its national averages
pub struct BillingDataset {
    database_path: PathBuf,
    db: Database,
    averages: Arc<AverageCache>,
    gate: ReadyGate,
    ingest_summary: Option<IngestSummary>,
    config: BillingConfig,
}

impl BillingDataset {
    /// Open a database that was loaded earlier
    ///
    /// # Example
    /// ```no_run
    /// # use medbill::dataset::BillingDataset;
    /// let dataset = BillingDataset::open("billing.db")?;
    /// let states = dataset.queries()?.distinct_states()?;
    /// # Ok::<(), medbill::BillingError>(())
    /// ```
    pub fn open<P: AsRef<Path>>(database_path: P) -> Result<Self> {
        BillingDatasetBuilder::new().database(database_path).build()
    }

    /// A query service on its own connection, sharing this dataset's averages
    pub fn queries(&self) -> Result<QueryService> {
        let db = Database::open_existing(&self.database_path)?;
        Ok(QueryService::gated(db, Arc::clone(&self.averages), Arc::clone(&self.gate)))
    }

    /// A search request using the configured default page size
    pub fn search(&self) -> ProviderSearch {
        ProviderSearch::new().page_size(self.config.default_page_size)
    }

    /// Recompute the averages from storage and publish them to every query service
    pub fn reload_averages(&self) -> Result<Arc<NationalAverages>> {
        self.averages.reload(&self.db)
    }

    /// Replace the database contents with a new extract, then reload the averages.
    ///
    /// Queries from this dataset's services block until both steps finish.
    pub fn reingest<P: AsRef<Path>>(&mut self, input: P) -> Result<IngestSummary> {
        let gate = Arc::clone(&self.gate);
        let _exclusive = match gate.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let summary = BulkLoader::from_config(&self.config).ingest(input, &mut self.db)?;
        self.reload_averages()?;
        self.ingest_summary = Some(summary.clone());
        Ok(summary)
    }

    pub fn averages(&self) -> &Arc<AverageCache> {
        &self.averages
    }

    /// Summary of the ingestion performed while building, if any
    pub fn ingest_summary(&self) -> Option<&IngestSummary> {
        self.ingest_summary.as_ref()
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &BillingConfig {
        &self.config
    }

    /// Row counts, index names and the number of averaged procedure codes
    pub fn statistics(&self) -> Result<DatasetStatistics> {
        Ok(DatasetStatistics {
            provider_count: self.db.provider_count()?,
            record_count: self.db.record_count()?,
            procedure_codes: self.averages.snapshot().len(),
            index_names: self.db.index_names()?,
        })
    }
}

/// Post-load verification counts
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetStatistics {
    pub provider_count: usize,
    pub record_count: usize,
    pub procedure_codes: usize,
    pub index_names: Vec<String>,
}

impl DatasetStatistics {
    pub fn print_summary(&self) {
        println!("Billing Dataset Statistics");
        println!("==========================");
        println!("Providers:       {}", self.provider_count);
        println!("Billing records: {}", self.record_count);
        println!("Procedure codes: {}", self.procedure_codes);
        println!("Indexes:         {}", self.index_names.join(", "));
    }
}

/// Most recently modified `*.csv` file directly inside `dir`
pub fn latest_csv<P: AsRef<Path>>(dir: P) -> Result<PathBuf> {
    let dir = dir.as_ref();

    if !dir.is_dir() {
        return Err(BillingError::Custom {
            message: format!("'{}' is not a directory", dir.display()),
            suggestion: Some("Provide a directory containing billing CSV extracts".to_string()),
        });
    }

    let mut latest: Option<(SystemTime, PathBuf)> = None;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_csv = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
        if !is_csv || !path.is_file() {
            continue;
        }

        let modified = std::fs::metadata(&path)?.modified()?;
        match latest {
            Some((newest, _)) if newest >= modified => {}
            _ => latest = Some((modified, path)),
        }
    }

    latest.map(|(_, path)| path).ok_or_else(|| BillingError::Custom {
        message: format!("no CSV files found in '{}'", dir.display()),
        suggestion: Some("Download a billing extract into this directory".to_string()),
    })
}
