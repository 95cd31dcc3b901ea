use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use medbill::dataset::latest_csv;
use medbill::prelude::*;
use serde::Serialize;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mbcli", version)]
#[command(about = "Medical billing CLI - ingest billing extracts and query providers and payments", long_about = None)]
struct Cli {
    /// SQLite database file (overrides the configured database_path)
    #[arg(short, long, global = true, env = "MEDBILL_DATABASE")]
    database: Option<PathBuf>,

    /// Configuration file (defaults to the per-user config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replace the database contents with a billing extract
    Ingest(IngestArgs),
    /// Search providers by NPI/name substring, state and specialty
    Search(SearchArgs),
    /// Show a provider's top billing records with national averages
    Top(TopArgs),
    /// List distinct provider states
    States,
    /// List distinct provider specialties
    Specialties,
    /// List a provider's distinct places of service
    Places(NpiArgs),
    /// Show the national average payment for a procedure code
    Average(AverageArgs),
    /// Show row counts and indexes of the loaded database
    Stats,
}

#[derive(Args)]
struct IngestArgs {
    /// Extract to load; defaults to the newest CSV in --input-dir
    #[arg(short, long)]
    input: Option<PathBuf>,
    /// Directory searched when no input file is given
    #[arg(long, default_value = "data")]
    input_dir: PathBuf,
    /// Billing records per committed batch
    #[arg(long)]
    batch_size: Option<usize>,
    /// Disable the progress bar
    #[arg(long)]
    no_progress: bool,
}

#[derive(Args)]
struct SearchArgs {
    /// Substring of the NPI or provider name
    #[arg(short, long)]
    search: Option<String>,
    /// State code (e.g. CA, NY)
    #[arg(long)]
    state: Option<String>,
    /// Specialty (e.g. Cardiology)
    #[arg(long)]
    specialty: Option<String>,
    /// 1-based page number
    #[arg(long, default_value_t = 1)]
    page: u32,
    /// Providers per page (defaults to the configured page size)
    #[arg(long)]
    page_size: Option<u32>,
}

#[derive(Args)]
struct TopArgs {
    /// Provider NPI
    npi: String,
    /// Only records with this place of service
    #[arg(long)]
    place: Option<String>,
}

#[derive(Args)]
struct NpiArgs {
    /// Provider NPI
    npi: String,
}

#[derive(Args)]
struct AverageArgs {
    /// Procedure (HCPCS) code
    code: String,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(err) = run(cli) {
        match err.downcast_ref::<BillingError>() {
            Some(billing) => eprintln!("Error: {}", billing.user_message()),
            None => eprintln!("Error: {:#}", err),
        }
        std::process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    // RUST_LOG overrides the verbosity flags
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,medbill={level},mbcli={level}",
            level = level.as_str().to_lowercase()
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => BillingConfig::load_from(Some(path))
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => BillingConfig::load()?,
    };
    if let Some(database) = &cli.database {
        config.database_path = database.clone();
    }

    match cli.command {
        Commands::Ingest(args) => cmd_ingest(config, args, cli.json),
        Commands::Search(args) => {
            let dataset = open(&config)?;
            let request = ProviderSearch {
                search: args.search,
                state: args.state,
                specialty: args.specialty,
                page: args.page,
                page_size: args.page_size.unwrap_or(config.default_page_size),
            };
            let page = dataset.queries()?.search_providers(&request)?;
            if cli.json {
                return print_json(&page);
            }
            for provider in &page.providers {
                println!(
                    "{} | {} | {} | {}",
                    provider.npi, provider.name, provider.specialty, provider.state
                );
            }
            println!(
                "Page {} of {} ({} matches)",
                page.page,
                page.total_pages(),
                page.total_count
            );
            Ok(())
        }
        Commands::Top(args) => {
            let dataset = open(&config)?;
            let rows = dataset
                .queries()?
                .top_billing_records(&args.npi, args.place.as_deref())?;
            if cli.json {
                return print_json(&rows);
            }
            for row in &rows {
                let average = row
                    .national_average
                    .map(|avg| avg.round_dp(2).to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{} | {} | {} | {} | {} | avg {}",
                    row.record.procedure_code,
                    row.record.procedure_description,
                    row.record.place_of_service,
                    row.record.service_count,
                    row.record.total_payment,
                    average
                );
            }
            Ok(())
        }
        Commands::States => list(open(&config)?.queries()?.distinct_states()?, cli.json),
        Commands::Specialties => list(open(&config)?.queries()?.distinct_specialties()?, cli.json),
        Commands::Places(args) => list(
            open(&config)?.queries()?.distinct_places_of_service(&args.npi)?,
            cli.json,
        ),
        Commands::Average(args) => {
            let dataset = open(&config)?;
            let average = dataset.averages().get(&args.code);
            if cli.json {
                return print_json(&serde_json::json!({ "code": args.code, "national_average": average }));
            }
            match average {
                Some(avg) => println!("{}: {}", args.code, avg.round_dp(2)),
                None => println!("{}: no billing records", args.code),
            }
            Ok(())
        }
        Commands::Stats => {
            let stats = open(&config)?.statistics()?;
            if cli.json {
                return print_json(&stats);
            }
            stats.print_summary();
            Ok(())
        }
    }
}

fn cmd_ingest(mut config: BillingConfig, args: IngestArgs, json: bool) -> anyhow::Result<()> {
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if args.no_progress || json {
        config.enable_progress_bar = false;
    }

    let input = match args.input {
        Some(path) => path,
        None => latest_csv(&args.input_dir)?,
    };
    info!(input = %input.display(), database = %config.database_path.display(), "starting ingestion");

    let dataset = BillingDatasetBuilder::new()
        .input_file(&input)
        .config(config)
        .build()?;

    let summary = dataset
        .ingest_summary()
        .context("ingestion finished without a summary")?;
    if json {
        return print_json(summary);
    }
    println!("Ingested {}", display_name(&input));
    println!("Providers:       {}", summary.providers_loaded);
    println!("Billing records: {}", summary.records_loaded);
    println!("Rows skipped:    {}", summary.rows_skipped);
    println!("Batches:         {}", summary.batches_committed);
    println!("Elapsed:         {:.1}s", summary.elapsed.as_secs_f64());
    Ok(())
}

fn open(config: &BillingConfig) -> anyhow::Result<BillingDataset> {
    let dataset = BillingDatasetBuilder::new().config(config.clone()).build()?;
    Ok(dataset)
}

fn list(values: Vec<String>, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(&values);
    }
    for value in values {
        println!("{}", value);
    }
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
