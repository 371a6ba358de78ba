mod config;

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use config::LoadedConfig;
use std::io;
use std::path::PathBuf;
use tally_core::manifest::DomainKind;
use tally_core::period::{Month, PeriodKey};
use tally_engine::{verify_equivalence, DomainCatalog, JobReport, JobSpec, Pipeline, StrategyKind};
use tally_storage::partition::{PartitionLayout, PartitionManager};
use tally_storage::Warehouse;
use tracing::{error, info};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tally")]
#[command(about = "Incremental monthly aggregation over the facility hierarchy", long_about = None)]
struct Cli {
    /// Config file; otherwise TALLY_CONFIG, ./tally.toml, then the user config dir
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Warehouse database, overriding the config file
    #[arg(long, global = true)]
    database: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Aggregate a domain for one month
    Run {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        strategy: Option<StrategyKind>,
        #[arg(long)]
        json: bool,
    },
    /// Print the statements a run would execute
    Plan {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        strategy: Option<StrategyKind>,
        #[arg(long)]
        json: bool,
    },
    /// Run both strategies into scratch tables and diff them
    Verify {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        json: bool,
    },
    /// List registered domains
    Domains {
        #[arg(long)]
        json: bool,
    },
    /// List catalogued partitions
    Partitions {
        domain: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Drop partitions written by older layouts for one month
    Retire {
        #[command(flatten)]
        target: Target,
    },
}

#[derive(Args)]
struct Target {
    domain: String,
    /// YYYY-MM or YYYY-MM-01; defaults to the previous calendar month
    #[arg(long)]
    month: Option<Month>,
    /// Limit a state-partitioned domain to one state; all states otherwise
    #[arg(long)]
    state: Option<String>,
}

fn main() {
    init_logging();
    if let Err(err) = run_cli(Cli::parse()) {
        error!(event = "command_failed", error = %format!("{err:#}"));
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let to_stdout = std::env::var("TALLY_LOG_STDOUT").is_ok_and(|value| value == "1");
    let writer = if to_stdout {
        BoxMakeWriter::new(io::stdout)
    } else {
        BoxMakeWriter::new(io::stderr)
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .try_init();
}

fn run_cli(cli: Cli) -> Result<()> {
    let loaded = LoadedConfig::load(cli.config.as_deref())?;
    if let Some(source) = &loaded.source {
        info!(event = "config_loaded", path = %source.display());
    }
    let catalog = loaded.catalog()?;

    if let Commands::Domains { json } = &cli.command {
        return print_domains(&catalog, *json);
    }

    let warehouse = loaded.open_warehouse(cli.database.as_deref())?;
    let pipeline = Pipeline::new(&warehouse, &catalog).with_deployment(loaded.deployment());

    match cli.command {
        Commands::Run {
            target,
            strategy,
            json,
        } => {
            let jobs = expand_jobs(&catalog, &warehouse, &target, strategy)?;
            run_jobs(&pipeline, &jobs, json)
        }
        Commands::Plan {
            target,
            strategy,
            json,
        } => {
            let jobs = expand_jobs(&catalog, &warehouse, &target, strategy)?;
            let mut plans = Vec::with_capacity(jobs.len());
            for job in &jobs {
                let plan = pipeline
                    .plan(job)
                    .with_context(|| format!("Failed to plan {} {}", job.domain, job.period))?;
                plans.push(plan);
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&plans)?);
            } else {
                for plan in &plans {
                    println!("-- fingerprint: {}", plan.fingerprint());
                    print!("{}", plan.render());
                    println!();
                }
            }
            Ok(())
        }
        Commands::Verify { target, json } => {
            let jobs = expand_jobs(&catalog, &warehouse, &target, None)?;
            let mut diverged = 0;
            let mut reports = Vec::with_capacity(jobs.len());
            for job in &jobs {
                let report = verify_equivalence(&pipeline, job)
                    .with_context(|| format!("Failed to verify {} {}", job.domain, job.period))?;
                if !report.is_equivalent() {
                    diverged += 1;
                }
                reports.push(report);
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                for report in &reports {
                    let status = if report.is_equivalent() { "ok" } else { "DIVERGED" };
                    println!(
                        "{} {} {status}: single_node={} distributed={} missing={} unexpected={}",
                        report.domain,
                        report.period,
                        report.single_node_rows,
                        report.distributed_rows,
                        report.missing_from_single_node,
                        report.unexpected_in_single_node
                    );
                }
            }
            if diverged > 0 {
                bail!("{diverged} of {} periods diverged between strategies", reports.len());
            }
            Ok(())
        }
        Commands::Partitions { domain, json } => {
            let parent = match &domain {
                Some(key) => Some(catalog.get(key)?.base_table.clone()),
                None => None,
            };
            let entries = PartitionManager::new(&warehouse)
                .list_partitions(parent.as_deref())
                .context("Failed to read partition catalog")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if entries.is_empty() {
                println!("No partitions committed");
            } else {
                for entry in &entries {
                    println!(
                        "{} month={} state={} level={} layout=v{} rows={} committed={}",
                        entry.partition_name,
                        entry.month,
                        entry.state_id.as_deref().unwrap_or("-"),
                        entry.level.map_or("-".to_string(), |level| level.to_string()),
                        entry.layout_version,
                        entry.row_count,
                        entry.committed_at
                    );
                }
            }
            Ok(())
        }
        Commands::Retire { target } => {
            let manifest = catalog.get(&target.domain)?;
            let layout = PartitionLayout::for_domain(manifest);
            let partitions = PartitionManager::new(&warehouse);
            for job in expand_jobs(&catalog, &warehouse, &target, None)? {
                let retired = partitions
                    .retire_legacy(&layout, &job.period)
                    .with_context(|| format!("Failed to retire {} {}", job.domain, job.period))?;
                if retired.is_empty() {
                    println!("{}: nothing to retire", job.period);
                } else {
                    info!(
                        event = "legacy_retired",
                        domain = %job.domain,
                        period = %job.period,
                        tables = %retired.join(",")
                    );
                    println!("{}: dropped {}", job.period, retired.join(", "));
                }
            }
            Ok(())
        }
        Commands::Domains { .. } => Ok(()),
    }
}

fn default_month() -> Result<Month> {
    Ok(Month::containing(Local::now().date_naive()).prev()?)
}

/// One job per state for state-partitioned domains unless `--state` narrows
/// it, one job otherwise.
fn expand_jobs(
    catalog: &DomainCatalog,
    warehouse: &Warehouse,
    target: &Target,
    strategy: Option<StrategyKind>,
) -> Result<Vec<JobSpec>> {
    let manifest = catalog.get(&target.domain)?;
    let month = match target.month {
        Some(month) => month,
        None => default_month()?,
    };

    let periods = match (manifest.requires_state(), &target.state) {
        (true, Some(state)) => vec![PeriodKey::month_state(month, state.clone())],
        (true, None) => {
            let states = warehouse
                .state_ids()
                .context("Failed to read states from the hierarchy")?;
            if states.is_empty() {
                bail!("hierarchy has no states; load it before running {}", manifest.key);
            }
            states
                .into_iter()
                .map(|state| PeriodKey::month_state(month, state))
                .collect()
        }
        (false, Some(_)) => {
            bail!("{} is not partitioned by state; drop --state", manifest.key)
        }
        (false, None) => vec![PeriodKey::month(month)],
    };

    Ok(periods
        .into_iter()
        .map(|period| {
            let job = JobSpec::new(manifest.key.clone(), period);
            match strategy {
                Some(kind) => job.with_strategy(kind),
                None => job,
            }
        })
        .collect())
}

/// Runs every job even when an earlier one fails, then reports failures.
fn run_jobs(pipeline: &Pipeline<'_>, jobs: &[JobSpec], json: bool) -> Result<()> {
    let mut reports: Vec<JobReport> = Vec::with_capacity(jobs.len());
    let mut failures = Vec::new();
    for job in jobs {
        match pipeline.run(job) {
            Ok(report) => {
                if !json {
                    print_report(&report);
                }
                reports.push(report);
            }
            Err(err) => {
                eprintln!("{} {}: {err}", job.domain, job.period);
                failures.push(format!("{}", job.period));
            }
        }
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    }
    if !failures.is_empty() {
        bail!(
            "{} of {} jobs failed: {}",
            failures.len(),
            jobs.len(),
            failures.join(", ")
        );
    }
    Ok(())
}

fn print_report(report: &JobReport) {
    let elapsed = report.finished_at - report.started_at;
    println!(
        "{} {} [{}] rows={} partitions={} checks={} in {}ms",
        report.domain,
        report.period,
        report.strategy,
        report.commit.rows_committed(),
        report.commit.partitions.len(),
        report.checks_passed,
        elapsed.num_milliseconds()
    );
    if report.strategy != report.requested_strategy {
        println!("  requested {} but ran {}", report.requested_strategy, report.strategy);
    }
    for table in &report.retired {
        println!("  retired {table}");
    }
}

fn print_domains(catalog: &DomainCatalog, json: bool) -> Result<()> {
    if json {
        let manifests: Vec<_> = catalog.iter().collect();
        println!("{}", serde_json::to_string_pretty(&manifests)?);
        return Ok(());
    }
    for manifest in catalog.iter() {
        let kind = match &manifest.kind {
            DomainKind::CarryForward(_) if manifest.requires_state() => "carry-forward, per state",
            DomainKind::CarryForward(_) => "carry-forward",
            DomainKind::Facility(_) => "facility",
        };
        println!("{} ({kind}) -> {}", manifest.key, manifest.base_table);
        if !manifest.description.is_empty() {
            println!("  {}", manifest.description);
        }
        let joins = manifest.joined_domains();
        if !joins.is_empty() {
            println!("  joins: {}", joins.join(", "));
        }
    }
    Ok(())
}
