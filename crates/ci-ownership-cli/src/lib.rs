//! Command surface for the ownership mapping pipeline.
//!
//! `map` resolves test and variant ownership and synchronizes the
//! mapping tables; `prune` removes superseded generations. Both assume
//! a single writer per run against the analytical store.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use ci_ownership_core::{
    ComponentConfig, NoObsoleteTests, Registry, TestDescriptor, TestOwnership, TestResolver,
    VariantMapping, VariantResolver,
};
use ci_ownership_store_sqlite::{list_test_corpus, MappingTableManager};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "cto")]
#[command(about = "Map tests and job variants to component ownership")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Map(MapArgs),
    Prune(PruneArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum, Eq, PartialEq)]
pub enum Mode {
    /// Resolve from local JSON snapshots; no store access, no push.
    Local,
    /// Resolve from the analytical store's junit table.
    Warehouse,
}

#[derive(Debug, Args)]
pub struct MapArgs {
    #[arg(
        long,
        value_enum,
        default_value_t = Mode::Local,
        help = "Local mode doesn't require the analytical store and is suitable for development"
    )]
    pub mode: Mode,
    #[arg(long, default_value = "./ci_ownership.sqlite3")]
    pub store: PathBuf,
    #[arg(long, default_value = "junit", help = "Table storing junit test results")]
    pub table_junit: String,
    #[arg(long, default_value = "component_mapping")]
    pub table_mapping: String,
    #[arg(long, default_value = "variant_mapping")]
    pub table_variant_mapping: String,
    #[arg(long, help = "Push the updated records to the analytical store")]
    pub push: bool,
    #[arg(long, help = "Also map variants to jira projects and components")]
    pub map_variants: bool,
    #[arg(long, help = "JSON file with the component rule catalog")]
    pub components: Option<PathBuf>,
    #[arg(long, help = "JSON file mapping jira component names to numeric ids")]
    pub jira_components: Option<PathBuf>,
    #[arg(long, default_value = "data")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Args)]
pub struct PruneArgs {
    #[arg(long, default_value = "./ci_ownership.sqlite3")]
    pub store: PathBuf,
    #[arg(long, default_value = "component_mapping")]
    pub table_mapping: String,
    #[arg(long, default_value = "variant_mapping")]
    pub table_variant_mapping: String,
}

/// Executes the parsed top-level command.
///
/// # Errors
/// Returns an error when parameter validation or the requested command
/// fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Map(args) => run_map(&args),
        Command::Prune(args) => run_prune(&args),
    }
}

/// Validates mode and flag combinations before any work begins.
///
/// # Errors
/// Returns an error with usage guidance on invalid combinations.
pub fn verify_map_args(args: &MapArgs) -> Result<()> {
    match args.mode {
        Mode::Local => {
            if args.push {
                return Err(anyhow!("cannot push to the warehouse in --mode=local"));
            }
        }
        Mode::Warehouse => {
            if !args.store.exists() {
                return Err(anyhow!(
                    "store database {} not found; supply --store, or use --mode=local",
                    args.store.display()
                ));
            }
        }
    }

    Ok(())
}

/// Runs the full mapping pipeline: migrate, resolve, diff, push,
/// snapshot.
///
/// # Errors
/// Returns an error when validation, resolution, or any store phase
/// fails; per-test identification failures surface once at the end.
#[allow(clippy::too_many_lines)]
pub fn run_map(args: &MapArgs) -> Result<()> {
    verify_map_args(args)?;

    let tests_file = args.data_dir.join(format!("{}.json", args.table_junit));
    let test_mapping_file = args.data_dir.join(format!("{}.json", args.table_mapping));
    let variant_mapping_file = args
        .data_dir
        .join(format!("{}.json", args.table_variant_mapping));

    let mut test_table_manager = None;
    let mut variant_table_manager = None;

    let tests: Vec<TestDescriptor> = if args.mode == Mode::Warehouse {
        let manager =
            MappingTableManager::<TestOwnership>::open(&args.store, &args.table_mapping)?;
        manager
            .migrate()
            .context("could not migrate test mapping table")?;
        test_table_manager = Some(manager);

        let manager =
            MappingTableManager::<VariantMapping>::open(&args.store, &args.table_variant_mapping)?;
        manager
            .migrate()
            .context("could not migrate variant mapping table")?;
        variant_table_manager = Some(manager);

        let tests =
            list_test_corpus(&args.store, &args.table_junit).context("could not list tests")?;
        write_records(&tests, &tests_file).context("couldn't write test corpus snapshot")?;
        tests
    } else {
        let data = fs::read(&tests_file).with_context(|| {
            format!("could not fetch tests from file {}", tests_file.display())
        })?;
        serde_json::from_slice(&data).context("could not decode tests from file")?
    };

    let registry = load_registry(args.components.as_deref())?;
    let component_ids = load_component_ids(args.jira_components.as_deref())?;

    let started = Instant::now();
    let created_at = OffsetDateTime::now_utc();
    info!("mapping tests to ownership");

    let resolver = TestResolver::new(&registry, component_ids);
    let (new_test_mappings, stats) = resolver
        .identify_all(&tests, created_at, &NoObsoleteTests)
        .map_err(|err| anyhow!(err))?;

    info!(
        matched = stats.matched,
        unmatched = stats.unmatched,
        elapsed = ?started.elapsed(),
        "mapping tests to ownership complete"
    );

    let mut new_variant_mappings: Vec<VariantMapping> = Vec::new();
    if args.map_variants {
        let started = Instant::now();
        info!("mapping variants to ownership");

        let variant_resolver = VariantResolver::new(&registry);
        let mut variant_mappings = variant_resolver.identify().map_err(|err| anyhow!(err))?;
        for mapping in &mut variant_mappings {
            mapping.created_at = Some(created_at);
        }

        // Only genuinely new variant identities are pushed; test
        // mappings get a full fresh generation every run instead.
        new_variant_mappings = if let Some(manager) = &variant_table_manager {
            let existing = manager
                .list_mappings()
                .context("could not list variant mappings from the store")?;
            let existing_identities: Vec<String> =
                existing.iter().map(VariantMapping::variant).collect();
            variant_mappings
                .into_iter()
                .filter(|mapping| !existing_identities.contains(&mapping.variant()))
                .collect()
        } else {
            variant_mappings
        };

        info!(
            new = new_variant_mappings.len(),
            elapsed = ?started.elapsed(),
            "mapping variants to ownership complete"
        );
    }

    if args.mode == Mode::Warehouse && args.push {
        let started = Instant::now();
        info!("pushing test mappings to the store");
        if let Some(manager) = &mut test_table_manager {
            manager
                .push_mappings(&new_test_mappings)
                .context("could not push test mappings to the store")?;
        }
        info!("pushing variant mappings to the store");
        if let Some(manager) = &mut variant_table_manager {
            manager
                .push_mappings(&new_variant_mappings)
                .context("could not push variant mappings to the store")?;
        }
        info!(elapsed = ?started.elapsed(), "push finished");
    }

    write_records(&new_test_mappings, &test_mapping_file)
        .context("could not write records to test mapping file")?;
    write_records(&new_variant_mappings, &variant_mapping_file)
        .context("could not write records to variant mapping file")?;

    Ok(())
}

/// Deletes superseded generations from both mapping tables.
///
/// # Errors
/// Returns an error when the store cannot be opened or a prune query
/// fails; a busy store is only a warning.
pub fn run_prune(args: &PruneArgs) -> Result<()> {
    let test_manager =
        MappingTableManager::<TestOwnership>::open(&args.store, &args.table_mapping)?;
    let deleted = test_manager
        .prune_mappings()
        .context("could not prune test mapping table")?;
    info!(table = %args.table_mapping, deleted, "pruned test mappings");

    let variant_manager =
        MappingTableManager::<VariantMapping>::open(&args.store, &args.table_variant_mapping)?;
    let deleted = variant_manager
        .prune_mappings()
        .context("could not prune variant mapping table")?;
    info!(table = %args.table_variant_mapping, deleted, "pruned variant mappings");

    Ok(())
}

fn load_registry(path: Option<&Path>) -> Result<Registry> {
    let Some(path) = path else {
        warn!("no component catalog supplied; every test will map to Unknown");
        return Ok(Registry::from_configs(Vec::new()));
    };

    let data = fs::read(path)
        .with_context(|| format!("could not read component catalog {}", path.display()))?;
    let configs: Vec<ComponentConfig> =
        serde_json::from_slice(&data).context("could not decode component catalog")?;
    info!(components = configs.len(), "loaded component catalog");
    Ok(Registry::from_configs(configs))
}

fn load_component_ids(path: Option<&Path>) -> Result<BTreeMap<String, i64>> {
    let Some(path) = path else {
        return Ok(BTreeMap::new());
    };

    let data = fs::read(path)
        .with_context(|| format!("could not read jira component map {}", path.display()))?;
    serde_json::from_slice(&data).context("could not decode jira component map")
}

/// Writes a pretty-printed (2-space indent) JSON array snapshot,
/// replacing any previous contents.
fn write_records<T: Serialize>(records: &[T], filename: &Path) -> Result<()> {
    let started = Instant::now();
    info!(file = %filename.display(), "writing results to file");

    if let Some(parent) = filename.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("could not create data directory {}", parent.display()))?;
    }

    let mut file = fs::File::create(filename)
        .with_context(|| format!("could not open {} for writing", filename.display()))?;
    serde_json::to_writer_pretty(&mut file, records)
        .with_context(|| format!("could not encode records to {}", filename.display()))?;
    file.write_all(b"\n")
        .with_context(|| format!("could not finish writing {}", filename.display()))?;

    info!(elapsed = ?started.elapsed(), "write complete");
    Ok(())
}
