use std::process::ExitCode;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use bacteria_hoard::catalog::{CatalogCache, CatalogReport, EnaPortalCatalog};
use bacteria_hoard::compress::Compressor;
use bacteria_hoard::config::{ConfigLoader, ResolvedConfig};
use bacteria_hoard::domain::shard;
use bacteria_hoard::error::HoardError;
use bacteria_hoard::metadata::MetadataEnricher;
use bacteria_hoard::mirror::{MirrorSummary, ReleaseMirror};
use bacteria_hoard::object_store::{FsObjectStore, ObjectDownload, ObjectStore, S3ObjectStore};
use bacteria_hoard::output::{JsonOutput, OutputMode, StderrProgress, format_elapsed};
use bacteria_hoard::pipeline::{Pipeline, PipelineSettings, ProgressSink, RunSummary};
use bacteria_hoard::source::HttpArchiveSource;
use bacteria_hoard::staging::Staging;

const EXIT_INCOMPLETE: u8 = 4;

#[derive(Parser)]
#[command(name = "hoard")]
#[command(about = "Mirror AllTheBacteria assemblies into a sharded object store hoard")]
#[command(version, author)]
struct Cli {
    /// Config file (defaults to ./hoard.json when present).
    #[arg(long, global = true)]
    config: Option<String>,

    /// Print results as JSON on stdout.
    #[arg(long, global = true)]
    json: bool,

    /// Keep objects under this directory instead of the S3 endpoint.
    #[arg(long, global = true)]
    local_store: Option<Utf8PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Fetch assembly archives and upload members missing from the hoard")]
    Sync(SyncArgs),
    #[command(about = "Copy release files that are not yet in the bucket")]
    Mirror,
    #[command(about = "Refresh the cached accession catalog")]
    Catalog(CatalogArgs),
    #[command(about = "Download one hoard object")]
    Get(GetArgs),
}

#[derive(Args)]
struct SyncArgs {
    #[arg(long)]
    species: Option<String>,

    /// Number of archives to walk.
    #[arg(long)]
    count: Option<usize>,

    #[arg(long)]
    workers: Option<usize>,
}

#[derive(Args)]
struct CatalogArgs {
    /// Query the catalog even when the cache is fresh.
    #[arg(long)]
    force: bool,
}

#[derive(Args)]
struct GetArgs {
    /// File name such as `SAMD00000344.fa.gz`, or a full object key.
    key: String,

    destination: Utf8PathBuf,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(err) = report.downcast_ref::<HoardError>() {
                return ExitCode::from(map_exit_code(err));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &HoardError) -> u8 {
    match error {
        HoardError::ConfigRead(_)
        | HoardError::ConfigParse(_)
        | HoardError::InvalidConfig(_)
        | HoardError::MissingEnv(_) => 2,
        HoardError::SourceHttp(_)
        | HoardError::SourceStatus { .. }
        | HoardError::SourceMissing { .. }
        | HoardError::StoreConfig(_)
        | HoardError::StoreList { .. }
        | HoardError::StorePut { .. }
        | HoardError::StoreGet { .. }
        | HoardError::CatalogHttp(_)
        | HoardError::CatalogStatus { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };
    let mut config = ConfigLoader::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Sync(args) => {
            apply_sync_overrides(&mut config, args)?;
            let store = open_store(&config, cli.local_store.as_ref())?;
            run_sync(&config, store, output_mode)
        }
        Commands::Mirror => {
            let store = open_store(&config, cli.local_store.as_ref())?;
            run_mirror(&config, store, output_mode)
        }
        Commands::Catalog(args) => run_catalog(&config, args.force, output_mode),
        Commands::Get(args) => {
            let store = open_store(&config, cli.local_store.as_ref())?;
            run_get(&config, store.as_ref(), args, output_mode)
        }
    }
}

fn apply_sync_overrides(config: &mut ResolvedConfig, args: SyncArgs) -> Result<(), HoardError> {
    if let Some(species) = args.species {
        config.source.species = species;
    }
    if let Some(count) = args.count {
        config.source.archive_count = count;
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    config.validate()
}

fn open_store(
    config: &ResolvedConfig,
    local_store: Option<&Utf8PathBuf>,
) -> Result<Arc<dyn ObjectStore>, HoardError> {
    match local_store {
        Some(root) => Ok(Arc::new(FsObjectStore::new(root.clone()))),
        None => Ok(Arc::new(S3ObjectStore::from_env(&config.store.endpoint_url)?)),
    }
}

fn progress_sink(output_mode: OutputMode) -> Box<dyn ProgressSink> {
    match output_mode {
        OutputMode::Json => Box::new(JsonOutput),
        OutputMode::Text => Box::new(StderrProgress),
    }
}

fn load_enricher(config: &ResolvedConfig) -> Result<MetadataEnricher, HoardError> {
    let cache = CatalogCache::new(config.local.catalog_file.clone(), config.catalog.max_age_hours);
    let catalog = EnaPortalCatalog::new(&config.catalog.base_url, &config.catalog.query)?;
    let (records, _) = cache.resolve(&catalog, false)?;
    Ok(MetadataEnricher::from_records(records))
}

fn run_sync(
    config: &ResolvedConfig,
    store: Arc<dyn ObjectStore>,
    output_mode: OutputMode,
) -> miette::Result<ExitCode> {
    let enricher = load_enricher(config)?;
    let source = HttpArchiveSource::new(&config.source.base_url)?;
    let pipeline = Pipeline::new(
        source,
        store,
        Compressor::detect(),
        PipelineSettings::from_config(config),
    );
    let sink = progress_sink(output_mode);
    let summary = pipeline.run(enricher, sink.as_ref())?;

    match output_mode {
        OutputMode::Json => JsonOutput::print_sync(&summary).into_diagnostic()?,
        OutputMode::Text => print_sync_summary(&summary),
    }
    Ok(if summary.has_failures() {
        ExitCode::from(EXIT_INCOMPLETE)
    } else {
        ExitCode::SUCCESS
    })
}

fn run_mirror(
    config: &ResolvedConfig,
    store: Arc<dyn ObjectStore>,
    output_mode: OutputMode,
) -> miette::Result<ExitCode> {
    let source = HttpArchiveSource::new(&config.source.base_url)?;
    let staging = Staging::new(config.local.staging_dir.clone());
    let mirror = ReleaseMirror::new(
        &source,
        store.as_ref(),
        &staging,
        &config.store.bucket,
        &config.mirror,
    );
    let sink = progress_sink(output_mode);
    let summary = mirror.run(sink.as_ref())?;

    match output_mode {
        OutputMode::Json => JsonOutput::print_mirror(&summary).into_diagnostic()?,
        OutputMode::Text => print_mirror_summary(&summary),
    }
    Ok(if summary.has_failures() {
        ExitCode::from(EXIT_INCOMPLETE)
    } else {
        ExitCode::SUCCESS
    })
}

fn run_catalog(
    config: &ResolvedConfig,
    force: bool,
    output_mode: OutputMode,
) -> miette::Result<ExitCode> {
    let cache = CatalogCache::new(config.local.catalog_file.clone(), config.catalog.max_age_hours);
    let catalog = EnaPortalCatalog::new(&config.catalog.base_url, &config.catalog.query)?;
    let (records, action) = cache.resolve(&catalog, force)?;
    let report = CatalogReport {
        path: cache.path().to_string(),
        records: records.len(),
        action,
    };

    match output_mode {
        OutputMode::Json => JsonOutput::print_catalog(&report).into_diagnostic()?,
        OutputMode::Text => println!(
            "{} records in {} ({:?})",
            report.records, report.path, report.action
        ),
    }
    Ok(ExitCode::SUCCESS)
}

fn run_get(
    config: &ResolvedConfig,
    store: &dyn ObjectStore,
    args: GetArgs,
    output_mode: OutputMode,
) -> miette::Result<ExitCode> {
    let key = if args.key.contains('/') {
        args.key
    } else {
        config.layout().object_key(&shard(&args.key)?)
    };
    let bytes = store.get(&config.store.bucket, &key, args.destination.as_std_path())?;
    let download = ObjectDownload {
        bucket: config.store.bucket.clone(),
        key,
        path: args.destination.to_string(),
        bytes,
    };

    match output_mode {
        OutputMode::Json => JsonOutput::print_download(&download).into_diagnostic()?,
        OutputMode::Text => println!(
            "{} -> {} ({} bytes)",
            download.key, download.path, download.bytes
        ),
    }
    Ok(ExitCode::SUCCESS)
}

fn print_sync_summary(summary: &RunSummary) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    println!(
        "{cyan}hoard sync finished in {}{reset}",
        format_elapsed(std::time::Duration::from_millis(summary.elapsed_ms))
    );
    println!(
        "{green}archives: {} total, {} downloaded, {} cached, {} complete, {} skipped{reset}",
        summary.archives_total,
        summary.archives_downloaded,
        summary.archives_cached,
        summary.archives_complete,
        summary.archives_skipped
    );
    println!(
        "{green}members: {} already stored, {} queued, {} duplicates{reset}",
        summary.members_present, summary.members_scheduled, summary.members_deduplicated
    );
    println!(
        "{green}uploads: {} ok{reset}, {}{} failed{reset}",
        summary.uploads_succeeded,
        if summary.uploads_failed > 0 { red } else { green },
        summary.uploads_failed
    );
    println!("{cyan}metadata rows written: {}{reset}", summary.records_written);
    for failure in &summary.failures {
        println!(
            "{yellow}  {:?} {}: {}{reset}",
            failure.stage, failure.subject, failure.message
        );
    }
}

fn print_mirror_summary(summary: &MirrorSummary) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let reset = "\x1b[0m";

    println!(
        "{green}mirror: {} dirs listed, {} files uploaded, {} already present{reset}",
        summary.dirs_listed, summary.files_uploaded, summary.files_skipped
    );
    for failure in &summary.failures {
        println!(
            "{yellow}  {:?} {}: {}{reset}",
            failure.stage, failure.subject, failure.message
        );
    }
}
