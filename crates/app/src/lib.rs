use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use vloom_core::backend::SyntheticBackend;
use vloom_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use vloom_core::job::{JobSpec, JobStatus};
use vloom_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, PanicHookInstallPlan, DEFAULT_LOG_FILTER,
};
use vloom_core::persistence::JobsPersistence;
use vloom_core::queue::{QueueSetup, TaskQueue};
use vloom_core::registry::ModelRegistry;
use vloom_core::resources::ResourceManager;
use vloom_core::window::GeneratorOptions;

#[derive(Parser)]
#[command(name = "vloom", about = "Sliding-window long-video generation engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a clip from a settings file.
    Run(RunArgs),
    /// List the model and adapter catalog.
    Models,
    /// Write a settings template to edit and run.
    ExportSettings(ExportArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(
        required = true,
        num_args = 1..,
        help = "Paths to job settings JSON files, run in order"
    )]
    settings: Vec<PathBuf>,
    #[arg(short = 'o', long, help = "Override the configured output directory")]
    output_dir: Option<PathBuf>,
    #[arg(
        long,
        value_name = "N",
        default_value_t = 0,
        help = "Warm the weight cache with the first N catalog models before running"
    )]
    preload: usize,
    #[arg(
        long,
        value_enum,
        default_value_t = MetadataVerbosity::Summary,
        help = "How much job metadata to print on completion"
    )]
    metadata: MetadataVerbosity,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, clap::ValueEnum)]
enum MetadataVerbosity {
    /// Nothing on stdout; exit status only.
    Quiet,
    /// The output path.
    Summary,
    /// The full job record as JSON.
    Full,
}

#[derive(Args)]
struct ExportArgs {
    #[arg(help = "Destination path for the settings template")]
    path: PathBuf,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(&resolved_data_dir);

    match cli.command {
        Commands::Run(run) => run_job(run, resolved_data_dir).await,
        Commands::Models => list_models(resolved_data_dir),
        Commands::ExportSettings(export) => export_settings(&export.path),
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let panic_hook_plan = logging::install_panic_hook(data_dir);
    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = &panic_hook_plan
    {
        let attempted_crash_dir = attempted_crash_dir
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<none>".to_string());
        eprintln!(
            "Warning: panic crash artifact hook unavailable (path: {attempted_crash_dir}; reason: {reason}). Panics will not be persisted to crash logs."
        );
    }

    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let filter = init_plan.filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready(ready) => {
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(parse_env_filter_with_fallback(&filter, "console")),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(ready.appender)
                        .with_filter(parse_env_filter_with_fallback(&filter, "file")),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback(fallback) => {
            let attempted_log_dir = fallback
                .attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            let reason = fallback.reason;

            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(parse_env_filter_with_fallback(&filter, "console")),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            eprintln!(
                "Warning: persistent file logging unavailable (path: {attempted_log_dir}; reason: {reason}). Continuing with console-only logging."
            );
            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }

    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = panic_hook_plan
    {
        warn!(
            attempted_crash_dir = ?attempted_crash_dir,
            reason = %reason,
            "Panic crash artifact hook unavailable; continuing without panic artifacts"
        );
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    info!(
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

fn build_registry(config: &AppConfig, data_dir: &Path) -> ModelRegistry {
    let models_dir = vloom_core::config::resolve_relative_to(data_dir, &config.paths.models_dir);
    let mut registry = ModelRegistry::with_builtin_catalog(models_dir);
    let catalog_path = data_dir.join("models.json");
    if catalog_path.exists() {
        if let Err(err) = registry.load_catalog_file(&catalog_path) {
            warn!(error = %err, "Ignoring invalid user model catalog");
        }
    }
    registry
}

async fn run_job(args: RunArgs, data_dir: PathBuf) -> Result<()> {
    let config = load_config(&data_dir);

    let registry = Arc::new(build_registry(&config, &data_dir));
    let resources = Arc::new(ResourceManager::new(config.budget.budget_bytes()));
    let persistence = JobsPersistence::new(&data_dir)
        .context("failed to open job history database")?;
    // Surface any jobs interrupted by a previous crash before running.
    let restored = persistence.load_jobs_for_startup()?;
    for job in restored
        .iter()
        .filter(|job| job.status == JobStatus::Cancelled && job.error.is_some())
    {
        info!(job_id = %job.id, "Previous run left an interrupted job; marked cancelled");
    }

    let output_dir = args.output_dir.unwrap_or_else(|| {
        vloom_core::config::resolve_relative_to(&data_dir, &config.paths.output_dir)
    });

    if args.preload > 0 {
        preload_models(&registry, &resources, args.preload);
    }

    let queue = TaskQueue::start(QueueSetup {
        registry: Arc::clone(&registry),
        resources: Arc::clone(&resources),
        backend: Arc::new(SyntheticBackend::new(config.generation.window_size)),
        persistence: Some(persistence),
        output_dir,
        generator: GeneratorOptions {
            max_tile_size: config.budget.max_tile_size,
            ..GeneratorOptions::default()
        },
        preprocess_workers: config.queue.preprocess_workers,
    });

    let mut ids = Vec::new();
    for path in &args.settings {
        let spec = JobSpec::import_from_path(path)?;
        let id = queue.submit(spec)?;
        info!(job_id = %id, settings = %path.display(), "Job submitted");
        ids.push(id);
    }

    let ctrl_c_queue = queue.clone();
    let ctrl_c_ids = ids.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; cancelling jobs");
            for id in ctrl_c_ids {
                let _ = ctrl_c_queue.cancel(id);
            }
        }
    });

    let mut failures = Vec::new();
    for id in ids {
        let job = loop {
            match queue.poll(id) {
                Some(job) if job.status.is_terminal() => break job,
                Some(job) => {
                    if job.progress.windows_total > 0 {
                        eprint!(
                            "\rwindow {}/{} | step {}/{} | {} frames   ",
                            job.progress.windows_done,
                            job.progress.windows_total,
                            job.progress.steps_done,
                            job.progress.steps_total,
                            job.progress.frames_emitted,
                        );
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                None => bail!("job {id} disappeared from the queue"),
            }
        };
        eprintln!();

        match job.status {
            JobStatus::Completed => {
                let output = job.output_path.clone().unwrap_or_default();
                info!(job_id = %id, output = %output, "Generation complete");
                match args.metadata {
                    MetadataVerbosity::Quiet => {}
                    MetadataVerbosity::Summary => println!("{output}"),
                    MetadataVerbosity::Full => {
                        let report =
                            serde_json::to_string_pretty(&job).unwrap_or_else(|_| output.clone());
                        println!("{report}");
                    }
                }
            }
            JobStatus::Cancelled => failures.push(format!("job {id} was cancelled")),
            _ => failures.push(format!(
                "job {id} failed: {}",
                job.error.unwrap_or_else(|| "unknown error".to_string())
            )),
        }
    }
    queue.shutdown();

    match failures.into_iter().next() {
        Some(first) => bail!("{first}"),
        None => Ok(()),
    }
}

/// Resolve and pre-admit the first `count` visible catalog models so the
/// first job starts without a cold weight load.
fn preload_models(registry: &ModelRegistry, resources: &ResourceManager, count: usize) {
    for model in registry
        .list()
        .into_iter()
        .filter(|model| model.visible != Some(false))
        .take(count)
    {
        let resolved = match registry.resolve(&model.name) {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!(model = %model.name, error = %err, "Skipping unresolvable model in preload");
                continue;
            }
        };
        match resources.ensure_resident(&resolved.residency_entries(), None) {
            Ok(evicted) if evicted.is_empty() => {
                info!(model = %model.name, "Model weights preloaded")
            }
            Ok(evicted) => {
                info!(model = %model.name, evicted = evicted.len(), "Model weights preloaded")
            }
            Err(err) => warn!(model = %model.name, error = %err, "Preload skipped"),
        }
    }
}

fn list_models(data_dir: PathBuf) -> Result<()> {
    let config = load_config(&data_dir);
    let registry = build_registry(&config, &data_dir);

    println!("models:");
    for model in registry.list() {
        if model.visible == Some(false) {
            continue;
        }
        let resolved = match registry.resolve(&model.name) {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!(model = %model.name, error = %err, "Skipping unresolvable model");
                continue;
            }
        };
        println!(
            "  {:<24} {:<32} {} ({:.1} GB)",
            model.name,
            resolved.display_name,
            resolved.architecture,
            resolved.total_weight_bytes() as f64 / 1e9,
        );
    }

    println!("adapters:");
    for adapter in registry.list_adapters() {
        println!(
            "  {:<24} {} ({:.1} GB)",
            adapter.name,
            adapter.path.display(),
            adapter.size_bytes as f64 / 1e9,
        );
    }

    let resolutions_path = data_dir.join("resolutions.txt");
    if resolutions_path.exists() {
        match vloom_core::config::load_resolution_list(&resolutions_path) {
            Ok(resolutions) => {
                println!("resolutions:");
                for (width, height) in resolutions {
                    println!("  {width}x{height}");
                }
            }
            Err(err) => warn!(error = %err, "Ignoring invalid resolution list"),
        }
    }
    Ok(())
}

fn export_settings(path: &Path) -> Result<()> {
    let template = JobSpec {
        model: "wan-t2v-1.3b".to_string(),
        prompt: "describe the clip you want".to_string(),
        negative_prompt: String::new(),
        frames: 81,
        width: 832,
        height: 480,
        steps: 30,
        guidance: 5.0,
        seed: 0,
        window_size: 81,
        window_overlap: 16,
        cache: Default::default(),
        adapters: Vec::new(),
        conditioning: Default::default(),
        injections: Vec::new(),
    };
    template.export_to_path(path)?;
    info!(path = %path.display(), "Settings template written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exported_template_imports_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("template.json");
        export_settings(&path).unwrap();

        let spec = JobSpec::import_from_path(&path).unwrap();
        spec.validate().unwrap();
        assert_eq!(spec.model, "wan-t2v-1.3b");
    }

    #[test]
    fn cli_parses_run_command() {
        let cli = Cli::try_parse_from(["vloom", "run", "settings.json", "-o", "out"]).unwrap();
        match cli.command {
            Commands::Run(run) => {
                assert_eq!(run.settings, vec![PathBuf::from("settings.json")]);
                assert_eq!(run.output_dir, Some(PathBuf::from("out")));
                assert_eq!(run.preload, 0);
                assert_eq!(run.metadata, MetadataVerbosity::Summary);
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn cli_accepts_multiple_settings_files() {
        let cli = Cli::try_parse_from(["vloom", "run", "a.json", "b.json", "c.json"]).unwrap();
        match cli.command {
            Commands::Run(run) => {
                assert_eq!(
                    run.settings,
                    vec![
                        PathBuf::from("a.json"),
                        PathBuf::from("b.json"),
                        PathBuf::from("c.json")
                    ]
                );
            }
            _ => panic!("expected run command"),
        }
        assert!(Cli::try_parse_from(["vloom", "run"]).is_err());
    }

    #[test]
    fn preload_warms_the_weight_cache() {
        let registry = ModelRegistry::with_builtin_catalog(PathBuf::from("models"));
        let resources = ResourceManager::new(u64::MAX);
        preload_models(&registry, &resources, 1);
        assert!(resources.resident_total_bytes() > 0);
    }

    #[test]
    fn cli_parses_preload_and_metadata_flags() {
        let cli = Cli::try_parse_from([
            "vloom",
            "run",
            "settings.json",
            "--preload",
            "2",
            "--metadata",
            "full",
        ])
        .unwrap();
        match cli.command {
            Commands::Run(run) => {
                assert_eq!(run.preload, 2);
                assert_eq!(run.metadata, MetadataVerbosity::Full);
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn verbose_flag_is_global_and_counted() {
        let cli = Cli::try_parse_from(["vloom", "models", "-vv"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Models));
    }
}
