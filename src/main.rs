use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

use column_lineage::config::{AppConfig, LogConfig};
use column_lineage::handlers::AppState;
use column_lineage::{CatalogIndex, LineageAnalyzer, ReferenceMode};

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Parser)]
#[command(name = "column_lineage", version, about = "Column-level lineage for SQL")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, env = "CONFIG_PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the lineage of SQL files, or of stdin
    Analyze(AnalyzeArgs),
    /// Run the HTTP server
    Serve,
}

#[derive(Debug, Args)]
struct AnalyzeArgs {
    /// SQL files; none or `-` reads stdin
    files: Vec<PathBuf>,

    /// Catalog file (JSON or TOML), overrides `analysis.catalog_path`
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// sqlparser dialect name, overrides `analysis.dialect`
    #[arg(long)]
    dialect: Option<String>,

    /// Report every resolved reference, not only the output columns
    #[arg(long)]
    all_references: bool,

    #[arg(short, long)]
    json: bool,

    #[arg(short, long)]
    pretty: bool,

    /// One entry per statement with its kind and position
    #[arg(long)]
    detailed: bool,
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref()).map_err(std::io::Error::other)?;

    match cli.command {
        Command::Analyze(args) => {
            init_cli_logging(&config.logging);
            if let Err(e) = run_analyze(&args, &config) {
                eprintln!("Error: {:#}", e);
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Serve => run_server_mode(config).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    match path {
        Some(path) => AppConfig::from_file(path),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            AppConfig::from_file(DEFAULT_CONFIG_PATH)
        }
        None => Ok(AppConfig::default()),
    }
}

async fn run_server_mode(config: AppConfig) -> std::io::Result<()> {
    // Dropping the guard stops the file writer
    let _guard = init_logging(&config.logging).map_err(std::io::Error::other)?;

    let catalog = load_catalog(config.analysis.catalog_path.as_deref())
        .map_err(std::io::Error::other)?;

    // Fail at startup rather than on every request
    LineageAnalyzer::new(&catalog)
        .with_dialect(&config.analysis.dialect)
        .map_err(std::io::Error::other)?;

    let state = AppState {
        catalog,
        analysis: config.analysis.clone(),
    };
    column_lineage::server::start_server(
        &config.server.host,
        config.server.port,
        config.server.worker_threads,
        state,
    )
    .await
}

fn env_filter(level: &str) -> tracing_subscriber::EnvFilter {
    let log_level = level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level.to_string()))
}

/// Stdout plus a daily rolling file under `log_dir`.
fn init_logging(config: &LogConfig) -> Result<WorkerGuard> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

    fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("Failed to create log directory {}", config.log_dir))?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("column_lineage")
        .filename_suffix("log")
        .max_log_files(config.max_log_files)
        .build(&config.log_dir)
        .context("Failed to create rolling log file")?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(env_filter(&config.log_level))
        .with(fmt::layer().with_writer(io::stdout))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    tracing::info!(
        "Logging to {} (keeping {} files)",
        config.log_dir,
        config.max_log_files
    );
    Ok(guard)
}

/// Stderr only, stdout carries the lineage output.
fn init_cli_logging(config: &LogConfig) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(env_filter(&config.log_level))
        .with(fmt::layer().with_writer(io::stderr))
        .init();
}

fn load_catalog(path: Option<&Path>) -> Result<CatalogIndex> {
    match path {
        Some(path) => CatalogIndex::load(path)
            .with_context(|| format!("Failed to load catalog {}", path.display())),
        None => {
            tracing::warn!("No catalog configured, only qualified columns will resolve to tables");
            Ok(CatalogIndex::default())
        }
    }
}

fn run_analyze(args: &AnalyzeArgs, config: &AppConfig) -> Result<()> {
    let catalog_path = args
        .catalog
        .as_deref()
        .or(config.analysis.catalog_path.as_deref());
    let catalog = load_catalog(catalog_path)?;

    let mut options = config.analysis.resolve_options();
    if args.all_references {
        options.mode = ReferenceMode::AllReferences;
    }
    let dialect = args.dialect.as_deref().unwrap_or(&config.analysis.dialect);
    let analyzer = LineageAnalyzer::new(&catalog)
        .with_dialect(dialect)?
        .with_options(options);

    let read_stdin =
        args.files.is_empty() || (args.files.len() == 1 && args.files[0] == Path::new("-"));
    if read_stdin {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read stdin")?;
        return run_once(&analyzer, &buf, args);
    }

    for path in &args.files {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        run_once(&analyzer, &contents, args)
            .with_context(|| format!("Error in {}", path.display()))?;
    }
    Ok(())
}

fn run_once(analyzer: &LineageAnalyzer<'_>, sql: &str, args: &AnalyzeArgs) -> Result<()> {
    if args.detailed {
        let infos = analyzer.analyze_sql_detailed(sql)?;
        if args.json {
            return print_json(&infos, args.pretty);
        }
        for info in &infos {
            println!(
                "-- statement {} ({}) at {}:{}",
                info.stmt_index, info.stmt_type, info.start_line, info.start_col
            );
            for line in info.report.lines() {
                println!("{}", line);
            }
        }
        return Ok(());
    }

    let report = analyzer.analyze_sql(sql)?;
    for warning in &report.warnings {
        tracing::warn!("{}", warning);
    }
    if args.json {
        print_json(&report, args.pretty)
    } else {
        for line in report.lines() {
            println!("{}", line);
        }
        Ok(())
    }
}

fn print_json<T: Serialize>(value: &T, pretty: bool) -> Result<()> {
    if pretty {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", serde_json::to_string(value)?);
    }
    Ok(())
}
