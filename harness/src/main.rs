use annotation::Scanner;
use clap::Parser;
use harness::{default_runner, discover, reporter_for, run_reported, HarnessConfig, OutputFormat};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "theo")]
#[command(version)]
#[command(about = "Run the tests annotated in source file comments")]
struct Cli {
    /// Files, directories or glob patterns to scan
    #[arg(default_value = ".")]
    paths: Vec<PathBuf>,

    /// Specifications executed at once
    #[arg(short = 'j', long)]
    parallelism: Option<usize>,

    /// Default per-test timeout in seconds; a block's or test's own `timeout` wins
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Timeout for each setup command in seconds
    #[arg(long)]
    setup_timeout: Option<u64>,

    /// Ignore `valgrind: true` in annotations
    #[arg(long)]
    no_memory_check: bool,

    /// Output format
    #[arg(short = 'o', long, value_enum)]
    format: Option<OutputFormat>,

    /// Config file (defaults to ./theo.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Log debug information to stderr
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply(&self, mut config: HarnessConfig) -> HarnessConfig {
        if let Some(parallelism) = self.parallelism {
            config = config.with_parallelism(parallelism);
        }
        if let Some(timeout) = self.timeout {
            config = config.with_timeout_secs(timeout);
        }
        if let Some(timeout) = self.setup_timeout {
            config = config.with_setup_timeout_secs(timeout);
        }
        if self.no_memory_check {
            config = config.with_memory_check(false);
        }
        if let Some(format) = self.format {
            config = config.with_format(format);
        }
        if self.no_color || std::env::var_os("NO_COLOR").is_some() {
            config = config.with_color(false);
        }
        config
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    let config = match HarnessConfig::load(cli.config.as_deref()) {
        Ok(config) => cli.apply(config),
        Err(e) => {
            error!("{}", e);
            eprintln!("theo: {}", e);
            return ExitCode::from(2);
        }
    };
    if let Err(e) = config.validate() {
        eprintln!("theo: {}", e);
        return ExitCode::from(2);
    }
    if !config.color {
        colored::control::set_override(false);
    }

    let scanner = Scanner::new();
    let discovery = discover(&cli.paths, &scanner);
    if discovery.is_empty() {
        warn!("No {} blocks found", scanner.marker());
    }
    info!(
        "Discovered {} specifications with {} tests",
        discovery.specifications.len(),
        discovery.test_count()
    );

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping running tests");
            interrupt.cancel();
        }
    });

    let runner = default_runner(&config);
    let reporter = reporter_for(config.format, config.color);
    match run_reported(runner, config, discovery, reporter, std::io::stdout(), &cancel).await {
        Ok(summary) => ExitCode::from(summary.exit_code()),
        Err(e) => {
            eprintln!("theo: failed to write report: {}", e);
            ExitCode::from(2)
        }
    }
}
