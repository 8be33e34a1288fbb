// CLI driver: loads a suite document plus its folder hooks and globals,
// runs the scheduling unit, and writes the report.
//
// Exit codes: 0 = all passed, 1 = at least one failed/errored test,
// 2 = the engine aborted (unreadable or invalid document).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn, Level};

use blockrunner::capability::NoBrowser;
use blockrunner::procedures::ProcedureTable;
use blockrunner::protocol::{RunOptions, RunRequest};
use blockrunner::registry::BlockRegistry;
use blockrunner::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};
use blockrunner::{loader, run_suite, validation, EngineError};

#[derive(Parser)]
#[command(name = "blockrunner")]
#[command(about = "Execution engine for block-based test suites", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a suite document and emit the report.
    Run {
        /// Path to the suite JSON document.
        #[arg(short, long)]
        file: PathBuf,

        /// Folder-hook files, outermost folder first. Repeatable.
        #[arg(long = "hooks")]
        hooks: Vec<PathBuf>,

        /// Project globals document.
        #[arg(long)]
        globals: Option<PathBuf>,

        /// Where to write the report JSON; stdout when omitted.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Run the browser with a visible window.
        #[arg(long, default_value = "false")]
        headful: bool,

        /// Default per-operation timeout in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Export traces to an OpenTelemetry collector.
        #[arg(long, default_value = "false")]
        otel: bool,

        /// OTLP endpoint; defaults to OTEL_EXPORTER_OTLP_ENDPOINT or
        /// http://localhost:4317.
        #[arg(long)]
        otel_endpoint: Option<String>,

        /// Only errors on stderr.
        #[arg(long, short = 's', default_value = "false")]
        silent: bool,

        /// Debug-level logging.
        #[arg(long, short = 'v', default_value = "false")]
        verbose: bool,
    },

    /// Validate a suite document without running it.
    Validate {
        #[arg(short, long)]
        file: PathBuf,

        /// Project globals document (for procedure resolution).
        #[arg(long)]
        globals: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            hooks,
            globals,
            output,
            headful,
            timeout_ms,
            otel,
            otel_endpoint,
            silent,
            verbose,
        } => {
            let mut telemetry_config = TelemetryConfig::from_env();
            telemetry_config.log_level = if silent {
                Level::ERROR
            } else if verbose {
                Level::DEBUG
            } else {
                Level::INFO
            };
            if otel {
                if let Some(endpoint) = otel_endpoint {
                    telemetry_config.otlp_endpoint = Some(endpoint);
                } else if telemetry_config.otlp_endpoint.is_none() {
                    telemetry_config.otlp_endpoint = Some("http://localhost:4317".to_string());
                }
            } else {
                telemetry_config.otlp_endpoint = None;
            }
            if let Err(e) = init_telemetry(telemetry_config) {
                eprintln!("warning: failed to initialize telemetry: {e}");
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                    .try_init();
            }

            let code = run_command(file, hooks, globals, output, headful, timeout_ms, silent).await;
            shutdown_telemetry();
            code
        }
        Commands::Validate { file, globals } => validate_command(file, globals),
    }
}

async fn run_command(
    file: PathBuf,
    hooks: Vec<PathBuf>,
    globals: Option<PathBuf>,
    output: Option<PathBuf>,
    headful: bool,
    timeout_ms: Option<u64>,
    silent: bool,
) -> ExitCode {
    let test_file = match loader::load_test_file(&file) {
        Ok(f) => f,
        Err(e) => {
            error!(error = %e, "failed to load suite");
            return ExitCode::from(2);
        }
    };
    let folder_hooks = match loader::load_folder_hooks(&hooks) {
        Ok(h) => h,
        Err(e) => {
            error!(error = %e, "failed to load folder hooks");
            return ExitCode::from(2);
        }
    };
    let globals_doc = match globals.map(loader::load_globals).transpose() {
        Ok(g) => g,
        Err(e) => {
            error!(error = %e, "failed to load globals");
            return ExitCode::from(2);
        }
    };

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            signal_token.cancel();
        }
    });

    let mut options = RunOptions {
        headless: !headful,
        cancel,
        ..RunOptions::default()
    };
    if let Some(timeout) = timeout_ms {
        options.web_timeout_ms = timeout;
    }

    let request = RunRequest {
        test_file,
        folder_hooks,
        globals: globals_doc,
        options,
    };

    // the CLI runs without a wired browser driver; hosts embedding the
    // engine supply their own PageFactory
    let report = match run_suite(request, Arc::new(NoBrowser)).await {
        Ok(report) => report,
        Err(EngineError::InvalidDocument(errors)) => {
            error!("document validation failed with {} error(s):", errors.len());
            for e in &errors {
                error!("  - {e}");
            }
            return ExitCode::from(2);
        }
    };

    let json = match serde_json::to_string_pretty(&report) {
        Ok(json) => json,
        Err(e) => {
            error!(error = %e, "failed to serialize report");
            return ExitCode::from(2);
        }
    };
    if let Some(path) = output {
        if let Err(e) = std::fs::write(&path, json) {
            error!(error = %e, path = ?path, "failed to write report");
            return ExitCode::from(2);
        }
        if !silent {
            println!("report written to {path:?}");
        }
    } else if !silent {
        println!("{json}");
    }

    if report.summary.all_passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}

fn validate_command(file: PathBuf, globals: Option<PathBuf>) -> ExitCode {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let test_file = match loader::load_test_file(&file) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(2);
        }
    };
    let globals_doc = match globals.map(loader::load_globals).transpose() {
        Ok(g) => g,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(2);
        }
    };

    let registry = BlockRegistry::builtin();
    let procedures = ProcedureTable::from_sources(globals_doc.as_ref(), &test_file);
    match validation::validate_file(&test_file, &registry, &procedures) {
        Ok(()) => {
            println!("{:?}: document is valid", file);
            ExitCode::SUCCESS
        }
        Err(errors) => {
            eprintln!("{:?}: {} validation error(s):", file, errors.len());
            for e in &errors {
                eprintln!("  - {e}");
            }
            ExitCode::from(2)
        }
    }
}
