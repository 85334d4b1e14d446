use clap::Parser;
use index_mirror::cli::Cli;
use index_mirror::progress::{LogWriter, ProgressDisplay, resolve_mode};
use index_mirror::{EnvConfig, Event, Pipeline, cancel_on_signal, exit, open_store};
use std::io::IsTerminal;
use std::process::ExitCode;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

/// Capacity of the event channel feeding the progress display
const EVENT_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            e.print().ok();
            return if e.use_stderr() {
                code(exit::CONFIG)
            } else {
                code(exit::SUCCESS)
            };
        }
    };

    let mode = resolve_mode(cli.progress_mode(), std::io::stderr().is_terminal());
    let display = ProgressDisplay::new(mode);
    init_tracing(cli.verbose, display.log_writer());

    code(run(cli, display).await)
}

async fn run(cli: Cli, display: ProgressDisplay) -> i32 {
    let env = EnvConfig::from_env();
    let config = match cli.into_config(&env) {
        Ok(config) => config,
        Err(e) => {
            error!(code = e.error_code(), "{}", e);
            return e.exit_code();
        }
    };
    debug!(
        url = %config.url,
        site_type = %config.site_type,
        simultaneous = config.simultaneous,
        batch_limit = ?config.batch_limit,
        upload = config.upload.is_some(),
        "configuration loaded"
    );

    let store = match open_store(&config.bookkeeping).await {
        Ok(store) => store,
        Err(e) => {
            error!(code = e.error_code(), error = %e, "cannot open bookkeeping store");
            return e.exit_code();
        }
    };

    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    let cancel = CancellationToken::new();

    let pipeline = match Pipeline::new(config, store, events.clone(), cancel.clone()) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!(code = e.error_code(), error = %e, "cannot start");
            return e.exit_code();
        }
    };

    let signal_events = events.clone();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        cancel_on_signal(signal_cancel).await;
        signal_events.send(Event::Shutdown).ok();
    });

    let progress = display.spawn(events.subscribe());
    let result = pipeline.run().await;
    let snapshot = progress.finish().await;
    debug!(progress = %snapshot.line(), "progress display stopped");

    match result {
        Ok(summary) => {
            summary.log();
            summary.exit_code()
        }
        Err(e) => {
            error!(code = e.error_code(), error = %e, "run aborted");
            e.exit_code()
        }
    }
}

/// Structured logs to stderr, routed around the progress bars
fn init_tracing(verbose: bool, writer: LogWriter) {
    let default = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(default.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(false)
        .init();
}

fn code(exit_code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(exit_code).unwrap_or(1))
}
