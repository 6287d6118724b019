use anyhow::Context;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod chat;
mod commands;
mod config;
mod error;
mod handlers;
mod models;
mod registry;
mod services;
mod supervisor;
mod template;

use chat::{ChatSender, StdioChat};
use commands::CommandHandler;
use config::Config;
use handlers::create_router;
use registry::Registry;
use services::DispatchService;
use supervisor::TaskGroup;

/// How long runtime shutdown waits for blocking work such as a parked stdin read.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn main() -> ExitCode {
    // Initialize tracing; stdout belongs to the chat transport
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "webhookbot=info,tower_http=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {e}");
            return ExitCode::from(3);
        }
    };

    let result = runtime.block_on(run());
    runtime.shutdown_timeout(SHUTDOWN_GRACE);

    match result {
        Ok(()) => {
            info!("Shut down cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Exiting after fatal error: {e:#}");
            ExitCode::from(3)
        }
    }
}

async fn run() -> anyhow::Result<()> {
    // Initialize configuration
    let config = Arc::new(Config::from_env()?);

    // Initialize database
    let registry = Arc::new(
        Registry::connect(&config.database_url)
            .await
            .context("failed to open webhook database")?,
    );

    let sender: Arc<dyn ChatSender> = Arc::new(StdioChat::new());

    // HTTP side
    let tracker = TaskTracker::new();
    let (fatal_tx, fatal_rx) = mpsc::channel(1);
    let app_state = handlers::AppState {
        dispatch: DispatchService::new(
            registry.clone(),
            sender.clone(),
            config.delivery_timeout,
            config.err_report_conv.clone(),
        ),
        tracker: tracker.clone(),
        fatal: fatal_tx,
    };
    let app = create_router(app_state, &config);
    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    // Chat side
    let handler = CommandHandler::new(registry.clone(), sender.clone(), config.clone());
    let (inbound_tx, inbound_rx) = mpsc::channel(64);

    config.log_startup_info();

    let mut group = TaskGroup::new();
    let cancel = group.cancel_token();
    group.spawn(
        "chat transport",
        chat::pump_events(tokio::io::stdin(), inbound_tx, cancel.clone()),
    );
    group.spawn(
        "command listener",
        commands::listen(handler, inbound_rx, cancel.clone()),
    );
    group.spawn(
        "http listener",
        handlers::serve(listener, app, tracker, fatal_rx, cancel.clone()),
    );
    group.spawn("signal handler", supervisor::handle_signals(cancel));
    group.spawn(
        "advertiser",
        supervisor::advertise(sender, config.announcement_conv.clone()),
    );

    let outcome = group.wait().await;
    registry.close().await;
    outcome
}
