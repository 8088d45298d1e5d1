//! Conflux CLI and Trigger API entry point.
//!
//! Binary name: `cflx`
//!
//! Parses CLI arguments, initializes tracing, the database and the engine,
//! then dispatches to a command handler or starts the Trigger API server.

mod cli;
mod http;
mod state;

use anyhow::Context;
use clap::Parser;
use clap_complete::generate;
use conflux_observe::TracingOptions;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    conflux_observe::init_tracing(&TracingOptions {
        format: cli.log_format,
        otel: cli.otel,
        default_filter: Some(cli.log_filter().to_string()),
    })
    .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = dispatch(cli).await;
    conflux_observe::shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    // Commands that never open the database
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(*shell, &mut cmd, "cflx", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Validate { file } => return cli::definition::validate(file, cli.json),
        _ => {}
    }

    let state = AppState::init().await?;
    let result = run_command(&state, cli).await;
    state.engine.shutdown().await;
    result
}

async fn run_command(state: &AppState, cli: Cli) -> anyhow::Result<()> {
    let json = cli.json;
    match cli.command {
        Commands::Serve { port, host } => serve(state, &host, port).await?,

        Commands::Register { file } => cli::definition::register(state, &file, json).await?,

        Commands::Definitions => cli::definition::list(state, json).await?,

        Commands::Run {
            definition,
            version,
            context,
            correlation_id,
            wait,
        } => {
            let args = cli::instance::RunArgs {
                definition: &definition,
                version,
                context: context.as_deref(),
                correlation_id,
                wait,
            };
            cli::instance::run(state, args, json).await?;
        }

        Commands::Show { instance, log } => cli::instance::show(state, instance, log, json).await?,

        Commands::List { active } => cli::instance::list(state, active, json).await?,

        Commands::Replay { instance } => cli::instance::replay(state, instance, json).await?,

        Commands::Completions { .. } | Commands::Validate { .. } => unreachable!("handled above"),
    }
    Ok(())
}

async fn serve(state: &AppState, host: &str, port: u16) -> anyhow::Result<()> {
    let resumed = state
        .engine
        .recover()
        .await
        .context("failed to recover unfinished instances")?;

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    println!(
        "  {} Conflux Trigger API listening on {}",
        console::style("⚡").bold(),
        console::style(format!("http://{addr}")).cyan()
    );
    if !resumed.is_empty() {
        println!("  Resumed {} unfinished instance(s)", resumed.len());
    }
    println!("  {}", console::style("Press Ctrl+C to stop").dim());

    let router = http::router::build_router(state.clone());
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    println!("\n  Server stopped.");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
///
/// If a handler cannot be installed that branch never fires.
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
