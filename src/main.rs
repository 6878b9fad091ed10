use std::io::Write;

use anyhow::{Context, Result};
use clap::Parser;

use cacheproxy::{
    cli::{Cli, Command, LogFormat},
    logging, run,
    scope::Scope,
    settings::Settings,
    storage::{diff, maintenance},
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command.clone().unwrap_or(Command::Serve) {
        Command::Serve => {
            let settings = Settings::load(&cli)?;
            logging::init_logger(settings.log)?;
            let scope = Scope::new();
            spawn_shutdown_listener(scope.clone());
            run(settings, scope).await
        }
        Command::Compare { a, b } => {
            logging::init_logger(LogFormat::Text)?;
            let diffs = diff::compare(&a, &b)
                .with_context(|| format!("failed to compare {} and {}", a.display(), b.display()))?;
            let mut out = std::io::stdout().lock();
            for entry in diffs {
                serde_json::to_writer(&mut out, &entry)?;
                writeln!(out)?;
            }
            Ok(())
        }
        Command::Clean { dir, before } => {
            logging::init_logger(LogFormat::Text)?;
            let removed = maintenance::clean_dir_by_time(&dir, before)
                .with_context(|| format!("failed to clean {}", dir.display()))?;
            let mut out = std::io::stdout().lock();
            for (path, deleted) in removed {
                writeln!(out, "{}\t{deleted}", path.display())?;
            }
            Ok(())
        }
    }
}

fn spawn_shutdown_listener(scope: Scope) {
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("received shutdown signal");
        scope.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(signal) => signal,
        Err(err) => {
            tracing::error!(error = %err, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
