use anyhow::{Context, Result};
use clap::Parser;
use prerender_config::{ConfigLoader, LogLevel};
use prerender_worker::cli::Cli;
use prerender_worker::logging::init_logging;
use prerender_ipc::MessageWriter;
use prerender_worker::{report_startup_failure, ShellRenderer, WorkerRuntime};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ConfigLoader::new()
        .load(cli.config.as_ref())
        .context("Failed to load configuration")?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level
            .parse::<LogLevel>()
            .map_err(anyhow::Error::msg)
            .context("Invalid --log-level")?;
    }

    // Stdout is the IPC channel; logs go to stderr
    init_logging(&config.logging)?;

    let renderer = match &cli.root {
        Some(root) if !root.is_dir() => {
            let detail = format!("shell root {} is not a directory", root.display());
            error!("Worker {} cannot start: {}", cli.worker_id, detail);
            report_startup_failure(&mut MessageWriter::stdout(), detail.as_str())
                .await
                .context("Failed to report startup failure")?;
            anyhow::bail!(detail);
        }
        Some(root) => ShellRenderer::with_root(root),
        None => ShellRenderer::new(),
    };

    info!("Starting worker process with ID: {}", cli.worker_id);
    WorkerRuntime::new(cli.worker_id.clone(), renderer)
        .run_stdio()
        .await
        .with_context(|| format!("Worker {} lost its coordinator", cli.worker_id))?;

    info!("Worker {} shutting down", cli.worker_id);
    Ok(())
}
