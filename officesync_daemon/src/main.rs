//! officesync_daemon: mission-control backbone for the agent dashboard.

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use officesync_daemon::config::{CliAction, Config, USAGE};
use officesync_daemon::orchestrator::Orchestrator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let action = Config::from_env()
        .and_then(|cfg| cfg.apply_args(std::env::args()))
        .map_err(|e| {
            eprintln!("{e}\n{USAGE}");
            e
        })?;
    let config = match action {
        CliAction::Help => {
            println!("{USAGE}");
            return Ok(());
        }
        CliAction::Run(cfg) => cfg,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = config.validate() {
        error!("configuration error: {e}");
        return Err(e).context("refusing to start");
    }
    info!(
        "workspace {}, websocket port {}, http port {}",
        config.workspace_root.display(),
        config.ws_port,
        config.http_port
    );

    let orchestrator = Orchestrator::start(&config).await?;
    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    orchestrator.stop().await;
    Ok(())
}
