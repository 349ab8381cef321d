//! Background loops: heartbeat, metrics collection, scheduled backups and the
//! status reporter. Each one runs until the shutdown signal flips and returns
//! an error only for failures its supervisor should restart it on.

use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::broadcaster::Broadcaster;
use crate::state::AppState;
use crate::types::now_iso;

pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);
pub const METRICS_RETRY: Duration = Duration::from_secs(5);
pub const BACKUP_RETRY: Duration = Duration::from_secs(300);
pub const STATUS_PERIOD: Duration = Duration::from_secs(300);

pub type Shutdown = watch::Receiver<bool>;

/// Sleep for `period` unless shutdown arrives first. Returns `true` on shutdown.
pub async fn pause(period: Duration, shutdown: &mut Shutdown) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(period) => false,
        // A dropped sender counts as shutdown too.
        _ = shutdown.changed() => true,
    }
}

// 30s: keepalive with the client count
pub async fn heartbeat_loop(
    broadcaster: Broadcaster,
    period: Duration,
    mut shutdown: Shutdown,
) -> anyhow::Result<()> {
    while !pause(period, &mut shutdown).await {
        broadcaster.heartbeat();
    }
    Ok(())
}

// collect interval (60s): agent + system samples, health published live
pub async fn metrics_loop(
    state: AppState,
    period: Duration,
    mut shutdown: Shutdown,
) -> anyhow::Result<()> {
    loop {
        let wait = match state.pipeline.collect().await {
            Ok(report) => {
                debug!(
                    "collected {} agent sample(s), {} offline, {} event(s) flushed",
                    report.agents_sampled, report.agents_offline, report.events_flushed
                );
                state.broadcaster.broadcast_system_metric(
                    "health_score",
                    report.system.health_score,
                    "ratio",
                );
                period
            }
            Err(e) => {
                error!("metrics collection failed: {e}");
                METRICS_RETRY
            }
        };
        if pause(wait, &mut shutdown).await {
            return Ok(());
        }
    }
}

// backup interval (6h): full backup, then retention cleanup
pub async fn backup_loop(
    state: AppState,
    period: Duration,
    mut shutdown: Shutdown,
) -> anyhow::Result<()> {
    loop {
        let wait = match run_backup_cycle(&state).await {
            Ok(()) => period,
            Err(e) => {
                error!("backup cycle failed: {e}");
                state.broadcaster.broadcast_notification(
                    "Backup failed",
                    &e.to_string(),
                    "error",
                    None,
                );
                BACKUP_RETRY
            }
        };
        if pause(wait, &mut shutdown).await {
            return Ok(());
        }
    }
}

async fn run_backup_cycle(state: &AppState) -> anyhow::Result<()> {
    let rec = state.backups.create_full_backup().await?;
    if state.backups.verify_backup(&rec.id).await? {
        state.broadcaster.broadcast_notification(
            "Backup created",
            &format!("{} ({} files, {} bytes)", rec.id, rec.file_count, rec.size),
            "info",
            Some(json!({ "id": rec.id, "type": rec.kind })),
        );
    } else {
        state.broadcaster.broadcast_notification(
            "Backup verification failed",
            &format!("{} does not match its checksum", rec.id),
            "error",
            Some(json!({ "id": rec.id })),
        );
    }
    let removed = state.backups.clean_old_backups().await?;
    if !removed.is_empty() {
        info!("retention removed {} backup(s)", removed.len());
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub timestamp: String,
    pub websocket_clients: usize,
    pub agents_tracked: usize,
    pub backups_available: usize,
}

pub fn status_report(state: &AppState) -> StatusReport {
    StatusReport {
        timestamp: now_iso(),
        websocket_clients: state.broadcaster.client_count(),
        agents_tracked: state.broadcaster.agent_count(),
        backups_available: state.backups.count(),
    }
}

// 5min: log and persist a status line
pub async fn status_loop(
    state: AppState,
    period: Duration,
    mut shutdown: Shutdown,
) -> anyhow::Result<()> {
    while !pause(period, &mut shutdown).await {
        let report = status_report(&state);
        info!(
            "status: {} client(s), {} agent(s) tracked, {} backup(s)",
            report.websocket_clients, report.agents_tracked, report.backups_available
        );
        if let Err(e) = write_status_file(&state, &report).await {
            warn!("cannot write {}: {e}", state.paths.status_file.display());
        }
    }
    Ok(())
}

async fn write_status_file(state: &AppState, report: &StatusReport) -> std::io::Result<()> {
    let path = &state.paths.status_file;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let body = serde_json::to_vec_pretty(report)?;
    tokio::fs::write(path, body).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pause_returns_early_on_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { pause(Duration::from_secs(60), &mut rx).await });
        tx.send(true).unwrap();
        let stopped = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(stopped);
    }

    #[tokio::test]
    async fn pause_elapses_without_shutdown() {
        let (_tx, mut rx) = watch::channel(false);
        assert!(!pause(Duration::from_millis(10), &mut rx).await);
    }

    #[tokio::test]
    async fn heartbeat_loop_stops_on_signal() {
        let b = Broadcaster::new(crate::config::StatePaths::new(std::path::Path::new("/nonexistent")));
        let (_id, mut client) = b.register_client();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(heartbeat_loop(b, Duration::from_millis(10), rx));

        let first = tokio::time::timeout(Duration::from_secs(5), client.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(first.contains("\"heartbeat\""));

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
