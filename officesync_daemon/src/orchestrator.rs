//! Wires the subsystems together and keeps every long-running loop alive.
//!
//! Each loop runs inside a supervisor: when the loop returns an error or
//! panics, the failure is logged and the loop is started again after
//! `RESTART_DELAY`. Loops share nothing but `AppState`, so one crashing
//! leaves the others running.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{routing::get, Router};
use futures::StreamExt;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api;
use crate::backup::BackupManager;
use crate::broadcaster::Broadcaster;
use crate::config::{Config, PathClass};
use crate::metrics::MetricsPipeline;
use crate::sampler::{self, pause, Shutdown, HEARTBEAT_PERIOD, STATUS_PERIOD};
use crate::state::AppState;
use crate::store::MetricsStore;
use crate::watcher::{state_store_roots, ChangeWatcher, DEFAULT_POLL_INTERVAL};
use crate::ws::ws_handler;

pub const RESTART_DELAY: Duration = Duration::from_secs(2);
/// How long `stop()` waits for a loop before aborting it.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub name: &'static str,
    pub running: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStatus {
    pub running: bool,
    pub ws_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub websocket_clients: usize,
    pub agents_tracked: usize,
    pub backups_available: usize,
    pub tasks: Vec<TaskStatus>,
}

pub struct Orchestrator {
    state: AppState,
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    ws_addr: SocketAddr,
    http_addr: SocketAddr,
}

/// Run `make` until shutdown, restarting it after errors and panics.
fn supervise<F, Fut>(name: &'static str, mut shutdown: Shutdown, make: F) -> JoinHandle<()>
where
    F: Fn(Shutdown) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match tokio::spawn(make(shutdown.clone())).await {
                Ok(Ok(())) if *shutdown.borrow() => break,
                Ok(Ok(())) => warn!("{name} exited unexpectedly; restarting"),
                Ok(Err(e)) => error!("{name} failed: {e:#}; restarting"),
                Err(e) if e.is_panic() => error!("{name} panicked; restarting"),
                Err(e) => error!("{name} was cancelled: {e}; restarting"),
            }
            if pause(RESTART_DELAY, &mut shutdown).await {
                break;
            }
        }
        debug!("{name} stopped");
    })
}

/// Serve `router` on `addr`. The first run takes the listener bound at
/// startup; restarts bind again.
fn serve_task(
    name: &'static str,
    listener: TcpListener,
    router: Router,
    shutdown: Shutdown,
    on_shutdown: Option<Broadcaster>,
) -> anyhow::Result<JoinHandle<()>> {
    let addr = listener.local_addr()?;
    let slot = Arc::new(Mutex::new(Some(listener)));
    Ok(supervise(name, shutdown, move |mut sd| {
        let slot = slot.clone();
        let router = router.clone();
        let on_shutdown = on_shutdown.clone();
        async move {
            let pre_bound = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
            let listener = match pre_bound {
                Some(l) => l,
                None => TcpListener::bind(addr).await?,
            };
            info!("{name} listening on {addr}");
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = sd.wait_for(|stop| *stop).await;
                    // Open viewer sockets only end once their queues close.
                    if let Some(b) = on_shutdown {
                        b.close_all();
                    }
                })
                .await?;
            Ok(())
        }
    }))
}

async fn watch_loop(state: AppState, mut shutdown: Shutdown) -> anyhow::Result<()> {
    let watcher = ChangeWatcher::new(state_store_roots(&state.paths), DEFAULT_POLL_INTERVAL)?;
    info!("watching {} root(s)", watcher.roots().count());
    let batches = watcher.into_stream();
    futures::pin_mut!(batches);
    loop {
        tokio::select! {
            batch = batches.next() => {
                let Some(batch) = batch else { return Ok(()) };
                state.broadcaster.handle_change_batch(&batch).await;
                for change in &batch {
                    let agent = match state.paths.classify(&change.path) {
                        PathClass::AgentState(a) | PathClass::AgentFile(a) => Some(a),
                        _ => None,
                    };
                    state.pipeline.log_event(
                        "file_change",
                        agent.as_deref(),
                        Some(serde_json::json!({ "kind": change.kind, "path": change.path })),
                    );
                }
            }
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => return Ok(()),
        }
    }
}

impl Orchestrator {
    /// Open the stores, prime the broadcaster, bind both listeners and spawn
    /// every loop.
    pub async fn start(config: &Config) -> anyhow::Result<Self> {
        let paths = config.paths();
        if let Some(parent) = paths.metrics_db.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let store = MetricsStore::open(&paths.metrics_db).await?;
        let pipeline = Arc::new(MetricsPipeline::new(
            paths.clone(),
            store,
            config.collect_interval,
        ));
        let backups = BackupManager::open(paths.clone(), config.retention())
            .await?
            .with_event_log(pipeline.clone());
        let report = backups.consistency_report();
        if !report.is_clean() {
            warn!(
                "backup directory inconsistent: {} orphaned metadata, {} orphaned archives, {} unreadable",
                report.orphaned_metadata.len(),
                report.orphaned_archives.len(),
                report.unreadable_metadata.len()
            );
        }

        let broadcaster = Broadcaster::new(paths.clone());
        broadcaster.prime().await;
        let state = AppState::new(broadcaster, pipeline, Arc::new(backups), paths);

        let ws_listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], config.ws_port))).await?;
        let http_listener =
            TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], config.http_port))).await?;
        let ws_addr = ws_listener.local_addr()?;
        let http_addr = http_listener.local_addr()?;

        let (shutdown, rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let ws_router = Router::new()
            .route("/", get(ws_handler))
            .route("/ws", get(ws_handler))
            .with_state(state.clone());
        tasks.push((
            "websocket server",
            serve_task(
                "websocket server",
                ws_listener,
                ws_router,
                rx.clone(),
                Some(state.broadcaster.clone()),
            )?,
        ));
        tasks.push((
            "query server",
            serve_task("query server", http_listener, api::router(state.clone()), rx.clone(), None)?,
        ));

        let s = state.clone();
        tasks.push((
            "change watcher",
            supervise("change watcher", rx.clone(), move |sd| watch_loop(s.clone(), sd)),
        ));
        let b = state.broadcaster.clone();
        tasks.push((
            "heartbeat",
            supervise("heartbeat", rx.clone(), move |sd| {
                sampler::heartbeat_loop(b.clone(), HEARTBEAT_PERIOD, sd)
            }),
        ));
        let (s, every) = (state.clone(), config.collect_interval);
        tasks.push((
            "metrics pipeline",
            supervise("metrics pipeline", rx.clone(), move |sd| {
                sampler::metrics_loop(s.clone(), every, sd)
            }),
        ));
        let (s, every) = (state.clone(), config.backup_interval);
        tasks.push((
            "backup scheduler",
            supervise("backup scheduler", rx.clone(), move |sd| {
                sampler::backup_loop(s.clone(), every, sd)
            }),
        ));
        let s = state.clone();
        tasks.push((
            "status reporter",
            supervise("status reporter", rx, move |sd| {
                sampler::status_loop(s.clone(), STATUS_PERIOD, sd)
            }),
        ));

        info!(
            "mission control up: websocket {ws_addr}, http {http_addr}, workspace {}",
            state.paths.root.display()
        );
        Ok(Self {
            state,
            shutdown,
            tasks,
            ws_addr,
            http_addr,
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn ws_addr(&self) -> SocketAddr {
        self.ws_addr
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            running: !*self.shutdown.borrow(),
            ws_addr: self.ws_addr,
            http_addr: self.http_addr,
            websocket_clients: self.state.broadcaster.client_count(),
            agents_tracked: self.state.broadcaster.agent_count(),
            backups_available: self.state.backups.count(),
            tasks: self
                .tasks
                .iter()
                .map(|(name, h)| TaskStatus {
                    name: *name,
                    running: !h.is_finished(),
                })
                .collect(),
        }
    }

    /// Signal every loop, close viewer connections and wait for each loop
    /// to finish.
    pub async fn stop(self) {
        info!("stopping mission control");
        let _ = self.shutdown.send(true);
        self.state.broadcaster.close_all();
        for (name, mut handle) in self.tasks {
            match tokio::time::timeout(STOP_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => debug!("{name} acknowledged shutdown"),
                Ok(Err(e)) => error!("{name} ended abnormally: {e}"),
                Err(_) => {
                    warn!("{name} did not stop within {STOP_TIMEOUT:?}; aborting");
                    handle.abort();
                }
            }
        }
        self.state.broadcaster.close_all();
        info!("mission control stopped");
    }
}
