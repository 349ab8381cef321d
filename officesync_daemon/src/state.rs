//! Shared daemon state handed to the WebSocket and HTTP handlers.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::backup::BackupManager;
use crate::broadcaster::Broadcaster;
use crate::config::StatePaths;
use crate::metrics::MetricsPipeline;

#[derive(Clone)]
pub struct AppState {
    pub broadcaster: Broadcaster,
    pub pipeline: Arc<MetricsPipeline>,
    pub backups: Arc<BackupManager>,
    pub paths: Arc<StatePaths>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        broadcaster: Broadcaster,
        pipeline: Arc<MetricsPipeline>,
        backups: Arc<BackupManager>,
        paths: StatePaths,
    ) -> Self {
        Self {
            broadcaster,
            pipeline,
            backups,
            paths: Arc::new(paths),
            started_at: Utc::now(),
        }
    }
}
