//! Metrics pipeline: samples every agent's state document on a fixed cadence,
//! derives per-agent and fleet-wide figures and appends them to the store.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::StatePaths;
use crate::error::{CollectError, StoreError};
use crate::store::MetricsStore;
use crate::types::{AgentRuntimeState, AgentStatus};

/// Window used by `performance_summary`.
pub const SUMMARY_WINDOW_HOURS: u32 = 24;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMetricsSample {
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_in_progress: u64,
    pub avg_task_duration: f64,
    pub total_work_time: f64,
    pub idle_time: f64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub error_rate: f64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetricsSample {
    pub timestamp: DateTime<Utc>,
    pub total_agents: u64,
    pub active_agents: u64,
    pub idle_agents: u64,
    pub busy_agents: u64,
    pub offline_agents: u64,
    pub total_tasks_completed: u64,
    pub total_tasks_failed: u64,
    pub total_tasks_pending: u64,
    pub health_score: f64,
    pub events_per_minute: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSummary {
    pub agent_id: String,
    pub period_hours: u32,
    pub data_points: usize,
    pub avg_success_rate: f64,
    pub avg_error_rate: f64,
    pub avg_tasks_in_progress: f64,
    /// Growth of the completed counter across the window.
    pub tasks_completed_in_period: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentMetrics {
    pub agents: BTreeMap<String, AgentMetricsSample>,
    pub system: Option<SystemMetricsSample>,
}

/// Outcome of one `collect()` pass.
#[derive(Debug, Clone)]
pub struct CollectReport {
    pub agents_sampled: usize,
    pub agents_offline: usize,
    pub events_flushed: usize,
    pub system: SystemMetricsSample,
}

/// `(error_rate, success_rate)`; a fresh agent with no finished tasks is
/// fully successful.
pub fn task_rates(completed: u64, failed: u64) -> (f64, f64) {
    if completed == 0 && failed == 0 {
        return (0.0, 1.0);
    }
    // Counters come straight from agent files, so the sum may not fit a u64.
    let error = failed as f64 / (completed as f64 + failed as f64);
    (error, 1.0 - error)
}

pub fn health_score(total_agents: u64, active: u64, completed: u64, failed: u64) -> f64 {
    if total_agents == 0 {
        return 1.0;
    }
    let active_ratio = active as f64 / total_agents as f64;
    let (_, success) = task_rates(completed, failed);
    0.5 * active_ratio + 0.5 * success
}

impl AgentMetricsSample {
    /// Derive a sample from one state document. `messages_fallback` is used
    /// when the document does not carry its own message counter.
    pub fn from_state(
        agent_id: &str,
        state: &AgentRuntimeState,
        messages_fallback: u64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let (error_rate, success_rate) = task_rates(state.tasks_completed, state.tasks_failed);
        Self {
            agent_id: agent_id.to_string(),
            timestamp,
            tasks_completed: state.tasks_completed,
            tasks_failed: state.tasks_failed,
            tasks_in_progress: state.current_tasks.len() as u64,
            avg_task_duration: state
                .extra_f64("avgTaskDuration", "avg_task_duration")
                .unwrap_or(0.0),
            total_work_time: state.extra_f64("totalWorkTime", "total_work_time").unwrap_or(0.0),
            idle_time: state.extra_f64("idleTime", "idle_time").unwrap_or(0.0),
            messages_sent: state
                .extra_u64("messagesSent", "messages_sent")
                .unwrap_or(messages_fallback),
            messages_received: state
                .extra_u64("messagesReceived", "messages_received")
                .unwrap_or(0),
            error_rate,
            success_rate,
        }
    }
}

impl SystemMetricsSample {
    /// Aggregate over one pass. `None` entries are agents whose state could not
    /// be read and count as offline.
    pub fn compute(
        observed: &[Option<&AgentRuntimeState>],
        tasks_pending: u64,
        events_per_minute: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let mut s = Self {
            timestamp,
            total_agents: observed.len() as u64,
            active_agents: 0,
            idle_agents: 0,
            busy_agents: 0,
            offline_agents: 0,
            total_tasks_completed: 0,
            total_tasks_failed: 0,
            total_tasks_pending: tasks_pending,
            health_score: 1.0,
            events_per_minute,
        };
        for state in observed {
            let Some(state) = state else {
                s.offline_agents += 1;
                continue;
            };
            match state.status {
                AgentStatus::Active => s.active_agents += 1,
                AgentStatus::Idle => s.idle_agents += 1,
                AgentStatus::Busy => s.busy_agents += 1,
                AgentStatus::Unknown => s.offline_agents += 1,
            }
            s.total_tasks_completed = s.total_tasks_completed.saturating_add(state.tasks_completed);
            s.total_tasks_failed = s.total_tasks_failed.saturating_add(state.tasks_failed);
        }
        s.health_score = health_score(
            s.total_agents,
            s.active_agents,
            s.total_tasks_completed,
            s.total_tasks_failed,
        );
        s
    }
}

impl PerformanceSummary {
    /// `None` when the window holds no samples.
    pub fn from_history(agent_id: &str, period_hours: u32, hist: &[AgentMetricsSample]) -> Option<Self> {
        let (first, last) = (hist.first()?, hist.last()?);
        let n = hist.len() as f64;
        let avg = |f: fn(&AgentMetricsSample) -> f64| hist.iter().map(f).sum::<f64>() / n;
        Some(Self {
            agent_id: agent_id.to_string(),
            period_hours,
            data_points: hist.len(),
            avg_success_rate: avg(|s| s.success_rate),
            avg_error_rate: avg(|s| s.error_rate),
            avg_tasks_in_progress: avg(|s| s.tasks_in_progress as f64),
            tasks_completed_in_period: last.tasks_completed.saturating_sub(first.tasks_completed),
        })
    }
}

/// Open checkboxes in the task queue document.
pub fn count_pending_tasks(markdown: &str) -> u64 {
    markdown.matches("- [ ]").count() as u64
}

enum StateRead {
    Parsed(AgentRuntimeState),
    Missing,
    Unreadable,
}

async fn read_state(path: &Path) -> StateRead {
    match tokio::fs::read(path).await {
        Ok(bytes) => match AgentRuntimeState::from_slice(&bytes) {
            Ok(s) => StateRead::Parsed(s),
            Err(e) => {
                warn!("skipping malformed agent state {}: {e}", path.display());
                StateRead::Unreadable
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => StateRead::Missing,
        Err(e) => {
            warn!("cannot read agent state {}: {e}", path.display());
            StateRead::Unreadable
        }
    }
}

async fn count_dir_entries(dir: &Path) -> u64 {
    let Ok(mut rd) = tokio::fs::read_dir(dir).await else {
        return 0;
    };
    let mut n = 0;
    while let Ok(Some(_)) = rd.next_entry().await {
        n += 1;
    }
    n
}

pub struct MetricsPipeline {
    paths: StatePaths,
    store: MetricsStore,
    interval: Duration,
    agent_cache: Mutex<BTreeMap<String, AgentMetricsSample>>,
    latest_system: Mutex<Option<SystemMetricsSample>>,
    events: Mutex<Vec<EventRecord>>,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl MetricsPipeline {
    pub fn new(paths: StatePaths, store: MetricsStore, interval: Duration) -> Self {
        Self {
            paths,
            store,
            interval,
            agent_cache: Mutex::new(BTreeMap::new()),
            latest_system: Mutex::new(None),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Buffer an event; it is written on the next `collect()`.
    pub fn log_event(&self, event_type: &str, agent_id: Option<&str>, payload: Option<Value>) {
        guard(&self.events).push(EventRecord {
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            agent_id: agent_id.map(str::to_string),
            payload,
        });
    }

    /// Put unflushed events back ahead of anything logged meanwhile.
    fn requeue(&self, events: Vec<EventRecord>) {
        let mut buf = guard(&self.events);
        let newer = std::mem::replace(&mut *buf, events);
        buf.extend(newer);
    }

    pub fn pending_events(&self) -> usize {
        guard(&self.events).len()
    }

    async fn agent_ids(&self) -> Result<Vec<String>, CollectError> {
        let dir = &self.paths.agents_dir;
        let mut rd = match tokio::fs::read_dir(dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(CollectError::ListAgents {
                    path: dir.clone(),
                    source,
                })
            }
        };
        let mut ids = Vec::new();
        loop {
            match rd.next_entry().await {
                Ok(Some(entry)) => {
                    let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
                    if is_dir {
                        ids.push(entry.file_name().to_string_lossy().into_owned());
                    }
                }
                Ok(None) => break,
                Err(source) => {
                    return Err(CollectError::ListAgents {
                        path: dir.clone(),
                        source,
                    })
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// One collection pass over every agent directory.
    pub async fn collect(&self) -> Result<CollectReport, CollectError> {
        let now = Utc::now();
        let ids = self.agent_ids().await?;

        let mut states: Vec<Option<AgentRuntimeState>> = Vec::with_capacity(ids.len());
        let mut samples = Vec::new();
        for id in &ids {
            match read_state(&self.paths.agent_state(id)).await {
                StateRead::Parsed(state) => {
                    let memory = count_dir_entries(&self.paths.agent_dir(id).join("memory")).await;
                    samples.push(AgentMetricsSample::from_state(id, &state, memory, now));
                    states.push(Some(state));
                }
                StateRead::Missing => {
                    debug!("agent {id} has no state document");
                    states.push(None);
                }
                StateRead::Unreadable => states.push(None),
            }
        }

        self.store.insert_agent_samples(&samples).await?;
        {
            let mut cache = guard(&self.agent_cache);
            for s in &samples {
                cache.insert(s.agent_id.clone(), s.clone());
            }
        }

        let pending = match tokio::fs::read_to_string(&self.paths.task_queue).await {
            Ok(md) => count_pending_tasks(&md),
            Err(_) => 0,
        };

        let events = std::mem::take(&mut *guard(&self.events));
        let minutes = (self.interval.as_secs_f64() / 60.0).max(f64::EPSILON);
        let epm = events.len() as f64 / minutes;

        let refs: Vec<Option<&AgentRuntimeState>> = states.iter().map(Option::as_ref).collect();
        let system = SystemMetricsSample::compute(&refs, pending, epm, now);
        if let Err(e) = self.store.insert_system_sample(&system).await {
            self.requeue(events);
            return Err(e.into());
        }
        *guard(&self.latest_system) = Some(system.clone());

        let flushed = events.len();
        if let Err(e) = self.store.insert_events(&events).await {
            self.requeue(events);
            return Err(e.into());
        }

        Ok(CollectReport {
            agents_sampled: samples.len(),
            agents_offline: system.offline_agents as usize,
            events_flushed: flushed,
            system,
        })
    }

    pub async fn history(
        &self,
        agent_id: &str,
        window_hours: u32,
    ) -> Result<Vec<AgentMetricsSample>, StoreError> {
        let since = Utc::now() - chrono::Duration::hours(i64::from(window_hours));
        self.store.agent_history(agent_id, since).await
    }

    pub async fn system_history(&self, window_hours: u32) -> Result<Vec<SystemMetricsSample>, StoreError> {
        let since = Utc::now() - chrono::Duration::hours(i64::from(window_hours));
        self.store.system_history(since).await
    }

    pub async fn recent_events(
        &self,
        event_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<EventRecord>, StoreError> {
        self.store.recent_events(event_type, limit).await
    }

    pub async fn performance_summary(
        &self,
        agent_id: &str,
    ) -> Result<Option<PerformanceSummary>, StoreError> {
        let hist = self.history(agent_id, SUMMARY_WINDOW_HOURS).await?;
        Ok(PerformanceSummary::from_history(agent_id, SUMMARY_WINDOW_HOURS, &hist))
    }

    pub fn current_metrics(&self) -> CurrentMetrics {
        CurrentMetrics {
            agents: guard(&self.agent_cache).clone(),
            system: guard(&self.latest_system).clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(status: &str, done: u64, failed: u64) -> AgentRuntimeState {
        AgentRuntimeState::from_slice(
            json!({"status": status, "tasksCompleted": done, "tasksFailed": failed})
                .to_string()
                .as_bytes(),
        )
        .unwrap()
    }

    #[test]
    fn scout_rates() {
        let s = AgentMetricsSample::from_state("scout", &state("active", 10, 2), 0, Utc::now());
        assert!((s.error_rate - 0.1667).abs() < 1e-3);
        assert!((s.success_rate - 0.8333).abs() < 1e-3);
    }

    #[test]
    fn no_finished_tasks_is_fully_successful() {
        assert_eq!(task_rates(0, 0), (0.0, 1.0));
        assert_eq!(health_score(0, 0, 0, 0), 1.0);
        assert_eq!(health_score(2, 2, 0, 0), 1.0);
    }

    #[test]
    fn health_score_blends_activity_and_success() {
        let a = state("active", 20, 5);
        let b = state("active", 20, 5);
        let c = state("active", 20, 5);
        let d = state("idle", 20, 5);
        let observed = [Some(&a), Some(&b), Some(&c), Some(&d), None];
        let s = SystemMetricsSample::compute(&observed, 0, 0.0, Utc::now());
        assert_eq!(
            (s.active_agents, s.idle_agents, s.offline_agents),
            (3, 1, 1)
        );
        assert_eq!((s.total_tasks_completed, s.total_tasks_failed), (80, 20));
        assert!((s.health_score - 0.7).abs() < 1e-9);
    }

    #[test]
    fn counters_at_the_top_of_the_range_do_not_overflow() {
        let raw = br#"{"status":"active","tasksCompleted":18446744073709551615,"tasksFailed":1}"#;
        let huge = AgentRuntimeState::from_slice(raw).unwrap();
        assert_eq!(huge.tasks_completed, u64::MAX);

        let a = AgentMetricsSample::from_state("scout", &huge, 0, Utc::now());
        assert!(a.error_rate.is_finite() && a.success_rate.is_finite());
        assert!(a.success_rate > 0.999);

        let other = state("idle", 5, 5);
        let s = SystemMetricsSample::compute(&[Some(&huge), Some(&other)], 0, 0.0, Utc::now());
        assert_eq!(s.total_tasks_completed, u64::MAX);
        assert_eq!(s.total_tasks_failed, 6);
        assert!(s.health_score.is_finite());
        assert!(s.health_score > 0.0 && s.health_score <= 1.0);
    }

    #[test]
    fn messages_fall_back_when_state_lacks_counter() {
        let s = AgentMetricsSample::from_state("forge", &state("idle", 0, 0), 4, Utc::now());
        assert_eq!(s.messages_sent, 4);
        let mut with = state("idle", 0, 0);
        with.extra.insert("messagesSent".into(), json!(9));
        let s = AgentMetricsSample::from_state("forge", &with, 4, Utc::now());
        assert_eq!(s.messages_sent, 9);
    }

    #[test]
    fn pending_tasks_count_open_boxes_only() {
        let md = "# Queue\n- [ ] one\n- [x] done\n- [ ] two\n";
        assert_eq!(count_pending_tasks(md), 2);
    }

    fn write(path: &Path, body: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    #[tokio::test]
    async fn collect_isolates_bad_agents_and_flushes_events() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StatePaths::new(dir.path());
        write(
            &paths.agent_state("scout"),
            r#"{"status":"active","tasksCompleted":10,"tasksFailed":2}"#,
        );
        write(&paths.agent_state("forge"), "{ not json");
        std::fs::create_dir_all(paths.agent_dir("ghost")).unwrap();
        write(&paths.task_queue, "- [ ] a\n- [ ] b\n");

        let store = MetricsStore::open_in_memory().await.unwrap();
        let pipeline = MetricsPipeline::new(paths, store, Duration::from_secs(60));
        pipeline.log_event("file_change", Some("scout"), Some(json!({"n": 1})));
        pipeline.log_event("file_change", None, None);

        let report = pipeline.collect().await.unwrap();
        assert_eq!(report.agents_sampled, 1);
        assert_eq!(report.agents_offline, 2);
        assert_eq!(report.events_flushed, 2);
        assert_eq!(report.system.total_tasks_pending, 2);
        assert_eq!(report.system.events_per_minute, 2.0);
        assert_eq!(pipeline.pending_events(), 0);

        let hist = pipeline.history("scout", 24).await.unwrap();
        assert_eq!(hist.len(), 1);
        assert!(pipeline.history("forge", 24).await.unwrap().is_empty());

        let events = pipeline.recent_events(Some("file_change"), 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].agent_id, None);

        let current = pipeline.current_metrics();
        assert!(current.agents.contains_key("scout"));
        assert_eq!(current.system.map(|s| s.total_agents), Some(3));
    }

    #[tokio::test]
    async fn summary_reports_no_data_and_averages() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StatePaths::new(dir.path());
        let store = MetricsStore::open_in_memory().await.unwrap();
        let pipeline = MetricsPipeline::new(paths.clone(), store, Duration::from_secs(60));
        assert!(pipeline.performance_summary("scout").await.unwrap().is_none());

        write(&paths.agent_state("scout"), r#"{"status":"active","tasksCompleted":1}"#);
        pipeline.collect().await.unwrap();
        write(
            &paths.agent_state("scout"),
            r#"{"status":"active","tasksCompleted":3,"tasksFailed":1}"#,
        );
        pipeline.collect().await.unwrap();

        let summary = pipeline.performance_summary("scout").await.unwrap().unwrap();
        assert_eq!(summary.data_points, 2);
        assert_eq!(summary.tasks_completed_in_period, 2);
        assert!((summary.avg_success_rate - 0.875).abs() < 1e-9);
        assert_eq!(pipeline.system_history(24).await.unwrap().len(), 2);
    }
}
