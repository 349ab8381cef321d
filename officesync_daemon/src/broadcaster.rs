//! Event broadcaster: connected viewers plus the last known state of every agent.
//!
//! Both live behind one lock. Registration queues the snapshot and inserts the
//! client under that lock, and every broadcast fans out under it too, so a new
//! client always sees its snapshot before any later event. Fan-out never waits:
//! each client has a bounded queue and a full or closed queue gets the client
//! dropped.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{json, Value};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::config::{PathClass, StatePaths};
use crate::types::{Envelope, EventType};
use crate::watcher::{ChangeBatch, ChangeKind};

/// Outbound messages a client may have queued before it counts as stalled.
pub const CLIENT_QUEUE_DEPTH: usize = 256;

pub type ClientId = u64;

#[derive(Default)]
struct Registry {
    clients: HashMap<ClientId, mpsc::Sender<String>>,
    /// Each agent's `state.json` exactly as last read.
    agents: BTreeMap<String, Value>,
    office_state: Option<Value>,
}

impl Registry {
    /// Send to everyone; drop whoever cannot take it. Returns the delivered count.
    fn fanout(&mut self, env: &Envelope) -> usize {
        if self.clients.is_empty() {
            return 0;
        }
        let text = env.to_json();
        let mut failed = Vec::new();
        for (id, tx) in &self.clients {
            match tx.try_send(text.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("client {id} is not keeping up; dropping it");
                    failed.push(*id);
                }
                Err(TrySendError::Closed(_)) => failed.push(*id),
            }
        }
        for id in &failed {
            self.clients.remove(id);
        }
        if !failed.is_empty() {
            info!(
                "unregistered {} client(s) after failed send. Total: {}",
                failed.len(),
                self.clients.len()
            );
        }
        self.clients.len()
    }
}

fn agent_status_envelope(agent_id: &str, state: &Value) -> Envelope {
    Envelope::new(
        EventType::AgentStatus,
        json!({ "agent": agent_id, "state": state }),
    )
}

#[derive(Clone)]
pub struct Broadcaster {
    paths: Arc<StatePaths>,
    registry: Arc<Mutex<Registry>>,
    next_id: Arc<AtomicU64>,
}

impl Broadcaster {
    pub fn new(paths: StatePaths) -> Self {
        Self {
            paths: Arc::new(paths),
            registry: Arc::new(Mutex::new(Registry::default())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        // A panic while holding the lock leaves plain maps behind; keep serving.
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Load every agent state and the office document from disk.
    pub async fn prime(&self) {
        if let Some(office) = read_json(&self.paths.office_state).await {
            self.lock().office_state = Some(office);
        }
        let mut dir = match tokio::fs::read_dir(&self.paths.agents_dir).await {
            Ok(d) => d,
            Err(e) => {
                warn!("cannot list {}: {e}", self.paths.agents_dir.display());
                return;
            }
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            let Ok(agent_id) = entry.file_name().into_string() else {
                continue;
            };
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(state) = read_agent_document(&self.paths.agent_state(&agent_id)).await {
                self.broadcast_agent_status(&agent_id, state);
            }
        }
        debug!("primed {} agent state(s)", self.agent_count());
    }

    /// Add a client and queue its snapshot: office state first, then one
    /// `agent_status` per known agent.
    pub fn register_client(&self) -> (ClientId, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut reg = self.lock();
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_DEPTH + reg.agents.len() + 1);
        if let Some(office) = &reg.office_state {
            let _ = tx.try_send(Envelope::new(EventType::AgentPosition, office.clone()).to_json());
        }
        for (agent_id, state) in &reg.agents {
            let _ = tx.try_send(agent_status_envelope(agent_id, state).to_json());
        }
        reg.clients.insert(id, tx);
        info!("Client connected. Total: {}", reg.clients.len());
        (id, rx)
    }

    /// Idempotent.
    pub fn unregister_client(&self, id: ClientId) -> bool {
        let mut reg = self.lock();
        let removed = reg.clients.remove(&id).is_some();
        if removed {
            info!("Client disconnected. Total: {}", reg.clients.len());
        }
        removed
    }

    /// Send `env` to every client. Returns how many clients remain connected.
    pub fn broadcast(&self, env: &Envelope) -> usize {
        self.lock().fanout(env)
    }

    /// The only writer of the last-known agent map.
    pub fn broadcast_agent_status(&self, agent_id: &str, state: Value) -> usize {
        let mut reg = self.lock();
        let env = agent_status_envelope(agent_id, &state);
        reg.agents.insert(agent_id.to_string(), state);
        reg.fanout(&env)
    }

    pub fn broadcast_office_state(&self, office: Value) -> usize {
        let mut reg = self.lock();
        let env = Envelope::new(EventType::AgentPosition, office.clone());
        reg.office_state = Some(office);
        reg.fanout(&env)
    }

    pub fn broadcast_agent_activity(&self, agent_id: &str, activity: Value) -> usize {
        self.broadcast(&Envelope::new(
            EventType::AgentActivity,
            json!({ "agent": agent_id, "activity": activity }),
        ))
    }

    pub fn broadcast_notification(
        &self,
        title: &str,
        message: &str,
        level: &str,
        data: Option<Value>,
    ) -> usize {
        self.broadcast(&Envelope::new(
            EventType::Notification,
            json!({
                "title": title,
                "message": message,
                "level": level,
                "data": data.unwrap_or_else(|| json!({})),
            }),
        ))
    }

    pub fn broadcast_system_metric(&self, metric: &str, value: f64, unit: &str) -> usize {
        self.broadcast(&Envelope::new(
            EventType::SystemMetric,
            json!({
                "metric": metric,
                "value": value,
                "unit": unit,
                "timestamp": crate::types::now_iso(),
            }),
        ))
    }

    pub fn heartbeat(&self) -> usize {
        let mut reg = self.lock();
        let env = Envelope::new(EventType::Heartbeat, json!({ "clients": reg.clients.len() }));
        reg.fanout(&env)
    }

    /// React to one watcher batch, in batch order.
    pub async fn handle_change_batch(&self, batch: &ChangeBatch) {
        for change in batch {
            match self.paths.classify(&change.path) {
                PathClass::AgentState(agent_id) => {
                    if change.kind == ChangeKind::Deleted {
                        debug!("state file for {agent_id} removed; keeping last known state");
                        continue;
                    }
                    if let Some(state) = read_agent_document(&change.path).await {
                        let before = self.agent_state(&agent_id).map(|s| status_of(&s));
                        let after = status_of(&state);
                        self.broadcast_agent_status(&agent_id, state);
                        if let Some(before) = before.filter(|b| *b != after) {
                            self.broadcast_agent_activity(
                                &agent_id,
                                json!({ "kind": "status_changed", "from": before, "to": after }),
                            );
                        }
                    }
                }
                PathClass::OfficeState => {
                    if change.kind == ChangeKind::Deleted {
                        continue;
                    }
                    if let Some(office) = read_json(&change.path).await {
                        self.broadcast_office_state(office);
                    }
                }
                PathClass::TaskQueue => {
                    self.broadcast(&Envelope::new(
                        EventType::TaskUpdate,
                        json!({
                            "type": "task_queue_changed",
                            "path": change.path,
                            "kind": change.kind,
                        }),
                    ));
                }
                PathClass::AgentFile(agent_id) => {
                    self.broadcast(&Envelope::new(
                        EventType::FileChange,
                        json!({
                            "agent": agent_id,
                            "kind": change.kind,
                            "path": change.path,
                        }),
                    ));
                }
                PathClass::Other => debug!("ignoring change at {}", change.path.display()),
            }
        }
    }

    pub fn agent_state(&self, agent_id: &str) -> Option<Value> {
        self.lock().agents.get(agent_id).cloned()
    }

    pub fn agent_status_envelope(&self, agent_id: &str) -> Option<Envelope> {
        self.lock()
            .agents
            .get(agent_id)
            .map(|s| agent_status_envelope(agent_id, s))
    }

    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }

    pub fn agent_count(&self) -> usize {
        self.lock().agents.len()
    }

    /// Drop every client queue; their sockets close once the queue drains.
    pub fn close_all(&self) -> usize {
        let mut reg = self.lock();
        let n = reg.clients.len();
        reg.clients.clear();
        n
    }
}

async fn read_json(path: &std::path::Path) -> Option<Value> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!("cannot read {}: {e}", path.display());
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("malformed json in {}: {e}", path.display());
            None
        }
    }
}

fn status_of(state: &Value) -> Value {
    state.get("status").cloned().unwrap_or(Value::Null)
}

/// Read one `state.json` as-is. Anything that is not a JSON object is
/// logged and skipped.
pub async fn read_agent_document(path: &std::path::Path) -> Option<Value> {
    let doc = read_json(path).await?;
    if doc.is_object() {
        Some(doc)
    } else {
        warn!("agent state {} is not a JSON object", path.display());
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::Change;
    use std::fs;

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(m) = rx.try_recv() {
            out.push(serde_json::from_str(&m).unwrap());
        }
        out
    }

    fn state(status: &str, done: u64) -> Value {
        json!({"status": status, "tasksCompleted": done})
    }

    fn broadcaster() -> (tempfile::TempDir, Broadcaster) {
        let dir = tempfile::tempdir().unwrap();
        let b = Broadcaster::new(StatePaths::new(dir.path()));
        (dir, b)
    }

    #[test]
    fn snapshot_precedes_later_events() {
        let (_dir, b) = broadcaster();
        b.broadcast_office_state(json!({"desks": 3}));
        b.broadcast_agent_status("scout", state("active", 1));
        b.broadcast_agent_status("forge", state("idle", 0));

        let (_id, mut rx) = b.register_client();
        b.broadcast_agent_status("scout", state("busy", 2));

        let msgs = drain(&mut rx);
        let kinds: Vec<&str> = msgs.iter().map(|m| m["type"].as_str().unwrap()).collect();
        assert_eq!(
            kinds,
            vec!["agent_position", "agent_status", "agent_status", "agent_status"]
        );
        assert_eq!(msgs[1]["data"]["agent"], "forge");
        assert_eq!(msgs[2]["data"]["agent"], "scout");
        assert_eq!(msgs[3]["data"]["state"]["status"], "busy");
    }

    #[test]
    fn broken_client_is_dropped_others_still_receive() {
        let (_dir, b) = broadcaster();
        let (_a, mut rx_a) = b.register_client();
        let (k, rx_k) = b.register_client();
        let (_c, mut rx_c) = b.register_client();
        drop(rx_k);

        let remaining = b.broadcast(&Envelope::new(EventType::Notification, json!({})));
        assert_eq!(remaining, 2);
        assert_eq!(b.client_count(), 2);
        assert!(!b.unregister_client(k), "already removed");
        assert_eq!(drain(&mut rx_a).len(), 1);
        assert_eq!(drain(&mut rx_c).len(), 1);
    }

    #[test]
    fn stalled_client_is_dropped() {
        let (_dir, b) = broadcaster();
        let (_slow, _rx_slow) = b.register_client();
        for _ in 0..CLIENT_QUEUE_DEPTH + 2 {
            b.heartbeat();
        }
        assert_eq!(b.client_count(), 0);
    }

    #[test]
    fn unregister_is_idempotent() {
        let (_dir, b) = broadcaster();
        let (id, _rx) = b.register_client();
        assert!(b.unregister_client(id));
        assert!(!b.unregister_client(id));
        assert!(!b.unregister_client(9999));
    }

    #[test]
    fn heartbeat_carries_client_count() {
        let (_dir, b) = broadcaster();
        let (_id, mut rx) = b.register_client();
        let (_id2, _rx2) = b.register_client();
        b.heartbeat();
        let msgs = drain(&mut rx);
        assert_eq!(msgs[0]["type"], "heartbeat");
        assert_eq!(msgs[0]["data"]["clients"], 2);
    }

    #[tokio::test]
    async fn change_batch_rereads_state_and_keeps_stale_on_bad_json() {
        let (dir, b) = broadcaster();
        let paths = StatePaths::new(dir.path());
        fs::create_dir_all(paths.agent_dir("scout")).unwrap();
        fs::write(
            paths.agent_state("scout"),
            br#"{"status":"active","tasksCompleted":4}"#,
        )
        .unwrap();
        fs::write(&paths.task_queue, b"- [ ] one").unwrap();
        let (_id, mut rx) = b.register_client();

        let batch = vec![
            Change {
                kind: ChangeKind::Modified,
                path: paths.agent_state("scout"),
            },
            Change {
                kind: ChangeKind::Modified,
                path: paths.task_queue.clone(),
            },
        ];
        b.handle_change_batch(&batch).await;
        let msgs = drain(&mut rx);
        assert_eq!(msgs[0]["type"], "agent_status");
        assert_eq!(msgs[1]["type"], "task_update");
        assert_eq!(msgs[1]["data"]["type"], "task_queue_changed");
        assert_eq!(b.agent_state("scout").unwrap()["status"], "active");

        fs::write(paths.agent_state("scout"), b"{not json").unwrap();
        b.handle_change_batch(&batch[..1].to_vec()).await;
        assert!(drain(&mut rx).is_empty());
        assert_eq!(b.agent_state("scout").unwrap()["tasksCompleted"], 4);
    }

    #[tokio::test]
    async fn status_transition_emits_activity() {
        let (dir, b) = broadcaster();
        let paths = StatePaths::new(dir.path());
        fs::create_dir_all(paths.agent_dir("scout")).unwrap();
        b.broadcast_agent_status("scout", state("idle", 0));
        let (_id, mut rx) = b.register_client();
        drain(&mut rx);

        fs::write(paths.agent_state("scout"), br#"{"status":"busy"}"#).unwrap();
        let batch = vec![Change {
            kind: ChangeKind::Modified,
            path: paths.agent_state("scout"),
        }];
        b.handle_change_batch(&batch).await;
        let msgs = drain(&mut rx);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1]["type"], "agent_activity");
        assert_eq!(msgs[1]["data"]["agent"], "scout");
        assert_eq!(msgs[1]["data"]["activity"]["from"], "idle");
        assert_eq!(msgs[1]["data"]["activity"]["to"], "busy");

        // same status again: no activity
        b.handle_change_batch(&batch).await;
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn agent_document_is_relayed_verbatim() {
        let (dir, b) = broadcaster();
        let paths = StatePaths::new(dir.path());
        fs::create_dir_all(paths.agent_dir("relay")).unwrap();
        let doc = json!({
            "status": "offline",
            "tasks_completed": 7,
            "tasksFailed": null,
            "mood": {"tired": true}
        });
        fs::write(paths.agent_state("relay"), doc.to_string()).unwrap();
        let (_id, mut rx) = b.register_client();

        b.handle_change_batch(&vec![Change {
            kind: ChangeKind::Created,
            path: paths.agent_state("relay"),
        }])
        .await;
        let msgs = drain(&mut rx);
        assert_eq!(msgs[0]["data"]["state"], doc);
        assert_eq!(b.agent_state("relay"), Some(doc.clone()));

        let (_late, mut late_rx) = b.register_client();
        assert_eq!(drain(&mut late_rx)[0]["data"]["state"], doc);
    }

    #[test]
    fn snapshot_then_stream_holds_under_concurrent_registration() {
        const AGENTS: usize = 4;
        const UPDATES: u64 = 50;
        let (_dir, b) = broadcaster();

        let receivers = std::thread::scope(|scope| {
            for a in 0..AGENTS {
                let b = b.clone();
                scope.spawn(move || {
                    for seq in 0..UPDATES {
                        b.broadcast_agent_status(&format!("agent{a}"), json!({"seq": seq}));
                    }
                });
            }
            let joiners: Vec<_> = (0..8)
                .map(|_| {
                    let b = b.clone();
                    scope.spawn(move || b.register_client().1)
                })
                .collect();
            joiners
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        });

        for mut rx in receivers {
            let mut last: BTreeMap<String, u64> = BTreeMap::new();
            for msg in drain(&mut rx) {
                let agent = msg["data"]["agent"].as_str().unwrap().to_string();
                let seq = msg["data"]["state"]["seq"].as_u64().unwrap();
                // Snapshot first, then every later update in order and without gaps.
                if let Some(prev) = last.insert(agent.clone(), seq) {
                    assert_eq!(seq, prev + 1, "{agent} went from {prev} to {seq}");
                }
            }
            for (agent, seq) in &last {
                assert_eq!(*seq, UPDATES - 1, "{agent} missed its final update");
            }
        }
        assert_eq!(b.client_count(), 8);
    }

    #[tokio::test]
    async fn prime_loads_agents_and_office_state() {
        let (dir, b) = broadcaster();
        let paths = StatePaths::new(dir.path());
        fs::create_dir_all(paths.agent_dir("forge")).unwrap();
        fs::create_dir_all(paths.agent_dir("empty")).unwrap();
        fs::write(paths.agent_state("forge"), br#"{"status":"idle"}"#).unwrap();
        fs::write(&paths.office_state, br#"{"agents":[]}"#).unwrap();
        b.prime().await;
        assert_eq!(b.agent_count(), 1);
        let (_id, mut rx) = b.register_client();
        assert_eq!(drain(&mut rx)[0]["type"], "agent_position");
    }
}
