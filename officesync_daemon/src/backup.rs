//! Backup and recovery: timestamped zip archives of the state store, each
//! with a SHA-256 checksum and a metadata document beside it.
//!
//! Layout of the backup directory:
//!   `<id>.zip`                 archive
//!   `<id>.meta.json`           `BackupRecord`
//!   `snapshot_<id>.json.gz`    gzipped JSON of every agent state plus office state
//!   `*.partial`                in-flight writes; removed at startup
//!
//! Creation, restore and cleanup share one operation lock, so concurrent
//! requests queue behind each other. The archive is written under a temporary
//! name, renamed into place, and only then registered.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{error, info, warn};

use crate::archive::{copy_tree, extract_archive, move_tree, sha256_file, write_archive};
use crate::config::StatePaths;
use crate::error::BackupError;
use crate::metrics::MetricsPipeline;

const ARCHIVE_EXT: &str = ".zip";
const META_EXT: &str = ".meta.json";
const PARTIAL_EXT: &str = ".partial";
const SNAPSHOT_PREFIX: &str = "snapshot_";
const SNAPSHOT_EXT: &str = ".json.gz";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackupKind {
    Full,
    AgentState,
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackupKind::Full => "full",
            BackupKind::AgentState => "agentState",
        })
    }
}

impl FromStr for BackupKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(BackupKind::Full),
            "agentState" | "agent_state" | "agent" => Ok(BackupKind::AgentState),
            other => Err(format!("unknown backup type: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: BackupKind,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "archivePath", alias = "path")]
    pub path: PathBuf,
    #[serde(rename = "sizeBytes", alias = "size")]
    pub size: u64,
    pub checksum: String,
    pub file_count: usize,
    /// Entries are deflated. Records written before the flag existed were too.
    #[serde(default = "deflated")]
    pub compressed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<PathBuf>,
}

/// Findings of the startup scan of the backup directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyReport {
    /// Metadata whose archive is gone.
    pub orphaned_metadata: Vec<String>,
    /// Archives with no metadata document.
    pub orphaned_archives: Vec<PathBuf>,
    /// Metadata documents that failed to parse.
    pub unreadable_metadata: Vec<PathBuf>,
    pub removed_partials: usize,
}

impl ConsistencyReport {
    pub fn is_clean(&self) -> bool {
        self.orphaned_metadata.is_empty()
            && self.orphaned_archives.is_empty()
            && self.unreadable_metadata.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreOutcome {
    pub backup_id: String,
    pub target: PathBuf,
    pub files: usize,
    /// Undo backup taken of the live agent before it was replaced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub undo_backup: Option<String>,
}

struct Inner {
    paths: StatePaths,
    retention: chrono::Duration,
    records: Mutex<BTreeMap<String, BackupRecord>>,
    report: Mutex<ConsistencyReport>,
}

fn deflated() -> bool {
    true
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

fn write_json_atomic(path: &Path, value: &impl Serialize) -> Result<(), BackupError> {
    let tmp = with_suffix(path, PARTIAL_EXT);
    let body = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp, body).map_err(|e| BackupError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        BackupError::io(path, e)
    })
}

impl Inner {
    fn archive_path(&self, id: &str) -> PathBuf {
        self.paths.backup_dir.join(format!("{id}{ARCHIVE_EXT}"))
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.paths.backup_dir.join(format!("{id}{META_EXT}"))
    }

    fn snapshot_path(&self, id: &str) -> PathBuf {
        self.paths
            .backup_dir
            .join(format!("{SNAPSHOT_PREFIX}{id}{SNAPSHOT_EXT}"))
    }

    fn record(&self, id: &str) -> Result<BackupRecord, BackupError> {
        guard(&self.records)
            .get(id)
            .cloned()
            .ok_or_else(|| BackupError::NotFound(id.to_string()))
    }

    fn unique_id(&self, base: String) -> String {
        let records = guard(&self.records);
        let taken = |id: &str| records.contains_key(id) || self.archive_path(id).exists();
        let mut id = base.clone();
        let mut n = 2u32;
        while taken(&id) {
            id = format!("{base}_{n}");
            n += 1;
        }
        id
    }

    /// Scan the backup directory, load every metadata document and report
    /// anything that does not pair up.
    fn scan(&self) -> Result<(), BackupError> {
        let dir = &self.paths.backup_dir;
        fs::create_dir_all(dir).map_err(|e| BackupError::io(dir, e))?;

        let mut report = ConsistencyReport::default();
        let mut records = BTreeMap::new();
        let mut archives = Vec::new();
        for entry in fs::read_dir(dir).map_err(|e| BackupError::io(dir, e))? {
            let path = entry.map_err(|e| BackupError::io(dir, e))?.path();
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if name.ends_with(PARTIAL_EXT) {
                let removed = if path.is_dir() {
                    fs::remove_dir_all(&path)
                } else {
                    fs::remove_file(&path)
                };
                match removed {
                    Ok(()) => report.removed_partials += 1,
                    Err(e) => warn!("cannot remove leftover {}: {e}", path.display()),
                }
            } else if name.ends_with(META_EXT) {
                let parsed = fs::read(&path)
                    .map_err(|e| BackupError::io(&path, e))
                    .and_then(|b| Ok(serde_json::from_slice::<BackupRecord>(&b)?));
                match parsed {
                    Ok(rec) => {
                        records.insert(rec.id.clone(), rec);
                    }
                    Err(e) => {
                        error!("unreadable backup metadata {}: {e}", path.display());
                        report.unreadable_metadata.push(path);
                    }
                }
            } else if name.ends_with(ARCHIVE_EXT) {
                archives.push(path);
            }
        }

        for rec in records.values() {
            if !rec.path.exists() {
                error!(
                    "backup {} has metadata but its archive {} is missing",
                    rec.id,
                    rec.path.display()
                );
                report.orphaned_metadata.push(rec.id.clone());
            }
        }
        for archive in archives {
            if !records.values().any(|r| r.path == archive) {
                error!("archive {} has no metadata", archive.display());
                report.orphaned_archives.push(archive);
            }
        }
        report.orphaned_metadata.sort();
        report.orphaned_archives.sort();

        info!(
            "loaded {} backup records from {}",
            records.len(),
            dir.display()
        );
        *guard(&self.records) = records;
        *guard(&self.report) = report;
        Ok(())
    }

    fn create(
        &self,
        kind: BackupKind,
        agent_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<BackupRecord, BackupError> {
        let stamp = now.format("%Y%m%d_%H%M%S");
        let (base, sources) = match (kind, agent_id) {
            (BackupKind::AgentState, Some(agent)) => {
                if !StatePaths::is_valid_agent_id(agent) {
                    return Err(BackupError::InvalidAgentId(agent.to_string()));
                }
                let dir = self.paths.agent_dir(agent);
                if !dir.is_dir() {
                    return Err(BackupError::AgentNotFound(agent.to_string()));
                }
                (format!("agent_{agent}_{stamp}"), vec![dir])
            }
            _ => (format!("full_{stamp}"), self.paths.backup_sources()),
        };
        let id = self.unique_id(base);
        let final_path = self.archive_path(&id);
        let partial = with_suffix(&final_path, PARTIAL_EXT);

        let written = write_archive(&partial, &self.paths.root, &sources)
            .and_then(|summary| {
                let checksum = sha256_file(&partial).map_err(|e| BackupError::io(&partial, e))?;
                let size = fs::metadata(&partial)
                    .map_err(|e| BackupError::io(&partial, e))?
                    .len();
                Ok((summary, checksum, size))
            });
        let (summary, checksum, size) = match written {
            Ok(v) => v,
            Err(e) => {
                let _ = fs::remove_file(&partial);
                return Err(e);
            }
        };
        fs::rename(&partial, &final_path).map_err(|e| BackupError::io(&final_path, e))?;

        let snapshot = if kind == BackupKind::Full {
            let path = self.snapshot_path(&id);
            match self.write_snapshot(&path, now) {
                Ok(()) => Some(path),
                Err(e) => {
                    warn!("snapshot for {id} not written: {e}");
                    None
                }
            }
        } else {
            None
        };

        let record = BackupRecord {
            id: id.clone(),
            kind,
            timestamp: now,
            path: final_path,
            size,
            checksum,
            file_count: summary.files,
            compressed: true,
            agent_id: agent_id.map(str::to_string),
            snapshot,
        };
        if let Err(e) = write_json_atomic(&self.meta_path(&id), &record) {
            // Without metadata the archive would be an orphan.
            for path in std::iter::once(&record.path).chain(record.snapshot.as_ref()) {
                if let Err(rm) = fs::remove_file(path) {
                    error!("cannot remove {} after failed backup: {rm}", path.display());
                }
            }
            return Err(e);
        }
        guard(&self.records).insert(id.clone(), record.clone());

        info!(
            "created {kind} backup {id}: {} files, {} bytes, {} skipped",
            summary.files, size, summary.skipped
        );
        Ok(record)
    }

    fn write_snapshot(&self, path: &Path, now: DateTime<Utc>) -> Result<(), BackupError> {
        let mut agents = Map::new();
        if let Ok(rd) = fs::read_dir(&self.paths.agents_dir) {
            let mut ids: Vec<String> = rd
                .filter_map(Result::ok)
                .filter(|e| e.path().is_dir())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect();
            ids.sort();
            for id in ids {
                let state_path = self.paths.agent_state(&id);
                match fs::read(&state_path).map(|b| serde_json::from_slice::<Value>(&b)) {
                    Ok(Ok(v)) => {
                        agents.insert(id, v);
                    }
                    Ok(Err(e)) => warn!("snapshot skips {}: {e}", state_path.display()),
                    Err(_) => {}
                }
            }
        }
        let office = fs::read(&self.paths.office_state)
            .ok()
            .and_then(|b| serde_json::from_slice::<Value>(&b).ok())
            .unwrap_or(Value::Null);
        let doc = json!({
            "timestamp": now,
            "agents": agents,
            "officeState": office,
        });

        let tmp = with_suffix(path, PARTIAL_EXT);
        let file = File::create(&tmp).map_err(|e| BackupError::io(&tmp, e))?;
        let mut enc = GzEncoder::new(BufWriter::new(file), Compression::default());
        serde_json::to_writer(&mut enc, &doc)?;
        enc.finish()
            .and_then(|mut w| io::Write::flush(&mut w))
            .map_err(|e| BackupError::io(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| BackupError::io(path, e))
    }

    /// Confirm the archive is present and matches its recorded checksum.
    fn check_archive(&self, rec: &BackupRecord) -> Result<(), BackupError> {
        if !rec.path.is_file() {
            return Err(BackupError::ArchiveMissing {
                id: rec.id.clone(),
                path: rec.path.clone(),
            });
        }
        let actual = sha256_file(&rec.path).map_err(|e| BackupError::io(&rec.path, e))?;
        if actual != rec.checksum {
            return Err(BackupError::ChecksumMismatch {
                id: rec.id.clone(),
                expected: rec.checksum.clone(),
                actual,
            });
        }
        Ok(())
    }

    fn staging_dir(&self, id: &str) -> PathBuf {
        self.paths.backup_dir.join(format!(".restore_{id}{PARTIAL_EXT}"))
    }

    fn restore(&self, id: &str, target: &Path) -> Result<RestoreOutcome, BackupError> {
        let rec = self.record(id)?;
        self.check_archive(&rec)?;

        let staging = self.staging_dir(id);
        let _ = fs::remove_dir_all(&staging);
        // Outlives a failed rollback, so it must not carry the partial suffix.
        let aside = self.paths.backup_dir.join(format!(".restore_{id}.prev"));
        let result = extract_archive(&rec.path, &staging).and_then(|_| {
            move_tree(&staging, target, &aside).map_err(|e| BackupError::io(target, e))
        });
        let _ = fs::remove_dir_all(&staging);
        let files = result?;

        info!("restored backup {id} into {} ({files} files)", target.display());
        Ok(RestoreOutcome {
            backup_id: id.to_string(),
            target: target.to_path_buf(),
            files,
            undo_backup: None,
        })
    }

    fn restore_agent(&self, id: &str, agent_id: &str) -> Result<RestoreOutcome, BackupError> {
        if !StatePaths::is_valid_agent_id(agent_id) {
            return Err(BackupError::InvalidAgentId(agent_id.to_string()));
        }
        let rec = self.record(id)?;
        self.check_archive(&rec)?;

        let live = self.paths.agent_dir(agent_id);
        let rel = live
            .strip_prefix(&self.paths.root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| PathBuf::from(agent_id));
        let staging = self.staging_dir(id);
        let _ = fs::remove_dir_all(&staging);

        let result = (|| {
            let files = extract_archive(&rec.path, &staging)?;
            let staged = staging.join(&rel);
            if !staged.is_dir() {
                return Err(BackupError::AgentNotInBackup {
                    id: id.to_string(),
                    agent: agent_id.to_string(),
                });
            }

            let undo = if live.is_dir() {
                Some(self.create(BackupKind::AgentState, Some(agent_id), Utc::now())?.id)
            } else {
                None
            };
            swap_in(&staged, &live)?;
            Ok((files, undo))
        })();
        let _ = fs::remove_dir_all(&staging);
        let (files, undo) = result?;

        info!("restored agent {agent_id} from backup {id}");
        Ok(RestoreOutcome {
            backup_id: id.to_string(),
            target: live,
            files,
            undo_backup: undo,
        })
    }

    fn clean(&self, now: DateTime<Utc>) -> Vec<String> {
        let cutoff = now - self.retention;
        let expired: Vec<BackupRecord> = guard(&self.records)
            .values()
            .filter(|r| r.timestamp < cutoff)
            .cloned()
            .collect();

        for rec in &expired {
            for path in [Some(rec.path.clone()), Some(self.meta_path(&rec.id)), rec.snapshot.clone()]
                .into_iter()
                .flatten()
            {
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => warn!("cannot remove {}: {e}", path.display()),
                }
            }
            guard(&self.records).remove(&rec.id);
            info!("removed expired backup {}", rec.id);
        }

        // Snapshots not tied to a surviving record age out on their own.
        if let Ok(rd) = fs::read_dir(&self.paths.backup_dir) {
            for entry in rd.filter_map(Result::ok) {
                let name = entry.file_name().to_string_lossy().into_owned();
                if !(name.starts_with(SNAPSHOT_PREFIX) && name.ends_with(SNAPSHOT_EXT)) {
                    continue;
                }
                let old = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .map(|t| DateTime::<Utc>::from(t) < cutoff)
                    .unwrap_or(false);
                if old {
                    if let Err(e) = fs::remove_file(entry.path()) {
                        warn!("cannot remove snapshot {name}: {e}");
                    }
                }
            }
        }

        expired.into_iter().map(|r| r.id).collect()
    }
}

/// Replace `live` with `staged`, restoring the previous tree if the swap fails.
fn swap_in(staged: &Path, live: &Path) -> Result<(), BackupError> {
    let aside = with_suffix(live, ".replaced");
    let _ = fs::remove_dir_all(&aside);
    let had_live = live.exists();
    if had_live {
        fs::rename(live, &aside).map_err(|e| BackupError::io(live, e))?;
    }
    if let Some(parent) = live.parent() {
        fs::create_dir_all(parent).map_err(|e| BackupError::io(parent, e))?;
    }
    let placed = fs::rename(staged, live).or_else(|_| copy_tree(staged, live));
    match placed {
        Ok(()) => {
            if had_live {
                let _ = fs::remove_dir_all(&aside);
            }
            Ok(())
        }
        Err(e) => {
            let _ = fs::remove_dir_all(live);
            if had_live {
                if let Err(back) = fs::rename(&aside, live) {
                    error!(
                        "agent tree left at {} after failed restore: {back}",
                        aside.display()
                    );
                }
            }
            Err(BackupError::io(live, e))
        }
    }
}

pub struct BackupManager {
    inner: Arc<Inner>,
    op_lock: Arc<tokio::sync::Mutex<()>>,
    events: Option<Arc<MetricsPipeline>>,
}

impl BackupManager {
    /// Load the registry from the backup directory and run the consistency
    /// scan.
    pub async fn open(paths: StatePaths, retention: chrono::Duration) -> Result<Self, BackupError> {
        let inner = Arc::new(Inner {
            paths,
            retention,
            records: Mutex::new(BTreeMap::new()),
            report: Mutex::new(ConsistencyReport::default()),
        });
        let scan = inner.clone();
        tokio::task::spawn_blocking(move || scan.scan()).await??;
        Ok(Self {
            inner,
            op_lock: Arc::new(tokio::sync::Mutex::new(())),
            events: None,
        })
    }

    /// Record backup lifecycle events in the metrics event log.
    pub fn with_event_log(mut self, pipeline: Arc<MetricsPipeline>) -> Self {
        self.events = Some(pipeline);
        self
    }

    fn log_event(&self, kind: &str, agent_id: Option<&str>, payload: Value) {
        if let Some(p) = &self.events {
            p.log_event(kind, agent_id, Some(payload));
        }
    }

    /// Run `f` on the blocking pool while holding the operation lock. The
    /// work completes even if the caller stops waiting.
    async fn serialized<T, F>(&self, f: F) -> Result<T, BackupError>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T, BackupError> + Send + 'static,
    {
        let permit = self.op_lock.clone().lock_owned().await;
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f(&inner)
        })
        .await?
    }

    pub async fn create_full_backup(&self) -> Result<BackupRecord, BackupError> {
        let rec = self
            .serialized(|inner| inner.create(BackupKind::Full, None, Utc::now()))
            .await?;
        self.log_event(
            "backup_created",
            None,
            json!({"id": rec.id, "type": rec.kind, "size": rec.size}),
        );
        Ok(rec)
    }

    pub async fn create_agent_state_backup(&self, agent_id: &str) -> Result<BackupRecord, BackupError> {
        let agent = agent_id.to_string();
        let rec = self
            .serialized(move |inner| inner.create(BackupKind::AgentState, Some(&agent), Utc::now()))
            .await?;
        self.log_event(
            "backup_created",
            Some(agent_id),
            json!({"id": rec.id, "type": rec.kind, "size": rec.size}),
        );
        Ok(rec)
    }

    /// Restore a whole backup over `target` (default: the workspace root).
    /// The archive is verified and fully extracted before anything is moved
    /// into place.
    pub async fn restore_backup(
        &self,
        backup_id: &str,
        target: Option<PathBuf>,
    ) -> Result<RestoreOutcome, BackupError> {
        let id = backup_id.to_string();
        let target = target.unwrap_or_else(|| self.inner.paths.root.clone());
        let res = self
            .serialized(move |inner| inner.restore(&id, &target))
            .await;
        self.report_restore(backup_id, None, &res);
        res
    }

    /// Replace one agent's live subtree with its copy from a backup. Fails
    /// without touching the live agent if the backup does not contain it.
    pub async fn restore_agent_state(
        &self,
        backup_id: &str,
        agent_id: &str,
    ) -> Result<RestoreOutcome, BackupError> {
        let (id, agent) = (backup_id.to_string(), agent_id.to_string());
        let res = self
            .serialized(move |inner| inner.restore_agent(&id, &agent))
            .await;
        self.report_restore(backup_id, Some(agent_id), &res);
        res
    }

    fn report_restore(
        &self,
        backup_id: &str,
        agent_id: Option<&str>,
        res: &Result<RestoreOutcome, BackupError>,
    ) {
        match res {
            Ok(out) => self.log_event(
                "backup_restored",
                agent_id,
                json!({"id": backup_id, "files": out.files, "target": out.target}),
            ),
            Err(e) if e.is_corruption() => error!("restore of {backup_id} refused: {e}"),
            Err(e) => warn!("restore of {backup_id} failed: {e}"),
        }
    }

    pub async fn clean_old_backups(&self) -> Result<Vec<String>, BackupError> {
        self.clean_old_backups_at(Utc::now()).await
    }

    /// Drop every record older than `now - retention` together with its files.
    pub async fn clean_old_backups_at(&self, now: DateTime<Utc>) -> Result<Vec<String>, BackupError> {
        let removed = self.serialized(move |inner| Ok(inner.clean(now))).await?;
        for id in &removed {
            self.log_event("backup_removed", None, json!({"id": id}));
        }
        Ok(removed)
    }

    /// Recompute the archive digest. `Ok(false)` for a missing or altered
    /// archive; only an unknown id is an error.
    pub async fn verify_backup(&self, backup_id: &str) -> Result<bool, BackupError> {
        let rec = self.inner.record(backup_id)?;
        let inner = self.inner.clone();
        let res = tokio::task::spawn_blocking(move || inner.check_archive(&rec)).await?;
        match res {
            Ok(()) => Ok(true),
            Err(e) if e.is_corruption() => {
                error!("backup {backup_id} failed verification: {e}");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Newest first.
    pub fn list_backups(&self, kind: Option<BackupKind>) -> Vec<BackupRecord> {
        let mut list: Vec<BackupRecord> = guard(&self.inner.records)
            .values()
            .filter(|r| kind.map_or(true, |k| r.kind == k))
            .cloned()
            .collect();
        list.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        list
    }

    pub fn get_backup(&self, backup_id: &str) -> Option<BackupRecord> {
        guard(&self.inner.records).get(backup_id).cloned()
    }

    pub fn count(&self) -> usize {
        guard(&self.inner.records).len()
    }

    pub fn consistency_report(&self) -> ConsistencyReport {
        guard(&self.inner.report).clone()
    }

    /// Copy a backup's archive to `dest` (a file path, or a directory to
    /// copy into). Returns the written path.
    pub async fn export_backup(&self, backup_id: &str, dest: PathBuf) -> Result<PathBuf, BackupError> {
        let rec = self.inner.record(backup_id)?;
        tokio::task::spawn_blocking(move || {
            if !rec.path.is_file() {
                return Err(BackupError::ArchiveMissing {
                    id: rec.id.clone(),
                    path: rec.path.clone(),
                });
            }
            let out = if dest.is_dir() {
                dest.join(rec.path.file_name().unwrap_or_default())
            } else {
                dest
            };
            fs::copy(&rec.path, &out).map_err(|e| BackupError::io(&out, e))?;
            Ok(out)
        })
        .await?
    }

    pub fn backup_dir(&self) -> &Path {
        &self.inner.paths.backup_dir
    }

    pub fn recovery_procedures(&self) -> Value {
        let dir = self.inner.paths.backup_dir.display().to_string();
        json!({
            "backupDirectory": dir,
            "retentionDays": self.inner.retention.num_days(),
            "procedures": [
                {
                    "name": "full_system_restore",
                    "description": "Restore the whole mission-control state from a full backup.",
                    "steps": [
                        "List backups: GET /api/backups?type=full",
                        "Verify the chosen backup: GET /api/backups/{id}/verify",
                        "Stop agent processes that write state",
                        "Restore: POST /api/backups/{id}/restore",
                        "Restart agents and confirm their status on the dashboard"
                    ]
                },
                {
                    "name": "agent_state_restore",
                    "description": "Replace one agent's directory with its copy from a backup. The current directory is saved as an agentState backup first.",
                    "steps": [
                        "Pick a backup containing the agent",
                        "Restore: POST /api/backups/{id}/restore with body {\"agentId\": \"<agent>\"}",
                        "The response names the undo backup taken before the swap"
                    ]
                },
                {
                    "name": "selective_file_restore",
                    "description": "Recover individual files by hand.",
                    "steps": [
                        format!("Copy the archive out of {dir}"),
                        "Unzip it into a scratch directory",
                        "Copy the needed files back under mission-control/",
                        format!("For agent state only, read the gzipped JSON {SNAPSHOT_PREFIX}<id>{SNAPSHOT_EXT}")
                    ]
                }
            ]
        })
    }
}

/// Read a gzipped JSON snapshot written alongside a full backup.
pub fn load_snapshot(path: &Path) -> Result<Value, BackupError> {
    let file = File::open(path).map_err(|e| BackupError::io(path, e))?;
    Ok(serde_json::from_reader(GzDecoder::new(BufReader::new(file)))?)
}
