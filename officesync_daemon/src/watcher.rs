//! Change watcher: turns raw `notify` events under a fixed set of roots into
//! coalesced batches of `(kind, path)` pairs, one batch per polling interval.
//!
//! Roots may come and go. A root that disappears is disarmed and re-armed once it
//! exists again; on re-arm the files under it are reported as `created` so the
//! consumer re-reads them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::Stream;
use notify::{
    event::{ModifyKind, RenameMode},
    EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::StatePaths;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub kind: ChangeKind,
    pub path: PathBuf,
}

/// Changes seen during one interval. Treat it as "re-read these paths", not as a diff.
pub type ChangeBatch = Vec<Change>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchRoot {
    /// Directory watched recursively.
    Dir(PathBuf),
    /// Single file, watched through its parent directory.
    File(PathBuf),
}

impl WatchRoot {
    fn path(&self) -> &Path {
        match self {
            WatchRoot::Dir(p) | WatchRoot::File(p) => p,
        }
    }

    fn contains(&self, path: &Path) -> bool {
        match self {
            WatchRoot::Dir(p) => path.starts_with(p),
            WatchRoot::File(p) => path == p,
        }
    }
}

/// The agent tree, the office state document and the task queue.
pub fn state_store_roots(paths: &StatePaths) -> Vec<WatchRoot> {
    vec![
        WatchRoot::Dir(paths.agents_dir.clone()),
        WatchRoot::File(paths.office_state.clone()),
        WatchRoot::File(paths.task_queue.clone()),
    ]
}

/// A directory handed to `notify`. File roots sharing a parent share one target.
struct Target {
    dir: PathBuf,
    mode: RecursiveMode,
    armed: bool,
    ever_armed: bool,
}

pub struct ChangeWatcher {
    roots: Vec<WatchRoot>,
    targets: Vec<Target>,
    watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
    interval: Duration,
    synthetic: Vec<Change>,
}

/// Map a notify event onto our three kinds. Renames become delete + create.
fn map_event(event: &notify::Event) -> Vec<Change> {
    let one = |kind: ChangeKind| {
        event
            .paths
            .iter()
            .map(|p| Change {
                kind,
                path: p.clone(),
            })
            .collect::<Vec<_>>()
    };
    match event.kind {
        EventKind::Create(_) => one(ChangeKind::Created),
        EventKind::Remove(_) => one(ChangeKind::Deleted),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => one(ChangeKind::Deleted),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => one(ChangeKind::Created),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut out = Vec::new();
            if let Some(from) = event.paths.first() {
                out.push(Change {
                    kind: ChangeKind::Deleted,
                    path: from.clone(),
                });
            }
            if let Some(to) = event.paths.get(1) {
                out.push(Change {
                    kind: ChangeKind::Created,
                    path: to.clone(),
                });
            }
            out
        }
        EventKind::Modify(_) => one(ChangeKind::Modified),
        _ => Vec::new(),
    }
}

/// Fold `changes` into `batch`, keeping first-arrival position and the latest kind.
fn coalesce(batch: &mut ChangeBatch, index: &mut HashMap<PathBuf, usize>, changes: Vec<Change>) {
    for change in changes {
        match index.get(&change.path) {
            Some(&i) => batch[i].kind = change.kind,
            None => {
                index.insert(change.path.clone(), batch.len());
                batch.push(change);
            }
        }
    }
}

fn files_under(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            files_under(&path, out);
        } else {
            out.push(path);
        }
    }
}

impl ChangeWatcher {
    pub fn new(roots: Vec<WatchRoot>, interval: Duration) -> Result<Self, notify::Error> {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })?;

        let mut targets: Vec<Target> = Vec::new();
        for root in &roots {
            let (dir, mode) = match root {
                WatchRoot::Dir(p) => (p.clone(), RecursiveMode::Recursive),
                WatchRoot::File(p) => (
                    p.parent().map(Path::to_path_buf).unwrap_or_default(),
                    RecursiveMode::NonRecursive,
                ),
            };
            if !targets.iter().any(|t| t.dir == dir) {
                targets.push(Target {
                    dir,
                    mode,
                    armed: false,
                    ever_armed: false,
                });
            }
        }

        let mut w = Self {
            roots,
            targets,
            watcher,
            rx,
            interval,
            synthetic: Vec::new(),
        };
        w.rearm();
        Ok(w)
    }

    /// Paths currently under an active watch.
    pub fn armed(&self) -> Vec<PathBuf> {
        self.targets
            .iter()
            .filter(|t| t.armed)
            .map(|t| t.dir.clone())
            .collect()
    }

    fn rearm(&mut self) {
        for i in 0..self.targets.len() {
            let exists = self.targets[i].dir.is_dir();
            let t = &mut self.targets[i];
            if t.armed && !exists {
                let _ = self.watcher.unwatch(&t.dir);
                t.armed = false;
                warn!("watched root {} disappeared; waiting for it to return", t.dir.display());
            } else if !t.armed && exists {
                match self.watcher.watch(&t.dir, t.mode) {
                    Ok(()) => {
                        t.armed = true;
                        if t.ever_armed {
                            info!("re-armed watch on {}", t.dir.display());
                            let dir = t.dir.clone();
                            self.replay_existing(&dir);
                        } else {
                            debug!("watching {}", t.dir.display());
                        }
                        self.targets[i].ever_armed = true;
                    }
                    Err(e) => warn!("cannot watch {}: {e}", t.dir.display()),
                }
            }
        }
    }

    /// Report everything under a freshly re-armed directory as created.
    fn replay_existing(&mut self, dir: &Path) {
        for root in &self.roots {
            match root {
                WatchRoot::Dir(p) if p.starts_with(dir) || dir.starts_with(p) => {
                    let mut files = Vec::new();
                    files_under(p, &mut files);
                    self.synthetic
                        .extend(files.into_iter().map(|path| Change {
                            kind: ChangeKind::Created,
                            path,
                        }));
                }
                WatchRoot::File(p) if p.parent() == Some(dir) && p.exists() => {
                    self.synthetic.push(Change {
                        kind: ChangeKind::Created,
                        path: p.clone(),
                    });
                }
                _ => {}
            }
        }
    }

    /// Take whatever has arrived so far, filtered to our roots and coalesced.
    pub fn drain(&mut self) -> ChangeBatch {
        let mut batch = ChangeBatch::new();
        let mut index = HashMap::new();
        let synthetic = std::mem::take(&mut self.synthetic);
        coalesce(&mut batch, &mut index, synthetic);
        while let Ok(res) = self.rx.try_recv() {
            match res {
                Ok(event) => {
                    let changes: Vec<Change> = map_event(&event)
                        .into_iter()
                        .filter(|c| self.roots.iter().any(|r| r.contains(&c.path)))
                        .collect();
                    coalesce(&mut batch, &mut index, changes);
                }
                Err(e) => warn!("watch error: {e}"),
            }
        }
        batch
    }

    /// Wait for the next non-empty batch. Cancel-safe: undrained events stay queued.
    pub async fn next_batch(&mut self) -> ChangeBatch {
        loop {
            tokio::time::sleep(self.interval).await;
            self.rearm();
            let batch = self.drain();
            if !batch.is_empty() {
                return batch;
            }
        }
    }

    /// The watcher as an endless stream of batches.
    pub fn into_stream(self) -> impl Stream<Item = ChangeBatch> {
        futures::stream::unfold(self, |mut w| async move {
            let batch = w.next_batch().await;
            Some((batch, w))
        })
    }

    pub fn roots(&self) -> impl Iterator<Item = &Path> {
        self.roots.iter().map(WatchRoot::path)
    }
}
