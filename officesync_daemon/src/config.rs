//! Daemon configuration: environment first, then command-line flags.
//!
//! Recognized options are deliberately few: workspace root, the two listening
//! ports, collection interval, backup interval and retention window.

use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_WS_PORT: u16 = 8765;
pub const DEFAULT_HTTP_PORT: u16 = 8080;
pub const DEFAULT_COLLECT_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_BACKUP_INTERVAL: Duration = Duration::from_secs(6 * 3600);
pub const DEFAULT_RETENTION_DAYS: u32 = 7;

pub const USAGE: &str = "Usage: officesync_daemon [--workspace DIR|-w DIR] [--port PORT|-p PORT] \
[--http-port PORT] [--collect-interval SECS] [--backup-interval HOURS] [--retention-days DAYS]";

#[derive(Debug, Clone)]
pub struct Config {
    pub workspace_root: PathBuf,
    pub ws_port: u16,
    pub http_port: u16,
    pub collect_interval: Duration,
    pub backup_interval: Duration,
    pub retention_days: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace_root: default_workspace(),
            ws_port: DEFAULT_WS_PORT,
            http_port: DEFAULT_HTTP_PORT,
            collect_interval: DEFAULT_COLLECT_INTERVAL,
            backup_interval: DEFAULT_BACKUP_INTERVAL,
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

fn default_workspace() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".openclaw")
        .join("workspace")
}

/// What the command line asked for.
#[derive(Debug)]
pub enum CliAction {
    Run(Config),
    Help,
}

fn parse_value<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
        key,
        value: raw.to_string(),
    })
}

fn positive(key: &'static str, raw: &str) -> Result<u64, ConfigError> {
    match parse_value::<u64>(key, raw)? {
        0 => Err(ConfigError::InvalidValue {
            key,
            value: raw.to_string(),
        }),
        v => Ok(v),
    }
}

impl Config {
    /// Apply `OFFICESYNC_*` variables from `lookup` on top of the defaults.
    pub fn from_env_with<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Config::default();
        if let Some(v) = lookup("OFFICESYNC_WORKSPACE").filter(|v| !v.is_empty()) {
            cfg.workspace_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("OFFICESYNC_WS_PORT") {
            cfg.ws_port = parse_value("OFFICESYNC_WS_PORT", &v)?;
        }
        if let Some(v) = lookup("OFFICESYNC_HTTP_PORT") {
            cfg.http_port = parse_value("OFFICESYNC_HTTP_PORT", &v)?;
        }
        if let Some(v) = lookup("OFFICESYNC_COLLECT_INTERVAL_SECS") {
            cfg.collect_interval =
                Duration::from_secs(positive("OFFICESYNC_COLLECT_INTERVAL_SECS", &v)?);
        }
        if let Some(v) = lookup("OFFICESYNC_BACKUP_INTERVAL_HOURS") {
            cfg.backup_interval =
                Duration::from_secs(positive("OFFICESYNC_BACKUP_INTERVAL_HOURS", &v)? * 3600);
        }
        if let Some(v) = lookup("OFFICESYNC_RETENTION_DAYS") {
            cfg.retention_days = parse_value("OFFICESYNC_RETENTION_DAYS", &v)?;
        }
        Ok(cfg)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with(|k| std::env::var(k).ok())
    }

    /// Override `self` with flags. The first element of `args` is the program name.
    pub fn apply_args<I: IntoIterator<Item = String>>(
        mut self,
        args: I,
    ) -> Result<CliAction, ConfigError> {
        let mut it = args.into_iter();
        let _ = it.next(); // program name
        while let Some(arg) = it.next() {
            let (flag, inline) = match arg.split_once('=') {
                Some((f, v)) if f.starts_with("--") => (f.to_string(), Some(v.to_string())),
                _ => (arg.clone(), None),
            };
            let mut value = |key: &'static str| {
                inline
                    .clone()
                    .or_else(|| it.next())
                    .ok_or(ConfigError::InvalidValue {
                        key,
                        value: String::new(),
                    })
            };
            match flag.as_str() {
                "-h" | "--help" => return Ok(CliAction::Help),
                "--workspace" | "-w" => self.workspace_root = PathBuf::from(value("--workspace")?),
                "--port" | "-p" => self.ws_port = parse_value("--port", &value("--port")?)?,
                "--http-port" => {
                    self.http_port = parse_value("--http-port", &value("--http-port")?)?
                }
                "--collect-interval" => {
                    let v = value("--collect-interval")?;
                    self.collect_interval = Duration::from_secs(positive("--collect-interval", &v)?);
                }
                "--backup-interval" => {
                    let v = value("--backup-interval")?;
                    self.backup_interval =
                        Duration::from_secs(positive("--backup-interval", &v)? * 3600);
                }
                "--retention-days" => {
                    let v = value("--retention-days")?;
                    self.retention_days = parse_value("--retention-days", &v)?;
                }
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "argument",
                        value: arg,
                    })
                }
            }
        }
        Ok(CliAction::Run(self))
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }

    pub fn paths(&self) -> StatePaths {
        StatePaths::new(&self.workspace_root)
    }

    /// Refuse to start against a missing workspace or an unwritable backup/data dir.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.workspace_root.is_dir() {
            return Err(ConfigError::MissingWorkspace(self.workspace_root.clone()));
        }
        let paths = self.paths();
        probe_writable(&paths.backup_dir).map_err(|source| ConfigError::BackupDirUnwritable {
            path: paths.backup_dir.clone(),
            source,
        })?;
        let data_dir = paths
            .metrics_db
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| paths.mission_control.clone());
        probe_writable(&data_dir)
            .map_err(|source| ConfigError::DataDirUnwritable { path: data_dir, source })?;
        Ok(())
    }
}

fn probe_writable(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    let probe = dir.join(".write-probe");
    let mut f = fs::File::create(&probe)?;
    f.write_all(b"ok")?;
    drop(f);
    fs::remove_file(probe)
}

/// Where a path lives in the state store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathClass {
    AgentState(String),
    AgentFile(String),
    OfficeState,
    TaskQueue,
    Other,
}

/// Fixed layout of the state store under the workspace root.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub root: PathBuf,
    pub mission_control: PathBuf,
    pub agents_dir: PathBuf,
    pub office_state: PathBuf,
    pub task_queue: PathBuf,
    pub backup_dir: PathBuf,
    pub metrics_db: PathBuf,
    pub status_file: PathBuf,
}

pub const AGENT_STATE_FILE: &str = "state.json";

/// Backup sources, relative to the mission-control directory.
const BACKUP_SOURCES: &[&str] = &[
    "agents",
    "dashboard",
    "logs",
    "workflows",
    "TASK_QUEUE.md",
    "current_office_state.json",
];

impl StatePaths {
    pub fn new(root: &Path) -> Self {
        let mission_control = root.join("mission-control");
        Self {
            root: root.to_path_buf(),
            agents_dir: mission_control.join("agents"),
            office_state: mission_control.join("current_office_state.json"),
            task_queue: mission_control.join("TASK_QUEUE.md"),
            backup_dir: mission_control.join("backups"),
            metrics_db: mission_control.join("backend").join("data").join("metrics.db"),
            status_file: mission_control.join("backend").join("status.json"),
            mission_control,
        }
    }

    /// An agent id names exactly one directory entry under `agents/`.
    pub fn is_valid_agent_id(agent_id: &str) -> bool {
        let mut parts = Path::new(agent_id).components();
        matches!(
            (parts.next(), parts.next()),
            (Some(Component::Normal(name)), None) if name == agent_id
        )
    }

    pub fn agent_dir(&self, agent_id: &str) -> PathBuf {
        self.agents_dir.join(agent_id)
    }

    pub fn agent_state(&self, agent_id: &str) -> PathBuf {
        self.agent_dir(agent_id).join(AGENT_STATE_FILE)
    }

    pub fn backup_sources(&self) -> Vec<PathBuf> {
        BACKUP_SOURCES
            .iter()
            .map(|s| self.mission_control.join(s))
            .collect()
    }

    pub fn classify(&self, path: &Path) -> PathClass {
        if path == self.office_state {
            return PathClass::OfficeState;
        }
        if path == self.task_queue {
            return PathClass::TaskQueue;
        }
        let Ok(rel) = path.strip_prefix(&self.agents_dir) else {
            return PathClass::Other;
        };
        let mut parts = rel.components();
        let Some(agent) = parts.next().and_then(|c| c.as_os_str().to_str()) else {
            return PathClass::Other;
        };
        let rest: Vec<_> = parts.collect();
        match rest.as_slice() {
            [only] if only.as_os_str() == AGENT_STATE_FILE => {
                PathClass::AgentState(agent.to_string())
            }
            _ => PathClass::AgentFile(agent.to_string()),
        }
    }
}
