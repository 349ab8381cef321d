//! Named connection profiles for the viewer. Each profile remembers a daemon
//! URL and, optionally, the agent to ask about on connect. The file lives at
//! `$XDG_CONFIG_HOME/officesync/profiles.json`, falling back to the platform
//! config directory.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use url::Url;

const APP_DIR: &str = "officesync";
const PROFILES_FILE: &str = "profiles.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProfileEntry {
    pub url: String,
    /// Agent to request status for on connect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProfilesFile {
    #[serde(default)]
    pub profiles: BTreeMap<String, ProfileEntry>,
    #[serde(default)]
    pub version: u32,
}

impl ProfilesFile {
    /// Default location of the profiles file, if a config directory exists.
    pub fn location() -> Option<PathBuf> {
        std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(dirs_next::config_dir)
            .map(|dir| dir.join(APP_DIR).join(PROFILES_FILE))
    }

    /// A missing file is an empty set of profiles; a malformed one is an error.
    pub fn read_from(path: &Path) -> io::Result<Self> {
        match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    /// Replace the file at `path` in one step, creating its directory.
    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, path).inspect_err(|_| {
            let _ = fs::remove_file(&tmp);
        })
    }

    /// Profiles from the default location. Problems are reported and an
    /// empty set is used instead.
    pub fn load() -> Self {
        let Some(path) = Self::location() else {
            return Self::default();
        };
        Self::read_from(&path).unwrap_or_else(|e| {
            eprintln!("ignoring profiles in {}: {e}", path.display());
            Self::default()
        })
    }

    pub fn save(&self) -> io::Result<()> {
        let path = Self::location()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no config directory"))?;
        self.write_to(&path)
    }
}

/// Accept only ws:// and wss:// URLs with a host.
pub fn validate_url(raw: &str) -> Result<Url, String> {
    let url = Url::parse(raw.trim()).map_err(|e| format!("invalid URL {raw:?}: {e}"))?;
    match url.scheme() {
        "ws" | "wss" if url.host_str().is_some() => Ok(url),
        "ws" | "wss" => Err(format!("URL {raw:?} has no host")),
        other => Err(format!("unsupported scheme {other:?}; expected ws or wss")),
    }
}

#[derive(Debug, PartialEq)]
pub enum ResolveProfile {
    /// Use the provided runtime inputs (not persisted). (url, agent)
    Direct(String, Option<String>),
    /// Loaded from existing profile entry (url, agent)
    Loaded(String, Option<String>),
    /// Should prompt user to select among profile names
    PromptSelect(Vec<String>),
    /// Should prompt user to create a new profile (name)
    PromptCreate(String),
    /// No profile could be resolved (e.g., missing arguments)
    None,
}

pub struct ProfileRequest {
    pub profile_name: Option<String>,
    pub url: Option<String>,
    pub agent: Option<String>,
}

impl ProfileRequest {
    pub fn resolve(self, pf: &ProfilesFile) -> ResolveProfile {
        match (self.url, self.profile_name) {
            // URL given -> direct (maybe later saved by caller)
            (Some(u), _) => ResolveProfile::Direct(u, self.agent),
            // Only profile name given -> try load; a CLI agent overrides the stored one
            (None, Some(name)) => match pf.profiles.get(&name) {
                Some(entry) => {
                    ResolveProfile::Loaded(entry.url.clone(), self.agent.or(entry.agent.clone()))
                }
                None => ResolveProfile::PromptCreate(name),
            },
            (None, None) if pf.profiles.is_empty() => ResolveProfile::None,
            (None, None) => ResolveProfile::PromptSelect(pf.profiles.keys().cloned().collect()),
        }
    }
}
