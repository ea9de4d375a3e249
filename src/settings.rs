//! # Persisted NAT settings
//!
//! Port forwards are configured in the hypervisor (NAT configuration file or
//! vmrest daemon), which does not keep free-text descriptions reliably. The
//! store below survives restarts and carries those descriptions, the driver
//! reconciles it with what the backend reports.
//!
//! The store is a JSON file re-read and re-written on every change, writes go
//! through a temporary file renamed over the previous one.
use std::{
    fs, io,
    path::{Path, PathBuf},
};

use tracing::{debug, trace};

use crate::status::Status;

/// File name of the store inside the settings directory
pub const NAT_SETTINGS_FILE: &str = "nat.json";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file {0}: {1}")]
    Read(PathBuf, io::Error),
    #[error("failed to parse settings file {0}: {1}")]
    Parse(PathBuf, serde_json::Error),
    #[error("failed to write settings file {0}: {1}")]
    Write(PathBuf, io::Error),
    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl From<SettingsError> for Status {
    fn from(e: SettingsError) -> Status {
        Status::internal(e.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatGuest {
    pub ip: String,
    pub port: u16,
}

/// A port forward as persisted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatPortFwd {
    /// Host port
    pub port: u16,
    /// `tcp` or `udp`
    pub protocol: String,
    pub description: String,
    pub guest: NatGuest,
    /// Virtual network device, e.g. `vmnet8`
    pub device: String,
    pub slot_number: u32,
}

impl NatPortFwd {
    /// Same rule, descriptions aside
    pub fn same_rule(&self, other: &NatPortFwd) -> bool {
        self.port == other.port
            && self.protocol.eq_ignore_ascii_case(&other.protocol)
            && self.slot_number == other.slot_number
            && self.guest == other.guest
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct NatSettings {
    #[serde(default)]
    port_forwards: Vec<NatPortFwd>,
}

#[derive(Debug)]
pub struct NatStore {
    path: PathBuf,
    settings: NatSettings,
}

impl NatStore {
    /// Load the store, a missing file is an empty store
    pub fn load(path: &Path) -> Result<NatStore, SettingsError> {
        let settings = match fs::read_to_string(path) {
            Ok(content) if content.trim().is_empty() => NatSettings::default(),
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| SettingsError::Parse(path.to_path_buf(), e))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                trace!("No NAT settings in {}", path.display());
                NatSettings::default()
            }
            Err(e) => return Err(SettingsError::Read(path.to_path_buf(), e)),
        };
        Ok(NatStore {
            path: path.to_path_buf(),
            settings,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn port_forwards(&self) -> &[NatPortFwd] {
        &self.settings.port_forwards
    }

    /// Stored rule matching `rule`, descriptions aside
    pub fn find(&self, rule: &NatPortFwd) -> Option<&NatPortFwd> {
        self.settings.port_forwards.iter().find(|f| f.same_rule(rule))
    }

    /// Replace any stored copy of the rule with `rule`
    pub fn add(&mut self, rule: NatPortFwd) {
        self.remove(&rule);
        self.settings.port_forwards.push(rule);
    }

    pub fn remove(&mut self, rule: &NatPortFwd) -> bool {
        let before = self.settings.port_forwards.len();
        self.settings.port_forwards.retain(|f| !f.same_rule(rule));
        before != self.settings.port_forwards.len()
    }

    pub fn save(&self) -> Result<(), SettingsError> {
        let content = serde_json::to_string_pretty(&self.settings)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| SettingsError::Write(parent.to_path_buf(), e))?;
        }
        let temporary = self.path.with_extension("json.tmp");
        fs::write(&temporary, content)
            .and_then(|_| fs::rename(&temporary, &self.path))
            .map_err(|e| SettingsError::Write(self.path.clone(), e))?;
        debug!(
            "Stored {} port forwards in {}",
            self.settings.port_forwards.len(),
            self.path.display()
        );
        Ok(())
    }
}
