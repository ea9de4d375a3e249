//! # VMX descriptor codec
//!
//! A `.vmx` file is a flat list of `key = "value"` lines. Keys are case
//! insensitive for VMware but we keep the casing found in the file so that a
//! load/save cycle does not rewrite keys we never touched.
//!
//! ## Format
//!
//! - an optional `#!` header on the first line, kept as-is
//! - `.encoding` and comment lines are dropped on load, `.encoding = "UTF-8"`
//!   is always written back right after the header
//! - keys are written sorted, values always quoted
//!
//! ## Example
//!
//! ```rust
//! use vmware_desktop_utility::vmx::VmxMap;
//!
//! let mut vmx = VmxMap::parse("displayName = \"base\"\nnumvcpus = \"1\"\n");
//! vmx.set("NumVCPUs", "2");
//! assert_eq!(vmx.get("numvcpus"), Some("2"));
//! assert!(vmx.serialize().contains("numvcpus = \"2\""));
//! ```
use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
};

use tracing::{debug, trace};

use crate::status::Status;

/// Keys holding per-instance data which must not survive a clone
const TRANSIENT_KEYS: &[&str] = &[
    "instance-id",
    "hostname",
    "seedfrom",
    "public-keys",
    "user-data",
    "password",
    "vmxstats.filename",
];

#[derive(Debug, thiserror::Error)]
pub enum VmxError {
    #[error("failed to read VMX file {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("failed to write VMX file {0}: {1}")]
    Write(PathBuf, std::io::Error),
}

impl From<VmxError> for Status {
    fn from(e: VmxError) -> Status {
        Status::failed_precondition(e.to_string())
    }
}

/// In-memory representation of a descriptor file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmxMap {
    headline: Option<String>,
    /// Values indexed by the key as it was first written
    values: BTreeMap<String, String>,
    /// Lower-cased key to the key stored in `values`
    keys: HashMap<String, String>,
}

impl VmxMap {
    pub fn new() -> VmxMap {
        VmxMap::default()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<VmxMap, VmxError> {
        let path = path.as_ref();
        debug!("Loading VMX file {}", path.display());
        let content =
            fs::read_to_string(path).map_err(|e| VmxError::Read(path.to_path_buf(), e))?;
        Ok(VmxMap::parse(&content))
    }

    pub fn parse(content: &str) -> VmxMap {
        let mut vmx = VmxMap::new();
        for (i, line) in content.lines().enumerate() {
            let line = line.trim();
            if i == 0 && line.starts_with("#!") {
                vmx.headline = Some(line.to_string());
                continue;
            }
            if line.is_empty() || line.starts_with('#') || line.starts_with(".encoding") {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                trace!("Skipping malformed VMX line: {}", line);
                continue;
            };
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            vmx.set(key, value.trim().trim_matches('"'));
        }
        vmx
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), VmxError> {
        let path = path.as_ref();
        debug!("Saving VMX file {}", path.display());
        fs::write(path, self.serialize()).map_err(|e| VmxError::Write(path.to_path_buf(), e))
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        if let Some(headline) = &self.headline {
            out.push_str(headline);
            out.push('\n');
        }
        out.push_str(".encoding = \"UTF-8\"\n");
        for (key, value) in &self.values {
            out.push_str(&format!("{} = \"{}\"\n", key, value));
        }
        out
    }

    pub fn headline(&self) -> Option<&str> {
        self.headline.as_deref()
    }

    pub fn has(&self, key: &str) -> bool {
        self.keys.contains_key(&key.to_lowercase())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.keys
            .get(&key.to_lowercase())
            .and_then(|real| self.values.get(real))
            .map(String::as_str)
    }

    /// Value of a boolean key, VMware writes them as `TRUE`/`FALSE`
    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key).map(str_to_bool).unwrap_or(false)
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let lower = key.to_lowercase();
        let real = self
            .keys
            .entry(lower)
            .or_insert_with(|| key.to_string())
            .clone();
        self.values.insert(real, value.into());
    }

    pub fn delete(&mut self, key: &str) -> Option<String> {
        let real = self.keys.remove(&key.to_lowercase())?;
        self.values.remove(&real)
    }

    /// Keys in their original casing, sorted
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Remove every key with the given (case-insensitive) prefix
    pub fn delete_prefixed(&mut self, prefix: &str) {
        let prefix = prefix.to_lowercase();
        let matching: Vec<String> = self
            .keys
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        for key in matching {
            self.delete(&key);
        }
    }

    /// Strip per-instance data from a freshly cloned descriptor. Guest infos
    /// are always removed, ethernet cards only when `remove_cards` is set.
    pub fn cleanup(&mut self, remove_cards: bool) {
        for key in TRANSIENT_KEYS {
            self.delete(key);
        }
        if remove_cards {
            self.delete_prefixed("ethernet");
        }
        self.delete_prefixed("guestinfo");
    }
}

pub fn str_to_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "true" | "yes" | "1" | "on"
    )
}

pub fn bool_to_str(value: bool) -> &'static str {
    if value {
        "TRUE"
    } else {
        "FALSE"
    }
}
