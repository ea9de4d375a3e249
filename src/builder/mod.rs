//! # Service configuration
//!
//! This module provides a builder pattern for everything the driver needs to
//! start: where the hypervisor is installed, which backend to use and how to
//! reach or spawn the vmrest daemon. Fields are optional and have defaults,
//! only the tool paths are validated through [`Builder::try_build`].
//!
//! ## Example
//!
//! ```rust
//! use std::{path::PathBuf, time::Duration};
//! use vmware_desktop_utility::builder::{Builder, Configuration, VmwarePathsBuilder};
//!
//! // Tool locations are usually detected, see [VmwarePathsBuilder::auto]
//! let paths = VmwarePathsBuilder::new()
//!     .with_vmrun(PathBuf::from("/usr/bin/vmrun"))
//!     .with_vdiskmanager(PathBuf::from("/usr/bin/vmware-vdiskmanager"))
//!     .try_build();
//!
//! let config = Configuration::new()
//!     .with_driver("advanced".to_string())
//!     .with_vm_folder(PathBuf::from("/srv/vms"))
//!     .with_keepalive(Duration::from_secs(60));
//! assert_eq!(config.driver, "advanced");
//! ```
use std::{path::PathBuf, time::Duration};

use url::Url;

use crate::{platform, vmrest};

pub mod paths;

pub use paths::{VmwarePaths, VmwarePathsBuilder};

/// Directory name used under the user configuration directory
pub const SETTINGS_DIR_NAME: &str = "vmware-desktop-utility";

/// Default timeout of a request to the vmrest daemon
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

fn assert_not_none<T>(key: &str, value: &Option<T>) -> Result<(), BuilderError> {
    match value {
        Some(_) => Ok(()),
        None => Err(BuilderError::MissingRequiredField(key.to_string())),
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum BuilderError {
    /// The field is required but was not provided in the builder object
    MissingRequiredField(String),
    /// Happens when a detected or provided hypervisor binary does not exist
    BinaryNotFound(String),
}

/// Generic trait which all builder components must implement
pub trait Builder<T> {
    /// Validate all the fields from the builder object and apply it to the
    /// final object
    fn try_build(self) -> Result<T, BuilderError>;
}

/// Everything needed to construct a [crate::driver::Driver]
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Backend name: empty for automatic selection, `simple` or `advanced`
    pub driver: String,
    /// `standard` or `professional`, replaces the detected license
    pub license_override: Option<String>,
    pub vm_folder: Option<PathBuf>,
    /// External vmrest endpoint, credentials given as `user:password@`
    pub vmrest_url: Option<Url>,
    pub timeout: Duration,
    /// Clone with vmrun even when the daemon is available
    pub clone_with_vmrun: bool,
    /// Holds the NAT store and the daemon bootstrap credentials
    pub settings_dir: Option<PathBuf>,
    /// Idle time after which the spawned daemon is stopped
    pub keepalive: Duration,
    /// Tool paths, detected when not provided
    pub paths: Option<VmwarePaths>,
}

impl Configuration {
    pub fn new() -> Configuration {
        Configuration {
            driver: String::new(),
            license_override: None,
            vm_folder: None,
            vmrest_url: None,
            timeout: DEFAULT_TIMEOUT,
            clone_with_vmrun: false,
            settings_dir: None,
            keepalive: vmrest::DEFAULT_KEEPALIVE,
            paths: None,
        }
    }

    pub fn with_driver(mut self, driver: String) -> Configuration {
        self.driver = driver;
        self
    }

    pub fn with_license_override(mut self, license: String) -> Configuration {
        self.license_override = Some(license);
        self
    }

    pub fn with_vm_folder(mut self, folder: PathBuf) -> Configuration {
        self.vm_folder = Some(folder);
        self
    }

    pub fn with_vmrest_url(mut self, url: Url) -> Configuration {
        self.vmrest_url = Some(url);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Configuration {
        self.timeout = timeout;
        self
    }

    pub fn clone_with_vmrun(mut self) -> Configuration {
        self.clone_with_vmrun = true;
        self
    }

    pub fn with_settings_dir(mut self, dir: PathBuf) -> Configuration {
        self.settings_dir = Some(dir);
        self
    }

    pub fn with_keepalive(mut self, keepalive: Duration) -> Configuration {
        self.keepalive = keepalive;
        self
    }

    pub fn with_paths(mut self, paths: VmwarePaths) -> Configuration {
        self.paths = Some(paths);
        self
    }

    pub fn vm_folder(&self) -> PathBuf {
        self.vm_folder
            .clone()
            .unwrap_or_else(platform::default_vm_folder)
    }

    pub fn settings_dir(&self) -> PathBuf {
        self.settings_dir
            .clone()
            .or_else(|| dirs::config_dir().map(|dir| dir.join(SETTINGS_DIR_NAME)))
            .unwrap_or_else(|| std::env::temp_dir().join(SETTINGS_DIR_NAME))
    }

    /// Configured paths, or the detected ones
    pub fn resolve_paths(&self) -> Result<VmwarePaths, BuilderError> {
        match &self.paths {
            Some(paths) => Ok(paths.clone()),
            None => VmwarePathsBuilder::auto().try_build(),
        }
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration::new()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use crate::builder::{assert_not_none, BuilderError, Configuration, SETTINGS_DIR_NAME};

    #[test]
    fn macro_assert_not_none() {
        let x = Some(1);
        let y: Option<String> = None;
        assert_eq!(assert_not_none("x", &x), Ok(()));
        assert_eq!(
            assert_not_none("y", &y),
            Err(BuilderError::MissingRequiredField("y".to_string()))
        );
    }

    struct TestStruct {
        #[allow(dead_code)]
        some_field: Option<String>,
    }

    #[test]
    fn stringify_from_struct() {
        let _str = TestStruct {
            some_field: Some("some value".to_string()),
        };
        assert_eq!(stringify!(_str.some_field), "_str.some_field");
    }

    #[test]
    fn configuration_defaults() {
        let config = Configuration::new();
        assert!(config.driver.is_empty());
        assert_eq!(config.timeout, super::DEFAULT_TIMEOUT);
        assert!(config.settings_dir().ends_with(SETTINGS_DIR_NAME));

        let config = config
            .with_settings_dir(PathBuf::from("/var/lib/utility"))
            .clone_with_vmrun();
        assert_eq!(config.settings_dir(), PathBuf::from("/var/lib/utility"));
        assert!(config.clone_with_vmrun);
    }
}
