use std::{
    env::var_os,
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

use crate::{
    builder::{Builder, BuilderError},
    platform,
    process::Tool,
};

use super::assert_not_none;

/// Environment variable pointing to the hypervisor installation directory
pub const LOCATION_VARIABLE: &str = "VMWARE_LOCATION";

/// Resolved locations of the hypervisor tools and configuration files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmwarePaths {
    pub install_dir: PathBuf,
    pub vmrun: PathBuf,
    pub vdiskmanager: PathBuf,
    pub vmrest: PathBuf,
    pub network_helper: PathBuf,
    /// Binary printing the product and license with `-v`
    pub product: PathBuf,
    /// The `networking` file listing the virtual networks
    pub networking: PathBuf,
    /// Directory holding the per-vmnet NAT and DHCP configuration
    pub vmnet_dir: PathBuf,
}

impl VmwarePaths {
    /// `vmrun` with the host type always passed first
    pub fn vmrun_tool(&self) -> Tool {
        Tool::new("vmrun", &self.vmrun).with_leading_args(["-T", platform::vmrun_host_type()])
    }

    pub fn vdiskmanager_tool(&self) -> Tool {
        Tool::new("vmware-vdiskmanager", &self.vdiskmanager)
    }

    pub fn network_helper_tool(&self) -> Tool {
        Tool::new(platform::network_helper(), &self.network_helper)
    }

    pub fn product_tool(&self) -> Tool {
        Tool::new(platform::product_binary(), &self.product)
    }

    /// NAT configuration of `device`, e.g. `vmnet8`
    pub fn nat_conf(&self, device: &str) -> PathBuf {
        if platform::is_macos() {
            self.vmnet_dir.join(device).join("nat.conf")
        } else if cfg!(windows) {
            self.vmnet_dir.join("vmnetnat.conf")
        } else {
            self.vmnet_dir.join(device).join("nat").join("nat.conf")
        }
    }

    /// DHCP server configuration of `device`
    pub fn dhcpd_conf(&self, device: &str) -> PathBuf {
        if platform::is_macos() {
            self.vmnet_dir.join(device).join("dhcpd.conf")
        } else if cfg!(windows) {
            self.vmnet_dir.join("vmnetdhcp.conf")
        } else {
            self.vmnet_dir.join(device).join("dhcpd").join("dhcpd.conf")
        }
    }
}

#[derive(Debug, Default)]
pub struct VmwarePathsBuilder {
    install_dir: Option<PathBuf>,
    vmrun: Option<PathBuf>,
    vdiskmanager: Option<PathBuf>,
    vmrest: Option<PathBuf>,
    network_helper: Option<PathBuf>,
    product: Option<PathBuf>,
    networking: Option<PathBuf>,
    vmnet_dir: Option<PathBuf>,
}

impl VmwarePathsBuilder {
    pub fn new() -> VmwarePathsBuilder {
        VmwarePathsBuilder::default()
    }

    /// Tries to read the installation directory from `VMWARE_LOCATION`
    fn find_install_dir_from_env_location() -> Option<PathBuf> {
        if let Some(path) = var_os(LOCATION_VARIABLE) {
            let path = PathBuf::from(path);
            if path.is_dir() {
                return Some(path);
            }
            warn!(
                "{} is set but the directory does not exist: {:?}",
                LOCATION_VARIABLE, path
            );
        }
        None
    }

    /// Tries to find `vmrun` in the `$PATH` variable and returns its directory
    fn find_install_dir_from_path() -> Option<PathBuf> {
        which::which(platform::executable("vmrun"))
            .ok()
            .and_then(|binary| binary.parent().map(Path::to_path_buf))
    }

    /// Installation directory, based on multiple sources (top to bottom
    /// priority).
    ///
    /// - `VMWARE_LOCATION` environment variable
    /// - directory containing `vmrun` in `$PATH`
    /// - the platform default location
    pub fn determine_install_dir() -> PathBuf {
        Self::find_install_dir_from_env_location()
            .or_else(Self::find_install_dir_from_path)
            .unwrap_or_else(platform::default_install_dir)
    }

    /// Every path derived from the detected installation directory
    pub fn auto() -> VmwarePathsBuilder {
        let install_dir = Self::determine_install_dir();
        debug!("Using VMware installation in {}", install_dir.display());
        Self::new().with_install_dir(install_dir)
    }

    /// Set the installation directory and derive every binary from it.
    /// Paths set afterwards take precedence.
    pub fn with_install_dir(mut self, dir: PathBuf) -> VmwarePathsBuilder {
        let binary = |name: &str| dir.join(platform::executable(name));
        self.vmrun = Some(binary("vmrun"));
        self.vdiskmanager = Some(binary("vmware-vdiskmanager"));
        self.vmrest = Some(binary("vmrest"));
        self.network_helper = Some(binary(platform::network_helper()));
        self.product = Some(binary(platform::product_binary()));
        self.install_dir = Some(dir);
        self
    }

    pub fn with_vmrun(mut self, path: PathBuf) -> VmwarePathsBuilder {
        self.vmrun = Some(path);
        self
    }

    pub fn with_vdiskmanager(mut self, path: PathBuf) -> VmwarePathsBuilder {
        self.vdiskmanager = Some(path);
        self
    }

    pub fn with_vmrest(mut self, path: PathBuf) -> VmwarePathsBuilder {
        self.vmrest = Some(path);
        self
    }

    pub fn with_network_helper(mut self, path: PathBuf) -> VmwarePathsBuilder {
        self.network_helper = Some(path);
        self
    }

    pub fn with_product(mut self, path: PathBuf) -> VmwarePathsBuilder {
        self.product = Some(path);
        self
    }

    pub fn with_networking(mut self, path: PathBuf) -> VmwarePathsBuilder {
        self.networking = Some(path);
        self
    }

    pub fn with_vmnet_dir(mut self, dir: PathBuf) -> VmwarePathsBuilder {
        self.vmnet_dir = Some(dir);
        self
    }
}

impl Builder<VmwarePaths> for VmwarePathsBuilder {
    fn try_build(self) -> Result<VmwarePaths, BuilderError> {
        assert_not_none(stringify!(self.vmrun), &self.vmrun)?;
        assert_not_none(stringify!(self.vdiskmanager), &self.vdiskmanager)?;
        let vmrun = self.vmrun.unwrap_or_default();
        let vdiskmanager = self.vdiskmanager.unwrap_or_default();
        for binary in [&vmrun, &vdiskmanager] {
            if !binary.is_file() {
                return Err(BuilderError::BinaryNotFound(format!(
                    "{} does not exist, check if {} environment variable is correctly set",
                    binary.display(),
                    LOCATION_VARIABLE
                )));
            }
        }

        let install_dir = self
            .install_dir
            .or_else(|| vmrun.parent().map(Path::to_path_buf))
            .unwrap_or_else(platform::default_install_dir);
        let in_install_dir = |name: &str| install_dir.join(platform::executable(name));
        let vmnet_dir = self.vmnet_dir.unwrap_or_else(platform::default_vmnet_dir);
        Ok(VmwarePaths {
            vmrest: self.vmrest.unwrap_or_else(|| in_install_dir("vmrest")),
            network_helper: self
                .network_helper
                .unwrap_or_else(|| in_install_dir(platform::network_helper())),
            product: self
                .product
                .unwrap_or_else(|| in_install_dir(platform::product_binary())),
            networking: self
                .networking
                .unwrap_or_else(|| vmnet_dir.join("networking")),
            vmnet_dir,
            install_dir,
            vmrun,
            vdiskmanager,
        })
    }
}
