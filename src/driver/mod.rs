//! # Driver abstraction
//!
//! The [Driver] is built once at startup and is the only thing the protocol
//! handlers talk to. It bundles the execution [Engine], the resolved tool
//! paths and one networking [Backend].
//!
//! ## Design
//!
//! Three backends exist, all sharing a [BaseDriver]:
//!
//! - [simple::SimpleDriver] only reads the virtual networks
//! - [advanced::AdvancedDriver] edits the hypervisor networking files
//! - [vmrest::VmrestDriver] answers networking calls through the vmrest
//!   daemon and forwards everything else to its fallback
//!
//! `simple` and `advanced` can be requested by name. Otherwise the best
//! tool-only backend is picked and an upgrade to the daemon is attempted
//! when the license allows it.
//!
//! ## Failures
//!
//! Failing to start the daemon keeps the fallback. A backend failing its
//! validation does not abort startup either, the driver is returned and
//! every request reports the validation error.
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use async_trait::async_trait;
use tracing::{debug, error, info, instrument, warn};
use vmrest_models::models::Network;

use crate::{
    api::VmwareApi,
    builder::{BuilderError, Configuration, VmwarePaths},
    engine::{local::LocalApi, Engine, Mode},
    lifecycle::Lifecycle,
    platform,
    settings::NAT_SETTINGS_FILE,
    status::{Result, Status},
    vmrest::{RestClient, Vmrest, VmrestConfig, VmrestError},
};

use self::{
    advanced::AdvancedDriver, networking::NetworkingFile, portfwd::PortFwdReconciler,
    simple::SimpleDriver, vmrest::VmrestDriver,
};

pub mod advanced;
pub mod nat;
pub mod networking;
pub mod portfwd;
pub mod simple;
pub mod vmrest;

/// File holding the daemon bootstrap credentials, in the settings directory
pub const CREDENTIALS_FILE: &str = "desktop-utility.cfg";

/// A virtual network device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Vmnet {
    /// `vmnet<n>`, generated when empty on creation
    pub name: String,
    /// bridged, nat or hostOnly
    pub kind: String,
    pub dhcp: bool,
    pub subnet: String,
    pub mask: String,
}

impl From<Network> for Vmnet {
    fn from(network: Network) -> Vmnet {
        Vmnet {
            name: network.name,
            kind: network.r#type,
            dhcp: network.dhcp.eq_ignore_ascii_case("true"),
            subnet: network.subnet,
            mask: network.mask,
        }
    }
}

impl From<Vmnet> for Network {
    fn from(vmnet: Vmnet) -> Network {
        Network {
            name: vmnet.name,
            r#type: vmnet.kind,
            dhcp: vmnet.dhcp.to_string(),
            subnet: vmnet.subnet,
            mask: vmnet.mask,
        }
    }
}

/// A port forward as configured in a backend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortFwd {
    /// Host port
    pub port: u16,
    /// `tcp` or `udp`
    pub protocol: String,
    /// Tagged with the owning descriptor path, see [portfwd::PORTFWD_PREFIX]
    pub description: String,
    /// Slot of the NAT device, 0 to use the first NAT device found
    pub slot_number: u32,
    pub guest_ip: String,
    pub guest_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum License {
    Standard,
    Professional,
}

impl FromStr for License {
    type Err = DriverError;

    fn from_str(value: &str) -> std::result::Result<License, DriverError> {
        match value.trim().to_lowercase().as_str() {
            "standard" => Ok(License::Standard),
            "professional" | "pro" => Ok(License::Professional),
            other => Err(DriverError::License(other.to_string())),
        }
    }
}

impl fmt::Display for License {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            License::Standard => f.write_str("standard"),
            License::Professional => f.write_str("professional"),
        }
    }
}

/// Product information printed by the hypervisor with `-v`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmwareInfo {
    pub product: String,
    pub version: String,
    pub build: String,
    pub license: License,
}

impl VmwareInfo {
    /// Parse `VMware Workstation 17.0.2 build-21581411`
    pub fn parse(output: &str) -> Option<VmwareInfo> {
        output.lines().find_map(|line| {
            let start = line.find("VMware")?;
            let words: Vec<&str> = line[start..].split_whitespace().collect();
            let build_at = words.iter().position(|w| w.starts_with("build-"))?;
            if build_at < 2 {
                return None;
            }
            let product = words[..build_at - 1].join(" ");
            let license = if product.contains("Player") || product == "VMware Fusion" {
                License::Standard
            } else {
                License::Professional
            };
            Some(VmwareInfo {
                version: words[build_at - 1].to_string(),
                build: words[build_at].trim_start_matches("build-").to_string(),
                product,
                license,
            })
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("failed to resolve VMware paths: {0:?}")]
    Paths(BuilderError),
    #[error("unknown license {0}, expected standard or professional")]
    License(String),
    #[error("failed to start vmrest: {0}")]
    Vmrest(#[from] VmrestError),
}

impl From<BuilderError> for DriverError {
    fn from(e: BuilderError) -> DriverError {
        DriverError::Paths(e)
    }
}

/// Fields shared by every backend
#[derive(Debug)]
pub struct BaseDriver {
    paths: VmwarePaths,
    info: Option<VmwareInfo>,
    license: License,
    settings_dir: PathBuf,
}

impl BaseDriver {
    pub async fn new(config: &Configuration, paths: VmwarePaths) -> Result<BaseDriver, DriverError> {
        let info = Self::detect_info(&paths).await;
        let license = match &config.license_override {
            Some(value) => value.parse()?,
            None => info
                .as_ref()
                .map(|info| info.license)
                .unwrap_or(License::Standard),
        };
        debug!("Using {} license", license);
        Ok(BaseDriver {
            paths,
            info,
            license,
            settings_dir: config.settings_dir(),
        })
    }

    async fn detect_info(paths: &VmwarePaths) -> Option<VmwareInfo> {
        match paths.product_tool().run(&["-v"]).await {
            Ok(output) => {
                let info = VmwareInfo::parse(&output.text());
                if info.is_none() {
                    warn!("Unexpected VMware version output: {}", output.text());
                }
                info
            }
            Err(e) => {
                warn!("Failed to read VMware information: {}", e);
                None
            }
        }
    }

    pub fn paths(&self) -> &VmwarePaths {
        &self.paths
    }

    pub fn info(&self) -> Option<&VmwareInfo> {
        self.info.as_ref()
    }

    pub fn license(&self) -> License {
        self.license
    }

    pub fn nat_store_path(&self) -> PathBuf {
        self.settings_dir.join(NAT_SETTINGS_FILE)
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.settings_dir.join(CREDENTIALS_FILE)
    }

    /// Virtual networks listed in the networking file
    pub fn file_vmnets(&self) -> Result<Vec<Vmnet>> {
        Ok(NetworkingFile::load(&self.paths.networking)?.vmnets())
    }

    /// `vmrun` must at least be there
    pub fn validate_tools(&self) -> Result<()> {
        if !self.paths.vmrun.is_file() {
            return Err(Status::failed_precondition(format!(
                "vmrun not found at {}",
                self.paths.vmrun.display()
            )));
        }
        Ok(())
    }
}

/// Networking primitives every backend implements
#[async_trait]
pub trait Networking: Send + Sync {
    fn name(&self) -> &'static str;

    async fn vmnets(&self) -> Result<Vec<Vmnet>>;

    async fn add_vmnet(&self, vmnet: &Vmnet) -> Result<Vmnet>;

    async fn update_vmnet(&self, vmnet: &Vmnet) -> Result<()>;

    async fn delete_vmnet(&self, name: &str) -> Result<()>;

    /// Forwards of the NAT device in `slot_number`
    async fn port_fwds(&self, slot_number: u32) -> Result<Vec<PortFwd>>;

    async fn add_port_fwd(&self, forwards: &[PortFwd]) -> Result<()>;

    async fn delete_port_fwd(&self, forwards: &[PortFwd]) -> Result<()>;

    async fn reserve_dhcp_address(&self, slot_number: u32, mac: &str, ip: &str) -> Result<()>;

    async fn validate(&self) -> Result<()>;
}

#[derive(Debug)]
pub enum Backend {
    Simple(SimpleDriver),
    Advanced(AdvancedDriver),
    Vmrest(VmrestDriver),
}

impl Backend {
    fn inner(&self) -> &dyn Networking {
        match self {
            Backend::Simple(driver) => driver,
            Backend::Advanced(driver) => driver,
            Backend::Vmrest(driver) => driver,
        }
    }

    /// The daemon API when the backend is daemon accelerated
    pub fn vmrest_api(&self) -> Option<Arc<RestClient>> {
        match self {
            Backend::Vmrest(driver) => Some(driver.api().clone()),
            _ => None,
        }
    }
}

#[async_trait]
impl Networking for Backend {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    async fn vmnets(&self) -> Result<Vec<Vmnet>> {
        self.inner().vmnets().await
    }

    async fn add_vmnet(&self, vmnet: &Vmnet) -> Result<Vmnet> {
        self.inner().add_vmnet(vmnet).await
    }

    async fn update_vmnet(&self, vmnet: &Vmnet) -> Result<()> {
        self.inner().update_vmnet(vmnet).await
    }

    async fn delete_vmnet(&self, name: &str) -> Result<()> {
        self.inner().delete_vmnet(name).await
    }

    async fn port_fwds(&self, slot_number: u32) -> Result<Vec<PortFwd>> {
        self.inner().port_fwds(slot_number).await
    }

    async fn add_port_fwd(&self, forwards: &[PortFwd]) -> Result<()> {
        self.inner().add_port_fwd(forwards).await
    }

    async fn delete_port_fwd(&self, forwards: &[PortFwd]) -> Result<()> {
        self.inner().delete_port_fwd(forwards).await
    }

    async fn reserve_dhcp_address(&self, slot_number: u32, mac: &str, ip: &str) -> Result<()> {
        self.inner().reserve_dhcp_address(slot_number, mac, ip).await
    }

    async fn validate(&self) -> Result<()> {
        self.inner().validate().await
    }
}

/// Capability set handed to the protocol handlers
#[derive(Debug)]
pub struct Driver {
    base: Arc<BaseDriver>,
    backend: Backend,
    engine: Engine,
    reconciler: PortFwdReconciler,
    /// Reason of the validation failure, reported on every request
    invalid: Option<Status>,
}

impl Driver {
    /// Resolve paths, select a backend and build the engine
    #[instrument(skip_all, fields(driver = %config.driver))]
    pub async fn new(lifecycle: &Lifecycle, config: Configuration) -> Result<Driver, DriverError> {
        let paths = config.resolve_paths()?;
        let base = Arc::new(BaseDriver::new(&config, paths).await?);
        let daemon_networking = platform::requires_daemon_networking().await;

        let backend = match config.driver.as_str() {
            "simple" => Backend::Simple(SimpleDriver::new(base.clone())),
            "advanced" => Backend::Advanced(AdvancedDriver::new(base.clone())),
            name => {
                if !name.is_empty() {
                    warn!("Unknown driver {}, selecting one automatically", name);
                }
                let fallback = default_backend(&base);
                upgrade(lifecycle, &config, &base, fallback, daemon_networking).await
            }
        };
        info!("Using {} driver", backend.name());

        let engine = build_engine(&config, &base, &backend);
        Ok(Driver::from_parts(base, backend, engine).await)
    }

    /// Assemble a driver and validate its backend
    pub async fn from_parts(base: Arc<BaseDriver>, backend: Backend, engine: Engine) -> Driver {
        let invalid = match backend.validate().await {
            Ok(()) => None,
            Err(e) => {
                error!("Driver validation failed: {}", e);
                Some(e)
            }
        };
        Driver {
            reconciler: PortFwdReconciler::new(base.nat_store_path()),
            base,
            backend,
            engine,
            invalid,
        }
    }

    fn check_valid(&self) -> Result<()> {
        match &self.invalid {
            Some(status) => Err(Status::failed_precondition(format!(
                "driver is invalid: {}",
                status.reason()
            ))),
            None => Ok(()),
        }
    }

    pub fn get_driver(&self) -> &Backend {
        &self.backend
    }

    /// The execution engine, unavailable when validation failed
    pub fn vmrun(&self) -> Result<&Engine> {
        self.check_valid()?;
        Ok(&self.engine)
    }

    pub fn vmware_paths(&self) -> &VmwarePaths {
        self.base.paths()
    }

    pub fn base(&self) -> &BaseDriver {
        &self.base
    }

    pub fn validation_error(&self) -> Option<&Status> {
        self.invalid.as_ref()
    }

    pub async fn validate(&self) -> Result<()> {
        self.backend.validate().await
    }

    pub async fn vmnets(&self) -> Result<Vec<Vmnet>> {
        self.check_valid()?;
        self.backend.vmnets().await
    }

    #[instrument(skip(self))]
    pub async fn add_vmnet(&self, vmnet: &Vmnet) -> Result<Vmnet> {
        self.check_valid()?;
        self.backend.add_vmnet(vmnet).await
    }

    #[instrument(skip(self))]
    pub async fn update_vmnet(&self, vmnet: &Vmnet) -> Result<()> {
        self.check_valid()?;
        self.backend.update_vmnet(vmnet).await
    }

    #[instrument(skip(self))]
    pub async fn delete_vmnet(&self, name: &str) -> Result<()> {
        self.check_valid()?;
        self.backend.delete_vmnet(name).await
    }

    /// Live forwards with their persisted descriptions
    pub async fn port_fwds(&self, slot_number: Option<u32>) -> Result<Vec<PortFwd>> {
        self.check_valid()?;
        self.reconciler.port_fwds(&self.backend, slot_number).await
    }

    #[instrument(skip(self, forwards))]
    pub async fn add_port_fwd(&self, forwards: Vec<PortFwd>) -> Result<()> {
        self.check_valid()?;
        self.reconciler
            .add_port_fwd(&self.backend, &self.engine, forwards)
            .await
    }

    #[instrument(skip(self, forwards))]
    pub async fn delete_port_fwd(&self, forwards: Vec<PortFwd>) -> Result<()> {
        self.check_valid()?;
        self.reconciler
            .delete_port_fwd(&self.backend, &self.engine, forwards)
            .await
    }

    #[instrument(skip(self))]
    pub async fn reserve_dhcp_address(&self, slot_number: u32, mac: &str, ip: &str) -> Result<()> {
        self.check_valid()?;
        self.backend.reserve_dhcp_address(slot_number, mac, ip).await
    }
}

/// `advanced` when the networking files can be managed, `simple` otherwise
fn default_backend(base: &Arc<BaseDriver>) -> Backend {
    let paths = base.paths();
    if is_writable(&paths.networking) && paths.network_helper.is_file() {
        Backend::Advanced(AdvancedDriver::new(base.clone()))
    } else {
        debug!(
            "{} is not writable or {} is missing",
            paths.networking.display(),
            paths.network_helper.display()
        );
        Backend::Simple(SimpleDriver::new(base.clone()))
    }
}

fn is_writable(path: &Path) -> bool {
    fs::OpenOptions::new().append(true).open(path).is_ok()
}

/// Wrap `fallback` with the daemon when the license allows it
async fn upgrade(
    lifecycle: &Lifecycle,
    config: &Configuration,
    base: &Arc<BaseDriver>,
    fallback: Backend,
    daemon_networking: bool,
) -> Backend {
    if base.info().is_none() {
        warn!("VMware information unavailable, keeping {} driver", fallback.name());
        return fallback;
    }
    if base.license() == License::Standard && !daemon_networking {
        info!("Standard license, vmrest networking is not available");
        return fallback;
    }

    let vmrest_config = VmrestConfig::new(base.paths().vmrest.clone(), base.credentials_path())
        .with_external_url(config.vmrest_url.clone())
        .with_keepalive(config.keepalive);
    match Vmrest::start(lifecycle, vmrest_config).await {
        Ok(vmrest) => {
            let client = RestClient::new(Arc::new(vmrest)).with_timeout(config.timeout);
            Backend::Vmrest(VmrestDriver::new(
                Arc::new(client),
                fallback,
                daemon_networking,
            ))
        }
        Err(e) => {
            warn!("Failed to start vmrest, keeping {} driver: {}", fallback.name(), e);
            fallback
        }
    }
}

fn build_engine(config: &Configuration, base: &BaseDriver, backend: &Backend) -> Engine {
    let paths = base.paths();
    let vm_folder = config.vm_folder();
    let (api, mode): (Arc<dyn VmwareApi>, Mode) = match backend.vmrest_api() {
        Some(client) if config.clone_with_vmrun => (client as Arc<dyn VmwareApi>, Mode::Clone),
        Some(client) => (client as Arc<dyn VmwareApi>, Mode::Rest),
        None => {
            let local = LocalApi::new(vm_folder.clone())
                .with_networking_file(Some(paths.networking.clone()));
            (Arc::new(local) as Arc<dyn VmwareApi>, Mode::Clone)
        }
    };
    debug!("Engine uses {:?} mode", mode);
    Engine::new(
        api,
        paths.vmrun_tool(),
        paths.vdiskmanager_tool(),
        vm_folder,
        mode,
    )
}
