//! # Execution engine
//!
//! The engine is the only component touching virtual machine state. It
//! drives `vmrun`, the disk tool and a [VmwareApi] backend, and keeps an
//! in-memory cache of what it knows about each VM.
//!
//! ## Design
//!
//! Two ways of creating virtual machines exist and one is picked when the
//! engine is built:
//!
//! - [Mode::Clone] clones the template descriptor with `vmrun clone`
//! - [Mode::Rest] asks the vmrest daemon to clone the template
//!
//! Whatever the mode, the freshly cloned descriptor is then edited in place
//! (cpu, memory, guest infos, ethernet cards), its primary disk expanded
//! and, in clone mode only, registered with the daemon.
//!
//! ## Cache
//!
//! Every operation goes through a single engine-wide lock guarding the
//! [cache::VmCache]. A cache hit is revalidated before being used: the
//! descriptor must still exist and the backend must still know the uuid,
//! otherwise the entry is evicted. The power state, and the tools state of
//! a powered VM, are then queried again. A miss triggers a full
//! enumeration.
//!
//! Power operations update the cached power flag optimistically once the
//! tool reported success.
use std::{
    collections::{BTreeMap, HashSet},
    ffi::OsStr,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, trace, warn};
use vmrest_models::models::{NicDeviceParameter, VmCloneParameter, VmRegisterParameter};

use crate::{
    api::VmwareApi,
    driver::Vmnet,
    platform,
    process::Tool,
    status::{Code, Result, Status},
    vmx::{bool_to_str, VmxMap},
};

use self::cache::VmCache;

pub mod cache;
pub mod local;
pub mod network;
mod poll;

pub const IP_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const TOOLS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Descriptor key holding the VM name
const NAME_KEY: &str = "vmname";
const AUTOSTART_KEY: &str = "autostart";

/// `vmrun getGuestIPAddress` answers meaning the guest is not ready yet
const IP_NOT_READY: [&str; 3] = [
    "Error: Unable to get the IP address",
    "Error: Cannot open VM:",
    "Error: The VMware Tools are not running in the virtual machine",
];

/// Disk adapters looked up for the primary disk, by priority
const DISK_ADAPTERS: [&str; 3] = ["nvme0:0", "scsi0:0", "sata0:0"];

/// Disk tool answer when the disk is already as large as requested
const DISK_NOT_GROWN: &str = "One of the parameters supplied is invalid";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Clone,
    Rest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerOffMode {
    Hard,
    Soft,
}

impl PowerOffMode {
    fn as_str(&self) -> &'static str {
        match self {
            PowerOffMode::Hard => "hard",
            PowerOffMode::Soft => "soft",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolsStatus {
    #[default]
    NotRunning,
    Installed,
    Running,
}

impl ToolsStatus {
    /// Interpret the output of `vmrun checkToolsState`
    pub fn from_output(output: &str) -> ToolsStatus {
        let output = output.trim().to_lowercase();
        if output.starts_with("running") {
            ToolsStatus::Running
        } else if output.starts_with("installed") {
            ToolsStatus::Installed
        } else {
            ToolsStatus::NotRunning
        }
    }
}

/// Identity and last known metadata of a virtual machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VirtualMachine {
    pub uuid: String,
    /// Path to the descriptor
    pub path: PathBuf,
    pub name: String,
    pub vcpus: u32,
    /// Memory in MB
    pub memory: u32,
    pub powered: bool,
    /// Last known IPv4 address
    pub address: Option<String>,
    pub tools_status: ToolsStatus,
}

/// Requested network card
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkInterface {
    /// Static MAC address, empty or `generated` to let VMware pick one
    pub mac_address: String,
    /// Virtual network name, required for `custom` connections
    pub vnet: String,
    /// bridged, nat, hostonly or custom
    pub connection_type: String,
    /// Device model, `e1000e` when empty
    pub device: String,
    pub bsd_name: String,
    pub display_name: String,
}

/// Network card as configured in the descriptor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EthernetCard {
    pub index: u32,
    pub present: bool,
    pub address_type: String,
    pub mac_address: String,
    pub mac_address_offset: i32,
    pub connection_type: String,
    pub virtual_dev: String,
    pub vnet: String,
    pub bsd_name: String,
    pub display_name: String,
    pub link_state_propagation: bool,
    pub pci_slot_number: i32,
    /// Bound IPv4 address, only known while the VM runs
    pub ip4_address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VirtualMachineStatus {
    pub powered: bool,
    pub ethernet_cards: Vec<EthernetCard>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateVirtualMachine {
    /// uuid of the template VM
    pub template: String,
    pub name: String,
    pub vcpus: u32,
    pub memory: u32,
    /// Target size of the primary disk, 0 keeps the template's
    pub disk_size_in_mb: u64,
    pub networks: Vec<NetworkInterface>,
    /// Written as `guestinfo.<key>`
    pub guest_infos: BTreeMap<String, String>,
    /// Linked clone, clone mode only
    pub linked: bool,
    /// Register the clone with the daemon, clone mode only
    pub register: bool,
}

/// Where a card request is applied
#[derive(Debug)]
enum CardTarget {
    /// Written in the descriptor by the engine
    Descriptor(NetworkInterface),
    /// Handed to the NIC API of the backend
    Api(NetworkInterface),
}

#[derive(Debug)]
pub struct Engine {
    api: Arc<dyn VmwareApi>,
    vmrun: Tool,
    vdiskmanager: Tool,
    vm_folder: PathBuf,
    mode: Mode,
    ip_interval: Duration,
    tools_interval: Duration,
    cache: Mutex<VmCache>,
}

impl Engine {
    pub fn new(
        api: Arc<dyn VmwareApi>,
        vmrun: Tool,
        vdiskmanager: Tool,
        vm_folder: PathBuf,
        mode: Mode,
    ) -> Engine {
        Engine {
            api,
            vmrun,
            vdiskmanager,
            vm_folder,
            mode,
            ip_interval: IP_POLL_INTERVAL,
            tools_interval: TOOLS_POLL_INTERVAL,
            cache: Mutex::new(VmCache::new()),
        }
    }

    pub fn with_poll_intervals(mut self, ip: Duration, tools: Duration) -> Engine {
        self.ip_interval = ip;
        self.tools_interval = tools;
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn api(&self) -> &Arc<dyn VmwareApi> {
        &self.api
    }

    pub fn vm_folder(&self) -> &Path {
        &self.vm_folder
    }

    /// Clone `request.template` into a new virtual machine
    #[instrument(skip(self, request), fields(name = %request.name, template = %request.template))]
    pub async fn create(&self, request: CreateVirtualMachine) -> Result<VirtualMachine> {
        if request.name.is_empty() {
            return Err(Status::invalid_argument("a virtual machine name is required"));
        }
        if request.networks.len() > network::MAX_CARDS {
            return Err(Status::invalid_argument(format!(
                "too many network interfaces, at most {} are supported",
                network::MAX_CARDS
            )));
        }

        let mut cache = self.cache.lock().await;
        match self.lookup_name(&mut cache, &request.name).await {
            Ok(existing) => {
                return Err(Status::already_exists(format!(
                    "virtual machine {} already exists with uuid {}",
                    request.name, existing.uuid
                )))
            }
            Err(e) if e.code() == Code::NotFound => {}
            Err(e) => return Err(e),
        }
        let template = self
            .lookup_uuid(&mut cache, &request.template)
            .await
            .map_err(|e| match e.code() {
                Code::NotFound => {
                    Status::not_found(format!("template {} not found", request.template))
                }
                _ => e,
            })?;

        let path = match self.mode {
            Mode::Clone => self.clone_with_vmrun(&template, &request).await?,
            Mode::Rest => self.clone_with_api(&template, &request).await?,
        };
        debug!("Cloned {} into {}", template.name, path.display());

        let mut vmx = VmxMap::load(&path)?;
        prepare_descriptor(&mut vmx, &request)?;
        vmx.save(&path)?;

        if request.disk_size_in_mb > 0 {
            self.expand_disk(&path, &vmx, request.disk_size_in_mb).await?;
        }
        if self.mode == Mode::Clone && request.register {
            let registration = VmRegisterParameter::new(
                request.name.clone(),
                path.to_string_lossy().into_owned(),
            );
            self.api.register_vm(&registration).await?;
        }

        self.refresh_all(&mut cache).await?;
        let vm = cache.by_path(&path).cloned().ok_or_else(|| {
            Status::internal(format!(
                "virtual machine {} is unknown to the backend after creation",
                path.display()
            ))
        })?;
        info!("Created virtual machine {} ({})", vm.name, vm.uuid);
        Ok(vm)
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, uuid: &str) -> Result<()> {
        let mut cache = self.cache.lock().await;
        let vm = self.lookup_uuid(&mut cache, uuid).await?;
        if vm.powered {
            return Err(Status::failed_precondition(format!(
                "virtual machine {} is powered on",
                vm.name
            )));
        }
        match self.mode {
            Mode::Clone => {
                self.vmrun
                    .run_checked(&[OsStr::new("deleteVM"), vm.path.as_os_str()])
                    .await?;
            }
            Mode::Rest => self.api.delete_vm(uuid).await?,
        }
        cache.remove(uuid);
        info!("Deleted virtual machine {}", vm.name);
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn power_on(&self, uuid: &str) -> Result<()> {
        let mut cache = self.cache.lock().await;
        let vm = self.lookup_uuid(&mut cache, uuid).await?;
        if vm.powered {
            debug!("{} is already powered on", vm.name);
            return Ok(());
        }
        self.vmrun
            .run_checked(&[
                OsStr::new("start"),
                vm.path.as_os_str(),
                OsStr::new("nogui"),
            ])
            .await?;
        cache.update(uuid, |vm| vm.powered = true);
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn power_off(&self, uuid: &str, mode: PowerOffMode) -> Result<()> {
        let mut cache = self.cache.lock().await;
        let vm = self.lookup_uuid(&mut cache, uuid).await?;
        if !vm.powered {
            debug!("{} is already powered off", vm.name);
            return Ok(());
        }
        self.vmrun
            .run_checked(&[
                OsStr::new("stop"),
                vm.path.as_os_str(),
                OsStr::new(mode.as_str()),
            ])
            .await?;
        cache.update(uuid, |vm| {
            vm.powered = false;
            vm.address = None;
            vm.tools_status = ToolsStatus::NotRunning;
        });
        Ok(())
    }

    /// Ask the guest operating system to shut down
    pub async fn shutdown_guest(&self, uuid: &str) -> Result<()> {
        self.power_off(uuid, PowerOffMode::Soft).await
    }

    #[instrument(skip(self))]
    pub async fn power_state(&self, uuid: &str) -> Result<bool> {
        let mut cache = self.cache.lock().await;
        Ok(self.lookup_uuid(&mut cache, uuid).await?.powered)
    }

    /// Power state and ethernet cards, merged with the live IP stack when
    /// the backend can report it
    #[instrument(skip(self))]
    pub async fn status(&self, uuid: &str) -> Result<VirtualMachineStatus> {
        let mut cache = self.cache.lock().await;
        let vm = self.lookup_uuid(&mut cache, uuid).await?;
        let vmx = VmxMap::load(&vm.path)?;

        let stack = if vm.powered {
            match self.api.nic_ips(uuid).await {
                Ok(Some(all)) => all.nics,
                Ok(None) => Vec::new(),
                Err(e) => {
                    debug!("No IP stack for {}: {}", vm.name, e);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };
        Ok(VirtualMachineStatus {
            powered: vm.powered,
            ethernet_cards: network::read_cards(&vmx, &stack),
        })
    }

    /// Poll until the guest reports an IP address. A zero `timeout` waits
    /// forever.
    #[instrument(skip(self, cancel))]
    pub async fn wait_for_ip(
        &self,
        uuid: &str,
        timeout: Duration,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<String> {
        let vm = {
            let mut cache = self.cache.lock().await;
            self.lookup_uuid(&mut cache, uuid).await?
        };
        let engine = self;
        let target = &vm;
        let address = poll::poll_immediate(
            self.ip_interval,
            timeout,
            cancel,
            "guest IP address",
            move || engine.query_ip(target),
        )
        .await?;

        self.cache.lock().await.update(uuid, |vm| {
            vm.address = Some(address.clone());
            vm.tools_status = ToolsStatus::Running;
        });
        Ok(address)
    }

    /// Poll until the guest tools report running. A zero `timeout` waits
    /// forever.
    #[instrument(skip(self, cancel))]
    pub async fn wait_for_tools_running(
        &self,
        uuid: &str,
        timeout: Duration,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<()> {
        let vm = {
            let mut cache = self.cache.lock().await;
            self.lookup_uuid(&mut cache, uuid).await?
        };
        let engine = self;
        let path = vm.path.as_path();
        poll::poll_immediate(
            self.tools_interval,
            timeout,
            cancel,
            "guest tools",
            move || async move {
                let status = engine.tools_state(path).await;
                Ok((status == ToolsStatus::Running).then_some(()))
            },
        )
        .await?;

        self.cache
            .lock()
            .await
            .update(uuid, |vm| vm.tools_status = ToolsStatus::Running);
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn set_autostart(&self, uuid: &str, enabled: bool) -> Result<()> {
        let mut cache = self.cache.lock().await;
        let vm = self.lookup_uuid(&mut cache, uuid).await?;
        let mut vmx = VmxMap::load(&vm.path)?;
        vmx.set(AUTOSTART_KEY, bool_to_str(enabled));
        vmx.save(&vm.path)?;
        Ok(())
    }

    /// Attach a new card in the first free ethernet slot
    #[instrument(skip(self, nic), fields(connection_type = %nic.connection_type, vnet = %nic.vnet))]
    pub async fn add_network_interface(&self, uuid: &str, nic: NetworkInterface) -> Result<()> {
        let mut cache = self.cache.lock().await;
        let vm = self.lookup_uuid(&mut cache, uuid).await?;

        match self.resolve_interface(&nic).await? {
            CardTarget::Descriptor(nic) => {
                let mut vmx = VmxMap::load(&vm.path)?;
                let slot = network::free_ethernet_slot(&vmx);
                network::prepare_ethernet(&mut vmx, slot, &nic)?;
                vmx.save(&vm.path)?;
                debug!("Added ethernet{} to {}", slot, vm.name);
            }
            CardTarget::Api(nic) => {
                let created = self.api.create_nic(uuid, &nic_parameter(&nic)).await?;
                if !nic.device.is_empty() && created.index > 0 {
                    let mut vmx = VmxMap::load(&vm.path)?;
                    vmx.set(
                        &format!("ethernet{}.virtualDev", created.index - 1),
                        nic.device.as_str(),
                    );
                    vmx.save(&vm.path)?;
                }
                debug!("Added card {} to {}", created.index, vm.name);
            }
        }
        Ok(())
    }

    /// Reconfigure card `index` (0 based)
    #[instrument(skip(self, nic), fields(connection_type = %nic.connection_type, vnet = %nic.vnet))]
    pub async fn change_network_interface(
        &self,
        uuid: &str,
        index: u32,
        nic: NetworkInterface,
    ) -> Result<()> {
        let mut cache = self.cache.lock().await;
        let vm = self.lookup_uuid(&mut cache, uuid).await?;
        let mut vmx = VmxMap::load(&vm.path)?;
        if !vmx.has(&format!("ethernet{}.present", index)) {
            return Err(Status::not_found(format!(
                "network interface {} not found on {}",
                index, vm.name
            )));
        }

        match self.resolve_interface(&nic).await? {
            CardTarget::Descriptor(nic) => {
                network::prepare_ethernet(&mut vmx, index as usize, &nic)?;
                vmx.save(&vm.path)?;
            }
            CardTarget::Api(nic) => {
                self.api
                    .update_nic(uuid, index + 1, &nic_parameter(&nic))
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn virtual_machine_by_uuid(&self, uuid: &str) -> Result<VirtualMachine> {
        let mut cache = self.cache.lock().await;
        self.lookup_uuid(&mut cache, uuid).await
    }

    pub async fn virtual_machine_by_name(&self, name: &str) -> Result<VirtualMachine> {
        let mut cache = self.cache.lock().await;
        self.lookup_name(&mut cache, name).await
    }

    pub async fn virtual_machine_by_path(&self, path: &Path) -> Result<VirtualMachine> {
        let mut cache = self.cache.lock().await;
        self.lookup_path(&mut cache, path).await
    }

    /// Every VM known to the backend, freshly enumerated, sorted by name
    #[instrument(skip(self))]
    pub async fn list_virtual_machines(&self) -> Result<Vec<VirtualMachine>> {
        let mut cache = self.cache.lock().await;
        self.refresh_all(&mut cache).await?;
        Ok(cache.list())
    }

    /// VMs currently listed by `vmrun list`
    #[instrument(skip(self))]
    pub async fn running_vms(&self) -> Result<Vec<VirtualMachine>> {
        let mut cache = self.cache.lock().await;
        let running = self.running_paths().await?;
        let mut vms = Vec::new();
        for path in running {
            match self.lookup_path(&mut cache, &path).await {
                Ok(vm) => vms.push(vm),
                Err(e) => debug!("Running VM {} is not managed: {}", path.display(), e),
            }
        }
        vms.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(vms)
    }

    pub async fn list_networks(&self) -> Result<Vec<Vmnet>> {
        let networks = self.api.networks().await?;
        Ok(networks.vmnets.into_iter().map(Vmnet::from).collect())
    }

    /// Power on every VM flagged for autostart. Failures are logged, only
    /// an enumeration failure is returned.
    #[instrument(skip(self))]
    pub async fn start_autostart_vm(&self) -> Result<()> {
        let vms = self.list_virtual_machines().await?;
        for vm in vms.into_iter().filter(|vm| !vm.powered) {
            let autostart = match VmxMap::load(&vm.path) {
                Ok(vmx) => vmx.get_bool(AUTOSTART_KEY),
                Err(e) => {
                    warn!("Could not read {}: {}", vm.path.display(), e);
                    continue;
                }
            };
            if !autostart {
                continue;
            }
            info!("Starting {} on boot", vm.name);
            if let Err(e) = self.power_on(&vm.uuid).await {
                warn!("Failed to autostart {}: {}", vm.name, e);
            }
        }
        Ok(())
    }

    async fn clone_with_vmrun(
        &self,
        template: &VirtualMachine,
        request: &CreateVirtualMachine,
    ) -> Result<PathBuf> {
        let path = platform::vm_descriptor_path(&self.vm_folder, &request.name);
        if path.exists() {
            return Err(Status::already_exists(format!(
                "descriptor {} already exists",
                path.display()
            )));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Status::internal(format!("failed to create {}: {}", parent.display(), e))
            })?;
        }
        let kind = if request.linked { "linked" } else { "full" };
        let clone_name = format!("-cloneName={}", request.name);
        self.vmrun
            .run_checked(&[
                OsStr::new("clone"),
                template.path.as_os_str(),
                path.as_os_str(),
                OsStr::new(kind),
                OsStr::new(&clone_name),
            ])
            .await?;
        Ok(path)
    }

    async fn clone_with_api(
        &self,
        template: &VirtualMachine,
        request: &CreateVirtualMachine,
    ) -> Result<PathBuf> {
        let parameter = VmCloneParameter::new(request.name.clone(), template.uuid.clone());
        let created = self.api.clone_vm(&parameter).await?;
        let vms = self.api.vms().await?;
        vms.into_iter()
            .find(|vm| vm.id == created.id)
            .map(|vm| PathBuf::from(vm.path))
            .ok_or_else(|| {
                Status::internal(format!("cloned virtual machine {} is not listed", created.id))
            })
    }

    async fn expand_disk(&self, descriptor: &Path, vmx: &VmxMap, size_mb: u64) -> Result<()> {
        let file_name = DISK_ADAPTERS
            .iter()
            .filter(|adapter| {
                vmx.get(&format!("{}.present", adapter))
                    .map(crate::vmx::str_to_bool)
                    .unwrap_or(true)
            })
            .find_map(|adapter| vmx.get(&format!("{}.fileName", adapter)))
            .ok_or_else(|| {
                Status::failed_precondition(format!(
                    "no disk adapter found in {}",
                    descriptor.display()
                ))
            })?;
        let disk = match descriptor.parent() {
            Some(dir) => dir.join(file_name),
            None => PathBuf::from(file_name),
        };
        if !disk.exists() {
            return Err(Status::not_found(format!("disk {} not found", disk.display())));
        }

        let size = format!("{}MB", size_mb);
        let output = self
            .vdiskmanager
            .run(&[OsStr::new("-x"), OsStr::new(&size), disk.as_os_str()])
            .await?;
        if output.success() {
            debug!("Expanded {} to {}", disk.display(), size);
            return Ok(());
        }
        let text = output.text();
        if text.contains(DISK_NOT_GROWN) {
            debug!("{} is already {} or larger", disk.display(), size);
            return Ok(());
        }
        Err(Status::internal(format!(
            "failed to expand {}: {}",
            disk.display(),
            text
        )))
    }

    /// Settle the connection type of a card request from its virtual
    /// network and pick where it must be applied
    async fn resolve_interface(&self, nic: &NetworkInterface) -> Result<CardTarget> {
        let mut nic = nic.clone();
        if !nic.vnet.is_empty() {
            let networks = self.api.networks().await?;
            let vmnet = networks
                .vmnets
                .iter()
                .find(|candidate| candidate.name == nic.vnet)
                .ok_or_else(|| {
                    Status::not_found(format!("virtual network {} not found", nic.vnet))
                })?;
            if nic.connection_type != "custom" {
                nic.connection_type = network::connection_type_for(&nic.vnet, &vmnet.r#type);
            }
        }
        if nic.connection_type.is_empty() {
            return Err(Status::invalid_argument(
                "a network interface needs a connection type or a virtual network",
            ));
        }

        let static_mac = !nic.mac_address.is_empty() && nic.mac_address != network::GENERATED_MAC;
        if nic.connection_type == "custom" || static_mac {
            Ok(CardTarget::Descriptor(nic))
        } else {
            Ok(CardTarget::Api(nic))
        }
    }

    async fn running_paths(&self) -> Result<HashSet<PathBuf>> {
        let output = self.vmrun.run(&["list"]).await.map_err(|e| {
            Status::unavailable(format!("failed to list running virtual machines: {}", e))
        })?;
        if !output.success() {
            return Err(Status::unavailable(format!(
                "failed to list running virtual machines: {}",
                output.text()
            )));
        }
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with("Total running VMs"))
            .map(PathBuf::from)
            .collect())
    }

    async fn tools_state(&self, path: &Path) -> ToolsStatus {
        match self
            .vmrun
            .run(&[OsStr::new("checkToolsState"), path.as_os_str()])
            .await
        {
            Ok(output) if output.success() => ToolsStatus::from_output(&output.stdout),
            Ok(output) => {
                trace!("checkToolsState failed: {}", output.text());
                ToolsStatus::NotRunning
            }
            Err(e) => {
                trace!("checkToolsState failed: {}", e);
                ToolsStatus::NotRunning
            }
        }
    }

    async fn query_ip(&self, vm: &VirtualMachine) -> Result<Option<String>> {
        match self.api.ip_address(&vm.uuid).await {
            Ok(Some(ip)) if !ip.is_empty() => return Ok(Some(ip)),
            Ok(_) => {}
            Err(e) if e.is_unsupported() || e.is_no_address() => {}
            Err(e) => debug!("Daemon could not report the address of {}: {}", vm.name, e),
        }

        let output = self
            .vmrun
            .run(&[OsStr::new("getGuestIPAddress"), vm.path.as_os_str()])
            .await?;
        let text = output.text();
        if output.success() && !text.is_empty() && !text.starts_with("Error") {
            return Ok(Some(text));
        }
        if IP_NOT_READY.iter().any(|prefix| text.starts_with(prefix)) {
            return Ok(None);
        }
        Err(Status::internal(format!(
            "failed to get the IP address of {}: {}",
            vm.name, text
        )))
    }

    async fn fetch_vm(
        &self,
        id: &str,
        path: &Path,
        running: &HashSet<PathBuf>,
    ) -> Result<VirtualMachine> {
        let info = self.api.vm(id).await?;
        let name = match self.api.vm_param(id, NAME_KEY).await {
            Ok(param) if !param.value.is_empty() => param.value,
            _ => descriptor_name(path),
        };
        let powered = running.contains(path);
        let address = if powered {
            self.api.ip_address(id).await.ok().flatten()
        } else {
            None
        };
        let tools_status = match (&address, powered) {
            (Some(_), _) => ToolsStatus::Running,
            (None, true) => self.tools_state(path).await,
            (None, false) => ToolsStatus::NotRunning,
        };
        Ok(VirtualMachine {
            uuid: id.to_string(),
            path: path.to_path_buf(),
            name,
            vcpus: u32::try_from(info.cpu.processors).unwrap_or(0),
            memory: u32::try_from(info.memory).unwrap_or(0),
            powered,
            address,
            tools_status,
        })
    }

    /// Enumerate every VM registered in the backend and swap the cache
    async fn refresh_all(&self, cache: &mut VmCache) -> Result<()> {
        let ids = self.api.vms().await?;
        let running = self.running_paths().await?;
        let mut fresh = VmCache::new();
        for vm in ids {
            let path = PathBuf::from(&vm.path);
            if !path.exists() {
                debug!("Skipping {}, descriptor {} is missing", vm.id, vm.path);
                continue;
            }
            match self.fetch_vm(&vm.id, &path, &running).await {
                Ok(record) => fresh.insert(record),
                Err(e) => warn!("Could not read virtual machine {}: {}", vm.id, e),
            }
        }
        trace!("Cache refreshed with {} virtual machines", fresh.len());
        cache.replace(fresh);
        Ok(())
    }

    async fn still_exists(&self, vm: &VirtualMachine) -> bool {
        vm.path.exists() && self.api.vm(&vm.uuid).await.is_ok()
    }

    /// Return a cached entry if it is still valid, evict it otherwise
    async fn revalidate(&self, cache: &mut VmCache, uuid: &str) -> Result<VirtualMachine> {
        let vm = cache
            .get(uuid)
            .cloned()
            .ok_or_else(|| Status::not_found(format!("virtual machine {} not found", uuid)))?;
        if self.still_exists(&vm).await {
            let vm = self.refresh_power(cache, vm).await?;
            return Ok(self.refresh_tools(cache, vm).await);
        }
        debug!("Evicting stale virtual machine {}", vm.name);
        cache.remove(uuid);
        if let Err(e) = self.refresh_all(cache).await {
            warn!("Failed to refresh virtual machines: {}", e);
        }
        Err(Status::not_found(format!(
            "virtual machine {} no longer exists",
            vm.name
        )))
    }

    async fn lookup_uuid(&self, cache: &mut VmCache, uuid: &str) -> Result<VirtualMachine> {
        if !cache.contains(uuid) {
            self.refresh_all(cache).await?;
        }
        self.revalidate(cache, uuid).await
    }

    async fn lookup_name(&self, cache: &mut VmCache, name: &str) -> Result<VirtualMachine> {
        if cache.by_name(name).is_none() {
            self.refresh_all(cache).await?;
        }
        let uuid = cache
            .by_name(name)
            .map(|vm| vm.uuid.clone())
            .ok_or_else(|| Status::not_found(format!("virtual machine {} not found", name)))?;
        self.revalidate(cache, &uuid).await
    }

    async fn lookup_path(&self, cache: &mut VmCache, path: &Path) -> Result<VirtualMachine> {
        if cache.by_path(path).is_none() {
            self.refresh_all(cache).await?;
        }
        let uuid = cache.by_path(path).map(|vm| vm.uuid.clone()).ok_or_else(|| {
            Status::not_found(format!("virtual machine {} not found", path.display()))
        })?;
        self.revalidate(cache, &uuid).await
    }

    /// Query the power state and store it in the cache
    async fn refresh_power(
        &self,
        cache: &mut VmCache,
        vm: VirtualMachine,
    ) -> Result<VirtualMachine> {
        let running = self.running_paths().await.map_err(|e| {
            Status::unavailable(format!(
                "failed to get the power state of {}: {}",
                vm.path.display(),
                e.reason()
            ))
        })?;
        let powered = running.contains(&vm.path);
        if powered == vm.powered {
            return Ok(vm);
        }
        Ok(cache
            .update(&vm.uuid, |record| {
                record.powered = powered;
                if !powered {
                    record.address = None;
                    record.tools_status = ToolsStatus::NotRunning;
                }
            })
            .unwrap_or(VirtualMachine { powered, ..vm }))
    }

    /// Query the guest tools of a powered VM and store the result. A known
    /// address means the tools run.
    async fn refresh_tools(&self, cache: &mut VmCache, vm: VirtualMachine) -> VirtualMachine {
        if !vm.powered {
            return vm;
        }
        let tools_status = match vm.address {
            Some(_) => ToolsStatus::Running,
            None => self.tools_state(&vm.path).await,
        };
        if tools_status == vm.tools_status {
            return vm;
        }
        cache
            .update(&vm.uuid, |record| record.tools_status = tools_status)
            .unwrap_or(VirtualMachine { tools_status, ..vm })
    }
}

/// Apply a creation request on a freshly cloned descriptor
fn prepare_descriptor(vmx: &mut VmxMap, request: &CreateVirtualMachine) -> Result<()> {
    vmx.cleanup(!request.networks.is_empty());
    vmx.set(NAME_KEY, request.name.as_str());
    vmx.set("displayName", request.name.as_str());
    if request.vcpus > 0 {
        vmx.set("numvcpus", request.vcpus.to_string());
    }
    if request.memory > 0 {
        vmx.set("memsize", request.memory.to_string());
    }
    for (key, value) in &request.guest_infos {
        vmx.set(&format!("guestinfo.{}", key), value.as_str());
    }
    for (index, nic) in request.networks.iter().enumerate() {
        network::prepare_ethernet(vmx, index, nic)?;
    }
    Ok(())
}

fn nic_parameter(nic: &NetworkInterface) -> NicDeviceParameter {
    NicDeviceParameter {
        r#type: nic.connection_type.clone(),
        vmnet: (!nic.vnet.is_empty()).then(|| nic.vnet.clone()),
    }
}

/// Name of a VM from its descriptor, or from the file name
fn descriptor_name(path: &Path) -> String {
    if let Ok(vmx) = VmxMap::load(path) {
        if let Some(name) = vmx.get(NAME_KEY).or_else(|| vmx.get("displayName")) {
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}
