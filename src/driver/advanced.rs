//! Full-featured tool-only backend. Virtual networks, port forwards and DHCP
//! reservations are written in the hypervisor configuration files, the
//! network services are then restarted through the network helper.
use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{
    nat::{DhcpdConf, NatConf},
    networking::{free_slot, NetworkingFile},
    BaseDriver, Networking, PortFwd, Vmnet,
};
use crate::status::{Result, Status};

#[derive(Debug)]
pub struct AdvancedDriver {
    base: Arc<BaseDriver>,
    /// Serializes edits of the configuration files
    files: Mutex<()>,
}

impl AdvancedDriver {
    pub fn new(base: Arc<BaseDriver>) -> AdvancedDriver {
        AdvancedDriver {
            base,
            files: Mutex::new(()),
        }
    }

    fn networking(&self) -> Result<NetworkingFile> {
        NetworkingFile::load(&self.base.paths().networking)
    }

    fn save_networking(&self, file: &NetworkingFile) -> Result<()> {
        file.save(&self.base.paths().networking)
    }

    /// Stop, reconfigure and start the hypervisor network services
    async fn restart_networking(&self) -> Result<()> {
        let helper = self.base.paths().network_helper_tool();
        for step in ["--stop", "--configure", "--start"] {
            debug!("Running {} {}", helper.name(), step);
            helper.run_checked(&[step]).await?;
        }
        info!("Network services restarted");
        Ok(())
    }

    fn existing(file: &NetworkingFile, name: &str) -> Option<Vmnet> {
        file.vmnets().into_iter().find(|v| v.name == name)
    }
}

/// Forwards grouped by NAT device slot
fn by_slot(forwards: &[PortFwd]) -> BTreeMap<u32, Vec<&PortFwd>> {
    let mut grouped: BTreeMap<u32, Vec<&PortFwd>> = BTreeMap::new();
    for forward in forwards {
        grouped.entry(forward.slot_number).or_default().push(forward);
    }
    grouped
}

#[async_trait]
impl Networking for AdvancedDriver {
    fn name(&self) -> &'static str {
        "advanced"
    }

    async fn vmnets(&self) -> Result<Vec<Vmnet>> {
        self.base.file_vmnets()
    }

    async fn add_vmnet(&self, vmnet: &Vmnet) -> Result<Vmnet> {
        let _files = self.files.lock().await;
        let mut file = self.networking()?;
        let mut vmnet = vmnet.clone();
        if vmnet.name.is_empty() {
            let names: Vec<String> = file.vmnets().into_iter().map(|v| v.name).collect();
            vmnet.name = format!("vmnet{}", free_slot(names.iter().map(String::as_str)));
        } else if Self::existing(&file, &vmnet.name).is_some() {
            return Err(Status::already_exists(format!(
                "virtual network {} already exists",
                vmnet.name
            )));
        }
        file.set_vmnet(&vmnet)?;
        self.save_networking(&file)?;
        self.restart_networking().await?;
        info!("Added virtual network {}", vmnet.name);
        Ok(vmnet)
    }

    async fn update_vmnet(&self, vmnet: &Vmnet) -> Result<()> {
        let _files = self.files.lock().await;
        let mut file = self.networking()?;
        if Self::existing(&file, &vmnet.name).is_none() {
            return Err(Status::not_found(format!(
                "virtual network {} not found",
                vmnet.name
            )));
        }
        file.set_vmnet(vmnet)?;
        self.save_networking(&file)?;
        self.restart_networking().await
    }

    async fn delete_vmnet(&self, name: &str) -> Result<()> {
        let _files = self.files.lock().await;
        let mut file = self.networking()?;
        file.remove_vmnet(name)?;
        self.save_networking(&file)?;
        self.restart_networking().await
    }

    async fn port_fwds(&self, slot_number: u32) -> Result<Vec<PortFwd>> {
        let device = format!("vmnet{}", slot_number);
        let conf = NatConf::load(&self.base.paths().nat_conf(&device))?;
        Ok(conf.forwards(slot_number))
    }

    async fn add_port_fwd(&self, forwards: &[PortFwd]) -> Result<()> {
        let _files = self.files.lock().await;
        for (slot, forwards) in by_slot(forwards) {
            let path = self.base.paths().nat_conf(&format!("vmnet{}", slot));
            let mut conf = NatConf::load(&path)?;
            for forward in forwards {
                conf.set_forward(forward)?;
            }
            conf.save(&path)?;
        }
        self.restart_networking().await
    }

    async fn delete_port_fwd(&self, forwards: &[PortFwd]) -> Result<()> {
        let _files = self.files.lock().await;
        for (slot, forwards) in by_slot(forwards) {
            let path = self.base.paths().nat_conf(&format!("vmnet{}", slot));
            let mut conf = NatConf::load(&path)?;
            for forward in forwards {
                if !conf.remove_forward(&forward.protocol, forward.port)? {
                    debug!("No {} forward for port {} on vmnet{}", forward.protocol, forward.port, slot);
                }
            }
            conf.save(&path)?;
        }
        self.restart_networking().await
    }

    async fn reserve_dhcp_address(&self, slot_number: u32, mac: &str, ip: &str) -> Result<()> {
        let _files = self.files.lock().await;
        let device = format!("vmnet{}", slot_number);
        let file = self.networking()?;
        let vmnet = Self::existing(&file, &device)
            .ok_or_else(|| Status::not_found(format!("virtual network {} not found", device)))?;
        if !vmnet.dhcp {
            return Err(Status::failed_precondition(format!(
                "DHCP is disabled on {}",
                device
            )));
        }
        let path = self.base.paths().dhcpd_conf(&device);
        let mut conf = DhcpdConf::load(&path)?;
        conf.reserve(&device, mac, ip);
        conf.save(&path)?;
        self.restart_networking().await
    }

    async fn validate(&self) -> Result<()> {
        self.base.validate_tools()?;
        let paths = self.base.paths();
        if !paths.networking.is_file() {
            return Err(Status::failed_precondition(format!(
                "networking file {} not found",
                paths.networking.display()
            )));
        }
        if !paths.network_helper.is_file() {
            return Err(Status::failed_precondition(format!(
                "network helper {} not found",
                paths.network_helper.display()
            )));
        }
        Ok(())
    }
}
