//! # Descriptor-backed inventory
//!
//! Without the vmrest daemon nothing keeps a registry of virtual machines.
//! [LocalApi] answers inventory questions straight from the file system:
//! the VMs are the descriptors found in the VM folder, identified by a
//! name-based UUID of their path so the identifier is stable across restarts.
//! Networks are read from the hypervisor networking file.
use std::{
    fs,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use tracing::{debug, trace};
use uuid::Uuid;
use vmrest_models::models::{
    ConfigVmParamsParameter, Network, NicDevice, NicDeviceParameter, NicIpStackAll, Networks,
    PortForwardParameter, PortForwards, VmCloneParameter, VmId, VmInformation,
    VmRegisterParameter,
};

use super::{network, NetworkInterface};
use crate::{
    api::{ApiError, ApiResult, VmwareApi},
    driver::networking::NetworkingFile,
    vmx::VmxMap,
};

#[derive(Debug, Clone)]
pub struct LocalApi {
    vm_folder: PathBuf,
    networking: Option<PathBuf>,
}

impl LocalApi {
    pub fn new(vm_folder: PathBuf) -> LocalApi {
        LocalApi {
            vm_folder,
            networking: None,
        }
    }

    pub fn with_networking_file(mut self, path: Option<PathBuf>) -> LocalApi {
        self.networking = path;
        self
    }

    /// Stable identifier of a descriptor
    pub fn id_for(path: &Path) -> String {
        Uuid::new_v5(&Uuid::NAMESPACE_URL, path.to_string_lossy().as_bytes())
            .simple()
            .to_string()
            .to_uppercase()
    }

    /// Descriptors directly in the VM folder or one level below
    fn descriptors(&self) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let Ok(entries) = fs::read_dir(&self.vm_folder) else {
            debug!("VM folder {} is not readable", self.vm_folder.display());
            return found;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                if let Ok(children) = fs::read_dir(&path) {
                    found.extend(children.flatten().map(|c| c.path()).filter(|p| is_vmx(p)));
                }
            } else if is_vmx(&path) {
                found.push(path);
            }
        }
        found.sort();
        found
    }

    fn find(&self, id: &str) -> ApiResult<PathBuf> {
        self.descriptors()
            .into_iter()
            .find(|path| Self::id_for(path) == id)
            .ok_or_else(|| ApiError::NotFound(format!("virtual machine {} not found", id)))
    }

    fn load(&self, id: &str) -> ApiResult<(PathBuf, VmxMap)> {
        let path = self.find(id)?;
        let vmx = VmxMap::load(&path).map_err(|e| ApiError::Local(e.to_string()))?;
        Ok((path, vmx))
    }
}

fn is_vmx(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("vmx"))
            .unwrap_or(false)
}

fn nic_device(vmx: &VmxMap, index: u32) -> NicDevice {
    let cards = network::read_cards(vmx, &[]);
    let card = cards.iter().find(|card| card.index + 1 == index);
    NicDevice {
        index: index as i32,
        r#type: card.map(|c| c.connection_type.clone()).unwrap_or_default(),
        vmnet: card.map(|c| c.vnet.clone()).unwrap_or_default(),
        mac_address: card.map(|c| c.mac_address.clone()).unwrap_or_default(),
    }
}

#[async_trait]
impl VmwareApi for LocalApi {
    async fn vms(&self) -> ApiResult<Vec<VmId>> {
        Ok(self
            .descriptors()
            .into_iter()
            .map(|path| VmId::new(Self::id_for(&path), path.to_string_lossy().into_owned()))
            .collect())
    }

    async fn vm(&self, id: &str) -> ApiResult<VmInformation> {
        let (_, vmx) = self.load(id)?;
        let number = |key: &str, default: i32| {
            vmx.get(key)
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };
        Ok(VmInformation::new(
            id.to_string(),
            number("numvcpus", 1),
            number("memsize", 0),
        ))
    }

    async fn vm_param(&self, id: &str, name: &str) -> ApiResult<ConfigVmParamsParameter> {
        let (_, vmx) = self.load(id)?;
        let value = vmx.get(name).unwrap_or_default().to_string();
        Ok(ConfigVmParamsParameter::new(name.to_string(), value))
    }

    async fn ip_address(&self, _id: &str) -> ApiResult<Option<String>> {
        Err(ApiError::Unsupported("guest address lookup"))
    }

    async fn nic_ips(&self, _id: &str) -> ApiResult<Option<NicIpStackAll>> {
        Ok(None)
    }

    async fn nic_devices(&self, id: &str) -> ApiResult<Vec<NicDevice>> {
        let (_, vmx) = self.load(id)?;
        Ok(network::read_cards(&vmx, &[])
            .iter()
            .map(|card| nic_device(&vmx, card.index + 1))
            .collect())
    }

    async fn create_nic(&self, id: &str, nic: &NicDeviceParameter) -> ApiResult<NicDevice> {
        let (path, mut vmx) = self.load(id)?;
        let slot = network::free_ethernet_slot(&vmx);
        let request = NetworkInterface {
            mac_address: network::GENERATED_MAC.to_string(),
            vnet: nic.vmnet.clone().unwrap_or_default(),
            connection_type: nic.r#type.clone(),
            device: network::DEFAULT_DEVICE.to_string(),
            ..Default::default()
        };
        network::prepare_ethernet(&mut vmx, slot, &request)
            .map_err(|e| ApiError::Local(e.reason().to_string()))?;
        vmx.save(&path).map_err(|e| ApiError::Local(e.to_string()))?;
        trace!("Added ethernet{} to {}", slot, path.display());
        Ok(nic_device(&vmx, slot as u32 + 1))
    }

    async fn update_nic(
        &self,
        id: &str,
        index: u32,
        nic: &NicDeviceParameter,
    ) -> ApiResult<NicDevice> {
        let (path, mut vmx) = self.load(id)?;
        let prefix = format!("ethernet{}", index.saturating_sub(1));
        if index == 0 || !vmx.has(&format!("{}.present", prefix)) {
            return Err(ApiError::NotFound(format!(
                "network interface {} not found",
                index
            )));
        }
        vmx.set(&format!("{}.connectionType", prefix), nic.r#type.as_str());
        if nic.r#type != "custom" {
            vmx.delete(&format!("{}.vnet", prefix));
        }
        vmx.save(&path).map_err(|e| ApiError::Local(e.to_string()))?;
        Ok(nic_device(&vmx, index))
    }

    async fn clone_vm(&self, _request: &VmCloneParameter) -> ApiResult<VmInformation> {
        Err(ApiError::Unsupported("clone"))
    }

    async fn register_vm(&self, request: &VmRegisterParameter) -> ApiResult<VmId> {
        let path = PathBuf::from(&request.path);
        if !is_vmx(&path) {
            return Err(ApiError::NotFound(format!(
                "descriptor {} not found",
                request.path
            )));
        }
        Ok(VmId::new(Self::id_for(&path), request.path.clone()))
    }

    async fn delete_vm(&self, _id: &str) -> ApiResult<()> {
        Err(ApiError::Unsupported("delete"))
    }

    async fn networks(&self) -> ApiResult<Networks> {
        let Some(path) = &self.networking else {
            return Ok(Networks::default());
        };
        let file = NetworkingFile::load(path).map_err(|e| ApiError::Local(e.reason().to_string()))?;
        let vmnets: Vec<Network> = file.vmnets().into_iter().map(Network::from).collect();
        Ok(Networks {
            num: vmnets.len() as i32,
            vmnets,
        })
    }

    async fn create_network(&self, _network: &Network) -> ApiResult<Network> {
        Err(ApiError::Unsupported("virtual network creation"))
    }

    async fn port_forwards(&self, _device: &str) -> ApiResult<PortForwards> {
        Err(ApiError::Unsupported("port forwarding"))
    }

    async fn set_port_forward(
        &self,
        _device: &str,
        _protocol: &str,
        _port: u16,
        _forward: &PortForwardParameter,
    ) -> ApiResult<()> {
        Err(ApiError::Unsupported("port forwarding"))
    }

    async fn delete_port_forward(
        &self,
        _device: &str,
        _protocol: &str,
        _port: u16,
    ) -> ApiResult<()> {
        Err(ApiError::Unsupported("port forwarding"))
    }

    async fn set_mac_to_ip(&self, _device: &str, _mac: &str, _ip: &str) -> ApiResult<()> {
        Err(ApiError::Unsupported("DHCP reservation"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn write_vm(folder: &Path, name: &str, content: &str) -> PathBuf {
        let dir = folder.join(name);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{}.vmx", name));
        fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn enumerates_descriptors() {
        let dir = tempdir().unwrap();
        let path = write_vm(
            dir.path(),
            "base",
            "vmname = \"base\"\nnumvcpus = \"2\"\nmemsize = \"2048\"\n",
        );
        fs::write(dir.path().join("notes.txt"), "not a vm").unwrap();

        let api = LocalApi::new(dir.path().to_path_buf());
        let vms = api.vms().await.unwrap();
        assert_eq!(vms.len(), 1);
        assert_eq!(vms[0].path, path.to_string_lossy());
        assert_eq!(vms[0].id, LocalApi::id_for(&path));

        let info = api.vm(&vms[0].id).await.unwrap();
        assert_eq!(info.cpu.processors, 2);
        assert_eq!(info.memory, 2048);
        assert_eq!(api.vm_param(&vms[0].id, "vmname").await.unwrap().value, "base");
        assert!(api.vm("unknown").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn manages_cards_in_descriptor() {
        let dir = tempdir().unwrap();
        let path = write_vm(
            dir.path(),
            "base",
            "ethernet0.present = \"TRUE\"\nethernet0.connectionType = \"nat\"\n",
        );
        let api = LocalApi::new(dir.path().to_path_buf());
        let id = LocalApi::id_for(&path);

        let created = api
            .create_nic(&id, &NicDeviceParameter::new("hostonly".to_string()))
            .await
            .unwrap();
        assert_eq!(created.index, 2);
        assert_eq!(created.r#type, "hostonly");

        let updated = api
            .update_nic(&id, 1, &NicDeviceParameter::new("bridged".to_string()))
            .await
            .unwrap();
        assert_eq!(updated.r#type, "bridged");

        let devices = api.nic_devices(&id).await.unwrap();
        assert_eq!(
            devices.iter().map(|d| d.r#type.as_str()).collect::<Vec<_>>(),
            vec!["bridged", "hostonly"]
        );
        assert!(api
            .update_nic(&id, 7, &NicDeviceParameter::new("nat".to_string()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn networks_from_networking_file() {
        let dir = tempdir().unwrap();
        let networking = dir.path().join("networking");
        fs::write(&networking, "VERSION=1,0\nanswer VNET_8_NAT yes\n").unwrap();

        let api = LocalApi::new(dir.path().to_path_buf()).with_networking_file(Some(networking));
        let networks = api.networks().await.unwrap();
        assert_eq!(networks.num, 2);
        assert_eq!(networks.vmnets[1].name, "vmnet8");
        assert_eq!(networks.vmnets[1].r#type, "nat");

        let bare = LocalApi::new(dir.path().to_path_buf());
        assert!(bare.networks().await.unwrap().vmnets.is_empty());
        assert!(bare.ip_address("x").await.unwrap_err().is_unsupported());
    }
}
