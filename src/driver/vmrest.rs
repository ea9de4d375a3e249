//! Daemon accelerated backend. Networking goes through the vmrest API, what
//! the API cannot do is forwarded to the tool-only fallback, unless the
//! platform leaves the daemon as the only way to manage networks.
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};
use vmrest_models::models::{Network, PortForwardParameter};

use super::{networking::free_slot, Backend, Networking, PortFwd, Vmnet};
use crate::{
    api::VmwareApi,
    status::{Result, Status},
    vmrest::RestClient,
};

/// Description of every forward created through the daemon, the real one
/// is kept in the persisted store
pub const MANAGED_DESCRIPTION: &str = "desktop-utility: managed port";

#[derive(Debug)]
pub struct VmrestDriver {
    api: Arc<RestClient>,
    fallback: Box<Backend>,
    /// The daemon is the only way to manage networks on this platform
    daemon_networking: bool,
}

impl VmrestDriver {
    pub fn new(api: Arc<RestClient>, fallback: Backend, daemon_networking: bool) -> VmrestDriver {
        VmrestDriver {
            api,
            fallback: Box::new(fallback),
            daemon_networking,
        }
    }

    pub fn api(&self) -> &Arc<RestClient> {
        &self.api
    }

    pub fn fallback(&self) -> &Backend {
        &self.fallback
    }

    fn daemon_only(&self, operation: &str) -> Status {
        Status::unimplemented(format!(
            "{} is not supported by vmrest on this platform",
            operation
        ))
    }
}

#[async_trait]
impl Networking for VmrestDriver {
    fn name(&self) -> &'static str {
        "vmrest"
    }

    async fn vmnets(&self) -> Result<Vec<Vmnet>> {
        let networks = self.api.networks().await?;
        Ok(networks.vmnets.into_iter().map(Vmnet::from).collect())
    }

    #[instrument(skip(self))]
    async fn add_vmnet(&self, vmnet: &Vmnet) -> Result<Vmnet> {
        let custom_addressing = !vmnet.subnet.is_empty() || !vmnet.mask.is_empty();
        if custom_addressing {
            if self.daemon_networking {
                return Err(Status::invalid_argument(
                    "custom subnet and mask cannot be set through vmrest on this platform",
                ));
            }
            debug!("Custom addressing requested, using {} driver", self.fallback.name());
            return self.fallback.add_vmnet(vmnet).await;
        }

        let mut vmnet = vmnet.clone();
        let existing = self.vmnets().await?;
        if vmnet.name.is_empty() {
            let slot = free_slot(existing.iter().map(|v| v.name.as_str()));
            vmnet.name = format!("vmnet{}", slot);
        } else if existing.iter().any(|v| v.name == vmnet.name) {
            return Err(Status::already_exists(format!(
                "virtual network {} already exists",
                vmnet.name
            )));
        }
        let request = Network {
            name: vmnet.name.clone(),
            r#type: vmnet.kind.clone(),
            ..Default::default()
        };
        let created = self.api.create_network(&request).await?;
        Ok(Vmnet::from(created))
    }

    async fn update_vmnet(&self, vmnet: &Vmnet) -> Result<()> {
        if self.daemon_networking {
            return Err(self.daemon_only("updating a virtual network"));
        }
        self.fallback.update_vmnet(vmnet).await
    }

    async fn delete_vmnet(&self, name: &str) -> Result<()> {
        if self.daemon_networking {
            return Err(self.daemon_only("deleting a virtual network"));
        }
        self.fallback.delete_vmnet(name).await
    }

    async fn port_fwds(&self, slot_number: u32) -> Result<Vec<PortFwd>> {
        let device = format!("vmnet{}", slot_number);
        let forwards = self.api.port_forwards(&device).await?;
        Ok(forwards
            .port_forwardings
            .into_iter()
            .map(|forward| PortFwd {
                port: forward.port,
                protocol: forward.protocol,
                description: forward.desc,
                slot_number,
                guest_ip: forward.guest.ip,
                guest_port: forward.guest.port,
            })
            .collect())
    }

    async fn add_port_fwd(&self, forwards: &[PortFwd]) -> Result<()> {
        for forward in forwards {
            let device = format!("vmnet{}", forward.slot_number);
            let parameter = PortForwardParameter {
                guest_ip: forward.guest_ip.clone(),
                guest_port: forward.guest_port,
                desc: MANAGED_DESCRIPTION.to_string(),
            };
            self.api
                .set_port_forward(&device, &forward.protocol, forward.port, &parameter)
                .await?;
        }
        Ok(())
    }

    async fn delete_port_fwd(&self, forwards: &[PortFwd]) -> Result<()> {
        for forward in forwards {
            let device = format!("vmnet{}", forward.slot_number);
            self.api
                .delete_port_forward(&device, &forward.protocol, forward.port)
                .await?;
        }
        Ok(())
    }

    async fn reserve_dhcp_address(&self, slot_number: u32, mac: &str, ip: &str) -> Result<()> {
        let device = format!("vmnet{}", slot_number);
        self.api.set_mac_to_ip(&device, mac, ip).await?;
        Ok(())
    }

    async fn validate(&self) -> Result<()> {
        self.fallback.validate().await
    }
}
