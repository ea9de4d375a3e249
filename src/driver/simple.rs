//! Minimal backend: virtual networks are read from the networking file,
//! nothing can be changed.
use std::sync::Arc;

use async_trait::async_trait;

use super::{BaseDriver, Networking, PortFwd, Vmnet};
use crate::status::{Result, Status};

#[derive(Debug)]
pub struct SimpleDriver {
    base: Arc<BaseDriver>,
}

impl SimpleDriver {
    pub fn new(base: Arc<BaseDriver>) -> SimpleDriver {
        SimpleDriver { base }
    }
}

fn unimplemented(operation: &str) -> Status {
    Status::unimplemented(format!("{} is not supported by the simple driver", operation))
}

#[async_trait]
impl Networking for SimpleDriver {
    fn name(&self) -> &'static str {
        "simple"
    }

    async fn vmnets(&self) -> Result<Vec<Vmnet>> {
        self.base.file_vmnets()
    }

    async fn add_vmnet(&self, _vmnet: &Vmnet) -> Result<Vmnet> {
        Err(unimplemented("adding a virtual network"))
    }

    async fn update_vmnet(&self, _vmnet: &Vmnet) -> Result<()> {
        Err(unimplemented("updating a virtual network"))
    }

    async fn delete_vmnet(&self, _name: &str) -> Result<()> {
        Err(unimplemented("deleting a virtual network"))
    }

    async fn port_fwds(&self, _slot_number: u32) -> Result<Vec<PortFwd>> {
        Err(unimplemented("listing port forwards"))
    }

    async fn add_port_fwd(&self, _forwards: &[PortFwd]) -> Result<()> {
        Err(unimplemented("adding port forwards"))
    }

    async fn delete_port_fwd(&self, _forwards: &[PortFwd]) -> Result<()> {
        Err(unimplemented("deleting port forwards"))
    }

    async fn reserve_dhcp_address(&self, _slot_number: u32, _mac: &str, _ip: &str) -> Result<()> {
        Err(unimplemented("DHCP reservation"))
    }

    async fn validate(&self) -> Result<()> {
        self.base.validate_tools()
    }
}
