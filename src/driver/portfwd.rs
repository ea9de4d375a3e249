//! Port forward reconciliation between the active backend and the persisted
//! NAT store.
//!
//! The backend is the operational truth, the store only carries what the
//! backend forgets: the description, which names the descriptor owning the
//! forward as `desktop-utility: <descriptor path>`.
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use super::{networking::vmnet_slot, Backend, Networking, PortFwd};
use crate::{
    engine::Engine,
    settings::{NatGuest, NatPortFwd, NatStore},
    status::{Result, Status},
};

/// Tag every managed forward description starts with
pub const PORTFWD_PREFIX: &str = "desktop-utility: ";

#[derive(Debug)]
pub struct PortFwdReconciler {
    store_path: PathBuf,
    /// Serializes read-modify-write cycles of the store
    lock: Mutex<()>,
}

impl From<&PortFwd> for NatPortFwd {
    fn from(forward: &PortFwd) -> NatPortFwd {
        NatPortFwd {
            port: forward.port,
            protocol: forward.protocol.to_lowercase(),
            description: forward.description.clone(),
            guest: NatGuest {
                ip: forward.guest_ip.clone(),
                port: forward.guest_port,
            },
            device: format!("vmnet{}", forward.slot_number),
            slot_number: forward.slot_number,
        }
    }
}

impl From<NatPortFwd> for PortFwd {
    fn from(forward: NatPortFwd) -> PortFwd {
        PortFwd {
            port: forward.port,
            protocol: forward.protocol,
            description: forward.description,
            slot_number: forward.slot_number,
            guest_ip: forward.guest.ip,
            guest_port: forward.guest.port,
        }
    }
}

impl PortFwdReconciler {
    pub fn new(store_path: PathBuf) -> PortFwdReconciler {
        PortFwdReconciler {
            store_path,
            lock: Mutex::new(()),
        }
    }

    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    /// Live forwards of a NAT device, the first NAT device when `slot` is
    /// not given, with descriptions taken from the store
    pub async fn port_fwds(&self, backend: &Backend, slot: Option<u32>) -> Result<Vec<PortFwd>> {
        let slot = match slot {
            Some(slot) if slot > 0 => slot,
            _ => detect_nat(backend).await?,
        };
        let mut forwards = backend.port_fwds(slot).await?;

        let _guard = self.lock.lock().await;
        let store = NatStore::load(&self.store_path)?;
        for forward in forwards.iter_mut() {
            if let Some(stored) = store.find(&NatPortFwd::from(&*forward)) {
                forward.description = stored.description.clone();
            }
        }
        Ok(forwards)
    }

    #[instrument(skip_all, fields(count = forwards.len()))]
    pub async fn add_port_fwd(
        &self,
        backend: &Backend,
        engine: &Engine,
        forwards: Vec<PortFwd>,
    ) -> Result<()> {
        let forwards = self.prepare(backend, engine, forwards).await?;
        backend.add_port_fwd(&forwards).await?;

        let _guard = self.lock.lock().await;
        let mut store = NatStore::load(&self.store_path).map_err(persist_error)?;
        for forward in &forwards {
            store.add(NatPortFwd::from(forward));
        }
        store.save().map_err(persist_error)?;
        info!("Added {} port forwards", forwards.len());
        Ok(())
    }

    #[instrument(skip_all, fields(count = forwards.len()))]
    pub async fn delete_port_fwd(
        &self,
        backend: &Backend,
        engine: &Engine,
        forwards: Vec<PortFwd>,
    ) -> Result<()> {
        let forwards = self.prepare(backend, engine, forwards).await?;
        backend.delete_port_fwd(&forwards).await?;

        let _guard = self.lock.lock().await;
        let mut store = NatStore::load(&self.store_path).map_err(persist_error)?;
        for forward in &forwards {
            if !store.remove(&NatPortFwd::from(forward)) {
                debug!("Port {} was not persisted", forward.port);
            }
        }
        store.save().map_err(persist_error)?;
        info!("Deleted {} port forwards", forwards.len());
        Ok(())
    }

    /// Validate descriptions and resolve the NAT device of every forward.
    /// Runs before any backend call.
    async fn prepare(
        &self,
        backend: &Backend,
        engine: &Engine,
        forwards: Vec<PortFwd>,
    ) -> Result<Vec<PortFwd>> {
        let mut nat_slot = None;
        let mut prepared = Vec::with_capacity(forwards.len());
        for mut forward in forwards {
            let path = forward
                .description
                .strip_prefix(PORTFWD_PREFIX)
                .map(str::to_string)
                .ok_or_else(|| {
                    Status::invalid_argument(format!(
                        "port forward description must start with '{}'",
                        PORTFWD_PREFIX
                    ))
                })?;
            let path = match_vm_path(engine, Path::new(&path)).await?;
            forward.description = format!("{}{}", PORTFWD_PREFIX, path);
            if forward.slot_number == 0 {
                if nat_slot.is_none() {
                    nat_slot = Some(detect_nat(backend).await?);
                }
                forward.slot_number = nat_slot.unwrap_or_default();
            }
            prepared.push(forward);
        }
        Ok(prepared)
    }
}

fn persist_error(e: impl std::fmt::Display) -> Status {
    Status::internal(format!(
        "failed to store persistent port forward information: {}",
        e
    ))
}

/// Path of the managed VM owning `path`. The lower-cased path is returned
/// when only a case-insensitive match exists.
async fn match_vm_path(engine: &Engine, path: &Path) -> Result<String> {
    if let Ok(vm) = engine.virtual_machine_by_path(path).await {
        return Ok(vm.path.display().to_string());
    }
    let wanted = path.display().to_string().to_lowercase();
    let vms = engine.list_virtual_machines().await?;
    if vms
        .iter()
        .any(|vm| vm.path.display().to_string().to_lowercase() == wanted)
    {
        debug!("Matched {} ignoring case", path.display());
        return Ok(wanted);
    }
    Err(Status::invalid_argument(format!(
        "no virtual machine found at {}",
        path.display()
    )))
}

/// Slot of the first NAT device of the backend
async fn detect_nat(backend: &Backend) -> Result<u32> {
    backend
        .vmnets()
        .await?
        .iter()
        .filter(|vmnet| vmnet.kind.eq_ignore_ascii_case("nat"))
        .find_map(|vmnet| vmnet_slot(&vmnet.name))
        .ok_or_else(|| Status::not_found("no NAT virtual network found"))
}
