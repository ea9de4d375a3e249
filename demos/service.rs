use std::{path::PathBuf, time::Duration};

use tracing::{error, info, warn};
use vmware_desktop_utility::{
    builder::Configuration,
    driver::{Driver, Networking},
    lifecycle::Lifecycle,
    logging::{self, LogConfig},
};

/// This example shows how a service wires the utility together: logging,
/// the process lifecycle and the driver.
///
/// Requirements:
/// - a VMware desktop hypervisor installed at its default location, or
///   `VMWARE_LOCATION` pointing to its installation directory
///
/// It lists the known virtual machines and networks, powers on the VMs
/// flagged for autostart, then waits for Ctrl-C. Set `VM_FOLDER` to change
/// where new VMs are created.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init(&LogConfig::new().with_level("info"))?;

    let lifecycle = Lifecycle::new();
    let mut config = Configuration::new().with_keepalive(Duration::from_secs(60));
    if let Some(folder) = std::env::var_os("VM_FOLDER") {
        config = config.with_vm_folder(PathBuf::from(folder));
    }

    let driver = Driver::new(&lifecycle, config).await?;
    info!("Driver {} ready", driver.get_driver().name());
    if let Some(status) = driver.validation_error() {
        warn!("Driver is not usable: {}", status);
    }

    match driver.vmrun() {
        Ok(engine) => {
            for vm in engine.list_virtual_machines().await? {
                info!(
                    "{} {} powered={} path={}",
                    vm.uuid,
                    vm.name,
                    vm.powered,
                    vm.path.display()
                );
            }
            if let Err(e) = engine.start_autostart_vm().await {
                error!("Autostart failed: {}", e);
            }
        }
        Err(e) => error!("Engine unavailable: {}", e),
    }

    for vmnet in driver.vmnets().await.unwrap_or_default() {
        info!("{} type={} dhcp={}", vmnet.name, vmnet.kind, vmnet.dhcp);
    }

    tokio::signal::ctrl_c().await?;
    lifecycle.shutdown();
    Ok(())
}
