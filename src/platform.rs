//! Per-platform defaults and predicates. VMware Fusion (macOS) and VMware
//! Workstation (Linux, Windows) lay out their installations differently.
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::process::Tool;

pub fn is_macos() -> bool {
    cfg!(target_os = "macos")
}

/// Value given to `vmrun -T`
pub fn vmrun_host_type() -> &'static str {
    if is_macos() {
        "fusion"
    } else {
        "ws"
    }
}

/// File name of an executable on this platform
pub fn executable(name: &str) -> String {
    if cfg!(windows) {
        format!("{}.exe", name)
    } else {
        name.to_string()
    }
}

/// Where the hypervisor binaries are installed when nothing else tells us
pub fn default_install_dir() -> PathBuf {
    if is_macos() {
        PathBuf::from("/Applications/VMware Fusion.app/Contents/Library")
    } else if cfg!(windows) {
        PathBuf::from(r"C:\Program Files (x86)\VMware\VMware Workstation")
    } else {
        PathBuf::from("/usr/bin")
    }
}

/// Directory holding the networking file and the per-vmnet configuration
pub fn default_vmnet_dir() -> PathBuf {
    if is_macos() {
        PathBuf::from("/Library/Preferences/VMware Fusion")
    } else if cfg!(windows) {
        PathBuf::from(r"C:\ProgramData\VMware")
    } else {
        PathBuf::from("/etc/vmware")
    }
}

/// Name of the network helper binary
pub fn network_helper() -> &'static str {
    if is_macos() {
        "vmnet-cli"
    } else {
        "vmware-networks"
    }
}

/// Binary printing the product name and version with `-v`
pub fn product_binary() -> &'static str {
    if is_macos() {
        "vmware-vmx"
    } else {
        "vmware"
    }
}

pub fn default_vm_folder() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(std::env::temp_dir);
    if is_macos() {
        home.join("Virtual Machines.localized")
    } else if cfg!(windows) {
        home.join("Documents").join("Virtual Machines")
    } else {
        home.join("vmware")
    }
}

/// Descriptor path of a VM named `name` stored in `folder`
pub fn vm_descriptor_path(folder: &Path, name: &str) -> PathBuf {
    let file = format!("{}.vmx", name);
    if is_macos() {
        folder.join(format!("{}.vmwarevm", name)).join(file)
    } else {
        folder.join(name).join(file)
    }
}

/// macOS 11 removed the kernel extensions Fusion used to manage virtual
/// networks, only vmrest can manage them there.
pub async fn requires_daemon_networking() -> bool {
    if !is_macos() {
        return false;
    }
    let output = match Tool::new("sw_vers", "/usr/bin/sw_vers")
        .run(&["-productVersion"])
        .await
    {
        Ok(output) if output.success() => output.stdout,
        Ok(output) => {
            warn!("sw_vers failed: {}", output.text());
            return false;
        }
        Err(e) => {
            warn!("Failed to determine macOS version: {}", e);
            return false;
        }
    };
    let major = parse_major(&output);
    debug!("Detected macOS major version {:?}", major);
    major.map(|major| major >= 11).unwrap_or(false)
}

fn parse_major(version: &str) -> Option<u32> {
    version.trim().split('.').next()?.parse().ok()
}
