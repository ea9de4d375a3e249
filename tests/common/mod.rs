#![allow(dead_code)]

pub mod daemon;

use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use tempfile::TempDir;
use vmware_desktop_utility::{
    builder::{Builder, Configuration, VmwarePaths, VmwarePathsBuilder},
    driver::Driver,
    engine::local::LocalApi,
    lifecycle::Lifecycle,
};

/// Stands in for `vmrun`. Invocations are appended to `calls` and the running
/// VMs are kept in `running`. `tools` overrides the tools state and
/// `list_fails` makes listing fail.
const VMRUN: &str = r#"#!/bin/sh
STATE="@STATE@"
echo "$@" >> "$STATE/calls"
shift 2
cmd="$1"
shift
touch "$STATE/running"
case "$cmd" in
  list)
    if [ -f "$STATE/list_fails" ]; then
      echo "Error: Unable to connect to host"
      exit 255
    fi
    echo "Total running VMs: $(grep -c . "$STATE/running")"
    cat "$STATE/running"
    ;;
  start)
    echo "$1" >> "$STATE/running"
    ;;
  stop)
    grep -v -x -F "$1" "$STATE/running" > "$STATE/running.tmp"
    mv "$STATE/running.tmp" "$STATE/running"
    ;;
  clone)
    mkdir -p "$(dirname "$2")"
    cp "$1" "$2"
    for disk in "$(dirname "$1")"/*.vmdk; do
      [ -e "$disk" ] && cp "$disk" "$(dirname "$2")/"
    done
    ;;
  deleteVM)
    rm -rf "$(dirname "$1")"
    ;;
  checkToolsState)
    if [ -f "$STATE/tools" ]; then cat "$STATE/tools"; else echo "unknown"; fi
    ;;
  getGuestIPAddress)
    echo "Error: The VMware Tools are not running in the virtual machine: $1"
    exit 255
    ;;
  *)
    echo "Error: Unrecognized command: $cmd"
    exit 255
    ;;
esac
"#;

const RECORDER: &str = r#"#!/bin/sh
echo "@NAME@ $@" >> "@STATE@/calls"
"#;

const PRODUCT: &str = r#"#!/bin/sh
echo "VMware Workstation 17.0.2 build-21581411"
"#;

pub const NETWORKING: &str = "VERSION=1,0
answer VNET_1_DHCP yes
answer VNET_1_HOSTONLY_NETMASK 255.255.255.0
answer VNET_1_HOSTONLY_SUBNET 192.168.56.0
answer VNET_1_VIRTUAL_ADAPTER yes
answer VNET_8_DHCP yes
answer VNET_8_HOSTONLY_NETMASK 255.255.255.0
answer VNET_8_HOSTONLY_SUBNET 172.16.10.0
answer VNET_8_NAT yes
answer VNET_8_VIRTUAL_ADAPTER yes
";

pub const NAT_CONF: &str = "[host]
ip = 172.16.10.2
netmask = 255.255.255.0

[incomingtcp]

[incomingudp]
";

pub const TEMPLATE: &str = r#".encoding = "UTF-8"
config.version = "8"
displayName = "base"
vmname = "base"
numvcpus = "1"
memsize = "1024"
instance-id = "base-instance"
guestinfo.metadata = "stale"
scsi0.present = "TRUE"
scsi0:0.present = "TRUE"
scsi0:0.fileName = "base.vmdk"
ethernet0.present = "TRUE"
ethernet0.connectionType = "nat"
ethernet0.virtualDev = "e1000e"
ethernet0.addressType = "generated"
"#;

#[derive(Debug)]
pub struct Fixture {
    pub dir: TempDir,
    pub state: PathBuf,
    pub vm_folder: PathBuf,
    pub settings_dir: PathBuf,
    pub paths: VmwarePaths,
    pub template: PathBuf,
    pub lifecycle: Lifecycle,
}

fn script(path: &Path, content: &str) {
    fs::write(path, content).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

impl Fixture {
    pub fn new() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state");
        let bin = dir.path().join("bin");
        let vm_folder = dir.path().join("vms");
        let vmnet_dir = dir.path().join("vmware");
        for d in [&state, &bin, &vm_folder, &vmnet_dir] {
            fs::create_dir_all(d).unwrap();
        }
        let state_str = state.to_string_lossy().into_owned();

        script(&bin.join("vmrun"), &VMRUN.replace("@STATE@", &state_str));
        for name in ["vmware-vdiskmanager", "network-helper"] {
            script(
                &bin.join(name),
                &RECORDER.replace("@STATE@", &state_str).replace("@NAME@", name),
            );
        }
        script(&bin.join("vmware"), PRODUCT);

        let paths = VmwarePathsBuilder::new()
            .with_vmrun(bin.join("vmrun"))
            .with_vdiskmanager(bin.join("vmware-vdiskmanager"))
            .with_network_helper(bin.join("network-helper"))
            .with_product(bin.join("vmware"))
            .with_vmrest(bin.join("vmrest"))
            .with_vmnet_dir(vmnet_dir.clone())
            .with_networking(vmnet_dir.join("networking"))
            .try_build()
            .unwrap();
        fs::write(&paths.networking, NETWORKING).unwrap();
        let nat_conf = paths.nat_conf("vmnet8");
        fs::create_dir_all(nat_conf.parent().unwrap()).unwrap();
        fs::write(&nat_conf, NAT_CONF).unwrap();
        for device in ["vmnet1", "vmnet8"] {
            fs::create_dir_all(paths.dhcpd_conf(device).parent().unwrap()).unwrap();
        }

        let template_dir = vm_folder.join("base");
        fs::create_dir_all(&template_dir).unwrap();
        let template = template_dir.join("base.vmx");
        fs::write(&template, TEMPLATE).unwrap();
        fs::write(template_dir.join("base.vmdk"), "disk").unwrap();

        Fixture {
            settings_dir: dir.path().join("settings"),
            dir,
            state,
            vm_folder,
            paths,
            template,
            lifecycle: Lifecycle::new(),
        }
    }

    pub fn config(&self, driver: &str) -> Configuration {
        Configuration::new()
            .with_driver(driver.to_string())
            .with_vm_folder(self.vm_folder.clone())
            .with_settings_dir(self.settings_dir.clone())
            .with_paths(self.paths.clone())
    }

    pub async fn driver(&self) -> Driver {
        Driver::new(&self.lifecycle, self.config("advanced"))
            .await
            .unwrap()
    }

    pub fn template_uuid(&self) -> String {
        LocalApi::id_for(&self.template)
    }

    /// Every recorded tool invocation, in order
    pub fn calls(&self) -> Vec<String> {
        fs::read_to_string(self.state.join("calls"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn calls_to(&self, command: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.split_whitespace().any(|word| word == command))
            .collect()
    }

    pub fn set_tools_state(&self, state: &str) {
        fs::write(self.state.join("tools"), state).unwrap();
    }

    /// Mark `path` as running without going through the driver
    pub fn start_out_of_band(&self, path: &Path) {
        let running = self.state.join("running");
        let mut content = fs::read_to_string(&running).unwrap_or_default();
        content.push_str(&format!("{}\n", path.display()));
        fs::write(running, content).unwrap();
    }

    pub fn fail_listing(&self, fail: bool) {
        let marker = self.state.join("list_fails");
        if fail {
            fs::write(marker, "").unwrap();
        } else {
            let _ = fs::remove_file(marker);
        }
    }
}
