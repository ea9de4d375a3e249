//! Ethernet card blocks of a descriptor: writing a requested card and
//! reading back what is configured, merged with the live IP stack.
use std::net::Ipv4Addr;

use vmrest_models::models::NicIpStack;

use super::{EthernetCard, NetworkInterface};
use crate::{
    platform,
    status::{Result, Status},
    vmx::{bool_to_str, VmxMap},
};

/// PCI slots given to ethernet0..ethernet4
pub const PCI_SLOT_NUMBERS: [&str; 5] = ["160", "192", "161", "193", "225"];

pub const MAX_CARDS: usize = PCI_SLOT_NUMBERS.len();

/// MAC address value asking VMware to generate one
pub const GENERATED_MAC: &str = "generated";

pub const DEFAULT_DEVICE: &str = "e1000e";

/// Write the block of card `index` from a request
pub fn prepare_ethernet(vmx: &mut VmxMap, index: usize, nic: &NetworkInterface) -> Result<()> {
    let Some(slot) = PCI_SLOT_NUMBERS.get(index) else {
        return Err(Status::invalid_argument(format!(
            "too many network interfaces, at most {} are supported",
            MAX_CARDS
        )));
    };
    let key = |name: &str| format!("ethernet{}.{}", index, name);

    let device = if nic.device.is_empty() {
        DEFAULT_DEVICE
    } else {
        nic.device.as_str()
    };
    vmx.set(&key("present"), bool_to_str(true));
    vmx.set(&key("virtualDev"), device);
    vmx.set(&key("connectionType"), nic.connection_type.as_str());
    vmx.set(&key("linkStatePropagation.enable"), bool_to_str(true));
    vmx.set(&key("pciSlotNumber"), *slot);

    if platform::is_macos() {
        if !nic.bsd_name.is_empty() {
            vmx.set(&key("bsdName"), nic.bsd_name.as_str());
        }
        if !nic.display_name.is_empty() {
            vmx.set(&key("displayName"), nic.display_name.as_str());
        }
    }

    if nic.connection_type == "custom" {
        if nic.vnet.is_empty() {
            return Err(Status::invalid_argument(
                "custom network interfaces require a virtual network",
            ));
        }
        let vnet = if cfg!(target_os = "linux") {
            format!("/dev/{}", nic.vnet)
        } else {
            nic.vnet.clone()
        };
        vmx.set(&key("vnet"), vnet);
    }

    vmx.delete(&key("generatedAddress"));
    vmx.delete(&key("generatedAddressOffset"));
    if nic.mac_address.is_empty() || nic.mac_address == GENERATED_MAC {
        vmx.set(&key("addressType"), "generated");
        vmx.delete(&key("address"));
    } else {
        vmx.set(&key("addressType"), "static");
        vmx.set(&key("address"), nic.mac_address.as_str());
    }
    Ok(())
}

/// Descriptor connection type of a card attached to `vnet`, a network of
/// `network_type`. Bridged networks other than `vmnet0` are only reachable
/// as custom connections.
pub fn connection_type_for(vnet: &str, network_type: &str) -> String {
    let kind = network_type.to_lowercase();
    if kind == "bridged" && vnet != "vmnet0" {
        "custom".to_string()
    } else {
        kind
    }
}

/// First card index without a present block
pub fn free_ethernet_slot(vmx: &VmxMap) -> usize {
    (0usize..)
        .find(|i| !vmx.get_bool(&format!("ethernet{}.present", i)))
        .unwrap_or(0)
}

/// Every card declared in the descriptor, in order
pub fn read_cards(vmx: &VmxMap, stack: &[NicIpStack]) -> Vec<EthernetCard> {
    let mut cards = Vec::new();
    for index in 0u32.. {
        let key = |name: &str| format!("ethernet{}.{}", index, name);
        if !vmx.has(&key("present")) {
            break;
        }
        let value = |name: &str| vmx.get(&key(name)).unwrap_or_default().to_string();
        let address_type = value("addressType").to_lowercase();
        let mac_address = if address_type == "generated" {
            value("generatedAddress")
        } else {
            value("address")
        };
        let ip4_address = stack
            .iter()
            .find(|nic| !mac_address.is_empty() && nic.mac.eq_ignore_ascii_case(&mac_address))
            .and_then(|nic| first_ipv4(&nic.ip));

        cards.push(EthernetCard {
            index,
            present: vmx.get_bool(&key("present")),
            address_type,
            mac_address,
            mac_address_offset: value("generatedAddressOffset").parse().unwrap_or(0),
            connection_type: value("connectionType"),
            virtual_dev: value("virtualDev"),
            vnet: value("vnet"),
            bsd_name: value("bsdName"),
            display_name: value("displayName"),
            link_state_propagation: vmx.get_bool(&key("linkStatePropagation.enable")),
            pci_slot_number: value("pciSlotNumber").parse().unwrap_or(-1),
            ip4_address,
        });
    }
    cards
}

/// First IPv4 address out of a list of CIDR or plain addresses
fn first_ipv4(addresses: &[String]) -> Option<String> {
    addresses.iter().find_map(|address| {
        let ip = address.split('/').next()?;
        ip.parse::<Ipv4Addr>().ok().map(|ip| ip.to_string())
    })
}
