//! # Hypervisor networking file
//!
//! VMware keeps the definition of its virtual networks in a `networking`
//! file made of `answer VNET_<n>_<KEY> <value>` lines:
//!
//! ```text
//! VERSION=1,0
//! answer VNET_1_DHCP yes
//! answer VNET_1_HOSTONLY_NETMASK 255.255.255.0
//! answer VNET_1_HOSTONLY_SUBNET 192.168.56.0
//! answer VNET_1_VIRTUAL_ADAPTER yes
//! answer VNET_8_NAT yes
//! add_bridge_mapping eth0 0
//! ```
//!
//! Lines which are not answers are kept untouched.
use std::{collections::BTreeMap, fs, path::Path};

use tracing::debug;

use super::Vmnet;
use crate::status::{Result, Status};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkingFile {
    /// Lines found before the first answer
    header: Vec<String>,
    /// Answers per vmnet slot
    answers: BTreeMap<u32, BTreeMap<String, String>>,
    /// Every other line, in order
    trailer: Vec<String>,
}

impl NetworkingFile {
    pub fn load(path: &Path) -> Result<NetworkingFile> {
        let content = fs::read_to_string(path).map_err(|e| {
            Status::failed_precondition(format!(
                "failed to read networking file {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(NetworkingFile::parse(&content))
    }

    pub fn parse(content: &str) -> NetworkingFile {
        let mut file = NetworkingFile::default();
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match parse_answer(trimmed) {
                Some((slot, key, value)) => {
                    file.answers.entry(slot).or_default().insert(key, value);
                }
                None if file.answers.is_empty() => file.header.push(trimmed.to_string()),
                None => file.trailer.push(trimmed.to_string()),
            }
        }
        file
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for line in &self.header {
            out.push_str(line);
            out.push('\n');
        }
        for (slot, answers) in &self.answers {
            for (key, value) in answers {
                out.push_str(&format!("answer VNET_{}_{} {}\n", slot, key, value));
            }
        }
        for line in &self.trailer {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        debug!("Saving networking file {}", path.display());
        fs::write(path, self.serialize()).map_err(|e| {
            Status::internal(format!(
                "failed to write networking file {}: {}",
                path.display(),
                e
            ))
        })
    }

    fn answer(&self, slot: u32, key: &str) -> Option<&str> {
        self.answers
            .get(&slot)
            .and_then(|answers| answers.get(key))
            .map(String::as_str)
    }

    fn has_bridge_mapping(&self, slot: u32) -> bool {
        let slot = slot.to_string();
        self.header.iter().chain(self.trailer.iter()).any(|line| {
            line.starts_with("add_bridge_mapping")
                && line.split_whitespace().last() == Some(slot.as_str())
        })
    }

    /// Virtual networks described by the file, bridged vmnet0 included
    pub fn vmnets(&self) -> Vec<Vmnet> {
        let mut slots: Vec<u32> = self.answers.keys().copied().collect();
        if !slots.contains(&0) {
            slots.insert(0, 0);
        }
        slots
            .into_iter()
            .map(|slot| {
                let kind = if self.answer(slot, "NAT").map(is_yes).unwrap_or(false) {
                    "nat"
                } else if slot == 0
                    || self.has_bridge_mapping(slot)
                    || self.answer(slot, "HOSTONLY_SUBNET").is_none()
                {
                    "bridged"
                } else {
                    "hostOnly"
                };
                Vmnet {
                    name: format!("vmnet{}", slot),
                    kind: kind.to_string(),
                    dhcp: self.answer(slot, "DHCP").map(is_yes).unwrap_or(false),
                    subnet: self.answer(slot, "HOSTONLY_SUBNET").unwrap_or_default().to_string(),
                    mask: self.answer(slot, "HOSTONLY_NETMASK").unwrap_or_default().to_string(),
                }
            })
            .collect()
    }

    /// Replace the answers of a NAT or host-only network
    pub fn set_vmnet(&mut self, vmnet: &Vmnet) -> Result<()> {
        let slot = vmnet_slot(&vmnet.name).ok_or_else(|| {
            Status::invalid_argument(format!("invalid virtual network name {}", vmnet.name))
        })?;
        if vmnet.kind.eq_ignore_ascii_case("bridged") || slot == 0 {
            return Err(Status::invalid_argument(
                "bridged networks are managed by the hypervisor",
            ));
        }
        let mut answers = BTreeMap::new();
        let yes_no = |value: bool| (if value { "yes" } else { "no" }).to_string();
        answers.insert("DHCP".to_string(), yes_no(vmnet.dhcp));
        if !vmnet.subnet.is_empty() {
            answers.insert("HOSTONLY_SUBNET".to_string(), vmnet.subnet.clone());
        }
        if !vmnet.mask.is_empty() {
            answers.insert("HOSTONLY_NETMASK".to_string(), vmnet.mask.clone());
        }
        if vmnet.kind.eq_ignore_ascii_case("nat") {
            answers.insert("NAT".to_string(), yes_no(true));
        }
        answers.insert("VIRTUAL_ADAPTER".to_string(), yes_no(true));
        self.answers.insert(slot, answers);
        Ok(())
    }

    pub fn remove_vmnet(&mut self, name: &str) -> Result<()> {
        let slot = vmnet_slot(name)
            .ok_or_else(|| Status::invalid_argument(format!("invalid virtual network name {}", name)))?;
        self.answers
            .remove(&slot)
            .map(|_| ())
            .ok_or_else(|| Status::not_found(format!("virtual network {} not found", name)))
    }
}

fn is_yes(value: &str) -> bool {
    value.eq_ignore_ascii_case("yes")
}

/// `answer VNET_8_HOSTONLY_SUBNET 172.16.1.0` -> (8, HOSTONLY_SUBNET, 172.16.1.0)
fn parse_answer(line: &str) -> Option<(u32, String, String)> {
    let mut parts = line.splitn(3, char::is_whitespace);
    if parts.next()? != "answer" {
        return None;
    }
    let name = parts.next()?.strip_prefix("VNET_")?;
    let value = parts.next().unwrap_or_default().trim().to_string();
    let (slot, key) = name.split_once('_')?;
    Some((slot.parse().ok()?, key.to_string(), value))
}

/// Slot number of a `vmnet<n>` device name
pub fn vmnet_slot(name: &str) -> Option<u32> {
    let lower = name.to_lowercase();
    lower.strip_prefix("vmnet")?.parse().ok()
}

/// Smallest unused slot, starting at 1 since vmnet0 is the bridged network
pub fn free_slot<'a, I>(names: I) -> u32
where
    I: IntoIterator<Item = &'a str>,
{
    let mut used: Vec<u32> = names.into_iter().filter_map(vmnet_slot).collect();
    used.sort_unstable();
    used.dedup();
    (1..)
        .find(|slot| used.binary_search(slot).is_err())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    const NETWORKING: &str = "VERSION=1,0
answer VNET_1_DHCP yes
answer VNET_1_HOSTONLY_NETMASK 255.255.255.0
answer VNET_1_HOSTONLY_SUBNET 192.168.56.0
answer VNET_1_VIRTUAL_ADAPTER yes
answer VNET_8_DHCP yes
answer VNET_8_HOSTONLY_NETMASK 255.255.255.0
answer VNET_8_HOSTONLY_SUBNET 172.16.128.0
answer VNET_8_NAT yes
answer VNET_8_VIRTUAL_ADAPTER yes
add_bridge_mapping eth0 0
";

    #[test]
    fn reads_vmnets() {
        let file = NetworkingFile::parse(NETWORKING);
        let vmnets = file.vmnets();
        assert_eq!(
            vmnets.iter().map(|v| (v.name.as_str(), v.kind.as_str())).collect::<Vec<_>>(),
            vec![("vmnet0", "bridged"), ("vmnet1", "hostOnly"), ("vmnet8", "nat")]
        );
        assert!(vmnets[2].dhcp);
        assert_eq!(vmnets[2].subnet, "172.16.128.0");
        assert_eq!(vmnets[1].mask, "255.255.255.0");
    }

    #[test]
    fn serialize_keeps_other_lines() {
        let file = NetworkingFile::parse(NETWORKING);
        assert_eq!(file.serialize(), NETWORKING);
    }

    #[test]
    fn add_and_remove() {
        let mut file = NetworkingFile::parse(NETWORKING);
        let vmnet = Vmnet {
            name: "vmnet2".to_string(),
            kind: "hostOnly".to_string(),
            dhcp: false,
            subnet: "10.10.0.0".to_string(),
            mask: "255.255.0.0".to_string(),
        };
        file.set_vmnet(&vmnet).unwrap();
        let reloaded = NetworkingFile::parse(&file.serialize());
        assert_eq!(reloaded.vmnets()[2], vmnet);

        file.remove_vmnet("vmnet2").unwrap();
        assert_eq!(file.vmnets().len(), 3);
        assert!(file.remove_vmnet("vmnet2").is_err());

        let bridged = Vmnet {
            name: "vmnet3".to_string(),
            kind: "bridged".to_string(),
            ..Default::default()
        };
        assert!(file.set_vmnet(&bridged).is_err());
    }

    #[test]
    fn slots() {
        assert_eq!(vmnet_slot("vmnet8"), Some(8));
        assert_eq!(vmnet_slot("VMnet12"), Some(12));
        assert_eq!(vmnet_slot("en0"), None);
        assert_eq!(free_slot(["vmnet0", "vmnet1", "vmnet8"]), 2);
        assert_eq!(free_slot(["vmnet0", "vmnet2"]), 1);
        assert_eq!(free_slot(Vec::<&str>::new()), 1);
    }
}
