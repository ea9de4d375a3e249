//! NAT and DHCP configuration files of a virtual network device.
//!
//! `nat.conf` is an ini-like file, incoming port forwards live in the
//! `[incomingtcp]` and `[incomingudp]` sections as `<host port> = <ip>:<port>`.
//! `dhcpd.conf` is an ISC dhcpd configuration, reservations are `host` blocks
//! appended after the generated part.
use std::{fs, io, path::Path};

use tracing::debug;

use super::PortFwd;
use crate::status::{Result, Status};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NatConf {
    lines: Vec<String>,
}

fn section_for(protocol: &str) -> Result<String> {
    match protocol.to_lowercase().as_str() {
        "tcp" => Ok("incomingtcp".to_string()),
        "udp" => Ok("incomingudp".to_string()),
        other => Err(Status::invalid_argument(format!(
            "unsupported port forward protocol {}",
            other
        ))),
    }
}

fn section_name(line: &str) -> Option<String> {
    let line = line.trim();
    line.strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .map(|name| name.trim().to_lowercase())
}

/// `8080 = 172.16.10.5:80` -> (8080, 172.16.10.5, 80)
fn parse_forward(line: &str) -> Option<(u16, String, u16)> {
    let line = line.trim();
    if line.starts_with('#') || line.starts_with(';') {
        return None;
    }
    let (port, target) = line.split_once('=')?;
    let (ip, guest_port) = target.trim().rsplit_once(':')?;
    Some((
        port.trim().parse().ok()?,
        ip.trim().to_string(),
        guest_port.trim().parse().ok()?,
    ))
}

impl NatConf {
    pub fn load(path: &Path) -> Result<NatConf> {
        let content = fs::read_to_string(path).map_err(|e| {
            let message = format!("failed to read NAT configuration {}: {}", path.display(), e);
            match e.kind() {
                io::ErrorKind::NotFound => Status::not_found(message),
                _ => Status::failed_precondition(message),
            }
        })?;
        Ok(NatConf::parse(&content))
    }

    pub fn parse(content: &str) -> NatConf {
        NatConf {
            lines: content.lines().map(str::to_string).collect(),
        }
    }

    pub fn serialize(&self) -> String {
        let mut out = self.lines.join("\n");
        out.push('\n');
        out
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        debug!("Saving NAT configuration {}", path.display());
        fs::write(path, self.serialize()).map_err(|e| {
            Status::internal(format!(
                "failed to write NAT configuration {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Forwards of both incoming sections, descriptions are left empty
    pub fn forwards(&self, slot_number: u32) -> Vec<PortFwd> {
        let mut section = String::new();
        let mut forwards = Vec::new();
        for line in &self.lines {
            if let Some(name) = section_name(line) {
                section = name;
                continue;
            }
            let protocol = match section.as_str() {
                "incomingtcp" => "tcp",
                "incomingudp" => "udp",
                _ => continue,
            };
            if let Some((port, guest_ip, guest_port)) = parse_forward(line) {
                forwards.push(PortFwd {
                    port,
                    protocol: protocol.to_string(),
                    description: String::new(),
                    slot_number,
                    guest_ip,
                    guest_port,
                });
            }
        }
        forwards
    }

    /// Index range of the lines belonging to `section`, header excluded
    fn section_range(&self, section: &str) -> Option<(usize, usize)> {
        let start = self
            .lines
            .iter()
            .position(|line| section_name(line).as_deref() == Some(section))?;
        let end = self.lines[start + 1..]
            .iter()
            .position(|line| section_name(line).is_some())
            .map(|offset| start + 1 + offset)
            .unwrap_or(self.lines.len());
        Some((start + 1, end))
    }

    pub fn set_forward(&mut self, forward: &PortFwd) -> Result<()> {
        let section = section_for(&forward.protocol)?;
        self.remove_forward(&forward.protocol, forward.port)?;
        let line = format!("{} = {}:{}", forward.port, forward.guest_ip, forward.guest_port);
        match self.section_range(&section) {
            Some((_, end)) => self.lines.insert(end, line),
            None => {
                self.lines.push(format!("[{}]", section));
                self.lines.push(line);
            }
        }
        Ok(())
    }

    /// Remove the forward of a host port, returns whether one existed
    pub fn remove_forward(&mut self, protocol: &str, port: u16) -> Result<bool> {
        let section = section_for(protocol)?;
        let Some((start, end)) = self.section_range(&section) else {
            return Ok(false);
        };
        let found = (start..end).find(|&i| {
            parse_forward(&self.lines[i])
                .map(|(host_port, _, _)| host_port == port)
                .unwrap_or(false)
        });
        Ok(found.map(|i| self.lines.remove(i)).is_some())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DhcpdConf {
    lines: Vec<String>,
}

impl DhcpdConf {
    /// Load the file, a missing one starts empty
    pub fn load(path: &Path) -> Result<DhcpdConf> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(DhcpdConf::parse(&content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(DhcpdConf::default()),
            Err(e) => Err(Status::failed_precondition(format!(
                "failed to read DHCP configuration {}: {}",
                path.display(),
                e
            ))),
        }
    }

    pub fn parse(content: &str) -> DhcpdConf {
        DhcpdConf {
            lines: content.lines().map(str::to_string).collect(),
        }
    }

    pub fn serialize(&self) -> String {
        let mut out = self.lines.join("\n");
        out.push('\n');
        out
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        debug!("Saving DHCP configuration {}", path.display());
        fs::write(path, self.serialize()).map_err(|e| {
            Status::internal(format!(
                "failed to write DHCP configuration {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Reserved addresses as (mac, ip)
    pub fn reservations(&self) -> Vec<(String, String)> {
        let mut found = Vec::new();
        let mut mac = None;
        let mut ip = None;
        for line in &self.lines {
            let line = line.trim().trim_end_matches(';');
            if line.starts_with("host ") {
                mac = None;
                ip = None;
            } else if let Some(value) = line.strip_prefix("hardware ethernet") {
                mac = Some(value.trim().to_lowercase());
            } else if let Some(value) = line.strip_prefix("fixed-address") {
                ip = Some(value.trim().to_string());
            } else if line == "}" {
                if let (Some(mac), Some(ip)) = (mac.take(), ip.take()) {
                    found.push((mac, ip));
                }
            }
        }
        found
    }

    /// Reserve `ip` for `mac`, replacing any previous reservation of `mac`
    pub fn reserve(&mut self, device: &str, mac: &str, ip: &str) {
        let mac = mac.to_lowercase();
        self.release(&mac);
        let name = format!("{}-{}", device, mac.replace(':', ""));
        self.lines.push(format!("host {} {{", name));
        self.lines.push(format!("    hardware ethernet {};", mac));
        self.lines.push(format!("    fixed-address {};", ip));
        self.lines.push("}".to_string());
    }

    /// Drop the host block reserving an address for `mac`
    pub fn release(&mut self, mac: &str) -> bool {
        let needle = format!("hardware ethernet {};", mac.to_lowercase());
        let mut kept = Vec::with_capacity(self.lines.len());
        let mut block: Option<Vec<String>> = None;
        let mut released = false;
        for line in self.lines.drain(..) {
            let trimmed = line.trim().to_string();
            match block.as_mut() {
                None if trimmed.starts_with("host ") && trimmed.ends_with('{') => {
                    block = Some(vec![line]);
                }
                None => kept.push(line),
                Some(current) => {
                    current.push(line);
                    if trimmed == "}" {
                        let lines = block.take().unwrap_or_default();
                        if lines.iter().any(|l| l.trim().to_lowercase() == needle) {
                            released = true;
                        } else {
                            kept.extend(lines);
                        }
                    }
                }
            }
        }
        if let Some(lines) = block {
            kept.extend(lines);
        }
        self.lines = kept;
        released
    }
}
