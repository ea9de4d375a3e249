/// VmIpAddress : Guest address as reported by the VMware Tools
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct VmIpAddress {
    #[serde(rename = "ip", default)]
    pub ip: String,
}
