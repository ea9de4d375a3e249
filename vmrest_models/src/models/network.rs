/// Network : A virtual network device (vmnet) known by the hypervisor
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Network {
    #[serde(rename = "name")]
    pub name: String,
    /// bridged, nat or hostOnly
    #[serde(rename = "type")]
    pub r#type: String,
    /// "true" or "false"
    #[serde(rename = "dhcp", default)]
    pub dhcp: String,
    #[serde(rename = "subnet", default, skip_serializing_if = "String::is_empty")]
    pub subnet: String,
    #[serde(rename = "mask", default, skip_serializing_if = "String::is_empty")]
    pub mask: String,
}

#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Networks {
    #[serde(rename = "num", default)]
    pub num: i32,
    #[serde(rename = "vmnets", default)]
    pub vmnets: Vec<Network>,
}
