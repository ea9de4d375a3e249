#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct NicIpStack {
    #[serde(rename = "mac")]
    pub mac: String,
    /// Addresses bound to the card, in CIDR notation
    #[serde(rename = "ip", default)]
    pub ip: Vec<String>,
}

/// NicIpStackAll : Live IP stack of every card of a powered virtual machine
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct NicIpStackAll {
    #[serde(rename = "nics", default)]
    pub nics: Vec<NicIpStack>,
}
