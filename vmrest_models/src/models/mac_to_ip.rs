/// MacToIp : DHCP reservation of an address for a MAC address
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct MacToIp {
    #[serde(rename = "IP")]
    pub ip: String,
}
