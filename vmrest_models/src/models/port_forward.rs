#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct PortForwardGuest {
    #[serde(rename = "ip")]
    pub ip: String,
    #[serde(rename = "port")]
    pub port: u16,
}

/// PortForward : A NAT rule forwarding a host port to a guest endpoint
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct PortForward {
    #[serde(rename = "port")]
    pub port: u16,
    #[serde(rename = "protocol")]
    pub protocol: String,
    #[serde(rename = "desc", default)]
    pub desc: String,
    #[serde(rename = "guest")]
    pub guest: PortForwardGuest,
}

#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct PortForwards {
    #[serde(rename = "num", default)]
    pub num: i32,
    #[serde(rename = "port_forwardings", default)]
    pub port_forwardings: Vec<PortForward>,
}

/// PortForwardParameter : Body of a port forward update
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct PortForwardParameter {
    #[serde(rename = "guestIp")]
    pub guest_ip: String,
    #[serde(rename = "guestPort")]
    pub guest_port: u16,
    #[serde(rename = "desc")]
    pub desc: String,
}
