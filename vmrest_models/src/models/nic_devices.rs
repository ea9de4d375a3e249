#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct NicDevice {
    /// 1-based card index
    #[serde(rename = "index")]
    pub index: i32,
    /// bridged, nat, hostonly or custom
    #[serde(rename = "type")]
    pub r#type: String,
    #[serde(rename = "vmnet", default)]
    pub vmnet: String,
    #[serde(rename = "macAddress", default)]
    pub mac_address: String,
}

#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct NicDevices {
    #[serde(rename = "num", default)]
    pub num: i32,
    #[serde(rename = "nics", default)]
    pub nics: Vec<NicDevice>,
}

/// NicDeviceParameter : Body used to create or update a card
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct NicDeviceParameter {
    #[serde(rename = "type")]
    pub r#type: String,
    #[serde(rename = "vmnet", skip_serializing_if = "Option::is_none")]
    pub vmnet: Option<String>,
}

impl NicDeviceParameter {
    pub fn new(r#type: String) -> NicDeviceParameter {
        NicDeviceParameter {
            r#type,
            vmnet: None,
        }
    }
}
