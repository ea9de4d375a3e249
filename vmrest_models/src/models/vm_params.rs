/// ConfigVmParamsParameter : A single descriptor parameter of a virtual machine
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct ConfigVmParamsParameter {
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "value", default)]
    pub value: String,
}

impl ConfigVmParamsParameter {
    pub fn new(name: String, value: String) -> ConfigVmParamsParameter {
        ConfigVmParamsParameter { name, value }
    }
}
