/// VmId : Identifier and descriptor path of a registered virtual machine
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct VmId {
    #[serde(rename = "id")]
    pub id: String,
    #[serde(rename = "path")]
    pub path: String,
}

impl VmId {
    pub fn new(id: String, path: String) -> VmId {
        VmId { id, path }
    }
}
