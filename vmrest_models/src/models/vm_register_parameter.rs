/// VmRegisterParameter : Registers an existing descriptor file under a name
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct VmRegisterParameter {
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "path")]
    pub path: String,
}

impl VmRegisterParameter {
    pub fn new(name: String, path: String) -> VmRegisterParameter {
        VmRegisterParameter { name, path }
    }
}
