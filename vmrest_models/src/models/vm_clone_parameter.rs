/// VmCloneParameter : Body of the clone request, `parent_id` is the template id
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct VmCloneParameter {
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "parentId")]
    pub parent_id: String,
}

impl VmCloneParameter {
    pub fn new(name: String, parent_id: String) -> VmCloneParameter {
        VmCloneParameter { name, parent_id }
    }
}
