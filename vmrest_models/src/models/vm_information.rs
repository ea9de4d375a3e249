#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct VmCpu {
    #[serde(rename = "processors")]
    pub processors: i32,
}

/// VmInformation : Hardware settings of a virtual machine
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct VmInformation {
    #[serde(rename = "id")]
    pub id: String,
    #[serde(rename = "cpu")]
    pub cpu: VmCpu,
    /// Memory size in megabytes
    #[serde(rename = "memory")]
    pub memory: i32,
}

impl VmInformation {
    pub fn new(id: String, processors: i32, memory: i32) -> VmInformation {
        VmInformation {
            id,
            cpu: VmCpu { processors },
            memory,
        }
    }
}
