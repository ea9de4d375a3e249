pub mod error_model;
pub use self::error_model::ErrorModel;
pub mod vm_id;
pub use self::vm_id::VmId;
pub mod vm_information;
pub use self::vm_information::{VmCpu, VmInformation};
pub mod vm_params;
pub use self::vm_params::ConfigVmParamsParameter;
pub mod vm_clone_parameter;
pub use self::vm_clone_parameter::VmCloneParameter;
pub mod vm_register_parameter;
pub use self::vm_register_parameter::VmRegisterParameter;
pub mod vm_ip_address;
pub use self::vm_ip_address::VmIpAddress;
pub mod nic_ip_stack;
pub use self::nic_ip_stack::{NicIpStack, NicIpStackAll};
pub mod nic_devices;
pub use self::nic_devices::{NicDevice, NicDeviceParameter, NicDevices};
pub mod network;
pub use self::network::{Network, Networks};
pub mod port_forward;
pub use self::port_forward::{PortForward, PortForwardGuest, PortForwardParameter, PortForwards};
pub mod mac_to_ip;
pub use self::mac_to_ip::MacToIp;
