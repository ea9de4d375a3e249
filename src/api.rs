//! # Hypervisor management API
//!
//! [VmwareApi] is the seam between the execution engine and whatever answers
//! inventory questions about virtual machines and virtual networks. Two
//! implementations exist:
//!
//! - [crate::vmrest::RestClient] talks to the vmrest daemon over HTTP
//! - [crate::engine::local::LocalApi] reads descriptor files and the
//!   hypervisor networking file directly, for hosts without the daemon
//!
//! Calls a backend cannot answer return [ApiError::Unsupported], the engine
//! then falls back to `vmrun` or to editing the descriptor itself.
use std::fmt;

use async_trait::async_trait;
use vmrest_models::models::{
    ConfigVmParamsParameter, Network, NicDevice, NicDeviceParameter, NicIpStackAll, Networks,
    PortForwardParameter, PortForwards, VmCloneParameter, VmId, VmInformation,
    VmRegisterParameter,
};

use crate::status::Status;

/// Error code used by vmrest when the guest has no address to report yet
pub const NO_ADDRESS_ERROR_CODE: i32 = 106;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("could not send request on uri {0}, reason: {1}")]
    Request(String, String),
    #[error("request on uri {0} timed out")]
    Timeout(String),
    #[error("failure encountered: {message}")]
    Vmware {
        status: u16,
        code: i32,
        message: String,
    },
    #[error("unexpected response status {0} on uri {1}")]
    Status(u16, String),
    #[error("could not serialize request, reason: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Local(String),
    #[error("vmrest daemon is unavailable: {0}")]
    Daemon(String),
}

impl ApiError {
    /// The guest did not report any address yet
    pub fn is_no_address(&self) -> bool {
        matches!(self, ApiError::Vmware { code, .. } if *code == NO_ADDRESS_ERROR_CODE)
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, ApiError::Unsupported(_))
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            ApiError::NotFound(_) => true,
            ApiError::Vmware { status, .. } | ApiError::Status(status, _) => *status == 404,
            _ => false,
        }
    }
}

impl From<ApiError> for Status {
    fn from(e: ApiError) -> Status {
        if e.is_not_found() {
            return Status::not_found(e.to_string());
        }
        match e {
            ApiError::Unsupported(_) => Status::unimplemented(e.to_string()),
            ApiError::Request(..) | ApiError::Timeout(_) | ApiError::Daemon(_) => {
                Status::unavailable(e.to_string())
            }
            _ => Status::internal(e.to_string()),
        }
    }
}

#[async_trait]
pub trait VmwareApi: Send + Sync + fmt::Debug {
    /// Registered virtual machines
    async fn vms(&self) -> ApiResult<Vec<VmId>>;

    async fn vm(&self, id: &str) -> ApiResult<VmInformation>;

    /// Raw descriptor parameter of a virtual machine
    async fn vm_param(&self, id: &str, name: &str) -> ApiResult<ConfigVmParamsParameter>;

    /// Guest address reported by the tools, `None` when there is none yet
    async fn ip_address(&self, id: &str) -> ApiResult<Option<String>>;

    /// Live IP stack of every card, `None` when the guest reports nothing
    async fn nic_ips(&self, id: &str) -> ApiResult<Option<NicIpStackAll>>;

    async fn nic_devices(&self, id: &str) -> ApiResult<Vec<NicDevice>>;

    async fn create_nic(&self, id: &str, nic: &NicDeviceParameter) -> ApiResult<NicDevice>;

    async fn update_nic(
        &self,
        id: &str,
        index: u32,
        nic: &NicDeviceParameter,
    ) -> ApiResult<NicDevice>;

    async fn clone_vm(&self, request: &VmCloneParameter) -> ApiResult<VmInformation>;

    async fn register_vm(&self, request: &VmRegisterParameter) -> ApiResult<VmId>;

    async fn delete_vm(&self, id: &str) -> ApiResult<()>;

    async fn networks(&self) -> ApiResult<Networks>;

    async fn create_network(&self, network: &Network) -> ApiResult<Network>;

    async fn port_forwards(&self, device: &str) -> ApiResult<PortForwards>;

    async fn set_port_forward(
        &self,
        device: &str,
        protocol: &str,
        port: u16,
        forward: &PortForwardParameter,
    ) -> ApiResult<()>;

    async fn delete_port_forward(&self, device: &str, protocol: &str, port: u16)
        -> ApiResult<()>;

    async fn set_mac_to_ip(&self, device: &str, mac: &str, ip: &str) -> ApiResult<()>;
}
