//! HTTP client of the vmrest API. Every request signals activity to the
//! [Vmrest] supervisor first, which starts the daemon when needed.
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::Engine as _;
use hyper::{client::HttpConnector, Body, Client, Method, Request, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error, instrument, trace};
use vmrest_models::models::{
    ConfigVmParamsParameter, ErrorModel, MacToIp, Network, NicDevice, NicDeviceParameter,
    NicDevices, NicIpStackAll, Networks, PortForwardParameter, PortForwards, VmCloneParameter,
    VmId, VmInformation, VmIpAddress, VmRegisterParameter,
};

use super::Vmrest;
use crate::api::{ApiError, ApiResult, VmwareApi};

pub const CONTENT_TYPE: &str = "application/vnd.vmware.vmw.rest-v1+json";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

const USER_AGENT: &str = concat!("vmware-desktop-utility/", env!("CARGO_PKG_VERSION"), "/rust");
const CONNECT_ATTEMPTS: u32 = 4;
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// [VmwareApi] implementation backed by the vmrest daemon
#[derive(Debug, Clone)]
pub struct RestClient {
    vmrest: Arc<Vmrest>,
    client: Client<HttpConnector>,
    timeout: Duration,
}

impl RestClient {
    pub fn new(vmrest: Arc<Vmrest>) -> RestClient {
        RestClient {
            vmrest,
            client: Client::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Bound applied on every single request attempt
    pub fn with_timeout(self, timeout: Duration) -> RestClient {
        RestClient { timeout, ..self }
    }

    pub fn vmrest(&self) -> &Arc<Vmrest> {
        &self.vmrest
    }

    fn authorization(&self) -> String {
        let credentials = self.vmrest.credentials();
        let token = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", credentials.username, credentials.password));
        format!("Basic {}", token)
    }

    #[instrument(skip(self, body))]
    async fn send(&self, method: Method, path: &str, body: Option<Vec<u8>>) -> ApiResult<Vec<u8>> {
        let base = self
            .vmrest
            .active()
            .await
            .map_err(|e| ApiError::Daemon(e.to_string()))?;
        let url = format!(
            "{}/{}",
            base.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        debug!("Send {} request to {}", method, url);

        let mut attempt = 0;
        let response = loop {
            attempt += 1;
            let mut request = Request::builder()
                .method(method.clone())
                .uri(&url)
                .header("Accept", CONTENT_TYPE)
                .header("Authorization", self.authorization())
                .header("User-Agent", USER_AGENT);
            if body.is_some() {
                request = request.header("Content-Type", CONTENT_TYPE);
            }
            let request = request
                .body(body.clone().map(Body::from).unwrap_or_else(Body::empty))
                .map_err(|e| ApiError::Request(url.clone(), e.to_string()))?;

            match tokio::time::timeout(self.timeout, self.client.request(request)).await {
                Err(_) => return Err(ApiError::Timeout(url)),
                Ok(Ok(response)) => break response,
                Ok(Err(e)) if e.is_connect() && attempt < CONNECT_ATTEMPTS => {
                    let backoff = RETRY_BACKOFF * 2u32.pow(attempt - 1);
                    debug!("vmrest not reachable yet ({}), retrying in {:?}", e, backoff);
                    tokio::time::sleep(backoff).await;
                }
                Ok(Err(e)) => return Err(ApiError::Request(url, e.to_string())),
            }
        };

        let status = response.status();
        trace!("Response status: {}", status);
        let body = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|e| ApiError::Request(url.clone(), e.to_string()))?;

        if !status.is_success() {
            return Err(decode_error(status, &url, &body));
        }
        Ok(body.to_vec())
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> ApiResult<T> {
        let body = self.send(Method::GET, path, None).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn with_body<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> ApiResult<T> {
        let body = serde_json::to_vec(body)?;
        let response = self.send(method, path, Some(body)).await?;
        Ok(serde_json::from_slice(&response)?)
    }

    async fn with_body_no_content<B: Serialize + Sync>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> ApiResult<()> {
        let body = serde_json::to_vec(body)?;
        self.send(method, path, Some(body)).await?;
        Ok(())
    }
}

fn decode_error(status: StatusCode, url: &str, body: &[u8]) -> ApiError {
    match serde_json::from_slice::<ErrorModel>(body) {
        Ok(model) if !model.message.is_empty() => {
            error!("Request to vmrest failed [{}]: {}", url, model.message);
            ApiError::Vmware {
                status: status.as_u16(),
                code: model.code,
                message: model.message,
            }
        }
        _ => {
            error!(
                "Request to vmrest failed [{}]: {} {}",
                url,
                status,
                String::from_utf8_lossy(body)
            );
            ApiError::Status(status.as_u16(), url.to_string())
        }
    }
}

/// Guest has no address yet is an answer, not a failure
fn no_address<T>(result: ApiResult<T>) -> ApiResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_no_address() => Ok(None),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl VmwareApi for RestClient {
    async fn vms(&self) -> ApiResult<Vec<VmId>> {
        self.get("vms").await
    }

    async fn vm(&self, id: &str) -> ApiResult<VmInformation> {
        self.get(&format!("vms/{}", id)).await
    }

    async fn vm_param(&self, id: &str, name: &str) -> ApiResult<ConfigVmParamsParameter> {
        self.get(&format!("vms/{}/params/{}", id, name)).await
    }

    async fn ip_address(&self, id: &str) -> ApiResult<Option<String>> {
        let address = no_address(self.get::<VmIpAddress>(&format!("vms/{}/ip", id)).await)?;
        Ok(address.map(|a| a.ip).filter(|ip| !ip.is_empty()))
    }

    async fn nic_ips(&self, id: &str) -> ApiResult<Option<NicIpStackAll>> {
        no_address(self.get(&format!("vms/{}/nicips", id)).await)
    }

    async fn nic_devices(&self, id: &str) -> ApiResult<Vec<NicDevice>> {
        let devices: NicDevices = self.get(&format!("vms/{}/nic", id)).await?;
        Ok(devices.nics)
    }

    async fn create_nic(&self, id: &str, nic: &NicDeviceParameter) -> ApiResult<NicDevice> {
        self.with_body(Method::POST, &format!("vms/{}/nic", id), nic)
            .await
    }

    async fn update_nic(
        &self,
        id: &str,
        index: u32,
        nic: &NicDeviceParameter,
    ) -> ApiResult<NicDevice> {
        self.with_body(Method::PUT, &format!("vms/{}/nic/{}", id, index), nic)
            .await
    }

    async fn clone_vm(&self, request: &VmCloneParameter) -> ApiResult<VmInformation> {
        self.with_body(Method::POST, "vms", request).await
    }

    async fn register_vm(&self, request: &VmRegisterParameter) -> ApiResult<VmId> {
        self.with_body(Method::POST, "vms/registration", request)
            .await
    }

    async fn delete_vm(&self, id: &str) -> ApiResult<()> {
        self.send(Method::DELETE, &format!("vms/{}", id), None)
            .await?;
        Ok(())
    }

    async fn networks(&self) -> ApiResult<Networks> {
        self.get("vmnet").await
    }

    async fn create_network(&self, network: &Network) -> ApiResult<Network> {
        self.with_body(Method::POST, "vmnets", network).await
    }

    async fn port_forwards(&self, device: &str) -> ApiResult<PortForwards> {
        self.get(&format!("vmnet/{}/portforward", device)).await
    }

    async fn set_port_forward(
        &self,
        device: &str,
        protocol: &str,
        port: u16,
        forward: &PortForwardParameter,
    ) -> ApiResult<()> {
        let path = format!("vmnet/{}/portforward/{}/{}", device, protocol, port);
        self.with_body_no_content(Method::PUT, &path, forward).await
    }

    async fn delete_port_forward(
        &self,
        device: &str,
        protocol: &str,
        port: u16,
    ) -> ApiResult<()> {
        let path = format!("vmnet/{}/portforward/{}/{}", device, protocol, port);
        self.send(Method::DELETE, &path, None).await?;
        Ok(())
    }

    async fn set_mac_to_ip(&self, device: &str, mac: &str, ip: &str) -> ApiResult<()> {
        let path = format!("vmnet/{}/mactoip/{}", device, mac);
        let body = MacToIp { ip: ip.to_string() };
        self.with_body_no_content(Method::PUT, &path, &body).await
    }
}
