//! Quobyte JSON-RPC API client.
//!
//! Only the single operation the scheduler needs is exposed: resolving a batch of device
//! IDs to their network endpoints and detected disk types. Unknown IDs are simply absent
//! from the response, which callers must tolerate.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

/// The timeout applied to every API request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A client for the Quobyte management API.
#[derive(Clone)]
pub struct QuobyteApi {
    http: reqwest::Client,
    endpoint: Url,
    user: String,
    password: String,
}

impl QuobyteApi {
    /// Create a new instance.
    pub fn new(endpoint: &str, user: &str, password: &str) -> Result<Self> {
        let endpoint = Url::parse(endpoint).context("error parsing Quobyte API endpoint")?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("error building Quobyte API HTTP client")?;
        Ok(Self {
            http,
            endpoint,
            user: user.into(),
            password: password.into(),
        })
    }

    /// Resolve the given device IDs to their endpoints, filtered by content type.
    ///
    /// This is one batched call for the full ID list. Devices unknown to the API are
    /// absent from the returned list.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_device_list(&self, device_ids: &[u64], content_types: &[&str]) -> Result<Vec<DeviceEntry>> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            method: "getDeviceList",
            params: DeviceListParams {
                device_id: device_ids,
                filter_by_content_type: content_types,
            },
            id: "0",
        };
        let response = self
            .http
            .post(self.endpoint.clone())
            .basic_auth(&self.user, Some(&self.password))
            .json(&request)
            .send()
            .await
            .context("error sending getDeviceList request")?
            .error_for_status()
            .context("getDeviceList request rejected")?
            .json::<RpcResponse<DeviceListResult>>()
            .await
            .context("error decoding getDeviceList response")?;
        if let Some(err) = response.error {
            bail!("getDeviceList API error {}: {}", err.code, err.message);
        }
        Ok(response
            .result
            .map(|result| result.device_list.devices)
            .unwrap_or_default())
    }
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a, P> {
    jsonrpc: &'a str,
    method: &'a str,
    params: P,
    id: &'a str,
}

#[derive(Debug, Serialize)]
struct DeviceListParams<'a> {
    device_id: &'a [u64],
    filter_by_content_type: &'a [&'a str],
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct DeviceListResult {
    #[serde(default)]
    device_list: DeviceList,
}

#[derive(Debug, Default, Deserialize)]
struct DeviceList {
    #[serde(default)]
    devices: Vec<DeviceEntry>,
}

/// One resolved device from the API.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct DeviceEntry {
    #[serde(default)]
    pub device_id: u64,
    #[serde(default)]
    pub host_name: String,
    #[serde(default)]
    pub detected_disk_type: String,
}
