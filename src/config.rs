//! Runtime configuration.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use url::Url;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,

    /// The storage backend providing data-locality placement decisions.
    #[serde(default)]
    pub backend: BackendProvider,

    /// The URL of the Quobyte API endpoint, scheme and host included.
    #[serde(default = "Config::default_api_url")]
    pub quobyte_api_url: String,
    /// The user for the Quobyte API.
    #[serde(default = "Config::default_api_user")]
    pub quobyte_api_user: String,
    /// The password for the Quobyte API.
    #[serde(default = "Config::default_api_password")]
    pub quobyte_api_password: String,
    /// The local mountpoint under which Quobyte volumes appear on this host.
    #[serde(default = "Config::default_mountpoint")]
    pub quobyte_mountpoint: String,
    /// The namespace in which the Quobyte data pods run.
    #[serde(default = "Config::default_namespace")]
    pub quobyte_namespace: String,
    /// Whether the storage system itself runs as pods inside this cluster.
    ///
    /// When set, device hosts resolved from the storage API are pod IPs and are remapped
    /// to the addresses of the nodes backing those pods.
    #[serde(default)]
    pub in_cluster: bool,

    /// The interval in seconds at which still-unscheduled pods are re-scanned.
    #[serde(default = "Config::default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

/// The set of supported storage backends.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendProvider {
    Quobyte,
}

impl Default for BackendProvider {
    fn default() -> Self {
        Self::Quobyte
    }
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the application
    /// config from that. In the future, this may take into account an optional config file as
    /// well.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        validate_api_url(&config.quobyte_api_url).context("error validating QUOBYTE_API_URL")?;
        Ok(config)
    }

    fn default_api_url() -> String {
        "http://localhost:7860".into()
    }

    fn default_api_user() -> String {
        "admin".into()
    }

    fn default_api_password() -> String {
        "quobyte".into()
    }

    fn default_mountpoint() -> String {
        "/var/lib/kubelet/plugins/kubernetes.io~quobyte".into()
    }

    fn default_namespace() -> String {
        "quobyte".into()
    }

    fn default_sweep_interval() -> u64 {
        30
    }
}

/// Validate that the given API URL carries an http(s) scheme and a host.
pub fn validate_api_url(raw: &str) -> Result<()> {
    // NOTE: `Url::parse` treats `localhost:7860` as scheme `localhost` with no host,
    // so both checks below are needed to reject scheme-less input.
    let url = Url::parse(raw).with_context(|| format!("error parsing API URL: {}", raw))?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!("scheme is missing or not http(s) in API URL: {}", raw);
    }
    if url.host_str().map(str::is_empty).unwrap_or(true) {
        bail!("host is not set in API URL: {}", raw);
    }
    Ok(())
}
