//! Configuration management for global settings and the on-disk state layout

use crate::config_builder::resolve_endpoint;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Current config version for migration support
pub const CONFIG_VERSION: u32 = 1;

/// Placeholder in data-plane arguments replaced by the server document path
pub const CONFIG_PLACEHOLDER: &str = "{config}";

/// Global configuration for the manager, immutable once loaded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    pub version: u32,
    pub state: StateSection,
    pub server: ServerSection,
    pub tls: TlsSection,
    pub client: ClientSection,
    pub data_plane: DataPlaneSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSection {
    /// Root directory holding clients, documents, and TLS material
    pub root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Interface label reported in status responses
    pub interface: String,
    pub listen_address: String,
    pub listen_port: u16,
    /// Public endpoint clients dial, optionally with an explicit port
    pub endpoint: String,
    pub websocket_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TlsSection {
    /// TLS server name; empty means the endpoint host
    pub server_name: String,
    /// Certificate path override (defaults to `<root>/tls/server.crt`)
    pub cert_path: Option<PathBuf>,
    /// Key path override (defaults to `<root>/tls/server.key`)
    pub key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    pub tun_name: String,
    /// Comma separated tun addresses
    pub tun_cidr: String,
    /// Clients skip certificate verification (self-signed server cert)
    pub insecure_tls: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataPlaneSection {
    pub binary: String,
    /// Arguments passed to the binary; `{config}` is the server document path
    pub args: Vec<String>,
    /// Time between SIGTERM and SIGKILL on stop
    pub stop_grace_ms: u64,
    /// Window after spawn in which an exit counts as a failed start (0 disables)
    pub startup_probe_ms: u64,
    pub auto_start: bool,
}

impl Default for StateSection {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/etc/vpn"),
        }
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            interface: "vless".to_string(),
            listen_address: "::".to_string(),
            listen_port: 443,
            endpoint: "127.0.0.1".to_string(),
            websocket_path: "/vpn".to_string(),
        }
    }
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            tun_name: "sb-tun".to_string(),
            tun_cidr: "172.19.0.1/30".to_string(),
            insecure_tls: true,
        }
    }
}

impl Default for DataPlaneSection {
    fn default() -> Self {
        Self {
            binary: "sing-box".to_string(),
            args: vec![
                "run".to_string(),
                "-c".to_string(),
                CONFIG_PLACEHOLDER.to_string(),
            ],
            stop_grace_ms: 500,
            startup_probe_ms: 200,
            auto_start: true,
        }
    }
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            state: StateSection::default(),
            server: ServerSection::default(),
            tls: TlsSection::default(),
            client: ClientSection::default(),
            data_plane: DataPlaneSection::default(),
        }
    }
}

impl GlobalConfig {
    /// Get the default config file path
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join("vless-manager")
            .join("config.toml")
    }

    /// Load config from the default path, or fall back to defaults if absent
    pub fn load_or_default() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&content)
            .map_err(|e| Error::config(format!("Invalid config {}: {}", path.display(), e)))?;

        // Version migration would go here
        if config.version != CONFIG_VERSION {
            log::warn!(
                "config {} has version {}, expected {}",
                path.display(),
                config.version,
                CONFIG_VERSION
            );
        }

        config.server.websocket_path = normalize_websocket_path(&config.server.websocket_path);
        Ok(config)
    }

    /// Save config to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_env(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |keys: &[&str]| {
            keys.iter()
                .filter_map(|key| lookup(key))
                .map(|value| value.trim().to_string())
                .find(|value| !value.is_empty())
        };

        if let Some(root) = get(&["VLESS_STATE_DIR", "WG_DIR"]) {
            self.state.root = PathBuf::from(root);
        }
        if let Some(endpoint) = get(&["VLESS_ENDPOINT", "WG_ENDPOINT"]) {
            self.server.endpoint = endpoint;
        }
        if let Some(address) = get(&["VLESS_LISTEN_ADDRESS"]) {
            self.server.listen_address = address;
        }
        if let Some(port) = get(&["VLESS_LISTEN_PORT", "WG_LISTEN_PORT"]) {
            if let Ok(port) = port.parse() {
                self.server.listen_port = port;
            }
        }
        if let Some(path) = get(&["VLESS_WS_PATH"]) {
            self.server.websocket_path = path;
        }
        self.server.websocket_path = normalize_websocket_path(&self.server.websocket_path);
        if let Some(name) = get(&["VLESS_TLS_SERVER_NAME"]) {
            self.tls.server_name = name;
        }
        if let Some(path) = get(&["VLESS_TLS_CERT_PATH"]) {
            self.tls.cert_path = Some(PathBuf::from(path));
        }
        if let Some(path) = get(&["VLESS_TLS_KEY_PATH"]) {
            self.tls.key_path = Some(PathBuf::from(path));
        }
        if let Some(name) = get(&["VLESS_CLIENT_TUN_NAME"]) {
            self.client.tun_name = name;
        }
        if let Some(cidr) = get(&["VLESS_CLIENT_TUN_CIDR"]) {
            self.client.tun_cidr = cidr;
        }
        if let Some(insecure) = get(&["VLESS_CLIENT_INSECURE_TLS"]).and_then(|v| parse_bool(&v)) {
            self.client.insecure_tls = insecure;
        }
        if let Some(binary) = get(&["SING_BOX_BIN"]) {
            self.data_plane.binary = binary;
        }
        if let Some(auto_start) =
            get(&["VLESS_AUTOSTART", "WG_AUTOSTART"]).and_then(|v| parse_bool(&v))
        {
            self.data_plane.auto_start = auto_start;
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.state.root.as_os_str().is_empty() {
            return Err(Error::validation("State root cannot be empty"));
        }
        if self.server.interface.trim().is_empty() {
            return Err(Error::validation("Interface name cannot be empty"));
        }
        if self.server.listen_port == 0 {
            return Err(Error::validation("Listen port must be greater than 0"));
        }
        if !self.server.websocket_path.starts_with('/') {
            return Err(Error::validation("Websocket path must start with '/'"));
        }
        if self.tun_addresses().is_empty() {
            return Err(Error::validation("Client tun CIDR list cannot be empty"));
        }
        if self.client.tun_name.trim().is_empty() {
            return Err(Error::validation("Client tun interface name cannot be empty"));
        }
        if self.data_plane.binary.trim().is_empty() {
            return Err(Error::validation("Data plane binary cannot be empty"));
        }
        Ok(())
    }

    /// TLS server name: explicit setting, else the endpoint host, else empty
    pub fn tls_server_name(&self) -> String {
        let explicit = self.tls.server_name.trim();
        if !explicit.is_empty() {
            return explicit.to_string();
        }
        if self.server.endpoint.trim().is_empty() {
            return String::new();
        }
        resolve_endpoint(&self.server.endpoint, self.server.listen_port).0
    }

    /// Common name for the self-signed certificate
    pub fn certificate_common_name(&self) -> String {
        let name = self.tls_server_name();
        if name.is_empty() {
            "localhost".to_string()
        } else {
            name
        }
    }

    /// Tun addresses parsed from the comma separated setting
    pub fn tun_addresses(&self) -> Vec<String> {
        split_and_trim_csv(&self.client.tun_cidr)
    }

    /// Resolve every on-disk path from the state root
    pub fn layout(&self) -> StateLayout {
        StateLayout::new(
            &self.state.root,
            self.tls.cert_path.clone(),
            self.tls.key_path.clone(),
        )
    }
}

/// Paths of every file the manager owns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    pub root: PathBuf,
    pub clients_dir: PathBuf,
    pub clients_file: PathBuf,
    pub server_config: PathBuf,
    pub data_plane_log: PathBuf,
    pub data_plane_pid: PathBuf,
    pub tls_cert: PathBuf,
    pub tls_key: PathBuf,
}

impl StateLayout {
    pub fn new(root: &Path, tls_cert: Option<PathBuf>, tls_key: Option<PathBuf>) -> Self {
        let clients_dir = root.join("clients");
        Self {
            root: root.to_path_buf(),
            clients_file: clients_dir.join("clients.json"),
            clients_dir,
            server_config: root.join("server.json"),
            data_plane_log: root.join("sing-box.log"),
            data_plane_pid: root.join("sing-box.pid"),
            tls_cert: tls_cert.unwrap_or_else(|| root.join("tls").join("server.crt")),
            tls_key: tls_key.unwrap_or_else(|| root.join("tls").join("server.key")),
        }
    }
}

/// Ensure a websocket path is non-empty and rooted
pub fn normalize_websocket_path(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        "/vpn".to_string()
    } else if !trimmed.starts_with('/') {
        format!("/{}", trimmed)
    } else {
        trimmed.to_string()
    }
}

/// Split a comma separated list, dropping blank entries
pub fn split_and_trim_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}
