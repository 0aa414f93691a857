//! Domain model types for the VLESS manager

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Protocol label reported in status responses
pub const PROTOCOL: &str = "vless";

/// Transport label reported in status responses
pub const TRANSPORT: &str = "ws+tls";

/// Name used for the client bootstrapped into an empty store
pub const DEFAULT_CLIENT_NAME: &str = "default-client";

/// Highest numeric suffix tried before falling back to a timestamp suffix
const MAX_ID_SUFFIX: u32 = 10_000;

/// Client records keyed by id. Iteration order is the id order.
pub type ClientMap = BTreeMap<String, ClientRecord>;

/// Durable identity entry for one VPN client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ClientRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// VLESS user id presented by the client
    #[serde(rename = "uuid", default)]
    pub secret_identity: String,
    /// Legacy display alias, kept for API compatibility
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,
    #[serde(default)]
    pub config_path: PathBuf,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
}

impl ClientRecord {
    pub fn new(id: String, name: &str, clients_dir: &Path) -> Self {
        let secret_identity = generate_secret_identity();
        let name = name.trim();
        Self {
            name: if name.is_empty() {
                id.clone()
            } else {
                name.to_string()
            },
            address: secret_identity.clone(),
            config_path: client_config_path(clients_dir, &id),
            created_at: Utc::now(),
            secret_identity,
            id,
        }
    }

    /// Backfill missing fields in place. Returns true when anything changed.
    pub fn heal(&mut self, key: &str, clients_dir: &Path) -> bool {
        let mut changed = false;
        if self.id.trim().is_empty() {
            self.id = key.to_string();
            changed = true;
        }
        if self.name.trim().is_empty() {
            self.name = self.id.clone();
            changed = true;
        }
        if self.secret_identity.trim().is_empty() {
            self.secret_identity = generate_secret_identity();
            changed = true;
        }
        if self.address.trim().is_empty() {
            self.address = self.secret_identity.clone();
            changed = true;
        }
        if self.config_path.as_os_str().is_empty() {
            self.config_path = client_config_path(clients_dir, &self.id);
            changed = true;
        }
        if is_unset_timestamp(&self.created_at) {
            self.created_at = Utc::now();
            changed = true;
        }
        changed
    }

    /// Visual handle for listings: the alias, or the secret identity when none is set
    pub fn display_alias(&self) -> &str {
        let alias = self.address.trim();
        if alias.is_empty() {
            &self.secret_identity
        } else {
            alias
        }
    }
}

/// Per-client entry in a status response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusClient {
    pub id: String,
    pub name: String,
    pub uuid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,
    pub created_at: DateTime<Utc>,
}

impl From<&ClientRecord> for StatusClient {
    fn from(record: &ClientRecord) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            uuid: record.secret_identity.clone(),
            address: record.display_alias().to_string(),
            created_at: record.created_at,
        }
    }
}

/// Snapshot of the manager returned by `get_status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub interface: String,
    pub listen_port: u16,
    pub protocol: String,
    pub transport: String,
    pub endpoint: String,
    pub clients: Vec<StatusClient>,
}

/// A freshly created or fetched client together with its client document
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub record: ClientRecord,
    pub config: String,
}

/// Generate a new random secret identity (UUIDv4, hyphenated lowercase)
pub fn generate_secret_identity() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Path of the generated client document for a client id
pub fn client_config_path(clients_dir: &Path, id: &str) -> PathBuf {
    clients_dir.join(format!("{}.json", id))
}

fn is_unset_timestamp(ts: &DateTime<Utc>) -> bool {
    ts.timestamp() <= 0
}

fn invalid_id_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-z0-9._-]+").expect("client id pattern is valid"))
}

/// Derive a URL-safe client id from a display name
pub fn sanitize_client_id(name: &str) -> String {
    let lowered = name.trim().to_lowercase();
    let replaced = invalid_id_chars().replace_all(&lowered, "-");
    let trimmed = replaced.trim_matches(|c| c == '-' || c == '_' || c == '.');
    if trimmed.is_empty() {
        "client".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Validates a client id according to allowed patterns
pub fn validate_client_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("Client id cannot be empty".to_string());
    }
    if invalid_id_chars().is_match(id) {
        return Err(
            "Client id must contain only lowercase letters, numbers, dots, underscores, and hyphens"
                .to_string(),
        );
    }
    Ok(())
}

/// Pick an id for `name` that is not yet present in `clients`
pub fn allocate_client_id(name: &str, clients: &ClientMap) -> String {
    let base = sanitize_client_id(name);
    if !clients.contains_key(&base) {
        return base;
    }
    for i in 2..MAX_ID_SUFFIX {
        let candidate = format!("{}-{}", base, i);
        if !clients.contains_key(&candidate) {
            return candidate;
        }
    }
    format!("{}-{}", base, Utc::now().timestamp())
}
