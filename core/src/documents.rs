//! Typed shapes of the sing-box documents written for the server and clients
//!
//! Field order of every struct is the order written to disk. Top-level
//! documents carry a flattened `extra` map so unknown sections survive a
//! read-modify-write.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Document consumed by the data plane on the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDocument {
    pub log: LogSection,
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Document handed to one client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientDocument {
    pub log: LogSection,
    pub dns: DnsSection,
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
    pub route: RouteSection,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSection {
    pub level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Inbound {
    Vless(VlessInbound),
    Tun(TunInbound),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlessInbound {
    pub tag: String,
    pub listen: String,
    pub listen_port: u16,
    pub users: Vec<VlessUser>,
    pub tls: InboundTls,
    pub transport: Transport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlessUser {
    pub name: String,
    pub uuid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundTls {
    pub enabled: bool,
    pub server_name: String,
    pub certificate_path: String,
    pub key_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunInbound {
    pub tag: String,
    pub interface_name: String,
    pub address: Vec<String>,
    pub auto_route: bool,
    pub strict_route: bool,
    pub sniff: bool,
    pub sniff_override_destination: bool,
    pub stack: String,
    /// Addresses kept out of the tunnel's captured routes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub route_exclude_address: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Outbound {
    Vless(VlessOutbound),
    Direct { tag: String },
    Block { tag: String },
}

impl Outbound {
    pub fn tag(&self) -> &str {
        match self {
            Outbound::Vless(vless) => &vless.tag,
            Outbound::Direct { tag } | Outbound::Block { tag } => tag,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlessOutbound {
    pub tag: String,
    pub server: String,
    pub server_port: u16,
    pub uuid: String,
    pub tls: OutboundTls,
    pub transport: Transport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundTls {
    pub enabled: bool,
    pub server_name: String,
    pub insecure: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transport {
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsSection {
    pub servers: Vec<DnsServer>,
    #[serde(rename = "final")]
    pub final_server: String,
    pub strategy: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsServer {
    #[serde(rename = "type")]
    pub kind: String,
    pub tag: String,
    pub server: String,
    pub detour: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSection {
    pub auto_detect_interface: bool,
    pub default_domain_resolver: DomainResolver,
    pub rules: Vec<RouteRule>,
    #[serde(rename = "final")]
    pub final_outbound: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainResolver {
    pub server: String,
    pub strategy: String,
}

/// One route rule. Only the populated matchers and actions are written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RouteRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_cidr: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbound: Option<String>,
}

impl ServerDocument {
    /// The VLESS inbound carrying the user list, if present
    pub fn vless_inbound(&self) -> Option<&VlessInbound> {
        self.inbounds.iter().find_map(|inbound| match inbound {
            Inbound::Vless(vless) => Some(vless),
            _ => None,
        })
    }
}

impl ClientDocument {
    pub fn tun_inbound(&self) -> Option<&TunInbound> {
        self.inbounds.iter().find_map(|inbound| match inbound {
            Inbound::Tun(tun) => Some(tun),
            _ => None,
        })
    }

    pub fn vless_outbound(&self) -> Option<&VlessOutbound> {
        self.outbounds.iter().find_map(|outbound| match outbound {
            Outbound::Vless(vless) => Some(vless),
            _ => None,
        })
    }
}
