//! Server and client document synthesis
//!
//! Everything here is pure: the same configuration and records always
//! produce the same documents. Writing them to disk is the caller's job.

use crate::documents::*;
use crate::{ClientRecord, GlobalConfig};
use std::collections::BTreeMap;
use std::net::IpAddr;

pub const VLESS_INBOUND_TAG: &str = "vless-in";
pub const VLESS_OUTBOUND_TAG: &str = "vless-out";
pub const TUN_INBOUND_TAG: &str = "tun-in";
pub const DIRECT_TAG: &str = "direct";
pub const BLOCK_TAG: &str = "block";
pub const REMOTE_DNS_TAG: &str = "dns-remote";
pub const REMOTE_DNS_SERVER: &str = "1.1.1.1";
pub const DEFAULT_TUN_ADDRESS: &str = "172.19.0.1/30";

/// Destinations that always bypass the tunnel
pub const PRIVATE_CIDRS: [&str; 9] = [
    "127.0.0.0/8",
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "169.254.0.0/16",
    "224.0.0.0/4",
    "::1/128",
    "fc00::/7",
    "fe80::/10",
];

/// Builder for the documents derived from configuration and client records
#[derive(Debug)]
pub struct ConfigBuilder;

impl ConfigBuilder {
    /// Generate the server document.
    ///
    /// Users appear in the order given; pass records sorted by id for
    /// stable output.
    pub fn server_document<'a, I>(config: &GlobalConfig, clients: I) -> ServerDocument
    where
        I: IntoIterator<Item = &'a ClientRecord>,
    {
        let layout = config.layout();
        let users = clients
            .into_iter()
            .map(|client| VlessUser {
                name: client.name.clone(),
                uuid: client.secret_identity.clone(),
            })
            .collect();

        ServerDocument {
            log: LogSection {
                level: "info".to_string(),
                timestamp: Some(true),
            },
            inbounds: vec![Inbound::Vless(VlessInbound {
                tag: VLESS_INBOUND_TAG.to_string(),
                listen: config.server.listen_address.clone(),
                listen_port: config.server.listen_port,
                users,
                tls: InboundTls {
                    enabled: true,
                    server_name: config.tls_server_name(),
                    certificate_path: layout.tls_cert.display().to_string(),
                    key_path: layout.tls_key.display().to_string(),
                },
                transport: Self::transport(config),
            })],
            outbounds: vec![Self::direct_outbound(), Self::block_outbound()],
            extra: BTreeMap::new(),
        }
    }

    /// Generate the document for a single client
    pub fn client_document(config: &GlobalConfig, client: &ClientRecord) -> ClientDocument {
        let (host, port) = resolve_endpoint(&config.server.endpoint, config.server.listen_port);

        let mut address = config.tun_addresses();
        if address.is_empty() {
            address.push(DEFAULT_TUN_ADDRESS.to_string());
        }

        let tun = TunInbound {
            tag: TUN_INBOUND_TAG.to_string(),
            interface_name: config.client.tun_name.clone(),
            address,
            auto_route: true,
            strict_route: true,
            sniff: true,
            sniff_override_destination: false,
            stack: "mixed".to_string(),
            route_exclude_address: route_exclude_cidrs(&host),
        };

        ClientDocument {
            log: LogSection {
                level: "warn".to_string(),
                timestamp: None,
            },
            dns: DnsSection {
                servers: vec![DnsServer {
                    kind: "udp".to_string(),
                    tag: REMOTE_DNS_TAG.to_string(),
                    server: REMOTE_DNS_SERVER.to_string(),
                    detour: VLESS_OUTBOUND_TAG.to_string(),
                }],
                final_server: REMOTE_DNS_TAG.to_string(),
                strategy: "prefer_ipv4".to_string(),
            },
            inbounds: vec![Inbound::Tun(tun)],
            outbounds: vec![
                Outbound::Vless(VlessOutbound {
                    tag: VLESS_OUTBOUND_TAG.to_string(),
                    server: host,
                    server_port: port,
                    uuid: client.secret_identity.clone(),
                    tls: OutboundTls {
                        enabled: true,
                        server_name: config.tls_server_name(),
                        insecure: config.client.insecure_tls,
                    },
                    transport: Self::transport(config),
                }),
                Self::direct_outbound(),
                Self::block_outbound(),
            ],
            route: RouteSection {
                auto_detect_interface: true,
                default_domain_resolver: DomainResolver {
                    server: REMOTE_DNS_TAG.to_string(),
                    strategy: "prefer_ipv4".to_string(),
                },
                rules: vec![
                    RouteRule {
                        protocol: Some("dns".to_string()),
                        action: Some("hijack-dns".to_string()),
                        ..Default::default()
                    },
                    RouteRule {
                        ip_cidr: PRIVATE_CIDRS.iter().map(|c| c.to_string()).collect(),
                        outbound: Some(DIRECT_TAG.to_string()),
                        ..Default::default()
                    },
                ],
                final_outbound: VLESS_OUTBOUND_TAG.to_string(),
            },
            extra: BTreeMap::new(),
        }
    }

    fn transport(config: &GlobalConfig) -> Transport {
        Transport {
            kind: "ws".to_string(),
            path: config.server.websocket_path.clone(),
        }
    }

    fn direct_outbound() -> Outbound {
        Outbound::Direct {
            tag: DIRECT_TAG.to_string(),
        }
    }

    fn block_outbound() -> Outbound {
        Outbound::Block {
            tag: BLOCK_TAG.to_string(),
        }
    }
}

/// Split an endpoint into host and port. Never fails.
///
/// An explicit port wins over `fallback_port`; a blank endpoint is loopback.
pub fn resolve_endpoint(raw: &str, fallback_port: u16) -> (String, u16) {
    let raw = raw.trim();
    if raw.is_empty() {
        return ("127.0.0.1".to_string(), fallback_port);
    }

    let parse_port = |p: &str| p.parse::<u16>().ok().filter(|p| *p > 0).unwrap_or(fallback_port);

    // [v6]:port or bare [v6]
    if let Some(rest) = raw.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = match tail.strip_prefix(':') {
                Some(port) => parse_port(port),
                None => fallback_port,
            };
            return (host.to_string(), port);
        }
        return (raw.to_string(), fallback_port);
    }

    // host:port; more than one colon is an unbracketed IPv6 literal
    match raw.split_once(':') {
        Some((host, port)) if !port.contains(':') => {
            let host = if host.is_empty() { "127.0.0.1" } else { host };
            (host.to_string(), parse_port(port))
        }
        _ => (raw.to_string(), fallback_port),
    }
}

/// Routes to keep out of the tunnel for an endpoint host.
///
/// A literal IP endpoint is excluded as a host route so the tunnel never
/// captures its own control connection. Domain names need no exclusion.
pub fn route_exclude_cidrs(host: &str) -> Vec<String> {
    match host.trim().parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => vec![format!("{}/32", v4)],
        Ok(IpAddr::V6(v6)) => match v6.to_ipv4_mapped() {
            Some(v4) => vec![format!("{}/32", v4)],
            None => vec![format!("{}/128", v6)],
        },
        Err(_) => Vec::new(),
    }
}
