//! `vless://` connection links for out-of-band client bootstrap (QR payloads)

use crate::config_builder::resolve_endpoint;
use crate::{ClientRecord, Error, GlobalConfig, Result};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use std::net::Ipv6Addr;
use url::form_urlencoded;
use url::{Host, Url};

/// Characters escaped in the display-name fragment
const FRAGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'`');

/// Everything a client needs to reach the server, in link form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareLink {
    pub uuid: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub sni: Option<String>,
    pub insecure: bool,
    pub name: String,
}

impl ShareLink {
    /// Build the link describing the same connection as the client document
    pub fn for_client(config: &GlobalConfig, client: &ClientRecord) -> Self {
        let (host, port) = resolve_endpoint(&config.server.endpoint, config.server.listen_port);
        let sni = config.tls_server_name();
        Self {
            uuid: client.secret_identity.clone(),
            host,
            port,
            path: config.server.websocket_path.clone(),
            sni: if sni.is_empty() { None } else { Some(sni) },
            insecure: config.client.insecure_tls,
            name: client.name.clone(),
        }
    }

    /// Render as `vless://uuid@host:port?query#name`, query keys sorted
    pub fn to_uri(&self) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());
        if self.insecure {
            query.append_pair("allowInsecure", "1");
        }
        query.append_pair("encryption", "none");
        query.append_pair("path", &self.path);
        query.append_pair("security", "tls");
        if let Some(sni) = &self.sni {
            query.append_pair("sni", sni);
        }
        query.append_pair("type", "ws");

        let host = if self.host.parse::<Ipv6Addr>().is_ok() {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };

        format!(
            "vless://{}@{}:{}?{}#{}",
            utf8_percent_encode(&self.uuid, FRAGMENT),
            host,
            self.port,
            query.finish(),
            utf8_percent_encode(&self.name, FRAGMENT)
        )
    }

    /// Parse a link produced by [`ShareLink::to_uri`] or a compatible client
    pub fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri).map_err(|e| Error::parse(format!("Invalid share link: {}", e)))?;
        if url.scheme() != "vless" {
            return Err(Error::parse(format!(
                "Unsupported share link scheme '{}'",
                url.scheme()
            )));
        }

        let uuid = percent_decode_str(url.username())
            .decode_utf8_lossy()
            .to_string();
        if uuid.is_empty() {
            return Err(Error::parse("Share link has no user id"));
        }

        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(v4)) => v4.to_string(),
            Some(Host::Ipv6(v6)) => v6.to_string(),
            None => return Err(Error::parse("Share link has no host")),
        };
        let port = url
            .port()
            .ok_or_else(|| Error::parse("Share link has no port"))?;

        let mut link = Self {
            uuid,
            host,
            port,
            path: "/".to_string(),
            sni: None,
            insecure: false,
            name: url
                .fragment()
                .map(|f| percent_decode_str(f).decode_utf8_lossy().to_string())
                .unwrap_or_default(),
        };

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "path" => link.path = value.to_string(),
                "sni" => link.sni = Some(value.to_string()),
                "allowInsecure" => link.insecure = value == "1" || value == "true",
                _ => {}
            }
        }

        Ok(link)
    }
}
