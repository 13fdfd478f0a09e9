use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_REGISTER_EXPIRES: u32 = 3600;
pub const DEFAULT_ICE_GATHERING_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 20_000;

/// SIP account and transport configuration supplied by page code through an
/// edge and applied on the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SipConfig {
    /// Account URI, e.g. `sip:alice@example.org`.
    pub uri: String,
    pub password: String,
    /// One or more SIP-over-WebSocket signaling servers.
    pub ws_servers: Vec<String>,
    pub display_name: Option<String>,
    pub register_expires: u32,
    /// Milliseconds to wait for ICE gathering when trickle is disabled.
    pub ice_gathering_timeout: u64,
    /// Milliseconds to wait for the transport to connect.
    pub connection_timeout: u64,
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<TurnServer>,
    /// Extra SIP headers attached to REGISTER, as a `name -> value` map.
    pub extra_headers: HashMap<String, String>,
    pub auto_reconnect: bool,
    pub logs: bool,
    pub log_level: String,
    /// Build the user agent without binding the remote-SDP bridge.
    pub transport_only: bool,
}

impl Default for SipConfig {
    fn default() -> Self {
        SipConfig {
            uri: String::new(),
            password: String::new(),
            ws_servers: Vec::new(),
            display_name: None,
            register_expires: DEFAULT_REGISTER_EXPIRES,
            ice_gathering_timeout: DEFAULT_ICE_GATHERING_TIMEOUT_MS,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT_MS,
            stun_servers: Vec::new(),
            turn_servers: Vec::new(),
            extra_headers: HashMap::new(),
            auto_reconnect: false,
            logs: false,
            log_level: "info".to_string(),
            transport_only: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// ICE server entry handed to the edge peer connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl SipConfig {
    /// Rejects configurations the stack could never use: a non-SIP URI or an
    /// empty signaling server list.
    pub fn validate(&self) -> Result<()> {
        let uri = self.sip_uri()?;
        match uri.scheme {
            Some(rsip::Scheme::Sip) | Some(rsip::Scheme::Sips) | None => {}
            Some(other) => {
                return Err(crate::Error::BadState(format!(
                    "unsupported URI scheme: {:?}",
                    other
                )))
            }
        }
        if uri.auth.is_none() {
            return Err(crate::Error::BadState(format!(
                "URI has no user part: {}",
                self.uri
            )));
        }
        if self.ws_servers.is_empty() {
            return Err(crate::Error::BadState(
                "no signaling servers configured".to_string(),
            ));
        }
        Ok(())
    }

    pub fn sip_uri(&self) -> Result<rsip::Uri> {
        rsip::Uri::try_from(self.uri.as_str()).map_err(Into::into)
    }

    /// Registrar domain, derived from the account URI host.
    pub fn registrar_domain(&self) -> Result<String> {
        Ok(self.sip_uri()?.host_with_port.host.to_string())
    }

    /// ICE server list for the edge peer connection. Falls back to the
    /// default STUN server when no STUN servers are configured.
    pub fn ice_servers(&self) -> Vec<IceServer> {
        let mut servers = Vec::new();
        let stun = if self.stun_servers.is_empty() {
            vec![DEFAULT_STUN_SERVER.to_string()]
        } else {
            self.stun_servers.clone()
        };
        servers.push(IceServer {
            urls: stun,
            username: None,
            credential: None,
        });
        for turn in &self.turn_servers {
            servers.push(IceServer {
                urls: turn.urls.clone(),
                username: turn.username.clone(),
                credential: turn.password.clone(),
            });
        }
        servers
    }

    /// Extra headers as `Name: value` lines, the form the stack expects.
    pub fn extra_header_lines(&self) -> Vec<String> {
        let mut lines = self
            .extra_headers
            .iter()
            .map(|(name, value)| format!("{}: {}", name, value))
            .collect::<Vec<_>>();
        lines.sort();
        lines
    }
}

/// Per-edge client tuning. Defaults match the wire contract: initialize
/// handshake 5 s, request 5 s, SIP init 30 s, transport connect 20 s.
#[derive(Debug, Clone)]
pub struct EdgeConfig {
    pub initialize_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub sip_init_timeout_ms: u64,
    pub sip_connect_timeout_ms: u64,
    pub ice_servers: Vec<IceServer>,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        EdgeConfig {
            initialize_timeout_ms: 5000,
            request_timeout_ms: 5000,
            sip_init_timeout_ms: 30_000,
            sip_connect_timeout_ms: 20_000,
            ice_servers: Vec::new(),
        }
    }
}
