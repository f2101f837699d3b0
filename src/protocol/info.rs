//! INFO and CONNECT bodies.
//!
//! Both are JSON objects. Every documented key has a typed field; keys this
//! client does not know about are kept in `extra` and written back out, so a
//! decode/encode round trip is lossless.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Server information sent in `INFO`, at connect time and whenever the
/// cluster topology changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub server_id: String,
    #[serde(default)]
    pub server_name: String,
    pub version: String,
    #[serde(default)]
    pub go: String,
    pub host: String,
    pub port: u16,
    /// Whether the server understands HPUB/HMSG.
    #[serde(default)]
    pub headers: bool,
    /// Largest payload the server accepts, in bytes.
    pub max_payload: usize,
    pub proto: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_verify: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_available: Option<bool>,
    /// Other cluster members a client may connect to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_urls: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_connect_urls: Option<Vec<String>>,
    /// Lame duck mode: the server is shutting down and clients should move.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ldm: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jetstream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    /// Keys not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ServerInfo {
    /// Whether the server demands TLS before CONNECT.
    pub fn requires_tls(&self) -> bool {
        self.tls_required.unwrap_or(false)
    }

    /// Whether the server announced lame duck mode.
    pub fn is_lame_duck(&self) -> bool {
        self.ldm.unwrap_or(false)
    }
}

/// Client options sent in `CONNECT`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectInfo {
    /// Ask the server to acknowledge every frame with `+OK`.
    pub verbose: bool,
    /// Ask the server for strict subject checking.
    pub pedantic: bool,
    pub tls_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    /// Client name shown in server monitoring.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub lang: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<i32>,
    /// Whether the server may deliver this connection's own publishes back to it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub echo: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_responders: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nkey: Option<String>,

    /// Keys not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for ConnectInfo {
    fn default() -> Self {
        Self {
            verbose: false,
            pedantic: false,
            tls_required: false,
            auth_token: None,
            user: None,
            pass: None,
            name: None,
            lang: "rust".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol: Some(1),
            echo: Some(true),
            sig: None,
            jwt: None,
            no_responders: None,
            headers: None,
            nkey: None,
            extra: Map::new(),
        }
    }
}
