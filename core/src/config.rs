//! Node configuration

use crate::relay::RelayClientConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a torshare node.
///
/// Every timeout and pacing value is a knob so tests can run at millisecond
/// scale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Rendezvous server address, `host:port`
    pub server_addr: String,
    /// Local SOCKS5 proxy for the relay leg; direct connection when absent
    pub socks_proxy: Option<String>,
    /// Destination directory for received files
    pub download_dir: PathBuf,
    /// Bind address for direct-channel listeners (port 0 = ephemeral)
    pub channel_bind: String,
    /// Host to advertise in candidates instead of the bound one, when the
    /// reachable address differs from the bind address
    pub advertise_host: Option<String>,
    /// Interval between periodic discovery requests
    #[serde(with = "duration_secs")]
    pub discovery_interval: Duration,
    /// How long the sender waits for a transfer-response
    #[serde(with = "duration_secs")]
    pub response_timeout: Duration,
    /// How long the sender waits for file-ready after file-start
    #[serde(with = "duration_secs")]
    pub ready_timeout: Duration,
    /// How long a negotiation may run before it is failed
    #[serde(with = "duration_secs")]
    pub negotiation_timeout: Duration,
    /// Size of one outgoing chunk in bytes
    pub chunk_size: usize,
    /// Delay between outgoing chunks. An approximation of channel
    /// backpressure: the transport's buffering drains between sends.
    #[serde(with = "duration_millis")]
    pub pacing_delay: Duration,
    /// Compute and advertise a SHA-256 digest before sending. The pre-pass
    /// reads the whole file, which delays the start of large transfers.
    pub hash_outgoing: bool,
    /// Verify received files against the advertised digest
    pub verify_incoming: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:3000".to_string(),
            socks_proxy: None,
            download_dir: PathBuf::from("downloads"),
            channel_bind: "127.0.0.1:0".to_string(),
            advertise_host: None,
            discovery_interval: Duration::from_secs(5),
            response_timeout: Duration::from_secs(30),
            ready_timeout: Duration::from_secs(10),
            negotiation_timeout: Duration::from_secs(30),
            chunk_size: 16 * 1024,
            pacing_delay: Duration::from_millis(10),
            hash_outgoing: true,
            verify_incoming: true,
        }
    }
}

impl NodeConfig {
    /// Derive the relay client configuration for this node
    pub fn relay_client_config(&self) -> RelayClientConfig {
        RelayClientConfig {
            server_addr: self.server_addr.clone(),
            socks_proxy: self.socks_proxy.clone(),
            discovery_interval: self.discovery_interval,
            ..Default::default()
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

// ============================================================================
// TESTS
// ============================================================================
