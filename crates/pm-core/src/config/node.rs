//! Node configuration for the `peermux` binary

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::BridgeConfig;

/// Configuration for one bridge node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identifier this node advertises under
    pub local_peer_id: String,

    /// Port of the local application server
    pub application_port: u16,

    /// Bridge settings
    pub bridge: BridgeConfig,

    /// Statically known peers: peer id to relay address
    pub peers: HashMap<String, String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            local_peer_id: "local".to_string(),
            application_port: 0,
            bridge: BridgeConfig::default(),
            peers: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_node_config() {
        let config: NodeConfig = toml::from_str(
            r#"
            local_peer_id = "tablet"
            application_port = 3000

            [bridge]
            max_peer_listeners = 8

            [peers]
            phone = "127.0.0.1:47000"
            "#,
        )
        .unwrap();

        assert_eq!(config.local_peer_id, "tablet");
        assert_eq!(config.application_port, 3000);
        assert_eq!(config.bridge.max_peer_listeners, 8);
        assert_eq!(config.peers.len(), 1);
    }
}
