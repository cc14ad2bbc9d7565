pub mod acl;
pub mod audit;
pub mod database;
pub mod error;
pub mod events;
pub mod http;
pub mod node;
pub mod region;
pub mod replication;
pub mod storage;
pub mod tee;
pub mod value;
pub mod vector;
pub mod wal;

use std::path::PathBuf;
use std::sync::Arc;

use crate::events::EventBus;
use crate::node::{HttpRegistryClient, NodeRuntime, RegistryClient};
use crate::region::Region;

/// Process-wide configuration, built from CLI flags and environment
/// variables in `main.rs` (SPEC_FULL.md §A "Configuration").
pub struct Config {
    pub data_dir: PathBuf,
    pub http_addr: std::net::SocketAddr,
    pub operator_address: String,
    pub endpoint: String,
    pub ws_endpoint: String,
    pub region: Region,
    pub tee_enabled: bool,
    pub stake: u64,
    pub dev_mode: bool,
    pub registry_url: Option<String>,
    pub accepted_tee_levels: Vec<String>,
}

/// A Registry client that simply reports every Node as absent and every
/// write as a no-op — used when no `--registry-url` is configured, so the
/// Node runs in permanent offline mode (§7: "Registry unavailability...
/// degrades to offline mode").
pub struct NullRegistryClient;

#[async_trait::async_trait]
impl RegistryClient for NullRegistryClient {
    async fn register_node(
        &self,
        _node_id: &str,
        _endpoint: &str,
        _region: Region,
        _tee_enabled: bool,
        _stake: u64,
    ) -> error::Result<()> {
        Ok(())
    }

    async fn heartbeat(&self, _node_id: &str) -> error::Result<()> {
        Ok(())
    }

    async fn get_node(&self, _node_id: &str) -> error::Result<Option<node::NodeRecord>> {
        Ok(None)
    }

    async fn slash(&self, _node_id: &str, _amount: u64) -> error::Result<()> {
        Ok(())
    }
}

/// Builds the `NodeRuntime` from `Config`, running its full startup
/// sequence (§4.5 steps 1-6).
pub async fn build_node(config: &Config) -> error::Result<Arc<NodeRuntime>> {
    let registry: Arc<dyn RegistryClient> = match &config.registry_url {
        Some(url) => Arc::new(HttpRegistryClient::new(url.clone())),
        None => Arc::new(NullRegistryClient),
    };

    let node = Arc::new(NodeRuntime::new(
        config.operator_address.clone(),
        config.endpoint.clone(),
        config.ws_endpoint.clone(),
        config.region,
        config.tee_enabled,
        config.stake,
        config.data_dir.clone(),
        config.dev_mode,
        config.accepted_tee_levels.clone(),
        registry,
        EventBus::new(),
    ));
    node.start().await?;
    Ok(node)
}
