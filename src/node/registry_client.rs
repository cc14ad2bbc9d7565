use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::region::Region;

/// A Node record as returned by `getNode` (§3 Node, §6 Registry calls).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub node_id: String,
    pub operator_address: String,
    pub endpoint: String,
    pub ws_endpoint: String,
    pub region: Region,
    pub staked_amount: u64,
    #[serde(default)]
    pub slashed_amount: u64,
    pub tee_enabled: bool,
    pub version: String,
    pub hosted_database_count: u32,
    pub performance_score: u32,
}

/// The opaque on-chain Registry ABI (§6): `registerNode`, `heartbeat`,
/// `getNode`, `slash`. Treated as a black box — the Engine never depends
/// on its implementation, only on these four operations.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn register_node(
        &self,
        node_id: &str,
        endpoint: &str,
        region: Region,
        tee_enabled: bool,
        stake: u64,
    ) -> Result<()>;

    async fn heartbeat(&self, node_id: &str) -> Result<()>;

    async fn get_node(&self, node_id: &str) -> Result<Option<NodeRecord>>;

    async fn slash(&self, node_id: &str, amount: u64) -> Result<()>;
}

/// reqwest-based client for a Registry exposed as a JSON-RPC-ish HTTP
/// service. Registry unavailability degrades to offline mode rather than
/// failing Node startup (§4.5 step 3, §7: "Registry unavailability at
/// startup degrades to offline mode with a log message").
pub struct HttpRegistryClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpRegistryClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("reqwest client builds"),
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn register_node(
        &self,
        node_id: &str,
        endpoint: &str,
        region: Region,
        tee_enabled: bool,
        stake: u64,
    ) -> Result<()> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Body<'a> {
            node_id: &'a str,
            endpoint: &'a str,
            region_index: u8,
            tee_enabled: bool,
            stake: u64,
        }
        self.http
            .post(self.url("/registry/register"))
            .json(&Body {
                node_id,
                endpoint,
                region_index: region.index(),
                tee_enabled,
                stake,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn heartbeat(&self, node_id: &str) -> Result<()> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Body<'a> {
            node_id: &'a str,
        }
        self.http
            .post(self.url("/registry/heartbeat"))
            .json(&Body { node_id })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn get_node(&self, node_id: &str) -> Result<Option<NodeRecord>> {
        let resp = self
            .http
            .get(self.url(&format!("/registry/node/{node_id}")))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let record: NodeRecord = resp.error_for_status()?.json().await?;
        Ok(Some(record))
    }

    async fn slash(&self, node_id: &str, amount: u64) -> Result<()> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Body {
            amount: u64,
        }
        self.http
            .post(self.url(&format!("/registry/node/{node_id}/slash")))
            .json(&Body { amount })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
