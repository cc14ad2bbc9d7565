//! End-to-end coverage of the client HTTP surface (spec.md §8 scenarios),
//! driven over a real TCP socket the way a client would hit it.

use std::net::SocketAddr;
use std::str::FromStr;

use dbnode::http::{router, AppState};
use dbnode::region::Region;
use dbnode::{build_node, Config};
use serde_json::{json, Value as Json};

async fn spawn_node(dev_mode: bool) -> (SocketAddr, String) {
    let data_dir = tempfile::tempdir().unwrap().into_path();
    let config = Config {
        data_dir,
        http_addr: "127.0.0.1:0".parse().unwrap(),
        operator_address: "0xOWNER".to_string(),
        endpoint: "http://127.0.0.1:0".to_string(),
        ws_endpoint: "ws://127.0.0.1:0".to_string(),
        region: Region::from_str("us-east").unwrap(),
        tee_enabled: false,
        stake: 0,
        dev_mode,
        registry_url: None,
        accepted_tee_levels: vec!["strict".to_string()],
    };
    let node = build_node(&config).await.unwrap();
    let app = router(AppState { node: node.clone() });

    let server = axum::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(app.into_make_service());
    let addr = server.local_addr();
    tokio::spawn(server);
    (addr, node.info.operator_address.clone())
}

#[tokio::test]
async fn fresh_primary_one_write_one_read_over_http() {
    // spec.md §8 scenario 1, driven over HTTP instead of the in-process API.
    let (addr, owner) = spawn_node(false).await;
    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    let created: Json = client
        .post(format!("{base}/v2/db"))
        .json(&json!({"name": "app", "owner": owner}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let database_id = created["databaseId"].as_str().unwrap().to_string();

    let resp = client
        .post(format!("{base}/v2/db/{database_id}/execute"))
        .json(&json!({"sql": "CREATE TABLE t(x INTEGER)"}))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    client
        .post(format!("{base}/v2/db/{database_id}/execute"))
        .json(&json!({"sql": "INSERT INTO t VALUES (42)"}))
        .send()
        .await
        .unwrap();

    let result: Json = client
        .post(format!("{base}/v2/db/{database_id}/execute"))
        .json(&json!({"sql": "SELECT * FROM t"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(result["walPosition"], 2);
    assert_eq!(result["rows"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn acl_denial_for_non_owner_write_over_http() {
    // spec.md §8 scenario 4.
    let (addr, owner) = spawn_node(false).await;
    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    let created: Json = client
        .post(format!("{base}/v2/db"))
        .json(&json!({"name": "app", "owner": owner, "initialDdl": "CREATE TABLE t(x INTEGER)"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let database_id = created["databaseId"].as_str().unwrap().to_string();

    let grant_resp = client
        .post(format!("{base}/v2/db/{database_id}/grant"))
        .json(&json!({"grantee": "0xREADER", "permissions": ["read"], "callerAddress": owner}))
        .send()
        .await
        .unwrap();
    assert!(grant_resp.status().is_success());

    let resp = client
        .post(format!("{base}/v2/db/{database_id}/execute"))
        .json(&json!({"sql": "UPDATE t SET x = 1", "callerAddress": "0xREADER"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);

    let escalation_resp = client
        .post(format!("{base}/v2/db/{database_id}/grant"))
        .json(&json!({"grantee": "0xREADER", "permissions": ["admin"], "callerAddress": "0xREADER"}))
        .send()
        .await
        .unwrap();
    assert_eq!(escalation_resp.status(), reqwest::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn required_wal_position_gate_over_http() {
    // spec.md §8 scenario 6.
    let (addr, owner) = spawn_node(false).await;
    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    let created: Json = client
        .post(format!("{base}/v2/db"))
        .json(&json!({"name": "app", "owner": owner, "initialDdl": "CREATE TABLE t(x INTEGER)"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let database_id = created["databaseId"].as_str().unwrap().to_string();

    let resp = client
        .post(format!("{base}/v2/db/{database_id}/execute"))
        .json(&json!({"sql": "SELECT * FROM t", "requiredWalPosition": 5}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::CONFLICT);
    let body: Json = resp.json().await.unwrap();
    assert_eq!(body["code"], "REPLICATION_LAG");
}

#[tokio::test]
async fn wal_and_replication_introspection_round_trip() {
    let (addr, owner) = spawn_node(false).await;
    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    let created: Json = client
        .post(format!("{base}/v2/db"))
        .json(&json!({"name": "app", "owner": owner, "initialDdl": "CREATE TABLE t(x INTEGER)"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let database_id = created["databaseId"].as_str().unwrap().to_string();

    client
        .post(format!("{base}/v2/db/{database_id}/execute"))
        .json(&json!({"sql": "INSERT INTO t VALUES (1)"}))
        .send()
        .await
        .unwrap();

    let wal: Json = client
        .get(format!("{base}/v2/db/{database_id}/wal"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(wal["headPosition"], 1);

    // no replica has pulled yet.
    let replication: Json = client
        .get(format!("{base}/v2/db/{database_id}/replication"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(replication.as_object().unwrap().is_empty());

    // a replica pulling via /v2/wal/sync must be reflected in replication
    // status (spec.md §4.3 `getReplicationStatus`).
    client
        .post(format!("{base}/v2/wal/sync"))
        .json(&json!({"databaseId": database_id, "fromPosition": 0, "limit": 100, "nodeId": "replica1"}))
        .send()
        .await
        .unwrap();

    let replication: Json = client
        .get(format!("{base}/v2/db/{database_id}/replication"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let status = &replication["replica1"];
    assert_eq!(status["walPosition"], 0);
    assert_eq!(status["lag"], 1);
}

#[tokio::test]
async fn dev_mode_auto_provisions_unknown_database() {
    let (addr, _owner) = spawn_node(true).await;
    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    let resp = client
        .post(format!("{base}/v2/db/scratch/execute"))
        .json(&json!({"sql": "CREATE TABLE t(x INTEGER)"}))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    let resp = client.get(format!("{base}/v2/db/scratch")).send().await.unwrap();
    assert!(resp.status().is_success());
}

#[tokio::test]
async fn node_info_and_status_are_reachable() {
    let (addr, _owner) = spawn_node(false).await;
    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    let info: Json = client.get(format!("{base}/v2/node")).send().await.unwrap().json().await.unwrap();
    assert_eq!(info["status"], "active");

    let status: Json = client.get(format!("{base}/v1/status")).send().await.unwrap().json().await.unwrap();
    assert_eq!(status["status"], "ok");
}
