#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use batchline_client::{Client, ClientConfig};
use batchline_common::{PoolSummary, ProtocolTag};
use batchline_server::{Config, InferenceWorker, Server};

pub fn test_config(tmp: &Path) -> Config {
    let mut config = Config::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    config.workers.tmp_folder = tmp.to_path_buf();
    config.workers.model_dir = tmp.to_path_buf();
    config.workers.num_worker = 1;
    config.workers.batch_size = 10;
    config.workers.batch_group_timeout_ms = 5;
    config.workers.heartbeat_interval_ms = 100;
    config.workers.heartbeat_timeout_ms = 2_000;
    config.aggregation.sweep_interval_ms = 20;
    config
}

/// Start a server on an ephemeral port and return it with its WebSocket URL.
pub async fn start_server<W: InferenceWorker>(config: Config, worker: W) -> (Server, String) {
    let mut server = Server::start(config, worker);
    let addr = server.bind_ingress("127.0.0.1:0").await.unwrap();
    (server, format!("ws://{}/ws", addr))
}

pub async fn connect(url: &str, protocol: ProtocolTag, max_concurrency: usize) -> Client {
    Client::connect(
        ClientConfig::new(url)
            .protocol(protocol)
            .max_concurrency(max_concurrency)
            .timeout(Duration::from_secs(10)),
    )
    .await
    .unwrap()
}

/// Poll the pool until `pred` holds.
pub async fn wait_for_pool(server: &Server, pred: impl Fn(&PoolSummary) -> bool) -> PoolSummary {
    for _ in 0..300 {
        let summary = server.pool().snapshot().await.unwrap();
        if pred(&summary) {
            return summary;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("pool never reached the expected state");
}
