mod common;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use batchline_client::ClientError;
use batchline_common::{ErrorKind, Payload, ProtocolTag, WorkerState};
use batchline_server::{HookError, InferenceWorker};
use serde_json::{json, Value};

use common::{connect, start_server, test_config, wait_for_pool};

/// Echo worker that panics on a `"boom"` input and fails setup on one device.
#[derive(Clone, Default)]
struct Flaky {
    calls: Arc<AtomicUsize>,
    bad_device: Option<i32>,
}

#[async_trait]
impl InferenceWorker for Flaky {
    type Env = ();
    type Model = ();

    async fn setup_env(&self, device_id: i32, _: &Path) -> Result<(), HookError> {
        if self.bad_device == Some(device_id) {
            return Err(HookError::Setup(format!("no such device {}", device_id)));
        }
        Ok(())
    }

    async fn load_model(&self, _: (), _: &Path, _: &str, _: &Path) -> Result<(), HookError> {
        Ok(())
    }

    async fn predict(&self, _: &(), inputs: Vec<Payload>) -> Result<Vec<Payload>, HookError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if inputs.iter().any(|p| p.as_object() == Some(&json!("boom"))) {
            panic!("worker hit a poisoned input");
        }
        if inputs.iter().any(|p| p.as_object() == Some(&json!("error"))) {
            return Err(HookError::Predict("model rejected input".to_string()));
        }
        Ok(inputs)
    }
}

#[tokio::test]
async fn test_worker_crash_yields_partial_result_without_retry() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = test_config(tmp.path());
    config.workers.num_worker = 2;
    config.aggregation.aggregation_timeout_ms = 300;
    let worker = Flaky::default();
    let (server, url) = start_server(config, worker.clone()).await;
    wait_for_pool(&server, |p| p.serving_workers == 2).await;

    let client = connect(&url, ProtocolTag::Obj, 1).await;
    let mut items: Vec<Value> = (0..14).map(|i| json!(i)).collect();
    items.push(json!("boom"));

    let err = client.encode(Value::Array(items)).await.unwrap_err();
    match err {
        ClientError::PartialResult {
            received,
            expected,
            payload,
        } => {
            assert_eq!((received, expected), (1, 2));
            let expected_items: Vec<Value> = (0..10).map(|i| json!(i)).collect();
            assert_eq!(payload, Payload::from(Value::Array(expected_items)));
        }
        other => panic!("expected partial result, got {:?}", other),
    }
    assert_eq!(worker.calls.load(Ordering::SeqCst), 2);

    let pool = wait_for_pool(&server, |p| p.serving_workers == 1).await;
    let dead: Vec<_> = pool.workers.iter().filter(|w| w.state == WorkerState::Dead).collect();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].last_error.as_deref().unwrap().contains("poisoned input"));

    // The surviving worker keeps serving.
    let reply = client.encode(json!("still here")).await.unwrap();
    assert_eq!(reply, Payload::from(json!("still here")));

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_hook_error_fails_the_whole_request() {
    let tmp = tempfile::tempdir().unwrap();
    let (server, url) = start_server(test_config(tmp.path()), Flaky::default()).await;

    let client = connect(&url, ProtocolTag::Obj, 1).await;
    let err = client.encode(json!(["fine", "error"])).await.unwrap_err();
    match err {
        ClientError::Remote { kind, message } => {
            assert_eq!(kind, ErrorKind::Inference);
            assert!(message.contains("model rejected input"));
        }
        other => panic!("expected remote error, got {:?}", other),
    }

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_startup_failure_is_isolated_to_one_worker() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = test_config(tmp.path());
    config.workers.num_worker = 2;
    config.workers.device_map = vec![0, 1];
    let worker = Flaky {
        bad_device: Some(1),
        ..Flaky::default()
    };
    let (server, url) = start_server(config, worker).await;

    let pool = wait_for_pool(&server, |p| {
        p.serving_workers == 1 && p.workers.iter().any(|w| w.state == WorkerState::Dead)
    })
    .await;
    let failed = pool.workers.iter().find(|w| w.state == WorkerState::Dead).unwrap();
    assert_eq!(failed.device_id, 1);
    assert!(failed.last_error.as_deref().unwrap().contains("no such device 1"));

    let client = connect(&url, ProtocolTag::Obj, 1).await;
    assert_eq!(client.encode(json!("ok")).await.unwrap(), Payload::from(json!("ok")));

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_no_live_worker_is_reported_to_client() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = test_config(tmp.path());
    config.workers.device_map = vec![7];
    let worker = Flaky {
        bad_device: Some(7),
        ..Flaky::default()
    };
    let (server, url) = start_server(config, worker).await;
    wait_for_pool(&server, |p| p.workers.iter().all(|w| w.state == WorkerState::Dead)).await;

    let client = connect(&url, ProtocolTag::Obj, 1).await;
    let err = client.encode(json!("anyone?")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WorkerUnavailable);

    client.close().await;
    server.shutdown().await;
}

/// Worker whose model code is synchronous and slower than the heartbeat timeout.
struct SlowSync;

#[async_trait]
impl InferenceWorker for SlowSync {
    type Env = ();
    type Model = ();

    async fn setup_env(&self, _: i32, _: &Path) -> Result<(), HookError> {
        Ok(())
    }

    async fn load_model(&self, _: (), _: &Path, _: &str, _: &Path) -> Result<(), HookError> {
        Ok(())
    }

    async fn predict(&self, _: &(), inputs: Vec<Payload>) -> Result<Vec<Payload>, HookError> {
        tokio::task::spawn_blocking(move || {
            std::thread::sleep(Duration::from_millis(600));
            inputs
        })
        .await
        .map_err(|e| HookError::Predict(e.to_string()))
    }
}

#[tokio::test]
async fn test_blocking_model_code_offloaded_keeps_worker_alive() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = test_config(tmp.path());
    config.workers.heartbeat_interval_ms = 20;
    config.workers.heartbeat_timeout_ms = 200;
    let (server, url) = start_server(config, SlowSync).await;
    wait_for_pool(&server, |p| p.serving_workers == 1).await;

    let client = connect(&url, ProtocolTag::Obj, 1).await;
    assert_eq!(client.encode(json!("slow")).await.unwrap(), Payload::from(json!("slow")));

    let pool = server.pool().snapshot().await.unwrap();
    assert!(pool.workers.iter().all(|w| w.state != WorkerState::Dead));

    client.close().await;
    server.shutdown().await;
}
