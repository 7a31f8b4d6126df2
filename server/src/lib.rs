//! batchline server: micro-batching dispatch over a supervised worker pool.
//!
//! [`Server::start`] wires the components together. Each runs as its own
//! task and they only talk over channels:
//!
//! - the [`router`] splits requests into partitions and hands coalesced groups
//!   to workers that ask for one,
//! - each [`worker`] host runs `predict` and sends per-partition results to
//!   the [`sink`],
//! - the sink reassembles results in order and replies to the client,
//! - the [`pool`] manager supervises workers and publishes utilization,
//! - the [`autoscale`] loop grows and shrinks the pool from that utilization.
//!
//! Clients connect over WebSocket ([`ingress`]); the optional [`http`] gateway
//! forwards HTTP calls through one shared client.

pub mod autoscale;
pub mod batch_queue;
pub mod config;
pub mod http;
pub mod ingress;
pub mod logging;
pub mod pool;
pub mod router;
pub mod sink;
pub mod worker;

pub use config::{Config, ConfigError};
pub use worker::{EchoWorker, HookError, InferenceWorker};

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use batchline_client::{Client, ClientConfig, ClientError};
use batchline_common::{ProtocolTag, ServerStatus};

use crate::autoscale::{Autoscaler, AutoscalerConfig};
use crate::batch_queue::BatchQueueConfig;
use crate::http::{GatewayState, RouteExtension};
use crate::pool::{PoolConfig, PoolError, PoolHandle, PoolManager, UtilizationSample};
use crate::router::{FrontendRouter, RouterConfig, RouterError, RouterHandle};
use crate::sink::{Sink, SinkConfig};

pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Gateway client failed: {0}")]
    Client(#[from] ClientError),

    #[error("Client ingress is not bound")]
    NotBound,
}

/// Shared state of the client-facing ingress.
pub struct AppState {
    pub config: Config,
    pub router: RouterHandle,
    pub pool: PoolHandle,
    pub connected_clients: AtomicUsize,
}

impl AppState {
    pub async fn server_status(&self) -> Result<ServerStatus, ServerError> {
        let stats = self.router.stats().await?;
        let pool = self.pool.snapshot().await?;
        let workers = &self.config.workers;
        let scaling = &self.config.scaling;

        Ok(ServerStatus {
            server_version: SERVER_VERSION.to_string(),
            protocol: self.config.server.protocol,
            batch_size: workers.batch_size,
            batch_group_timeout_ms: workers.batch_group_timeout_ms,
            num_worker: workers.num_worker,
            num_worker_expanded: scaling.num_worker_expanded,
            device_map: workers.device_map.clone(),
            device_to_expand: scaling.device_to_expand.clone(),
            connected_clients: self.connected_clients.load(Ordering::SeqCst),
            requests_received: stats.requests_received,
            partitions_dispatched: stats.partitions_dispatched,
            pending_partitions: stats.pending_partitions,
            pool,
        })
    }
}

/// A running server.
pub struct Server {
    state: Arc<AppState>,
    autoscaler: Autoscaler,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    ingress_addr: Option<SocketAddr>,
    gateway_client: Option<Client>,
}

impl Server {
    /// Start the sink, router, pool manager and autoscaler.
    ///
    /// Must be called inside a tokio runtime. Nothing listens until
    /// [`Server::bind_ingress`] is called.
    pub fn start<W: InferenceWorker>(config: Config, worker: W) -> Self {
        let cancel = CancellationToken::new();

        let (sink, sink_handle) = Sink::new(SinkConfig::new(
            config.aggregation.aggregation_timeout_ms,
            config.aggregation.sweep_interval_ms,
        ));
        let (samples_tx, samples_rx) = watch::channel(UtilizationSample::default());

        let router_config = RouterConfig {
            queue: BatchQueueConfig::new(config.workers.batch_size, config.workers.batch_group_timeout_ms),
            max_pending_partitions: config.workers.max_pending_partitions,
        };
        let (router, router_handle) = FrontendRouter::new(router_config, sink_handle.clone(), samples_rx);

        let (pool, pool_handle) = PoolManager::new(
            PoolConfig::from_config(&config),
            Arc::new(worker),
            router_handle.clone(),
            sink_handle,
            samples_tx,
            cancel.clone(),
        );

        let tasks = vec![
            tokio::spawn(sink.run(cancel.clone())),
            tokio::spawn(router.run(cancel.clone())),
            tokio::spawn(pool.run()),
        ];

        let mut autoscaler = Autoscaler::new(AutoscalerConfig::from_config(&config.scaling), pool_handle.clone());
        autoscaler.start();

        tracing::info!(
            num_worker = config.workers.num_worker,
            batch_size = config.workers.batch_size,
            protocol = %config.server.protocol,
            "Server started"
        );

        let state = Arc::new(AppState {
            config,
            router: router_handle,
            pool: pool_handle,
            connected_clients: AtomicUsize::new(0),
        });

        Self {
            state,
            autoscaler,
            cancel,
            tasks,
            ingress_addr: None,
            gateway_client: None,
        }
    }

    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    pub fn pool(&self) -> &PoolHandle {
        &self.state.pool
    }

    /// Router serving the client WebSocket at `/ws`.
    pub fn ingress_router(&self) -> Router {
        Router::new()
            .route("/ws", get(ingress::ws_handler))
            .with_state(self.state.clone())
    }

    /// Bind the client ingress and serve it in the background.
    pub async fn bind_ingress(&mut self, addr: &str) -> Result<SocketAddr, ServerError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let app = self.ingress_router();
        let cancel = self.cancel.clone();

        self.tasks.push(tokio::spawn(async move {
            let service = app.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum::serve(listener, service)
                .with_graceful_shutdown(cancel.cancelled_owned())
                .await
            {
                tracing::error!("Client ingress failed: {}", e);
            }
        }));

        tracing::info!("Listening for clients on ws://{}/ws", local);
        self.ingress_addr = Some(local);
        Ok(local)
    }

    /// Connect a shared client to the ingress and serve the HTTP gateway.
    pub async fn bind_gateway(
        &mut self,
        addr: &str,
        extensions: Vec<Arc<dyn RouteExtension>>,
    ) -> Result<SocketAddr, ServerError> {
        let ingress = self.ingress_addr.ok_or(ServerError::NotBound)?;
        let http = self.state.config.http.clone();

        let client = Client::connect(
            ClientConfig::new(format!("ws://{}/ws", loopback(ingress)))
                .protocol(ProtocolTag::Obj)
                .max_concurrency(http.max_connect)
                .timeout(Duration::from_secs(http.client_timeout_secs))
                .ignore_all_checks(true),
        )
        .await?;

        let app = http::router(Arc::new(GatewayState::new(client.clone(), http)), &extensions);
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let cancel = self.cancel.clone();

        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(cancel.cancelled_owned())
                .await
            {
                tracing::error!("HTTP gateway failed: {}", e);
            }
        }));

        tracing::info!("HTTP gateway listening on http://{}", local);
        self.gateway_client = Some(client);
        Ok(local)
    }

    /// Stop every component and wait for their tasks.
    pub async fn shutdown(mut self) {
        self.autoscaler.stop().await;
        if let Some(client) = self.gateway_client.take() {
            client.close().await;
        }
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        tracing::info!("Server stopped");
    }
}

/// Address to dial for a listener that may be bound to the unspecified address.
fn loopback(addr: SocketAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
    } else {
        addr
    }
}
