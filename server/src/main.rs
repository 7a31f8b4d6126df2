use batchline_server::logging::init_tracing;
use batchline_server::{Config, EchoWorker, Server, SERVER_VERSION};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    init_tracing(&config.logging.level);
    tracing::info!("Starting batchline server {}", SERVER_VERSION);

    let mut server = Server::start(config.clone(), EchoWorker::new());

    server
        .bind_ingress(&format!("{}:{}", config.server.host, config.server.port))
        .await?;

    if let Some(port) = config.http.port {
        server
            .bind_gateway(&format!("{}:{}", config.server.host, port), Vec::new())
            .await?;
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    server.shutdown().await;

    Ok(())
}
