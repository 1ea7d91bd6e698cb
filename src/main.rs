//! Server binary: wire the adapters together and run until interrupted.

use roomcast::{ChatServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = ServerConfig::from_env();
    let server = ChatServer::connect(config).await?;

    server.store().ensure_indexes().await?;
    log::info!("Connected to store, indexes verified");

    // Reconcile activity flags with whatever presence survived a restart.
    server
        .store()
        .bootstrap_online_from_presence(server.bus())
        .await?;

    let runner = server.clone();
    let run = tokio::spawn(async move { runner.run().await });

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down");
    server.shutdown();
    if let Err(e) = server.store().mark_all_offline().await {
        log::error!("Failed to mark users offline on shutdown: {e}");
    }
    run.await??;

    Ok(())
}
