use taskboard_sync::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let config = ServerConfig::from_env();
    match &config.storage_path {
        Some(path) => log::info!("Persisting boards to {}", path.display()),
        None => log::warn!("TASKBOARD_DATA_DIR not set, boards live in memory only"),
    }

    let server = SyncServer::new(config)?;
    server.run().await
}
