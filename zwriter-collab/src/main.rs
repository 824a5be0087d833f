use std::sync::Arc;

use log::info;
use zwriter_collab::{MemoryStore, ServerConfig, SessionRegistry, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env()?;
    let registry = Arc::new(SessionRegistry::with_hook(Arc::new(MemoryStore::new())));
    let server = SyncServer::new(config, registry);

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            info!(
                "Shutting down ({} connections served, {} active rooms)",
                stats.total_connections, stats.active_rooms
            );
        }
    }
    Ok(())
}
