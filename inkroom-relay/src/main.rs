use log::{error, info};

use inkroom_sync::server::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = ServerConfig::from_env();
    info!(
        "Starting inkroom relay on {} (cursor queue {})",
        config.bind_addr, config.cursor_queue_capacity
    );

    let server = SyncServer::new(config);
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Relay stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            info!(
                "Shutting down after {} connections, {} messages",
                stats.total_connections, stats.total_messages
            );
        }
    }
}
