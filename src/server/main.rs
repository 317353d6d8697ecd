use chatwire::server::config::ServerConfig;
use chatwire::server::connection::ApiServer;
use chatwire::server::database::Database;
use chatwire::server::hub::Hub;
use chatwire::server::presence::InMemoryPresence;
use chatwire::server::websocket::SocketServer;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();
    env_logger::Builder::new()
        .parse_filters(&config.log_level)
        .init();

    log::info!("[BOOT] Starting chatwire server");
    let db = Arc::new(Database::connect(&config.database_url).await?);
    db.migrate().await?;
    log::info!("[BOOT] Database ready at {}", config.database_url);

    let presence = Arc::new(InMemoryPresence::new());
    let hub = Arc::new(Hub::new(presence));

    let ws_addr = format!("{}:{}", config.host, config.ws_port);
    let socket_server = SocketServer {
        db: db.clone(),
        hub,
        config: config.clone(),
    };
    tokio::spawn(async move {
        if let Err(e) = socket_server.run(&ws_addr).await {
            log::error!("[BOOT] WebSocket server failed: {}", e);
        }
    });

    let api_addr = format!("{}:{}", config.host, config.port);
    let api_server = ApiServer { db, config };
    api_server.run(&api_addr).await
}
