use std::env;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    /// Port of the line-command API server; the WebSocket server listens on
    /// `ws_port` (defaults to port + 1).
    pub port: u16,
    pub ws_port: u16,
    pub database_url: String,
    pub log_level: String,
    pub session_expiry_days: u32,
    pub max_message_length: usize,
    /// Window for the duplicate group-message send guard.
    pub debounce_window_ms: i64,
    /// Window for the last-seen-based online approximation used by polling
    /// clients.
    pub online_window_ms: i64,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let port = env::var("SERVER_PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(5000);
        Self {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port,
            ws_port: env::var("WEBSOCKET_PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(port + 1),
            database_url: env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:data/chatwire.db".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            session_expiry_days: env::var("SESSION_EXPIRY_DAYS").ok().and_then(|v| v.parse().ok()).unwrap_or(7),
            max_message_length: env::var("MAX_MESSAGE_LENGTH").ok().and_then(|v| v.parse().ok()).unwrap_or(2048),
            debounce_window_ms: env::var("DEBOUNCE_WINDOW_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(5000),
            online_window_ms: env::var("ONLINE_WINDOW_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(30_000),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            ws_port: 5001,
            database_url: "sqlite::memory:".to_string(),
            log_level: "info".to_string(),
            session_expiry_days: 7,
            max_message_length: 2048,
            debounce_window_ms: 5000,
            online_window_ms: 30_000,
        }
    }
}
