use crate::common::models::{DeliveryStatus, MessageKind};
use crate::server::config::ServerConfig;
use crate::server::database::Database;
use crate::server::error::ServiceResult;
use crate::server::{auth, group_messages, groups, messages, notifications, users};
use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};

/// Line-oriented API server. One command per line, `/command arg1 arg2 ...`,
/// first argument is always the session token. Replies are a single line:
/// `OK: <json>` or `ERR <status>: <message>`.
pub struct ApiServer {
    pub db: Arc<Database>,
    pub config: ServerConfig,
}

fn ok_json<T: Serialize>(value: &T) -> String {
    match serde_json::to_string(value) {
        Ok(json) => format!("OK: {}", json),
        Err(e) => {
            log::error!("[API] Failed to serialize response: {}", e);
            "ERR 500: Internal server error".to_string()
        }
    }
}

fn render<T: Serialize>(result: ServiceResult<T>) -> String {
    match result {
        Ok(value) => ok_json(&value),
        Err(e) => format!("ERR {}: {}", e.status_code(), e),
    }
}

/// `-` stands in for an absent optional argument, csv lists split on commas.
fn csv_arg(arg: &str) -> Vec<String> {
    if arg == "-" {
        return Vec::new();
    }
    arg.split(',').filter(|s| !s.is_empty()).map(str::to_string).collect()
}

fn opt_arg(arg: &str) -> Option<&str> {
    if arg == "-" { None } else { Some(arg) }
}

impl ApiServer {
    pub async fn run(&self, addr: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        log::info!("[API] Listening on {}", addr);
        loop {
            let (stream, peer) = listener.accept().await?;
            log::info!("[API] New connection from {}", peer);
            let db = self.db.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_client(db, config, stream, peer).await {
                    log::warn!("[API] Client error ({}): {}", peer, e);
                }
            });
        }
    }

    pub async fn handle_command(&self, cmd: &str, args: &[&str]) -> String {
        log::debug!("[API] Received command: {} ({} args)", cmd, args.len());

        if cmd == "/help" {
            return HELP.to_string();
        }
        if cmd == "/quit" {
            return "OK: Disconnected".to_string();
        }

        // Everything else requires a valid session token as the first arg.
        let Some((&token, rest)) = args.split_first() else {
            return "ERR 400: Missing session token".to_string();
        };
        let Some(uid) = auth::validate_session(self.db.clone(), token).await else {
            return "ERR 401: Invalid or expired session".to_string();
        };

        match cmd {
            // DIRECT MESSAGES
            "/send_message" if rest.len() >= 3 => {
                let receiver_id = rest[0];
                let Some(kind) = MessageKind::parse(rest[1]) else {
                    return "ERR 400: Unknown message type".to_string();
                };
                let body = rest[2..].join(" ");
                render(
                    messages::send_message(
                        self.db.clone(),
                        &uid,
                        receiver_id,
                        &body,
                        kind,
                        self.config.max_message_length,
                    )
                    .await,
                )
            }
            "/get_messages" if rest.len() == 1 => {
                match messages::get_messages(self.db.clone(), &uid, rest[0]).await {
                    Ok(convo) => ok_json(&convo.messages),
                    Err(e) => format!("ERR {}: {}", e.status_code(), e),
                }
            }
            "/delete_message" if rest.len() == 1 => {
                match messages::delete_for_user(self.db.clone(), &uid, rest[0]).await {
                    Ok(()) => "OK: Message deleted".to_string(),
                    Err(e) => format!("ERR {}: {}", e.status_code(), e),
                }
            }

            // GROUP MESSAGES
            "/send_group_message" if rest.len() >= 3 => {
                let group_id = rest[0];
                let Some(kind) = MessageKind::parse(rest[1]) else {
                    return "ERR 400: Unknown message type".to_string();
                };
                let body = rest[2..].join(" ");
                render(
                    group_messages::send_group_message(
                        self.db.clone(),
                        group_id,
                        &uid,
                        &body,
                        kind,
                        self.config.max_message_length,
                        self.config.debounce_window_ms,
                    )
                    .await,
                )
            }
            "/get_group_messages" if rest.len() == 1 => {
                render(group_messages::get_group_messages(self.db.clone(), rest[0], &uid).await)
            }
            "/group_message_status" if rest.len() == 3 => {
                let Some(status) =
                    DeliveryStatus::parse(rest[2]).filter(|s| *s != DeliveryStatus::Sent)
                else {
                    return "ERR 400: Status must be delivered or read".to_string();
                };
                render(
                    group_messages::update_status(self.db.clone(), rest[0], rest[1], &uid, status)
                        .await,
                )
            }

            // GROUPS
            "/create_group" if rest.len() >= 3 => {
                let members = csv_arg(rest[0]);
                let image = opt_arg(rest[1]).unwrap_or("");
                let name = rest[2..].join(" ");
                render(groups::create_group(self.db.clone(), &name, image, &members, &uid).await)
            }
            "/my_groups" if rest.is_empty() => {
                render(groups::list_user_groups(self.db.clone(), &uid).await)
            }
            "/group_details" if rest.len() == 1 => {
                render(groups::group_details(self.db.clone(), rest[0], &uid).await)
            }
            "/add_members" if rest.len() == 2 => {
                let ids = csv_arg(rest[1]);
                match groups::add_members(self.db.clone(), rest[0], &ids, &uid).await {
                    Ok((group, outcome)) => ok_json(&serde_json::json!({
                        "group": group,
                        "results": outcome,
                    })),
                    Err(e) => format!("ERR {}: {}", e.status_code(), e),
                }
            }
            "/remove_members" if rest.len() == 2 => {
                let ids = csv_arg(rest[1]);
                match groups::remove_members(self.db.clone(), rest[0], &ids, &uid).await {
                    Ok((group, outcome)) => ok_json(&serde_json::json!({
                        "group": group,
                        "results": outcome,
                    })),
                    Err(e) => format!("ERR {}: {}", e.status_code(), e),
                }
            }
            "/group_settings" if rest.len() >= 3 => {
                let group_id = rest[0];
                let (name, image) = match rest[1] {
                    "name" => (Some(rest[2..].join(" ")), None),
                    "image" => (None, Some(rest[2].to_string())),
                    _ => return "ERR 400: Expected 'name' or 'image'".to_string(),
                };
                match groups::update_settings(
                    self.db.clone(),
                    group_id,
                    &uid,
                    name.as_deref(),
                    image.as_deref(),
                )
                .await
                {
                    Ok(Some(group)) => ok_json(&group),
                    Ok(None) => "OK: No changes".to_string(),
                    Err(e) => format!("ERR {}: {}", e.status_code(), e),
                }
            }

            // NOTIFICATIONS / USERS
            "/notifications" if rest.is_empty() => {
                render(notifications::notifications_for(self.db.clone(), &uid).await)
            }
            "/mark_notifications_read" if !rest.is_empty() => {
                let ids: Vec<String> = rest.iter().map(|s| s.to_string()).collect();
                match notifications::mark_read(self.db.clone(), &uid, &ids).await {
                    Ok(()) => "OK: Notifications cleared".to_string(),
                    Err(e) => format!("ERR {}: {}", e.status_code(), e),
                }
            }
            "/toggle_push" if rest.len() == 1 => {
                let Ok(enabled) = rest[0].parse::<bool>() else {
                    return "ERR 400: Expected true or false".to_string();
                };
                match users::toggle_push_notifications(self.db.clone(), &uid, enabled).await {
                    Ok(msg) => format!("OK: {}", msg),
                    Err(e) => format!("ERR {}: {}", e.status_code(), e),
                }
            }
            "/user_status" if rest.len() == 1 => {
                render(users::user_status(&self.db, rest[0], self.config.online_window_ms).await)
            }
            _ => "ERR 400: Unknown or invalid command".to_string(),
        }
    }
}

const HELP: &str = "OK: Commands: /send_message <token> <receiver_id> <type> <message>, \
/get_messages <token> <other_user_id>, /delete_message <token> <message_id>, \
/send_group_message <token> <group_id> <type> <message>, /get_group_messages <token> <group_id>, \
/group_message_status <token> <message_id> <group_id> <delivered|read>, \
/create_group <token> <member_ids_csv|-> <image|-> <name>, /my_groups <token>, \
/group_details <token> <group_id>, /add_members <token> <group_id> <ids_csv>, \
/remove_members <token> <group_id> <ids_csv>, \
/group_settings <token> <group_id> name <new name>|image <url>, \
/notifications <token>, /mark_notifications_read <token> <id...>, \
/toggle_push <token> <true|false>, /user_status <token> <user_id>";

async fn handle_client(
    db: Arc<Database>,
    config: ServerConfig,
    stream: TcpStream,
    peer: std::net::SocketAddr,
) -> anyhow::Result<()> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            log::info!("[API] Client disconnected: {}", peer);
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut parts = trimmed.split_whitespace();
        let cmd = parts.next().unwrap_or("");
        let args: Vec<&str> = parts.collect();

        let server = ApiServer { db: db.clone(), config: config.clone() };
        let response = server.handle_command(cmd, &args).await;
        writer.write_all(response.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        if cmd == "/quit" {
            break;
        }
    }
    Ok(())
}
