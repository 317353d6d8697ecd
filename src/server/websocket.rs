use crate::common::models::{DeliveryStatus, DirectMessage, GroupMessage, Notification};
use crate::server::config::ServerConfig;
use crate::server::database::Database;
use crate::server::error::ServiceResult;
use crate::server::events::{ClientEvent, ServerEvent};
use crate::server::hub::Hub;
use crate::server::{auth, group_messages, groups, messages, users};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// WebSocket event router. Connections are anonymous until a `setup` frame
/// binds them to a user; every other identity-requiring event is dropped
/// until then. Handler failures never tear the connection down.
pub struct SocketServer {
    pub db: Arc<Database>,
    pub hub: Arc<Hub>,
    pub config: ServerConfig,
}

impl SocketServer {
    pub async fn run(&self, addr: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        log::info!("[WS] Listening on {}", addr);
        self.serve(listener).await
    }

    /// Accept loop over a pre-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let db = self.db.clone();
            let hub = self.hub.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_socket(db, hub, stream).await {
                    log::warn!("[WS] Connection error ({}): {}", peer, e);
                }
            });
        }
    }
}

async fn handle_socket(
    db: Arc<Database>,
    hub: Arc<Hub>,
    stream: TcpStream,
) -> anyhow::Result<()> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_tx, mut ws_rx) = ws.split();
    let client_id = uuid::Uuid::new_v4().to_string();
    log::info!("[WS] Client {} connected", client_id);

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    hub.attach(&client_id, tx);
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_tx.send(frame).await.is_err() {
                break;
            }
        }
    });

    // User id once the connection has completed setup.
    let mut established: Option<String> = None;

    while let Some(frame) = ws_rx.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("[WS] Read error on {}: {}", client_id, e);
                break;
            }
        };
        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_) => continue,
        };
        let event: ClientEvent = match serde_json::from_str(&text) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("[WS] Unparseable frame from {}: {}", client_id, e);
                continue;
            }
        };
        if established.is_none() && !event.allowed_unestablished() {
            log::debug!("[WS] Dropping '{}' from unestablished client {}", event.name(), client_id);
            continue;
        }
        if let Err(e) = dispatch(&db, &hub, &client_id, &mut established, event).await {
            log::warn!("[WS] Handler error on {}: {}", client_id, e);
        }
    }

    hub.detach(&client_id);
    if let Some(uid) = established {
        // Only the connection that still owns the presence entry may flip the
        // user offline; a newer connection for the same user keeps it.
        if hub.presence.unregister(&uid, &client_id) {
            match users::touch_last_seen(&db, &uid).await {
                Ok(last_seen) => hub.broadcast_all(&ServerEvent::UserStatusUpdate {
                    user_id: uid.clone(),
                    is_online: false,
                    last_seen: Some(last_seen),
                }),
                Err(e) => log::warn!("[WS] Failed to record last_seen for {}: {}", uid, e),
            }
            log::info!("[WS] User {} disconnected", uid);
        }
    }
    writer.abort();
    Ok(())
}

async fn dispatch(
    db: &Arc<Database>,
    hub: &Arc<Hub>,
    client_id: &str,
    established: &mut Option<String>,
    event: ClientEvent,
) -> ServiceResult<()> {
    log::debug!("[WS] Client {} -> '{}'", client_id, event.name());
    match event {
        ClientEvent::Setup { token } => {
            let Some(uid) = auth::validate_session(db.clone(), &token).await else {
                hub.send_to_client(
                    client_id,
                    &ServerEvent::Error { message: "Invalid or expired session".to_string() },
                );
                return Ok(());
            };
            if let Some(displaced) = hub.presence.register(&uid, client_id.to_string()) {
                log::info!("[WS] User {} reconnected, displacing handle {}", uid, displaced);
            }
            hub.join_room(&uid, client_id);
            *established = Some(uid.clone());

            flush_pending(db, hub, &uid).await?;
            hub.send_to_client(client_id, &ServerEvent::Connected);
            users::touch_last_seen(db, &uid).await?;
            hub.broadcast_all(&ServerEvent::UserStatusUpdate {
                user_id: uid.clone(),
                is_online: true,
                last_seen: None,
            });
            log::info!("[WS] Client {} established as user {}", client_id, uid);
        }

        ClientEvent::JoinChat(room) => hub.join_room(&room, client_id),
        ClientEvent::JoinGroup(group_id) => hub.join_room(&group_id, client_id),
        ClientEvent::LeaveGroup(group_id) => hub.leave_room(&group_id, client_id),

        // 1:1 typing goes to the receiver's personal room, carrying the
        // conversation room id; the receiver need not have joined that room.
        ClientEvent::Typing { room_id, receiver_id } => {
            let uid = established.clone().unwrap_or_default();
            hub.send_to_room(
                &receiver_id,
                &ServerEvent::Typing { sender_id: uid, room_id: Some(room_id), group_id: None },
                Some(client_id),
            );
        }
        ClientEvent::StopTyping { room_id, receiver_id } => {
            let uid = established.clone().unwrap_or_default();
            hub.send_to_room(
                &receiver_id,
                &ServerEvent::StopTyping { sender_id: uid, room_id: Some(room_id), group_id: None },
                Some(client_id),
            );
        }
        ClientEvent::GroupTyping { group_id } => {
            let uid = established.clone().unwrap_or_default();
            hub.send_to_room(
                &group_id,
                &ServerEvent::Typing { sender_id: uid, room_id: None, group_id: Some(group_id.clone()) },
                Some(client_id),
            );
        }
        ClientEvent::GroupStopTyping { group_id } => {
            let uid = established.clone().unwrap_or_default();
            hub.send_to_room(
                &group_id,
                &ServerEvent::StopTyping { sender_id: uid, room_id: None, group_id: Some(group_id.clone()) },
                Some(client_id),
            );
        }

        ClientEvent::NewMessage { message_id } => {
            let uid = established.clone().unwrap_or_default();
            let message = messages::fetch(db, &message_id).await?;
            if message.sender.id != uid {
                log::debug!("[WS] Ignoring new-message announce from non-sender {}", uid);
                return Ok(());
            }
            announce_direct(db, hub, client_id, message).await?;
        }

        ClientEvent::MessageDelivered { message_id, sender_id } => {
            let uid = established.clone().unwrap_or_default();
            acknowledge_direct(db, hub, &uid, &message_id, &sender_id, DeliveryStatus::Delivered)
                .await?;
        }
        ClientEvent::MessageRead { message_id, sender_id } => {
            let uid = established.clone().unwrap_or_default();
            acknowledge_direct(db, hub, &uid, &message_id, &sender_id, DeliveryStatus::Read).await?;
        }

        ClientEvent::ClearNotifications { chat_id, is_group_chat } => {
            // Group notifications clear through per-message read receipts.
            if is_group_chat {
                return Ok(());
            }
            let uid = established.clone().unwrap_or_default();
            let affected = messages::mark_conversation_read(db, &chat_id, &uid).await?;
            for message in affected {
                hub.send_to_handle(
                    &chat_id,
                    &ServerEvent::MessageStatusUpdated {
                        message_id: message.id.clone(),
                        status: DeliveryStatus::Read.as_str().to_string(),
                        message,
                    },
                );
            }
        }

        ClientEvent::NewGroupMessage { message_id, group_id } => {
            let uid = established.clone().unwrap_or_default();
            if !groups::is_member(db, &group_id, &uid).await? {
                log::debug!("[WS] Dropping group announce from non-member {}", uid);
                return Ok(());
            }
            if let Err(e) = announce_group(db, hub, client_id, &uid, &message_id, &group_id).await {
                hub.send_to_client(client_id, &ServerEvent::Error { message: e.to_string() });
                return Err(e);
            }
        }

        ClientEvent::GroupMessageStatus { message_id, group_id, status } => {
            let uid = established.clone().unwrap_or_default();
            let Some(status) = DeliveryStatus::parse(&status).filter(|s| *s != DeliveryStatus::Sent)
            else {
                log::debug!("[WS] Dropping group status '{}' from {}", status, uid);
                return Ok(());
            };
            let message = match group_messages::update_status(
                db.clone(), &message_id, &group_id, &uid, status,
            )
            .await
            {
                Ok(message) => message,
                Err(e) => {
                    log::debug!("[WS] Group status update rejected for {}: {}", uid, e);
                    return Ok(());
                }
            };

            let read_by = message.read_by.clone();
            let delivered_to = message.delivered_to.clone();
            let sender_id = message.sender.id.clone();
            hub.send_to_room(
                &group_id,
                &ServerEvent::GroupMessageStatusUpdated {
                    message_id: message_id.clone(),
                    status: Some(status.as_str().to_string()),
                    user_id: Some(uid.clone()),
                    group_id: group_id.clone(),
                    message,
                    status_type: status.as_str().to_string(),
                    delivered_to,
                    read_by: Some(read_by.clone()),
                },
                None,
            );
            if status == DeliveryStatus::Read && sender_id != uid {
                hub.send_to_user(
                    &sender_id,
                    &ServerEvent::GroupMessageRead { message_id, group_id, read_by },
                );
            }
        }

        ClientEvent::GroupUserAdded { group_id, user_id } => {
            let event = ServerEvent::UserJoinedGroup { group_id: group_id.clone(), user_id: user_id.clone() };
            hub.send_to_room(&group_id, &event, Some(client_id));
            hub.send_to_user(&user_id, &event);
        }
        ClientEvent::GroupUserRemoved { group_id, user_id } => {
            let event = ServerEvent::UserLeftGroup { group_id: group_id.clone(), user_id: user_id.clone() };
            hub.send_to_room(&group_id, &event, Some(client_id));
            hub.send_to_user(&user_id, &event);
        }
        ClientEvent::GroupSettingsUpdated(brief) => {
            let group_id = brief.id.clone();
            hub.send_to_room(&group_id, &ServerEvent::GroupUpdated(brief), Some(client_id));
        }
    }
    Ok(())
}

/// Transition messages parked in `sent` for a user who just came online and
/// tell each sender.
async fn flush_pending(db: &Arc<Database>, hub: &Arc<Hub>, uid: &str) -> ServiceResult<()> {
    let pending = messages::pending_for_receiver(db, uid).await?;
    for message in pending {
        if !messages::mark_delivered(db, &message.id).await? {
            continue;
        }
        let updated = messages::fetch(db, &message.id).await?;
        let sender_id = updated.sender.id.clone();
        hub.send_to_handle(
            &sender_id,
            &ServerEvent::MessageStatusUpdated {
                message_id: updated.id.clone(),
                status: DeliveryStatus::Delivered.as_str().to_string(),
                message: updated,
            },
        );
    }
    Ok(())
}

/// Push a freshly persisted direct message to its receiver, with an eager
/// delivered transition when the receiver is online.
async fn announce_direct(
    db: &Arc<Database>,
    hub: &Arc<Hub>,
    client_id: &str,
    message: DirectMessage,
) -> ServiceResult<()> {
    let receiver_id = message.receiver.id.clone();
    let mut message = message;
    if hub.presence.is_online(&receiver_id) && messages::mark_delivered(db, &message.id).await? {
        message = messages::fetch(db, &message.id).await?;
        hub.send_to_client(
            client_id,
            &ServerEvent::MessageStatusUpdated {
                message_id: message.id.clone(),
                status: DeliveryStatus::Delivered.as_str().to_string(),
                message: message.clone(),
            },
        );
    }
    hub.send_to_user(&receiver_id, &ServerEvent::MessageReceived(message.clone()));
    hub.send_to_user(&receiver_id, &ServerEvent::NewNotification(direct_notification(&message)));
    Ok(())
}

/// Receiver-side delivered/read acknowledgement for a direct message. Only
/// the receiver may acknowledge; anything else is silently dropped.
async fn acknowledge_direct(
    db: &Arc<Database>,
    hub: &Arc<Hub>,
    uid: &str,
    message_id: &str,
    sender_id: &str,
    status: DeliveryStatus,
) -> ServiceResult<()> {
    let message = messages::fetch(db, message_id).await?;
    if message.receiver.id != uid {
        log::debug!("[WS] Dropping '{}' ack from non-receiver {}", status.as_str(), uid);
        return Ok(());
    }
    let transitioned = match status {
        DeliveryStatus::Read => messages::mark_read(db, message_id).await?,
        _ => messages::mark_delivered(db, message_id).await?,
    };
    if !transitioned {
        return Ok(());
    }
    let updated = messages::fetch(db, message_id).await?;
    let event = ServerEvent::MessageStatusUpdated {
        message_id: message_id.to_string(),
        status: status.as_str().to_string(),
        message: updated.clone(),
    };
    hub.send_to_handle(sender_id, &event);
    match status {
        // The reading side keeps its own view in sync too.
        DeliveryStatus::Read => hub.send_to_user(uid, &event),
        // The acknowledging receiver gets the delivered echo.
        _ => hub.send_to_user(
            uid,
            &ServerEvent::MessageDelivered {
                message_id: message_id.to_string(),
                status: status.as_str().to_string(),
                message: updated,
            },
        ),
    }
    Ok(())
}

/// Fan a persisted group message out to the room, notify offline-capable
/// members, and record eager delivery receipts for members currently online.
async fn announce_group(
    db: &Arc<Database>,
    hub: &Arc<Hub>,
    client_id: &str,
    uid: &str,
    message_id: &str,
    group_id: &str,
) -> ServiceResult<()> {
    let message = group_messages::fetch_group_message(db, message_id).await?;
    if message.group.id != group_id || message.sender.id != uid {
        log::debug!("[WS] Ignoring mismatched group announce from {}", uid);
        return Ok(());
    }
    hub.send_to_room(group_id, &ServerEvent::NewGroupMessage(message.clone()), Some(client_id));

    let notification = group_notification(&message);
    let mut newly_delivered = Vec::new();
    for member in groups::member_ids(db, group_id).await? {
        if member == uid {
            continue;
        }
        hub.send_to_user(&member, &ServerEvent::NewNotification(notification.clone()));
        if hub.presence.is_online(&member)
            && group_messages::record_delivery(db, message_id, &member).await?
        {
            newly_delivered.push(member);
        }
    }
    if !newly_delivered.is_empty() {
        let updated = group_messages::fetch_group_message(db, message_id).await?;
        hub.send_to_room(
            group_id,
            &ServerEvent::GroupMessageStatusUpdated {
                message_id: message_id.to_string(),
                status: None,
                user_id: None,
                group_id: group_id.to_string(),
                message: updated,
                status_type: "initial_delivery".to_string(),
                delivered_to: newly_delivered,
                read_by: None,
            },
            None,
        );
    }
    Ok(())
}

fn direct_notification(message: &DirectMessage) -> Notification {
    Notification {
        id: message.id.clone(),
        is_group_chat: false,
        sender: message.sender.clone(),
        content: message.body.clone(),
        chat_id: message.sender.id.clone(),
        group_info: None,
        created_at: message.created_at,
    }
}

fn group_notification(message: &GroupMessage) -> Notification {
    Notification {
        id: message.id.clone(),
        is_group_chat: true,
        sender: message.sender.clone(),
        content: message.body.clone(),
        chat_id: message.group.id.clone(),
        group_info: Some(message.group.clone()),
        created_at: message.created_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::models::MessageKind;
    use crate::server::hub::Hub;
    use crate::server::presence::InMemoryPresence;
    use crate::server::users::testutil::{memory_db, seed_user};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn recv_event(rx: &mut UnboundedReceiver<Message>) -> Option<serde_json::Value> {
        match rx.try_recv().ok()? {
            Message::Text(text) => serde_json::from_str(&text).ok(),
            _ => None,
        }
    }

    async fn wired() -> (Arc<Database>, Arc<Hub>) {
        let db = memory_db().await;
        seed_user(&db, "a", "ada").await;
        seed_user(&db, "b", "bob").await;
        (db, Arc::new(Hub::new(Arc::new(InMemoryPresence::new()))))
    }

    fn connect(hub: &Hub, client_id: &str, user_id: &str) -> UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        hub.attach(client_id, tx);
        hub.presence.register(user_id, client_id.to_string());
        hub.join_room(user_id, client_id);
        rx
    }

    #[tokio::test]
    async fn announce_delivers_eagerly_when_receiver_is_online() {
        let (db, hub) = wired().await;
        let mut rx_a = connect(&hub, "c-a", "a");
        let mut rx_b = connect(&hub, "c-b", "b");

        let message = messages::send_message(db.clone(), "a", "b", "hi", MessageKind::Text, 2048)
            .await
            .unwrap();
        announce_direct(&db, &hub, "c-a", message.clone()).await.unwrap();

        let to_sender = recv_event(&mut rx_a).unwrap();
        assert_eq!(to_sender["event"], "message status updated");
        assert_eq!(to_sender["data"]["status"], "delivered");

        let received = recv_event(&mut rx_b).unwrap();
        assert_eq!(received["event"], "message received");
        assert_eq!(received["data"]["status"], "delivered");
        let notification = recv_event(&mut rx_b).unwrap();
        assert_eq!(notification["event"], "new notification");
        assert_eq!(notification["data"]["chatId"], "a");
    }

    #[tokio::test]
    async fn announce_leaves_status_sent_when_receiver_is_offline() {
        let (db, hub) = wired().await;
        let mut rx_a = connect(&hub, "c-a", "a");

        let message = messages::send_message(db.clone(), "a", "b", "hi", MessageKind::Text, 2048)
            .await
            .unwrap();
        announce_direct(&db, &hub, "c-a", message.clone()).await.unwrap();

        assert!(recv_event(&mut rx_a).is_none());
        let reloaded = messages::fetch(&db, &message.id).await.unwrap();
        assert_eq!(reloaded.status, DeliveryStatus::Sent);
    }

    #[tokio::test]
    async fn only_the_receiver_can_acknowledge() {
        let (db, hub) = wired().await;
        let mut rx_a = connect(&hub, "c-a", "a");

        let message = messages::send_message(db.clone(), "a", "b", "hi", MessageKind::Text, 2048)
            .await
            .unwrap();
        // Sender tries to read-mark their own message.
        acknowledge_direct(&db, &hub, "a", &message.id, "a", DeliveryStatus::Read)
            .await
            .unwrap();
        assert!(recv_event(&mut rx_a).is_none());
        let reloaded = messages::fetch(&db, &message.id).await.unwrap();
        assert_eq!(reloaded.status, DeliveryStatus::Sent);

        acknowledge_direct(&db, &hub, "b", &message.id, "a", DeliveryStatus::Read)
            .await
            .unwrap();
        let frame = recv_event(&mut rx_a).unwrap();
        assert_eq!(frame["event"], "message status updated");
        assert_eq!(frame["data"]["status"], "read");
    }

    #[tokio::test]
    async fn pending_flush_notifies_each_sender_once() {
        let (db, hub) = wired().await;
        let mut rx_a = connect(&hub, "c-a", "a");

        let m1 = messages::send_message(db.clone(), "a", "b", "one", MessageKind::Text, 2048)
            .await
            .unwrap();
        messages::send_message(db.clone(), "a", "b", "two", MessageKind::Text, 2048)
            .await
            .unwrap();
        messages::mark_read(&db, &m1.id).await.unwrap();

        flush_pending(&db, &hub, "b").await.unwrap();
        // Only the message still in `sent` produced a status event.
        let frame = recv_event(&mut rx_a).unwrap();
        assert_eq!(frame["event"], "message status updated");
        assert_eq!(frame["data"]["status"], "delivered");
        assert!(recv_event(&mut rx_a).is_none());
    }

    #[tokio::test]
    async fn delivered_ack_updates_sender_and_echoes_receiver() {
        let (db, hub) = wired().await;
        let mut rx_a = connect(&hub, "c-a", "a");
        let mut rx_b = connect(&hub, "c-b", "b");

        let message = messages::send_message(db.clone(), "a", "b", "hi", MessageKind::Text, 2048)
            .await
            .unwrap();
        acknowledge_direct(&db, &hub, "b", &message.id, "a", DeliveryStatus::Delivered)
            .await
            .unwrap();

        let to_sender = recv_event(&mut rx_a).unwrap();
        assert_eq!(to_sender["event"], "message status updated");
        assert_eq!(to_sender["data"]["status"], "delivered");
        let to_receiver = recv_event(&mut rx_b).unwrap();
        assert_eq!(to_receiver["event"], "message delivered");
        assert_eq!(to_receiver["data"]["messageId"], message.id.as_str());
    }

    #[tokio::test]
    async fn typing_reaches_the_receivers_personal_room() {
        let (db, hub) = wired().await;
        let _rx_a = connect(&hub, "c-a", "a");
        let mut rx_b = connect(&hub, "c-b", "b");
        // b has not joined the conversation room; only the personal room.

        let mut established = Some("a".to_string());
        dispatch(
            &db,
            &hub,
            "c-a",
            &mut established,
            ClientEvent::Typing { room_id: "room-ab".into(), receiver_id: "b".into() },
        )
        .await
        .unwrap();

        let frame = recv_event(&mut rx_b).unwrap();
        assert_eq!(frame["event"], "typing");
        assert_eq!(frame["data"]["senderId"], "a");
        assert_eq!(frame["data"]["roomId"], "room-ab");
    }

    #[tokio::test]
    async fn membership_relays_exclude_the_originator() {
        let (db, hub) = wired().await;
        let mut rx_a = connect(&hub, "c-a", "a");
        let mut rx_b = connect(&hub, "c-b", "b");
        hub.join_room("g1", "c-a");
        hub.join_room("g1", "c-b");

        let mut established = Some("a".to_string());
        dispatch(
            &db,
            &hub,
            "c-a",
            &mut established,
            ClientEvent::GroupUserAdded { group_id: "g1".into(), user_id: "x".into() },
        )
        .await
        .unwrap();

        let frame = recv_event(&mut rx_b).unwrap();
        assert_eq!(frame["event"], "user joined group");
        assert!(recv_event(&mut rx_a).is_none());
    }

    #[tokio::test]
    async fn group_announce_records_receipts_for_online_members_only() {
        let (db, hub) = wired().await;
        seed_user(&db, "c", "cam").await;
        let group = groups::create_group(db.clone(), "team", "", &["b".into(), "c".into()], "a")
            .await
            .unwrap();
        let mut rx_a = connect(&hub, "c-a", "a");
        let mut rx_b = connect(&hub, "c-b", "b");
        hub.join_room(&group.id, "c-a");
        hub.join_room(&group.id, "c-b");
        // c is offline: no handle registered.

        let message = group_messages::send_group_message(
            db.clone(), &group.id, "a", "hi", MessageKind::Text, 2048, 0,
        )
        .await
        .unwrap();
        announce_group(&db, &hub, "c-a", "a", &message.id, &group.id)
            .await
            .unwrap();

        let new_msg = recv_event(&mut rx_b).unwrap();
        assert_eq!(new_msg["event"], "new group message");
        let notification = recv_event(&mut rx_b).unwrap();
        assert_eq!(notification["event"], "new notification");
        assert_eq!(notification["data"]["isGroupChat"], true);

        // The aggregated delivery event reaches the room, b only.
        let status = recv_event(&mut rx_b).unwrap();
        assert_eq!(status["event"], "group message status updated");
        assert_eq!(status["data"]["statusType"], "initial_delivery");
        assert_eq!(status["data"]["deliveredTo"], serde_json::json!(["b"]));

        // Sender sees the aggregated event too, but not its own message echo.
        let first_for_a = recv_event(&mut rx_a).unwrap();
        assert_eq!(first_for_a["event"], "group message status updated");

        let reloaded = group_messages::fetch_group_message(&db, &message.id).await.unwrap();
        assert_eq!(reloaded.delivered_to, vec!["b".to_string()]);
        assert!(reloaded.read_by.is_empty());
    }
}
