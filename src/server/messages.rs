use crate::common::models::{DeliveryStatus, DirectMessage, MessageKind, UserBrief};
use crate::server::database::Database;
use crate::server::error::{ServiceError, ServiceResult};
use crate::server::users;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::sync::Arc;

const PROJECTION: &str = "SELECT m.id, m.body, m.kind, m.status, m.created_at, \
     s.id AS s_id, s.username AS s_username, s.profile_picture AS s_picture, \
     r.id AS r_id, r.username AS r_username, r.profile_picture AS r_picture \
     FROM messages m \
     JOIN users s ON s.id = m.sender_id \
     JOIN users r ON r.id = m.receiver_id";

fn project(row: &SqliteRow) -> DirectMessage {
    DirectMessage {
        id: row.get("id"),
        sender: UserBrief {
            id: row.get("s_id"),
            username: row.get("s_username"),
            profile_picture: row.get("s_picture"),
        },
        receiver: UserBrief {
            id: row.get("r_id"),
            username: row.get("r_username"),
            profile_picture: row.get("r_picture"),
        },
        body: row.get("body"),
        kind: MessageKind::parse(row.get::<&str, _>("kind")).unwrap_or(MessageKind::Text),
        status: DeliveryStatus::parse(row.get::<&str, _>("status")).unwrap_or(DeliveryStatus::Sent),
        created_at: row.get("created_at"),
    }
}

/// A conversation listing plus the subset that is unread and addressed to the
/// caller. Computing the subset does not mutate anything; the caller decides
/// when to issue read-marks.
#[derive(Debug)]
pub struct Conversation {
    pub messages: Vec<DirectMessage>,
    pub unread: Vec<DirectMessage>,
}

pub async fn send_message(
    db: Arc<Database>,
    sender_id: &str,
    receiver_id: &str,
    body: &str,
    kind: MessageKind,
    max_length: usize,
) -> ServiceResult<DirectMessage> {
    if body.is_empty() {
        return Err(ServiceError::validation("message and receiverId are required"));
    }
    if body.chars().count() > max_length {
        return Err(ServiceError::validation(format!(
            "Message too long (max {} chars)",
            max_length
        )));
    }
    if !users::user_exists(&db, receiver_id).await? {
        return Err(ServiceError::not_found("Receiver not found"));
    }

    let id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().timestamp_millis();
    sqlx::query(
        "INSERT INTO messages (id, sender_id, receiver_id, body, kind, status, created_at) \
         VALUES (?, ?, ?, ?, ?, 'sent', ?)",
    )
    .bind(&id)
    .bind(sender_id)
    .bind(receiver_id)
    .bind(body)
    .bind(kind.as_str())
    .bind(now)
    .execute(&db.pool)
    .await?;
    log::info!("[MSG] Message {} sent from {} to {}", id, sender_id, receiver_id);
    fetch(&db, &id).await
}

pub async fn fetch(db: &Database, message_id: &str) -> ServiceResult<DirectMessage> {
    let row = sqlx::query(&format!("{} WHERE m.id = ?", PROJECTION))
        .bind(message_id)
        .fetch_optional(&db.pool)
        .await?
        .ok_or_else(|| ServiceError::not_found("Message not found"))?;
    Ok(project(&row))
}

/// Both directions of the pair, ascending by creation time, with messages
/// the caller has soft-deleted filtered from their view only.
pub async fn get_messages(
    db: Arc<Database>,
    user_id: &str,
    other_user_id: &str,
) -> ServiceResult<Conversation> {
    let rows = sqlx::query(&format!(
        "{} WHERE ((m.sender_id = ?1 AND m.receiver_id = ?2) \
             OR (m.sender_id = ?2 AND m.receiver_id = ?1)) \
           AND NOT EXISTS (SELECT 1 FROM deleted_messages d \
                           WHERE d.message_id = m.id AND d.user_id = ?1) \
         ORDER BY m.created_at ASC",
        PROJECTION
    ))
    .bind(user_id)
    .bind(other_user_id)
    .fetch_all(&db.pool)
    .await?;

    let messages: Vec<DirectMessage> = rows.iter().map(project).collect();
    let unread = messages
        .iter()
        .filter(|m| m.receiver.id == user_id && m.status != DeliveryStatus::Read)
        .cloned()
        .collect();
    Ok(Conversation { messages, unread })
}

/// sent -> delivered, guarded so an already delivered or read message is
/// untouched. Returns whether a transition happened.
pub async fn mark_delivered(db: &Database, message_id: &str) -> ServiceResult<bool> {
    let res = sqlx::query("UPDATE messages SET status = 'delivered' WHERE id = ? AND status = 'sent'")
        .bind(message_id)
        .execute(&db.pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

/// Transition to read. Idempotent: re-marking a read message is a no-op.
pub async fn mark_read(db: &Database, message_id: &str) -> ServiceResult<bool> {
    let res = sqlx::query("UPDATE messages SET status = 'read' WHERE id = ? AND status != 'read'")
        .bind(message_id)
        .execute(&db.pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

/// Messages still in `sent` addressed to a user, resolved when that user
/// establishes a connection.
pub async fn pending_for_receiver(db: &Database, user_id: &str) -> ServiceResult<Vec<DirectMessage>> {
    let rows = sqlx::query(&format!(
        "{} WHERE m.receiver_id = ? AND m.status = 'sent' ORDER BY m.created_at ASC",
        PROJECTION
    ))
    .bind(user_id)
    .fetch_all(&db.pool)
    .await?;
    Ok(rows.iter().map(project).collect())
}

/// Bulk-transition every non-read message from `from_user` to `to_user` into
/// read, returning the affected messages in their post-transition state.
pub async fn mark_conversation_read(
    db: &Database,
    from_user: &str,
    to_user: &str,
) -> ServiceResult<Vec<DirectMessage>> {
    let rows = sqlx::query(&format!(
        "{} WHERE m.sender_id = ? AND m.receiver_id = ? AND m.status != 'read' \
         ORDER BY m.created_at ASC",
        PROJECTION
    ))
    .bind(from_user)
    .bind(to_user)
    .fetch_all(&db.pool)
    .await?;
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    sqlx::query(
        "UPDATE messages SET status = 'read' \
         WHERE sender_id = ? AND receiver_id = ? AND status != 'read'",
    )
    .bind(from_user)
    .bind(to_user)
    .execute(&db.pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let mut message = project(row);
            message.status = DeliveryStatus::Read;
            message
        })
        .collect())
}

/// Record a per-user soft-delete marker. The other party's view and the
/// stored message are unaffected.
pub async fn delete_for_user(
    db: Arc<Database>,
    user_id: &str,
    message_id: &str,
) -> ServiceResult<()> {
    let row = sqlx::query("SELECT sender_id, receiver_id FROM messages WHERE id = ?")
        .bind(message_id)
        .fetch_optional(&db.pool)
        .await?
        .ok_or_else(|| ServiceError::not_found("Message not found"))?;
    let sender: String = row.get("sender_id");
    let receiver: String = row.get("receiver_id");
    if sender != user_id && receiver != user_id {
        return Err(ServiceError::forbidden("Not a participant of this message"));
    }
    let now = chrono::Utc::now().timestamp_millis();
    sqlx::query(
        "INSERT OR IGNORE INTO deleted_messages (message_id, user_id, deleted_at) VALUES (?, ?, ?)",
    )
    .bind(message_id)
    .bind(user_id)
    .bind(now)
    .execute(&db.pool)
    .await?;
    log::info!("[MSG] Message {} hidden for user {}", message_id, user_id);
    Ok(())
}
