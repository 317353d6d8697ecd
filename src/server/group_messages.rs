use crate::common::models::{DeliveryStatus, GroupBrief, GroupMessage, MessageKind, UserBrief};
use crate::server::database::Database;
use crate::server::error::{ServiceError, ServiceResult};
use crate::server::groups;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Arc;

const PROJECTION: &str = "SELECT gm.id, gm.body, gm.kind, gm.created_at, \
     g.id AS g_id, g.name AS g_name, g.image AS g_image, \
     u.id AS u_id, u.username AS u_username, u.profile_picture AS u_picture \
     FROM group_messages gm \
     JOIN groups g ON g.id = gm.group_id \
     JOIN users u ON u.id = gm.sender_id";

/// Per-message receipt lists. The coarse status is derived: read as soon as
/// anyone has read, delivered as soon as anyone has a receipt, sent otherwise.
#[derive(Debug, Default, Clone)]
struct Receipts {
    delivered_to: Vec<String>,
    read_by: Vec<String>,
}

impl Receipts {
    fn coarse_status(&self) -> DeliveryStatus {
        if !self.read_by.is_empty() {
            DeliveryStatus::Read
        } else if !self.delivered_to.is_empty() {
            DeliveryStatus::Delivered
        } else {
            DeliveryStatus::Sent
        }
    }
}

fn project(row: &SqliteRow, receipts: Receipts) -> GroupMessage {
    GroupMessage {
        id: row.get("id"),
        group: GroupBrief {
            id: row.get("g_id"),
            name: row.get("g_name"),
            image: row.get("g_image"),
        },
        sender: UserBrief {
            id: row.get("u_id"),
            username: row.get("u_username"),
            profile_picture: row.get("u_picture"),
        },
        body: row.get("body"),
        kind: MessageKind::parse(row.get::<&str, _>("kind")).unwrap_or(MessageKind::Text),
        status: receipts.coarse_status(),
        delivered_to: receipts.delivered_to,
        read_by: receipts.read_by,
        created_at: row.get("created_at"),
    }
}

async fn receipts_for(db: &Database, message_id: &str) -> ServiceResult<Receipts> {
    let rows = sqlx::query(
        "SELECT user_id, read_at FROM group_message_receipts \
         WHERE message_id = ? ORDER BY delivered_at ASC",
    )
    .bind(message_id)
    .fetch_all(&db.pool)
    .await?;
    let mut receipts = Receipts::default();
    for row in rows {
        let user_id: String = row.get("user_id");
        if row.get::<Option<i64>, _>("read_at").is_some() {
            receipts.read_by.push(user_id.clone());
        }
        receipts.delivered_to.push(user_id);
    }
    Ok(receipts)
}

/// Persist a group message. A duplicate (same group, sender, body and kind)
/// inside the debounce window returns the original row instead of inserting a
/// second one, absorbing client retries.
pub async fn send_group_message(
    db: Arc<Database>,
    group_id: &str,
    sender_id: &str,
    body: &str,
    kind: MessageKind,
    max_length: usize,
    debounce_window_ms: i64,
) -> ServiceResult<GroupMessage> {
    if body.is_empty() {
        return Err(ServiceError::validation("message and groupId are required"));
    }
    if body.chars().count() > max_length {
        return Err(ServiceError::validation(format!(
            "Message too long (max {} chars)",
            max_length
        )));
    }
    let row = sqlx::query("SELECT 1 FROM groups WHERE id = ?")
        .bind(group_id)
        .fetch_optional(&db.pool)
        .await?;
    if row.is_none() {
        return Err(ServiceError::not_found("Group not found"));
    }

    let now = chrono::Utc::now().timestamp_millis();
    let recent = sqlx::query(
        "SELECT id FROM group_messages \
         WHERE group_id = ? AND sender_id = ? AND body = ? AND kind = ? AND created_at > ? \
         ORDER BY created_at DESC LIMIT 1",
    )
    .bind(group_id)
    .bind(sender_id)
    .bind(body)
    .bind(kind.as_str())
    .bind(now - debounce_window_ms)
    .fetch_optional(&db.pool)
    .await?;
    if let Some(existing) = recent {
        let id: String = existing.get("id");
        log::debug!("[GROUP_MSG] Duplicate message from {} debounced into {}", sender_id, id);
        return fetch_group_message(&db, &id).await;
    }

    let id = uuid::Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO group_messages (id, group_id, sender_id, body, kind, created_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(group_id)
    .bind(sender_id)
    .bind(body)
    .bind(kind.as_str())
    .bind(now)
    .execute(&db.pool)
    .await?;
    log::info!("[GROUP_MSG] Message {} sent to group {} by {}", id, group_id, sender_id);
    fetch_group_message(&db, &id).await
}

pub async fn fetch_group_message(db: &Database, message_id: &str) -> ServiceResult<GroupMessage> {
    let row = sqlx::query(&format!("{} WHERE gm.id = ?", PROJECTION))
        .bind(message_id)
        .fetch_optional(&db.pool)
        .await?
        .ok_or_else(|| ServiceError::not_found("Message not found"))?;
    let receipts = receipts_for(db, message_id).await?;
    Ok(project(&row, receipts))
}

/// Full history of a group, ascending, members only.
pub async fn get_group_messages(
    db: Arc<Database>,
    group_id: &str,
    caller: &str,
) -> ServiceResult<Vec<GroupMessage>> {
    let row = sqlx::query("SELECT 1 FROM groups WHERE id = ?")
        .bind(group_id)
        .fetch_optional(&db.pool)
        .await?;
    if row.is_none() {
        return Err(ServiceError::not_found("Group not found"));
    }
    if !groups::is_member(&db, group_id, caller).await? {
        return Err(ServiceError::forbidden("You are not a member of this group"));
    }

    let rows = sqlx::query(&format!(
        "{} WHERE gm.group_id = ? ORDER BY gm.created_at ASC",
        PROJECTION
    ))
    .bind(group_id)
    .fetch_all(&db.pool)
    .await?;

    // Assemble receipts for the whole history in one pass.
    let receipt_rows = sqlx::query(
        "SELECT r.message_id, r.user_id, r.read_at \
         FROM group_message_receipts r \
         JOIN group_messages gm ON gm.id = r.message_id \
         WHERE gm.group_id = ? ORDER BY r.delivered_at ASC",
    )
    .bind(group_id)
    .fetch_all(&db.pool)
    .await?;
    let mut by_message: HashMap<String, Receipts> = HashMap::new();
    for row in receipt_rows {
        let entry = by_message.entry(row.get("message_id")).or_default();
        let user_id: String = row.get("user_id");
        if row.get::<Option<i64>, _>("read_at").is_some() {
            entry.read_by.push(user_id.clone());
        }
        entry.delivered_to.push(user_id);
    }

    Ok(rows
        .iter()
        .map(|row| {
            let id: String = row.get("id");
            project(row, by_message.remove(&id).unwrap_or_default())
        })
        .collect())
}

/// Insert a delivery receipt for one member, keeping any existing one (a read
/// receipt is never downgraded). Returns whether a new receipt appeared.
pub async fn record_delivery(
    db: &Database,
    message_id: &str,
    user_id: &str,
) -> ServiceResult<bool> {
    let now = chrono::Utc::now().timestamp_millis();
    let res = sqlx::query(
        "INSERT INTO group_message_receipts (message_id, user_id, delivered_at) \
         VALUES (?, ?, ?) ON CONFLICT (message_id, user_id) DO NOTHING",
    )
    .bind(message_id)
    .bind(user_id)
    .bind(now)
    .execute(&db.pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// Apply a member's delivered/read acknowledgement and return the updated
/// message. A read always implies delivery, so the read-by list stays a
/// subset of the delivered-to list.
pub async fn update_status(
    db: Arc<Database>,
    message_id: &str,
    group_id: &str,
    user_id: &str,
    status: DeliveryStatus,
) -> ServiceResult<GroupMessage> {
    if status == DeliveryStatus::Sent {
        return Err(ServiceError::validation("Status must be delivered or read"));
    }
    let row = sqlx::query("SELECT group_id FROM group_messages WHERE id = ?")
        .bind(message_id)
        .fetch_optional(&db.pool)
        .await?
        .ok_or_else(|| ServiceError::not_found("Message not found"))?;
    if row.get::<String, _>("group_id") != group_id {
        return Err(ServiceError::not_found("Message not found in this group"));
    }
    if !groups::is_member(&db, group_id, user_id).await? {
        return Err(ServiceError::forbidden("You are not a member of this group"));
    }

    let now = chrono::Utc::now().timestamp_millis();
    match status {
        DeliveryStatus::Read => {
            sqlx::query(
                "INSERT INTO group_message_receipts (message_id, user_id, delivered_at, read_at) \
                 VALUES (?1, ?2, ?3, ?3) \
                 ON CONFLICT (message_id, user_id) \
                 DO UPDATE SET read_at = COALESCE(read_at, excluded.read_at)",
            )
            .bind(message_id)
            .bind(user_id)
            .bind(now)
            .execute(&db.pool)
            .await?;
        }
        DeliveryStatus::Delivered | DeliveryStatus::Sent => {
            // Sent is rejected above; only delivered reaches this arm.
            record_delivery(&db, message_id, user_id).await?;
        }
    }
    fetch_group_message(&db, message_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::users::testutil::{memory_db, seed_user};

    const NO_DEBOUNCE: i64 = 0;

    async fn group_of_three() -> (Arc<Database>, String) {
        let db = memory_db().await;
        for (id, name) in [("a", "ada"), ("b", "bob"), ("c", "cam")] {
            seed_user(&db, id, name).await;
        }
        let group = groups::create_group(db.clone(), "team", "", &["b".into(), "c".into()], "a")
            .await
            .unwrap();
        (db, group.id)
    }

    async fn backdate(db: &Database, message_id: &str, ms: i64) {
        let then = chrono::Utc::now().timestamp_millis() - ms;
        sqlx::query("UPDATE group_messages SET created_at = ? WHERE id = ?")
            .bind(then)
            .bind(message_id)
            .execute(&db.pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn fresh_message_is_sent_with_empty_receipts() {
        let (db, gid) = group_of_three().await;
        let msg = send_group_message(db, &gid, "a", "hi", MessageKind::Text, 2048, 5000)
            .await
            .unwrap();
        assert_eq!(msg.status, DeliveryStatus::Sent);
        assert!(msg.delivered_to.is_empty());
        assert!(msg.read_by.is_empty());
        assert_eq!(msg.group.name, "team");
        assert_eq!(msg.sender.username, "ada");
    }

    #[tokio::test]
    async fn duplicate_inside_window_is_debounced() {
        let (db, gid) = group_of_three().await;
        let first = send_group_message(db.clone(), &gid, "a", "hi", MessageKind::Text, 2048, 5000)
            .await
            .unwrap();
        let second = send_group_message(db.clone(), &gid, "a", "hi", MessageKind::Text, 2048, 5000)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);

        // Different body, sender or kind is never debounced.
        let other = send_group_message(db.clone(), &gid, "a", "yo", MessageKind::Text, 2048, 5000)
            .await
            .unwrap();
        assert_ne!(other.id, first.id);
        let from_b = send_group_message(db, &gid, "b", "hi", MessageKind::Text, 2048, 5000)
            .await
            .unwrap();
        assert_ne!(from_b.id, first.id);
    }

    #[tokio::test]
    async fn duplicate_outside_window_inserts_again() {
        let (db, gid) = group_of_three().await;
        let first = send_group_message(db.clone(), &gid, "a", "hi", MessageKind::Text, 2048, 5000)
            .await
            .unwrap();
        backdate(&db, &first.id, 6000).await;
        let second = send_group_message(db, &gid, "a", "hi", MessageKind::Text, 2048, 5000)
            .await
            .unwrap();
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn send_to_unknown_group_is_not_found() {
        let (db, _) = group_of_three().await;
        let err = send_group_message(db, "ghost", "a", "hi", MessageKind::Text, 2048, NO_DEBOUNCE)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn read_always_implies_delivery() {
        let (db, gid) = group_of_three().await;
        let msg = send_group_message(db.clone(), &gid, "a", "hi", MessageKind::Text, 2048, NO_DEBOUNCE)
            .await
            .unwrap();

        // b reads without a prior delivery receipt.
        let updated = update_status(db.clone(), &msg.id, &gid, "b", DeliveryStatus::Read)
            .await
            .unwrap();
        assert_eq!(updated.status, DeliveryStatus::Read);
        assert_eq!(updated.delivered_to, vec!["b".to_string()]);
        assert_eq!(updated.read_by, vec!["b".to_string()]);

        // c only acknowledges delivery; read-by stays a subset.
        let updated = update_status(db, &msg.id, &gid, "c", DeliveryStatus::Delivered)
            .await
            .unwrap();
        assert_eq!(updated.status, DeliveryStatus::Read);
        assert_eq!(updated.delivered_to.len(), 2);
        assert_eq!(updated.read_by, vec!["b".to_string()]);
        for reader in &updated.read_by {
            assert!(updated.delivered_to.contains(reader));
        }
    }

    #[tokio::test]
    async fn delivery_never_downgrades_a_read_receipt() {
        let (db, gid) = group_of_three().await;
        let msg = send_group_message(db.clone(), &gid, "a", "hi", MessageKind::Text, 2048, NO_DEBOUNCE)
            .await
            .unwrap();
        update_status(db.clone(), &msg.id, &gid, "b", DeliveryStatus::Read)
            .await
            .unwrap();
        let updated = update_status(db, &msg.id, &gid, "b", DeliveryStatus::Delivered)
            .await
            .unwrap();
        assert_eq!(updated.read_by, vec!["b".to_string()]);
        assert_eq!(updated.status, DeliveryStatus::Read);
    }

    #[tokio::test]
    async fn sent_is_not_an_acknowledgement() {
        let (db, gid) = group_of_three().await;
        let msg = send_group_message(db.clone(), &gid, "a", "hi", MessageKind::Text, 2048, NO_DEBOUNCE)
            .await
            .unwrap();
        let err = update_status(db.clone(), &msg.id, &gid, "b", DeliveryStatus::Sent)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
        let reloaded = fetch_group_message(&db, &msg.id).await.unwrap();
        assert!(reloaded.delivered_to.is_empty());
    }

    #[tokio::test]
    async fn status_from_non_member_is_forbidden() {
        let db = memory_db().await;
        for (id, name) in [("a", "ada"), ("b", "bob"), ("x", "xeno")] {
            seed_user(&db, id, name).await;
        }
        let group = groups::create_group(db.clone(), "team", "", &["b".into()], "a")
            .await
            .unwrap();
        let msg = send_group_message(db.clone(), &group.id, "a", "hi", MessageKind::Text, 2048, NO_DEBOUNCE)
            .await
            .unwrap();

        let err = update_status(db.clone(), &msg.id, &group.id, "x", DeliveryStatus::Read)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 403);
        let err = get_group_messages(db, &group.id, "x").await.unwrap_err();
        assert_eq!(err.status_code(), 403);
    }

    #[tokio::test]
    async fn status_for_message_outside_the_group_is_not_found() {
        let (db, gid) = group_of_three().await;
        let other = groups::create_group(db.clone(), "squad", "", &["b".into()], "a")
            .await
            .unwrap();
        let msg = send_group_message(db.clone(), &other.id, "a", "hi", MessageKind::Text, 2048, NO_DEBOUNCE)
            .await
            .unwrap();
        let err = update_status(db, &msg.id, &gid, "b", DeliveryStatus::Read)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn history_is_ascending_with_receipts_attached() {
        let (db, gid) = group_of_three().await;
        let m1 = send_group_message(db.clone(), &gid, "a", "one", MessageKind::Text, 2048, NO_DEBOUNCE)
            .await
            .unwrap();
        backdate(&db, &m1.id, 1000).await;
        let m2 = send_group_message(db.clone(), &gid, "b", "two", MessageKind::Text, 2048, NO_DEBOUNCE)
            .await
            .unwrap();
        update_status(db.clone(), &m1.id, &gid, "b", DeliveryStatus::Read)
            .await
            .unwrap();

        let history = get_group_messages(db, &gid, "c").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, m1.id);
        assert_eq!(history[0].read_by, vec!["b".to_string()]);
        assert_eq!(history[1].id, m2.id);
        assert!(history[1].delivered_to.is_empty());
    }
}
