use crate::common::models::{GroupBrief, Notification, UserBrief};
use crate::server::database::Database;
use crate::server::error::{ServiceError, ServiceResult};
use sqlx::Row;
use std::sync::Arc;

const FETCH_LIMIT: i64 = 50;

/// Unread activity for a user, newest first: direct messages not yet read,
/// and group messages in the user's groups whose coarse status has not
/// reached read (one member reading silences the message for everyone).
/// Nothing is stored per-notification; the listing is derived.
pub async fn notifications_for(db: Arc<Database>, user_id: &str) -> ServiceResult<Vec<Notification>> {
    let direct_rows = sqlx::query(
        "SELECT m.id, m.body, m.sender_id, m.created_at, \
            u.username, u.profile_picture \
         FROM messages m JOIN users u ON u.id = m.sender_id \
         WHERE m.receiver_id = ? AND m.status != 'read' \
         ORDER BY m.created_at DESC LIMIT ?",
    )
    .bind(user_id)
    .bind(FETCH_LIMIT)
    .fetch_all(&db.pool)
    .await?;

    let group_rows = sqlx::query(
        "SELECT gm.id, gm.body, gm.sender_id, gm.created_at, \
            u.username, u.profile_picture, \
            g.id AS g_id, g.name AS g_name, g.image AS g_image \
         FROM group_messages gm \
         JOIN groups g ON g.id = gm.group_id \
         JOIN users u ON u.id = gm.sender_id \
         JOIN group_members me ON me.group_id = gm.group_id AND me.user_id = ?1 \
         WHERE gm.sender_id != ?1 \
           AND NOT EXISTS (SELECT 1 FROM group_message_receipts r \
                           WHERE r.message_id = gm.id AND r.read_at IS NOT NULL) \
         ORDER BY gm.created_at DESC LIMIT ?2",
    )
    .bind(user_id)
    .bind(FETCH_LIMIT)
    .fetch_all(&db.pool)
    .await?;

    let mut notifications = Vec::with_capacity(direct_rows.len() + group_rows.len());
    for row in &direct_rows {
        notifications.push(Notification {
            id: row.get("id"),
            is_group_chat: false,
            sender: UserBrief {
                id: row.get("sender_id"),
                username: row.get("username"),
                profile_picture: row.get("profile_picture"),
            },
            content: row.get("body"),
            chat_id: row.get("sender_id"),
            group_info: None,
            created_at: row.get("created_at"),
        });
    }
    for row in &group_rows {
        notifications.push(Notification {
            id: row.get("id"),
            is_group_chat: true,
            sender: UserBrief {
                id: row.get("sender_id"),
                username: row.get("username"),
                profile_picture: row.get("profile_picture"),
            },
            content: row.get("body"),
            chat_id: row.get("g_id"),
            group_info: Some(GroupBrief {
                id: row.get("g_id"),
                name: row.get("g_name"),
                image: row.get("g_image"),
            }),
            created_at: row.get("created_at"),
        });
    }
    notifications.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(notifications)
}

/// Clear notifications by marking their backing messages read for the caller.
/// Direct ids only transition when the caller is the receiver; group ids get
/// a read receipt upsert. Unknown ids are ignored.
pub async fn mark_read(db: Arc<Database>, user_id: &str, ids: &[String]) -> ServiceResult<()> {
    if ids.is_empty() {
        return Err(ServiceError::validation("Please provide message IDs to mark as read"));
    }

    let placeholders = vec!["?"; ids.len()].join(", ");
    let direct_sql = format!(
        "UPDATE messages SET status = 'read' \
         WHERE receiver_id = ? AND status != 'read' AND id IN ({})",
        placeholders
    );
    let mut direct = sqlx::query(&direct_sql).bind(user_id);
    for id in ids {
        direct = direct.bind(id);
    }
    direct.execute(&db.pool).await?;

    let now = chrono::Utc::now().timestamp_millis();
    let group_sql = format!(
        "INSERT INTO group_message_receipts (message_id, user_id, delivered_at, read_at) \
         SELECT gm.id, ?, ?, ? FROM group_messages gm WHERE gm.id IN ({}) \
         ON CONFLICT (message_id, user_id) \
         DO UPDATE SET read_at = COALESCE(read_at, excluded.read_at)",
        placeholders
    );
    let mut group = sqlx::query(&group_sql).bind(user_id).bind(now).bind(now);
    for id in ids {
        group = group.bind(id);
    }
    group.execute(&db.pool).await?;

    log::debug!("[NOTIF] User {} cleared {} notification(s)", user_id, ids.len());
    Ok(())
}
