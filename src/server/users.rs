use crate::common::models::{UserBrief, UserStatus};
use crate::server::database::Database;
use crate::server::error::{ServiceError, ServiceResult};
use sqlx::Row;
use std::sync::Arc;

pub async fn user_exists(db: &Database, user_id: &str) -> ServiceResult<bool> {
    let row = sqlx::query("SELECT 1 FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(&db.pool)
        .await?;
    Ok(row.is_some())
}

pub async fn user_brief(db: &Database, user_id: &str) -> ServiceResult<UserBrief> {
    let row = sqlx::query("SELECT id, username, profile_picture FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(&db.pool)
        .await?
        .ok_or_else(|| ServiceError::not_found("User not found"))?;
    Ok(UserBrief {
        id: row.get("id"),
        username: row.get("username"),
        profile_picture: row.get("profile_picture"),
    })
}

/// Persist `last_seen = now`; returns the written timestamp so presence
/// broadcasts can carry it.
pub async fn touch_last_seen(db: &Database, user_id: &str) -> ServiceResult<i64> {
    let now = chrono::Utc::now().timestamp_millis();
    sqlx::query("UPDATE users SET last_seen = ? WHERE id = ?")
        .bind(now)
        .bind(user_id)
        .execute(&db.pool)
        .await?;
    Ok(now)
}

/// Online-status approximation for polling clients: a user counts as online
/// while `now - last_seen` is inside the window, independent of the live
/// registry.
pub async fn user_status(
    db: &Database,
    user_id: &str,
    online_window_ms: i64,
) -> ServiceResult<UserStatus> {
    let row = sqlx::query("SELECT last_seen FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(&db.pool)
        .await?
        .ok_or_else(|| ServiceError::not_found("User not found"))?;
    let last_seen: i64 = row.get("last_seen");
    let now = chrono::Utc::now().timestamp_millis();
    Ok(UserStatus {
        is_online: now - last_seen < online_window_ms,
        last_seen,
    })
}

pub async fn toggle_push_notifications(
    db: Arc<Database>,
    user_id: &str,
    enabled: bool,
) -> ServiceResult<String> {
    let res = sqlx::query("UPDATE users SET push_notifications_enabled = ? WHERE id = ?")
        .bind(enabled as i64)
        .bind(user_id)
        .execute(&db.pool)
        .await?;
    if res.rows_affected() == 0 {
        return Err(ServiceError::not_found("User not found"));
    }
    log::info!("[USERS] Push notifications {} for user {}", if enabled { "enabled" } else { "disabled" }, user_id);
    Ok(format!(
        "Push notifications {}",
        if enabled { "enabled" } else { "disabled" }
    ))
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Insert a user row; registration proper is outside this service.
    pub async fn seed_user(db: &Database, id: &str, username: &str) {
        let now = chrono::Utc::now().timestamp_millis();
        sqlx::query(
            "INSERT INTO users (id, username, last_seen, created_at) VALUES (?, ?, 0, ?)",
        )
        .bind(id)
        .bind(username)
        .bind(now)
        .execute(&db.pool)
        .await
        .unwrap();
    }

    pub async fn memory_db() -> Arc<Database> {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        Arc::new(db)
    }
}
