use crate::server::database::Database;
use sqlx::Row;
use std::sync::Arc;

/// Resolve a session token to its user id, if the session exists and has not
/// expired. Token issuance belongs to the authentication collaborator; this
/// service only reads the sessions table.
pub async fn validate_session(db: Arc<Database>, session_token: &str) -> Option<String> {
    let now = chrono::Utc::now().timestamp_millis();
    let row = sqlx::query("SELECT user_id FROM sessions WHERE session_token = ? AND expires_at > ?")
        .bind(session_token)
        .bind(now)
        .fetch_optional(&db.pool)
        .await
        .ok()?;
    match row {
        Some(row) => Some(row.get::<String, _>("user_id")),
        None => {
            log::debug!("[AUTH] validate_session: token invalid or expired");
            None
        }
    }
}

/// Insert a session row for a user and return the token. Used by operator
/// tooling and tests; production tokens come from the auth collaborator.
pub async fn open_session(
    db: Arc<Database>,
    user_id: &str,
    expiry_days: u32,
) -> Result<String, sqlx::Error> {
    let token = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().timestamp_millis();
    let expires = now + i64::from(expiry_days) * 24 * 60 * 60 * 1000;
    sqlx::query("INSERT INTO sessions (session_token, user_id, created_at, expires_at) VALUES (?, ?, ?, ?)")
        .bind(&token)
        .bind(user_id)
        .bind(now)
        .bind(expires)
        .execute(&db.pool)
        .await?;
    log::info!("[AUTH] Opened session for user {}", user_id);
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn db() -> Arc<Database> {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        Arc::new(db)
    }

    #[tokio::test]
    async fn open_then_validate_session() {
        let db = db().await;
        let token = open_session(db.clone(), "u1", 7).await.unwrap();
        assert_eq!(validate_session(db.clone(), &token).await.as_deref(), Some("u1"));
        assert!(validate_session(db, "no-such-token").await.is_none());
    }

    #[tokio::test]
    async fn expired_session_is_rejected() {
        let db = db().await;
        let token = open_session(db.clone(), "u1", 0).await.unwrap();
        assert!(validate_session(db, &token).await.is_none());
    }
}
