use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

#[derive(Debug, Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        log::info!("[DB] Connecting to {}", database_url);

        // Strip the sqlite prefix so the parent directory can be created
        // before the pool opens the file.
        let file_path = database_url
            .trim_start_matches("sqlite://")
            .trim_start_matches("sqlite:");
        let file_path = file_path.split('?').next().unwrap_or(file_path);

        if let Some(parent) = std::path::Path::new(file_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| sqlx::Error::Configuration(Box::new(e)))?;
                log::info!("[DB] Created data directory {:?}", parent);
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        log::info!("[DB] Connection pool ready");
        Ok(Self { pool })
    }

    /// Open an in-memory database with a single-connection pool (every
    /// connection of an in-memory SQLite database is its own database).
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        // Users. Registration itself lives outside this service; rows are
        // seeded by the collaborator that owns signup.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL,
                mobile TEXT UNIQUE,
                password_hash TEXT,
                profile_picture TEXT NOT NULL DEFAULT '',
                status_text TEXT NOT NULL DEFAULT '',
                last_seen INTEGER NOT NULL DEFAULT 0,
                push_notifications_enabled INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        // Sessions (token -> caller identity).
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                session_token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        // Direct messages. Status transitions are guarded so they only move
        // forward: sent -> delivered -> read.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                sender_id TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                body TEXT NOT NULL,
                kind TEXT NOT NULL DEFAULT 'text',
                status TEXT NOT NULL DEFAULT 'sent',
                created_at INTEGER NOT NULL
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        // Group messages carry no scalar status column; the coarse status is
        // derived from the receipt rows at read time.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS group_messages (
                id TEXT PRIMARY KEY,
                group_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                body TEXT NOT NULL,
                kind TEXT NOT NULL DEFAULT 'text',
                created_at INTEGER NOT NULL
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        // Per-member delivery/read receipts. A read receipt always has a
        // delivered_at too, which keeps readBy a subset of deliveredTo.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS group_message_receipts (
                message_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                delivered_at INTEGER NOT NULL,
                read_at INTEGER,
                PRIMARY KEY (message_id, user_id)
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS groups (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                image TEXT NOT NULL DEFAULT '',
                admin_id TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS group_members (
                group_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                joined_at INTEGER NOT NULL,
                PRIMARY KEY (group_id, user_id)
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        // Per-user soft-hide markers for direct messages.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deleted_messages (
                message_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                deleted_at INTEGER NOT NULL,
                PRIMARY KEY (message_id, user_id)
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
