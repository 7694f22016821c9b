use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::utils::uuid_from_db;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub content: String,
    pub kind: String,
    pub ride_id: Option<Uuid>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub recipient_id: Uuid,
    pub content: String,
    pub ride_id: Option<Uuid>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

fn notification_from_row(row: &SqliteRow) -> Result<Notification, sqlx::Error> {
    let ride_id: Option<String> = row.try_get("ride_id")?;
    Ok(Notification {
        id: uuid_from_db("id", &row.try_get::<String, _>("id")?)?,
        user_id: uuid_from_db("user_id", &row.try_get::<String, _>("user_id")?)?,
        title: row.try_get("title")?,
        content: row.try_get("content")?,
        kind: row.try_get("kind")?,
        ride_id: ride_id.map(|raw| uuid_from_db("ride_id", &raw)).transpose()?,
        read: row.try_get::<i64, _>("read")? != 0,
        created_at: row.try_get("created_at")?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message, sqlx::Error> {
    let ride_id: Option<String> = row.try_get("ride_id")?;
    Ok(Message {
        id: uuid_from_db("id", &row.try_get::<String, _>("id")?)?,
        sender_id: uuid_from_db("sender_id", &row.try_get::<String, _>("sender_id")?)?,
        recipient_id: uuid_from_db("recipient_id", &row.try_get::<String, _>("recipient_id")?)?,
        content: row.try_get("content")?,
        ride_id: ride_id.map(|raw| uuid_from_db("ride_id", &raw)).transpose()?,
        read: row.try_get::<i64, _>("read")? != 0,
        created_at: row.try_get("created_at")?,
    })
}

// Append-only inbox rows; only the read flag is ever mutated. Written by the
// side-effect dispatcher, never by the lifecycle transaction itself.
#[derive(Clone)]
pub struct InboxStore {
    pool: SqlitePool,
}

impl InboxStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn notify(
        &self,
        user_id: Uuid,
        title: &str,
        content: &str,
        kind: &str,
        ride_id: Option<Uuid>,
    ) -> Result<Uuid, sqlx::Error> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO notifications (id, user_id, title, content, kind, ride_id, read, created_at)
            VALUES (?, ?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(user_id.to_string())
        .bind(title)
        .bind(content)
        .bind(kind)
        .bind(ride_id.map(|id| id.to_string()))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn send_message(
        &self,
        sender_id: Uuid,
        recipient_id: Uuid,
        content: &str,
        ride_id: Option<Uuid>,
    ) -> Result<Uuid, sqlx::Error> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO messages (id, sender_id, recipient_id, content, ride_id, read, created_at)
            VALUES (?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(sender_id.to_string())
        .bind(recipient_id.to_string())
        .bind(content)
        .bind(ride_id.map(|id| id.to_string()))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn list_notifications(&self, user_id: Uuid) -> Result<Vec<Notification>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT * FROM notifications WHERE user_id = ? ORDER BY created_at DESC",
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(notification_from_row).collect()
    }

    pub async fn mark_notification_read(
        &self,
        user_id: Uuid,
        notification_id: Uuid,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE notifications SET read = 1 WHERE id = ? AND user_id = ?")
            .bind(notification_id.to_string())
            .bind(user_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn list_messages(&self, user_id: Uuid) -> Result<Vec<Message>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE recipient_id = ? OR sender_id = ? ORDER BY created_at DESC",
        )
        .bind(user_id.to_string())
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }
}
