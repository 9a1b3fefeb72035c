//! SQLite-backed message cache
//!
//! The durable variant. Writes can be batched (configurable size and
//! timeout) to amortize disk cost under load; a dedicated writer task owns
//! the batch buffer and flushes it inside one transaction. Reads always go
//! to the database, so a freshly batched message only becomes visible once
//! its batch lands - `mark_published` bypasses the batch entirely and is
//! durable immediately, which the delayed sender relies on.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use herald_protocol::{Action, Attachment, Message, SinceMarker};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{CacheError, MessageCache, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    sequence INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL,
    time INTEGER NOT NULL,
    expires INTEGER NOT NULL,
    topic TEXT NOT NULL,
    message TEXT NOT NULL,
    title TEXT NOT NULL,
    priority INTEGER NOT NULL,
    tags TEXT NOT NULL,
    click TEXT NOT NULL,
    icon TEXT NOT NULL,
    actions TEXT NOT NULL,
    attachment_name TEXT NOT NULL,
    attachment_type TEXT NOT NULL,
    attachment_size INTEGER NOT NULL,
    attachment_expires INTEGER NOT NULL,
    attachment_url TEXT NOT NULL,
    sender TEXT NOT NULL,
    user TEXT NOT NULL,
    encoding TEXT NOT NULL,
    published INTEGER NOT NULL
)
"#;

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_messages_id ON messages (id)",
    "CREATE INDEX IF NOT EXISTS idx_messages_topic ON messages (topic)",
    "CREATE INDEX IF NOT EXISTS idx_messages_time ON messages (time)",
    "CREATE INDEX IF NOT EXISTS idx_messages_expires ON messages (expires)",
];

const INSERT: &str = r#"
INSERT INTO messages (
    id, time, expires, topic, message, title, priority, tags, click, icon,
    actions, attachment_name, attachment_type, attachment_size,
    attachment_expires, attachment_url, sender, user, encoding, published
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

struct QueuedMessage {
    message: Message,
    published: bool,
}

/// Message cache backed by SQLite
pub struct SqliteCache {
    pool: SqlitePool,
    queue: parking_lot::Mutex<Option<mpsc::Sender<QueuedMessage>>>,
    writer: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SqliteCache {
    /// Open or create a cache database at the given path.
    ///
    /// `batch_size` of zero disables batching; every insert is its own
    /// write.
    pub async fn new<P: AsRef<Path>>(
        path: P,
        batch_size: usize,
        batch_timeout: Duration,
    ) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .journal_mode(SqliteJournalMode::Wal)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::init(pool, batch_size, batch_timeout).await
    }

    /// In-memory database, for tests
    pub async fn memory() -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory database");
        Self::init(pool, 0, Duration::ZERO)
            .await
            .expect("in-memory schema")
    }

    /// In-memory database with write batching, for tests
    pub async fn memory_batching(batch_size: usize, batch_timeout: Duration) -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory database");
        Self::init(pool, batch_size, batch_timeout)
            .await
            .expect("in-memory schema")
    }

    async fn init(pool: SqlitePool, batch_size: usize, batch_timeout: Duration) -> Result<Self> {
        sqlx::query(SCHEMA).execute(&pool).await?;
        for index in INDEXES {
            sqlx::query(index).execute(&pool).await?;
        }
        let (queue, writer) = if batch_size > 0 {
            let (tx, rx) = mpsc::channel(batch_size.saturating_mul(8).max(64));
            let writer_pool = pool.clone();
            let handle =
                tokio::spawn(run_writer(writer_pool, rx, batch_size, batch_timeout));
            (Some(tx), Some(handle))
        } else {
            (None, None)
        };
        Ok(Self {
            pool,
            queue: parking_lot::Mutex::new(queue),
            writer: tokio::sync::Mutex::new(writer),
        })
    }
}

#[async_trait]
impl MessageCache for SqliteCache {
    async fn add_message(&self, message: &Message) -> Result<()> {
        let published = message.time <= Utc::now().timestamp();
        let queue = self.queue.lock().clone();
        match queue {
            Some(tx) => tx
                .send(QueuedMessage {
                    message: message.clone(),
                    published,
                })
                .await
                .map_err(|_| CacheError::Closed),
            None => insert_message(&self.pool, message, published).await,
        }
    }

    async fn message(&self, id: &str) -> Result<Message> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ? LIMIT 1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_message(&r)).ok_or(CacheError::NotFound)
    }

    async fn messages(
        &self,
        topic: &str,
        since: &SinceMarker,
        include_scheduled: bool,
    ) -> Result<Vec<Message>> {
        if since.is_none() {
            return Ok(Vec::new());
        }
        let mut qb: sqlx::QueryBuilder<sqlx::Sqlite> =
            sqlx::QueryBuilder::new("SELECT * FROM messages WHERE topic = ");
        qb.push_bind(topic);
        if !include_scheduled {
            qb.push(" AND published = 1");
        }
        match since {
            SinceMarker::None | SinceMarker::All => {}
            SinceMarker::Time(t) => {
                qb.push(" AND time >= ");
                qb.push_bind(*t);
            }
            SinceMarker::Id(id) => {
                // An unknown id falls back to a full replay
                qb.push(
                    " AND sequence > COALESCE((SELECT sequence FROM messages WHERE id = ",
                );
                qb.push_bind(id.as_str());
                qb.push(" LIMIT 1), 0)");
            }
        }
        qb.push(" ORDER BY sequence");
        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_message).collect())
    }

    async fn messages_due(&self) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE published = 0 AND time <= ? ORDER BY time",
        )
        .bind(Utc::now().timestamp())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_message).collect())
    }

    async fn mark_published(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE messages SET published = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn topics(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT topic FROM messages")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("topic")).collect())
    }

    async fn message_count(&self, topic: &str) -> Result<usize> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM messages WHERE topic = ?")
            .bind(topic)
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.get("count");
        Ok(count as usize)
    }

    async fn attachment_bytes_used(&self, sender: &str, user: Option<&str>) -> Result<u64> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(attachment_size), 0) AS size FROM messages
            WHERE (sender = ? OR (user != '' AND user = ?)) AND attachment_expires > ?
            "#,
        )
        .bind(sender)
        .bind(user.unwrap_or(""))
        .bind(Utc::now().timestamp())
        .fetch_one(&self.pool)
        .await?;
        let size: i64 = row.get("size");
        Ok(size as u64)
    }

    async fn attachments_expired(&self, now: i64) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM messages
            WHERE attachment_size > 0 AND attachment_expires > 0 AND attachment_expires <= ?
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    async fn prune(&self, now: i64) -> Result<()> {
        sqlx::query("DELETE FROM messages WHERE expires > 0 AND expires <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // Dropping the sender makes the writer flush its batch and exit
        self.queue.lock().take();
        if let Some(handle) = self.writer.lock().await.take() {
            let _ = handle.await;
        }
        self.pool.close().await;
        Ok(())
    }
}

async fn run_writer(
    pool: SqlitePool,
    mut rx: mpsc::Receiver<QueuedMessage>,
    batch_size: usize,
    batch_timeout: Duration,
) {
    let mut batch: Vec<QueuedMessage> = Vec::with_capacity(batch_size);
    loop {
        let next = if batch.is_empty() {
            rx.recv().await
        } else {
            match tokio::time::timeout(batch_timeout, rx.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    flush(&pool, &mut batch).await;
                    continue;
                }
            }
        };
        match next {
            Some(queued) => {
                batch.push(queued);
                if batch.len() >= batch_size {
                    flush(&pool, &mut batch).await;
                }
            }
            None => {
                flush(&pool, &mut batch).await;
                return;
            }
        }
    }
}

async fn flush(pool: &SqlitePool, batch: &mut Vec<QueuedMessage>) {
    if batch.is_empty() {
        return;
    }
    let count = batch.len();
    if let Err(e) = flush_tx(pool, batch).await {
        tracing::warn!(messages = count, error = %e, "message batch write failed");
    } else {
        tracing::trace!(messages = count, "message batch written");
    }
    batch.clear();
}

async fn flush_tx(pool: &SqlitePool, batch: &[QueuedMessage]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for queued in batch {
        insert_message(&mut *tx, &queued.message, queued.published).await?;
    }
    tx.commit().await?;
    Ok(())
}

async fn insert_message<'e, E>(executor: E, m: &Message, published: bool) -> Result<()>
where
    E: sqlx::SqliteExecutor<'e>,
{
    let actions = if m.actions.is_empty() {
        String::new()
    } else {
        serde_json::to_string(&m.actions).unwrap_or_default()
    };
    let attachment = m.attachment.clone().unwrap_or_default();
    sqlx::query(INSERT)
        .bind(&m.id)
        .bind(m.time)
        .bind(m.expires)
        .bind(&m.topic)
        .bind(&m.message)
        .bind(&m.title)
        .bind(m.priority as i64)
        .bind(m.tags.join(","))
        .bind(&m.click)
        .bind(&m.icon)
        .bind(actions)
        .bind(&attachment.name)
        .bind(&attachment.content_type)
        .bind(attachment.size)
        .bind(attachment.expires)
        .bind(&attachment.url)
        .bind(m.sender.to_string())
        .bind(m.user.clone().unwrap_or_default())
        .bind(&m.encoding)
        .bind(published as i64)
        .execute(executor)
        .await?;
    Ok(())
}

fn row_to_message(row: &SqliteRow) -> Message {
    let tags: String = row.get("tags");
    let actions_json: String = row.get("actions");
    let actions: Vec<Action> = if actions_json.is_empty() {
        Vec::new()
    } else {
        serde_json::from_str(&actions_json).unwrap_or_default()
    };
    let sender: String = row.get("sender");
    let user: String = row.get("user");
    let attachment_name: String = row.get("attachment_name");
    let attachment_url: String = row.get("attachment_url");
    let attachment = if attachment_name.is_empty() && attachment_url.is_empty() {
        None
    } else {
        Some(Attachment {
            name: attachment_name,
            content_type: row.get("attachment_type"),
            size: row.get("attachment_size"),
            expires: row.get("attachment_expires"),
            url: attachment_url,
            owner: String::new(),
        })
    };
    let mut m = Message::new(row.get("topic"));
    m.id = row.get("id");
    m.time = row.get("time");
    m.expires = row.get("expires");
    m.message = row.get("message");
    m.title = row.get("title");
    m.priority = row.get::<i64, _>("priority") as u8;
    m.tags = if tags.is_empty() {
        Vec::new()
    } else {
        tags.split(',').map(String::from).collect()
    };
    m.click = row.get("click");
    m.icon = row.get("icon");
    m.actions = actions;
    m.attachment = attachment;
    m.sender = sender.parse().unwrap_or(m.sender);
    m.user = (!user.is_empty()).then_some(user);
    m.encoding = row.get("encoding");
    m
}

#[cfg(test)]
mod tests {
    use super::SqliteCache;
    use crate::cache::cache_conformance_tests;

    cache_conformance_tests!(SqliteCache::memory());
}
