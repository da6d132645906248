//! The persistent catch-up queue.
//!
//! Messages flowing through the bridge server are appended to a single
//! SQLite file; reconnecting clients replay everything addressed to or from
//! their phone numbers since a given instant. Retrieval is a paged cursor
//! over `(created_at, id)` so arbitrarily large backlogs stream without
//! loading into memory.

mod migrate;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params, params_from_iter, types::Value};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sms_proto::Message;

/// Rows fetched per retrieval page.
const PAGE_SIZE: i64 = 100;

/// How often the retention sweeper wakes up.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Configuration for the catch-up queue.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Path to the SQLite database file.
    pub path: PathBuf,
    /// Delete messages older than this many seconds. Absent disables the
    /// sweeper; it is not required for correctness.
    #[serde(default)]
    pub max_age_secs: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("could not open message database: {0}")]
    Open(#[source] rusqlite::Error),
    #[error("could not migrate message database: {0}")]
    Migrate(#[source] rusqlite::Error),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Codec(#[from] sms_proto::CodecError),
}

/// A durable, append-only message log.
#[derive(Clone)]
pub struct MessageQueue {
    conn: Arc<Mutex<Connection>>,
    max_age: Option<Duration>,
}

impl MessageQueue {
    /// Opens (and migrates) the database at `cfg.path`.
    pub async fn open(cfg: &QueueConfig) -> Result<Self, QueueError> {
        let path = cfg.path.clone();
        let conn = tokio::task::spawn_blocking(move || open_connection(&path))
            .await
            .expect("open task panicked")?;
        tracing::info!(path = %cfg.path.display(), "opened catch-up message queue");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            max_age: cfg.max_age_secs.map(Duration::from_secs),
        })
    }

    /// An in-memory queue, for tests and ephemeral setups.
    pub async fn open_in_memory() -> Result<Self, QueueError> {
        let conn = tokio::task::spawn_blocking(|| {
            let mut conn = Connection::open_in_memory().map_err(QueueError::Open)?;
            migrate::migrate(&mut conn)?;
            Ok::<_, QueueError>(conn)
        })
        .await
        .expect("open task panicked")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            max_age: None,
        })
    }

    /// Appends one message. `created_at` is the message timestamp, or now if
    /// the message carries none.
    pub async fn store(&self, msg: &Message) -> Result<(), QueueError> {
        let payload = sms_proto::codec::encode_message(msg)?;
        let created_at = msg.timestamp.unwrap_or_else(Utc::now).timestamp();
        let from = msg.from.clone();
        let to = msg.to.clone();

        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.execute(
                "INSERT INTO messages (from_number, to_number, created_at, payload)
                 VALUES (?1, ?2, ?3, ?4)",
                params![from, to, created_at, payload],
            )?;
            Ok::<_, QueueError>(())
        })
        .await
        .expect("store task panicked")?;
        Ok(())
    }

    /// Streams messages created at or after `since` that are addressed to or
    /// from one of `numbers`, in `(created_at, id)` order. Dropping the
    /// receiver stops the retrieval.
    pub fn retrieve(
        &self,
        since: DateTime<Utc>,
        numbers: Vec<String>,
    ) -> mpsc::Receiver<Result<Message, QueueError>> {
        let (tx, rx) = mpsc::channel(PAGE_SIZE as usize);
        if numbers.is_empty() {
            return rx;
        }

        let conn = self.conn.clone();
        let since = since.timestamp();
        tokio::spawn(async move {
            let mut last_id = 0i64;
            loop {
                let page = {
                    let conn = conn.clone();
                    let numbers = numbers.clone();
                    tokio::task::spawn_blocking(move || {
                        let conn = conn.lock().unwrap();
                        query_page(&conn, last_id, since, &numbers)
                    })
                    .await
                    .expect("retrieve task panicked")
                };

                let rows = match page {
                    Ok(rows) => rows,
                    Err(err) => {
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                };
                if rows.is_empty() {
                    return;
                }

                for (id, payload) in rows {
                    last_id = id;
                    let result = sms_proto::codec::decode_message(&payload).map_err(Into::into);
                    let failed = result.is_err();
                    if tx.send(result).await.is_err() || failed {
                        return;
                    }
                }
            }
        });
        rx
    }

    /// Deletes messages older than `max_age`, returning how many went.
    pub async fn prune(&self, max_age: Duration) -> Result<usize, QueueError> {
        let cutoff = (Utc::now() - max_age).timestamp();
        let conn = self.conn.clone();
        let deleted = tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.execute("DELETE FROM messages WHERE created_at < ?1", params![cutoff])
        })
        .await
        .expect("prune task panicked")?;
        Ok(deleted)
    }

    /// Runs the retention sweeper until cancelled. Immediately returns if no
    /// `max_age` was configured.
    pub async fn run_retention(&self, cancel: CancellationToken) {
        let Some(max_age) = self.max_age else {
            return;
        };
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {}
            }
            match self.prune(max_age).await {
                Ok(0) => {}
                Ok(deleted) => tracing::debug!(deleted, "pruned expired messages"),
                Err(err) => tracing::warn!(%err, "could not prune expired messages"),
            }
        }
    }
}

fn open_connection(path: &std::path::Path) -> Result<Connection, QueueError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).ok();
    }

    let mut conn = Connection::open(path).map_err(QueueError::Open)?;

    // WAL mode for concurrent readers while the write path appends.
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(QueueError::Open)?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .map_err(QueueError::Open)?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(QueueError::Open)?;

    migrate::migrate(&mut conn)?;
    Ok(conn)
}

fn query_page(
    conn: &Connection,
    last_id: i64,
    since: i64,
    numbers: &[String],
) -> Result<Vec<(i64, Vec<u8>)>, QueueError> {
    let placeholders = numbers
        .iter()
        .map(|_| "?")
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT id, payload FROM messages
         WHERE id > ? AND created_at >= ?
           AND (from_number IN ({placeholders}) OR to_number IN ({placeholders}))
         ORDER BY created_at ASC, id ASC
         LIMIT {PAGE_SIZE}"
    );

    let mut values: Vec<Value> = Vec::with_capacity(2 + numbers.len() * 2);
    values.push(Value::Integer(last_id));
    values.push(Value::Integer(since));
    for number in numbers {
        values.push(Value::Text(number.clone()));
    }
    for number in numbers {
        values.push(Value::Text(number.clone()));
    }

    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(values), |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
