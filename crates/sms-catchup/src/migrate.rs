//! Linear schema migrations, versioned through SQLite's `user_version`
//! pragma. Each entry runs in its own transaction; the pragma records how
//! many have been applied.

use rusqlite::Connection;

use crate::QueueError;

const MIGRATIONS: &[&str] = &[
    // v1: the message log.
    "CREATE TABLE messages (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        from_number TEXT    NOT NULL,
        to_number   TEXT    NOT NULL,
        created_at  INTEGER NOT NULL,
        payload     BLOB    NOT NULL
    );
    CREATE INDEX messages_created_at_idx ON messages (created_at, id);
    CREATE INDEX messages_to_number_idx ON messages (to_number);",
];

pub(crate) fn migrate(conn: &mut Connection) -> Result<(), QueueError> {
    let version: i64 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(QueueError::Migrate)?;

    for (i, migration) in MIGRATIONS.iter().enumerate().skip(version as usize) {
        let tx = conn.transaction().map_err(QueueError::Migrate)?;
        tx.execute_batch(migration).map_err(QueueError::Migrate)?;
        tx.pragma_update(None, "user_version", (i + 1) as i64)
            .map_err(QueueError::Migrate)?;
        tx.commit().map_err(QueueError::Migrate)?;
        tracing::debug!(version = i + 1, "applied message queue migration");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_sets_user_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, MIGRATIONS.len() as i64);
    }

    #[test]
    fn migrate_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();
        conn.execute(
            "INSERT INTO messages (from_number, to_number, created_at, payload)
             VALUES ('+1', '+2', 0, x'00')",
            [],
        )
        .unwrap();
    }
}
