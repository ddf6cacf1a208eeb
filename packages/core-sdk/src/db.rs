use anyhow::Result;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::{path::Path, thread, time::Duration};

/** \brief Default database file in the working directory. */
pub const DEFAULT_DB_PATH: &str = "pocketchat.db";

const TELEMETRY_KEY: &str = "telemetry_enabled";

/**
 * \brief Open the database at `path` with a busy timeout.
 */
pub fn open_db(path: impl AsRef<Path>) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/**
 * \brief Create the tables this app needs. Safe to run on every start.
 * \details `secret_shared_prefs` only ever holds digests and ciphertext; see `secrets`.
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS app_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS secret_shared_prefs (
            key_digest TEXT PRIMARY KEY,
            value BLOB NOT NULL
        );
        "#,
        )
    })?;
    Ok(())
}

fn set_bool_config(conn: &Connection, key: &str, value: bool) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO app_config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, if value { "1" } else { "0" }],
        )
    })?;
    Ok(())
}

fn get_bool_config(conn: &Connection, key: &str, default: bool) -> Result<bool> {
    let val = conn
        .query_row(
            "SELECT value FROM app_config WHERE key=?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(val.map(|s| s == "1").unwrap_or(default))
}

pub fn get_telemetry_enabled(conn: &Connection) -> Result<bool> {
    get_bool_config(conn, TELEMETRY_KEY, false)
}

pub fn set_telemetry_enabled(conn: &Connection, enabled: bool) -> Result<()> {
    set_bool_config(conn, TELEMETRY_KEY, enabled)
}

/**
 * \brief Read one encrypted entry by its key digest.
 */
pub fn get_secret_blob(conn: &Connection, key_digest: &str) -> Result<Option<Vec<u8>>> {
    let blob = conn
        .query_row(
            "SELECT value FROM secret_shared_prefs WHERE key_digest=?1",
            params![key_digest],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .optional()?;
    Ok(blob)
}

/**
 * \brief Insert or replace one encrypted entry; a digest maps to at most one row.
 */
pub fn put_secret_blob(conn: &Connection, key_digest: &str, value: &[u8]) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO secret_shared_prefs (key_digest, value) VALUES (?1, ?2)
         ON CONFLICT(key_digest) DO UPDATE SET value=excluded.value",
            params![key_digest, value],
        )
    })?;
    Ok(())
}

/**
 * \brief Retry helper for SQLite lock contention.
 * \details Retries `database is locked` / `database table is locked` with a growing delay, at most 6 attempts.
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    for attempt in 0..=MAX_RETRIES {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                let backoff = Duration::from_millis(200 * (attempt as u64 + 1));
                thread::sleep(backoff);
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
    unreachable!("retry_on_locked should have returned within the loop");
}
