use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::db::schema;

const SCHEMA_VERSION_KEY: &str = "schema_version";

struct Migration {
    version: u32,
    name: &'static str,
    apply: fn(&Connection) -> rusqlite::Result<()>,
}

/// Applied in order; a step and its version bump commit together.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "users, emails and unique (user_id, gmail_id)",
        apply: schema::create_schema,
    },
    Migration {
        version: 2,
        name: "per-user newest-first inbox index",
        apply: add_inbox_date_index,
    },
];

pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |migration| migration.version)
}

/// Brings the mailroom store up to [`latest_version`]. The version lives in
/// `sync_state` next to the per-user page cursors.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sync_state (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );
        "#,
    )
    .context("create sync_state table")?;

    let stored = stored_version(conn)?;
    let latest = latest_version();
    if stored > latest {
        return Err(anyhow!(
            "mailroom database is at schema version {stored}, this build only knows up to {latest}"
        ));
    }

    for migration in MIGRATIONS.iter().filter(|m| m.version > stored) {
        let tx = conn
            .unchecked_transaction()
            .with_context(|| format!("begin migration v{}", migration.version))?;
        (migration.apply)(&tx)
            .with_context(|| format!("migration v{} ({})", migration.version, migration.name))?;
        tx.execute(
            r#"
            INSERT INTO sync_state (key, value, updated_at)
            VALUES (?1, ?2, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![SCHEMA_VERSION_KEY, migration.version.to_string()],
        )?;
        tx.commit()
            .with_context(|| format!("commit migration v{}", migration.version))?;
    }

    Ok(())
}

fn stored_version(conn: &Connection) -> Result<u32> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM sync_state WHERE key = ?1",
            params![SCHEMA_VERSION_KEY],
            |row| row.get(0),
        )
        .optional()
        .context("read schema version")?;

    raw.map_or(Ok(0), |value| {
        value
            .parse::<u32>()
            .with_context(|| format!("schema version '{value}' is not a number"))
    })
}

fn add_inbox_date_index(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_emails_user_date ON emails(user_id, date DESC);",
    )
}
