use rusqlite::Connection;

/// Version 1 of the mailroom store.
pub fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            google_id TEXT NOT NULL UNIQUE,
            email TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            picture TEXT,
            access_token TEXT,
            refresh_token TEXT,
            token_expiry TEXT,
            preferences TEXT,
            last_sync TEXT,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS emails (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            gmail_id TEXT NOT NULL,
            message_id TEXT NOT NULL,
            thread_id TEXT,
            subject TEXT,
            from_name TEXT,
            from_email TEXT NOT NULL,
            to_emails TEXT,
            cc_emails TEXT,
            bcc_emails TEXT,
            date TEXT NOT NULL,
            body_text TEXT,
            body_html TEXT,
            attachments TEXT NOT NULL DEFAULT '[]',
            labels TEXT NOT NULL DEFAULT '[]',
            is_read BOOLEAN NOT NULL DEFAULT false,
            is_starred BOOLEAN NOT NULL DEFAULT false,
            is_important BOOLEAN NOT NULL DEFAULT false,
            snippet TEXT,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
            UNIQUE(user_id, gmail_id)
        );

        CREATE TABLE IF NOT EXISTS sync_state (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );

        CREATE INDEX IF NOT EXISTS idx_emails_user_id ON emails(user_id);
        CREATE INDEX IF NOT EXISTS idx_emails_message_id ON emails(message_id);
        CREATE INDEX IF NOT EXISTS idx_emails_from_email ON emails(from_email);
        CREATE INDEX IF NOT EXISTS idx_emails_date ON emails(date);
        CREATE INDEX IF NOT EXISTS idx_emails_is_read ON emails(is_read);
        CREATE INDEX IF NOT EXISTS idx_emails_is_starred ON emails(is_starred);
        "#,
    )
}
