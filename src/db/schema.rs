use rusqlite::Connection;

pub fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS authorized_scripts (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            script_url      TEXT NOT NULL,
            script_hash     TEXT,
            hash_algorithm  TEXT NOT NULL DEFAULT 'sha384',
            purpose         TEXT NOT NULL DEFAULT '',
            justification   TEXT NOT NULL,
            risk_level      INTEGER NOT NULL DEFAULT 1,
            is_active       INTEGER NOT NULL DEFAULT 1,
            source          TEXT NOT NULL,
            domain          TEXT NOT NULL DEFAULT '',
            authorized_by   TEXT NOT NULL DEFAULT '',
            authorized_on   TEXT NOT NULL,
            last_verified   TEXT NOT NULL,
            store_id        INTEGER NOT NULL,
            UNIQUE (script_url, store_id)
        );

        CREATE TABLE IF NOT EXISTS compliance_alerts (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            store_id    INTEGER NOT NULL,
            alert_type  TEXT NOT NULL,
            alert_level TEXT NOT NULL,
            message     TEXT NOT NULL,
            details     TEXT NOT NULL DEFAULT '{}', -- JSON
            script_url  TEXT,
            page_url    TEXT,
            is_resolved INTEGER NOT NULL DEFAULT 0,
            created_on  TEXT NOT NULL,
            resolved_on TEXT,
            resolved_by TEXT,
            notified    INTEGER NOT NULL DEFAULT 0,
            notified_on TEXT
        );

        CREATE TABLE IF NOT EXISTS monitoring_logs (
            id                   INTEGER PRIMARY KEY AUTOINCREMENT,
            store_id             INTEGER NOT NULL,
            page_url             TEXT NOT NULL,
            detected_scripts     TEXT NOT NULL DEFAULT '[]', -- JSON array
            http_headers         TEXT NOT NULL DEFAULT '{}', -- JSON object
            unauthorized_scripts TEXT NOT NULL DEFAULT '[]', -- JSON array
            has_unauthorized     INTEGER NOT NULL DEFAULT 0,
            checked_on           TEXT NOT NULL,
            check_type           TEXT NOT NULL,
            user_agent           TEXT,
            total_scripts        INTEGER NOT NULL DEFAULT 0,
            authorized_count     INTEGER NOT NULL DEFAULT 0,
            unauthorized_count   INTEGER NOT NULL DEFAULT 0,
            alert_sent           INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_scripts_store_url ON authorized_scripts(store_id, script_url);
        CREATE INDEX IF NOT EXISTS idx_scripts_last_verified ON authorized_scripts(last_verified);
        CREATE INDEX IF NOT EXISTS idx_alerts_dedup ON compliance_alerts(store_id, alert_type, created_on DESC);
        CREATE INDEX IF NOT EXISTS idx_alerts_created ON compliance_alerts(created_on DESC);
        CREATE INDEX IF NOT EXISTS idx_logs_store_checked ON monitoring_logs(store_id, checked_on DESC);
        ",
    )?;
    Ok(())
}
