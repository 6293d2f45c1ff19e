//! Table definitions

use rusqlite::Connection;

/// Create all tables and indexes
pub fn create_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        -- Devices: one row per address, liveness tracked per discovery method
        CREATE TABLE IF NOT EXISTS devices (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ip TEXT UNIQUE NOT NULL,
            mac TEXT,
            hostname TEXT,
            vendor TEXT,
            os TEXT,
            tags TEXT,
            note TEXT,
            first_seen TEXT NOT NULL,
            cli_last_seen TEXT,
            cli_offline_at TEXT,
            rest_last_seen TEXT,
            rest_offline_at TEXT
        );

        CREATE TABLE IF NOT EXISTS scheduled_jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            ranges TEXT NOT NULL,
            method TEXT NOT NULL,
            params TEXT NOT NULL DEFAULT '{}',
            cron TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            last_run_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS scan_runs (
            token TEXT PRIMARY KEY,
            ranges TEXT NOT NULL,
            method TEXT NOT NULL,
            params TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL,
            progress INTEGER NOT NULL DEFAULT 0,
            output TEXT NOT NULL DEFAULT '',
            total_hosts INTEGER NOT NULL DEFAULT 0,
            online_count INTEGER NOT NULL DEFAULT 0,
            new_count INTEGER NOT NULL DEFAULT 0,
            offline_count INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            created_at TEXT NOT NULL,
            started_at TEXT,
            finished_at TEXT
        );

        CREATE TABLE IF NOT EXISTS job_executions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id INTEGER NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            status TEXT NOT NULL,
            online_count INTEGER NOT NULL DEFAULT 0,
            new_count INTEGER NOT NULL DEFAULT 0,
            offline_count INTEGER NOT NULL DEFAULT 0,
            output TEXT,
            error TEXT,
            FOREIGN KEY (job_id) REFERENCES scheduled_jobs(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS app_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS ban_targets (
            ip TEXT PRIMARY KEY,
            note TEXT,
            added_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS ban_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            action TEXT NOT NULL,
            targets TEXT NOT NULL,
            detail TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS system_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_type TEXT NOT NULL,
            category TEXT NOT NULL,
            message TEXT NOT NULL,
            details TEXT,
            severity TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_executions_job ON job_executions(job_id, started_at);
        CREATE INDEX IF NOT EXISTS idx_runs_created ON scan_runs(created_at);
        CREATE INDEX IF NOT EXISTS idx_events_created ON system_events(created_at);
        "#,
    )
}
