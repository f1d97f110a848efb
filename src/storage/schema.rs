//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS readings (
            id INTEGER PRIMARY KEY,
            sensor_id TEXT NOT NULL,
            sensor_type TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            value REAL NOT NULL,
            unit TEXT NOT NULL,
            location TEXT,
            is_anomaly INTEGER,
            anomaly_score REAL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(sensor_id, timestamp) ON CONFLICT REPLACE
        );

        CREATE TABLE IF NOT EXISTS alerts (
            id INTEGER PRIMARY KEY,
            sensor_id TEXT NOT NULL,
            severity TEXT NOT NULL,
            message TEXT NOT NULL,
            anomaly_score REAL NOT NULL,
            sensor_value REAL NOT NULL,
            created_at TEXT NOT NULL,
            resolved INTEGER NOT NULL DEFAULT 0,
            resolved_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_readings_sensor_ts ON readings(sensor_id, timestamp);
        CREATE INDEX IF NOT EXISTS idx_readings_created ON readings(created_at);
        CREATE INDEX IF NOT EXISTS idx_alerts_sensor ON alerts(sensor_id);
        CREATE INDEX IF NOT EXISTS idx_alerts_created ON alerts(created_at);",
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM readings", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM alerts", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap(); // Should not error
    }

    #[test]
    fn test_duplicate_sensor_timestamp_replaces() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        conn.execute(
            "INSERT INTO readings (sensor_id, sensor_type, timestamp, value, unit)
             VALUES ('s1', 'temperature', '2026-01-01T00:00:00+00:00', 20.0, 'C')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO readings (sensor_id, sensor_type, timestamp, value, unit)
             VALUES ('s1', 'temperature', '2026-01-01T00:00:00+00:00', 21.5, 'C')",
            [],
        )
        .unwrap();

        let (count, value): (i64, f64) = conn
            .query_row(
                "SELECT COUNT(*), MAX(value) FROM readings WHERE sensor_id = 's1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(value, 21.5); // last write wins
    }
}
