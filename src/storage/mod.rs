//! SQLite storage layer -- schema, queries, migrations.
//!
//! This is the durable-store boundary of the core pipeline: readings and
//! alerts are persisted here, the labeled corpus for training is read from
//! here, and the window cache falls back to here on a cold start.

pub mod schema;

use anyhow::Result;
use chrono::{DateTime, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use serde::{Deserialize, Serialize};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Open an in-memory database. Test and simulation use only.
pub fn open_memory_pool() -> Result<Pool> {
    let manager = SqliteConnectionManager::memory();
    let pool = R2D2Pool::builder().max_size(1).build(manager)?;
    let conn = pool.get()?;
    schema::migrate(&conn)?;
    Ok(pool)
}

/// A single sensor reading as produced by the ingestion boundary.
/// Immutable once created; anomaly annotations live on the stored row,
/// never on this struct.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reading {
    pub sensor_id: String,
    pub sensor_type: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub unit: String,
    #[serde(default)]
    pub location: Option<String>,
}

/// A stored reading plus the detector's annotations.
#[derive(Debug, Clone, Serialize)]
pub struct StoredReading {
    pub id: i64,
    #[serde(flatten)]
    pub reading: Reading,
    pub is_anomaly: Option<bool>,
    pub anomaly_score: Option<f64>,
}

/// A corpus row for training: a reading plus its ground-truth label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabeledReading {
    #[serde(flatten)]
    pub reading: Reading,
    pub is_anomaly: bool,
}

/// Filters for `list_readings`.
#[derive(Debug, Clone, Default)]
pub struct ReadingFilter {
    pub sensor_id: Option<String>,
    pub sensor_type: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

/// Save a reading. Same (sensor_id, timestamp) replaces the prior row,
/// which makes ingest idempotent against duplicate delivery.
pub fn save_reading(pool: &Pool, r: &Reading) -> Result<i64> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO readings (sensor_id, sensor_type, timestamp, value, unit, location)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            r.sensor_id,
            r.sensor_type,
            r.timestamp.to_rfc3339(),
            r.value,
            r.unit,
            r.location,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Load the trailing window of readings for one sensor, oldest first.
pub fn load_window(pool: &Pool, sensor_id: &str, since: DateTime<Utc>) -> Result<Vec<Reading>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT sensor_id, sensor_type, timestamp, value, unit, location
         FROM readings
         WHERE sensor_id = ?1 AND timestamp >= ?2
         ORDER BY timestamp ASC",
    )?;

    let rows = stmt.query_map(params![sensor_id, since.to_rfc3339()], |row| {
        Ok(Reading {
            sensor_id: row.get(0)?,
            sensor_type: row.get(1)?,
            timestamp: parse_ts(row, 2)?,
            value: row.get(3)?,
            unit: row.get(4)?,
            location: row.get(5)?,
        })
    })?;

    let mut readings = Vec::new();
    for r in rows {
        readings.push(r?);
    }
    Ok(readings)
}

/// Load every labeled row for training, grouped per sensor in time order.
/// A row is labeled when its `is_anomaly` column is non-NULL.
pub fn load_labeled_corpus(pool: &Pool) -> Result<Vec<LabeledReading>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT sensor_id, sensor_type, timestamp, value, unit, location, is_anomaly
         FROM readings
         WHERE is_anomaly IS NOT NULL
         ORDER BY sensor_id ASC, timestamp ASC",
    )?;

    let rows = stmt.query_map([], |row| {
        Ok(LabeledReading {
            reading: Reading {
                sensor_id: row.get(0)?,
                sensor_type: row.get(1)?,
                timestamp: parse_ts(row, 2)?,
                value: row.get(3)?,
                unit: row.get(4)?,
                location: row.get(5)?,
            },
            is_anomaly: row.get::<_, i64>(6)? != 0,
        })
    })?;

    let mut corpus = Vec::new();
    for r in rows {
        corpus.push(r?);
    }
    Ok(corpus)
}

/// Insert a labeled corpus row directly. Used by the train endpoint when a
/// corpus is uploaded, and by the simulator.
pub fn save_labeled_reading(pool: &Pool, r: &LabeledReading) -> Result<i64> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO readings (sensor_id, sensor_type, timestamp, value, unit, location, is_anomaly)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            r.reading.sensor_id,
            r.reading.sensor_type,
            r.reading.timestamp.to_rfc3339(),
            r.reading.value,
            r.reading.unit,
            r.reading.location,
            r.is_anomaly as i64,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Write the detector's verdict back onto the stored reading.
pub fn update_reading_anomaly(pool: &Pool, id: i64, is_anomaly: bool, score: f64) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "UPDATE readings SET is_anomaly = ?1, anomaly_score = ?2 WHERE id = ?3",
        params![is_anomaly as i64, score, id],
    )?;
    Ok(())
}

/// List stored readings, newest first, with optional filtering.
pub fn list_readings(pool: &Pool, filter: &ReadingFilter) -> Result<Vec<StoredReading>> {
    let conn = pool.get()?;
    let mut sql = String::from(
        "SELECT id, sensor_id, sensor_type, timestamp, value, unit, location, is_anomaly, anomaly_score
         FROM readings WHERE 1=1",
    );
    let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(ref sid) = filter.sensor_id {
        args.push(Box::new(sid.clone()));
        sql.push_str(&format!(" AND sensor_id = ?{}", args.len()));
    }
    if let Some(ref st) = filter.sensor_type {
        args.push(Box::new(st.clone()));
        sql.push_str(&format!(" AND sensor_type = ?{}", args.len()));
    }
    let limit = if filter.limit == 0 { 100 } else { filter.limit };
    args.push(Box::new(limit as i64));
    sql.push_str(&format!(" ORDER BY timestamp DESC LIMIT ?{}", args.len()));
    args.push(Box::new(filter.offset as i64));
    sql.push_str(&format!(" OFFSET ?{}", args.len()));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), row_to_stored)?;

    let mut readings = Vec::new();
    for r in rows {
        readings.push(r?);
    }
    Ok(readings)
}

/// Latest stored reading for one sensor, if any.
pub fn latest_reading(pool: &Pool, sensor_id: &str) -> Result<Option<StoredReading>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT id, sensor_id, sensor_type, timestamp, value, unit, location, is_anomaly, anomaly_score
         FROM readings WHERE sensor_id = ?1 ORDER BY timestamp DESC LIMIT 1",
    )?;
    let mut rows = stmt.query_map(params![sensor_id], row_to_stored)?;
    match rows.next() {
        Some(r) => Ok(Some(r?)),
        None => Ok(None),
    }
}

/// Platform-wide counters for the monitoring surface.
#[derive(Debug, Clone, Serialize)]
pub struct PlatformStats {
    pub total_readings: i64,
    pub total_alerts: i64,
    pub active_sensors_24h: i64,
    pub recent_alerts_24h: i64,
    pub anomaly_rate_percent: f64,
}

pub fn platform_stats(pool: &Pool) -> Result<PlatformStats> {
    let conn = pool.get()?;
    let total_readings: i64 =
        conn.query_row("SELECT COUNT(*) FROM readings", [], |row| row.get(0))?;
    let total_alerts: i64 = conn.query_row("SELECT COUNT(*) FROM alerts", [], |row| row.get(0))?;
    let active_sensors_24h: i64 = conn.query_row(
        "SELECT COUNT(DISTINCT sensor_id) FROM readings
         WHERE timestamp >= datetime('now', '-24 hours')",
        [],
        |row| row.get(0),
    )?;
    let recent_alerts_24h: i64 = conn.query_row(
        "SELECT COUNT(*) FROM alerts WHERE created_at >= datetime('now', '-24 hours')",
        [],
        |row| row.get(0),
    )?;

    let anomaly_rate_percent = if total_readings > 0 {
        recent_alerts_24h as f64 / total_readings as f64 * 100.0
    } else {
        0.0
    };

    Ok(PlatformStats {
        total_readings,
        total_alerts,
        active_sensors_24h,
        recent_alerts_24h,
        anomaly_rate_percent,
    })
}

fn row_to_stored(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredReading> {
    Ok(StoredReading {
        id: row.get(0)?,
        reading: Reading {
            sensor_id: row.get(1)?,
            sensor_type: row.get(2)?,
            timestamp: parse_ts(row, 3)?,
            value: row.get(4)?,
            unit: row.get(5)?,
            location: row.get(6)?,
        },
        is_anomaly: row.get::<_, Option<i64>>(7)?.map(|v| v != 0),
        anomaly_score: row.get(8)?,
    })
}

fn parse_ts(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}
