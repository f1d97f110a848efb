//! Alert factory: qualify a score, build the alert record, persist it.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;
use tracing::debug;

use crate::config::DetectionConfig;
use crate::detect::severity::SeverityPolicy;
use crate::detect::Severity;
use crate::storage::{Pool, Reading};

/// An emitted anomaly alert. Immutable once created; resolution is the only
/// later mutation and happens through `resolve`.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    /// Database id; None until persisted.
    pub id: Option<i64>,
    pub sensor_id: String,
    pub severity: Severity,
    pub probability: f64,
    pub sensor_value: f64,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Filters for `list`.
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub sensor_id: Option<String>,
    pub severity: Option<Severity>,
    pub resolved: Option<bool>,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Clone)]
pub struct AlertFactory {
    pool: Pool,
    policy: SeverityPolicy,
    decision_boundary: f64,
    min_alert_probability: f64,
}

impl AlertFactory {
    pub fn new(pool: Pool, config: &DetectionConfig) -> Self {
        Self {
            pool,
            policy: SeverityPolicy::new(config),
            decision_boundary: config.decision_boundary,
            min_alert_probability: config.min_alert_probability,
        }
    }

    /// Decide whether a scored reading qualifies for an alert and build the
    /// record if it does. Two independent gates: the classifier's own
    /// boolean verdict (probability over the decision boundary) and the
    /// operator-facing alerting threshold.
    pub fn maybe_alert(&self, reading: &Reading, probability: f64) -> Option<Alert> {
        let is_anomaly = probability > self.decision_boundary;
        if !is_anomaly || probability < self.min_alert_probability {
            debug!(
                sensor_id = %reading.sensor_id,
                probability,
                is_anomaly,
                "score below alerting threshold, no alert"
            );
            return None;
        }

        let severity = self.policy.classify(probability);
        Some(Alert {
            id: None,
            sensor_id: reading.sensor_id.clone(),
            severity,
            probability,
            sensor_value: reading.value,
            message: format!(
                "Anomaly detected on sensor {}: value {} {} scored {:.4}",
                reading.sensor_id, reading.value, reading.unit, probability
            ),
            created_at: Utc::now(),
            resolved: false,
            resolved_at: None,
        })
    }

    /// Persist an alert, returning it with its store-assigned id.
    pub fn persist(&self, mut alert: Alert) -> Result<Alert> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO alerts (sensor_id, severity, message, anomaly_score, sensor_value, created_at, resolved)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
            params![
                alert.sensor_id,
                alert.severity.as_str(),
                alert.message,
                alert.probability,
                alert.sensor_value,
                alert.created_at.to_rfc3339(),
            ],
        )?;
        alert.id = Some(conn.last_insert_rowid());
        Ok(alert)
    }

    /// List alerts, newest first, with optional filtering.
    pub fn list(&self, filter: &AlertFilter) -> Result<Vec<Alert>> {
        let conn = self.pool.get()?;
        let mut sql = String::from(
            "SELECT id, sensor_id, severity, message, anomaly_score, sensor_value,
                    created_at, resolved, resolved_at
             FROM alerts WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref sid) = filter.sensor_id {
            args.push(Box::new(sid.clone()));
            sql.push_str(&format!(" AND sensor_id = ?{}", args.len()));
        }
        if let Some(sev) = filter.severity {
            args.push(Box::new(sev.as_str().to_string()));
            sql.push_str(&format!(" AND severity = ?{}", args.len()));
        }
        if let Some(resolved) = filter.resolved {
            args.push(Box::new(resolved as i64));
            sql.push_str(&format!(" AND resolved = ?{}", args.len()));
        }
        let limit = if filter.limit == 0 { 100 } else { filter.limit };
        args.push(Box::new(limit as i64));
        sql.push_str(&format!(" ORDER BY created_at DESC LIMIT ?{}", args.len()));
        args.push(Box::new(filter.offset as i64));
        sql.push_str(&format!(" OFFSET ?{}", args.len()));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            row_to_alert,
        )?;

        let mut alerts = Vec::new();
        for r in rows {
            alerts.push(r?);
        }
        Ok(alerts)
    }

    /// Flip an alert to resolved. Returns false when no such alert exists
    /// or it was already resolved.
    pub fn resolve(&self, alert_id: i64) -> Result<bool> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE alerts SET resolved = 1, resolved_at = ?1 WHERE id = ?2 AND resolved = 0",
            params![Utc::now().to_rfc3339(), alert_id],
        )?;
        Ok(changed > 0)
    }
}

fn row_to_alert(row: &rusqlite::Row<'_>) -> rusqlite::Result<Alert> {
    let severity_raw: String = row.get(2)?;
    let severity = severity_raw.parse().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("bad severity: {severity_raw}").into(),
        )
    })?;

    Ok(Alert {
        id: Some(row.get(0)?),
        sensor_id: row.get(1)?,
        severity,
        message: row.get(3)?,
        probability: row.get(4)?,
        sensor_value: row.get(5)?,
        created_at: parse_ts(row, 6)?,
        resolved: row.get::<_, i64>(7)? != 0,
        resolved_at: {
            let raw: Option<String> = row.get(8)?;
            match raw {
                Some(s) => Some(
                    DateTime::parse_from_rfc3339(&s)
                        .map(|dt| dt.with_timezone(&Utc))
                        .map_err(|e| {
                            rusqlite::Error::FromSqlConversionFailure(
                                8,
                                rusqlite::types::Type::Text,
                                Box::new(e),
                            )
                        })?,
                ),
                None => None,
            }
        },
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_memory_pool;

    fn reading(value: f64) -> Reading {
        Reading {
            sensor_id: "s1".to_string(),
            sensor_type: "temperature".to_string(),
            timestamp: Utc::now(),
            value,
            unit: "C".to_string(),
            location: None,
        }
    }

    fn factory() -> AlertFactory {
        AlertFactory::new(open_memory_pool().unwrap(), &DetectionConfig::default())
    }

    #[test]
    fn test_below_decision_boundary_no_alert() {
        assert!(factory().maybe_alert(&reading(200.0), 0.45).is_none());
    }

    #[test]
    fn test_anomalous_but_below_alert_threshold_no_alert() {
        // Over the 0.5 boundary, under the 0.6 alerting threshold.
        assert!(factory().maybe_alert(&reading(200.0), 0.55).is_none());
    }

    #[test]
    fn test_qualifying_score_builds_alert() {
        let alert = factory().maybe_alert(&reading(200.0), 0.93).unwrap();
        assert_eq!(alert.severity, Severity::Critical);
        assert_eq!(alert.sensor_value, 200.0);
        assert!(!alert.resolved);
        assert!(alert.message.contains("0.9300"));
    }

    #[test]
    fn test_thresholds_are_independent_knobs() {
        let factory = AlertFactory::new(
            open_memory_pool().unwrap(),
            &DetectionConfig {
                min_alert_probability: 0.9,
                ..DetectionConfig::default()
            },
        );
        assert!(factory.maybe_alert(&reading(200.0), 0.85).is_none());
        assert!(factory.maybe_alert(&reading(200.0), 0.95).is_some());
    }

    #[test]
    fn test_persist_list_resolve() {
        let factory = factory();
        let alert = factory.maybe_alert(&reading(200.0), 0.85).unwrap();
        let alert = factory.persist(alert).unwrap();
        let id = alert.id.unwrap();

        let listed = factory.list(&AlertFilter::default()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].severity, Severity::High);
        assert_eq!(listed[0].sensor_value, 200.0);

        assert!(factory.resolve(id).unwrap());
        assert!(!factory.resolve(id).unwrap()); // already resolved

        let open = factory
            .list(&AlertFilter {
                resolved: Some(false),
                ..Default::default()
            })
            .unwrap();
        assert!(open.is_empty());
    }

    #[test]
    fn test_list_filters_by_severity() {
        let factory = factory();
        for p in [0.65, 0.85, 0.95] {
            let alert = factory.maybe_alert(&reading(50.0), p).unwrap();
            factory.persist(alert).unwrap();
        }

        let criticals = factory
            .list(&AlertFilter {
                severity: Some(Severity::Critical),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(criticals.len(), 1);
        assert_eq!(criticals[0].probability, 0.95);
    }
}
