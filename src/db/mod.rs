pub mod schema;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params_from_iter};

use crate::core::{
    AlertLevel, AlertType, AuthorizedScript, CheckType, ComplianceAlert, RiskLevel,
    ScriptMonitoringLog, ScriptSource,
};

/// Filter for the authorized-script list.
#[derive(Debug, Clone, Default)]
pub struct ScriptFilter {
    pub store_id: Option<i64>,
    pub url_contains: Option<String>,
    pub risk_level: Option<RiskLevel>,
    pub source: Option<ScriptSource>,
    pub active: Option<bool>,
    pub page: usize,
    pub page_size: usize,
}

/// Filter for the compliance-alert list.
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub store_id: Option<i64>,
    pub alert_type: Option<AlertType>,
    pub alert_level: Option<AlertLevel>,
    pub resolved: Option<bool>,
    pub page: usize,
    pub page_size: usize,
}

/// Filter for the monitoring-log list.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub store_id: Option<i64>,
    pub has_unauthorized: Option<bool>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub page: usize,
    pub page_size: usize,
}

fn effective_page_size(page_size: usize) -> usize {
    if page_size == 0 { 10_000 } else { page_size }
}

/// UTC timestamps are stored as fixed-width RFC 3339 text so that string
/// comparison in SQL matches chronological order.
fn to_db_time(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

fn parse_db_time(idx: usize, s: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_opt_db_time(idx: usize, s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match s {
        Some(s) => parse_db_time(idx, s).map(Some),
        None => Ok(None),
    }
}

pub struct Database {
    conn: Connection,
}

/// Thread-safe wrapper around Database.
#[derive(Clone)]
pub struct SharedDatabase {
    inner: Arc<Mutex<Database>>,
}

impl SharedDatabase {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        let db = Database::open(path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(db)),
        })
    }

    // --- authorized scripts ---

    pub fn insert_authorized_script(&self, script: &AuthorizedScript) -> Result<i64, rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.insert_authorized_script(script)
    }

    pub fn update_authorized_script(&self, script: &AuthorizedScript) -> Result<(), rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.update_authorized_script(script)
    }

    pub fn delete_authorized_script(&self, id: i64) -> Result<(), rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.delete_authorized_script(id)
    }

    pub fn get_authorized_script(&self, id: i64) -> Result<Option<AuthorizedScript>, rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.get_authorized_script(id)
    }

    pub fn find_authorized_by_url(
        &self,
        script_url: &str,
        store_id: i64,
    ) -> Result<Option<AuthorizedScript>, rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.find_authorized_by_url(script_url, store_id)
    }

    pub fn list_authorized_scripts(
        &self,
        filter: &ScriptFilter,
    ) -> Result<Vec<AuthorizedScript>, rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.list_authorized_scripts(filter)
    }

    pub fn expired_scripts(
        &self,
        cutoff: DateTime<Utc>,
        store_id: i64,
    ) -> Result<Vec<AuthorizedScript>, rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.expired_scripts(cutoff, store_id)
    }

    pub fn set_script_hash(
        &self,
        id: i64,
        hash: &str,
        verified_at: DateTime<Utc>,
    ) -> Result<(), rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.set_script_hash(id, hash, verified_at)
    }

    pub fn touch_last_verified(&self, id: i64, at: DateTime<Utc>) -> Result<(), rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.touch_last_verified(id, at)
    }

    // --- compliance alerts ---

    pub fn insert_alert(&self, alert: &ComplianceAlert) -> Result<i64, rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.insert_alert(alert)
    }

    pub fn update_alert(&self, alert: &ComplianceAlert) -> Result<(), rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.update_alert(alert)
    }

    pub fn delete_alert(&self, id: i64) -> Result<(), rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.delete_alert(id)
    }

    pub fn get_alert(&self, id: i64) -> Result<Option<ComplianceAlert>, rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.get_alert(id)
    }

    pub fn list_alerts(&self, filter: &AlertFilter) -> Result<Vec<ComplianceAlert>, rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.list_alerts(filter)
    }

    pub fn unresolved_alert_count(&self, store_id: i64) -> Result<usize, rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.unresolved_alert_count(store_id)
    }

    pub fn has_recent_similar_alert(
        &self,
        store_id: i64,
        alert_type: AlertType,
        script_url: Option<&str>,
        page_url: Option<&str>,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.has_recent_similar_alert(store_id, alert_type, script_url, page_url, cutoff)
    }

    pub fn recent_similar_notified(
        &self,
        store_id: i64,
        alert_type: AlertType,
        script_url: Option<&str>,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.recent_similar_notified(store_id, alert_type, script_url, cutoff)
    }

    // --- monitoring logs ---

    pub fn insert_monitoring_log(&self, log: &ScriptMonitoringLog) -> Result<i64, rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.insert_monitoring_log(log)
    }

    pub fn get_monitoring_log(&self, id: i64) -> Result<Option<ScriptMonitoringLog>, rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.get_monitoring_log(id)
    }

    pub fn list_monitoring_logs(
        &self,
        filter: &LogFilter,
    ) -> Result<Vec<ScriptMonitoringLog>, rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.list_monitoring_logs(filter)
    }

    pub fn mark_log_alert_sent(&self, id: i64) -> Result<(), rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.mark_log_alert_sent(id)
    }

    // --- retention ---

    pub fn delete_logs_before(&self, cutoff: DateTime<Utc>) -> Result<usize, rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.delete_logs_before(cutoff)
    }

    pub fn delete_resolved_alerts_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, rusqlite::Error> {
        let db = self.inner.lock().unwrap();
        db.delete_resolved_alerts_before(cutoff)
    }
}

const SCRIPT_COLUMNS: &str = "id, script_url, script_hash, hash_algorithm, purpose, justification, \
     risk_level, is_active, source, domain, authorized_by, authorized_on, last_verified, store_id";

const ALERT_COLUMNS: &str = "id, store_id, alert_type, alert_level, message, details, script_url, \
     page_url, is_resolved, created_on, resolved_on, resolved_by, notified, notified_on";

const LOG_COLUMNS: &str = "id, store_id, page_url, detected_scripts, http_headers, \
     unauthorized_scripts, has_unauthorized, checked_on, check_type, user_agent, total_scripts, \
     authorized_count, unauthorized_count, alert_sent";

impl Database {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        schema::migrate(&conn)?;
        Ok(Self { conn })
    }

    fn row_to_script(row: &rusqlite::Row) -> rusqlite::Result<AuthorizedScript> {
        let risk: i64 = row.get(6)?;
        let active: i64 = row.get(7)?;
        let source: String = row.get(8)?;
        Ok(AuthorizedScript {
            id: row.get(0)?,
            script_url: row.get(1)?,
            script_hash: row.get(2)?,
            hash_algorithm: row.get(3)?,
            purpose: row.get(4)?,
            justification: row.get(5)?,
            // Unknown stored values read back conservatively.
            risk_level: RiskLevel::from_id(risk).unwrap_or(RiskLevel::High),
            is_active: active != 0,
            source: ScriptSource::parse(&source).unwrap_or(ScriptSource::ThirdParty),
            domain: row.get(9)?,
            authorized_by: row.get(10)?,
            authorized_on: parse_db_time(11, row.get(11)?)?,
            last_verified: parse_db_time(12, row.get(12)?)?,
            store_id: row.get(13)?,
        })
    }

    fn row_to_alert(row: &rusqlite::Row) -> rusqlite::Result<ComplianceAlert> {
        let alert_type: String = row.get(2)?;
        let alert_level: String = row.get(3)?;
        let resolved: i64 = row.get(8)?;
        let notified: i64 = row.get(12)?;
        Ok(ComplianceAlert {
            id: row.get(0)?,
            store_id: row.get(1)?,
            alert_type: AlertType::parse(&alert_type),
            alert_level: AlertLevel::parse(&alert_level),
            message: row.get(4)?,
            details: row.get(5)?,
            script_url: row.get(6)?,
            page_url: row.get(7)?,
            is_resolved: resolved != 0,
            created_on: parse_db_time(9, row.get(9)?)?,
            resolved_on: parse_opt_db_time(10, row.get(10)?)?,
            resolved_by: row.get(11)?,
            notified: notified != 0,
            notified_on: parse_opt_db_time(13, row.get(13)?)?,
        })
    }

    fn row_to_log(row: &rusqlite::Row) -> rusqlite::Result<ScriptMonitoringLog> {
        let detected: String = row.get(3)?;
        let headers: String = row.get(4)?;
        let unauthorized: String = row.get(5)?;
        let has_unauthorized: i64 = row.get(6)?;
        let check_type: String = row.get(8)?;
        let alert_sent: i64 = row.get(13)?;
        Ok(ScriptMonitoringLog {
            id: row.get(0)?,
            store_id: row.get(1)?,
            page_url: row.get(2)?,
            detected_scripts: serde_json::from_str(&detected).unwrap_or_default(),
            http_headers: serde_json::from_str::<BTreeMap<String, String>>(&headers)
                .unwrap_or_default(),
            unauthorized_scripts: serde_json::from_str(&unauthorized).unwrap_or_default(),
            has_unauthorized: has_unauthorized != 0,
            checked_on: parse_db_time(7, row.get(7)?)?,
            check_type: CheckType::parse(&check_type),
            user_agent: row.get(9)?,
            total_scripts: row.get::<_, i64>(10)? as usize,
            authorized_count: row.get::<_, i64>(11)? as usize,
            unauthorized_count: row.get::<_, i64>(12)? as usize,
            alert_sent: alert_sent != 0,
        })
    }

    pub fn insert_authorized_script(&self, script: &AuthorizedScript) -> Result<i64, rusqlite::Error> {
        self.conn.execute(
            "INSERT INTO authorized_scripts (script_url, script_hash, hash_algorithm, purpose, \
             justification, risk_level, is_active, source, domain, authorized_by, authorized_on, \
             last_verified, store_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            rusqlite::params![
                script.script_url,
                script.script_hash,
                script.hash_algorithm,
                script.purpose,
                script.justification,
                script.risk_level.id(),
                script.is_active as i64,
                script.source.as_str(),
                script.domain,
                script.authorized_by,
                to_db_time(script.authorized_on),
                to_db_time(script.last_verified),
                script.store_id,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn update_authorized_script(&self, script: &AuthorizedScript) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "UPDATE authorized_scripts SET script_url = ?1, script_hash = ?2, hash_algorithm = ?3, \
             purpose = ?4, justification = ?5, risk_level = ?6, is_active = ?7, source = ?8, \
             domain = ?9, authorized_by = ?10, authorized_on = ?11, last_verified = ?12, \
             store_id = ?13 WHERE id = ?14",
            rusqlite::params![
                script.script_url,
                script.script_hash,
                script.hash_algorithm,
                script.purpose,
                script.justification,
                script.risk_level.id(),
                script.is_active as i64,
                script.source.as_str(),
                script.domain,
                script.authorized_by,
                to_db_time(script.authorized_on),
                to_db_time(script.last_verified),
                script.store_id,
                script.id,
            ],
        )?;
        Ok(())
    }

    pub fn delete_authorized_script(&self, id: i64) -> Result<(), rusqlite::Error> {
        self.conn
            .execute("DELETE FROM authorized_scripts WHERE id = ?1", [id])?;
        Ok(())
    }

    pub fn get_authorized_script(&self, id: i64) -> Result<Option<AuthorizedScript>, rusqlite::Error> {
        let sql = format!("SELECT {SCRIPT_COLUMNS} FROM authorized_scripts WHERE id = ?1");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::row_to_script(row)?)),
            None => Ok(None),
        }
    }

    pub fn find_authorized_by_url(
        &self,
        script_url: &str,
        store_id: i64,
    ) -> Result<Option<AuthorizedScript>, rusqlite::Error> {
        let sql = format!(
            "SELECT {SCRIPT_COLUMNS} FROM authorized_scripts WHERE script_url = ?1 AND store_id = ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(rusqlite::params![script_url, store_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::row_to_script(row)?)),
            None => Ok(None),
        }
    }

    pub fn list_authorized_scripts(
        &self,
        filter: &ScriptFilter,
    ) -> Result<Vec<AuthorizedScript>, rusqlite::Error> {
        let mut sql = format!("SELECT {SCRIPT_COLUMNS} FROM authorized_scripts WHERE 1=1");
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(store_id) = filter.store_id {
            sql.push_str(" AND store_id = ?");
            params.push(Box::new(store_id));
        }
        if let Some(ref fragment) = filter.url_contains {
            sql.push_str(" AND script_url LIKE ?");
            params.push(Box::new(format!("%{fragment}%")));
        }
        if let Some(risk) = filter.risk_level {
            sql.push_str(" AND risk_level = ?");
            params.push(Box::new(risk.id()));
        }
        if let Some(source) = filter.source {
            sql.push_str(" AND source = ?");
            params.push(Box::new(source.as_str().to_string()));
        }
        if let Some(active) = filter.active {
            sql.push_str(" AND is_active = ?");
            params.push(Box::new(active as i64));
        }

        let page_size = effective_page_size(filter.page_size);
        sql.push_str(" ORDER BY authorized_on DESC LIMIT ? OFFSET ?");
        params.push(Box::new(page_size as i64));
        params.push(Box::new((filter.page * page_size) as i64));

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), Self::row_to_script)?;
        rows.collect()
    }

    pub fn expired_scripts(
        &self,
        cutoff: DateTime<Utc>,
        store_id: i64,
    ) -> Result<Vec<AuthorizedScript>, rusqlite::Error> {
        let sql = format!(
            "SELECT {SCRIPT_COLUMNS} FROM authorized_scripts \
             WHERE last_verified < ?1 AND is_active = 1 AND store_id = ?2 \
             ORDER BY last_verified ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params![to_db_time(cutoff), store_id],
            Self::row_to_script,
        )?;
        rows.collect()
    }

    pub fn set_script_hash(
        &self,
        id: i64,
        hash: &str,
        verified_at: DateTime<Utc>,
    ) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "UPDATE authorized_scripts SET script_hash = ?1, last_verified = ?2 WHERE id = ?3",
            rusqlite::params![hash, to_db_time(verified_at), id],
        )?;
        Ok(())
    }

    pub fn touch_last_verified(&self, id: i64, at: DateTime<Utc>) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "UPDATE authorized_scripts SET last_verified = ?1 WHERE id = ?2",
            rusqlite::params![to_db_time(at), id],
        )?;
        Ok(())
    }

    pub fn insert_alert(&self, alert: &ComplianceAlert) -> Result<i64, rusqlite::Error> {
        self.conn.execute(
            "INSERT INTO compliance_alerts (store_id, alert_type, alert_level, message, details, \
             script_url, page_url, is_resolved, created_on, resolved_on, resolved_by, notified, \
             notified_on)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            rusqlite::params![
                alert.store_id,
                alert.alert_type.as_str(),
                alert.alert_level.as_str(),
                alert.message,
                alert.details,
                alert.script_url,
                alert.page_url,
                alert.is_resolved as i64,
                to_db_time(alert.created_on),
                alert.resolved_on.map(to_db_time),
                alert.resolved_by,
                alert.notified as i64,
                alert.notified_on.map(to_db_time),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn update_alert(&self, alert: &ComplianceAlert) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "UPDATE compliance_alerts SET is_resolved = ?1, resolved_on = ?2, resolved_by = ?3, \
             notified = ?4, notified_on = ?5 WHERE id = ?6",
            rusqlite::params![
                alert.is_resolved as i64,
                alert.resolved_on.map(to_db_time),
                alert.resolved_by,
                alert.notified as i64,
                alert.notified_on.map(to_db_time),
                alert.id,
            ],
        )?;
        Ok(())
    }

    pub fn delete_alert(&self, id: i64) -> Result<(), rusqlite::Error> {
        self.conn
            .execute("DELETE FROM compliance_alerts WHERE id = ?1", [id])?;
        Ok(())
    }

    pub fn get_alert(&self, id: i64) -> Result<Option<ComplianceAlert>, rusqlite::Error> {
        let sql = format!("SELECT {ALERT_COLUMNS} FROM compliance_alerts WHERE id = ?1");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::row_to_alert(row)?)),
            None => Ok(None),
        }
    }

    pub fn list_alerts(&self, filter: &AlertFilter) -> Result<Vec<ComplianceAlert>, rusqlite::Error> {
        let mut sql = format!("SELECT {ALERT_COLUMNS} FROM compliance_alerts WHERE 1=1");
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(store_id) = filter.store_id {
            sql.push_str(" AND store_id = ?");
            params.push(Box::new(store_id));
        }
        if let Some(alert_type) = filter.alert_type {
            sql.push_str(" AND alert_type = ?");
            params.push(Box::new(alert_type.as_str().to_string()));
        }
        if let Some(level) = filter.alert_level {
            sql.push_str(" AND alert_level = ?");
            params.push(Box::new(level.as_str().to_string()));
        }
        if let Some(resolved) = filter.resolved {
            sql.push_str(" AND is_resolved = ?");
            params.push(Box::new(resolved as i64));
        }

        let page_size = effective_page_size(filter.page_size);
        sql.push_str(" ORDER BY created_on DESC LIMIT ? OFFSET ?");
        params.push(Box::new(page_size as i64));
        params.push(Box::new((filter.page * page_size) as i64));

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), Self::row_to_alert)?;
        rows.collect()
    }

    pub fn unresolved_alert_count(&self, store_id: i64) -> Result<usize, rusqlite::Error> {
        self.conn.query_row(
            "SELECT COUNT(*) FROM compliance_alerts WHERE store_id = ?1 AND is_resolved = 0",
            [store_id],
            |row| row.get::<_, i64>(0).map(|c| c as usize),
        )
    }

    pub fn has_recent_similar_alert(
        &self,
        store_id: i64,
        alert_type: AlertType,
        script_url: Option<&str>,
        page_url: Option<&str>,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, rusqlite::Error> {
        let mut sql = String::from(
            "SELECT EXISTS(SELECT 1 FROM compliance_alerts \
             WHERE store_id = ? AND alert_type = ? AND created_on >= ?",
        );
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = vec![
            Box::new(store_id),
            Box::new(alert_type.as_str().to_string()),
            Box::new(to_db_time(cutoff)),
        ];
        if let Some(url) = script_url {
            sql.push_str(" AND script_url = ?");
            params.push(Box::new(url.to_string()));
        }
        if let Some(url) = page_url {
            sql.push_str(" AND page_url = ?");
            params.push(Box::new(url.to_string()));
        }
        sql.push(')');

        self.conn
            .query_row(&sql, params_from_iter(params.iter()), |row| {
                row.get::<_, i64>(0).map(|v| v != 0)
            })
    }

    pub fn recent_similar_notified(
        &self,
        store_id: i64,
        alert_type: AlertType,
        script_url: Option<&str>,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, rusqlite::Error> {
        let mut sql = String::from(
            "SELECT EXISTS(SELECT 1 FROM compliance_alerts \
             WHERE store_id = ? AND alert_type = ? AND created_on >= ? AND notified = 1",
        );
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = vec![
            Box::new(store_id),
            Box::new(alert_type.as_str().to_string()),
            Box::new(to_db_time(cutoff)),
        ];
        if let Some(url) = script_url {
            sql.push_str(" AND script_url = ?");
            params.push(Box::new(url.to_string()));
        }
        sql.push(')');

        self.conn
            .query_row(&sql, params_from_iter(params.iter()), |row| {
                row.get::<_, i64>(0).map(|v| v != 0)
            })
    }

    pub fn insert_monitoring_log(&self, log: &ScriptMonitoringLog) -> Result<i64, rusqlite::Error> {
        self.conn.execute(
            "INSERT INTO monitoring_logs (store_id, page_url, detected_scripts, http_headers, \
             unauthorized_scripts, has_unauthorized, checked_on, check_type, user_agent, \
             total_scripts, authorized_count, unauthorized_count, alert_sent)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            rusqlite::params![
                log.store_id,
                log.page_url,
                serde_json::to_string(&log.detected_scripts).unwrap_or_else(|_| "[]".into()),
                serde_json::to_string(&log.http_headers).unwrap_or_else(|_| "{}".into()),
                serde_json::to_string(&log.unauthorized_scripts).unwrap_or_else(|_| "[]".into()),
                log.has_unauthorized as i64,
                to_db_time(log.checked_on),
                log.check_type.tag(),
                log.user_agent,
                log.total_scripts as i64,
                log.authorized_count as i64,
                log.unauthorized_count as i64,
                log.alert_sent as i64,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_monitoring_log(&self, id: i64) -> Result<Option<ScriptMonitoringLog>, rusqlite::Error> {
        let sql = format!("SELECT {LOG_COLUMNS} FROM monitoring_logs WHERE id = ?1");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::row_to_log(row)?)),
            None => Ok(None),
        }
    }

    pub fn list_monitoring_logs(
        &self,
        filter: &LogFilter,
    ) -> Result<Vec<ScriptMonitoringLog>, rusqlite::Error> {
        let mut sql = format!("SELECT {LOG_COLUMNS} FROM monitoring_logs WHERE 1=1");
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(store_id) = filter.store_id {
            sql.push_str(" AND store_id = ?");
            params.push(Box::new(store_id));
        }
        if let Some(flag) = filter.has_unauthorized {
            sql.push_str(" AND has_unauthorized = ?");
            params.push(Box::new(flag as i64));
        }
        if let Some(from) = filter.from {
            sql.push_str(" AND checked_on >= ?");
            params.push(Box::new(to_db_time(from)));
        }
        if let Some(to) = filter.to {
            sql.push_str(" AND checked_on <= ?");
            params.push(Box::new(to_db_time(to)));
        }

        let page_size = effective_page_size(filter.page_size);
        sql.push_str(" ORDER BY checked_on DESC LIMIT ? OFFSET ?");
        params.push(Box::new(page_size as i64));
        params.push(Box::new((filter.page * page_size) as i64));

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), Self::row_to_log)?;
        rows.collect()
    }

    pub fn mark_log_alert_sent(&self, id: i64) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "UPDATE monitoring_logs SET alert_sent = 1 WHERE id = ?1",
            [id],
        )?;
        Ok(())
    }

    pub fn delete_logs_before(&self, cutoff: DateTime<Utc>) -> Result<usize, rusqlite::Error> {
        let deleted = self.conn.execute(
            "DELETE FROM monitoring_logs WHERE checked_on < ?1",
            [to_db_time(cutoff)],
        )?;
        Ok(deleted)
    }

    pub fn delete_resolved_alerts_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, rusqlite::Error> {
        let deleted = self.conn.execute(
            "DELETE FROM compliance_alerts WHERE is_resolved = 1 AND resolved_on < ?1",
            [to_db_time(cutoff)],
        )?;
        Ok(deleted)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    pub(crate) fn open_temp_db() -> SharedDatabase {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!(
            "scriptguard_test_{}_{}.db",
            std::process::id(),
            id
        ));
        // Remove if leftover from previous run
        let _ = std::fs::remove_file(&path);
        SharedDatabase::open(&path).unwrap()
    }

    pub(crate) fn sample_script(url: &str, store_id: i64) -> AuthorizedScript {
        let now = Utc::now();
        AuthorizedScript {
            id: 0,
            script_url: url.to_string(),
            script_hash: None,
            hash_algorithm: "sha384".to_string(),
            purpose: "analytics".to_string(),
            justification: "traffic insight".to_string(),
            risk_level: RiskLevel::Low,
            is_active: true,
            source: ScriptSource::ThirdParty,
            domain: "cdn.example.com".to_string(),
            authorized_by: "admin".to_string(),
            authorized_on: now,
            last_verified: now,
            store_id,
        }
    }

    pub(crate) fn sample_alert(store_id: i64, script_url: Option<&str>) -> ComplianceAlert {
        ComplianceAlert {
            id: 0,
            store_id,
            alert_type: AlertType::UnauthorizedScript,
            alert_level: AlertLevel::Critical,
            message: "Unauthorized script detected".to_string(),
            details: "{}".to_string(),
            script_url: script_url.map(str::to_string),
            page_url: Some("https://mystore.com/checkout".to_string()),
            is_resolved: false,
            created_on: Utc::now(),
            resolved_on: None,
            resolved_by: None,
            notified: false,
            notified_on: None,
        }
    }

    pub(crate) fn sample_log(store_id: i64) -> ScriptMonitoringLog {
        ScriptMonitoringLog {
            id: 0,
            store_id,
            page_url: "https://mystore.com/checkout".to_string(),
            detected_scripts: vec!["/js/app.js".to_string(), "https://evil.cdn/x.js".to_string()],
            http_headers: BTreeMap::from([(
                "Content-Security-Policy".to_string(),
                "default-src 'self'".to_string(),
            )]),
            unauthorized_scripts: vec!["https://evil.cdn/x.js".to_string()],
            has_unauthorized: true,
            checked_on: Utc::now(),
            check_type: CheckType::RealTime,
            user_agent: Some("Mozilla/5.0".to_string()),
            total_scripts: 2,
            authorized_count: 1,
            unauthorized_count: 1,
            alert_sent: false,
        }
    }

    #[test]
    fn authorized_script_roundtrip() {
        let db = open_temp_db();
        let mut script = sample_script("https://cdn.example.com/lib.js", 1);
        script.script_hash = Some("sha384-AbC".to_string());
        let id = db.insert_authorized_script(&script).unwrap();
        assert!(id > 0);

        let found = db
            .find_authorized_by_url("https://cdn.example.com/lib.js", 1)
            .unwrap()
            .unwrap();
        assert_eq!(found.id, id);
        assert_eq!(found.script_hash.as_deref(), Some("sha384-AbC"));
        assert_eq!(found.risk_level, RiskLevel::Low);
        assert_eq!(found.source, ScriptSource::ThirdParty);
        assert!(found.is_active);
    }

    #[test]
    fn url_lookup_is_store_scoped() {
        let db = open_temp_db();
        db.insert_authorized_script(&sample_script("https://cdn.example.com/lib.js", 1))
            .unwrap();
        assert!(
            db.find_authorized_by_url("https://cdn.example.com/lib.js", 2)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn duplicate_url_per_store_rejected() {
        let db = open_temp_db();
        let script = sample_script("https://cdn.example.com/lib.js", 1);
        db.insert_authorized_script(&script).unwrap();
        assert!(db.insert_authorized_script(&script).is_err());
        // Same URL under a different store is fine
        let other = sample_script("https://cdn.example.com/lib.js", 2);
        assert!(db.insert_authorized_script(&other).is_ok());
    }

    #[test]
    fn list_filters_by_risk_and_active() {
        let db = open_temp_db();
        let mut a = sample_script("https://a.example.com/a.js", 1);
        a.risk_level = RiskLevel::High;
        let mut b = sample_script("https://b.example.com/b.js", 1);
        b.is_active = false;
        db.insert_authorized_script(&a).unwrap();
        db.insert_authorized_script(&b).unwrap();

        let high = db
            .list_authorized_scripts(&ScriptFilter {
                store_id: Some(1),
                risk_level: Some(RiskLevel::High),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(high.len(), 1);
        assert_eq!(high[0].script_url, "https://a.example.com/a.js");

        let inactive = db
            .list_authorized_scripts(&ScriptFilter {
                store_id: Some(1),
                active: Some(false),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(inactive.len(), 1);
        assert_eq!(inactive[0].script_url, "https://b.example.com/b.js");
    }

    #[test]
    fn list_url_substring_filter() {
        let db = open_temp_db();
        db.insert_authorized_script(&sample_script("https://cdn.example.com/widget.js", 1))
            .unwrap();
        db.insert_authorized_script(&sample_script("https://other.example.com/app.js", 1))
            .unwrap();
        let found = db
            .list_authorized_scripts(&ScriptFilter {
                url_contains: Some("widget".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn list_pagination() {
        let db = open_temp_db();
        for i in 0..5 {
            db.insert_authorized_script(&sample_script(
                &format!("https://cdn.example.com/{i}.js"),
                1,
            ))
            .unwrap();
        }
        let page = db
            .list_authorized_scripts(&ScriptFilter {
                page: 1,
                page_size: 2,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.len(), 2);
    }

    #[test]
    fn expired_scripts_honors_cutoff_and_active() {
        let db = open_temp_db();
        let mut stale = sample_script("https://cdn.example.com/stale.js", 1);
        stale.last_verified = Utc::now() - chrono::Duration::days(40);
        let mut fresh = sample_script("https://cdn.example.com/fresh.js", 1);
        fresh.last_verified = Utc::now();
        let mut retired = sample_script("https://cdn.example.com/retired.js", 1);
        retired.last_verified = Utc::now() - chrono::Duration::days(40);
        retired.is_active = false;

        db.insert_authorized_script(&stale).unwrap();
        db.insert_authorized_script(&fresh).unwrap();
        db.insert_authorized_script(&retired).unwrap();

        let cutoff = Utc::now() - chrono::Duration::days(30);
        let expired = db.expired_scripts(cutoff, 1).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].script_url, "https://cdn.example.com/stale.js");
    }

    #[test]
    fn set_script_hash_updates_verification_time() {
        let db = open_temp_db();
        let mut script = sample_script("https://cdn.example.com/lib.js", 1);
        script.last_verified = Utc::now() - chrono::Duration::days(10);
        let id = db.insert_authorized_script(&script).unwrap();

        let verified_at = Utc::now();
        db.set_script_hash(id, "sha384-New", verified_at).unwrap();
        let found = db.get_authorized_script(id).unwrap().unwrap();
        assert_eq!(found.script_hash.as_deref(), Some("sha384-New"));
        assert!(found.last_verified > script.last_verified);
    }

    #[test]
    fn alert_roundtrip_and_update() {
        let db = open_temp_db();
        let alert = sample_alert(1, Some("https://evil.cdn/x.js"));
        let id = db.insert_alert(&alert).unwrap();

        let mut found = db.get_alert(id).unwrap().unwrap();
        assert_eq!(found.alert_type, AlertType::UnauthorizedScript);
        assert_eq!(found.alert_level, AlertLevel::Critical);
        assert!(!found.is_resolved);

        found.is_resolved = true;
        found.resolved_on = Some(Utc::now());
        found.resolved_by = Some("operator".to_string());
        db.update_alert(&found).unwrap();

        let reread = db.get_alert(id).unwrap().unwrap();
        assert!(reread.is_resolved);
        assert_eq!(reread.resolved_by.as_deref(), Some("operator"));
        assert!(reread.resolved_on.is_some());

        db.delete_alert(id).unwrap();
        assert!(db.get_alert(id).unwrap().is_none());
    }

    #[test]
    fn recent_similar_alert_matching() {
        let db = open_temp_db();
        db.insert_alert(&sample_alert(1, Some("https://evil.cdn/x.js")))
            .unwrap();

        let cutoff = Utc::now() - chrono::Duration::hours(1);
        assert!(
            db.has_recent_similar_alert(
                1,
                AlertType::UnauthorizedScript,
                Some("https://evil.cdn/x.js"),
                Some("https://mystore.com/checkout"),
                cutoff,
            )
            .unwrap()
        );
        // Different script URL
        assert!(
            !db.has_recent_similar_alert(
                1,
                AlertType::UnauthorizedScript,
                Some("https://evil.cdn/y.js"),
                None,
                cutoff,
            )
            .unwrap()
        );
        // Different store
        assert!(
            !db.has_recent_similar_alert(
                2,
                AlertType::UnauthorizedScript,
                Some("https://evil.cdn/x.js"),
                None,
                cutoff,
            )
            .unwrap()
        );
    }

    #[test]
    fn recent_similar_alert_outside_window() {
        let db = open_temp_db();
        let mut old = sample_alert(1, Some("https://evil.cdn/x.js"));
        old.created_on = Utc::now() - chrono::Duration::hours(3);
        db.insert_alert(&old).unwrap();

        let cutoff = Utc::now() - chrono::Duration::hours(1);
        assert!(
            !db.has_recent_similar_alert(
                1,
                AlertType::UnauthorizedScript,
                Some("https://evil.cdn/x.js"),
                None,
                cutoff,
            )
            .unwrap()
        );
    }

    #[test]
    fn recent_similar_notified_requires_flag() {
        let db = open_temp_db();
        let mut alert = sample_alert(1, Some("https://evil.cdn/x.js"));
        let id = db.insert_alert(&alert).unwrap();
        let cutoff = Utc::now() - chrono::Duration::hours(24);

        assert!(
            !db.recent_similar_notified(1, AlertType::UnauthorizedScript, None, cutoff)
                .unwrap()
        );

        alert.id = id;
        alert.notified = true;
        alert.notified_on = Some(Utc::now());
        db.update_alert(&alert).unwrap();

        assert!(
            db.recent_similar_notified(1, AlertType::UnauthorizedScript, None, cutoff)
                .unwrap()
        );
    }

    #[test]
    fn monitoring_log_roundtrip() {
        let db = open_temp_db();
        let log = sample_log(1);
        let id = db.insert_monitoring_log(&log).unwrap();

        let found = db.get_monitoring_log(id).unwrap().unwrap();
        assert_eq!(found.detected_scripts, log.detected_scripts);
        assert_eq!(found.unauthorized_scripts, log.unauthorized_scripts);
        assert_eq!(found.check_type, CheckType::RealTime);
        assert_eq!(found.total_scripts, 2);
        assert_eq!(
            found.http_headers.get("Content-Security-Policy").unwrap(),
            "default-src 'self'"
        );
        assert!(found.has_unauthorized);
    }

    #[test]
    fn log_filter_by_unauthorized_flag() {
        let db = open_temp_db();
        let mut clean = sample_log(1);
        clean.unauthorized_scripts = Vec::new();
        clean.has_unauthorized = false;
        clean.unauthorized_count = 0;
        clean.authorized_count = 2;
        db.insert_monitoring_log(&clean).unwrap();
        db.insert_monitoring_log(&sample_log(1)).unwrap();

        let flagged = db
            .list_monitoring_logs(&LogFilter {
                store_id: Some(1),
                has_unauthorized: Some(true),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(flagged.len(), 1);
    }

    #[test]
    fn log_filter_by_timerange() {
        let db = open_temp_db();
        db.insert_monitoring_log(&sample_log(1)).unwrap();

        let from = Utc::now() - chrono::Duration::hours(1);
        let to = Utc::now() + chrono::Duration::hours(1);
        let found = db
            .list_monitoring_logs(&LogFilter {
                from: Some(from),
                to: Some(to),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(found.len(), 1);

        let earlier = db
            .list_monitoring_logs(&LogFilter {
                to: Some(from),
                ..Default::default()
            })
            .unwrap();
        assert!(earlier.is_empty());
    }

    #[test]
    fn mark_log_alert_sent_sets_flag() {
        let db = open_temp_db();
        let id = db.insert_monitoring_log(&sample_log(1)).unwrap();
        db.mark_log_alert_sent(id).unwrap();
        assert!(db.get_monitoring_log(id).unwrap().unwrap().alert_sent);
    }

    #[test]
    fn retention_deletes_old_rows_only() {
        let db = open_temp_db();
        let mut old_log = sample_log(1);
        old_log.checked_on = Utc::now() - chrono::Duration::days(100);
        db.insert_monitoring_log(&old_log).unwrap();
        db.insert_monitoring_log(&sample_log(1)).unwrap();

        let deleted = db
            .delete_logs_before(Utc::now() - chrono::Duration::days(90))
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(
            db.list_monitoring_logs(&LogFilter::default()).unwrap().len(),
            1
        );
    }

    #[test]
    fn retention_spares_unresolved_alerts() {
        let db = open_temp_db();
        let mut resolved = sample_alert(1, None);
        resolved.is_resolved = true;
        resolved.resolved_on = Some(Utc::now() - chrono::Duration::days(60));
        resolved.resolved_by = Some("operator".to_string());
        db.insert_alert(&resolved).unwrap();

        let mut unresolved = sample_alert(1, None);
        unresolved.created_on = Utc::now() - chrono::Duration::days(60);
        db.insert_alert(&unresolved).unwrap();

        let deleted = db
            .delete_resolved_alerts_before(Utc::now() - chrono::Duration::days(30))
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(db.unresolved_alert_count(1).unwrap(), 1);
    }
}
