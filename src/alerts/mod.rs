use chrono::Utc;
use tracing::debug;

use crate::core::{AlertDetails, AlertLevel, AlertType, ComplianceAlert, GuardError};
use crate::db::SharedDatabase;

/// Static severity assignment per alert type. Call sites may override
/// downward (e.g. informational auto-update events).
pub fn severity_for(alert_type: AlertType) -> AlertLevel {
    match alert_type {
        AlertType::UnauthorizedScript => AlertLevel::Critical,
        AlertType::SecurityAlert => AlertLevel::Critical,
        AlertType::IntegrityFailure => AlertLevel::Critical,
        AlertType::CspViolation => AlertLevel::Warning,
        AlertType::Unknown => AlertLevel::Warning,
    }
}

/// Creates, deduplicates and resolves compliance alerts.
pub struct AlertEngine {
    db: SharedDatabase,
    dedup_window: chrono::Duration,
}

impl AlertEngine {
    pub fn new(db: SharedDatabase, dedup_window: chrono::Duration) -> Self {
        Self { db, dedup_window }
    }

    /// Create an alert unless a same-(store, type, script, page) alert exists
    /// within the trailing dedup window. Suppression returns `Ok(None)` and
    /// is expected behavior, not a failure.
    pub fn maybe_create_alert(
        &self,
        store_id: i64,
        alert_type: AlertType,
        level_override: Option<AlertLevel>,
        message: String,
        script_url: Option<&str>,
        page_url: Option<&str>,
        details: &AlertDetails,
    ) -> Result<Option<ComplianceAlert>, GuardError> {
        let cutoff = Utc::now() - self.dedup_window;
        if self
            .db
            .has_recent_similar_alert(store_id, alert_type, script_url, page_url, cutoff)?
        {
            debug!(
                "Suppressing duplicate {} alert for store {store_id} ({})",
                alert_type.as_str(),
                script_url.unwrap_or("-")
            );
            return Ok(None);
        }

        let alert = self.build_alert(
            store_id,
            alert_type,
            level_override.unwrap_or_else(|| severity_for(alert_type)),
            message,
            script_url,
            page_url,
            details,
        )?;
        Ok(Some(alert))
    }

    /// Create a critical security alert unconditionally. A browser-side block
    /// is itself a strong signal, so these are never dedup-suppressed.
    pub fn create_security_alert(
        &self,
        store_id: i64,
        message: String,
        script_url: Option<&str>,
        page_url: Option<&str>,
        details: &AlertDetails,
    ) -> Result<ComplianceAlert, GuardError> {
        self.build_alert(
            store_id,
            AlertType::SecurityAlert,
            AlertLevel::Critical,
            message,
            script_url,
            page_url,
            details,
        )
    }

    fn build_alert(
        &self,
        store_id: i64,
        alert_type: AlertType,
        alert_level: AlertLevel,
        message: String,
        script_url: Option<&str>,
        page_url: Option<&str>,
        details: &AlertDetails,
    ) -> Result<ComplianceAlert, GuardError> {
        let mut alert = ComplianceAlert {
            id: 0,
            store_id,
            alert_type,
            alert_level,
            message,
            details: details.to_json(),
            script_url: script_url.map(str::to_string),
            page_url: page_url.map(str::to_string),
            is_resolved: false,
            created_on: Utc::now(),
            resolved_on: None,
            resolved_by: None,
            notified: false,
            notified_on: None,
        };
        alert.id = self.db.insert_alert(&alert)?;
        Ok(alert)
    }

    /// Resolve an alert. Idempotent: resolving an already-resolved alert
    /// returns the existing record unchanged.
    pub fn resolve(
        &self,
        alert_id: i64,
        resolved_by: &str,
    ) -> Result<Option<ComplianceAlert>, GuardError> {
        let Some(mut alert) = self.db.get_alert(alert_id)? else {
            return Ok(None);
        };
        if alert.is_resolved {
            return Ok(Some(alert));
        }

        alert.is_resolved = true;
        alert.resolved_on = Some(Utc::now());
        alert.resolved_by = Some(resolved_by.to_string());
        self.db.update_alert(&alert)?;
        Ok(Some(alert))
    }

    /// Frequency guard for the notification layer: suppress a notification
    /// when a similar alert within the window already had one sent.
    pub fn should_notify(
        &self,
        store_id: i64,
        alert_type: AlertType,
        script_url: Option<&str>,
        max_frequency_hours: u64,
    ) -> Result<bool, GuardError> {
        if max_frequency_hours == 0 {
            return Ok(true);
        }
        let cutoff = Utc::now() - chrono::Duration::hours(max_frequency_hours as i64);
        Ok(!self
            .db
            .recent_similar_notified(store_id, alert_type, script_url, cutoff)?)
    }

    /// Record that a notification went out for this alert.
    pub fn mark_notified(&self, alert: &mut ComplianceAlert) -> Result<(), GuardError> {
        alert.notified = true;
        alert.notified_on = Some(Utc::now());
        self.db.update_alert(alert)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::open_temp_db;

    fn engine() -> (AlertEngine, SharedDatabase) {
        let db = open_temp_db();
        (AlertEngine::new(db.clone(), chrono::Duration::hours(1)), db)
    }

    fn unauthorized_details() -> AlertDetails {
        AlertDetails::UnauthorizedScript {
            session_id: None,
            check_type: "real-time".to_string(),
            detection: "client-monitoring".to_string(),
        }
    }

    #[test]
    fn severity_map() {
        assert_eq!(severity_for(AlertType::UnauthorizedScript), AlertLevel::Critical);
        assert_eq!(severity_for(AlertType::SecurityAlert), AlertLevel::Critical);
        assert_eq!(severity_for(AlertType::IntegrityFailure), AlertLevel::Critical);
        assert_eq!(severity_for(AlertType::CspViolation), AlertLevel::Warning);
    }

    #[test]
    fn dedup_suppresses_second_alert_within_window() {
        let (engine, _db) = engine();
        let first = engine
            .maybe_create_alert(
                1,
                AlertType::UnauthorizedScript,
                None,
                "Unauthorized script detected: https://evil.cdn/x.js".into(),
                Some("https://evil.cdn/x.js"),
                Some("https://mystore.com/checkout"),
                &unauthorized_details(),
            )
            .unwrap();
        assert!(first.is_some());

        let second = engine
            .maybe_create_alert(
                1,
                AlertType::UnauthorizedScript,
                None,
                "Unauthorized script detected: https://evil.cdn/x.js".into(),
                Some("https://evil.cdn/x.js"),
                Some("https://mystore.com/checkout"),
                &unauthorized_details(),
            )
            .unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn dedup_allows_new_alert_after_window() {
        let db = open_temp_db();
        let engine = AlertEngine::new(db.clone(), chrono::Duration::hours(1));

        // Seed an alert that predates the window
        let mut old = crate::db::tests::sample_alert(1, Some("https://evil.cdn/x.js"));
        old.created_on = Utc::now() - chrono::Duration::hours(2);
        db.insert_alert(&old).unwrap();

        let created = engine
            .maybe_create_alert(
                1,
                AlertType::UnauthorizedScript,
                None,
                "Unauthorized script detected: https://evil.cdn/x.js".into(),
                Some("https://evil.cdn/x.js"),
                Some("https://mystore.com/checkout"),
                &unauthorized_details(),
            )
            .unwrap();
        assert!(created.is_some());
    }

    #[test]
    fn different_script_url_is_not_a_duplicate() {
        let (engine, _db) = engine();
        engine
            .maybe_create_alert(
                1,
                AlertType::UnauthorizedScript,
                None,
                "a".into(),
                Some("https://evil.cdn/x.js"),
                None,
                &unauthorized_details(),
            )
            .unwrap()
            .unwrap();
        let other = engine
            .maybe_create_alert(
                1,
                AlertType::UnauthorizedScript,
                None,
                "b".into(),
                Some("https://evil.cdn/y.js"),
                None,
                &unauthorized_details(),
            )
            .unwrap();
        assert!(other.is_some());
    }

    #[test]
    fn default_severity_applied_and_override_wins() {
        let (engine, _db) = engine();
        let alert = engine
            .maybe_create_alert(
                1,
                AlertType::CspViolation,
                None,
                "Content Security Policy violation".into(),
                None,
                Some("https://mystore.com/checkout"),
                &AlertDetails::CspViolation {
                    blocked_uri: None,
                    violated_directive: None,
                    effective_directive: None,
                    source_file: None,
                    line_number: None,
                    user_agent: None,
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(alert.alert_level, AlertLevel::Warning);

        let info = engine
            .maybe_create_alert(
                1,
                AlertType::IntegrityFailure,
                Some(AlertLevel::Info),
                "Script digest auto-updated".into(),
                Some("https://js.stripe.com/v3/"),
                None,
                &AlertDetails::DigestAutoUpdated {
                    script_id: 1,
                    old_digest: None,
                    new_digest: "sha384-XYZ".into(),
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(info.alert_level, AlertLevel::Info);
    }

    #[test]
    fn security_alert_bypasses_dedup() {
        let (engine, _db) = engine();
        let details = AlertDetails::BlockedScript {
            block_reason: "not authorized".into(),
            user_agent: None,
        };
        let first = engine
            .create_security_alert(
                1,
                "Blocked script reported: https://evil.cdn/x.js".into(),
                Some("https://evil.cdn/x.js"),
                Some("https://mystore.com/checkout"),
                &details,
            )
            .unwrap();
        let second = engine
            .create_security_alert(
                1,
                "Blocked script reported: https://evil.cdn/x.js".into(),
                Some("https://evil.cdn/x.js"),
                Some("https://mystore.com/checkout"),
                &details,
            )
            .unwrap();
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn resolve_is_idempotent() {
        let (engine, db) = engine();
        let alert = engine
            .maybe_create_alert(
                1,
                AlertType::UnauthorizedScript,
                None,
                "x".into(),
                Some("https://evil.cdn/x.js"),
                None,
                &unauthorized_details(),
            )
            .unwrap()
            .unwrap();

        let resolved = engine.resolve(alert.id, "operator").unwrap().unwrap();
        assert!(resolved.is_resolved);
        let stored_first = db.get_alert(alert.id).unwrap().unwrap();

        let again = engine.resolve(alert.id, "someone-else").unwrap().unwrap();
        assert!(again.is_resolved);
        assert_eq!(again.resolved_on, stored_first.resolved_on);
        assert_eq!(again.resolved_by.as_deref(), Some("operator"));
    }

    #[test]
    fn resolve_missing_alert_is_none() {
        let (engine, _db) = engine();
        assert!(engine.resolve(999, "operator").unwrap().is_none());
    }

    #[test]
    fn frequency_guard_blocks_after_notification() {
        let (engine, _db) = engine();
        let mut alert = engine
            .maybe_create_alert(
                1,
                AlertType::UnauthorizedScript,
                None,
                "x".into(),
                Some("https://evil.cdn/x.js"),
                None,
                &unauthorized_details(),
            )
            .unwrap()
            .unwrap();

        assert!(
            engine
                .should_notify(1, AlertType::UnauthorizedScript, Some("https://evil.cdn/x.js"), 24)
                .unwrap()
        );
        engine.mark_notified(&mut alert).unwrap();
        assert!(
            !engine
                .should_notify(1, AlertType::UnauthorizedScript, Some("https://evil.cdn/x.js"), 24)
                .unwrap()
        );
        // Zero frequency disables the guard
        assert!(
            engine
                .should_notify(1, AlertType::UnauthorizedScript, Some("https://evil.cdn/x.js"), 0)
                .unwrap()
        );
    }
}
