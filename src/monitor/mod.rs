use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::alerts::AlertEngine;
use crate::auth::AuthorizedScripts;
use crate::config::Config;
use crate::core::{
    AlertDetails, AlertType, CheckType, ComplianceAlert, GuardError, ScriptMonitoringLog,
};
use crate::db::{LogFilter, SharedDatabase};
use crate::sri;

/// Caller-supplied context for one monitoring pass.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub session_id: Option<String>,
    pub user_agent: Option<String>,
    pub headers: BTreeMap<String, String>,
}

/// Result of one monitoring pass: the persisted log plus any alerts that
/// survived deduplication.
#[derive(Debug)]
pub struct MonitoringOutcome {
    pub log: ScriptMonitoringLog,
    pub new_alerts: Vec<ComplianceAlert>,
}

/// Consumes batches of observed script URLs for a page, partitions them into
/// local vs. external, classifies each external one against the authorization
/// store, and produces one immutable log plus zero-or-more alerts.
pub struct SessionAggregator {
    config: Arc<Config>,
    db: SharedDatabase,
    auth: Arc<AuthorizedScripts>,
    alerts: Arc<AlertEngine>,
}

impl SessionAggregator {
    pub fn new(
        config: Arc<Config>,
        db: SharedDatabase,
        auth: Arc<AuthorizedScripts>,
        alerts: Arc<AlertEngine>,
    ) -> Self {
        Self {
            config,
            db,
            auth,
            alerts,
        }
    }

    /// One stateless monitoring pass. Invoked repeatedly per page lifetime
    /// (initial load, AJAX re-scans, payment-method re-scans).
    pub fn process_observed_scripts(
        &self,
        store_id: i64,
        page_url: &str,
        observed: &[String],
        check_type: CheckType,
        context: &SessionContext,
    ) -> Result<MonitoringOutcome, GuardError> {
        let store_url = self.config.store_url(store_id).unwrap_or_default();

        let mut unauthorized = Vec::new();
        for script_url in observed {
            if sri::is_local_script(script_url, store_url, &self.config.monitoring) {
                continue;
            }
            // One failing lookup must not abort the rest of the batch;
            // unknown-state scripts are counted as unauthorized.
            match self.auth.is_authorized(script_url, store_id) {
                Ok((true, _)) => {}
                Ok((false, _)) => unauthorized.push(script_url.clone()),
                Err(e) => {
                    warn!("Authorization lookup failed for {script_url}: {e}");
                    unauthorized.push(script_url.clone());
                }
            }
        }

        let total = observed.len();
        let unauthorized_count = unauthorized.len();
        let authorized_count = total - unauthorized_count;

        let mut log = ScriptMonitoringLog {
            id: 0,
            store_id,
            page_url: page_url.to_string(),
            detected_scripts: observed.to_vec(),
            http_headers: context.headers.clone(),
            unauthorized_scripts: unauthorized.clone(),
            has_unauthorized: unauthorized_count > 0,
            checked_on: Utc::now(),
            check_type: check_type.clone(),
            user_agent: context.user_agent.clone(),
            total_scripts: total,
            authorized_count,
            unauthorized_count,
            alert_sent: false,
        };
        log.id = self.db.insert_monitoring_log(&log)?;

        let mut new_alerts = Vec::new();
        for script_url in &unauthorized {
            let created = self.alerts.maybe_create_alert(
                store_id,
                AlertType::UnauthorizedScript,
                None,
                format!("Unauthorized script detected: {script_url}"),
                Some(script_url),
                Some(page_url),
                &AlertDetails::UnauthorizedScript {
                    session_id: context.session_id.clone(),
                    check_type: check_type.tag(),
                    detection: "client-monitoring".to_string(),
                },
            );
            match created {
                Ok(Some(alert)) => new_alerts.push(alert),
                Ok(None) => {}
                Err(e) => warn!("Alert creation failed for {script_url}: {e}"),
            }
        }

        if !unauthorized.is_empty() {
            warn!(
                "Detected {} unauthorized scripts on {page_url} (check: {})",
                unauthorized.len(),
                log.check_type.tag()
            );
        }

        Ok(MonitoringOutcome { log, new_alerts })
    }

    /// Aggregate monitoring activity for a store over a date range.
    pub fn compliance_report(
        &self,
        store_id: i64,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<ComplianceReport, GuardError> {
        let logs = self.db.list_monitoring_logs(&LogFilter {
            store_id: Some(store_id),
            from,
            to,
            ..Default::default()
        })?;

        let mut report = ComplianceReport {
            store_id,
            total_checks: logs.len(),
            checks_with_unauthorized: logs.iter().filter(|l| l.has_unauthorized).count(),
            total_scripts_monitored: logs.iter().map(|l| l.total_scripts).sum(),
            authorized_count: logs.iter().map(|l| l.authorized_count).sum(),
            unauthorized_count: logs.iter().map(|l| l.unauthorized_count).sum(),
            compliance_score: 100.0,
            most_common_unauthorized: Vec::new(),
            last_check: logs.iter().map(|l| l.checked_on).max(),
        };

        if report.total_scripts_monitored > 0 {
            report.compliance_score =
                report.authorized_count as f64 / report.total_scripts_monitored as f64 * 100.0;
        }

        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for log in &logs {
            for url in &log.unauthorized_scripts {
                *counts.entry(url.as_str()).or_default() += 1;
            }
        }
        let mut ranked: Vec<(String, usize)> = counts
            .into_iter()
            .map(|(url, count)| (url.to_string(), count))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(10);
        report.most_common_unauthorized = ranked;

        Ok(report)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub store_id: i64,
    pub total_checks: usize,
    pub checks_with_unauthorized: usize,
    pub total_scripts_monitored: usize,
    pub authorized_count: usize,
    pub unauthorized_count: usize,
    /// Percentage of monitored scripts that were authorized.
    pub compliance_score: f64,
    pub most_common_unauthorized: Vec<(String, usize)>,
    pub last_check: Option<DateTime<Utc>>,
}
