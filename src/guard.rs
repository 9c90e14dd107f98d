use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::alerts::AlertEngine;
use crate::auth::AuthorizedScripts;
use crate::config::Config;
use crate::core::{AlertDetails, AlertType, CheckType, GuardError};
use crate::db::SharedDatabase;
use crate::integrity::IntegrityValidator;
use crate::monitor::{SessionAggregator, SessionContext};
use crate::notify::{Notify, TemplateKind};
use crate::sri::{DigestAlgorithm, DigestFetcher};

/// One monitoring pass reported by the browser agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReportRequest {
    pub store_id: i64,
    pub page_url: String,
    pub scripts: Vec<String>,
    /// Check-type tag, e.g. `real-time`, `ajax-cart`, `payment-stripe`.
    pub check_type: String,
    pub session_id: Option<String>,
    pub user_agent: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReportResponse {
    pub success: bool,
    pub log_id: Option<i64>,
    pub authorized_count: usize,
    pub unauthorized_count: usize,
    pub unauthorized_scripts: Vec<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SriValidationRequest {
    pub store_id: i64,
    pub page_url: String,
    pub script_url: String,
    /// Browser-supplied integrity attribute, when present.
    pub integrity: Option<String>,
    /// When no integrity is supplied, compute a reference digest anyway.
    #[serde(default)]
    pub force_digest: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SriValidationResponse {
    pub success: bool,
    pub is_authorized: bool,
    pub is_valid: bool,
    pub generated_digest: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedScriptRequest {
    pub store_id: i64,
    pub script_url: String,
    pub page_url: String,
    pub block_reason: String,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedScriptResponse {
    pub success: bool,
    pub alert_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CspViolationReport {
    pub blocked_uri: Option<String>,
    pub violated_directive: Option<String>,
    pub effective_directive: Option<String>,
    pub source_file: Option<String>,
    pub line_number: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CspViolationRequest {
    pub store_id: i64,
    pub page_url: String,
    pub violation: CspViolationReport,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CspViolationResponse {
    pub success: bool,
    pub alert_id: Option<i64>,
}

/// The inbound operation surface. Every operation returns a structured
/// success-or-degraded response; a failure in alerting or persistence must
/// never break the calling page's script execution path.
pub struct GuardService<F: DigestFetcher> {
    config: Arc<Config>,
    db: SharedDatabase,
    pub auth: Arc<AuthorizedScripts>,
    pub alerts: Arc<AlertEngine>,
    validator: IntegrityValidator<F>,
    aggregator: SessionAggregator,
    fetcher: Arc<F>,
    notifier: Arc<dyn Notify>,
}

impl<F: DigestFetcher> GuardService<F> {
    pub fn new(
        config: Arc<Config>,
        db: SharedDatabase,
        fetcher: Arc<F>,
        notifier: Arc<dyn Notify>,
    ) -> Self {
        let auth = Arc::new(AuthorizedScripts::new(db.clone(), config.cache_ttl()));
        let alerts = Arc::new(AlertEngine::new(db.clone(), config.dedup_window()));
        let validator = IntegrityValidator::new(
            config.clone(),
            auth.clone(),
            alerts.clone(),
            fetcher.clone(),
            notifier.clone(),
        );
        let aggregator =
            SessionAggregator::new(config.clone(), db.clone(), auth.clone(), alerts.clone());
        Self {
            config,
            db,
            auth,
            alerts,
            validator,
            aggregator,
            fetcher,
            notifier,
        }
    }

    /// Process one batch of observed scripts from a page/session.
    pub async fn report_observed_scripts(&self, req: SessionReportRequest) -> SessionReportResponse {
        match self.report_observed_scripts_inner(&req) {
            Ok(response) => response,
            Err(e) => {
                error!("Failed to process monitoring session for {}: {e}", req.page_url);
                SessionReportResponse {
                    success: false,
                    log_id: None,
                    authorized_count: 0,
                    unauthorized_count: 0,
                    unauthorized_scripts: Vec::new(),
                    error: Some("failed to process monitoring session".to_string()),
                }
            }
        }
    }

    fn report_observed_scripts_inner(
        &self,
        req: &SessionReportRequest,
    ) -> Result<SessionReportResponse, GuardError> {
        let context = SessionContext {
            session_id: req.session_id.clone(),
            user_agent: req.user_agent.clone(),
            headers: req.headers.clone(),
        };
        let outcome = self.aggregator.process_observed_scripts(
            req.store_id,
            &req.page_url,
            &req.scripts,
            CheckType::parse(&req.check_type),
            &context,
        )?;

        if !outcome.new_alerts.is_empty() {
            self.notify_unauthorized(req, &outcome)?;
        }

        Ok(SessionReportResponse {
            success: true,
            log_id: Some(outcome.log.id),
            authorized_count: outcome.log.authorized_count,
            unauthorized_count: outcome.log.unauthorized_count,
            unauthorized_scripts: outcome.log.unauthorized_scripts.clone(),
            error: None,
        })
    }

    fn notify_unauthorized(
        &self,
        req: &SessionReportRequest,
        outcome: &crate::monitor::MonitoringOutcome,
    ) -> Result<(), GuardError> {
        if !self.config.alerts.enable_notifications {
            return Ok(());
        }
        if !self.alerts.should_notify(
            req.store_id,
            AlertType::UnauthorizedScript,
            None,
            self.config.alerts.max_alert_frequency_hours,
        )? {
            return Ok(());
        }

        let tokens = BTreeMap::from([
            ("page_url".to_string(), req.page_url.clone()),
            (
                "unauthorized_count".to_string(),
                outcome.log.unauthorized_count.to_string(),
            ),
            (
                "scripts".to_string(),
                outcome.log.unauthorized_scripts.join(", "),
            ),
        ]);
        if self
            .notifier
            .send_alert(TemplateKind::UnauthorizedScripts, req.store_id, &tokens)
        {
            for alert in &outcome.new_alerts {
                let mut alert = alert.clone();
                self.alerts.mark_notified(&mut alert)?;
            }
            self.db.mark_log_alert_sent(outcome.log.id)?;
        }
        Ok(())
    }

    /// Validate a single script, optionally against a browser-supplied
    /// integrity digest.
    pub async fn validate_with_integrity(&self, req: SriValidationRequest) -> SriValidationResponse {
        match self.validate_with_integrity_inner(&req).await {
            Ok(response) => response,
            Err(e) => {
                error!("SRI validation failed for {}: {e}", req.script_url);
                SriValidationResponse {
                    success: false,
                    is_authorized: false,
                    is_valid: false,
                    generated_digest: None,
                    error: Some("validation failed".to_string()),
                }
            }
        }
    }

    async fn validate_with_integrity_inner(
        &self,
        req: &SriValidationRequest,
    ) -> Result<SriValidationResponse, GuardError> {
        if let Some(ref integrity) = req.integrity {
            if !self.config.monitoring.enable_sri_validation {
                let (is_authorized, _) = self.auth.is_authorized(&req.script_url, req.store_id)?;
                return Ok(SriValidationResponse {
                    success: true,
                    is_authorized,
                    is_valid: false,
                    generated_digest: None,
                    error: Some("SRI validation is disabled".to_string()),
                });
            }

            let result = self
                .validator
                .validate(req.store_id, &req.page_url, &req.script_url, Some(integrity))
                .await?;
            return Ok(SriValidationResponse {
                success: true,
                is_authorized: result.is_authorized,
                is_valid: result.has_valid_sri,
                generated_digest: None,
                error: result.sri.error,
            });
        }

        let (is_authorized, record) = self.auth.is_authorized(&req.script_url, req.store_id)?;

        if req.force_digest {
            // Reference digest for a script served without an integrity
            // attribute, to seed a future SRI rollout.
            let algorithm = record
                .as_ref()
                .map(|s| DigestAlgorithm::parse(&s.hash_algorithm))
                .unwrap_or_else(|| DigestAlgorithm::parse(&self.config.integrity.default_algorithm));
            let generated = self.fetcher.fetch_digest(&req.script_url, algorithm).await;
            if generated.is_none() {
                warn!("Could not generate reference digest for {}", req.script_url);
            }
            return Ok(SriValidationResponse {
                success: true,
                is_authorized,
                is_valid: false,
                generated_digest: generated,
                error: Some("no integrity attribute provided".to_string()),
            });
        }

        Ok(SriValidationResponse {
            success: true,
            is_authorized,
            is_valid: false,
            generated_digest: None,
            error: Some("no integrity attribute present".to_string()),
        })
    }

    /// Browser-side pre-block event. Always creates a critical security
    /// alert; a block is itself a strong signal, so no dedup suppression.
    pub async fn report_blocked_script(&self, req: BlockedScriptRequest) -> BlockedScriptResponse {
        match self.report_blocked_script_inner(&req) {
            Ok(alert_id) => BlockedScriptResponse {
                success: true,
                alert_id: Some(alert_id),
            },
            Err(e) => {
                error!("Failed to record blocked script {}: {e}", req.script_url);
                BlockedScriptResponse {
                    success: false,
                    alert_id: None,
                }
            }
        }
    }

    fn report_blocked_script_inner(&self, req: &BlockedScriptRequest) -> Result<i64, GuardError> {
        let alert = self.alerts.create_security_alert(
            req.store_id,
            format!("Blocked script reported: {}", req.script_url),
            Some(&req.script_url),
            Some(&req.page_url),
            &AlertDetails::BlockedScript {
                block_reason: req.block_reason.clone(),
                user_agent: req.user_agent.clone(),
            },
        )?;

        if self.config.alerts.enable_notifications {
            let tokens = BTreeMap::from([
                ("script_url".to_string(), req.script_url.clone()),
                ("page_url".to_string(), req.page_url.clone()),
                ("block_reason".to_string(), req.block_reason.clone()),
            ]);
            if self
                .notifier
                .send_alert(TemplateKind::BlockedScript, req.store_id, &tokens)
            {
                let mut alert = alert.clone();
                self.alerts.mark_notified(&mut alert)?;
            }
        }
        Ok(alert.id)
    }

    /// Content-Security-Policy violation reported by the browser.
    pub async fn report_csp_violation(&self, req: CspViolationRequest) -> CspViolationResponse {
        match self.report_csp_violation_inner(&req) {
            Ok(alert_id) => CspViolationResponse {
                success: true,
                alert_id,
            },
            Err(e) => {
                error!("Failed to record CSP violation on {}: {e}", req.page_url);
                CspViolationResponse {
                    success: false,
                    alert_id: None,
                }
            }
        }
    }

    fn report_csp_violation_inner(
        &self,
        req: &CspViolationRequest,
    ) -> Result<Option<i64>, GuardError> {
        warn!(
            "CSP violation reported on {}: {} violated {}",
            req.page_url,
            req.violation.blocked_uri.as_deref().unwrap_or("-"),
            req.violation.violated_directive.as_deref().unwrap_or("-"),
        );

        let alert = self.alerts.maybe_create_alert(
            req.store_id,
            AlertType::CspViolation,
            None,
            format!("Content Security Policy violation on {}", req.page_url),
            None,
            Some(&req.page_url),
            &AlertDetails::CspViolation {
                blocked_uri: req.violation.blocked_uri.clone(),
                violated_directive: req.violation.violated_directive.clone(),
                effective_directive: req.violation.effective_directive.clone(),
                source_file: req.violation.source_file.clone(),
                line_number: req.violation.line_number,
                user_agent: req.user_agent.clone(),
            },
        )?;

        let Some(mut alert) = alert else {
            return Ok(None);
        };

        if self.config.alerts.enable_notifications
            && self.alerts.should_notify(
                req.store_id,
                AlertType::CspViolation,
                None,
                self.config.alerts.max_alert_frequency_hours,
            )?
        {
            let tokens = BTreeMap::from([
                ("page_url".to_string(), req.page_url.clone()),
                (
                    "blocked_uri".to_string(),
                    req.violation.blocked_uri.clone().unwrap_or_default(),
                ),
            ]);
            if self
                .notifier
                .send_alert(TemplateKind::CspViolation, req.store_id, &tokens)
            {
                self.alerts.mark_notified(&mut alert)?;
            }
        }
        Ok(Some(alert.id))
    }

    pub fn db(&self) -> &SharedDatabase {
        &self.db
    }

    pub fn notifier(&self) -> &dyn Notify {
        self.notifier.as_ref()
    }

    pub fn aggregator(&self) -> &SessionAggregator {
        &self.aggregator
    }
}
