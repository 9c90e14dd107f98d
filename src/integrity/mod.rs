use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::alerts::AlertEngine;
use crate::auth::AuthorizedScripts;
use crate::config::Config;
use crate::core::{
    AlertDetails, AlertLevel, AlertType, AuthorizedScript, GuardError, ScriptSource, SriOutcome,
    ScriptValidationResult,
};
use crate::notify::{Notify, TemplateKind};
use crate::sri::{self, DigestAlgorithm, DigestFetcher};

/// Decides, for an observed script plus an optional browser-supplied digest,
/// whether the script content is cryptographically unchanged, and which
/// remediation follows. Unauthorized URLs short-circuit before any digest
/// work; alerting for those is the session aggregator's job.
pub struct IntegrityValidator<F: DigestFetcher> {
    config: Arc<Config>,
    auth: Arc<AuthorizedScripts>,
    alerts: Arc<AlertEngine>,
    fetcher: Arc<F>,
    notifier: Arc<dyn Notify>,
}

impl<F: DigestFetcher> IntegrityValidator<F> {
    pub fn new(
        config: Arc<Config>,
        auth: Arc<AuthorizedScripts>,
        alerts: Arc<AlertEngine>,
        fetcher: Arc<F>,
        notifier: Arc<dyn Notify>,
    ) -> Self {
        Self {
            config,
            auth,
            alerts,
            fetcher,
            notifier,
        }
    }

    pub async fn validate(
        &self,
        store_id: i64,
        page_url: &str,
        script_url: &str,
        browser_digest: Option<&str>,
    ) -> Result<ScriptValidationResult, GuardError> {
        let (authorized, record) = self.auth.is_authorized(script_url, store_id)?;
        let Some(script) = record.filter(|_| authorized) else {
            return Ok(ScriptValidationResult::unauthorized(script_url));
        };

        match (script.script_hash.clone(), browser_digest) {
            (None, None) => self.no_integrity_anywhere(&script, page_url),
            (None, Some(digest)) => self.missing_stored_digest(&script, digest, page_url),
            (Some(stored), None) => self.missing_browser_digest(&script, &stored, page_url),
            (Some(stored), Some(digest)) => {
                if sri::digests_match(&stored, digest) {
                    self.auth.mark_verified(script.id)?;
                    info!("SRI validation passed: {}", script.script_url);
                    Ok(ScriptValidationResult {
                        script_url: script.script_url.clone(),
                        is_authorized: true,
                        has_valid_sri: true,
                        sri: SriOutcome::valid(digest, &stored),
                    })
                } else {
                    self.digest_mismatch(&script, &stored, digest, page_url).await
                }
            }
        }
    }

    /// Integrity expected for trusted-domain and payment-classified scripts.
    fn requires_integrity(&self, script: &AuthorizedScript) -> bool {
        script.source == ScriptSource::PaymentGateway
            || sri::is_trusted_domain(&script.script_url, &self.config.trust)
            || sri::is_payment_provider(&script.script_url, &self.config.trust)
    }

    /// Neither a stored digest nor a browser-supplied one: nothing enforced.
    fn no_integrity_anywhere(
        &self,
        script: &AuthorizedScript,
        page_url: &str,
    ) -> Result<ScriptValidationResult, GuardError> {
        if self.requires_integrity(script) {
            self.alerts.maybe_create_alert(
                script.store_id,
                AlertType::IntegrityFailure,
                None,
                format!("Missing SRI in browser for script: {}", script.script_url),
                Some(&script.script_url),
                Some(page_url),
                &AlertDetails::MissingSri {
                    script_id: script.id,
                    expected_digest: None,
                },
            )?;
        }

        Ok(ScriptValidationResult {
            script_url: script.script_url.clone(),
            is_authorized: true,
            has_valid_sri: false,
            sri: SriOutcome::invalid("no integrity attribute present in browser"),
        })
    }

    /// Authorized script without a stored digest, but the browser supplied
    /// one. Trusted domains may adopt it; everything else needs an operator.
    fn missing_stored_digest(
        &self,
        script: &AuthorizedScript,
        browser_digest: &str,
        page_url: &str,
    ) -> Result<ScriptValidationResult, GuardError> {
        let trusted = sri::is_trusted_domain(&script.script_url, &self.config.trust);

        if trusted && self.config.trust.allow_auto_update {
            self.auth.adopt_digest(script.id, browser_digest)?;
            info!("Auto-adopted digest for trusted script: {}", script.script_url);
            self.alerts.maybe_create_alert(
                script.store_id,
                AlertType::IntegrityFailure,
                Some(AlertLevel::Info),
                format!("Script digest auto-updated: {}", script.script_url),
                Some(&script.script_url),
                Some(page_url),
                &AlertDetails::DigestAutoUpdated {
                    script_id: script.id,
                    old_digest: None,
                    new_digest: browser_digest.to_string(),
                },
            )?;

            return Ok(ScriptValidationResult {
                script_url: script.script_url.clone(),
                is_authorized: true,
                has_valid_sri: true,
                sri: SriOutcome::valid(browser_digest, browser_digest),
            });
        }

        self.alerts.maybe_create_alert(
            script.store_id,
            AlertType::IntegrityFailure,
            None,
            format!("Authorized script has no stored digest: {}", script.script_url),
            Some(&script.script_url),
            Some(page_url),
            &AlertDetails::DigestMissing {
                script_id: script.id,
                browser_digest: browser_digest.to_string(),
            },
        )?;

        let mut sri = SriOutcome::invalid(
            "authorized script has no stored digest - manual update required",
        );
        sri.current_digest = Some(browser_digest.to_string());
        Ok(ScriptValidationResult {
            script_url: script.script_url.clone(),
            is_authorized: true,
            has_valid_sri: false,
            sri,
        })
    }

    /// A stored digest exists, so integrity was previously established, yet
    /// the browser supplied none.
    fn missing_browser_digest(
        &self,
        script: &AuthorizedScript,
        stored: &str,
        page_url: &str,
    ) -> Result<ScriptValidationResult, GuardError> {
        warn!(
            "Missing SRI in browser for script that should have it: {}",
            script.script_url
        );
        self.alerts.maybe_create_alert(
            script.store_id,
            AlertType::IntegrityFailure,
            None,
            format!(
                "Browser provided no integrity though one is expected: {}",
                script.script_url
            ),
            Some(&script.script_url),
            Some(page_url),
            &AlertDetails::MissingSri {
                script_id: script.id,
                expected_digest: Some(stored.to_string()),
            },
        )?;

        let mut sri = SriOutcome::invalid(
            "script should have integrity attribute but browser provided none",
        );
        sri.expected_digest = Some(stored.to_string());
        Ok(ScriptValidationResult {
            script_url: script.script_url.clone(),
            is_authorized: true,
            has_valid_sri: false,
            sri,
        })
    }

    /// Browser digest differs from the stored one. Escalate by re-fetching
    /// the script independently: a confirmed content change is critical; an
    /// unchanged body makes the mismatch environmental/suspicious.
    async fn digest_mismatch(
        &self,
        script: &AuthorizedScript,
        stored: &str,
        browser_digest: &str,
        page_url: &str,
    ) -> Result<ScriptValidationResult, GuardError> {
        warn!(
            "SRI digest mismatch - script: {}, stored: {stored}, browser: {browser_digest}",
            script.script_url
        );

        let algorithm = DigestAlgorithm::parse(&script.hash_algorithm);
        let fresh = self.fetcher.fetch_digest(&script.script_url, algorithm).await;

        let sri_error = match fresh {
            Some(ref content_digest) if !sri::digests_match(content_digest, stored) => {
                error!("Script content changed: {}", script.script_url);
                let alert = self.alerts.maybe_create_alert(
                    script.store_id,
                    AlertType::IntegrityFailure,
                    None,
                    format!(
                        "Script content changed, re-authorization required: {}",
                        script.script_url
                    ),
                    Some(&script.script_url),
                    Some(page_url),
                    &AlertDetails::ContentChanged {
                        script_id: script.id,
                        stored_digest: stored.to_string(),
                        browser_digest: browser_digest.to_string(),
                        content_digest: Some(content_digest.clone()),
                    },
                )?;
                if let Some(mut alert) = alert {
                    self.dispatch_change_notification(script, &mut alert)?;
                }
                "script content changed - needs re-authorization".to_string()
            }
            Some(_) => {
                warn!("Suspicious digest mismatch: {}", script.script_url);
                self.alerts.maybe_create_alert(
                    script.store_id,
                    AlertType::IntegrityFailure,
                    Some(AlertLevel::Warning),
                    format!("Suspicious digest mismatch: {}", script.script_url),
                    Some(&script.script_url),
                    Some(page_url),
                    &AlertDetails::SuspiciousMismatch {
                        script_id: script.id,
                        stored_digest: stored.to_string(),
                        browser_digest: browser_digest.to_string(),
                    },
                )?;
                "browser digest differs from stored digest but content appears unchanged"
                    .to_string()
            }
            None => {
                // Re-fetch failed: the verdict is inconclusive, not critical.
                warn!(
                    "Digest mismatch with unavailable content digest: {}",
                    script.script_url
                );
                self.alerts.maybe_create_alert(
                    script.store_id,
                    AlertType::IntegrityFailure,
                    Some(AlertLevel::Warning),
                    format!("Digest mismatch, content digest unavailable: {}", script.script_url),
                    Some(&script.script_url),
                    Some(page_url),
                    &AlertDetails::ContentChanged {
                        script_id: script.id,
                        stored_digest: stored.to_string(),
                        browser_digest: browser_digest.to_string(),
                        content_digest: None,
                    },
                )?;
                "digest mismatch - current content digest unavailable".to_string()
            }
        };

        Ok(ScriptValidationResult {
            script_url: script.script_url.clone(),
            is_authorized: true,
            has_valid_sri: false,
            sri: SriOutcome {
                is_valid: false,
                current_digest: Some(browser_digest.to_string()),
                expected_digest: Some(stored.to_string()),
                error: Some(sri_error),
            },
        })
    }

    fn dispatch_change_notification(
        &self,
        script: &AuthorizedScript,
        alert: &mut crate::core::ComplianceAlert,
    ) -> Result<(), GuardError> {
        if !self.config.alerts.enable_notifications {
            return Ok(());
        }
        if !self.alerts.should_notify(
            script.store_id,
            AlertType::IntegrityFailure,
            Some(&script.script_url),
            self.config.alerts.max_alert_frequency_hours,
        )? {
            return Ok(());
        }

        let tokens = BTreeMap::from([
            ("script_url".to_string(), script.script_url.clone()),
            ("domain".to_string(), script.domain.clone()),
        ]);
        if self
            .notifier
            .send_alert(TemplateKind::ScriptChange, script.store_id, &tokens)
        {
            self.alerts.mark_notified(alert)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::db::tests::{open_temp_db, sample_script};
    use crate::db::{AlertFilter, SharedDatabase};
    use crate::notify::NullNotifier;

    struct StubFetcher {
        digests: Mutex<HashMap<String, String>>,
        calls: AtomicUsize,
    }

    impl StubFetcher {
        fn new() -> Self {
            Self {
                digests: Mutex::new(HashMap::new()),
                calls: AtomicUsize::new(0),
            }
        }

        fn set(&self, url: &str, digest: &str) {
            self.digests
                .lock()
                .unwrap()
                .insert(url.to_string(), digest.to_string());
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl DigestFetcher for StubFetcher {
        async fn fetch_digest(&self, url: &str, _algorithm: DigestAlgorithm) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.digests.lock().unwrap().get(url).cloned()
        }
    }

    struct CountingNotifier {
        sent: Mutex<Vec<TemplateKind>>,
    }

    impl Notify for CountingNotifier {
        fn send_alert(&self, kind: TemplateKind, _: i64, _: &BTreeMap<String, String>) -> bool {
            self.sent.lock().unwrap().push(kind);
            true
        }
    }

    struct Harness {
        validator: IntegrityValidator<StubFetcher>,
        auth: Arc<AuthorizedScripts>,
        db: SharedDatabase,
        fetcher: Arc<StubFetcher>,
        notifier: Arc<CountingNotifier>,
    }

    fn harness(trusted_domains: Vec<String>) -> Harness {
        let db = open_temp_db();
        let mut config = Config::default();
        config.trust.trusted_domains = trusted_domains;
        let config = Arc::new(config);

        let auth = Arc::new(AuthorizedScripts::new(db.clone(), Duration::from_secs(60)));
        let alerts = Arc::new(AlertEngine::new(db.clone(), config.dedup_window()));
        let fetcher = Arc::new(StubFetcher::new());
        let notifier = Arc::new(CountingNotifier {
            sent: Mutex::new(Vec::new()),
        });
        let validator = IntegrityValidator::new(
            config,
            auth.clone(),
            alerts,
            fetcher.clone(),
            notifier.clone(),
        );
        Harness {
            validator,
            auth,
            db,
            fetcher,
            notifier,
        }
    }

    fn alerts_for(db: &SharedDatabase, store_id: i64) -> Vec<crate::core::ComplianceAlert> {
        db.list_alerts(&AlertFilter {
            store_id: Some(store_id),
            ..Default::default()
        })
        .unwrap()
    }

    const URL: &str = "https://cdn.example.com/lib.js";

    fn insert(harness: &Harness, hash: Option<&str>) -> i64 {
        let mut script = sample_script(URL, 1);
        script.script_hash = hash.map(str::to_string);
        harness.auth.insert(&mut script).unwrap();
        script.id
    }

    #[tokio::test]
    async fn unauthorized_short_circuits_without_digest_work() {
        let h = harness(vec![]);
        let result = h
            .validator
            .validate(1, "https://mystore.com/checkout", URL, Some("not-a-digest"))
            .await
            .unwrap();
        assert!(!result.is_authorized);
        assert!(!result.has_valid_sri);
        assert_eq!(h.fetcher.call_count(), 0);
        assert!(alerts_for(&h.db, 1).is_empty());
    }

    #[tokio::test]
    async fn inactive_record_short_circuits() {
        let h = harness(vec![]);
        let mut script = sample_script(URL, 1);
        script.is_active = false;
        h.auth.insert(&mut script).unwrap();

        let result = h
            .validator
            .validate(1, "https://mystore.com/checkout", URL, Some("sha384-ABC"))
            .await
            .unwrap();
        assert!(!result.is_authorized);
    }

    #[tokio::test]
    async fn no_digest_anywhere_is_invalid_without_alert() {
        let h = harness(vec![]);
        insert(&h, None);

        let result = h
            .validator
            .validate(1, "https://mystore.com/checkout", URL, None)
            .await
            .unwrap();
        assert!(result.is_authorized);
        assert!(!result.has_valid_sri);
        // Plain third-party script, integrity not required: no alert
        assert!(alerts_for(&h.db, 1).is_empty());
    }

    #[tokio::test]
    async fn no_digest_anywhere_alerts_when_integrity_required() {
        let h = harness(vec!["cdn.example.com".to_string()]);
        insert(&h, None);

        let result = h
            .validator
            .validate(1, "https://mystore.com/checkout", URL, None)
            .await
            .unwrap();
        assert!(!result.has_valid_sri);
        let alerts = alerts_for(&h.db, 1);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::IntegrityFailure);
        assert!(alerts[0].details.contains("missing-sri"));
    }

    #[tokio::test]
    async fn trusted_domain_auto_adopts_browser_digest() {
        let h = harness(vec!["cdn.example.com".to_string()]);
        let id = insert(&h, None);

        let result = h
            .validator
            .validate(1, "https://mystore.com/checkout", URL, Some("sha384-XYZ"))
            .await
            .unwrap();
        assert!(result.is_authorized);
        assert!(result.has_valid_sri);

        let stored = h.auth.get(id).unwrap().unwrap();
        assert_eq!(stored.script_hash.as_deref(), Some("sha384-XYZ"));

        let alerts = alerts_for(&h.db, 1);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_level, AlertLevel::Info);
        assert!(alerts[0].details.contains("digest-auto-updated"));
    }

    #[tokio::test]
    async fn auto_adoption_disabled_requires_manual_update() {
        let db = open_temp_db();
        let mut config = Config::default();
        config.trust.trusted_domains = vec!["cdn.example.com".to_string()];
        config.trust.allow_auto_update = false;
        let config = Arc::new(config);
        let auth = Arc::new(AuthorizedScripts::new(db.clone(), Duration::from_secs(60)));
        let alerts = Arc::new(AlertEngine::new(db.clone(), config.dedup_window()));
        let validator = IntegrityValidator::new(
            config,
            auth.clone(),
            alerts,
            Arc::new(StubFetcher::new()),
            Arc::new(NullNotifier),
        );

        let mut script = sample_script(URL, 1);
        auth.insert(&mut script).unwrap();

        let result = validator
            .validate(1, "https://mystore.com/checkout", URL, Some("sha384-XYZ"))
            .await
            .unwrap();
        assert!(!result.has_valid_sri);
        assert!(auth.get(script.id).unwrap().unwrap().script_hash.is_none());
    }

    #[tokio::test]
    async fn untrusted_missing_stored_digest_requires_manual_update() {
        let h = harness(vec![]);
        let id = insert(&h, None);

        let result = h
            .validator
            .validate(1, "https://mystore.com/checkout", URL, Some("sha384-XYZ"))
            .await
            .unwrap();
        assert!(result.is_authorized);
        assert!(!result.has_valid_sri);
        assert!(h.auth.get(id).unwrap().unwrap().script_hash.is_none());

        let alerts = alerts_for(&h.db, 1);
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].details.contains("digest-missing"));
    }

    #[tokio::test]
    async fn stored_digest_but_no_browser_digest_alerts() {
        let h = harness(vec![]);
        insert(&h, Some("sha384-ABC"));

        let result = h
            .validator
            .validate(1, "https://mystore.com/checkout", URL, None)
            .await
            .unwrap();
        assert!(result.is_authorized);
        assert!(!result.has_valid_sri);
        assert_eq!(result.sri.expected_digest.as_deref(), Some("sha384-ABC"));

        let alerts = alerts_for(&h.db, 1);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::IntegrityFailure);
        assert!(alerts[0].details.contains("missing-sri"));
    }

    #[tokio::test]
    async fn matching_digests_case_insensitive_no_alert() {
        let h = harness(vec![]);
        let id = insert(&h, Some("sha384-ABC"));
        let before = h.auth.get(id).unwrap().unwrap().last_verified;

        let result = h
            .validator
            .validate(1, "https://mystore.com/checkout", URL, Some("sha384-abc"))
            .await
            .unwrap();
        assert!(result.is_authorized);
        assert!(result.has_valid_sri);
        assert!(result.sri.error.is_none());
        assert!(alerts_for(&h.db, 1).is_empty());
        assert_eq!(h.fetcher.call_count(), 0);

        let after = h.auth.get(id).unwrap().unwrap().last_verified;
        assert!(after >= before);
    }

    #[tokio::test]
    async fn confirmed_content_change_is_critical_and_notifies() {
        let h = harness(vec![]);
        insert(&h, Some("sha384-OLD"));
        h.fetcher.set(URL, "sha384-NEW");

        let result = h
            .validator
            .validate(1, "https://mystore.com/checkout", URL, Some("sha384-NEW"))
            .await
            .unwrap();
        assert!(!result.has_valid_sri);
        assert_eq!(h.fetcher.call_count(), 1);

        let alerts = alerts_for(&h.db, 1);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_level, AlertLevel::Critical);
        assert!(alerts[0].details.contains("content-changed"));
        assert!(alerts[0].notified);

        let sent = h.notifier.sent.lock().unwrap();
        assert_eq!(sent.as_slice(), &[TemplateKind::ScriptChange]);
    }

    #[tokio::test]
    async fn unchanged_content_mismatch_is_suspicious_warning() {
        let h = harness(vec![]);
        insert(&h, Some("sha384-ABC"));
        h.fetcher.set(URL, "sha384-abc");

        let result = h
            .validator
            .validate(1, "https://mystore.com/checkout", URL, Some("sha384-TAMPERED"))
            .await
            .unwrap();
        assert!(!result.has_valid_sri);

        let alerts = alerts_for(&h.db, 1);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_level, AlertLevel::Warning);
        assert!(alerts[0].details.contains("suspicious-mismatch"));
        assert!(h.notifier.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unavailable_refetch_downgrades_to_inconclusive() {
        let h = harness(vec![]);
        insert(&h, Some("sha384-ABC"));
        // No stub digest configured: the re-fetch yields None

        let result = h
            .validator
            .validate(1, "https://mystore.com/checkout", URL, Some("sha384-OTHER"))
            .await
            .unwrap();
        assert!(!result.has_valid_sri);

        let alerts = alerts_for(&h.db, 1);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_level, AlertLevel::Warning);
        assert!(alerts[0].details.contains("content-changed"));
        assert!(alerts[0].details.contains("\"content_digest\":null"));
    }

    #[tokio::test]
    async fn repeated_mismatch_alert_is_deduplicated() {
        let h = harness(vec![]);
        insert(&h, Some("sha384-OLD"));
        h.fetcher.set(URL, "sha384-NEW");

        for _ in 0..3 {
            h.validator
                .validate(1, "https://mystore.com/checkout", URL, Some("sha384-NEW"))
                .await
                .unwrap();
        }
        assert_eq!(alerts_for(&h.db, 1).len(), 1);
    }
}
