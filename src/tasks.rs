use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::Config;
use crate::core::{AlertDetails, AlertType, GuardError};
use crate::guard::GuardService;
use crate::notify::{Notify, TemplateKind};
use crate::sri::{self, DigestAlgorithm, DigestFetcher};

/// Re-verify active scripts whose last verification is older than the
/// configured expiry window. Per-script failures are isolated; a dead CDN
/// must not abort the rest of the sweep.
pub async fn verify_expired_scripts<F: DigestFetcher>(
    service: &GuardService<F>,
    fetcher: &F,
    config: &Config,
    store_id: i64,
) -> Result<usize, GuardError> {
    let expired = service
        .auth
        .expired_since(config.retention.verification_expiry_days, store_id)?;
    if expired.is_empty() {
        return Ok(0);
    }

    warn!(
        "Found {} expired script verifications for store {store_id}",
        expired.len()
    );

    for script in &expired {
        let algorithm = DigestAlgorithm::parse(&script.hash_algorithm);
        let fresh = fetcher.fetch_digest(&script.script_url, algorithm).await;
        match (fresh, script.script_hash.as_deref()) {
            (Some(fresh), Some(stored)) if sri::digests_match(&fresh, stored) => {
                service.auth.mark_verified(script.id)?;
            }
            (Some(fresh), Some(stored)) => {
                service.alerts.maybe_create_alert(
                    store_id,
                    AlertType::IntegrityFailure,
                    None,
                    format!(
                        "Script content changed since last verification: {}",
                        script.script_url
                    ),
                    Some(&script.script_url),
                    None,
                    &AlertDetails::ContentChanged {
                        script_id: script.id,
                        stored_digest: stored.to_string(),
                        browser_digest: String::new(),
                        content_digest: Some(fresh),
                    },
                )?;
            }
            (Some(fresh), None) => {
                // A digest can only be established automatically for
                // trusted domains; everything else stays operator-driven.
                if config.trust.allow_auto_update
                    && sri::is_trusted_domain(&script.script_url, &config.trust)
                {
                    service.auth.adopt_digest(script.id, &fresh)?;
                    info!("Established digest for trusted script: {}", script.script_url);
                } else {
                    warn!("Script still has no stored digest: {}", script.script_url);
                }
            }
            (None, _) => {
                warn!(
                    "Could not re-verify {}: content digest unavailable",
                    script.script_url
                );
            }
        }
    }

    if config.alerts.enable_notifications {
        let urls: Vec<&str> = expired.iter().map(|s| s.script_url.as_str()).collect();
        let tokens = BTreeMap::from([
            ("expired_count".to_string(), expired.len().to_string()),
            ("scripts".to_string(), urls.join(", ")),
        ]);
        service
            .notifier()
            .send_alert(TemplateKind::ExpiredScripts, store_id, &tokens);
    }

    Ok(expired.len())
}

/// Delete monitoring logs and resolved alerts past their retention windows.
pub fn run_retention_sweep<F: DigestFetcher>(
    service: &GuardService<F>,
    config: &Config,
) -> Result<(usize, usize), GuardError> {
    let log_cutoff = Utc::now() - chrono::Duration::days(config.retention.log_retention_days as i64);
    let alert_cutoff =
        Utc::now() - chrono::Duration::days(config.retention.alert_retention_days as i64);

    let logs_deleted = service.db().delete_logs_before(log_cutoff)?;
    let alerts_deleted = service.db().delete_resolved_alerts_before(alert_cutoff)?;

    if logs_deleted > 0 || alerts_deleted > 0 {
        info!("Retention sweep removed {logs_deleted} logs and {alerts_deleted} resolved alerts");
    }
    Ok((logs_deleted, alerts_deleted))
}

/// One maintenance pass over every configured store.
pub async fn run_maintenance<F: DigestFetcher>(
    service: &Arc<GuardService<F>>,
    fetcher: &F,
    config: &Config,
) {
    for store_id in config.store_ids() {
        if let Err(e) = verify_expired_scripts(service, fetcher, config, store_id).await {
            warn!("Expired-script verification failed for store {store_id}: {e}");
        }
    }
    if let Err(e) = run_retention_sweep(service, config) {
        warn!("Retention sweep failed: {e}");
    }
}
