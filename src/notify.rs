use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::AlertConfig;

/// Notification template families, one per alert scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    UnauthorizedScripts,
    ComplianceReport,
    ScriptChange,
    CspViolation,
    ExpiredScripts,
    BlockedScript,
}

impl TemplateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateKind::UnauthorizedScripts => "unauthorized-scripts",
            TemplateKind::ComplianceReport => "compliance-report",
            TemplateKind::ScriptChange => "script-change",
            TemplateKind::CspViolation => "csp-violation",
            TemplateKind::ExpiredScripts => "expired-scripts",
            TemplateKind::BlockedScript => "blocked-script",
        }
    }

    fn title(&self) -> &'static str {
        match self {
            TemplateKind::UnauthorizedScripts => "Unauthorized scripts detected",
            TemplateKind::ComplianceReport => "Compliance report",
            TemplateKind::ScriptChange => "Script content changed",
            TemplateKind::CspViolation => "CSP violation reported",
            TemplateKind::ExpiredScripts => "Script verifications expired",
            TemplateKind::BlockedScript => "Script blocked on payment page",
        }
    }
}

/// Outbound notification collaborator. Delivery transport is external;
/// implementations receive a template kind plus token substitutions and
/// report whether a message was dispatched.
pub trait Notify: Send + Sync {
    fn send_alert(&self, kind: TemplateKind, store_id: i64, tokens: &BTreeMap<String, String>)
    -> bool;
}

/// Desktop notification sender with cooldown to prevent spam.
pub struct DesktopNotifier {
    enabled: bool,
    cooldown: Duration,
    last_sent: Mutex<Option<Instant>>,
}

impl DesktopNotifier {
    pub fn new(config: &AlertConfig) -> Self {
        Self {
            enabled: config.enable_notifications,
            cooldown: Duration::from_secs(config.notification_cooldown_seconds),
            last_sent: Mutex::new(None),
        }
    }

    /// Check and update cooldown. Returns true if enough time has passed.
    fn check_cooldown(&self) -> bool {
        let mut last = self.last_sent.lock().unwrap();
        let now = Instant::now();
        if let Some(prev) = *last {
            if now.duration_since(prev) < self.cooldown {
                return false;
            }
        }
        *last = Some(now);
        true
    }
}

impl Notify for DesktopNotifier {
    fn send_alert(
        &self,
        kind: TemplateKind,
        store_id: i64,
        tokens: &BTreeMap<String, String>,
    ) -> bool {
        if !self.enabled {
            return false;
        }
        if !self.check_cooldown() {
            return false;
        }

        let title = format!("scriptguard — {}", kind.title());
        let mut body = format!("store {store_id}");
        for (key, value) in tokens {
            body.push_str(&format!(" | {key}: {value}"));
        }

        // Fire-and-forget in a background thread to never block a monitoring pass
        std::thread::spawn(move || {
            if let Err(e) = notify_rust::Notification::new()
                .summary(&title)
                .body(&body)
                .show()
            {
                tracing::debug!("Desktop notification failed: {e}");
            }
        });
        true
    }
}

/// No-op notifier for tests and headless deployments.
pub struct NullNotifier;

impl Notify for NullNotifier {
    fn send_alert(&self, _: TemplateKind, _: i64, _: &BTreeMap<String, String>) -> bool {
        false
    }
}
